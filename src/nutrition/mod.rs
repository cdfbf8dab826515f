mod dto;
pub mod goals;
pub mod handlers;
pub mod model;
pub mod report;
pub mod service;
pub mod store;

use crate::state::AppState;
use axum::Router;

pub use service::{NutritionError, NutritionService};

pub fn router() -> Router<AppState> {
    handlers::routes()
}
