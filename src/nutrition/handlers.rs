use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use super::dto::{HistoryQuery, LogMealRequest, MacroInput, MealLoggedResponse, UpdateMealRequest};
use super::goals::{NutritionGoal, Progress};
use super::model::DailyAggregate;
use super::report::HistoryReport;
use super::service::TodayView;
use crate::{
    auth::AuthUser,
    error::AppError,
    extract::{AppJson, AppPath},
    state::AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nutrition/meals", post(log_meal))
        .route("/nutrition/meals/:id", put(update_meal).delete(delete_meal))
        .route("/nutrition/today", get(get_today))
        .route("/nutrition/today/recalculate", post(recalculate_today))
        .route("/nutrition/history", get(get_history))
        .route("/nutrition/goal", get(get_goal).put(set_goal))
        .route("/nutrition/progress", get(get_progress))
}

#[instrument(skip(state, body))]
pub async fn log_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    AppJson(body): AppJson<LogMealRequest>,
) -> Result<(StatusCode, HeaderMap, Json<MealLoggedResponse>), AppError> {
    let (meal_id, day) = state
        .nutrition
        .log_meal(user_id, &body.name, body.macros.to_macros(), body.time_eaten)
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&format!("/api/v1/nutrition/meals/{meal_id}")) {
        headers.insert(header::LOCATION, location);
    }
    Ok((
        StatusCode::CREATED,
        headers,
        Json(MealLoggedResponse { meal_id, day }),
    ))
}

#[instrument(skip(state, body))]
pub async fn update_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    AppPath(id): AppPath<Uuid>,
    AppJson(body): AppJson<UpdateMealRequest>,
) -> Result<Json<DailyAggregate>, AppError> {
    let day = state
        .nutrition
        .update_meal(user_id, id, &body.name, body.macros.to_macros())
        .await?;
    Ok(Json(day))
}

#[instrument(skip(state))]
pub async fn delete_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    AppPath(id): AppPath<Uuid>,
) -> Result<Json<DailyAggregate>, AppError> {
    Ok(Json(state.nutrition.delete_meal(user_id, id).await?))
}

#[instrument(skip(state))]
pub async fn get_today(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<TodayView>, AppError> {
    Ok(Json(state.nutrition.today(user_id).await?))
}

#[instrument(skip(state))]
pub async fn recalculate_today(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<TodayView>, AppError> {
    Ok(Json(state.nutrition.recalculate_today(user_id).await?))
}

#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryReport>, AppError> {
    let report = state
        .nutrition
        .history_report(user_id, q.days.as_deref())
        .await?;
    Ok(Json(report))
}

#[instrument(skip(state))]
pub async fn get_goal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<NutritionGoal>, AppError> {
    Ok(Json(state.nutrition.goal(user_id).await?))
}

#[instrument(skip(state, body))]
pub async fn set_goal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    AppJson(body): AppJson<MacroInput>,
) -> Result<Json<NutritionGoal>, AppError> {
    Ok(Json(state.nutrition.set_goal(user_id, body.to_macros()).await?))
}

#[instrument(skip(state))]
pub async fn get_progress(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Progress>, AppError> {
    Ok(Json(state.nutrition.progress(user_id).await?))
}
