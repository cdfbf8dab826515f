use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::goals::{self, GoalStore, NutritionGoal, Progress};
use super::model::{day_of, iso_date, DailyAggregate, HistoryWindow, Macros, MealEntry};
use super::report::{self, HistoryReport};
use super::store::{AggregateStore, StorageError};
use crate::config::HistoryConfig;

const UNTITLED_MEAL: &str = "Untitled meal";

#[derive(Debug, Error)]
pub enum NutritionError {
    #[error("{0}")]
    Validation(String),
    #[error("meal {0} not found in today's log")]
    MealNotFound(Uuid),
    #[error("no nutrition goal set")]
    GoalNotSet,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Today's meals (latest first) and totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodayView {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub meals: Vec<MealEntry>,
    pub totals: Macros,
}

impl TodayView {
    fn empty(date: Date) -> Self {
        Self {
            date,
            meals: Vec::new(),
            totals: Macros::zero(),
        }
    }

    fn from_aggregate(day: &DailyAggregate) -> Self {
        Self {
            date: day.date,
            meals: day.meals_latest_first(),
            totals: day.totals,
        }
    }
}

/// Keeps each user's daily aggregate consistent as meals are logged, edited
/// and removed, and answers today/history queries.
#[derive(Clone)]
pub struct NutritionService {
    store: Arc<dyn AggregateStore>,
    goals: Arc<dyn GoalStore>,
    history: HistoryConfig,
    clock: Arc<dyn Clock>,
}

impl NutritionService {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        goals: Arc<dyn GoalStore>,
        history: HistoryConfig,
    ) -> Self {
        Self::with_clock(store, goals, history, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn AggregateStore>,
        goals: Arc<dyn GoalStore>,
        history: HistoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            goals,
            history,
            clock,
        }
    }

    /// Appends a meal to today's aggregate, creating it if needed, and
    /// returns the new meal's id with the updated day.
    /// `time_eaten` defaults to now and only affects display order.
    pub async fn log_meal(
        &self,
        user_id: Uuid,
        name: &str,
        macros: Macros,
        time_eaten: Option<OffsetDateTime>,
    ) -> Result<(Uuid, DailyAggregate), NutritionError> {
        let now = self.clock.now();
        let today = day_of(now);
        let entry = MealEntry::new(meal_name(name), macros, time_eaten.unwrap_or(now));
        let meal_id = entry.id;
        if macros.is_zero() {
            debug!(%user_id, %meal_id, "meal logged without macros");
        }

        let day = self.store.append_meal(user_id, today, entry, now).await?;
        info!(%user_id, %meal_id, date = %today, meals = day.meals.len(), "meal logged");
        Ok((meal_id, day))
    }

    /// Only meals in today's aggregate can be edited.
    pub async fn update_meal(
        &self,
        user_id: Uuid,
        meal_id: Uuid,
        name: &str,
        macros: Macros,
    ) -> Result<DailyAggregate, NutritionError> {
        let now = self.clock.now();
        let today = day_of(now);
        let day = self
            .store
            .replace_meal(user_id, today, meal_id, meal_name(name), macros, now)
            .await?
            .ok_or_else(|| {
                warn!(%user_id, %meal_id, "update of meal outside today's log");
                NutritionError::MealNotFound(meal_id)
            })?;
        info!(%user_id, %meal_id, date = %today, "meal updated");
        Ok(day)
    }

    /// Only meals in today's aggregate can be deleted.
    pub async fn delete_meal(
        &self,
        user_id: Uuid,
        meal_id: Uuid,
    ) -> Result<DailyAggregate, NutritionError> {
        let now = self.clock.now();
        let today = day_of(now);
        let day = self
            .store
            .remove_meal(user_id, today, meal_id, now)
            .await?
            .ok_or_else(|| {
                warn!(%user_id, %meal_id, "delete of meal outside today's log");
                NutritionError::MealNotFound(meal_id)
            })?;
        info!(%user_id, %meal_id, date = %today, "meal deleted");
        Ok(day)
    }

    /// Never fails for a user with nothing logged; returns zero totals.
    pub async fn today(&self, user_id: Uuid) -> Result<TodayView, NutritionError> {
        let today = day_of(self.clock.now());
        let view = match self.store.find(user_id, today).await? {
            Some(day) => TodayView::from_aggregate(&day),
            None => TodayView::empty(today),
        };
        Ok(view)
    }

    /// Rebuilds today's totals from its meals.
    pub async fn recalculate_today(&self, user_id: Uuid) -> Result<TodayView, NutritionError> {
        let now = self.clock.now();
        let today = day_of(now);
        let Some(rebuilt) = self.store.recompute_totals(user_id, today, now).await? else {
            return Ok(TodayView::empty(today));
        };
        if rebuilt.drifted() {
            warn!(%user_id, date = %today, "daily totals drifted and were recomputed");
        }
        Ok(TodayView::from_aggregate(&rebuilt.day))
    }

    /// Validates a raw `days` parameter.
    ///
    /// Absent means the configured default. Zero, negative or non-integer
    /// input is rejected; values above the configured maximum are clamped.
    pub fn resolve_days(&self, raw: Option<&str>) -> Result<u32, NutritionError> {
        let Some(raw) = raw.map(str::trim) else {
            return Ok(self.history.default_days);
        };
        let days: i64 = raw.parse().map_err(|_| {
            NutritionError::Validation(format!("days must be a positive integer, got {raw:?}"))
        })?;
        if days < 1 {
            return Err(NutritionError::Validation(format!(
                "days must be a positive integer, got {days}"
            )));
        }
        let max = self.history.max_days;
        if days > i64::from(max) {
            debug!(requested = days, max, "history window clamped");
            return Ok(max);
        }
        Ok(days as u32)
    }

    /// Aggregates in the trailing `days` window, most recent first. Days with
    /// nothing logged are absent.
    pub async fn history(
        &self,
        user_id: Uuid,
        days: u32,
    ) -> Result<Vec<DailyAggregate>, NutritionError> {
        if days == 0 {
            return Err(NutritionError::Validation(
                "days must be a positive integer, got 0".into(),
            ));
        }
        let days = days.min(self.history.max_days);
        let window = HistoryWindow::trailing(day_of(self.clock.now()), days);
        let out = self.store.find_range(user_id, window).await?;
        debug!(%user_id, days, found = out.len(), "history loaded");
        Ok(out)
    }

    pub async fn history_report(
        &self,
        user_id: Uuid,
        raw_days: Option<&str>,
    ) -> Result<HistoryReport, NutritionError> {
        let days = self.resolve_days(raw_days)?;
        let history = self.history(user_id, days).await?;
        Ok(report::summarize(days, history))
    }

    pub async fn set_goal(
        &self,
        user_id: Uuid,
        targets: Macros,
    ) -> Result<NutritionGoal, NutritionError> {
        let goal = NutritionGoal {
            user_id,
            targets,
            updated_at: self.clock.now(),
        };
        let goal = self.goals.put(goal).await?;
        info!(%user_id, "nutrition goal set");
        Ok(goal)
    }

    pub async fn goal(&self, user_id: Uuid) -> Result<NutritionGoal, NutritionError> {
        self.goals
            .get(user_id)
            .await?
            .ok_or(NutritionError::GoalNotSet)
    }

    pub async fn progress(&self, user_id: Uuid) -> Result<Progress, NutritionError> {
        let goal = self.goal(user_id).await?;
        let today = self.today(user_id).await?;
        Ok(goals::progress(today.date, &goal.targets, &today.totals))
    }
}

fn meal_name(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        UNTITLED_MEAL.to_string()
    } else {
        name.to_string()
    }
}
