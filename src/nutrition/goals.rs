//! Per-user daily macro targets and progress against them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{iso_date, Macros, Quantity};
use super::store::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutritionGoal {
    pub user_id: Uuid,
    pub targets: Macros,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[async_trait]
pub trait GoalStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<NutritionGoal>, StorageError>;
    /// Inserts or replaces the user's goal.
    async fn put(&self, goal: NutritionGoal) -> Result<NutritionGoal, StorageError>;
}

pub fn memory() -> Arc<dyn GoalStore> {
    Arc::new(MemoryGoalStore::default())
}

pub fn postgres(db: PgPool) -> Arc<dyn GoalStore> {
    Arc::new(PostgresGoalStore { db })
}

#[derive(Default)]
struct MemoryGoalStore {
    goals: Mutex<HashMap<Uuid, NutritionGoal>>,
}

#[async_trait]
impl GoalStore for MemoryGoalStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<NutritionGoal>, StorageError> {
        Ok(self.goals.lock().await.get(&user_id).cloned())
    }

    async fn put(&self, goal: NutritionGoal) -> Result<NutritionGoal, StorageError> {
        self.goals.lock().await.insert(goal.user_id, goal.clone());
        Ok(goal)
    }
}

struct PostgresGoalStore {
    db: PgPool,
}

#[derive(Debug, FromRow)]
struct GoalRow {
    user_id: Uuid,
    calories: i64,
    protein: i64,
    carbs: i64,
    fats: i64,
    updated_at: OffsetDateTime,
}

impl From<GoalRow> for NutritionGoal {
    fn from(r: GoalRow) -> Self {
        Self {
            user_id: r.user_id,
            targets: Macros {
                calories: Quantity::from_milli(r.calories),
                protein: Quantity::from_milli(r.protein),
                carbs: Quantity::from_milli(r.carbs),
                fats: Quantity::from_milli(r.fats),
            },
            updated_at: r.updated_at,
        }
    }
}

#[async_trait]
impl GoalStore for PostgresGoalStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<NutritionGoal>, StorageError> {
        let row = sqlx::query_as::<_, GoalRow>(
            r#"
            SELECT user_id, calories, protein, carbs, fats, updated_at
              FROM nutrition_goals
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn put(&self, goal: NutritionGoal) -> Result<NutritionGoal, StorageError> {
        let row = sqlx::query_as::<_, GoalRow>(
            r#"
            INSERT INTO nutrition_goals (user_id, calories, protein, carbs, fats, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
               SET calories = EXCLUDED.calories,
                   protein = EXCLUDED.protein,
                   carbs = EXCLUDED.carbs,
                   fats = EXCLUDED.fats,
                   updated_at = EXCLUDED.updated_at
            RETURNING user_id, calories, protein, carbs, fats, updated_at
            "#,
        )
        .bind(goal.user_id)
        .bind(goal.targets.calories.milli())
        .bind(goal.targets.protein.milli())
        .bind(goal.targets.carbs.milli())
        .bind(goal.targets.fats.milli())
        .bind(goal.updated_at)
        .fetch_one(&self.db)
        .await?;
        Ok(row.into())
    }
}

/// Per-macro percentage of the goal reached; `None` where the goal is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentages {
    pub calories: Option<i64>,
    pub protein: Option<i64>,
    pub carbs: Option<i64>,
    pub fats: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub goal: Macros,
    pub consumed: Macros,
    pub remaining: Macros,
    pub percent: Percentages,
}

fn remaining(goal: Quantity, consumed: Quantity) -> Quantity {
    (goal - consumed).max(Quantity::ZERO)
}

/// Rounded half-up; macros are never negative.
fn percent(consumed: Quantity, goal: Quantity) -> Option<i64> {
    if goal <= Quantity::ZERO {
        return None;
    }
    let (c, g) = (i128::from(consumed.milli()), i128::from(goal.milli()));
    Some(((c * 200 + g) / (g * 2)) as i64)
}

/// Compares a day's totals against the goal targets.
pub fn progress(date: Date, goal: &Macros, consumed: &Macros) -> Progress {
    Progress {
        date,
        goal: *goal,
        consumed: *consumed,
        remaining: Macros {
            calories: remaining(goal.calories, consumed.calories),
            protein: remaining(goal.protein, consumed.protein),
            carbs: remaining(goal.carbs, consumed.carbs),
            fats: remaining(goal.fats, consumed.fats),
        },
        percent: Percentages {
            calories: percent(consumed.calories, goal.calories),
            protein: percent(consumed.protein, goal.protein),
            carbs: percent(consumed.carbs, goal.carbs),
            fats: percent(consumed.fats, goal.fats),
        },
    }
}
