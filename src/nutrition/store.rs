use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{DailyAggregate, HistoryWindow, Macros, MealEntry, Quantity};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    /// Connectivity trouble. Callers may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Unavailable(e.to_string())
            }
            other => StorageError::Database(other),
        }
    }
}

/// Persistence for daily aggregates.
///
/// Every mutating call is atomic with respect to the `(user_id, date)`
/// document it touches. `append_meal` creates the aggregate on first use and
/// never produces a second one for the same key.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn find(&self, user_id: Uuid, date: Date)
        -> Result<Option<DailyAggregate>, StorageError>;

    /// Aggregates inside `window`, most recent first.
    async fn find_range(
        &self,
        user_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<DailyAggregate>, StorageError>;

    async fn append_meal(
        &self,
        user_id: Uuid,
        date: Date,
        entry: MealEntry,
        now: OffsetDateTime,
    ) -> Result<DailyAggregate, StorageError>;

    /// `None` when the aggregate or the meal does not exist.
    async fn replace_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        name: String,
        macros: Macros,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError>;

    /// `None` when the aggregate or the meal does not exist.
    async fn remove_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError>;

    /// Rebuilds totals from the meal list. `None` when there is no aggregate.
    async fn recompute_totals(
        &self,
        user_id: Uuid,
        date: Date,
        now: OffsetDateTime,
    ) -> Result<Option<Recomputed>, StorageError>;
}

/// A day after its totals were rebuilt, with the totals it held just before.
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub previous: Macros,
    pub day: DailyAggregate,
}

impl Recomputed {
    pub fn drifted(&self) -> bool {
        self.previous != self.day.totals
    }
}

pub fn memory() -> Arc<dyn AggregateStore> {
    Arc::new(MemoryAggregateStore::default())
}

pub fn postgres(db: PgPool) -> Arc<dyn AggregateStore> {
    Arc::new(PostgresAggregateStore { db })
}

// ---- memory ----

#[derive(Default)]
struct MemoryAggregateStore {
    days: Mutex<HashMap<(Uuid, Date), DailyAggregate>>,
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn find(
        &self,
        user_id: Uuid,
        date: Date,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let days = self.days.lock().await;
        Ok(days.get(&(user_id, date)).cloned())
    }

    async fn find_range(
        &self,
        user_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<DailyAggregate>, StorageError> {
        let days = self.days.lock().await;
        let mut out: Vec<DailyAggregate> = days
            .values()
            .filter(|d| d.user_id == user_id && window.contains(d.date))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(out)
    }

    async fn append_meal(
        &self,
        user_id: Uuid,
        date: Date,
        entry: MealEntry,
        now: OffsetDateTime,
    ) -> Result<DailyAggregate, StorageError> {
        let mut days = self.days.lock().await;
        let day = days
            .entry((user_id, date))
            .or_insert_with(|| DailyAggregate::empty(user_id, date, now));
        day.push_meal(entry, now);
        Ok(day.clone())
    }

    async fn replace_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        name: String,
        macros: Macros,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let mut days = self.days.lock().await;
        let Some(day) = days.get_mut(&(user_id, date)) else {
            return Ok(None);
        };
        Ok(day
            .replace_meal(meal_id, name, macros, now)
            .map(|_| day.clone()))
    }

    async fn remove_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let mut days = self.days.lock().await;
        let Some(day) = days.get_mut(&(user_id, date)) else {
            return Ok(None);
        };
        Ok(day.remove_meal(meal_id, now).map(|_| day.clone()))
    }

    async fn recompute_totals(
        &self,
        user_id: Uuid,
        date: Date,
        now: OffsetDateTime,
    ) -> Result<Option<Recomputed>, StorageError> {
        let mut days = self.days.lock().await;
        Ok(days.get_mut(&(user_id, date)).map(|day| {
            let previous = day.totals;
            day.recompute_totals(now);
            Recomputed {
                previous,
                day: day.clone(),
            }
        }))
    }
}

// ---- postgres ----

struct PostgresAggregateStore {
    db: PgPool,
}

#[derive(Debug, FromRow)]
struct AggregateRow {
    id: Uuid,
    user_id: Uuid,
    day: Date,
    calories: i64,
    protein: i64,
    carbs: i64,
    fats: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct MealRow {
    id: Uuid,
    aggregate_id: Uuid,
    name: String,
    calories: i64,
    protein: i64,
    carbs: i64,
    fats: i64,
    time_eaten: OffsetDateTime,
}

fn macros_from_milli(calories: i64, protein: i64, carbs: i64, fats: i64) -> Macros {
    Macros {
        calories: Quantity::from_milli(calories),
        protein: Quantity::from_milli(protein),
        carbs: Quantity::from_milli(carbs),
        fats: Quantity::from_milli(fats),
    }
}

impl MealRow {
    fn into_entry(self) -> MealEntry {
        MealEntry {
            id: self.id,
            name: self.name,
            macros: macros_from_milli(self.calories, self.protein, self.carbs, self.fats),
            time_eaten: self.time_eaten,
        }
    }
}

impl AggregateRow {
    fn into_aggregate(self, meals: Vec<MealEntry>) -> DailyAggregate {
        DailyAggregate {
            id: self.id,
            user_id: self.user_id,
            date: self.day,
            meals,
            totals: macros_from_milli(self.calories, self.protein, self.carbs, self.fats),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const AGGREGATE_COLUMNS: &str =
    "id, user_id, day, calories, protein, carbs, fats, created_at, updated_at";

/// Attaches meal entries (insertion order) to each row, preserving row order.
async fn with_meals(
    conn: &mut PgConnection,
    rows: Vec<AggregateRow>,
) -> Result<Vec<DailyAggregate>, StorageError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let meal_rows = sqlx::query_as::<_, MealRow>(
        r#"
        SELECT id, aggregate_id, name, calories, protein, carbs, fats, time_eaten
          FROM meal_entries
         WHERE aggregate_id = ANY($1)
         ORDER BY seq ASC
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut by_aggregate: HashMap<Uuid, Vec<MealEntry>> = HashMap::new();
    for m in meal_rows {
        by_aggregate.entry(m.aggregate_id).or_default().push(m.into_entry());
    }

    Ok(rows
        .into_iter()
        .map(|r| {
            let meals = by_aggregate.remove(&r.id).unwrap_or_default();
            r.into_aggregate(meals)
        })
        .collect())
}

async fn load_by_id(
    conn: &mut PgConnection,
    aggregate_id: Uuid,
) -> Result<DailyAggregate, StorageError> {
    let row = sqlx::query_as::<_, AggregateRow>(&format!(
        "SELECT {AGGREGATE_COLUMNS} FROM daily_aggregates WHERE id = $1"
    ))
    .bind(aggregate_id)
    .fetch_one(&mut *conn)
    .await?;
    let mut out = with_meals(conn, vec![row]).await?;
    out.pop().ok_or(StorageError::Database(sqlx::Error::RowNotFound))
}

/// Locks a meal belonging to `(user_id, date)` for the rest of the transaction.
async fn lock_meal(
    conn: &mut PgConnection,
    user_id: Uuid,
    date: Date,
    meal_id: Uuid,
) -> Result<Option<MealRow>, StorageError> {
    let row = sqlx::query_as::<_, MealRow>(
        r#"
        SELECT m.id, m.aggregate_id, m.name, m.calories, m.protein, m.carbs, m.fats, m.time_eaten
          FROM meal_entries m
          JOIN daily_aggregates d ON d.id = m.aggregate_id
         WHERE m.id = $1 AND d.user_id = $2 AND d.day = $3
           FOR UPDATE OF m
        "#,
    )
    .bind(meal_id)
    .bind(user_id)
    .bind(date)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Adds a signed delta to an aggregate's totals in one statement.
async fn increment_totals(
    conn: &mut PgConnection,
    aggregate_id: Uuid,
    delta: Macros,
    now: OffsetDateTime,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE daily_aggregates
           SET calories = calories + $2,
               protein = protein + $3,
               carbs = carbs + $4,
               fats = fats + $5,
               updated_at = $6
         WHERE id = $1
        "#,
    )
    .bind(aggregate_id)
    .bind(delta.calories.milli())
    .bind(delta.protein.milli())
    .bind(delta.carbs.milli())
    .bind(delta.fats.milli())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl AggregateStore for PostgresAggregateStore {
    async fn find(
        &self,
        user_id: Uuid,
        date: Date,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query_as::<_, AggregateRow>(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM daily_aggregates WHERE user_id = $1 AND day = $2"
        ))
        .bind(user_id)
        .bind(date)
        .fetch_optional(&mut *conn)
        .await?;
        match row {
            Some(row) => Ok(with_meals(&mut conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_range(
        &self,
        user_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<DailyAggregate>, StorageError> {
        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query_as::<_, AggregateRow>(&format!(
            r#"
            SELECT {AGGREGATE_COLUMNS}
              FROM daily_aggregates
             WHERE user_id = $1 AND day BETWEEN $2 AND $3
             ORDER BY day DESC
            "#
        ))
        .bind(user_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&mut *conn)
        .await?;
        with_meals(&mut conn, rows).await
    }

    async fn append_meal(
        &self,
        user_id: Uuid,
        date: Date,
        entry: MealEntry,
        now: OffsetDateTime,
    ) -> Result<DailyAggregate, StorageError> {
        let mut tx = self.db.begin().await?;

        // Find-or-create and the totals increment happen in a single upsert.
        let (aggregate_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO daily_aggregates
                (id, user_id, day, calories, protein, carbs, fats, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (user_id, day) DO UPDATE
               SET calories = daily_aggregates.calories + EXCLUDED.calories,
                   protein = daily_aggregates.protein + EXCLUDED.protein,
                   carbs = daily_aggregates.carbs + EXCLUDED.carbs,
                   fats = daily_aggregates.fats + EXCLUDED.fats,
                   updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(date)
        .bind(entry.macros.calories.milli())
        .bind(entry.macros.protein.milli())
        .bind(entry.macros.carbs.milli())
        .bind(entry.macros.fats.milli())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO meal_entries
                (id, aggregate_id, name, calories, protein, carbs, fats, time_eaten)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(aggregate_id)
        .bind(&entry.name)
        .bind(entry.macros.calories.milli())
        .bind(entry.macros.protein.milli())
        .bind(entry.macros.carbs.milli())
        .bind(entry.macros.fats.milli())
        .bind(entry.time_eaten)
        .execute(&mut *tx)
        .await?;

        let aggregate = load_by_id(&mut tx, aggregate_id).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    async fn replace_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        name: String,
        macros: Macros,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let mut tx = self.db.begin().await?;
        let Some(old) = lock_meal(&mut tx, user_id, date, meal_id).await? else {
            return Ok(None);
        };
        let aggregate_id = old.aggregate_id;
        let delta = macros.delta_from(old.into_entry().macros);

        sqlx::query(
            r#"
            UPDATE meal_entries
               SET name = $2, calories = $3, protein = $4, carbs = $5, fats = $6
             WHERE id = $1
            "#,
        )
        .bind(meal_id)
        .bind(&name)
        .bind(macros.calories.milli())
        .bind(macros.protein.milli())
        .bind(macros.carbs.milli())
        .bind(macros.fats.milli())
        .execute(&mut *tx)
        .await?;

        increment_totals(&mut tx, aggregate_id, delta, now).await?;
        let aggregate = load_by_id(&mut tx, aggregate_id).await?;
        tx.commit().await?;
        Ok(Some(aggregate))
    }

    async fn remove_meal(
        &self,
        user_id: Uuid,
        date: Date,
        meal_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DailyAggregate>, StorageError> {
        let mut tx = self.db.begin().await?;
        let Some(old) = lock_meal(&mut tx, user_id, date, meal_id).await? else {
            return Ok(None);
        };
        let aggregate_id = old.aggregate_id;
        let removed = old.into_entry().macros;

        sqlx::query("DELETE FROM meal_entries WHERE id = $1")
            .bind(meal_id)
            .execute(&mut *tx)
            .await?;

        increment_totals(&mut tx, aggregate_id, Macros::zero() - removed, now).await?;
        let aggregate = load_by_id(&mut tx, aggregate_id).await?;
        tx.commit().await?;
        Ok(Some(aggregate))
    }

    async fn recompute_totals(
        &self,
        user_id: Uuid,
        date: Date,
        now: OffsetDateTime,
    ) -> Result<Option<Recomputed>, StorageError> {
        let mut tx = self.db.begin().await?;

        // The row lock holds off concurrent appends until the rebuild commits.
        let Some(current) = sqlx::query_as::<_, AggregateRow>(&format!(
            r#"
            SELECT {AGGREGATE_COLUMNS}
              FROM daily_aggregates
             WHERE user_id = $1 AND day = $2
               FOR UPDATE
            "#
        ))
        .bind(user_id)
        .bind(date)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let previous = macros_from_milli(current.calories, current.protein, current.carbs, current.fats);

        sqlx::query(
            r#"
            UPDATE daily_aggregates d
               SET calories = COALESCE((SELECT SUM(m.calories) FROM meal_entries m WHERE m.aggregate_id = d.id), 0)::BIGINT,
                   protein = COALESCE((SELECT SUM(m.protein) FROM meal_entries m WHERE m.aggregate_id = d.id), 0)::BIGINT,
                   carbs = COALESCE((SELECT SUM(m.carbs) FROM meal_entries m WHERE m.aggregate_id = d.id), 0)::BIGINT,
                   fats = COALESCE((SELECT SUM(m.fats) FROM meal_entries m WHERE m.aggregate_id = d.id), 0)::BIGINT,
                   updated_at = $2
             WHERE d.id = $1
            "#,
        )
        .bind(current.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let day = load_by_id(&mut tx, current.id).await?;
        tx.commit().await?;
        Ok(Some(Recomputed { previous, day }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    const NOW: OffsetDateTime = datetime!(2025-03-10 12:00 UTC);

    #[tokio::test]
    async fn memory_append_creates_once_per_day() {
        let store = memory();
        let user = Uuid::new_v4();
        let d = date!(2025-03-10);
        let first = store
            .append_meal(user, d, MealEntry::new("a", Macros::new(100.0, 0.0, 0.0, 0.0), NOW), NOW)
            .await
            .unwrap();
        let second = store
            .append_meal(user, d, MealEntry::new("b", Macros::new(50.0, 0.0, 0.0, 0.0), NOW), NOW)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.meals.len(), 2);
        assert_eq!(second.totals.calories.as_f64(), 150.0);
    }

    #[tokio::test]
    async fn memory_range_is_sorted_and_scoped_to_user() {
        let store = memory();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        for d in [date!(2025-03-08), date!(2025-03-10), date!(2025-03-01)] {
            store
                .append_meal(user, d, MealEntry::new("x", Macros::zero(), NOW), NOW)
                .await
                .unwrap();
        }
        store
            .append_meal(other, date!(2025-03-09), MealEntry::new("x", Macros::zero(), NOW), NOW)
            .await
            .unwrap();

        let window = HistoryWindow::trailing(date!(2025-03-10), 7);
        let days = store.find_range(user, window).await.unwrap();
        let dates: Vec<_> = days.iter().map(|d| d.date).collect();
        assert_eq!(dates, [date!(2025-03-10), date!(2025-03-08)]);
    }

    #[tokio::test]
    async fn memory_edits_on_missing_day_return_none() {
        let store = memory();
        let user = Uuid::new_v4();
        let d = date!(2025-03-10);
        assert!(store.remove_meal(user, d, Uuid::new_v4(), NOW).await.unwrap().is_none());
        assert!(store
            .replace_meal(user, d, Uuid::new_v4(), "x".into(), Macros::zero(), NOW)
            .await
            .unwrap()
            .is_none());
        assert!(store.recompute_totals(user, d, NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_recompute_reports_previous_totals() {
        let store = MemoryAggregateStore::default();
        let user = Uuid::new_v4();
        let d = date!(2025-03-10);
        let meal = Macros::new(250.0, 10.0, 30.0, 8.0);
        store
            .append_meal(user, d, MealEntry::new("a", meal, NOW), NOW)
            .await
            .unwrap();

        let clean = store.recompute_totals(user, d, NOW).await.unwrap().unwrap();
        assert!(!clean.drifted());
        assert_eq!(clean.previous, meal);

        let corrupted = Macros::new(999.0, 0.0, 0.0, 0.0);
        store.days.lock().await.get_mut(&(user, d)).unwrap().totals = corrupted;
        let repaired = store.recompute_totals(user, d, NOW).await.unwrap().unwrap();
        assert!(repaired.drifted());
        assert_eq!(repaired.previous, corrupted);
        assert_eq!(repaired.day.totals, meal);
    }

    #[test]
    fn connectivity_errors_are_unavailable() {
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolTimedOut),
            StorageError::Unavailable(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::RowNotFound),
            StorageError::Database(_)
        ));
    }

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn postgres_concurrent_appends_create_one_aggregate(db: PgPool) {
        let (user,): (Uuid,) = sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ('race', 'x') RETURNING id",
        )
        .fetch_one(&db)
        .await
        .unwrap();
        let store = postgres(db.clone());
        let d = date!(2025-03-10);
        let n = 16;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let meal = MealEntry::new(
                        format!("snack {i}"),
                        Macros::new(10.0, 1.0, 2.0, 0.5),
                        NOW,
                    );
                    store.append_meal(user, d, meal, NOW).await
                })
            })
            .collect();
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1);

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM daily_aggregates WHERE user_id = $1")
                .bind(user)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(count, 1);

        let day = store.find(user, d).await.unwrap().unwrap();
        assert_eq!(day.meals.len(), n);
        assert_eq!(day.totals, Macros::new(160.0, 16.0, 32.0, 8.0));
        assert_eq!(day.totals, day.recomputed_totals());

        let rebuilt = store.recompute_totals(user, d, NOW).await.unwrap().unwrap();
        assert!(!rebuilt.drifted());
    }

    #[test]
    fn meal_row_converts_milli_columns() {
        let row = MealRow {
            id: Uuid::nil(),
            aggregate_id: Uuid::nil(),
            name: "oats".into(),
            calories: 389_500,
            protein: 16_900,
            carbs: 66_300,
            fats: 6_900,
            time_eaten: NOW,
        };
        let entry = row.into_entry();
        assert_eq!(entry.macros.calories.as_f64(), 389.5);
        assert_eq!(entry.macros.fats.as_f64(), 6.9);
    }
}
