//! Daily aggregate model.
//!
//! Macro values are kept as integer thousandths so that incrementally
//! maintained totals and a full recompute always agree exactly.

use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Serialize, Serializer};
use serde_json::Value;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use uuid::Uuid;

time::serde::format_description!(pub(crate) iso_date, Date, "[year]-[month]-[day]");

/// Inputs above this are clamped so sums cannot overflow.
const MAX_INPUT: f64 = 1_000_000.0;

/// A macro amount (kcal or grams) in thousandths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);
    const SCALE: f64 = 1000.0;

    pub const fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    pub const fn milli(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE
    }

    /// Lenient conversion for user input: negative, non-finite or absent
    /// values become zero.
    pub fn from_input(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return Self::ZERO;
        }
        Self((value.min(MAX_INPUT) * Self::SCALE).round() as i64)
    }

    /// Coerces a JSON number or numeric string. Anything else is zero.
    pub fn coerce(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map(Self::from_input).unwrap_or_default(),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Self::from_input)
                .unwrap_or_default(),
            _ => Self::ZERO,
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;
    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Quantity;
    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// The four tracked macros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Macros {
    pub calories: Quantity,
    pub protein: Quantity,
    pub carbs: Quantity,
    pub fats: Quantity,
}

impl Macros {
    pub fn zero() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn new(calories: f64, protein: f64, carbs: f64, fats: f64) -> Self {
        Self {
            calories: Quantity::from_input(calories),
            protein: Quantity::from_input(protein),
            carbs: Quantity::from_input(carbs),
            fats: Quantity::from_input(fats),
        }
    }

    /// Signed per-macro change from `old` to `self`.
    pub fn delta_from(self, old: Macros) -> Macros {
        self - old
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    fn zip(self, other: Macros, f: impl Fn(Quantity, Quantity) -> Quantity) -> Macros {
        Macros {
            calories: f(self.calories, other.calories),
            protein: f(self.protein, other.protein),
            carbs: f(self.carbs, other.carbs),
            fats: f(self.fats, other.fats),
        }
    }
}

impl Add for Macros {
    type Output = Macros;
    fn add(self, rhs: Macros) -> Macros {
        self.zip(rhs, |a, b| a + b)
    }
}

impl Sub for Macros {
    type Output = Macros;
    fn sub(self, rhs: Macros) -> Macros {
        self.zip(rhs, |a, b| a - b)
    }
}

impl AddAssign for Macros {
    fn add_assign(&mut self, rhs: Macros) {
        *self = *self + rhs;
    }
}

impl SubAssign for Macros {
    fn sub_assign(&mut self, rhs: Macros) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Macros {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Macros::zero(), |acc, m| acc + m)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealEntry {
    pub id: Uuid,
    pub name: String,
    pub macros: Macros,
    #[serde(with = "time::serde::rfc3339")]
    pub time_eaten: OffsetDateTime,
}

impl MealEntry {
    pub fn new(name: impl Into<String>, macros: Macros, time_eaten: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            macros,
            time_eaten,
        }
    }
}

/// One user's meals and running totals for one UTC calendar day.
///
/// `totals` always equals the sum of `meals[..].macros`; the mutating methods
/// below are the only way the store changes either.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub meals: Vec<MealEntry>,
    pub totals: Macros,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DailyAggregate {
    pub fn empty(user_id: Uuid, date: Date, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            date,
            meals: Vec::new(),
            totals: Macros::zero(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_meal(&mut self, entry: MealEntry, now: OffsetDateTime) {
        self.totals += entry.macros;
        self.meals.push(entry);
        self.updated_at = now;
    }

    /// Replaces name and macros of `meal_id`, returning the applied delta.
    pub fn replace_meal(
        &mut self,
        meal_id: Uuid,
        name: String,
        macros: Macros,
        now: OffsetDateTime,
    ) -> Option<Macros> {
        let entry = self.meals.iter_mut().find(|m| m.id == meal_id)?;
        let delta = macros.delta_from(entry.macros);
        entry.name = name;
        entry.macros = macros;
        self.totals += delta;
        self.updated_at = now;
        Some(delta)
    }

    pub fn remove_meal(&mut self, meal_id: Uuid, now: OffsetDateTime) -> Option<MealEntry> {
        let idx = self.meals.iter().position(|m| m.id == meal_id)?;
        let entry = self.meals.remove(idx);
        self.totals -= entry.macros;
        self.updated_at = now;
        Some(entry)
    }

    /// Totals computed from scratch.
    pub fn recomputed_totals(&self) -> Macros {
        self.meals.iter().map(|m| m.macros).sum()
    }

    /// Resets `totals` from the meal list. Returns true if they had drifted.
    pub fn recompute_totals(&mut self, now: OffsetDateTime) -> bool {
        let fresh = self.recomputed_totals();
        let drifted = fresh != self.totals;
        self.totals = fresh;
        self.updated_at = now;
        drifted
    }

    /// Meals ordered for display, most recently eaten first.
    pub fn meals_latest_first(&self) -> Vec<MealEntry> {
        let mut meals = self.meals.clone();
        meals.sort_by(|a, b| b.time_eaten.cmp(&a.time_eaten));
        meals
    }
}

/// The UTC calendar day containing `at`.
pub fn day_of(at: OffsetDateTime) -> Date {
    at.to_offset(UtcOffset::UTC).date()
}

/// Inclusive range of the `days` calendar days ending on `today`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub from: Date,
    pub to: Date,
}

impl HistoryWindow {
    /// `days` must be at least 1.
    pub fn trailing(today: Date, days: u32) -> Self {
        let span = i64::from(days.max(1) - 1);
        Self {
            from: today.saturating_sub(Duration::days(span)),
            to: today,
        }
    }

    pub fn contains(&self, date: Date) -> bool {
        self.from <= date && date <= self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::{date, datetime};

    const NOON: OffsetDateTime = datetime!(2025-03-10 12:00 UTC);

    #[test]
    fn coerce_accepts_numbers_and_numeric_strings() {
        assert_eq!(Quantity::coerce(&json!(500)).as_f64(), 500.0);
        assert_eq!(Quantity::coerce(&json!("12.5")).as_f64(), 12.5);
        assert_eq!(Quantity::coerce(&json!(" 7 ")).as_f64(), 7.0);
    }

    #[test]
    fn coerce_falls_back_to_zero() {
        assert_eq!(Quantity::coerce(&json!("lots")), Quantity::ZERO);
        assert_eq!(Quantity::coerce(&json!(null)), Quantity::ZERO);
        assert_eq!(Quantity::coerce(&json!(-40)), Quantity::ZERO);
        assert_eq!(Quantity::coerce(&json!([1, 2])), Quantity::ZERO);
        assert_eq!(Quantity::coerce(&json!("NaN")), Quantity::ZERO);
    }

    #[test]
    fn huge_inputs_are_clamped() {
        assert_eq!(Quantity::from_input(1e300).as_f64(), MAX_INPUT);
    }

    #[test]
    fn quantity_serializes_as_plain_number() {
        let m = Macros::new(500.0, 20.5, 0.0, 15.0);
        let v = serde_json::to_value(m).unwrap();
        assert_eq!(v, json!({"calories": 500.0, "protein": 20.5, "carbs": 0.0, "fats": 15.0}));
    }

    #[test]
    fn totals_track_meal_mutations() {
        let mut day = DailyAggregate::empty(Uuid::new_v4(), date!(2025-03-10), NOON);
        let breakfast = MealEntry::new("Breakfast", Macros::new(500.0, 20.0, 60.0, 15.0), NOON);
        let lunch = MealEntry::new("Lunch", Macros::new(600.0, 30.0, 70.0, 20.0), NOON);
        let (b_id, l_id) = (breakfast.id, lunch.id);
        day.push_meal(breakfast, NOON);
        day.push_meal(lunch, NOON);
        assert_eq!(day.totals, Macros::new(1100.0, 50.0, 130.0, 35.0));

        let delta = day
            .replace_meal(b_id, "Breakfast".into(), Macros::new(400.0, 25.0, 60.0, 10.0), NOON)
            .unwrap();
        assert_eq!(delta.calories.as_f64(), -100.0);
        assert_eq!(delta.protein.as_f64(), 5.0);
        assert_eq!(day.totals, Macros::new(1000.0, 55.0, 130.0, 30.0));

        let removed = day.remove_meal(l_id, NOON).unwrap();
        assert_eq!(removed.name, "Lunch");
        assert_eq!(day.totals, Macros::new(400.0, 25.0, 60.0, 10.0));
        assert_eq!(day.totals, day.recomputed_totals());
    }

    #[test]
    fn fractional_values_do_not_drift() {
        let mut day = DailyAggregate::empty(Uuid::new_v4(), date!(2025-03-10), NOON);
        let mut ids = Vec::new();
        for v in [0.1, 0.2, 0.3, 0.7, 1.1] {
            let e = MealEntry::new("snack", Macros::new(v, v, v, v), NOON);
            ids.push(e.id);
            day.push_meal(e, NOON);
        }
        day.replace_meal(ids[1], "snack".into(), Macros::new(0.33, 0.0, 0.1, 0.9), NOON);
        day.remove_meal(ids[3], NOON);
        assert_eq!(day.totals, day.recomputed_totals());
        assert!(!day.recompute_totals(NOON));
    }

    #[test]
    fn missing_meal_is_reported() {
        let mut day = DailyAggregate::empty(Uuid::new_v4(), date!(2025-03-10), NOON);
        assert!(day.remove_meal(Uuid::new_v4(), NOON).is_none());
        assert!(day
            .replace_meal(Uuid::new_v4(), "x".into(), Macros::zero(), NOON)
            .is_none());
        assert!(day.totals.is_zero());
    }

    #[test]
    fn recompute_repairs_drifted_totals() {
        let mut day = DailyAggregate::empty(Uuid::new_v4(), date!(2025-03-10), NOON);
        day.push_meal(MealEntry::new("a", Macros::new(100.0, 1.0, 2.0, 3.0), NOON), NOON);
        day.totals = Macros::new(999.0, 0.0, 0.0, 0.0);
        assert!(day.recompute_totals(NOON));
        assert_eq!(day.totals, Macros::new(100.0, 1.0, 2.0, 3.0));
    }

    #[test]
    fn meals_sorted_latest_first() {
        let mut day = DailyAggregate::empty(Uuid::new_v4(), date!(2025-03-10), NOON);
        day.push_meal(MealEntry::new("lunch", Macros::zero(), datetime!(2025-03-10 12:30 UTC)), NOON);
        day.push_meal(MealEntry::new("breakfast", Macros::zero(), datetime!(2025-03-10 08:00 UTC)), NOON);
        day.push_meal(MealEntry::new("dinner", Macros::zero(), datetime!(2025-03-10 19:00 UTC)), NOON);
        let names: Vec<_> = day.meals_latest_first().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["dinner", "lunch", "breakfast"]);
        assert_eq!(day.meals[0].name, "lunch");
    }

    #[test]
    fn day_of_normalizes_to_utc() {
        assert_eq!(day_of(datetime!(2025-03-10 00:00 UTC)), date!(2025-03-10));
        assert_eq!(day_of(datetime!(2025-03-10 23:59:59 UTC)), date!(2025-03-10));
        assert_eq!(day_of(datetime!(2025-03-10 22:00 -05:00)), date!(2025-03-11));
    }

    #[test]
    fn trailing_window_is_inclusive() {
        let w = HistoryWindow::trailing(date!(2025-03-10), 7);
        assert_eq!(w.from, date!(2025-03-04));
        assert!(w.contains(date!(2025-03-04)));
        assert!(w.contains(date!(2025-03-10)));
        assert!(!w.contains(date!(2025-03-03)));

        let single = HistoryWindow::trailing(date!(2025-03-10), 1);
        assert_eq!(single.from, single.to);
    }

    #[test]
    fn aggregate_serializes_date_as_iso() {
        let day = DailyAggregate::empty(Uuid::nil(), date!(2025-03-10), NOON);
        let v = serde_json::to_value(&day).unwrap();
        assert_eq!(v["date"], "2025-03-10");
        assert_eq!(v["meals"], json!([]));
    }
}
