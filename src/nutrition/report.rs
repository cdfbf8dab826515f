//! Reductions over a history of daily aggregates.

use serde::Serialize;

use super::model::DailyAggregate;

/// Average intake per logged day, rounded to whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AverageMacros {
    pub calories: i64,
    pub protein: i64,
    pub carbs: i64,
    pub fats: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub requested_days: u32,
    pub logged_days: usize,
    pub average: Option<AverageMacros>,
    pub days: Vec<DailyAggregate>,
}

/// Mean of `sum_milli / count` in whole units, rounding half up.
fn mean_units(sum_milli: i128, count: i128) -> i64 {
    let denom = count * 1000;
    (sum_milli * 2 + denom).div_euclid(denom * 2) as i64
}

/// Average of each macro across `history`, dividing by the number of days
/// present. `None` for an empty history.
pub fn average(history: &[DailyAggregate]) -> Option<AverageMacros> {
    if history.is_empty() {
        return None;
    }
    let n = history.len() as i128;
    let sum = |f: fn(&DailyAggregate) -> i64| -> i128 {
        history.iter().map(|d| i128::from(f(d))).sum()
    };
    Some(AverageMacros {
        calories: mean_units(sum(|d| d.totals.calories.milli()), n),
        protein: mean_units(sum(|d| d.totals.protein.milli()), n),
        carbs: mean_units(sum(|d| d.totals.carbs.milli()), n),
        fats: mean_units(sum(|d| d.totals.fats.milli()), n),
    })
}

pub fn summarize(requested_days: u32, history: Vec<DailyAggregate>) -> HistoryReport {
    HistoryReport {
        requested_days,
        logged_days: history.len(),
        average: average(&history),
        days: history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nutrition::model::{Macros, MealEntry};
    use time::macros::{date, datetime};
    use time::Date;
    use uuid::Uuid;

    fn day_with(date: Date, macros: Macros) -> DailyAggregate {
        let at = datetime!(2025-03-10 12:00 UTC);
        let mut d = DailyAggregate::empty(Uuid::nil(), date, at);
        d.push_meal(MealEntry::new("m", macros, at), at);
        d
    }

    #[test]
    fn empty_history_has_no_average() {
        assert_eq!(average(&[]), None);
        let report = summarize(7, Vec::new());
        assert_eq!(report.logged_days, 0);
        assert!(report.average.is_none());
    }

    #[test]
    fn divides_by_logged_days_not_window() {
        let history = vec![
            day_with(date!(2025-03-10), Macros::new(2000.0, 100.0, 200.0, 60.0)),
            day_with(date!(2025-03-07), Macros::new(1000.0, 50.0, 100.0, 30.0)),
        ];
        let report = summarize(7, history);
        assert_eq!(report.requested_days, 7);
        assert_eq!(report.logged_days, 2);
        assert_eq!(
            report.average,
            Some(AverageMacros { calories: 1500, protein: 75, carbs: 150, fats: 45 })
        );
    }

    #[test]
    fn rounds_half_up_uniformly() {
        let history = vec![
            day_with(date!(2025-03-10), Macros::new(101.0, 3.0, 0.0, 0.4)),
            day_with(date!(2025-03-09), Macros::new(100.0, 2.0, 1.0, 0.5)),
        ];
        // 100.5 -> 101, 2.5 -> 3, 0.5 -> 1, 0.45 -> 0
        assert_eq!(
            average(&history),
            Some(AverageMacros { calories: 101, protein: 3, carbs: 1, fats: 0 })
        );
    }

    #[test]
    fn average_is_pure() {
        let history = vec![day_with(date!(2025-03-10), Macros::new(333.3, 1.0, 1.0, 1.0))];
        assert_eq!(average(&history), average(&history));
        assert_eq!(average(&history).unwrap().calories, 333);
    }
}
