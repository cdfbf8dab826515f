use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{DailyAggregate, Macros, Quantity};

/// Macro fields as sent by clients: numbers, numeric strings or nothing.
#[derive(Debug, Default, Deserialize)]
pub struct MacroInput {
    #[serde(default)]
    pub calories: Value,
    #[serde(default)]
    pub protein: Value,
    #[serde(default)]
    pub carbs: Value,
    #[serde(default)]
    pub fats: Value,
}

impl MacroInput {
    pub fn to_macros(&self) -> Macros {
        Macros {
            calories: Quantity::coerce(&self.calories),
            protein: Quantity::coerce(&self.protein),
            carbs: Quantity::coerce(&self.carbs),
            fats: Quantity::coerce(&self.fats),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogMealRequest {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub macros: MacroInput,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub time_eaten: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMealRequest {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub macros: MacroInput,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub days: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MealLoggedResponse {
    pub meal_id: Uuid,
    pub day: DailyAggregate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_request_accepts_mixed_macro_types() {
        let req: LogMealRequest = serde_json::from_value(json!({
            "name": "Oatmeal",
            "calories": "389",
            "protein": 16.9,
            "carbs": "n/a"
        }))
        .unwrap();
        let m = req.macros.to_macros();
        assert_eq!(req.name, "Oatmeal");
        assert_eq!(m.calories.as_f64(), 389.0);
        assert_eq!(m.protein.as_f64(), 16.9);
        assert_eq!(m.carbs, Quantity::ZERO);
        assert_eq!(m.fats, Quantity::ZERO);
        assert!(req.time_eaten.is_none());
    }

    #[test]
    fn log_request_parses_time_eaten() {
        let req: LogMealRequest = serde_json::from_value(json!({
            "name": "Toast",
            "time_eaten": "2025-03-10T07:30:00Z"
        }))
        .unwrap();
        assert_eq!(req.time_eaten.unwrap().hour(), 7);
    }
}
