use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Which backend holds daily aggregates and goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown NUTRITION_STORE value: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Window used when the client does not pass `days`.
    pub default_days: u32,
    /// Larger requests are clamped to this.
    pub max_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_days: 7,
            max_days: 365,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub store: StoreKind,
    pub history: HistoryConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "mealmatch".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "mealmatch-users".into()),
            ttl_minutes: env_parse("JWT_TTL_MINUTES").unwrap_or(60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES").unwrap_or(60 * 24 * 14),
        };
        let store = match std::env::var("NUTRITION_STORE") {
            Ok(v) => v.parse()?,
            Err(_) => StoreKind::Postgres,
        };

        let defaults = HistoryConfig::default();
        let max_days = env_parse("HISTORY_MAX_DAYS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_days);
        let default_days = env_parse("HISTORY_DEFAULT_DAYS")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.default_days)
            .min(max_days);

        Ok(Self {
            database_url,
            jwt,
            store,
            history: HistoryConfig {
                default_days,
                max_days,
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_kind_parses_known_values() {
        assert_eq!("postgres".parse::<StoreKind>().unwrap(), StoreKind::Postgres);
        assert_eq!(" Memory ".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert!("mongo".parse::<StoreKind>().is_err());
    }

    #[test]
    fn history_defaults() {
        let h = HistoryConfig::default();
        assert_eq!(h.default_days, 7);
        assert_eq!(h.max_days, 365);
    }
}
