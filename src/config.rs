use std::str::FromStr;

use anyhow::Context;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub max_connections: u32,
    pub fee_lookup_concurrency: usize,
}

impl Config {
    /// Reads the process environment after loading `.env` when one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let value = |key: &str| lookup(key).map(|raw| raw.trim().to_string()).filter(|raw| !raw.is_empty());

        Ok(Self {
            database_url: value("DATABASE_URL"),
            bind_addr: value("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            max_connections: parse_or("DB_MAX_CONNECTIONS", value("DB_MAX_CONNECTIONS"), 5)?,
            fee_lookup_concurrency: parse_or(
                "FEE_LOOKUP_CONCURRENCY",
                value("FEE_LOOKUP_CONCURRENCY"),
                8,
            )?,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a Postgres instance")
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    let parsed: T = raw
        .parse()
        .with_context(|| format!("{key} must be a positive number, got {raw:?}"))?;
    if parsed <= T::default() {
        anyhow::bail!("{key} must be a positive number, got {raw:?}");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.fee_lookup_concurrency, 8);
        assert!(config.database_url.is_none());
        assert!(config.database_url().is_err());
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/school"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DB_MAX_CONNECTIONS", "12"),
            ("FEE_LOOKUP_CONCURRENCY", " 3 "),
        ])
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/school");
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.fee_lookup_concurrency, 3);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(config(&[("DB_MAX_CONNECTIONS", "lots")]).is_err());
        assert!(config(&[("FEE_LOOKUP_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config(&[("DATABASE_URL", "  "), ("BIND_ADDR", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }
}
