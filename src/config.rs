use std::{net::SocketAddr, time::Duration};

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    pub database_url: String,
    pub link_ttl_hours: i64,
    pub search_limit_per_query: u64,
    pub search_stream_limit_per_query: u64,
    pub sweep_interval_minutes: u64,
    pub resolver_timeout_secs: u64,
    pub resolver_rps: u32,
    pub resolver_retry_attempts: u32,
    pub resolver_retry_delay_ms: u64,
    pub site_base_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = lookup("PORT").unwrap_or_else(|| "8000".to_string()).parse().context("PORT")?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://reelfetch.db?mode=rwc".to_string());

        let site_base_url =
            lookup("SITE_BASE_URL").unwrap_or_else(|| "https://fzmovies.net".to_string());

        let link_ttl_hours: u64 = positive(&lookup, "LINK_TTL_HOURS", 24)?;
        let link_ttl_hours = i64::try_from(link_ttl_hours)
            .ok()
            .filter(|hours| hours.checked_mul(3_600).is_some())
            .with_context(|| format!("LINK_TTL_HOURS is too large: {link_ttl_hours}"))?;

        Ok(Self {
            addr: format!("{host}:{port}").parse().context("HOST/PORT")?,
            database_url,
            link_ttl_hours,
            search_limit_per_query: positive(&lookup, "SEARCH_LIMIT_PER_QUERY", 100)?,
            search_stream_limit_per_query: positive(&lookup, "SEARCH_STREAM_LIMIT_PER_QUERY", 500)?,
            sweep_interval_minutes: positive(&lookup, "SWEEP_INTERVAL_MINUTES", 60)?,
            resolver_timeout_secs: positive(&lookup, "RESOLVER_TIMEOUT_SECS", 30)?,
            resolver_rps: positive(&lookup, "RESOLVER_RPS", 2)?,
            resolver_retry_attempts: positive(&lookup, "RESOLVER_RETRY_ATTEMPTS", 2)?,
            resolver_retry_delay_ms: lookup("RESOLVER_RETRY_DELAY_MS")
                .map(|s| s.parse())
                .transpose()
                .context("RESOLVER_RETRY_DELAY_MS")?
                .unwrap_or(500),
            site_base_url: site_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.saturating_mul(60))
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().with_context(|| format!("{key}: invalid value {raw:?}"))?;
    if value < T::from(1) {
        anyhow::bail!("{key} must be a positive integer, got {raw:?}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.link_ttl_hours, 24);
        assert_eq!(config.search_limit_per_query, 100);
        assert_eq!(config.search_stream_limit_per_query, 500);
        assert_eq!(config.resolver_retry_attempts, 2);
        assert_eq!(config.resolver_retry_delay_ms, 500);
        assert_eq!(config.addr.port(), 8000);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("LINK_TTL_HOURS", "1"),
            ("SEARCH_LIMIT_PER_QUERY", "20"),
            ("SITE_BASE_URL", "https://example.org/"),
        ])
        .unwrap();
        assert_eq!(config.link_ttl_hours, 1);
        assert_eq!(config.search_limit_per_query, 20);
        assert_eq!(config.site_base_url, "https://example.org");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = config_from(&[("LINK_TTL_HOURS", "0")]).unwrap_err();
        assert!(err.to_string().contains("LINK_TTL_HOURS"));
    }

    #[test]
    fn ttl_that_overflows_seconds_is_rejected() {
        let too_large = (i64::MAX / 3_600 + 1).to_string();
        let err = config_from(&[("LINK_TTL_HOURS", too_large.as_str())]).unwrap_err();
        assert!(err.to_string().contains("LINK_TTL_HOURS"));

        let largest = (i64::MAX / 3_600).to_string();
        let config = config_from(&[("LINK_TTL_HOURS", largest.as_str())]).unwrap();
        assert_eq!(config.link_ttl_hours, i64::MAX / 3_600);

        assert!(config_from(&[("LINK_TTL_HOURS", u64::MAX.to_string().as_str())]).is_err());
    }

    #[test]
    fn negative_limit_is_rejected() {
        assert!(config_from(&[("SEARCH_LIMIT_PER_QUERY", "-5")]).is_err());
    }
}
