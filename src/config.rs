use anyhow::{bail, Result};
use url::Url;

use crate::chart::ChartWindow;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub history_minutes: u32,
    pub temp_capacity: usize,
    pub log_capacity: usize,
    pub tick_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Upper bound on one TCP + websocket handshake.
    pub connect_timeout_ms: u64,
    pub chart_window: ChartWindow,
    pub sim_addr: String,
    pub sim_step_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same parsing as `from_env`, against an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            ws_url: lookup("ADR_WS_URL").unwrap_or_else(|| "ws://127.0.0.1:9876/ws".to_string()),
            history_minutes: lookup("HISTORY_MINUTES").and_then(|v| v.parse().ok()).unwrap_or(60),
            temp_capacity: lookup("TEMP_CAPACITY").and_then(|v| v.parse().ok()).unwrap_or(86_400),
            log_capacity: lookup("LOG_CAPACITY").and_then(|v| v.parse().ok()).unwrap_or(500),
            tick_ms: lookup("TICK_MS").and_then(|v| v.parse().ok()).unwrap_or(250),
            reconnect_base_ms: lookup("RECONNECT_BASE_MS").and_then(|v| v.parse().ok()).unwrap_or(500),
            reconnect_max_ms: lookup("RECONNECT_MAX_MS").and_then(|v| v.parse().ok()).unwrap_or(10_000),
            connect_timeout_ms: lookup("CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()).unwrap_or(10_000),
            chart_window: lookup("CHART_WINDOW")
                .and_then(|v| ChartWindow::parse(&v))
                .unwrap_or(ChartWindow::OneHour),
            sim_addr: lookup("ADR_SIM_ADDR").unwrap_or_else(|| "127.0.0.1:9876".to_string()),
            sim_step_ms: lookup("ADR_SIM_STEP_MS").and_then(|v| v.parse().ok()).unwrap_or(1000),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.ws_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("ADR_WS_URL must use ws:// or wss://, got {}", url.scheme());
        }
        if self.temp_capacity == 0 || self.log_capacity == 0 {
            bail!("TEMP_CAPACITY and LOG_CAPACITY must be positive");
        }
        if self.tick_ms == 0 {
            bail!("TICK_MS must be positive");
        }
        if self.connect_timeout_ms == 0 {
            bail!("CONNECT_TIMEOUT_MS must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.ws_url, "ws://127.0.0.1:9876/ws");
        assert_eq!(cfg.history_minutes, 60);
        assert_eq!(cfg.chart_window, ChartWindow::OneHour);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("ADR_WS_URL", "wss://lab.example:9876/ws"),
            ("HISTORY_MINUTES", "15"),
            ("LOG_CAPACITY", "not-a-number"),
            ("CHART_WINDOW", "6h"),
        ]));
        assert_eq!(cfg.ws_url, "wss://lab.example:9876/ws");
        assert_eq!(cfg.history_minutes, 15);
        assert_eq!(cfg.log_capacity, 500);
        assert_eq!(cfg.chart_window, ChartWindow::SixHours);
    }

    #[test]
    fn test_validate_rejects_http_url() {
        let cfg = Config::from_lookup(lookup_from(&[("ADR_WS_URL", "http://10.0.1.13:9876/ws")]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let cfg = Config::from_lookup(lookup_from(&[("TEMP_CAPACITY", "0")]));
        assert!(cfg.validate().is_err());
    }
}
