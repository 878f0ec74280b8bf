//! Layered configuration (C15).
//!
//! Three tiers, grounded in `infrastructure/config.rs`'s `UserConfig` /
//! `AdvancedConfig` / `AppManagedConfig` split, generalised to this domain
//! and loaded through the `config` crate (defaults → file → `SCANNER_`
//! environment overrides) rather than the teacher's hand-rolled JSON
//! load/save, since this core is a headless service.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Operator-facing scheduling, concurrency, and filter knobs (tier 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_parallel_category_scans: usize,
    pub max_parallel_pages_per_category: usize,
    pub amazon_max_parallel_pages: usize,
    pub min_page_delay_seconds: f64,
    pub max_page_delay_seconds: f64,
    pub db_batch_update_size: usize,
    pub scheduler_interval_minutes: i64,
    pub disable_on_404: bool,

    pub global_min_price: f64,
    pub global_min_discount_percent: f64,
    pub kids_low_price_max: f64,
    pub kids_exclude_keywords: Vec<String>,
    pub kids_exclude_skus: HashMap<String, Vec<String>>,

    pub aggregator_stores: Vec<String>,
    pub retailer_rate_limits: HashMap<String, RetailerRateLimit>,
}

/// Per-store interval-mode rate-limit parameters (spec.md §4.1, supplemental §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetailerRateLimit {
    pub min_s: f64,
    pub max_s: f64,
    pub jitter_s: f64,
}

impl Default for RetailerRateLimit {
    fn default() -> Self {
        Self { min_s: 1.5, max_s: 4.0, jitter_s: 0.5 }
    }
}

/// Per-retailer rate limits grounded in `original_source/src/config.py`'s
/// `Settings.retailer_rate_limits` (seconds between requests).
fn default_retailer_rate_limits() -> HashMap<String, RetailerRateLimit> {
    HashMap::from([
        ("amazon_us".to_string(), RetailerRateLimit { min_s: 30.0, max_s: 60.0, jitter_s: 10.0 }),
        ("walmart".to_string(), RetailerRateLimit { min_s: 20.0, max_s: 30.0, jitter_s: 5.0 }),
        ("bestbuy".to_string(), RetailerRateLimit { min_s: 15.0, max_s: 30.0, jitter_s: 5.0 }),
        ("target".to_string(), RetailerRateLimit { min_s: 20.0, max_s: 30.0, jitter_s: 5.0 }),
        ("costco".to_string(), RetailerRateLimit { min_s: 45.0, max_s: 60.0, jitter_s: 10.0 }),
        ("newegg".to_string(), RetailerRateLimit { min_s: 15.0, max_s: 20.0, jitter_s: 3.0 }),
    ])
}

/// Per-store kids-SKU blocklist, grounded in `original_source/src/config.py`'s
/// `Settings.kids_exclude_skus_walmart` comma-separated SKU list.
fn default_kids_exclude_skus() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "walmart".to_string(),
        vec![
            "5116478924".to_string(),
            "780568056".to_string(),
            "5152678945".to_string(),
            "10025719060".to_string(),
            "16501550266".to_string(),
        ],
    )])
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_parallel_category_scans: 8,
            max_parallel_pages_per_category: 2,
            amazon_max_parallel_pages: 1,
            min_page_delay_seconds: 1.0,
            max_page_delay_seconds: 3.0,
            db_batch_update_size: 10,
            scheduler_interval_minutes: 5,
            disable_on_404: true,
            global_min_price: 50.0,
            global_min_discount_percent: 50.0,
            kids_low_price_max: 30.0,
            kids_exclude_keywords: vec![
                "kids".into(),
                "toddler".into(),
                "infant".into(),
                "baby".into(),
            ],
            kids_exclude_skus: default_kids_exclude_skus(),
            aggregator_stores: vec!["saveyourdeals".into(), "slickdeals".into(), "woot".into()],
            retailer_rate_limits: default_retailer_rate_limits(),
        }
    }
}

/// Adaptive rate-limiting, proxy, cache, and delta knobs (tier 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub adaptive_rate_limiting_enabled: bool,
    pub adaptive_base_delay_seconds: f64,
    pub adaptive_max_delay_seconds: f64,
    pub adaptive_error_rate_threshold: f64,
    pub adaptive_high_latency_ms: u64,
    pub adaptive_429_cooldown_seconds: u64,

    pub proxy_cooldown_minutes: i64,
    pub proxy_max_consecutive_403s: u32,

    pub http_cache_enabled: bool,
    pub http_cache_ttl_seconds: i64,
    pub delta_detection_enabled: bool,
    pub delta_cache_ttl_seconds: i64,

    pub dedupe_ttl_hours: i64,
    pub cooldown_minutes: i64,
    pub cross_source_ttl_seconds: i64,

    pub connection_timeout_seconds: u64,
    pub category_request_timeout_seconds: u64,
    pub http_max_connections: usize,
    pub connection_keepalive_seconds: u64,
    pub max_fetch_attempts: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            adaptive_rate_limiting_enabled: true,
            adaptive_base_delay_seconds: 2.0,
            adaptive_max_delay_seconds: 120.0,
            adaptive_error_rate_threshold: 0.3,
            adaptive_high_latency_ms: 4000,
            adaptive_429_cooldown_seconds: 300,
            proxy_cooldown_minutes: 30,
            proxy_max_consecutive_403s: 5,
            http_cache_enabled: true,
            http_cache_ttl_seconds: 3600,
            delta_detection_enabled: true,
            delta_cache_ttl_seconds: 7 * 24 * 3600,
            dedupe_ttl_hours: 12,
            cooldown_minutes: 60,
            cross_source_ttl_seconds: 600,
            connection_timeout_seconds: 10,
            category_request_timeout_seconds: 30,
            http_max_connections: 64,
            connection_keepalive_seconds: 90,
            max_fetch_attempts: 4,
        }
    }
}

/// App-managed runtime state, persisted across restarts (tier 3),
/// mirroring `AppManagedConfig`'s role in the teacher.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeState {
    pub last_scheduler_tick: Option<chrono::DateTime<chrono::Utc>>,
    pub config_version: u32,
}

/// Structured logging configuration (C17), matching the teacher's
/// `LoggingConfig` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
        }
    }
}

/// The fully assembled configuration the core runs against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub adaptive: AdaptiveConfig,
    pub runtime: RuntimeState,
    pub logging: LoggingConfig,
    pub database_url: String,
    pub redis_url: String,
}

/// Loads and (re)persists [`AppConfig`], grounded in `ConfigManager`'s
/// get-config-dir / initialize-on-first-run / load / save cycle.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Resolve the platform config directory, mirroring
    /// `ConfigManager::get_config_dir`.
    #[must_use]
    pub fn get_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pricewatch-core")
    }

    /// Build a manager rooted at the platform config directory.
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir();
        let config_path = config_dir.join("config.toml");
        Ok(Self { config_dir, config_path })
    }

    /// Create the config directory and a default config file if missing.
    pub fn initialize_on_first_run(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("failed to create config dir {:?}", self.config_dir))?;
        if !self.config_path.exists() {
            self.save(&AppConfig::default())?;
        }
        Ok(())
    }

    /// Load configuration: embedded defaults, overridden by the config
    /// file (if present), overridden by `SCANNER_`-prefixed env vars.
    pub fn load(&self) -> Result<AppConfig> {
        let defaults = toml::to_string(&AppConfig::default())
            .context("failed to serialise default config")?;

        let mut builder = ::config::Config::builder()
            .add_source(::config::File::from_str(&defaults, ::config::FileFormat::Toml));

        if self.config_path.exists() {
            builder = builder.add_source(::config::File::from(self.config_path.clone()));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("SCANNER")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().context("failed to build layered config")?;
        built.try_deserialize().context("failed to deserialize AppConfig")
    }

    /// Persist configuration back to the config file as TOML.
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(config).context("failed to serialise config")?;
        std::fs::write(&self.config_path, toml)
            .with_context(|| format!("failed to write {:?}", self.config_path))?;
        Ok(())
    }

    /// Path to the on-disk config file.
    #[must_use]
    pub fn config_path(&self) -> &std::path::Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_config_py() {
        let c = ScanConfig::default();
        assert_eq!(c.max_parallel_category_scans, 8);
        assert_eq!(c.max_parallel_pages_per_category, 2);
        assert_eq!(c.db_batch_update_size, 10);
        assert!((c.global_min_price - 50.0).abs() < f64::EPSILON);
        assert!((c.global_min_discount_percent - 50.0).abs() < f64::EPSILON);
        assert!((c.kids_low_price_max - 30.0).abs() < f64::EPSILON);
        assert_eq!(c.retailer_rate_limits.len(), 6);
        assert!((c.retailer_rate_limits["walmart"].min_s - 20.0).abs() < f64::EPSILON);
        assert_eq!(c.kids_exclude_skus["walmart"].len(), 5);
        assert!(c.kids_exclude_skus["walmart"].contains(&"5116478924".to_string()));
    }

    #[test]
    fn adaptive_defaults_match_spec() {
        let c = AdaptiveConfig::default();
        assert_eq!(c.dedupe_ttl_hours, 12);
        assert_eq!(c.cooldown_minutes, 60);
        assert_eq!(c.cross_source_ttl_seconds, 600);
        assert_eq!(c.proxy_max_consecutive_403s, 5);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = AppConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&s).unwrap();
        assert_eq!(back.scan.max_parallel_category_scans, cfg.scan.max_parallel_category_scans);
    }
}
