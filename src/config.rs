use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to (default: 0.0.0.0:3000)
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    /// Path to the route directory data file (default: routes.yaml)
    #[serde(default = "Config::default_routes_file")]
    pub routes_file: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Position/ETA engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Tuning knobs for the position and ETA estimation engine.
///
/// All thresholds are policy choices calibrated against typical mobile-GPS
/// behavior; override them per deployment rather than editing code.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// EWMA weight for new speed readings (default: 0.3)
    #[serde(default = "EngineConfig::default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Minimum effective speed in km/h used for ETA division (default: 5.0)
    #[serde(default = "EngineConfig::default_min_speed_kmh")]
    pub min_speed_kmh: f64,
    /// Below this speed a freshly reporting bus counts as idle (default: 3.0)
    #[serde(default = "EngineConfig::default_idle_speed_kmh")]
    pub idle_speed_kmh: f64,
    /// Upper bound on plausible travel speed between two fixes in km/h
    /// (default: 150.0). Guards against GPS jumps.
    #[serde(default = "EngineConfig::default_max_plausible_speed_kmh")]
    pub max_plausible_speed_kmh: f64,
    /// Seconds without a fix before an active bus is demoted to idle
    /// (default: 90)
    #[serde(default = "EngineConfig::default_idle_after_secs")]
    pub idle_after_secs: u64,
    /// Seconds without a fix before a bus is marked offline (default: 180)
    #[serde(default = "EngineConfig::default_offline_after_secs")]
    pub offline_after_secs: u64,
    /// Seconds an offline bus is retained before its record is dropped
    /// (default: 1800)
    #[serde(default = "EngineConfig::default_retention_secs")]
    pub retention_secs: u64,
    /// Interval of the staleness sweep in seconds (default: 20)
    #[serde(default = "EngineConfig::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Window in seconds within which fixes count as fresh live signal
    /// (default: 120)
    #[serde(default = "EngineConfig::default_fresh_window_secs")]
    pub fresh_window_secs: u64,
    /// Seconds of signal silence after which estimation blends in the
    /// schedule (default: 30)
    #[serde(default = "EngineConfig::default_hybrid_after_secs")]
    pub hybrid_after_secs: u64,
    /// Spread between recent speed readings in km/h that counts as volatile
    /// (default: 25.0)
    #[serde(default = "EngineConfig::default_speed_volatility_kmh")]
    pub speed_volatility_kmh: f64,
    /// Milliseconds to coalesce bursts of fixes for one bus (default: 1000)
    #[serde(default = "EngineConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Seconds a computed ETA set may be served from cache (default: 3)
    #[serde(default = "EngineConfig::default_eta_cache_secs")]
    pub eta_cache_secs: u64,
    /// Radius in km within which a bus is reported as arriving now
    /// (default: 0.15)
    #[serde(default = "EngineConfig::default_arriving_radius_km")]
    pub arriving_radius_km: f64,
    /// Minimum ETA shift in seconds that triggers a stop broadcast
    /// (default: 30)
    #[serde(default = "EngineConfig::default_eta_delta_secs")]
    pub eta_delta_secs: i64,
    /// GPS accuracy in meters at which confidence bottoms out (default: 50.0)
    #[serde(default = "EngineConfig::default_accuracy_floor_m")]
    pub accuracy_floor_m: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: Self::default_ewma_alpha(),
            min_speed_kmh: Self::default_min_speed_kmh(),
            idle_speed_kmh: Self::default_idle_speed_kmh(),
            max_plausible_speed_kmh: Self::default_max_plausible_speed_kmh(),
            idle_after_secs: Self::default_idle_after_secs(),
            offline_after_secs: Self::default_offline_after_secs(),
            retention_secs: Self::default_retention_secs(),
            sweep_interval_secs: Self::default_sweep_interval_secs(),
            fresh_window_secs: Self::default_fresh_window_secs(),
            hybrid_after_secs: Self::default_hybrid_after_secs(),
            speed_volatility_kmh: Self::default_speed_volatility_kmh(),
            debounce_ms: Self::default_debounce_ms(),
            eta_cache_secs: Self::default_eta_cache_secs(),
            arriving_radius_km: Self::default_arriving_radius_km(),
            eta_delta_secs: Self::default_eta_delta_secs(),
            accuracy_floor_m: Self::default_accuracy_floor_m(),
        }
    }
}

impl EngineConfig {
    fn default_ewma_alpha() -> f64 {
        0.3
    }
    fn default_min_speed_kmh() -> f64 {
        5.0
    }
    fn default_idle_speed_kmh() -> f64 {
        3.0
    }
    fn default_max_plausible_speed_kmh() -> f64 {
        150.0
    }
    fn default_idle_after_secs() -> u64 {
        90
    }
    fn default_offline_after_secs() -> u64 {
        180
    }
    fn default_retention_secs() -> u64 {
        1800
    }
    fn default_sweep_interval_secs() -> u64 {
        20
    }
    fn default_fresh_window_secs() -> u64 {
        120
    }
    fn default_hybrid_after_secs() -> u64 {
        30
    }
    fn default_speed_volatility_kmh() -> f64 {
        25.0
    }
    fn default_debounce_ms() -> u64 {
        1000
    }
    fn default_eta_cache_secs() -> u64 {
        3
    }
    fn default_arriving_radius_km() -> f64 {
        0.15
    }
    fn default_eta_delta_secs() -> i64 {
        30
    }
    fn default_accuracy_floor_m() -> f64 {
        50.0
    }

    /// Panic early on values that would silently break estimation.
    pub fn validate(&self) {
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            panic!("engine.ewma_alpha must be within [0, 1]");
        }
        if self.min_speed_kmh <= 0.0 {
            panic!("engine.min_speed_kmh must be positive");
        }
        if self.idle_after_secs >= self.offline_after_secs {
            panic!("engine.idle_after_secs must be below engine.offline_after_secs");
        }
        if self.hybrid_after_secs >= self.fresh_window_secs {
            panic!("engine.hybrid_after_secs must be below engine.fresh_window_secs");
        }
        if self.arriving_radius_km < 0.0 {
            panic!("engine.arriving_radius_km must not be negative");
        }
    }
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    fn default_routes_file() -> String {
        "routes.yaml".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_pass_validation() {
        EngineConfig::default().validate();
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("cors_permissive: true").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.routes_file, "routes.yaml");
        assert_eq!(config.engine.idle_after_secs, 90);
        assert_eq!(config.engine.offline_after_secs, 180);
        assert!(config.cors_origins.is_empty());
    }

    #[test]
    fn engine_overrides_are_applied() {
        let yaml = r#"
cors_permissive: true
engine:
  ewma_alpha: 0.5
  debounce_ms: 250
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.ewma_alpha, 0.5);
        assert_eq!(config.engine.debounce_ms, 250);
        // Untouched knobs keep their defaults
        assert_eq!(config.engine.min_speed_kmh, 5.0);
    }

    #[test]
    #[should_panic(expected = "idle_after_secs")]
    fn validation_rejects_inverted_staleness_windows() {
        let engine = EngineConfig {
            idle_after_secs: 300,
            offline_after_secs: 180,
            ..EngineConfig::default()
        };
        engine.validate();
    }
}
