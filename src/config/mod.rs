//! Configuration module for the bulletin backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::AccessMask;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for topics, users, schema configs, bodies and the index
    pub base_path: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Mask applied when a topic grants nothing to the principal
    pub default_mask: AccessMask,
    /// Run exporters and importers
    pub io_enabled: bool,
    /// Never enter DIRTY mode (test installs)
    pub ignore_dirty: bool,
    /// Topic that receives imported messages naming unknown topics
    pub import_emergency_topic: String,
    /// Period of the export retry sweep
    pub export_retry_interval: Duration,
    /// Sweeps after which a failing export is abandoned; 0 retries forever
    pub export_max_attempts: u32,
    /// Post a notice message once startup completes
    pub post_init_message: bool,
    /// Write the topic tree report at startup
    pub create_reports: bool,
    /// Post import and export failures as messages to `debug_topic`
    pub post_exceptions: bool,
    /// Topic that receives failure reports
    pub debug_topic: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let base_path = env::var("BULLETIN_BASE_PATH")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let log_level = env::var("BULLETIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let default_mask = parse_mask(
            &env::var("BULLETIN_ALL_MASK").unwrap_or_else(|_| "100".to_string()),
        );

        let io_enabled = parse_flag("BULLETIN_IO_ENABLED", true);
        let ignore_dirty = parse_flag("BULLETIN_IGNORE_DIRTY", false);

        let import_emergency_topic = env::var("BULLETIN_IMPORT_EMERGENCY_TOPIC")
            .unwrap_or_else(|_| "SYSTEM.IMPORT_EM".to_string());

        let export_retry_interval = Duration::from_secs(
            env::var("BULLETIN_EXPORT_RETRY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        );

        let export_max_attempts = env::var("BULLETIN_EXPORT_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let post_init_message = parse_flag("BULLETIN_POST_INIT", false);
        let create_reports = parse_flag("BULLETIN_CREATE_REPORTS", true);

        let post_exceptions = parse_flag("BULLETIN_DEBUG_POST_EXCEPTIONS", false);
        let debug_topic =
            env::var("BULLETIN_DEBUG_TOPIC").unwrap_or_else(|_| "SYSTEM.DEBUG".to_string());

        Self {
            base_path,
            log_level,
            default_mask,
            io_enabled,
            ignore_dirty,
            import_emergency_topic,
            export_retry_interval,
            export_max_attempts,
            post_init_message,
            create_reports,
            post_exceptions,
            debug_topic,
        }
    }

    /// Configuration rooted at `base_path` with defaults suitable for tests.
    pub fn for_base(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            log_level: "debug".to_string(),
            default_mask: AccessMask::READ_ONLY,
            io_enabled: true,
            ignore_dirty: false,
            import_emergency_topic: "SYSTEM.IMPORT_EM".to_string(),
            export_retry_interval: Duration::from_secs(120),
            export_max_attempts: 30,
            post_init_message: false,
            create_reports: false,
            post_exceptions: false,
            debug_topic: "SYSTEM.DEBUG".to_string(),
        }
    }
}

fn parse_mask(raw: &str) -> AccessMask {
    raw.parse().unwrap_or_else(|e| {
        tracing::warn!("BULLETIN_ALL_MASK rejected ({}), using 100", e);
        AccessMask::READ_ONLY
    })
}

fn parse_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccessMode;

    #[test]
    fn test_default_config() {
        // Clear any existing env vars
        env::remove_var("BULLETIN_BASE_PATH");
        env::remove_var("BULLETIN_LOG_LEVEL");
        env::remove_var("BULLETIN_ALL_MASK");
        env::remove_var("BULLETIN_IO_ENABLED");
        env::remove_var("BULLETIN_IGNORE_DIRTY");
        env::remove_var("BULLETIN_EXPORT_RETRY_SECS");
        env::remove_var("BULLETIN_EXPORT_MAX_ATTEMPTS");
        env::remove_var("BULLETIN_DEBUG_POST_EXCEPTIONS");
        env::remove_var("BULLETIN_DEBUG_TOPIC");

        let config = Config::from_env();

        assert_eq!(config.base_path, PathBuf::from("./data"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.default_mask, AccessMask::READ_ONLY);
        assert!(config.io_enabled);
        assert!(!config.ignore_dirty);
        assert_eq!(config.export_retry_interval, Duration::from_secs(120));
        assert_eq!(config.export_max_attempts, 30);
        assert!(!config.post_exceptions);
        assert_eq!(config.debug_topic, "SYSTEM.DEBUG");
    }

    #[test]
    fn test_invalid_mask_falls_back_to_read_only() {
        let mask = parse_mask("1x1");
        assert!(mask.allows(AccessMode::Read));
        assert!(!mask.allows(AccessMode::Post));
        assert_eq!(parse_mask("110"), AccessMask::READ_WRITE);
    }
}
