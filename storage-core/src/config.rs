//! Initialization options and recognized environment flags. Configuration
//! is by initialization options and recognized environment flags, not a
//! config file.

use serde_derive::{Deserialize, Serialize};

/// Options read by `SecurityCoordinator::init` and threaded down into the
/// subsystems it brings up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitOptions {
    pub require_secure_context: bool,
    pub auto_cleanup_enabled: bool,
    pub poll_interval_ms: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub fallback_quota_bytes: u64,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            require_secure_context: true,
            auto_cleanup_enabled: true,
            poll_interval_ms: 60_000,
            warning_threshold: 0.80,
            critical_threshold: 0.95,
            fallback_quota_bytes: 50 * 1024 * 1024,
        }
    }
}

impl InitOptions {
    /// Overlays recognized environment flags onto the defaults. Unknown or
    /// unset variables are left at their default value.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(v) = std::env::var("STORAGE_REQUIRE_SECURE_CONTEXT") {
            opts.require_secure_context = parse_bool(&v, opts.require_secure_context);
        }
        if let Ok(v) = std::env::var("STORAGE_AUTO_CLEANUP_ENABLED") {
            opts.auto_cleanup_enabled = parse_bool(&v, opts.auto_cleanup_enabled);
        }
        if let Ok(v) = std::env::var("STORAGE_POLL_INTERVAL_MS") {
            if let Ok(parsed) = v.parse() {
                opts.poll_interval_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("STORAGE_WARNING_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                opts.warning_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("STORAGE_CRITICAL_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                opts.critical_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("STORAGE_FALLBACK_QUOTA_BYTES") {
            if let Ok(parsed) = v.parse() {
                opts.fallback_quota_bytes = parsed;
            }
        }
        opts
    }
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// `KeyManager` tuning, split out from `InitOptions` since it is only ever
/// read by `key_manager::KeyManager::initialize_session`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeyManagerOptions {
    /// PBKDF2 iteration count. Default 600,000 (Open Question 3: the higher
    /// of the two observed counts). Can be lowered to a documented floor of
    /// 100,000 for constrained test environments, never below it.
    pub kdf_iterations: u32,
}

pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

impl Default for KeyManagerOptions {
    fn default() -> Self {
        Self { kdf_iterations: DEFAULT_KDF_ITERATIONS }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = InitOptions::default();
        assert!(opts.require_secure_context);
        assert_eq!(opts.poll_interval_ms, 60_000);
        assert_eq!(opts.fallback_quota_bytes, 50 * 1024 * 1024);
        assert!(opts.warning_threshold < opts.critical_threshold);
    }

    #[test]
    fn key_manager_defaults_to_600k_iterations() {
        assert_eq!(KeyManagerOptions::default().kdf_iterations, DEFAULT_KDF_ITERATIONS);
    }
}
