//! Engine configuration from environment variables.
//!
//! All knobs are optional and coerced leniently: a non-numeric value where a
//! positive integer is expected is ignored, matching the documented contract.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `MAX_DYNAMIC_TASKS` | default concurrency cap when a run does not set one |
//! | `RESULT_CACHE_MAX_ENTRIES` | LRU bound for the in-memory result cache |
//! | `PROCESS_POOL_MAX_WORKERS` | isolated worker pool size |
//! | `LOG_LEVEL` | default tracing filter |
//! | `DISABLE_STRUCTURED_LOGS` | `1`/`true` disables structured task logs |
//! | `WEFT_RESULT_CACHE` | `memory` (default) or `filesystem` |
//! | `WEFT_RESULT_CACHE_PATH` | filesystem cache root, default `.weft_cache` |
//! | `WEFT_ARTIFACT_STORE` | `memory` (default) or `filesystem` |
//! | `WEFT_ARTIFACT_STORE_PATH` | artifact root, default `.weft_artifacts` |

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_dynamic_tasks: Option<usize>,
    pub result_cache_max_entries: Option<usize>,
    pub process_pool_max_workers: Option<usize>,
    pub log_level: String,
    pub disable_structured_logs: bool,
    pub result_cache: StorageBackend,
    pub result_cache_path: PathBuf,
    pub artifact_store: StorageBackend,
    pub artifact_store_path: PathBuf,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            max_dynamic_tasks: positive_usize("MAX_DYNAMIC_TASKS"),
            result_cache_max_entries: positive_usize("RESULT_CACHE_MAX_ENTRIES"),
            process_pool_max_workers: positive_usize("PROCESS_POOL_MAX_WORKERS"),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            disable_structured_logs: truthy(std::env::var("DISABLE_STRUCTURED_LOGS").ok()),
            result_cache: backend("WEFT_RESULT_CACHE"),
            result_cache_path: path_var("WEFT_RESULT_CACHE_PATH", ".weft_cache"),
            artifact_store: backend("WEFT_ARTIFACT_STORE"),
            artifact_store_path: path_var("WEFT_ARTIFACT_STORE_PATH", ".weft_artifacts"),
        }
    }
}

static CONFIG: Lazy<RwLock<Arc<EngineConfig>>> =
    Lazy::new(|| RwLock::new(Arc::new(EngineConfig::from_env())));

/// The cached engine configuration.
pub fn config() -> Arc<EngineConfig> {
    Arc::clone(&CONFIG.read())
}

/// Re-read the environment. Used by tests and long-lived hosts.
pub fn reload() -> Arc<EngineConfig> {
    let fresh = Arc::new(EngineConfig::from_env());
    *CONFIG.write() = Arc::clone(&fresh);
    fresh
}

fn positive_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
}

fn truthy(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("True")
    )
}

fn backend(name: &str) -> StorageBackend {
    match std::env::var(name).as_deref() {
        Ok("filesystem") => StorageBackend::Filesystem,
        _ => StorageBackend::Memory,
    }
}

fn path_var(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn non_numeric_values_are_ignored() {
        std::env::set_var("MAX_DYNAMIC_TASKS", "plenty");
        std::env::set_var("RESULT_CACHE_MAX_ENTRIES", "-3");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_dynamic_tasks, None);
        assert_eq!(cfg.result_cache_max_entries, None);
        std::env::remove_var("MAX_DYNAMIC_TASKS");
        std::env::remove_var("RESULT_CACHE_MAX_ENTRIES");
    }

    #[test]
    #[serial]
    fn positive_integers_are_honored() {
        std::env::set_var("MAX_DYNAMIC_TASKS", "64");
        std::env::set_var("PROCESS_POOL_MAX_WORKERS", "4");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_dynamic_tasks, Some(64));
        assert_eq!(cfg.process_pool_max_workers, Some(4));
        std::env::remove_var("MAX_DYNAMIC_TASKS");
        std::env::remove_var("PROCESS_POOL_MAX_WORKERS");
    }

    #[test]
    #[serial]
    fn structured_log_toggle_accepts_truthy_spellings() {
        for v in ["1", "true", "True", "TRUE"] {
            std::env::set_var("DISABLE_STRUCTURED_LOGS", v);
            assert!(EngineConfig::from_env().disable_structured_logs, "value {v}");
        }
        std::env::set_var("DISABLE_STRUCTURED_LOGS", "yes");
        assert!(!EngineConfig::from_env().disable_structured_logs);
        std::env::remove_var("DISABLE_STRUCTURED_LOGS");
    }

    #[test]
    #[serial]
    fn reload_sees_new_environment() {
        std::env::set_var("WEFT_RESULT_CACHE", "filesystem");
        std::env::set_var("WEFT_RESULT_CACHE_PATH", "/tmp/weft-test-cache");
        let cfg = reload();
        assert_eq!(cfg.result_cache, StorageBackend::Filesystem);
        assert_eq!(cfg.result_cache_path, PathBuf::from("/tmp/weft-test-cache"));
        std::env::remove_var("WEFT_RESULT_CACHE");
        std::env::remove_var("WEFT_RESULT_CACHE_PATH");
        let cfg = reload();
        assert_eq!(cfg.result_cache, StorageBackend::Memory);
    }
}
