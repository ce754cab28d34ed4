//! Environment configuration.
//!
//! Every knob the server understands comes from the environment, so a
//! deployment is fully described by its env block.

use std::path::PathBuf;

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_READ_CONCURRENCY: usize = 4;
pub const DEFAULT_FS_CACHE_SIZE: usize = 64;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 600;

/// Length of the directory prefix used to shard chunk blobs on disk.
pub const CHUNK_DIR_LENGTH: usize = 8;

#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory for chunk blobs.
    pub data_dir: PathBuf,
    /// SQLite database file; defaults to `<data_dir>/chunkhub.db`.
    pub db_path: PathBuf,
    /// URL of the external permission service; empty disables checks.
    pub auth_validation: String,
    /// Upstream master instances for federated reads.
    pub masters: Vec<String>,
    /// Permits for the mutating-operation gate.
    pub read_concurrency: usize,
    /// When false, incoming chunks are verified but never persisted.
    pub save_chunks: bool,
    /// Shared secret for internal endpoints; empty disables the check.
    pub internal_key: String,
    /// Seconds between garbage collection sweeps.
    pub gc_interval_secs: u64,
    /// Max entries in the materialized-FS cache.
    pub fs_cache_size: usize,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("DATA_DIR", DEFAULT_DATA_DIR));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("chunkhub.db"));

        Self {
            db_path,
            auth_validation: std::env::var("AUTH_VALIDATION").unwrap_or_default(),
            masters: split_masters(&std::env::var("MASTERS").unwrap_or_default()),
            read_concurrency: parse_or("READ_CONCURRENCY", DEFAULT_READ_CONCURRENCY),
            save_chunks: !env_is_true("DO_NOT_SAVE_CHUNKS"),
            internal_key: std::env::var("INTERNAL_KEY").unwrap_or_default(),
            gc_interval_secs: parse_or("GC_INTERVAL_SECS", DEFAULT_GC_INTERVAL_SECS),
            fs_cache_size: parse_or("FS_CACHE_SIZE", DEFAULT_FS_CACHE_SIZE),
            host: env_or("HOST", "0.0.0.0"),
            port: parse_or("PORT", 8082),
            data_dir,
        }
    }

    pub fn has_masters(&self) -> bool {
        !self.masters.is_empty()
    }

    /// Directive for the tracing subscriber when RUST_LOG is not set.
    pub fn log_directives() -> String {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                return format!("chunkhub={},tower_http={}", level, level);
            }
        }
        if env_is_true("DEBUG") {
            "chunkhub=debug,tower_http=debug".to_string()
        } else {
            "chunkhub=info".to_string()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_is_true(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_masters(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_masters() {
        assert!(split_masters("").is_empty());
        assert_eq!(
            split_masters("http://a:8082,http://b:8082/"),
            vec!["http://a:8082", "http://b:8082"]
        );
        assert_eq!(split_masters(" http://a , "), vec!["http://a"]);
    }
}
