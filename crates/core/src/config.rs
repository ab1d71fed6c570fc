//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon / embedded-instance configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen address for client connections (e.g., "127.0.0.1:22002").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory holding the cache file and the blocks database.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Size of the local cache file in bytes.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// Block size used when creating new containers.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Block-id width used when creating new containers.
    #[serde(default = "default_name_bytes")]
    pub name_bytes: usize,
    /// Maximum number of outstanding HTTP requests.
    #[serde(default = "default_n_request")]
    pub n_request: usize,
    /// Maximum number of concurrent block uploads.
    #[serde(default = "default_n_write")]
    pub n_write: usize,
    /// Interval between automatic polls of attached containers (0 disables).
    #[serde(default)]
    pub poll_secs: u64,
    /// Minimum age of a GC-listed block before cleanup deletes it.
    #[serde(default = "default_delete_secs")]
    pub delete_secs: u64,
    /// Interval between automatic cleanup runs (0 disables).
    #[serde(default = "default_gc_secs")]
    pub gc_secs: u64,
    /// Per-request timeout for storage operations.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Retry schedule for failed storage requests.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_bind() -> String {
    "127.0.0.1:22002".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from("./bcv")
}

fn default_cache_size() -> u64 {
    crate::DEFAULT_CACHE_SIZE
}

fn default_block_size() -> u32 {
    crate::DEFAULT_BLOCK_SIZE
}

fn default_name_bytes() -> usize {
    crate::DEFAULT_NAME_BYTES
}

fn default_n_request() -> usize {
    6
}

fn default_n_write() -> usize {
    10
}

fn default_delete_secs() -> u64 {
    3600 // 1 hour
}

fn default_gc_secs() -> u64 {
    3600 // 1 hour
}

fn default_http_timeout_secs() -> u64 {
    600 // 10 minutes
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            directory: default_directory(),
            cache_size: default_cache_size(),
            block_size: default_block_size(),
            name_bytes: default_name_bytes(),
            n_request: default_n_request(),
            n_write: default_n_write(),
            poll_secs: 0,
            delete_secs: default_delete_secs(),
            gc_secs: default_gc_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.** Uses 64 KiB blocks, a 16-slot cache and a retry
    /// schedule without delays.
    pub fn for_testing(dir: impl AsRef<Path>) -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            directory: dir.as_ref().to_path_buf(),
            cache_size: 16 * 64 * 1024,
            block_size: 64 * 1024,
            name_bytes: 24,
            gc_secs: 0,
            retry: RetryConfig {
                delays_ms: vec![0, 0, 0],
                max_auth_retries: 1,
            },
            ..Self::default()
        }
    }

    /// Path of the local cache file.
    pub fn cache_file_path(&self) -> PathBuf {
        self.directory.join(crate::CACHEFILE_NAME)
    }

    /// Path of the local blocks database.
    pub fn blocksdb_path(&self) -> PathBuf {
        self.directory.join(crate::BLOCKSDB_NAME)
    }

    /// Per-request timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=crate::MAX_REQUESTS).contains(&self.n_request) {
            return Err(format!(
                "n_request {} must be between 1 and {}",
                self.n_request,
                crate::MAX_REQUESTS
            ));
        }
        if self.n_write == 0 {
            return Err("n_write must be at least 1".to_string());
        }
        if self.block_size == 0 {
            return Err("block_size must be non-zero".to_string());
        }
        if !(crate::MIN_NAME_BYTES..=crate::MAX_NAME_BYTES).contains(&self.name_bytes) {
            return Err(format!(
                "name_bytes {} must be between {} and {}",
                self.name_bytes,
                crate::MIN_NAME_BYTES,
                crate::MAX_NAME_BYTES
            ));
        }
        if self.cache_size < u64::from(self.block_size) {
            return Err(format!(
                "cache_size {} is smaller than one block ({} bytes)",
                self.cache_size, self.block_size
            ));
        }
        self.retry.validate()
    }
}

/// Retry schedule for storage requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before each successive retry; its length bounds the retry count.
    #[serde(default = "default_retry_delays_ms")]
    pub delays_ms: Vec<u64>,
    /// Number of re-authentication retries after a 403 response.
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![0, 500, 1000, 2000, 4000, 8000]
}

fn default_max_auth_retries() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delays_ms: default_retry_delays_ms(),
            max_auth_retries: default_max_auth_retries(),
        }
    }
}

impl RetryConfig {
    /// Validate the retry schedule.
    pub fn validate(&self) -> Result<(), String> {
        if self.delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!(
                "retry.delays_ms must be non-decreasing, got {:?}",
                self.delays_ms
            ));
        }
        Ok(())
    }
}

/// Storage module selected by an attach request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Containers are directories below `root`.
    Filesystem {
        /// Root directory for containers.
        root: PathBuf,
    },
    /// In-process account, shared by name through the storage opener.
    Memory {
        /// Account name.
        account: String,
    },
    /// S3-compatible storage; containers are buckets.
    S3 {
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix inside each bucket.
        prefix: Option<String>,
        /// Access key id. The secret arrives as the attach auth string.
        access_key_id: Option<String>,
        /// Secret access key.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Build a storage configuration from the `storage` and `account`
    /// strings of an attach request.
    ///
    /// `storage` is a module name optionally followed by `?key=value&...`
    /// parameters, e.g. `s3?endpoint=http://minio:9000&region=eu-west-1`.
    pub fn from_attach(storage: &str, account: &str) -> Result<Self, String> {
        let (module, params) = parse_module_spec(storage)?;
        let param = |key: &str| params.get(key).cloned();
        match module.as_str() {
            "file" | "filesystem" => {
                let root = param("root").unwrap_or_else(|| account.to_string());
                if root.is_empty() {
                    return Err("filesystem storage requires a root directory".to_string());
                }
                Ok(Self::Filesystem {
                    root: PathBuf::from(root),
                })
            }
            "memory" => Ok(Self::Memory {
                account: account.to_string(),
            }),
            "s3" => Ok(Self::S3 {
                endpoint: param("endpoint"),
                region: param("region"),
                prefix: param("prefix"),
                access_key_id: (!account.is_empty()).then(|| account.to_string()),
                secret_access_key: None,
                force_path_style: param("force_path_style")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            }),
            other => Err(format!("unknown storage module: {other}")),
        }
    }

    /// Short module name, as used in log fields.
    pub fn module_name(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::Memory { .. } => "memory",
            Self::S3 { .. } => "s3",
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

fn parse_module_spec(spec: &str) -> Result<(String, BTreeMap<String, String>), String> {
    let (module, query) = match spec.split_once('?') {
        Some((m, q)) => (m, q),
        None => (spec, ""),
    };
    if module.is_empty() {
        return Err("empty storage module name".to_string());
    }
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| format!("malformed storage parameter: {pair}"))?;
        params.insert(k.to_string(), v.to_string());
    }
    Ok((module.to_ascii_lowercase(), params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.n_request, 6);
        assert_eq!(config.block_size, 4 * 1024 * 1024);
        assert_eq!(config.cache_size, 1024 * 1024 * 1024);
        assert_eq!(config.retry.delays_ms, vec![0, 500, 1000, 2000, 4000, 8000]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_daemon_config_deserialize_partial() {
        let json = r#"{"n_request": 12, "directory": "/tmp/bcv"}"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.n_request, 12);
        assert_eq!(config.directory, PathBuf::from("/tmp/bcv"));
        assert_eq!(config.delete_secs, 3600);
    }

    #[test]
    fn test_daemon_config_rejects_too_many_requests() {
        let config = DaemonConfig {
            n_request: 33,
            ..DaemonConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("n_request"));
    }

    #[test]
    fn test_daemon_config_rejects_tiny_cache() {
        let config = DaemonConfig {
            cache_size: 1024,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_from_attach_filesystem() {
        let config = StorageConfig::from_attach("file", "/srv/containers").unwrap();
        assert_eq!(
            config,
            StorageConfig::Filesystem {
                root: PathBuf::from("/srv/containers")
            }
        );
        assert!(StorageConfig::from_attach("file", "").is_err());
    }

    #[test]
    fn test_storage_from_attach_s3_params() {
        let config = StorageConfig::from_attach(
            "s3?endpoint=http://localhost:9000&region=eu-west-1&force_path_style=1",
            "AKIA",
        )
        .unwrap();
        match config {
            StorageConfig::S3 {
                endpoint,
                region,
                access_key_id,
                force_path_style,
                ..
            } => {
                assert_eq!(endpoint.as_deref(), Some("http://localhost:9000"));
                assert_eq!(region.as_deref(), Some("eu-west-1"));
                assert_eq!(access_key_id.as_deref(), Some("AKIA"));
                assert!(force_path_style);
            }
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_storage_from_attach_unknown_module() {
        assert!(StorageConfig::from_attach("azure", "acct").is_err());
        assert!(StorageConfig::from_attach("s3?bad", "acct").is_err());
    }

    #[test]
    fn test_storage_config_s3_roundtrip_json() {
        let config = StorageConfig::S3 {
            endpoint: Some("http://localhost:9000".to_string()),
            region: None,
            prefix: Some("cache".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"s3\""));
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_retry_config_rejects_decreasing_delays() {
        let retry = RetryConfig {
            delays_ms: vec![0, 1000, 500],
            max_auth_retries: 1,
        };
        assert!(retry.validate().is_err());
    }
}
