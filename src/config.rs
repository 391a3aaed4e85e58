//! Configuration related structures.
//!
//! `Config` is an immutable value built once at startup and shared by
//! reference with every component constructor. Defaults are deliberately
//! restrictive: the exec whitelist starts empty (all commands denied) and
//! common secret-bearing paths are excluded.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Getters, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    #[get = "pub"]
    /// Absolute path to the mediated repository.
    repo_root: PathBuf,

    #[get_copy = "pub"]
    /// Largest file the open verb will return, in bytes.
    max_read_size: u64,

    #[get_copy = "pub"]
    /// Largest body the write verb will accept, in bytes.
    max_write_size: u64,

    #[get = "pub"]
    /// Exclusion patterns: basename globs or repo-relative directory
    /// prefixes.
    exclude_patterns: Vec<String>,

    #[get = "pub"]
    /// Extensions the write verb may touch. Empty accepts everything.
    allowed_write_extensions: Vec<String>,

    #[get_copy = "pub"]
    /// Copy existing files aside before overwriting them.
    backup_on_write: bool,

    #[get = "pub"]
    /// Exec whitelist entries (command prefixes).
    exec_whitelist: Vec<String>,

    #[get = "pub"]
    /// Image for exec-verb containers.
    exec_image: String,

    #[get = "pub"]
    /// Memory limit for exec containers, suffixed (`512m`, `1g`).
    exec_memory: String,

    #[get_copy = "pub"]
    /// CPU count for exec containers.
    exec_cpus: u32,

    #[get_copy = "pub"]
    /// Wall-clock limit for exec containers, in seconds.
    exec_timeout_secs: u64,

    #[get = "pub"]
    /// Image for I/O-verb containers.
    io_image: String,

    #[get = "pub"]
    /// Memory limit for I/O containers.
    io_memory: String,

    #[get_copy = "pub"]
    /// CPU count for I/O containers.
    io_cpus: u32,

    #[get_copy = "pub"]
    /// Wall-clock limit for I/O containers, in seconds.
    io_timeout_secs: u64,

    #[get = "pub"]
    /// Path to the container daemon socket.
    docker_socket: PathBuf,

    #[get = "pub"]
    /// Path to the append-only audit log.
    audit_log: PathBuf,

    #[get_copy = "pub"]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[get = "pub"]
    /// Container pool configuration.
    pool: PoolSettings,

    #[get = "pub"]
    /// Semantic search configuration; `None` disables the verb.
    search: Option<SearchSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::new(),
            max_read_size: 1024 * 1024,
            max_write_size: 1024 * 1024,
            exclude_patterns: [".git", "*.env", "*.key", "*.pem", "node_modules", "target"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_write_extensions: Vec::new(),
            backup_on_write: true,
            exec_whitelist: Vec::new(),
            exec_image: "alpine:3.20".into(),
            exec_memory: "512m".into(),
            exec_cpus: 1,
            exec_timeout_secs: 30,
            io_image: "alpine:3.20".into(),
            io_memory: "256m".into(),
            io_cpus: 1,
            io_timeout_secs: 10,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            audit_log: PathBuf::from("audit.log"),
            log_level: LevelFilter::Info,
            pool: PoolSettings::default(),
            search: None,
        }
    }
}

impl Config {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Configuration for the pre-warmed container pool.
#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Getters, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolSettings {
    #[get_copy = "pub"]
    /// Hard upper bound on concurrently tracked containers.
    size: usize,

    #[get_copy = "pub"]
    /// Uses before a container is recycled.
    max_uses_per_container: u32,

    #[get_copy = "pub"]
    /// Reap idle containers after this many seconds; 0 disables reaping.
    idle_timeout_secs: u64,

    #[get_copy = "pub"]
    /// Interval of the health/idle loop in seconds; 0 disables it.
    health_check_interval_secs: u64,

    #[get_copy = "pub"]
    /// Containers pre-warmed at construction, clamped to `size`.
    startup_containers: usize,

    #[get = "pub"]
    /// Image for pooled shell-host containers.
    image: String,

    #[get = "pub"]
    /// Memory limit for pooled containers.
    memory: String,

    #[get_copy = "pub"]
    /// CPU count for pooled containers.
    cpus: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 3,
            max_uses_per_container: 10,
            idle_timeout_secs: 300,
            health_check_interval_secs: 30,
            startup_containers: 0,
            image: "alpine:3.20".into(),
            memory: "512m".into(),
            cpus: 1,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Configuration of the semantic search collaborators.
#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Getters, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case", default)]
pub struct SearchSettings {
    #[get = "pub"]
    /// Base URL of the embedding service; `/api/embeddings` is appended.
    endpoint: String,

    #[get = "pub"]
    /// Embedding model name.
    model: String,

    #[get_copy = "pub"]
    /// Expected embedding dimensionality.
    dimensions: usize,

    #[get = "pub"]
    /// Directory of the on-disk vector index.
    index_path: PathBuf,

    #[get_copy = "pub"]
    /// Hit-list cutoff for formatted results.
    max_results: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".into(),
            model: "nomic-embed-text".into(),
            dimensions: 768,
            index_path: PathBuf::from(".toolgate/index"),
            max_results: 10,
        }
    }
}
