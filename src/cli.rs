//! Command line parsing and configuration loading.
//!
//! Precedence: explicit flags (and their environment fallbacks) override
//! config-file values, which override the built-in defaults. The resolved
//! [`Config`] itself stays a plain immutable value.

use crate::config::{
    Config, ConfigBuilder, PoolSettingsBuilder, SearchSettings, SearchSettingsBuilder,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "toolgate",
    version,
    about = "Sandboxed mediation runtime for LLM-driven repository tooling",
    after_help = "The exec whitelist is a prefix policy: an entry `go` admits \
                  any command whose base token starts with `go`, including \
                  `gotest`. The container is the security boundary."
)]
pub struct Opts {
    /// TOML configuration file; flags override its values.
    #[arg(long, env = "TOOLGATE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Repository root to mediate.
    #[arg(long, env = "TOOLGATE_REPO_ROOT", value_name = "PATH")]
    pub repo_root: Option<PathBuf>,

    /// Largest readable file in bytes.
    #[arg(long = "max-size", value_name = "BYTES")]
    pub max_size: Option<u64>,

    /// Largest writable body in bytes.
    #[arg(long = "max-write-size", value_name = "BYTES")]
    pub max_write_size: Option<u64>,

    /// Allowed write extensions, comma separated. Empty allows everything.
    #[arg(long = "allowed-extensions", value_delimiter = ',', value_name = "EXT")]
    pub allowed_extensions: Option<Vec<String>>,

    /// Exclusion pattern (basename glob or directory prefix); repeatable.
    #[arg(long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Exec whitelist entries, comma separated.
    #[arg(long = "whitelist", value_delimiter = ',', value_name = "CMD")]
    pub whitelist: Option<Vec<String>>,

    /// Image for exec containers.
    #[arg(long = "exec-image", value_name = "IMAGE")]
    pub exec_image: Option<String>,

    /// Exec wall-clock timeout in seconds.
    #[arg(long = "exec-timeout", value_name = "SECS")]
    pub exec_timeout: Option<u64>,

    /// Exec memory limit (suffixed, e.g. 512m).
    #[arg(long = "exec-memory", value_name = "LIMIT")]
    pub exec_memory: Option<String>,

    /// Exec CPU count.
    #[arg(long = "exec-cpus", value_name = "N")]
    pub exec_cpus: Option<u32>,

    /// Image for I/O containers.
    #[arg(long = "io-image", value_name = "IMAGE")]
    pub io_image: Option<String>,

    /// I/O wall-clock timeout in seconds.
    #[arg(long = "io-timeout", value_name = "SECS")]
    pub io_timeout: Option<u64>,

    /// I/O memory limit.
    #[arg(long = "io-memory", value_name = "LIMIT")]
    pub io_memory: Option<String>,

    /// I/O CPU count.
    #[arg(long = "io-cpus", value_name = "N")]
    pub io_cpus: Option<u32>,

    /// Container pool size.
    #[arg(long = "pool-size", value_name = "N")]
    pub pool_size: Option<usize>,

    /// Uses before a pooled container is recycled.
    #[arg(long = "pool-max-uses", value_name = "N")]
    pub pool_max_uses: Option<u32>,

    /// Idle reap timeout for pooled containers in seconds (0 disables).
    #[arg(long = "pool-idle-timeout", value_name = "SECS")]
    pub pool_idle_timeout: Option<u64>,

    /// Pool health-check interval in seconds (0 disables).
    #[arg(long = "pool-health-interval", value_name = "SECS")]
    pub pool_health_interval: Option<u64>,

    /// Containers pre-warmed at startup.
    #[arg(long = "pool-startup", value_name = "N")]
    pub pool_startup: Option<usize>,

    /// Embedding service base URL; enables the search verb.
    #[arg(long = "search-endpoint", value_name = "URL")]
    pub search_endpoint: Option<String>,

    /// Embedding model name.
    #[arg(long = "search-model", value_name = "MODEL")]
    pub search_model: Option<String>,

    /// Embedding dimensionality.
    #[arg(long = "search-dimensions", value_name = "N")]
    pub search_dimensions: Option<usize>,

    /// Vector index directory, relative to the repository root.
    #[arg(long = "search-index", value_name = "PATH")]
    pub search_index: Option<PathBuf>,

    /// Hit-list cutoff for search results.
    #[arg(long = "search-max-results", value_name = "N")]
    pub search_max_results: Option<usize>,

    /// Audit log file.
    #[arg(long = "audit-log", env = "TOOLGATE_AUDIT_LOG", value_name = "FILE")]
    pub audit_log: Option<PathBuf>,

    /// Container daemon socket.
    #[arg(long = "docker-sock", value_name = "PATH")]
    pub docker_sock: Option<PathBuf>,

    /// Read commands from this file instead of stdin.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Write output frames to this file instead of stdout.
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Force reading from stdin even when --input is configured.
    #[arg(long)]
    pub interactive: bool,

    /// Shorthand for --log-level debug.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// The logging level of the application.
    #[arg(long = "log-level", env = "TOOLGATE_LOG_LEVEL", value_name = "LEVEL")]
    pub log_level: Option<LevelFilter>,
}

/// Parse the command line, merge the optional config file and produce the
/// immutable [`Config`].
pub fn load() -> Result<(Config, Opts)> {
    let opts = Opts::parse();
    let config = resolve(&opts)?;
    Ok((config, opts))
}

/// Merge flags over file values over defaults.
pub fn resolve(opts: &Opts) -> Result<Config> {
    let base = match &opts.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("parse config file {}", path.display()))?
        }
        None => Config::default(),
    };

    let repo_root = opts
        .repo_root
        .clone()
        .unwrap_or_else(|| base.repo_root().clone());
    if repo_root.as_os_str().is_empty() {
        bail!("a repository root is required (--repo-root)");
    }
    let repo_root = std::fs::canonicalize(&repo_root)
        .with_context(|| format!("resolve repository root {}", repo_root.display()))?;

    let pool = PoolSettingsBuilder::default()
        .size(opts.pool_size.unwrap_or(base.pool().size()))
        .max_uses_per_container(
            opts.pool_max_uses
                .unwrap_or(base.pool().max_uses_per_container()),
        )
        .idle_timeout_secs(
            opts.pool_idle_timeout
                .unwrap_or(base.pool().idle_timeout_secs()),
        )
        .health_check_interval_secs(
            opts.pool_health_interval
                .unwrap_or(base.pool().health_check_interval_secs()),
        )
        .startup_containers(opts.pool_startup.unwrap_or(base.pool().startup_containers()))
        .image(
            opts.exec_image
                .clone()
                .unwrap_or_else(|| base.pool().image().clone()),
        )
        .memory(base.pool().memory().clone())
        .cpus(base.pool().cpus())
        .build()
        .context("assemble pool settings")?;

    let search = resolve_search(opts, base.search().clone())?;

    let log_level = match (opts.log_level, opts.verbose) {
        (Some(level), _) => level,
        (None, true) => LevelFilter::Debug,
        (None, false) => base.log_level(),
    };

    let config = ConfigBuilder::default()
        .repo_root(repo_root)
        .max_read_size(opts.max_size.unwrap_or(base.max_read_size()))
        .max_write_size(opts.max_write_size.unwrap_or(base.max_write_size()))
        .exclude_patterns(if opts.exclude.is_empty() {
            base.exclude_patterns().clone()
        } else {
            opts.exclude.clone()
        })
        .allowed_write_extensions(
            opts.allowed_extensions
                .clone()
                .unwrap_or_else(|| base.allowed_write_extensions().clone()),
        )
        .backup_on_write(base.backup_on_write())
        .exec_whitelist(
            opts.whitelist
                .clone()
                .unwrap_or_else(|| base.exec_whitelist().clone()),
        )
        .exec_image(
            opts.exec_image
                .clone()
                .unwrap_or_else(|| base.exec_image().clone()),
        )
        .exec_memory(
            opts.exec_memory
                .clone()
                .unwrap_or_else(|| base.exec_memory().clone()),
        )
        .exec_cpus(opts.exec_cpus.unwrap_or(base.exec_cpus()))
        .exec_timeout_secs(opts.exec_timeout.unwrap_or(base.exec_timeout_secs()))
        .io_image(
            opts.io_image
                .clone()
                .unwrap_or_else(|| base.io_image().clone()),
        )
        .io_memory(
            opts.io_memory
                .clone()
                .unwrap_or_else(|| base.io_memory().clone()),
        )
        .io_cpus(opts.io_cpus.unwrap_or(base.io_cpus()))
        .io_timeout_secs(opts.io_timeout.unwrap_or(base.io_timeout_secs()))
        .docker_socket(
            opts.docker_sock
                .clone()
                .unwrap_or_else(|| base.docker_socket().clone()),
        )
        .audit_log(
            opts.audit_log
                .clone()
                .unwrap_or_else(|| base.audit_log().clone()),
        )
        .log_level(log_level)
        .pool(pool)
        .search(search)
        .build()
        .context("assemble configuration")?;

    Ok(config)
}

/// Search stays disabled unless the file or a flag configures an endpoint.
fn resolve_search(
    opts: &Opts,
    base: Option<SearchSettings>,
) -> Result<Option<SearchSettings>> {
    if base.is_none() && opts.search_endpoint.is_none() {
        return Ok(None);
    }

    let defaults = base.unwrap_or_default();
    let settings = SearchSettingsBuilder::default()
        .endpoint(
            opts.search_endpoint
                .clone()
                .unwrap_or_else(|| defaults.endpoint().clone()),
        )
        .model(
            opts.search_model
                .clone()
                .unwrap_or_else(|| defaults.model().clone()),
        )
        .dimensions(opts.search_dimensions.unwrap_or(defaults.dimensions()))
        .index_path(
            opts.search_index
                .clone()
                .unwrap_or_else(|| defaults.index_path().clone()),
        )
        .max_results(opts.search_max_results.unwrap_or(defaults.max_results()))
        .build()
        .context("assemble search settings")?;

    Ok(Some(settings))
}
