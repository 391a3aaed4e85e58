//! The abstract container runtime boundary.
//!
//! Every platform-specific container operation the sandbox and pool need is
//! expressed through the [`ContainerRuntime`] trait; the production
//! implementation speaks the Docker Engine HTTP API over the local Unix
//! socket (see [`docker`]). Tests substitute mock implementations.

pub mod demux;
pub mod docker;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use derive_builder::Builder;
use futures::stream::BoxStream;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;

/// Raw container log bytes as emitted by the runtime: a sequence of frames,
/// each an 8-byte `[stream_type, 0, 0, 0, size_be4]` header followed by
/// `size` payload bytes. Demultiplexed by [`demux::LogDemux`].
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// A bind mount of a host path into a container.
#[derive(Clone, Debug)]
pub struct Bind {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Bind {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>, read_only: bool) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only,
        }
    }
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Creation-time description of a container. The hardening options are not
/// configurable: every container drops all capabilities, runs without
/// privilege escalation on a read-only root filesystem, detached from the
/// network, as a fixed non-root user.
pub struct ContainerSpec {
    #[get = "pub"]
    image: String,

    #[get = "pub"]
    /// Argv of PID 1 inside the container.
    command: Vec<String>,

    #[get = "pub"]
    working_dir: String,

    #[get = "pub"]
    user: String,

    #[get = "pub"]
    binds: Vec<Bind>,

    #[get = "pub"]
    /// Ephemeral tmpfs mount points.
    tmpfs: Vec<String>,

    #[get_copy = "pub"]
    /// Memory limit in bytes; 0 leaves the limit unset.
    memory_bytes: i64,

    #[get_copy = "pub"]
    /// CPU budget in nanoseconds of CPU time per second.
    nano_cpus: i64,

    #[get_copy = "pub"]
    /// Attach and keep open a stdin stream for a single writer.
    attach_stdin: bool,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: Vec::new(),
            working_dir: "/workspace".into(),
            user: "1000:1000".into(),
            binds: Vec::new(),
            tmpfs: vec!["/tmp".into()],
            memory_bytes: 0,
            nano_cpus: 0,
            attach_stdin: false,
        }
    }
}

/// Runtime-reported process state of a container.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContainerState {
    pub running: bool,
    pub restarting: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image from its registry. Not retried on failure.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Write the given bytes to the container's attached stdin and
    /// half-close the write side. Only valid for containers created with
    /// `attach_stdin`.
    async fn write_stdin(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Block until the container exits; returns the exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// The container's multiplexed log stream (stdout + stderr frames).
    async fn container_logs(&self, id: &str) -> Result<LogStream>;

    /// Force-remove a container. Removing an already-gone container is not
    /// an error.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect the container's running/restarting state.
    async fn container_state(&self, id: &str) -> Result<ContainerState>;
}

/// Parse a suffixed memory limit string: `Nm`/`NM` is N·2^20 bytes,
/// `Ng`/`NG` is N·2^30. Anything else yields 0, which the runtime
/// interprets as "unset".
pub fn parse_memory(limit: &str) -> i64 {
    let trimmed = limit.trim();
    let Some(last) = trimmed.chars().last() else {
        return 0;
    };

    let factor: i64 = match last {
        'm' | 'M' => 1 << 20,
        'g' | 'G' => 1 << 30,
        _ => return 0,
    };

    trimmed[..trimmed.len() - 1]
        .parse::<i64>()
        .map(|n| n.saturating_mul(factor))
        .unwrap_or(0)
}

/// A CPU count expressed as nanoseconds of CPU time per second.
pub fn nano_cpus(count: u32) -> i64 {
    i64::from(count) * 1_000_000_000
}
