//! One-shot sandboxed container runs.
//!
//! A run creates a fresh hardened container, optionally feeds it stdin,
//! races its exit against a wall-clock timeout and demultiplexes its log
//! stream into stdout and stderr. The container is force-removed on every
//! exit path: orderly completion, non-zero exit, timeout, I/O error and
//! abandonment of the calling task.

use crate::runtime::{
    demux::LogDemux, nano_cpus, parse_memory, Bind, ContainerRuntime, ContainerSpecBuilder,
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use futures::TryStreamExt;
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

/// Exit code reported for timed-out runs.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Mount point of the repository inside every container.
pub const WORKSPACE: &str = "/workspace";

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Parameters of one sandboxed run.
pub struct RunRequest {
    #[get = "pub"]
    image: String,

    #[get = "pub"]
    /// Shell command, executed as `sh -c <command>`.
    command: String,

    #[get = "pub"]
    /// Host path bind-mounted at [`WORKSPACE`].
    repo_root: PathBuf,

    #[get_copy = "pub"]
    #[builder(default)]
    /// Mount the repository read-write. Only the write verb's I/O container
    /// sets this.
    read_write: bool,

    #[get = "pub"]
    /// Suffixed memory limit string.
    memory: String,

    #[get_copy = "pub"]
    cpus: u32,

    #[get_copy = "pub"]
    timeout: Duration,

    #[get = "pub"]
    #[builder(default, setter(strip_option))]
    /// Bytes delivered on the container's stdin.
    stdin: Option<String>,
}

#[derive(Clone, CopyGetters, Debug, Getters)]
/// Structured outcome of one run. A non-zero exit code is not an `Err`;
/// the caller decides how to classify it.
pub struct RunOutcome {
    #[get_copy = "pub"]
    exit_code: i64,

    #[get = "pub"]
    stdout: String,

    #[get = "pub"]
    stderr: String,

    #[get_copy = "pub"]
    duration: Duration,

    #[get_copy = "pub"]
    timed_out: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr concatenated for combined reporting.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }
}

/// The one-shot sandbox primitive.
#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Run a command to completion in a fresh container.
    pub async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let started = Instant::now();

        let spec = ContainerSpecBuilder::default()
            .image(request.image().clone())
            .command(vec![
                "sh".to_string(),
                "-c".to_string(),
                request.command().clone(),
            ])
            .binds(vec![Bind::new(
                request.repo_root().clone(),
                WORKSPACE,
                !request.read_write(),
            )])
            .memory_bytes(parse_memory(request.memory()))
            .nano_cpus(nano_cpus(request.cpus()))
            .attach_stdin(request.stdin().is_some())
            .build()
            .context("assemble container spec")?;

        let id = self
            .runtime
            .create_container(&spec)
            .await
            .context("create sandbox container")?;
        debug!("Created sandbox container {}", short_id(&id));

        let guard = ContainerGuard::new(Arc::clone(&self.runtime), id.clone());
        let result = self.drive(&id, request, started).await;
        guard.release().await;

        result
    }

    async fn drive(
        &self,
        id: &str,
        request: &RunRequest,
        started: Instant,
    ) -> Result<RunOutcome> {
        self.runtime
            .start_container(id)
            .await
            .context("start sandbox container")?;

        // Stdin must be delivered between start and wait; the attached
        // stream is half-closed after the final byte.
        if let Some(stdin) = request.stdin() {
            self.runtime
                .write_stdin(id, stdin.as_bytes())
                .await
                .context("write sandbox stdin")?;
        }

        let (exit_code, timed_out) = tokio::select! {
            status = self.runtime.wait_container(id) => {
                (status.context("wait for sandbox container")?, false)
            }
            _ = tokio::time::sleep(request.timeout()) => {
                debug!(
                    "Sandbox container {} exceeded its {}s limit",
                    short_id(id),
                    request.timeout().as_secs()
                );
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let (stdout, stderr) = match self.collect_logs(id).await {
            Ok(streams) => streams,
            // A timed-out container may be torn down underneath the log
            // read; the timeout verdict stands.
            Err(e) if timed_out => {
                debug!("Log collection after timeout failed: {:#}", e);
                (String::new(), String::new())
            }
            Err(e) => return Err(e),
        };

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
            timed_out,
        })
    }

    async fn collect_logs(&self, id: &str) -> Result<(String, String)> {
        let mut stream = self
            .runtime
            .container_logs(id)
            .await
            .context("open sandbox log stream")?;

        let mut demux = LogDemux::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .context("read sandbox log stream")?
        {
            demux.feed(&chunk)?;
        }

        Ok(demux.finish()?)
    }
}

/// Scoped removal of a container. `release` removes it in place; if the
/// guard is instead dropped (panic, cancellation), removal is handed to a
/// background task.
pub(crate) struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.runtime.remove_container(&id).await {
                warn!("Unable to remove container {}: {:#}", short_id(&id), e);
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let runtime = Arc::clone(&self.runtime);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = runtime.remove_container(&id).await;
                });
            }
        }
    }
}

/// Abbreviated container id for log lines.
pub(crate) fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState, LogStream};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Scripted in-process runtime.
    #[derive(Default)]
    pub struct MockRuntime {
        pub exit_code: i64,
        pub wait_delay: Duration,
        pub log_bytes: Vec<u8>,
        pub created: Mutex<Vec<ContainerSpec>>,
        pub removed: Mutex<Vec<String>>,
        pub stdin: Mutex<Option<Vec<u8>>>,
        pub not_running: AtomicBool,
    }

    impl MockRuntime {
        pub fn with_output(stdout: &[u8], stderr: &[u8], exit_code: i64) -> Self {
            let mut log_bytes = frame(1, stdout);
            log_bytes.extend(frame(2, stderr));
            Self {
                exit_code,
                log_bytes,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn image_exists(&self, _image: &str) -> Result<bool> {
            Ok(true)
        }

        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            let mut created = self.created.lock().expect("created lock");
            created.push(spec.clone());
            Ok(format!("mock-{}", created.len()))
        }

        async fn start_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn write_stdin(&self, _id: &str, data: &[u8]) -> Result<()> {
            *self.stdin.lock().expect("stdin lock") = Some(data.to_vec());
            Ok(())
        }

        async fn wait_container(&self, _id: &str) -> Result<i64> {
            tokio::time::sleep(self.wait_delay).await;
            Ok(self.exit_code)
        }

        async fn container_logs(&self, _id: &str) -> Result<LogStream> {
            let chunk = Bytes::from(self.log_bytes.clone());
            Ok(futures::stream::iter(vec![Ok(chunk)]).boxed())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.removed.lock().expect("removed lock").push(id.to_string());
            Ok(())
        }

        async fn container_state(&self, _id: &str) -> Result<ContainerState> {
            Ok(ContainerState {
                running: !self.not_running.load(Ordering::SeqCst),
                restarting: false,
            })
        }
    }

    fn request() -> RunRequest {
        RunRequestBuilder::default()
            .image("alpine:3.20")
            .command("ls -la")
            .repo_root("/srv/repo")
            .memory("512m")
            .cpus(1u32)
            .timeout(Duration::from_secs(5))
            .build()
            .expect("build request")
    }

    #[tokio::test]
    async fn successful_run_demuxes_and_removes() -> Result<()> {
        let runtime = Arc::new(MockRuntime::with_output(b"file-a\n", b"warning\n", 0));
        let sandbox = Sandbox::new(runtime.clone());

        let outcome = sandbox.run(&request()).await?;

        assert!(outcome.success());
        assert_eq!(outcome.stdout(), "file-a\n");
        assert_eq!(outcome.stderr(), "warning\n");
        assert!(!outcome.timed_out());
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() -> Result<()> {
        let runtime = Arc::new(MockRuntime::with_output(b"", b"no such file\n", 2));
        let sandbox = Sandbox::new(runtime.clone());

        let outcome = sandbox.run(&request()).await?;

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.combined(), "no such file");
        Ok(())
    }

    #[tokio::test]
    async fn timeout_reports_124_and_still_removes() -> Result<()> {
        let runtime = Arc::new(MockRuntime {
            wait_delay: Duration::from_secs(60),
            ..MockRuntime::default()
        });
        let sandbox = Sandbox::new(runtime.clone());

        let slow = RunRequestBuilder::default()
            .image("alpine:3.20")
            .command("sleep 60")
            .repo_root("/srv/repo")
            .memory("512m")
            .cpus(1u32)
            .timeout(Duration::from_millis(50))
            .build()?;

        let outcome = sandbox.run(&slow).await?;

        assert!(outcome.timed_out());
        assert_eq!(outcome.exit_code(), TIMEOUT_EXIT_CODE);
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stdin_is_delivered_before_wait() -> Result<()> {
        let runtime = Arc::new(MockRuntime::with_output(b"", b"", 0));
        let sandbox = Sandbox::new(runtime.clone());

        let with_stdin = RunRequestBuilder::default()
            .image("alpine:3.20")
            .command("cat > /workspace/out")
            .repo_root("/srv/repo")
            .memory("256m")
            .cpus(1u32)
            .timeout(Duration::from_secs(5))
            .stdin("payload")
            .build()?;

        sandbox.run(&with_stdin).await?;

        assert_eq!(
            runtime.stdin.lock().unwrap().as_deref(),
            Some(b"payload".as_slice())
        );
        let created = runtime.created.lock().unwrap();
        assert!(created[0].attach_stdin());
        Ok(())
    }

    #[tokio::test]
    async fn mount_is_read_only_unless_requested() -> Result<()> {
        let runtime = Arc::new(MockRuntime::with_output(b"", b"", 0));
        let sandbox = Sandbox::new(runtime.clone());

        sandbox.run(&request()).await?;

        let rw = RunRequestBuilder::default()
            .image("alpine:3.20")
            .command("cat > /workspace/f.tmp")
            .repo_root("/srv/repo")
            .read_write(true)
            .memory("256m")
            .cpus(1u32)
            .timeout(Duration::from_secs(5))
            .build()?;
        sandbox.run(&rw).await?;

        let created = runtime.created.lock().unwrap();
        assert!(created[0].binds()[0].read_only);
        assert!(!created[1].binds()[0].read_only);
        Ok(())
    }
}
