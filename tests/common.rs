//! Shared fixtures: an in-process container runtime that executes the I/O
//! scripts against the bind-mounted host directory, plus a fully wired
//! session harness.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;
use toolgate::{
    audit::{AuditSink, RecordingAudit},
    config::{Config, ConfigBuilder},
    driver::Driver,
    executor::Executor,
    runtime::{ContainerRuntime, ContainerSpec, ContainerState, LogStream},
    sandbox::Sandbox,
};

const WORKSPACE_PREFIX: &str = "/workspace/";

struct ContainerRecord {
    spec: ContainerSpec,
    stdin: Option<Vec<u8>>,
}

/// A runtime double that interprets the I/O container scripts (backup copy
/// and temp-write-and-rename) against the bound host directory, and serves
/// scripted output for exec containers.
pub struct FsRuntime {
    pub exec_exit: i64,
    pub exec_stdout: Vec<u8>,
    pub exec_stderr: Vec<u8>,
    pub wait_delay: Duration,
    pub containers: Mutex<HashMap<String, ContainerRecord>>,
    pub next_id: AtomicU64,
    pub created: AtomicU64,
    pub removed: AtomicU64,
}

impl Default for FsRuntime {
    fn default() -> Self {
        Self {
            exec_exit: 0,
            exec_stdout: b"bin\netc\nusr\n".to_vec(),
            exec_stderr: Vec::new(),
            wait_delay: Duration::ZERO,
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }
}

impl FsRuntime {
    /// Map a `/workspace/...` path onto the container's bind host path.
    fn host_path(spec: &ContainerSpec, container_path: &str) -> Result<PathBuf> {
        let bind = spec
            .binds()
            .first()
            .ok_or_else(|| anyhow::anyhow!("container has no bind mount"))?;
        if container_path == "/workspace" {
            return Ok(bind.host.clone());
        }
        let Some(relative) = container_path.strip_prefix(WORKSPACE_PREFIX) else {
            bail!("path {} is outside the workspace", container_path);
        };
        Ok(bind.host.join(relative))
    }

    /// Execute the known I/O script shapes; exec scripts return the
    /// scripted outcome.
    fn run_script(&self, record: &ContainerRecord) -> Result<i64> {
        let command = record.spec.command();
        if command.first().map(String::as_str) == Some("sleep") {
            return Ok(0);
        }
        let script = command
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("unexpected container command"))?;

        if script.starts_with("cp -p -- ") {
            let quoted = quoted_parts(script);
            let src = Self::host_path(&record.spec, &quoted[0])?;
            let dst = Self::host_path(&record.spec, &quoted[1])?;
            return Ok(if std::fs::copy(&src, &dst).is_ok() { 0 } else { 1 });
        }

        if script.contains("|| exit 92") {
            let quoted = quoted_parts(script);
            // mkdir target, temp file, temp file again, final target.
            let parent = Self::host_path(&record.spec, &quoted[0])?;
            let target = Self::host_path(&record.spec, &quoted[3])?;
            if std::fs::create_dir_all(&parent).is_err() {
                return Ok(91);
            }
            let Some(stdin) = &record.stdin else {
                return Ok(92);
            };
            if std::fs::write(&target, stdin).is_err() {
                return Ok(93);
            }
            return Ok(0);
        }

        Ok(self.exec_exit)
    }
}

fn quoted_parts(script: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = script;
    while let Some(start) = rest.find('\'') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('\'') else { break };
        parts.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    parts
}

fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[async_trait]
impl ContainerRuntime for FsRuntime {
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
        let id = format!("fs-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            ContainerRecord {
                spec: spec.clone(),
                stdin: None,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn write_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        if let Some(record) = self.containers.lock().unwrap().get_mut(id) {
            record.stdin = Some(data.to_vec());
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        if !self.wait_delay.is_zero() {
            tokio::time::sleep(self.wait_delay).await;
        }
        let containers = self.containers.lock().unwrap();
        let record = containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such container {}", id))?;
        self.run_script(record)
    }

    async fn container_logs(&self, id: &str) -> Result<LogStream> {
        let is_exec = {
            let containers = self.containers.lock().unwrap();
            containers
                .get(id)
                .map(|record| {
                    let script = record.spec.command().get(2).cloned().unwrap_or_default();
                    !script.starts_with("cp -p -- ") && !script.contains("|| exit 92")
                })
                .unwrap_or(false)
        };

        let mut bytes = Vec::new();
        if is_exec {
            bytes.extend(frame(1, &self.exec_stdout));
            bytes.extend(frame(2, &self.exec_stderr));
        }
        Ok(futures::stream::iter(vec![Ok(Bytes::from(bytes))]).boxed())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(id);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn container_state(&self, _id: &str) -> Result<ContainerState> {
        Ok(ContainerState {
            running: true,
            restarting: false,
        })
    }
}

/// One fully wired session over a temporary repository.
pub struct Session {
    pub repo: TempDir,
    pub runtime: Arc<FsRuntime>,
    pub audit: Arc<RecordingAudit>,
    pub driver: Driver,
}

impl Session {
    pub fn new() -> Self {
        Self::with_runtime(FsRuntime::default(), |builder| builder)
    }

    pub fn with_runtime(
        runtime: FsRuntime,
        configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> Self {
        let repo = TempDir::new().expect("create repo dir");
        let runtime = Arc::new(runtime);
        let audit = Arc::new(RecordingAudit::default());

        let builder = ConfigBuilder::default()
            .repo_root(repo.path())
            .exec_whitelist(vec!["ls".to_string(), "sleep".to_string()])
            .exec_timeout_secs(1u64)
            .io_timeout_secs(5u64);
        let config: Config = configure(builder).build().expect("build config");

        let executor = Executor::new(
            Arc::new(config),
            Sandbox::new(runtime.clone() as Arc<dyn ContainerRuntime>),
            audit.clone() as Arc<dyn AuditSink>,
            None,
        );

        Session {
            repo,
            runtime,
            audit,
            driver: Driver::new(executor),
        }
    }

    /// Feed an input stream through scanner, executor and frame formatting.
    pub async fn drive(&self, input: &str) -> String {
        let mut output = Vec::new();
        self.driver
            .run(input.as_bytes(), &mut output)
            .await
            .expect("drive input");
        String::from_utf8(output).expect("utf8 output")
    }

    pub fn write_file(&self, relative: &str, contents: &str) {
        let path = self.repo.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dir");
        }
        std::fs::write(path, contents).expect("write fixture");
    }

    pub fn read_file(&self, relative: &str) -> String {
        std::fs::read_to_string(self.repo.path().join(relative)).expect("read repo file")
    }

    pub fn backups_of(&self, relative: &str) -> Vec<String> {
        let path = self.repo.path().join(relative);
        let parent = path.parent().expect("backup parent");
        let name = path
            .file_name()
            .expect("backup file name")
            .to_string_lossy()
            .into_owned();
        let prefix = format!("{name}.bak.");

        let mut backups: Vec<String> = std::fs::read_dir(parent)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|n| n.starts_with(&prefix))
                    .collect()
            })
            .unwrap_or_default();
        backups.sort();
        backups
    }
}
