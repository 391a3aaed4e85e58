//! Docker Engine API client over the local Unix socket.
//!
//! The runtime boundary is narrow (ten calls), so the client speaks the
//! Engine HTTP API directly: one short-lived HTTP/1 connection per request,
//! JSON request/response payloads, and the raw multiplexed byte stream for
//! logs. Stdin is delivered through the attach endpoint's connection
//! upgrade and half-closed by dropping the upgraded connection, which the
//! daemon translates to stdin EOF for `StdinOnce` containers.

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState, LogStream};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use hyper::{
    client::conn::{self, SendRequest},
    header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE},
    Body, Method, Request, Response, StatusCode,
};
use log::{debug, trace};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::{io::AsyncWriteExt, net::UnixStream};

#[derive(Clone, Debug)]
pub struct DockerRuntime {
    socket: PathBuf,
}

impl DockerRuntime {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn connect(&self, upgradable: bool) -> Result<SendRequest<Body>> {
        let stream = UnixStream::connect(&self.socket).await.with_context(|| {
            format!(
                "connect to container runtime socket {}",
                self.socket.display()
            )
        })?;

        let (sender, connection) = conn::handshake(stream)
            .await
            .context("container runtime handshake")?;

        if upgradable {
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    trace!("runtime connection closed: {}", e);
                }
            });
        } else {
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    trace!("runtime connection closed: {}", e);
                }
            });
        }

        Ok(sender)
    }

    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Value>,
    ) -> Result<Response<Body>> {
        trace!("runtime request {} {}", method, path_and_query);
        let mut sender = self.connect(false).await?;

        let builder = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(HOST, "localhost");
        let request = match body {
            Some(value) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .context("build runtime request")?;

        sender
            .send_request(request)
            .await
            .context("send runtime request")
    }
}

/// Read the full response body, failing with the daemon's message on
/// non-success statuses.
async fn ensure_success(response: Response<Body>, action: &str) -> Result<Bytes> {
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .context("read runtime response")?;

    if status.is_success() {
        Ok(body)
    } else {
        bail!("{}: {}", action, daemon_message(status, &body))
    }
}

fn daemon_message(status: StatusCode, body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Message {
        message: String,
    }

    match serde_json::from_slice::<Message>(body) {
        Ok(m) => m.message,
        Err(_) => format!("{} ({})", String::from_utf8_lossy(body).trim(), status),
    }
}

/// The Engine API creation payload for a [`ContainerSpec`]. The hardening
/// options are unconditional.
fn create_body(spec: &ContainerSpec) -> Value {
    let binds: Vec<String> = spec
        .binds()
        .iter()
        .map(|bind| {
            format!(
                "{}:{}:{}",
                bind.host.display(),
                bind.container,
                if bind.read_only { "ro" } else { "rw" }
            )
        })
        .collect();

    let tmpfs: serde_json::Map<String, Value> = spec
        .tmpfs()
        .iter()
        .map(|path| (path.clone(), Value::from("rw,noexec,nosuid")))
        .collect();

    json!({
        "Image": spec.image(),
        "Cmd": spec.command(),
        "WorkingDir": spec.working_dir(),
        "User": spec.user(),
        "AttachStdin": spec.attach_stdin(),
        "OpenStdin": spec.attach_stdin(),
        "StdinOnce": spec.attach_stdin(),
        "AttachStdout": false,
        "AttachStderr": false,
        "NetworkDisabled": true,
        "HostConfig": {
            "Binds": binds,
            "Tmpfs": tmpfs,
            "Memory": spec.memory_bytes(),
            "NanoCpus": spec.nano_cpus(),
            "CapDrop": ["ALL"],
            "SecurityOpt": ["no-new-privileges"],
            "ReadonlyRootfs": true,
            "NetworkMode": "none",
        },
    })
}

fn check_pull_line(line: &[u8]) -> Result<()> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return Ok(());
    }
    if let Ok(value) = serde_json::from_slice::<Value>(line) {
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            bail!("image pull failed: {}", error);
        }
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let response = self.request(Method::GET, "/_ping", None).await?;
        ensure_success(response, "ping container runtime").await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let response = self
            .request(Method::GET, &format!("/images/{}/json", image), None)
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .context("read runtime response")?;
                bail!("inspect image {}: {}", image, daemon_message(status, &body))
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!("Pulling image {}", image);
        let response = self
            .request(
                Method::POST,
                &format!("/images/create?fromImage={}", image),
                None,
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .context("read runtime response")?;
            bail!("pull image {}: {}", image, daemon_message(status, &body));
        }

        // The pull endpoint streams progress as JSON lines; failures arrive
        // in-stream with a 200 status.
        let mut body = response.into_body();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = body.try_next().await.context("read image pull stream")? {
            pending.extend_from_slice(&chunk);
            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                check_pull_line(&line[..line.len() - 1])?;
            }
        }
        check_pull_line(&pending)?;

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            #[serde(rename = "Id")]
            id: String,
            #[serde(rename = "Warnings", default)]
            warnings: Vec<String>,
        }

        let response = self
            .request(
                Method::POST,
                "/containers/create",
                Some(create_body(spec)),
            )
            .await?;
        let body = ensure_success(response, "create container").await?;

        let created: Created =
            serde_json::from_slice(&body).context("decode container creation response")?;
        for warning in &created.warnings {
            debug!("Container creation warning: {}", warning);
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("/containers/{}/start", id), None)
            .await?;
        ensure_success(response, "start container").await?;
        Ok(())
    }

    async fn write_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        let mut sender = self.connect(true).await?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/containers/{}/attach?stream=1&stdin=1", id))
            .header(HOST, "localhost")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .body(Body::empty())
            .context("build attach request")?;

        let response = sender
            .send_request(request)
            .await
            .context("attach to container")?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS && !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .context("read runtime response")?;
            bail!("attach to container: {}", daemon_message(status, &body));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .context("upgrade attach connection")?;
        let (_read, mut write) = tokio::io::split(upgraded);
        write.write_all(data).await.context("write stdin")?;
        write.shutdown().await.context("close stdin")?;

        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        #[derive(Deserialize)]
        struct WaitResponse {
            #[serde(rename = "StatusCode")]
            status_code: i64,
        }

        let response = self
            .request(Method::POST, &format!("/containers/{}/wait", id), None)
            .await?;
        let body = ensure_success(response, "wait for container").await?;

        let wait: WaitResponse =
            serde_json::from_slice(&body).context("decode container wait response")?;
        Ok(wait.status_code)
    }

    async fn container_logs(&self, id: &str) -> Result<LogStream> {
        let response = self
            .request(
                Method::GET,
                &format!("/containers/{}/logs?stdout=1&stderr=1", id),
                None,
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .context("read runtime response")?;
            bail!("fetch container logs: {}", daemon_message(status, &body));
        }

        Ok(response
            .into_body()
            .map_err(|e| anyhow::anyhow!("read log stream: {}", e))
            .boxed())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/containers/{}?force=true&v=true", id),
                None,
            )
            .await?;

        match response.status() {
            // Already gone is fine; removal must be safe on every exit path.
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .context("read runtime response")?;
                bail!("remove container: {}", daemon_message(status, &body))
            }
        }
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState> {
        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "State")]
            state: InspectState,
        }
        #[derive(Deserialize)]
        struct InspectState {
            #[serde(rename = "Running")]
            running: bool,
            #[serde(rename = "Restarting")]
            restarting: bool,
        }

        let response = self
            .request(Method::GET, &format!("/containers/{}/json", id), None)
            .await?;
        let body = ensure_success(response, "inspect container").await?;

        let inspect: Inspect =
            serde_json::from_slice(&body).context("decode container inspect response")?;
        Ok(ContainerState {
            running: inspect.state.running,
            restarting: inspect.state.restarting,
        })
    }
}
