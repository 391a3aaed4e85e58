//! Session assembly: wire the configuration, audit log, container runtime,
//! pool, executor and driver together and run until EOF or a signal.

use crate::{
    audit::{AuditSink, FileAuditLog},
    cli::Opts,
    config::Config,
    driver::Driver,
    executor::Executor,
    pool::ContainerPool,
    runtime::{docker::DockerRuntime, ContainerRuntime},
    sandbox::Sandbox,
    search::SearchEngine,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::{env, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    signal::unix::{signal, SignalKind},
};
use uuid::Uuid;

/// Server is the main instance tying one mediation session together.
pub struct Server {
    config: Arc<Config>,
    opts: Opts,
}

impl Server {
    /// Create a new server instance.
    pub fn new(config: Config, opts: Opts) -> Self {
        Server {
            config: Arc::new(config),
            opts,
        }
    }

    /// Run the session until the input stream ends or a signal arrives.
    pub async fn start(self) -> Result<()> {
        self.set_logging_verbosity()
            .context("set logging verbosity")?;

        let session = Uuid::new_v4().to_string();
        info!(
            "Mediating repository {} (session {})",
            self.config.repo_root().display(),
            session
        );

        let audit = Arc::new(
            FileAuditLog::open(self.config.audit_log(), session).context("open audit log")?,
        ) as Arc<dyn AuditSink>;

        let runtime =
            Arc::new(DockerRuntime::new(self.config.docker_socket())) as Arc<dyn ContainerRuntime>;
        if let Err(e) = runtime.ping().await {
            // Commands will report DOCKER_UNAVAILABLE individually; the
            // session itself still starts.
            warn!("Container runtime is not reachable: {:#}", e);
        }

        let search = match self.config.search() {
            Some(settings) => Some(
                SearchEngine::from_settings(settings, self.config.repo_root())
                    .context("initialize semantic search")?,
            ),
            None => None,
        };

        let pool = ContainerPool::new(
            Arc::clone(&runtime),
            self.config.pool().clone(),
            self.config.repo_root().clone(),
        )
        .await
        .context("construct container pool")?;

        let executor = Executor::new(
            Arc::clone(&self.config),
            Sandbox::new(Arc::clone(&runtime)),
            audit,
            search,
        );
        let driver = Driver::new(executor).with_pool(Arc::clone(&pool));

        let input = self.open_input().await.context("open input stream")?;
        let output = self.open_output().await.context("open output stream")?;

        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        tokio::select! {
            res = driver.run(input, output) => {
                res.context("run driver loop")?
            }
            _ = shutdown_interrupt.recv() => {
                info!("Got interrupt signal, shutting down");
                pool.shutdown().await;
            }
            _ = shutdown_terminate.recv() => {
                info!("Got termination signal, shutting down");
                pool.shutdown().await;
            }
        }

        Ok(())
    }

    /// Initialize the logger and set the verbosity to the configured level.
    fn set_logging_verbosity(&self) -> Result<()> {
        env::set_var(
            "RUST_LOG",
            format!("{}={}", env!("CARGO_PKG_NAME"), self.config.log_level()),
        );
        env_logger::try_init().context("init env logger")
    }

    async fn open_input(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        match &self.opts.input {
            Some(path) if !self.opts.interactive => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("open input file {}", path.display()))?;
                Ok(Box::new(file))
            }
            _ => Ok(Box::new(tokio::io::stdin())),
        }
    }

    async fn open_output(&self) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        match &self.opts.output {
            Some(path) => {
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("create output file {}", path.display()))?;
                Ok(Box::new(file))
            }
            None => Ok(Box::new(tokio::io::stdout())),
        }
    }
}
