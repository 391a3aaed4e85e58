//! Per-verb command orchestration.
//!
//! The executor validates each command against policy, performs the verb's
//! action (through the sandbox and the search collaborators), records
//! exactly one audit entry whose success flag matches the outcome, and
//! returns a structured result. The full unsanitized error text goes to the
//! audit detail; callers surface only the sanitized form.

mod exec;
mod open;
mod search;
mod write;

use crate::{
    audit::AuditSink,
    config::Config,
    error::CommandError,
    sandbox::Sandbox,
    scanner::{Command, Verb},
    search::SearchEngine,
};
use getset::{CopyGetters, Getters};
use log::debug;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use strum::{AsRefStr, Display};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum WriteAction {
    Created,
    Updated,
}

#[derive(Clone, CopyGetters, Debug, Getters)]
/// Write-verb details carried on the result.
pub struct WriteOutcome {
    #[get_copy = "pub"]
    bytes_written: u64,

    #[get_copy = "pub"]
    action: WriteAction,

    #[get = "pub"]
    /// Backup file name, when one was taken.
    backup: Option<String>,

    #[get = "pub"]
    content_hash: String,
}

#[derive(Clone, CopyGetters, Debug, Getters)]
/// Exec-verb details carried on the result.
pub struct ExecOutcome {
    #[get_copy = "pub"]
    exit_code: i64,

    #[get = "pub"]
    stdout: String,

    #[get = "pub"]
    stderr: String,

    #[get = "pub"]
    combined: String,
}

#[derive(CopyGetters, Debug, Getters)]
/// The outcome of one command: constructed here, formatted by the driver,
/// then dropped.
pub struct ExecutionResult {
    #[get = "pub"]
    command: Command,

    #[get_copy = "pub"]
    success: bool,

    #[get = "pub"]
    /// User-facing result body (file contents, combined exec output,
    /// formatted search block or a write summary).
    result: String,

    #[get = "pub"]
    error: Option<CommandError>,

    #[get_copy = "pub"]
    duration: Duration,

    #[get = "pub"]
    write: Option<WriteOutcome>,

    #[get = "pub"]
    exec: Option<ExecOutcome>,

    #[get_copy = "pub"]
    search_hits: Option<usize>,
}

/// Verb-handler outcome before audit and timing are attached.
pub(crate) struct Outcome {
    result: String,
    error: Option<CommandError>,
    detail: String,
    write: Option<WriteOutcome>,
    exec: Option<ExecOutcome>,
    search_hits: Option<usize>,
}

impl Outcome {
    fn success(result: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            error: None,
            detail: detail.into(),
            write: None,
            exec: None,
            search_hits: None,
        }
    }

    fn failure(error: CommandError) -> Self {
        Self {
            result: String::new(),
            detail: error.to_string(),
            error: Some(error),
            write: None,
            exec: None,
            search_hits: None,
        }
    }

    fn failure_with_detail(error: CommandError, detail: impl Into<String>) -> Self {
        Self {
            result: String::new(),
            detail: detail.into(),
            error: Some(error),
            write: None,
            exec: None,
            search_hits: None,
        }
    }

    fn with_write(mut self, write: WriteOutcome) -> Self {
        self.write = Some(write);
        self
    }

    fn with_exec(mut self, exec: ExecOutcome) -> Self {
        self.exec = Some(exec);
        self
    }

    fn with_search_hits(mut self, hits: usize) -> Self {
        self.search_hits = Some(hits);
        self
    }
}

pub struct Executor {
    config: Arc<Config>,
    sandbox: Sandbox,
    audit: Arc<dyn AuditSink>,
    search: Option<SearchEngine>,
    completed: AtomicU64,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        sandbox: Sandbox,
        audit: Arc<dyn AuditSink>,
        search: Option<SearchEngine>,
    ) -> Self {
        Self {
            config,
            sandbox,
            audit,
            search,
            completed: AtomicU64::new(0),
        }
    }

    /// Monotonic count of successfully completed commands.
    pub fn completed_commands(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Execute one command to completion. The audit entry is written before
    /// the result is returned.
    pub async fn dispatch(&self, command: Command) -> ExecutionResult {
        let started = Instant::now();
        debug!("Dispatching {} {}", command.verb(), command.argument());

        let outcome = match command.verb() {
            Verb::Open => self.handle_open(&command).await,
            Verb::Write => self.handle_write(&command).await,
            Verb::Exec => self.handle_exec(&command).await,
            Verb::Search => self.handle_search(&command).await,
        };

        let success = outcome.error.is_none();
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }

        self.audit.log(
            command.verb().as_ref(),
            command.argument(),
            success,
            &outcome.detail,
        );

        ExecutionResult {
            command,
            success,
            result: outcome.result,
            error: outcome.error,
            duration: started.elapsed(),
            write: outcome.write,
            exec: outcome.exec,
            search_hits: outcome.search_hits,
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{
        audit::RecordingAudit,
        config::ConfigBuilder,
        error::ErrorKind,
        sandbox::tests::MockRuntime,
        scanner::Verb,
        search::tests::{KeywordEmbedder, MemoryStore},
    };
    use anyhow::Result;
    use tempfile::TempDir;

    pub struct Harness {
        pub repo: TempDir,
        pub runtime: Arc<MockRuntime>,
        pub audit: Arc<RecordingAudit>,
        pub executor: Executor,
    }

    pub fn harness_with(runtime: MockRuntime, with_search: bool) -> Harness {
        let repo = TempDir::new().expect("create repo dir");
        let runtime = Arc::new(runtime);
        let audit = Arc::new(RecordingAudit::default());

        let config = Arc::new(
            ConfigBuilder::default()
                .repo_root(repo.path())
                .exec_whitelist(vec!["ls".to_string(), "sleep".to_string()])
                .allowed_write_extensions(Vec::<String>::new())
                .build()
                .expect("build config"),
        );

        let search = with_search.then(|| {
            SearchEngine::new(
                Box::new(KeywordEmbedder::new()),
                Box::new(MemoryStore::default()),
                repo.path().to_path_buf(),
                5,
            )
        });

        let executor = Executor::new(
            Arc::clone(&config),
            Sandbox::new(runtime.clone() as Arc<dyn crate::runtime::ContainerRuntime>),
            audit.clone() as Arc<dyn AuditSink>,
            search,
        );

        Harness {
            repo,
            runtime,
            audit,
            executor,
        }
    }

    pub fn harness() -> Harness {
        harness_with(MockRuntime::with_output(b"", b"", 0), false)
    }

    pub fn command(verb: Verb, argument: &str) -> Command {
        Command::synthetic(verb, argument, None)
    }

    pub fn write_command(argument: &str, content: &str) -> Command {
        Command::synthetic(Verb::Write, argument, Some(content))
    }

    #[tokio::test]
    async fn every_command_audits_exactly_once() -> Result<()> {
        let h = harness();
        std::fs::write(h.repo.path().join("a.txt"), "hi")?;

        let ok = h.executor.dispatch(command(Verb::Open, "a.txt")).await;
        let err = h.executor.dispatch(command(Verb::Open, "missing.txt")).await;

        assert!(ok.success());
        assert!(!err.success());

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].verb, "open");
        assert!(entries[0].success);
        assert!(!entries[1].success);
        // The audit detail keeps the unsanitized error text.
        assert_eq!(ErrorKind::FileNotFound, err.error().as_ref().unwrap().kind());
        assert!(entries[1].detail.contains("FILE_NOT_FOUND"));
        Ok(())
    }

    #[tokio::test]
    async fn completed_counter_only_counts_successes() -> Result<()> {
        let h = harness();
        std::fs::write(h.repo.path().join("a.txt"), "hi")?;

        h.executor.dispatch(command(Verb::Open, "a.txt")).await;
        h.executor.dispatch(command(Verb::Open, "missing.txt")).await;
        h.executor.dispatch(command(Verb::Open, "a.txt")).await;

        assert_eq!(h.executor.completed_commands(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn policy_failures_touch_no_container() {
        let h = harness();

        let result = h
            .executor
            .dispatch(command(Verb::Exec, "rm -rf /"))
            .await;

        assert!(!result.success());
        assert_eq!(
            result.error().as_ref().unwrap().kind(),
            ErrorKind::ExecValidation
        );
        assert!(h.runtime.created.lock().unwrap().is_empty());
    }

    #[test]
    fn executor_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Executor>();
    }
}
