//! The exec verb: whitelisted shell commands in one-shot sandbox
//! containers.

use crate::{
    error::{CommandError, ErrorKind},
    executor::{ExecOutcome, Executor, Outcome},
    policy,
    sandbox::RunRequestBuilder,
    scanner::Command,
};

impl Executor {
    pub(crate) async fn handle_exec(&self, command: &Command) -> Outcome {
        // Policy first; a rejected command never creates a container.
        if let Err(e) = policy::validate_exec(command.argument(), self.config.exec_whitelist()) {
            return Outcome::failure(e);
        }

        if let Err(e) = self.ensure_exec_image().await {
            return Outcome::failure(e);
        }

        let mut builder = RunRequestBuilder::default()
            .image(self.config.exec_image().clone())
            .command(command.argument().clone())
            .repo_root(self.config.repo_root().clone())
            .memory(self.config.exec_memory().clone())
            .cpus(self.config.exec_cpus())
            .timeout(self.config.exec_timeout());
        if let Some(stdin) = command.content() {
            builder = builder.stdin(stdin.clone());
        }
        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                return Outcome::failure(CommandError::new(ErrorKind::ExecError, e.to_string()))
            }
        };

        let run = match self.sandbox.run(&request).await {
            Ok(run) => run,
            Err(e) => return Outcome::failure(CommandError::wrap(ErrorKind::ExecError, &e)),
        };

        let exec = ExecOutcome {
            exit_code: run.exit_code(),
            stdout: run.stdout().clone(),
            stderr: run.stderr().clone(),
            combined: run.combined(),
        };
        let status = if run.timed_out() {
            "timeout"
        } else if run.success() {
            "completed"
        } else {
            "failed"
        };
        let detail = format!(
            "exit_code:{},duration:{:.2}s,status:{}",
            run.exit_code(),
            run.duration().as_secs_f64(),
            status
        );

        if run.timed_out() {
            let error = CommandError::new(
                ErrorKind::ExecTimeout,
                format!(
                    "command exceeded its {}s limit",
                    self.config.exec_timeout_secs()
                ),
            );
            return Outcome::failure_with_detail(error, detail).with_exec(exec);
        }
        if !run.success() {
            let error = CommandError::new(
                ErrorKind::ExecFailed(run.exit_code()),
                format!(
                    "command exited with {}: {}",
                    run.exit_code(),
                    run.stderr().trim()
                ),
            );
            return Outcome::failure_with_detail(error, detail).with_exec(exec);
        }

        Outcome::success(run.combined(), detail).with_exec(exec)
    }

    /// Inspect the exec image, pulling it when absent. The pull is not
    /// retried; a missing image is the operator's responsibility.
    async fn ensure_exec_image(&self) -> Result<(), CommandError> {
        let image = self.config.exec_image();
        match self.sandbox.runtime().image_exists(image).await {
            Ok(true) => Ok(()),
            Ok(false) => self
                .sandbox
                .runtime()
                .pull_image(image)
                .await
                .map_err(|e| CommandError::wrap(ErrorKind::DockerImage, &e)),
            Err(e) => Err(CommandError::wrap(ErrorKind::DockerUnavailable, &e)),
        }
    }
}
