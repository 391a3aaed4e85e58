//! The driver loop: pull commands out of the input stream, execute them one
//! at a time and emit delimited output frames.
//!
//! The loop itself is single-threaded and synchronous; each command runs to
//! completion before the next byte is scanned. EOF on the input stream ends
//! the session and shuts the container pool down.

use crate::{
    executor::{ExecutionResult, Executor},
    pool::ContainerPool,
    scanner::{Scanner, Verb},
};
use anyhow::{Context, Result};
use log::{debug, info};
use std::{sync::Arc, time::Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_BUFFER: usize = 8192;

pub struct Driver {
    executor: Executor,
    pool: Option<Arc<ContainerPool>>,
    started: Instant,
}

impl Driver {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            pool: None,
            started: Instant::now(),
        }
    }

    /// Attach a container pool whose lifecycle this driver manages.
    pub fn with_pool(mut self, pool: Arc<ContainerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Consume the input stream until EOF.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut input = input;
        let mut output = output;
        let mut scanner = Scanner::new();
        let mut buffer = [0u8; READ_BUFFER];
        let mut commands = Vec::new();

        loop {
            let read = input.read(&mut buffer).await.context("read input stream")?;
            if read == 0 {
                break;
            }

            scanner.feed(&buffer[..read], &mut commands);
            for command in commands.drain(..) {
                let result = self.executor.dispatch(command).await;
                let frame = self.format_frame(&result);
                output
                    .write_all(frame.as_bytes())
                    .await
                    .context("write output frame")?;
                output.flush().await.context("flush output stream")?;
            }
        }

        debug!("Input stream reached EOF");
        if let Some(pool) = &self.pool {
            info!("Shutting down container pool");
            pool.shutdown().await;
        }
        Ok(())
    }

    fn format_frame(&self, result: &ExecutionResult) -> String {
        let command = result.command();
        let mut frame = String::from("=== LLM TOOL START ===\n");

        match result.error() {
            None => {
                frame.push_str(&format!(
                    "=== COMMAND: {} {} ===\n",
                    command.verb(),
                    command.argument()
                ));
                match command.verb() {
                    Verb::Open => {
                        frame.push_str(&format!("=== FILE: {} ===\n", command.argument()));
                        frame.push_str(result.result());
                        if !result.result().ends_with('\n') {
                            frame.push('\n');
                        }
                        frame.push_str("=== END FILE ===\n");
                    }
                    Verb::Write => {
                        frame.push_str(result.result());
                        frame.push('\n');
                    }
                    Verb::Exec => {
                        if let Some(exec) = result.exec() {
                            frame.push_str(&format!("Exit code: {}\n", exec.exit_code()));
                        }
                        frame.push_str(&format!(
                            "Duration: {:.2}s\n",
                            result.duration().as_secs_f64()
                        ));
                        if !result.result().is_empty() {
                            frame.push_str(result.result());
                            if !result.result().ends_with('\n') {
                                frame.push('\n');
                            }
                        }
                    }
                    Verb::Search => {
                        frame.push_str(result.result());
                        if !result.result().ends_with('\n') {
                            frame.push('\n');
                        }
                    }
                }
                frame.push_str("=== END COMMAND ===\n");
            }
            Some(error) => {
                frame.push_str(&format!("=== ERROR: {} ===\n", error.kind()));
                frame.push_str(&format!("Message: {}\n", error.sanitized()));
                frame.push_str(&format!(
                    "Command: {} {}\n",
                    command.verb(),
                    command.argument()
                ));
                frame.push_str("=== END ERROR ===\n");
            }
        }

        frame.push_str("=== LLM TOOL COMPLETE ===\n");
        frame.push_str(&format!(
            "Commands executed: {}\n",
            self.executor.completed_commands()
        ));
        frame.push_str(&format!(
            "Time elapsed: {:.2}s\n",
            self.started.elapsed().as_secs_f64()
        ));
        frame.push_str("=== END ===\n");
        frame
    }
}
