//! The open verb: policy-checked host-side file reads.

use crate::{
    error::{CommandError, ErrorKind},
    executor::{Executor, Outcome},
    policy,
    scanner::Command,
};
use std::io;

impl Executor {
    pub(crate) async fn handle_open(&self, command: &Command) -> Outcome {
        let path = match policy::validate_path(
            command.argument(),
            self.config.repo_root(),
            self.config.exclude_patterns(),
        ) {
            Ok(path) => path,
            Err(e) => return Outcome::failure(e),
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => return Outcome::failure(io_error(&e, command.argument(), "stat")),
        };
        if metadata.is_dir() {
            return Outcome::failure(CommandError::new(
                ErrorKind::ReadError,
                format!("{} is a directory", path.display()),
            ));
        }
        if metadata.len() > self.config.max_read_size() {
            return Outcome::failure(CommandError::new(
                ErrorKind::ResourceLimit,
                format!(
                    "{} is {} bytes, read limit is {}",
                    path.display(),
                    metadata.len(),
                    self.config.max_read_size()
                ),
            ));
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => return Outcome::failure(io_error(&e, command.argument(), "read")),
        };

        let detail = format!("bytes:{}", bytes.len());
        Outcome::success(String::from_utf8_lossy(&bytes).into_owned(), detail)
    }
}

fn io_error(e: &io::Error, argument: &str, action: &str) -> CommandError {
    let kind = match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::ReadError,
    };
    CommandError::new(kind, format!("{action} {argument}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{command, harness};
    use crate::scanner::Verb;
    use anyhow::Result;

    #[tokio::test]
    async fn returned_bytes_match_the_file() -> Result<()> {
        let h = harness();
        std::fs::write(h.repo.path().join("README.md"), "hi\n")?;

        let result = h.executor.dispatch(command(Verb::Open, "README.md")).await;

        assert!(result.success());
        assert_eq!(result.result(), "hi\n");

        let entries = h.audit.entries();
        assert_eq!(entries[0].detail, "bytes:3");
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let h = harness();
        let result = h.executor.dispatch(command(Verb::Open, "nope.txt")).await;
        assert_eq!(
            result.error().as_ref().unwrap().kind(),
            ErrorKind::FileNotFound
        );
    }

    #[tokio::test]
    async fn oversized_file_hits_the_resource_limit() -> Result<()> {
        let h = harness();
        let big = vec![b'x'; (h.executor.config.max_read_size() + 1) as usize];
        std::fs::write(h.repo.path().join("big.bin"), big)?;

        let result = h.executor.dispatch(command(Verb::Open, "big.bin")).await;
        assert_eq!(
            result.error().as_ref().unwrap().kind(),
            ErrorKind::ResourceLimit
        );
        Ok(())
    }

    #[tokio::test]
    async fn traversal_never_reaches_the_filesystem() {
        let h = harness();
        let result = h
            .executor
            .dispatch(command(Verb::Open, "../../etc/passwd"))
            .await;

        assert!(!result.success());
        let kind = result.error().as_ref().unwrap().kind();
        assert!(matches!(
            kind,
            ErrorKind::PathTraversal | ErrorKind::OutsideRepo
        ));
    }

    #[tokio::test]
    async fn excluded_paths_are_refused() -> Result<()> {
        let h = harness();
        std::fs::create_dir_all(h.repo.path().join(".git"))?;
        std::fs::write(h.repo.path().join(".git/config"), "[core]")?;

        let result = h.executor.dispatch(command(Verb::Open, ".git/config")).await;
        assert_eq!(result.error().as_ref().unwrap().kind(), ErrorKind::Excluded);
        Ok(())
    }

    #[tokio::test]
    async fn binary_content_is_returned_lossily() -> Result<()> {
        let h = harness();
        std::fs::write(h.repo.path().join("blob.bin"), [0xff, 0xfe, b'a'])?;

        let result = h.executor.dispatch(command(Verb::Open, "blob.bin")).await;
        assert!(result.success());
        assert!(result.result().contains('a'));
        Ok(())
    }
}
