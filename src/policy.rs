//! Request validation against the security policy: repository containment,
//! exclusion patterns, write-extension allow list and the exec command
//! whitelist.

use crate::error::{CommandError, ErrorKind};
use glob::Pattern;
use std::path::{Component, Path, PathBuf};

/// Longest accepted exec command, in bytes.
const MAX_COMMAND_LEN: usize = 1000;

type Result<T> = std::result::Result<T, CommandError>;

/// Lexically clean a path: resolve `.` and `..` segments and collapse
/// redundant separators. Symlinks are NOT resolved; the container boundary
/// is authoritative and host-side validation stays purely lexical.
fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let ends_with_normal = matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                );
                let at_root = matches!(
                    cleaned.components().next_back(),
                    Some(Component::RootDir)
                );
                if ends_with_normal {
                    cleaned.pop();
                } else if !at_root {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Validate a requested path against the repository boundary and the
/// exclusion patterns. Returns the absolute, canonical path.
pub fn validate_path(requested: &str, repo_root: &Path, excludes: &[String]) -> Result<PathBuf> {
    let cleaned = clean(Path::new(requested));

    if cleaned
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(CommandError::new(
            ErrorKind::PathTraversal,
            format!("path {requested} escapes the repository root"),
        ));
    }

    let absolute = if cleaned.is_absolute() {
        cleaned
    } else {
        clean(&repo_root.join(cleaned))
    };

    let root = repo_root.to_string_lossy();
    let candidate = absolute.to_string_lossy();
    let contained = candidate == root
        || (candidate.starts_with(root.as_ref())
            && candidate.as_bytes().get(root.len()) == Some(&b'/'));
    if !contained {
        return Err(CommandError::new(
            ErrorKind::OutsideRepo,
            format!("path {} is outside the repository root {}", candidate, root),
        ));
    }

    for pattern in excludes {
        if matches_exclusion(&absolute, repo_root, pattern) {
            return Err(CommandError::new(
                ErrorKind::Excluded,
                format!("path {} matches excluded pattern {}", candidate, pattern),
            ));
        }
    }

    Ok(absolute)
}

/// A pattern excludes a path when it glob-matches the basename, or when it
/// names a directory prefix of the repo-relative path.
fn matches_exclusion(absolute: &Path, repo_root: &Path, pattern: &str) -> bool {
    if let Some(name) = absolute.file_name().map(|n| n.to_string_lossy()) {
        if Pattern::new(pattern).is_ok_and(|p| p.matches(&name)) {
            return true;
        }
    }

    if let Ok(relative) = absolute.strip_prefix(repo_root) {
        let relative = relative.to_string_lossy();
        let prefix = pattern.trim_end_matches('/');
        if relative == prefix || relative.starts_with(&format!("{prefix}/")) {
            return true;
        }
    }

    false
}

/// Validate a write target against the allowed-extension set. An empty set
/// accepts every extension.
pub fn validate_extension(path: &Path, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() {
        return Ok(());
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    let accepted = extension.as_deref().is_some_and(|ext| {
        allowed
            .iter()
            .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
    });

    if accepted {
        Ok(())
    } else {
        Err(CommandError::new(
            ErrorKind::ExtensionDenied,
            format!(
                "extension of {} is not in the allowed set [{}]",
                path.display(),
                allowed.join(", ")
            ),
        ))
    }
}

/// Validate an exec command against the whitelist.
///
/// A command is accepted when its base token equals a whitelist entry, or
/// when the whole trimmed command starts with a whitelist entry. This is a
/// prefix policy: a whitelist entry `go` admits `gotest`. Shell
/// metacharacters are intentionally not parsed; the container is the
/// security boundary.
pub fn validate_exec(command: &str, whitelist: &[String]) -> Result<()> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(CommandError::new(
            ErrorKind::ExecValidation,
            "command is empty",
        ));
    }
    if trimmed.len() > MAX_COMMAND_LEN {
        return Err(CommandError::new(
            ErrorKind::TooLong,
            format!(
                "command is {} bytes, limit is {}",
                trimmed.len(),
                MAX_COMMAND_LEN
            ),
        ));
    }
    if trimmed.bytes().any(|b| b <= 0x08) {
        return Err(CommandError::new(
            ErrorKind::ControlChars,
            "command contains control characters",
        ));
    }
    if whitelist.is_empty() {
        return Err(CommandError::new(
            ErrorKind::EmptyWhitelist,
            "exec whitelist is empty, all commands are denied",
        ));
    }

    let base = trimmed.split_whitespace().next().unwrap_or_default();
    let allowed = whitelist
        .iter()
        .any(|entry| base == entry || trimmed.starts_with(entry.as_str()));

    if allowed {
        Ok(())
    } else {
        Err(CommandError::new(
            ErrorKind::ExecValidation,
            format!("command base {base} is not whitelisted"),
        ))
    }
}
