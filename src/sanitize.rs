//! Textual sanitization of error messages before they are surfaced to the
//! LLM. The full, unsanitized text always goes to the audit log; only the
//! sanitized form leaves the process on the output stream.
//!
//! The rewrites are plain byte scans, applied in a fixed order:
//! absolute paths, container daemon boilerplate, user/host identifiers,
//! whitespace collapse. The function is idempotent.

const DAEMON_PREFIX: &str = "Error response from daemon:";
const LOGIN_MARKER: &str = "may require 'docker login'";
const ACCESS_DENIED: &str = "denied: requested access to the resource is denied";

/// Sanitize one error message.
pub fn sanitize(input: &str) -> String {
    let scrubbed = scrub_paths(input);
    let scrubbed = scrub_daemon_noise(&scrubbed);
    let scrubbed = scrub_identities(&scrubbed);
    collapse_whitespace(&scrubbed)
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')
}

fn is_windows_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '\\')
}

/// Replace absolute Unix (`/usr/lib/…`) and Windows (`C:\…`) paths with
/// `[path]`. A `/` only starts a match when the preceding character is not
/// itself a segment character, so relative fragments like `a/b` survive.
fn scrub_paths(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let prev = if i == 0 { None } else { Some(chars[i - 1]) };

        // Unix: '/' at a boundary followed by at least one segment character.
        if c == '/'
            && prev.map_or(true, |p| !is_segment_char(p))
            && chars.get(i + 1).is_some_and(|&n| is_segment_char(n))
        {
            let mut j = i + 1;
            while j < chars.len() && is_segment_char(chars[j]) {
                j += 1;
            }
            out.push_str("[path]");
            i = j;
            continue;
        }

        // Windows: drive letter, colon, backslash.
        if c.is_ascii_alphabetic()
            && prev.map_or(true, |p| !p.is_ascii_alphanumeric())
            && chars.get(i + 1) == Some(&':')
            && chars.get(i + 2) == Some(&'\\')
        {
            let mut j = i + 3;
            while j < chars.len() && is_windows_segment_char(chars[j]) {
                j += 1;
            }
            out.push_str("[path]");
            i = j;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

fn scrub_daemon_noise(input: &str) -> String {
    if input.contains(LOGIN_MARKER) {
        return "image not available".into();
    }

    let stripped = input.replace(DAEMON_PREFIX, "");
    let stripped = stripped.replace("manifest for", "image");
    let stripped = stripped.replace("not found", "not available");
    stripped.replace(ACCESS_DENIED, "access denied")
}

/// Rewrite `user '…'` and `host '…'` occurrences to their redacted forms.
fn scrub_identities(input: &str) -> String {
    let redacted = redact_quoted(input, "user '", "user [redacted]");
    redact_quoted(&redacted, "host '", "host [redacted]")
}

fn redact_quoted(input: &str, marker: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(marker) {
        let after = &rest[start + marker.len()..];
        match after.find('\'') {
            Some(end) => {
                out.push_str(&rest[..start]);
                out.push_str(replacement);
                rest = &after[end + 1..];
            }
            // Unterminated quote: leave the remainder untouched.
            None => break,
        }
    }

    out.push_str(rest);
    out
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
