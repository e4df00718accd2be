//! External command helpers for CLI-backed channels.
//! No shell is used; arguments are passed as a list to avoid injection.

use crate::error::ChannelError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Longest a single CLI invocation may run before it is killed.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `program args...` to completion. Returns stdout; on a non-zero exit the error
/// carries stdout and stderr combined.
pub async fn run(program: &str, args: &[String]) -> Result<String, ChannelError> {
    run_with_timeout(program, args, EXEC_TIMEOUT).await
}

/// [`run`] with an explicit limit. On timeout the child is killed.
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    limit: Duration,
) -> Result<String, ChannelError> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(limit, child)
        .await
        .map_err(|_| {
            ChannelError::connection(format!("{} did not finish within {:?}", program, limit))
        })?
        .map_err(|e| ChannelError::connection(format!("exec {} failed: {}", program, e)))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        let mut msg = stdout;
        if !stderr.is_empty() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            msg.push_str(&stderr);
        }
        Err(ChannelError::connection(format!(
            "{} exit {}: {}",
            program,
            output.status,
            msg.trim()
        )))
    }
}

/// Parse newline-delimited JSON, skipping blank and malformed lines.
pub fn parse_ndjson(output: &str) -> Vec<serde_json::Value> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("skipping non-JSON line ({}): {}", e, truncate(l, 200));
                None
            }
        })
        .collect()
}

/// Resolve a binary name or path the way the shell would: paths are checked directly,
/// bare names are looked up on PATH.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// First `max` characters of `s`, for log lines.
pub fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_skips_garbage() {
        let out = "{\"id\":1}\n\nnot json\n  {\"id\":2}  \n";
        let values = parse_ndjson(out);
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["id"], 2);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[cfg(unix)]
    #[test]
    fn finds_sh_on_path_and_rejects_missing() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-courier").is_none());
        assert!(find_executable("/nonexistent/dir/signal-cli").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_reports_stderr_on_failure() {
        let ok = run("sh", &["-c".into(), "echo out".into()]).await.unwrap();
        assert_eq!(ok.trim(), "out");
        let err = run("sh", &["-c".into(), "echo boom >&2; exit 3".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_kills_commands_that_hang() {
        let started = std::time::Instant::now();
        let err = run_with_timeout("sh", &["-c".into(), "sleep 30".into()], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not finish"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
