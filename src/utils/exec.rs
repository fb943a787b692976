use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::process::Command;

pub async fn exec_capture(cmd: &str, args: &[&str]) -> Result<(i32, Vec<u8>, Vec<u8>)> {
    let mut c = Command::new(cmd);
    c.args(args);
    c.stdin(Stdio::null());
    c.stdout(Stdio::piped());
    c.stderr(Stdio::piped());
    let output = c
        .spawn()
        .with_context(|| format!("failed to spawn {}", cmd))?
        .wait_with_output()
        .await?;
    let code = output.status.code().unwrap_or(-1);
    Ok((code, output.stdout, output.stderr))
}

/// First few non-empty stderr lines, for log messages.
pub fn stderr_preview(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let preview = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join("; ");
    if preview.is_empty() {
        "none".to_string()
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_preview_empty() {
        assert_eq!(stderr_preview(b""), "none");
        assert_eq!(stderr_preview(b"\n  \n"), "none");
    }

    #[test]
    fn test_stderr_preview_takes_three_lines() {
        let out = stderr_preview(b"a\n\nb\nc\nd\n");
        assert_eq!(out, "a; b; c");
    }
}
