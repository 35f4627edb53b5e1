//! Subprocess helpers for git and docker.

use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{BattleError, BattleResult};

/// Backoff delays for transient git retries (milliseconds).
const RETRY_DELAYS_MS: &[u64] = &[100, 500, 2000];

/// Run a command and return trimmed stdout, failing on non-zero exit.
pub(crate) async fn run(program: &str, args: &[&str], cwd: &Path) -> BattleResult<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BattleError::command(format!("{program} {}", args.join(" ")), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BattleError::command(
            format!("{program} {}", args.join(" ")),
            stderr.trim().to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether a command exits successfully. Spawn failures count as `false`.
pub(crate) async fn succeeds(program: &str, args: &[&str], cwd: &Path) -> bool {
    run(program, args, cwd).await.is_ok()
}

/// Run git, retrying transient lock failures with backoff.
pub(crate) async fn git(args: &[&str], cwd: &Path) -> BattleResult<String> {
    let mut attempt = 0usize;
    loop {
        match run("git", args, cwd).await {
            Ok(out) => return Ok(out),
            Err(e) if e.is_retryable() && attempt < RETRY_DELAYS_MS.len() => {
                let delay = RETRY_DELAYS_MS[attempt];
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay,
                    "Transient git failure, retrying: {e}"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether a working container runtime is reachable.
pub(crate) async fn docker_available(cwd: &Path) -> bool {
    succeeds("docker", &["version", "--format", "{{.Server.Version}}"], cwd).await
}
