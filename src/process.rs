use std::process::{ExitStatus, Output};

use anyhow::{bail, Context};

// Small helpers for working with process::Output / exit statuses, shared by
// the git subprocess wrapper. Split out so git.rs doesn't get cluttered with
// exit-status plumbing.

pub trait OutputExt {
    // Returns Ok(()) if the process exited successfully, otherwise an error
    // including stdout/stderr for diagnosis.
    fn ok(&self) -> anyhow::Result<()>;

    // Like status.code(), but bails instead of returning None if the process
    // was killed by a signal - we don't expect that to happen to git.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn ok(&self) -> anyhow::Result<()> {
        if self.status.success() {
            return Ok(());
        }
        bail!(
            "process failed with {}\nstdout:\n{}\nstderr:\n{}",
            describe_status(&self.status),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .context(format!("process was killed by signal ({:?})", self.status))
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => format!("{status:?}"),
    }
}

// tokio::process::Command already exposes .arg/.args/.output/.status
// directly, this trait only exists to give a common name (`execute`) to
// "run, and turn a non-zero exit into an Err", used throughout git.rs.
pub trait CommandExt {
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for tokio::process::Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().await.context("spawning process")?;
        output.ok().context("process exited with error")?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_true_succeeds() {
        tokio::process::Command::new("true")
            .execute()
            .await
            .expect("'true' should succeed");
    }

    #[tokio::test]
    async fn execute_false_fails() {
        let result = tokio::process::Command::new("false").execute().await;
        assert!(result.is_err());
    }
}
