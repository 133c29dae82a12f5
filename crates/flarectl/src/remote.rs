//! Remote command execution over SSH.
//!
//! The orchestrator treats the transport as a narrow facade: run a command
//! on a host, copy files, check a directory. The production implementation
//! shells out to the system `ssh`/`scp` binaries in batch mode; everything
//! above it is written against the `RemoteExecutor` trait so the lifecycle
//! logic can be exercised with a scripted executor in tests.
//!
//! Connection failures, DNS failures, and auth failures are classified into
//! distinct error kinds so health tables can show a specific cause.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::SshSettings;
use crate::error::{Error, Result};

/// Exit code the ssh client itself uses for transport-level failures, as
/// opposed to the remote command's own exit code.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Narrow remote-execution facade.
#[allow(async_fn_in_trait)]
pub trait RemoteExecutor: Sync {
    /// Runs a shell command on the host and returns its output.
    ///
    /// A non-zero remote exit status is returned as a normal `ExecOutput`;
    /// only transport-level problems become errors.
    async fn run(&self, host: &str, command: &str) -> Result<ExecOutput>;

    /// Recursively copies a local file or directory to the host.
    async fn copy_to_remote(&self, host: &str, local: &Path, remote: &Path) -> Result<()>;

    /// Recursively copies a remote file or directory to the local machine.
    async fn copy_from_remote(&self, host: &str, remote: &Path, local: &Path) -> Result<()>;

    /// True when `path` exists on the host and is a directory.
    async fn is_dir(&self, host: &str, path: &Path) -> Result<bool>;

    /// Verifies the host accepts a session at all.
    async fn connect_check(&self, host: &str) -> Result<()>;
}

/// Runs a command and requires its exit status to be zero or in `allow`.
pub async fn run_checked<E: RemoteExecutor>(
    exec: &E,
    host: &str,
    command: &str,
    allow: &[i32],
) -> Result<ExecOutput> {
    let out = exec.run(host, command).await?;
    if out.success() || allow.contains(&out.status) {
        Ok(out)
    } else {
        Err(Error::RemoteCommand {
            host: host.to_string(),
            status: out.status,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Classifies an ssh/scp transport failure from its stderr.
pub fn classify_transport_failure(host: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let host = host.to_string();
    if lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
    {
        Error::UnknownHost { host }
    } else if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("host key verification failed")
    {
        Error::Authentication { host }
    } else {
        Error::HostUnreachable { host }
    }
}

/// Production executor over the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            user: settings.user.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
        }
    }

    fn target(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn transport_args(&self) -> [String; 6] {
        [
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ]
    }

    async fn wait_with_deadline(
        &self,
        host: &str,
        mut cmd: Command,
        what: &str,
    ) -> Result<Output> {
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        let fut = cmd.output();
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::RemoteCommand {
                host: host.to_string(),
                status: crate::health::EXIT_TIMEOUT,
                stderr: format!(
                    "{what} did not finish within {}s",
                    self.command_timeout.as_secs()
                ),
            }),
        }
    }

    async fn scp(&self, host: &str, source: String, dest: String) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(self.transport_args());
        cmd.arg("-r").arg("-q").arg(&source).arg(&dest);
        debug!(host, %source, %dest, "scp");
        let output = self.wait_with_deadline(host, cmd, "scp").await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(SSH_TRANSPORT_FAILURE) => Err(classify_transport_failure(host, &stderr)),
            code => Err(Error::RemoteCommand {
                host: host.to_string(),
                status: code.unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, command: &str) -> Result<ExecOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.transport_args());
        cmd.arg(self.target(host));
        cmd.arg(command);
        debug!(host, command, "ssh");
        let output = self.wait_with_deadline(host, cmd, "remote command").await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(SSH_TRANSPORT_FAILURE) => Err(classify_transport_failure(host, &stderr)),
            code => Ok(ExecOutput {
                status: code.unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            }),
        }
    }

    async fn copy_to_remote(&self, host: &str, local: &Path, remote: &Path) -> Result<()> {
        self.scp(
            host,
            local.display().to_string(),
            format!("{}:{}", self.target(host), remote.display()),
        )
        .await
    }

    async fn copy_from_remote(&self, host: &str, remote: &Path, local: &Path) -> Result<()> {
        self.scp(
            host,
            format!("{}:{}", self.target(host), remote.display()),
            local.display().to_string(),
        )
        .await
    }

    async fn is_dir(&self, host: &str, path: &Path) -> Result<bool> {
        let out = self
            .run(host, &format!("test -d {}", path.display()))
            .await?;
        Ok(out.success())
    }

    async fn connect_check(&self, host: &str) -> Result<()> {
        self.run(host, "true").await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted executor for driving lifecycle logic in tests.

    use std::collections::{HashMap, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{ExecOutput, RemoteExecutor};
    use crate::error::{Error, Result};

    /// One canned response for a host.
    #[derive(Debug, Clone)]
    pub(crate) enum Step {
        Out(i32, &'static str),
        Unreachable,
        Auth,
        UnknownHost,
    }

    /// Pops canned responses per host; an exhausted queue answers with a
    /// successful empty output so incidental commands don't need scripting.
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        steps: Mutex<HashMap<String, VecDeque<Step>>>,
        pub copies_to: Mutex<Vec<(String, PathBuf, PathBuf)>>,
        pub copies_from: Mutex<Vec<(String, PathBuf, PathBuf)>>,
        pub dirs: Mutex<Vec<(String, PathBuf)>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, host: &str, step: Step) {
            self.steps
                .lock()
                .unwrap()
                .entry(host.to_string())
                .or_default()
                .push_back(step);
        }

        pub fn push_out(&self, host: &str, stdout: &'static str) {
            self.push(host, Step::Out(0, stdout));
        }

        pub fn add_dir(&self, host: &str, path: &Path) {
            self.dirs
                .lock()
                .unwrap()
                .push((host.to_string(), path.to_path_buf()));
        }

        pub fn run_calls(&self, host: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .count()
        }

        fn next(&self, host: &str) -> Step {
            self.steps
                .lock()
                .unwrap()
                .get_mut(host)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Step::Out(0, ""))
        }

        fn resolve(&self, host: &str, step: Step) -> Result<ExecOutput> {
            match step {
                Step::Out(status, stdout) => Ok(ExecOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
                Step::Unreachable => Err(Error::HostUnreachable {
                    host: host.to_string(),
                }),
                Step::Auth => Err(Error::Authentication {
                    host: host.to_string(),
                }),
                Step::UnknownHost => Err(Error::UnknownHost {
                    host: host.to_string(),
                }),
            }
        }
    }

    impl RemoteExecutor for ScriptedExecutor {
        async fn run(&self, host: &str, command: &str) -> Result<ExecOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_string()));
            let step = self.next(host);
            self.resolve(host, step)
        }

        async fn copy_to_remote(&self, host: &str, local: &Path, remote: &Path) -> Result<()> {
            let step = self.next(host);
            self.resolve(host, step)?;
            self.copies_to.lock().unwrap().push((
                host.to_string(),
                local.to_path_buf(),
                remote.to_path_buf(),
            ));
            Ok(())
        }

        async fn copy_from_remote(&self, host: &str, remote: &Path, local: &Path) -> Result<()> {
            let step = self.next(host);
            self.resolve(host, step)?;
            self.copies_from.lock().unwrap().push((
                host.to_string(),
                remote.to_path_buf(),
                local.to_path_buf(),
            ));
            Ok(())
        }

        async fn is_dir(&self, host: &str, path: &Path) -> Result<bool> {
            Ok(self
                .dirs
                .lock()
                .unwrap()
                .iter()
                .any(|(h, p)| h == host && p == path))
        }

        async fn connect_check(&self, host: &str) -> Result<()> {
            let step = self.next(host);
            self.resolve(host, step).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_failure_is_unknown_host() {
        let err = classify_transport_failure(
            "node9",
            "ssh: Could not resolve hostname node9: Name or service not known",
        );
        assert!(matches!(err, Error::UnknownHost { host } if host == "node9"));
    }

    #[test]
    fn rejected_credentials_are_authentication() {
        let err = classify_transport_failure("node1", "user@node1: Permission denied (publickey)");
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[test]
    fn connect_problems_are_unreachable() {
        for stderr in [
            "ssh: connect to host node1 port 22: Connection refused",
            "ssh: connect to host node1 port 22: Connection timed out",
            "ssh: connect to host node1 port 22: No route to host",
        ] {
            let err = classify_transport_failure("node1", stderr);
            assert!(matches!(err, Error::HostUnreachable { .. }), "{stderr}");
        }
    }

    #[tokio::test]
    async fn run_checked_allows_listed_statuses() {
        let exec = testing::ScriptedExecutor::new();
        exec.push("node1", testing::Step::Out(1, ""));
        let out = run_checked(&exec, "node1", "kill ...", &[0, 1]).await.unwrap();
        assert_eq!(out.status, 1);
    }

    #[tokio::test]
    async fn run_checked_rejects_other_statuses() {
        let exec = testing::ScriptedExecutor::new();
        exec.push("node1", testing::Step::Out(127, ""));
        let err = run_checked(&exec, "node1", "missing-binary", &[0, 1])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteCommand { status: 127, .. }
        ));
    }
}
