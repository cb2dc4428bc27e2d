//! Async ssh/scp transport built on the system OpenSSH client

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Exit status OpenSSH uses for its own (connection/auth) failures
const SSH_CLIENT_FAILURE: i32 = 255;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Remote command failed (status {status:?}): {stderr}")]
    Failed { status: Option<i32>, stderr: String },
}

impl SshError {
    /// Classify the stderr of a failed ssh/scp invocation
    pub fn from_stderr(status: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim().to_string();
        if stderr.contains("Permission denied")
            || stderr.contains("Too many authentication failures")
            || stderr.contains("Authentication failed")
        {
            Self::AuthRejected(stderr)
        } else if stderr.contains("Connection refused") {
            Self::Refused(stderr)
        } else {
            Self::Failed { status, stderr }
        }
    }
}

/// Connection settings for the management service account
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Service account on the switches
    pub user: String,
    /// Private key used for the service account
    pub key_path: PathBuf,
    /// TCP connect timeout handed to ssh
    pub connect_timeout: Duration,
    /// Overall limit for one probe/query invocation
    pub command_timeout: Duration,
    /// Overall limit for copy and post-provision scripts
    pub provision_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ztp".to_string(),
            key_path: PathBuf::from("/etc/ztpd/id_ed25519"),
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(120),
        }
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// ssh/scp invoker for one service account
#[derive(Debug, Clone)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Options shared by ssh and scp
    fn common_args(&self) -> Vec<String> {
        let connect = self.config.connect_timeout.as_secs().max(1);
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", connect),
            "-i".into(),
            self.config.key_path.display().to_string(),
        ]
    }

    fn destination(&self, ip: Ipv4Addr) -> String {
        format!("{}@{}", self.config.user, ip)
    }

    /// Arguments for `ssh` running `remote_cmd` on `ip`
    pub fn ssh_args(&self, ip: Ipv4Addr, remote_cmd: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(self.destination(ip));
        args.push(remote_cmd.to_string());
        args
    }

    /// Arguments for `scp` copying `files` into `remote_dir` on `ip`
    pub fn scp_args(&self, ip: Ipv4Addr, files: &[PathBuf], remote_dir: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(self.common_args());
        args.extend(files.iter().map(|f| f.display().to_string()));
        args.push(format!("{}:{}/", self.destination(ip), remote_dir.trim_end_matches('/')));
        args
    }

    /// Run a remote command.
    ///
    /// ssh-level failures (exit 255) are returned as errors; a remote
    /// command that ran and exited non-zero is returned as output.
    pub async fn exec(
        &self,
        ip: Ipv4Addr,
        remote_cmd: &str,
        limit: Duration,
    ) -> Result<CommandOutput, SshError> {
        trace!(ip = %ip, cmd = %remote_cmd, "ssh exec");
        let output = run_with_timeout("ssh", &self.ssh_args(ip, remote_cmd), limit).await?;

        if output.status == Some(SSH_CLIENT_FAILURE) {
            debug!(ip = %ip, stderr = %output.stderr.trim(), "ssh failed");
            return Err(SshError::from_stderr(output.status, &output.stderr));
        }
        Ok(output)
    }

    /// Copy local files into a remote directory
    pub async fn copy(
        &self,
        ip: Ipv4Addr,
        files: &[PathBuf],
        remote_dir: &str,
        limit: Duration,
    ) -> Result<(), SshError> {
        debug!(ip = %ip, count = files.len(), dir = %remote_dir, "scp copy");
        let output = run_with_timeout("scp", &self.scp_args(ip, files, remote_dir), limit).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SshError::from_stderr(output.status, &output.stderr))
        }
    }
}

async fn run_with_timeout(
    program: &'static str,
    args: &[String],
    limit: Duration,
) -> Result<CommandOutput, SshError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, child)
        .await
        .map_err(|_| SshError::Timeout(limit))?
        .map_err(|source| SshError::Spawn { program, source })?;

    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
