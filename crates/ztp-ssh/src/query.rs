//! Management-channel queries and the [`RemoteChannel`] seam used by the engine

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, trace};

use crate::transport::{CommandOutput, SshConfig, SshError, SshTransport};

/// Privileged read of the chassis serial number
pub const SERIAL_COMMAND: &str = "sudo -n cat /sys/class/dmi/id/product_serial 2>/dev/null \
     || sudo -n dmidecode -s system-serial-number 2>/dev/null";

/// Serial strings vendors ship in place of a real value
const SERIAL_PLACEHOLDERS: &[&str] = &[
    "",
    "0",
    "none",
    "n/a",
    "na",
    "not specified",
    "not available",
    "to be filled by o.e.m.",
    "default string",
    "system serial number",
    "0123456789",
];

/// Extract a usable serial number from command output
pub fn parse_serial(stdout: &str) -> Option<String> {
    let serial = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;
    let lowered = serial.to_ascii_lowercase();
    if SERIAL_PLACEHOLDERS.contains(&lowered.as_str()) {
        return None;
    }
    Some(serial.to_string())
}

/// Shell command that prints `present` iff `marker` exists
pub fn marker_check_command(marker: &str) -> String {
    format!("test -e {} && echo present || echo absent", shell_quote(marker))
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Operations the discovery engine performs over the management channel
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Open an authenticated session and run a no-op
    async fn open_session(&self, ip: Ipv4Addr) -> Result<(), SshError>;

    /// Read the hardware serial; placeholder values are `None`
    async fn read_serial(&self, ip: Ipv4Addr) -> Option<String>;

    /// Whether the post-provision marker exists on the device
    async fn marker_present(&self, ip: Ipv4Addr, marker: &str) -> Result<bool, SshError>;

    /// Copy local files into `remote_dir`
    async fn copy_files(
        &self,
        ip: Ipv4Addr,
        files: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), SshError>;

    /// Run a shell script remotely with the provision timeout
    async fn run_script(&self, ip: Ipv4Addr, script: &str) -> Result<CommandOutput, SshError>;
}

/// [`RemoteChannel`] backed by the system ssh client
#[derive(Debug, Clone)]
pub struct SshChannel {
    transport: SshTransport,
}

impl SshChannel {
    pub fn new(config: SshConfig) -> Self {
        Self {
            transport: SshTransport::new(config),
        }
    }

    pub fn transport(&self) -> &SshTransport {
        &self.transport
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn open_session(&self, ip: Ipv4Addr) -> Result<(), SshError> {
        let limit = self.transport.config().command_timeout;
        let output = self.transport.exec(ip, "true", limit).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SshError::Failed {
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    async fn read_serial(&self, ip: Ipv4Addr) -> Option<String> {
        let limit = self.transport.config().command_timeout;
        match self.transport.exec(ip, SERIAL_COMMAND, limit).await {
            Ok(output) if output.success() => {
                let serial = parse_serial(&output.stdout);
                trace!(ip = %ip, serial = ?serial, "Serial read");
                serial
            }
            Ok(output) => {
                debug!(ip = %ip, status = ?output.status, "Serial read returned non-zero");
                None
            }
            Err(e) => {
                debug!(ip = %ip, error = %e, "Serial read failed");
                None
            }
        }
    }

    async fn marker_present(&self, ip: Ipv4Addr, marker: &str) -> Result<bool, SshError> {
        let limit = self.transport.config().command_timeout;
        let output = self
            .transport
            .exec(ip, &marker_check_command(marker), limit)
            .await?;
        Ok(output.stdout.trim() == "present")
    }

    async fn copy_files(
        &self,
        ip: Ipv4Addr,
        files: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), SshError> {
        let limit = self.transport.config().provision_timeout;
        let mkdir = format!("mkdir -p {}", shell_quote(remote_dir));
        let prepared = self.transport.exec(ip, &mkdir, limit).await?;
        if !prepared.success() {
            return Err(SshError::Failed {
                status: prepared.status,
                stderr: prepared.stderr,
            });
        }
        self.transport.copy(ip, files, remote_dir, limit).await
    }

    async fn run_script(&self, ip: Ipv4Addr, script: &str) -> Result<CommandOutput, SshError> {
        let limit = self.transport.config().provision_timeout;
        self.transport.exec(ip, script, limit).await
    }
}
