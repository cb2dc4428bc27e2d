//! ztp-ssh - Remote management channel for ztpd
//!
//! This crate wraps the system OpenSSH client to provide async,
//! timeout-bounded access to switches over a single service account.

pub mod query;
pub mod transport;

pub use query::{
    marker_check_command, parse_serial, shell_quote, RemoteChannel, SshChannel, SERIAL_COMMAND,
};
pub use transport::{CommandOutput, SshConfig, SshError, SshTransport};
