//! Layered error types and their mapping onto client-protocol statuses.
//!
//! Recoverable errors are logged and dropped at the layer that detects them;
//! errors affecting a specific client request travel back as a negative
//! `status` in the reply. `to_status` is the single translation point.

use memberd_core::client::status;
use thiserror::Error;

/// Startup/configuration failures. These abort startup synchronously.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cluster name '{0}' is too long")]
    ClusterNameTooLong(String),
    #[error("node name '{0}' not found in the configured node list")]
    UnknownNodeName(String),
    #[error("node {0} has no node id configured")]
    MissingNodeId(String),
    #[error("node id {0} out of range")]
    NodeIdOutOfRange(u32),
    #[error("interface address is localhost, a real host address is required")]
    LocalhostAddress,
    #[error("interface address family does not match the multicast address family")]
    FamilyMismatch,
    #[error("two-node mode requires exactly two nodes with one vote each (nodes={nodes}, votes={votes})")]
    TwoNodeShape { nodes: usize, votes: u32 },
    #[error("negative or zero votes are not allowed for node {0}")]
    BadVotes(String),
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration version went backwards ({ours} -> {theirs})")]
    VersionWentBackwards { ours: u32, theirs: u32 },
}

/// Faults in messages arriving from the cluster. The offending message is
/// dropped; some trigger a join rejection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("wrong cluster name (remote '{remote}', local '{local}')")]
    WrongClusterName { remote: String, local: String },
    #[error("wrong cluster id (remote {remote}, local {local})")]
    WrongClusterId { remote: u16, local: u16 },
    #[error("incompatible protocol version (remote {remote}, local {local})")]
    WrongVersion { remote: u32, local: u32 },
    #[error("wrong configuration version (remote {remote}, local {local})")]
    WrongConfigVersion { remote: u32, local: u32 },
    #[error("node id {id} already in use by {name}")]
    NodeIdInUse { id: u32, name: String },
    #[error("duplicate node name {0}")]
    DuplicateName(String),
    #[error("stale generation {got}, current {current}")]
    StaleGeneration { got: u32, current: u32 },
    #[error("wrong address length (remote {remote}, local {local})")]
    WrongAddressLength { remote: u32, local: u32 },
    #[error("undecodable message: {0}")]
    Decode(#[from] memberd_core::DecodeError),
}

/// Failures of client-requested operations, mapped to reply statuses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not connected to the cluster")]
    NotConnected,
    #[error("not a cluster member")]
    NotAMember,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("already in use")]
    AddressInUse,
    #[error("operation already done or in progress")]
    Already,
    #[error("no such entity")]
    NoSuchEntity,
    #[error("no such node")]
    NoSuchNode,
    #[error("busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation would block; reply follows later")]
    WouldBlock,
    #[error("value out of range")]
    OutOfRange,
    #[error("i/o failure")]
    Io,
}

impl ServiceError {
    /// The wire status a client sees for this error.
    #[must_use]
    pub fn to_status(&self) -> i32 {
        match self {
            ServiceError::NotConnected => status::NOT_CONNECTED,
            ServiceError::NotAMember | ServiceError::NoSuchEntity => status::NO_SUCH_ENTITY,
            ServiceError::InvalidArgument => status::INVALID_ARGUMENT,
            ServiceError::AddressInUse => status::ADDRESS_IN_USE,
            ServiceError::Already => status::ALREADY,
            ServiceError::NoSuchNode => status::NO_SUCH_PROCESS,
            ServiceError::Busy => status::BUSY,
            ServiceError::TimedOut => status::TIMED_OUT,
            ServiceError::PermissionDenied => status::PERMISSION_DENIED,
            ServiceError::WouldBlock => status::WOULD_BLOCK,
            ServiceError::OutOfRange => status::OUT_OF_RANGE,
            ServiceError::Io => status::IO_ERROR,
        }
    }
}

/// Shorthand for command handlers: a successful positive/zero status or a
/// service error.
pub type CmdResult = Result<i32, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_negative() {
        let errors = [
            ServiceError::NotConnected,
            ServiceError::NotAMember,
            ServiceError::InvalidArgument,
            ServiceError::AddressInUse,
            ServiceError::Already,
            ServiceError::NoSuchEntity,
            ServiceError::NoSuchNode,
            ServiceError::Busy,
            ServiceError::TimedOut,
            ServiceError::PermissionDenied,
            ServiceError::WouldBlock,
            ServiceError::OutOfRange,
            ServiceError::Io,
        ];
        for err in errors {
            assert!(err.to_status() < 0, "{err} must map to a negative status");
        }
    }

    #[test]
    fn distinct_common_statuses() {
        assert_ne!(
            ServiceError::NotConnected.to_status(),
            ServiceError::NoSuchEntity.to_status()
        );
        assert_ne!(
            ServiceError::AddressInUse.to_status(),
            ServiceError::InvalidArgument.to_status()
        );
    }

    #[test]
    fn protocol_errors_format_with_context() {
        let err = ProtocolError::WrongClusterId {
            remote: 7,
            local: 9,
        };
        assert!(err.to_string().contains("remote 7"));
    }
}
