//! The local client API surface: connection tracking, stream framing,
//! command dispatch, and the unix-socket endpoints.

pub mod codec;
pub(crate) mod commands;
pub mod connection;
pub mod listener;

pub use codec::{ClientCodec, ClientFrame};
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionMetadata, ConnectionRegistry, EndpointKind,
    OutboundMessage, ShutdownReply,
};
pub use listener::{serve, EndpointConfig};
