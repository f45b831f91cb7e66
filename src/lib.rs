//! RelayStream -- reliable ordered message transport over UDP.
//!
//! Delivers typed application messages between two endpoints with
//! at-least-once ordered delivery: connect/close handshake, coalesced
//! retransmission with back-off, piggybacked acknowledgement, and
//! dead-peer detection, atop a multiplexing socket that can act as a
//! client (one outbound stream) and a server (many inbound streams keyed
//! by remote address) at the same time.

pub mod error;
pub mod frame;
pub mod oracle;
pub mod socket;
pub mod stream;
pub mod transport;

// Re-export key public types at crate root.
pub use error::{RelayStreamError, Result};
pub use oracle::{Message, Oracle, Registry, TypeId};
pub use socket::{
    ConnectFuture, ConnectHandler, CloseHandler, GeneralHandler, OpenHandler, Socket,
    SocketConfig, SocketHandle, StreamHandle, StreamMessageHandler, UserData,
};
pub use stream::{Stream, StreamConfig, StreamState};
pub use transport::{DatagramSocket, UdpTransport};
