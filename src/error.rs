use thiserror::Error;

/// All errors produced by the RelayStream transport layer.
#[derive(Debug, Error)]
pub enum RelayStreamError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown datagram tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("message type {0} has no registered handler")]
    UnknownType(u32),

    #[error("message type {0} has no registered connect handler")]
    NoConnectHandler(u32),

    #[error("type {0} already has a registered handler")]
    DuplicateRegistration(u32),

    #[error("open/close handler already registered")]
    DuplicateLifecycleHandler,

    #[error("no decoder registered for type {0}")]
    UnknownDecoder(u32),

    #[error("serialization error encoding message: {0}")]
    SerializationError(String),

    #[error("peer unreachable: attempts exhausted for {0}")]
    PeerUnreachable(std::net::SocketAddr),

    #[error("stream is closing, cannot enqueue")]
    StreamClosing,

    #[error("stream not found for {0}")]
    StreamNotFound(std::net::SocketAddr),

    #[error("outbound stream already exists for this socket")]
    OutboundStreamExists,

    #[error("socket is closing")]
    SocketClosing,

    #[error("socket is not listening")]
    NotListening,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayStreamError>;
