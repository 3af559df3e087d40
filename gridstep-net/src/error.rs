use gridstep_core::ClientId;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A record or payload shorter than its declared length.
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// A (message type, message id) pair matching no known client-channel
    /// variant.
    #[error("unknown message variant: type {message_type:#06x}, id {message_id:#06x}")]
    UnknownVariant { message_type: u16, message_id: u16 },
    /// A control-channel record tag matching no known record.
    #[error("unknown control record tag {0}")]
    UnknownControlTag(u32),
    /// A solver-channel reply tag matching no known reply.
    #[error("unknown solver reply tag {0}")]
    UnknownSolverTag(u32),
    /// A declared frame length outside the channel's framing bounds; the
    /// stream can no longer be trusted to be record-aligned.
    #[error("declared record length {0} outside framing bounds")]
    FrameOutOfBounds(usize),
    /// The peer closed the connection (zero-byte receive).
    #[error("peer closed the connection")]
    PeerClosed,
    /// An OS-level send error, or a send on an already closed link.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The solver does not know the name a client registered under.
    #[error("client name not known to the solver: {0}")]
    NameNotFound(String),
    /// A controller record addressed an id with no registered session.
    #[error("no registered client with id {0}")]
    UnknownClientId(ClientId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
