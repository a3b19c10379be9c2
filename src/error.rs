use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Propagation rules: `Bind` and `TlsConfig` abort server startup; every
/// other variant is scoped to a single connection and is caught at the
/// session-loop boundary (log + close), never reaching the accept loop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bind error: {0}")]
    Bind(std::io::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection error: {0}")]
    Connection(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(FramingError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Failure to extract a complete protocol unit from the byte stream.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("peer disconnected before delimiter")]
    Disconnected,

    #[error("unit exceeded maximum size of {0} bytes")]
    UnitTooLarge(usize),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}

/// Protocol-level refusals. These never terminate a session: the state
/// machine converts them into a negative response on the wire.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed command or arguments.
    #[error("{0}")]
    Bad(String),

    /// Well-formed but semantically refused (unknown mailbox, bad index).
    #[error("{0}")]
    No(String),

    /// Command valid but illegal in the current session state.
    #[error("{0}")]
    Order(String),
}

impl ProtocolError {
    pub fn bad(msg: impl Into<String>) -> Self {
        ProtocolError::Bad(msg.into())
    }

    pub fn no(msg: impl Into<String>) -> Self {
        ProtocolError::No(msg.into())
    }

    pub fn order(msg: impl Into<String>) -> Self {
        ProtocolError::Order(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
