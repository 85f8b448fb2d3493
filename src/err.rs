use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {name}: {value:?}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("port {0} outside the dynamic range 49152..=65535")]
    PortOutOfRange(u16),

    #[error("input file {path}: {len} bytes exceeds the 800 KB limit")]
    FileTooLarge { path: PathBuf, len: u64 },

    #[error("handshake failed: no ACK after {0} SYN retransmissions")]
    HandshakeExhausted(u32),

    #[error("teardown failed: no ACK after {0} FIN retransmissions")]
    TeardownExhausted(u32),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}
