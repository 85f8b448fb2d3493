use std::time::Duration;

mod err;
pub use err::*;

pub mod log;
pub mod seg;
pub mod seq;
pub mod timer;

pub mod receiver;
pub mod sender;

/// Maximum payload carried by a single DATA segment, in bytes.
pub const MSS: usize = 1000;

/// Size of the STP header on the wire.
pub const HEADER_LEN: usize = 4;

/// Both endpoints must bind within the dynamic/private port range.
pub const PORT_MIN: u16 = 49152;
pub const PORT_MAX: u16 = 65535;

/// Upper bound on the input file the sender accepts.
pub const MAX_FILE_LEN: u64 = 800 * 1024;

/// How many times a SYN or FIN is retransmitted before the connection is
/// torn down with a RESET.
pub const MAX_CTRL_RETRANSMITS: u32 = 3;

/// Hard wait the receiver performs after acknowledging the FIN.
pub const TIME_WAIT: Duration = Duration::from_secs(2);

/// Interval at which the receive loops re-check their shutdown flags while
/// polling the socket for readiness.
pub(crate) const POLL_INTERVAL_MS: i32 = 10;

pub(crate) fn parse_port(value: &str) -> Result<u16, Error> {
    let port: u16 = value.parse().map_err(|_| Error::InvalidArgument {
        name: "port",
        value: value.to_string(),
    })?;

    if !(PORT_MIN..=PORT_MAX).contains(&port) {
        return Err(Error::PortOutOfRange(port));
    }

    Ok(port)
}
