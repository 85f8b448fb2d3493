//! The STP wire codec.
//!
//! A segment is a 4-byte big-endian header (two bytes type, two bytes
//! sequence number) optionally followed by payload. Only DATA segments carry
//! payload, and a DATA payload is 1..=MSS bytes. There is no checksum; the
//! substrate is assumed not to corrupt datagrams.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{HEADER_LEN, MSS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Data = 0,
    Ack = 1,
    Syn = 2,
    Fin = 3,
    Reset = 4,
}

impl SegmentKind {
    fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(SegmentKind::Data),
            1 => Some(SegmentKind::Ack),
            2 => Some(SegmentKind::Syn),
            3 => Some(SegmentKind::Fin),
            4 => Some(SegmentKind::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Data => "DATA",
            SegmentKind::Ack => "ACK",
            SegmentKind::Syn => "SYN",
            SegmentKind::Fin => "FIN",
            SegmentKind::Reset => "RESET",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub seq: u16,
    pub payload: Bytes,
}

impl Segment {
    pub fn data(seq: u16, payload: Bytes) -> Self {
        Segment {
            kind: SegmentKind::Data,
            seq,
            payload,
        }
    }

    pub fn ack(seq: u16) -> Self {
        Segment {
            kind: SegmentKind::Ack,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn syn(seq: u16) -> Self {
        Segment {
            kind: SegmentKind::Syn,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn fin(seq: u16) -> Self {
        Segment {
            kind: SegmentKind::Fin,
            seq,
            payload: Bytes::new(),
        }
    }

    /// RESET always carries sequence number zero.
    pub fn reset() -> Self {
        Segment {
            kind: SegmentKind::Reset,
            seq: 0,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(self.kind as u16);
        buf.put_u16(self.seq);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut datagram: &[u8]) -> Result<Self, SegmentError> {
        if datagram.len() < HEADER_LEN {
            return Err(SegmentError::Truncated(datagram.len()));
        }

        let raw = datagram.get_u16();
        let seq = datagram.get_u16();
        let kind = SegmentKind::from_wire(raw).ok_or(SegmentError::UnknownType(raw))?;

        let payload = match kind {
            SegmentKind::Data => {
                if datagram.is_empty() || datagram.len() > MSS {
                    return Err(SegmentError::BadDataLength(datagram.len()));
                }

                Bytes::copy_from_slice(datagram)
            }
            _ => {
                if !datagram.is_empty() {
                    return Err(SegmentError::UnexpectedPayload(kind));
                }

                Bytes::new()
            }
        };

        Ok(Segment { kind, seq, payload })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("datagram of {0} bytes is shorter than the STP header")]
    Truncated(usize),

    #[error("unknown segment type {0}")]
    UnknownType(u16),

    #[error("{0} segment carries a payload")]
    UnexpectedPayload(SegmentKind),

    #[error("DATA payload of {0} bytes outside 1..=1000")]
    BadDataLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let seg = Segment::data(65535, Bytes::from_static(b"abc"));
        let wire = seg.encode();

        assert_eq!(wire.len(), HEADER_LEN + 3);
        assert_eq!(Segment::decode(&wire).unwrap(), seg);
    }

    #[test]
    fn control_round_trip() {
        for seg in [
            Segment::ack(1),
            Segment::syn(64999),
            Segment::fin(0),
            Segment::reset(),
        ] {
            let wire = seg.encode();
            assert_eq!(wire.len(), HEADER_LEN);
            assert_eq!(Segment::decode(&wire).unwrap(), seg);
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let wire = Segment::syn(0x1234).encode();
        assert_eq!(&wire[..], &[0x00, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn rejects_truncated_datagrams() {
        assert_eq!(Segment::decode(&[]), Err(SegmentError::Truncated(0)));
        assert_eq!(
            Segment::decode(&[0, 0, 0]),
            Err(SegmentError::Truncated(3))
        );
    }

    #[test]
    fn rejects_unknown_types() {
        assert_eq!(
            Segment::decode(&[0x00, 0x05, 0x00, 0x00]),
            Err(SegmentError::UnknownType(5))
        );
        assert_eq!(
            Segment::decode(&[0xff, 0x00, 0x00, 0x00]),
            Err(SegmentError::UnknownType(0xff00))
        );
    }

    #[test]
    fn rejects_payload_on_control_segments() {
        assert_eq!(
            Segment::decode(&[0x00, 0x01, 0x00, 0x00, 0xaa]),
            Err(SegmentError::UnexpectedPayload(SegmentKind::Ack))
        );
    }

    #[test]
    fn rejects_bad_data_lengths() {
        // Empty DATA payload.
        assert_eq!(
            Segment::decode(&[0x00, 0x00, 0x00, 0x00]),
            Err(SegmentError::BadDataLength(0))
        );

        // One byte over MSS.
        let mut wire = vec![0x00, 0x00, 0x00, 0x00];
        wire.extend_from_slice(&[0u8; MSS + 1]);
        assert_eq!(
            Segment::decode(&wire),
            Err(SegmentError::BadDataLength(MSS + 1))
        );
    }
}
