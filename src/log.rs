//! The per-endpoint transfer log.
//!
//! Each endpoint appends one line per protocol event,
//! `<snd|rcv|drp> <time_ms> <TYPE> <seq> <payload_len>`, with timestamps in
//! milliseconds since the connection's first event (the SYN leaving the
//! sender, or the first SYN reaching the receiver). A statistics footer is
//! appended when the endpoint closes. Lines are flushed as they are written
//! so the log stays accurate across abnormal termination.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::seg::SegmentKind;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Snd,
    Rcv,
    Drp,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Snd => "snd",
            Direction::Rcv => "rcv",
            Direction::Drp => "drp",
        }
    }
}

#[derive(Debug)]
pub struct EventLog {
    out: BufWriter<File>,
    origin: Option<Instant>,
}

impl EventLog {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(EventLog {
            out: BufWriter::new(File::create(path)?),
            origin: None,
        })
    }

    /// Record one protocol event. The first event anchors the clock at zero.
    pub fn event(
        &mut self,
        dir: Direction,
        kind: SegmentKind,
        seq: u16,
        payload_len: usize,
    ) -> Result<(), Error> {
        let origin = *self.origin.get_or_insert_with(Instant::now);
        let ms = origin.elapsed().as_millis();

        writeln!(
            self.out,
            "{} {} {} {} {}",
            dir.tag(),
            ms,
            kind,
            seq,
            payload_len
        )?;
        self.out.flush()?;

        Ok(())
    }

    /// Append the closing statistics block.
    pub fn footer(&mut self, entries: &[(&str, u64)]) -> Result<(), Error> {
        writeln!(self.out)?;
        for (label, value) in entries {
            writeln!(self.out, "{label}: {value}")?;
        }
        self.out.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("stp-log-{}-{}", name, std::process::id()))
    }

    #[test]
    fn events_and_footer_render() {
        let path = scratch_path("render");
        let mut log = EventLog::create(&path).unwrap();

        log.event(Direction::Snd, SegmentKind::Syn, 64999, 0).unwrap();
        log.event(Direction::Rcv, SegmentKind::Ack, 65000, 0).unwrap();
        log.event(Direction::Drp, SegmentKind::Data, 65000, 1000)
            .unwrap();
        log.footer(&[("Original data transferred", 1000)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "snd 0 SYN 64999 0");
        assert!(lines[1].starts_with("rcv "));
        assert!(lines[1].ends_with(" ACK 65000 0"));
        assert!(lines[2].ends_with(" DATA 65000 1000"));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "Original data transferred: 1000");

        fs::remove_file(&path).ok();
    }
}
