//! The sender endpoint.
//!
//! The calling thread is the transmit context: it drives the lifecycle
//! (SYN_SENT, ESTABLISHED, CLOSING, FIN_WAIT), fills the window with new
//! DATA, and services the retransmission timer through `Condvar` waits
//! against the shared deadline. A spawned receive context blocks on the
//! socket, decodes acknowledgments, and applies them to the shared window,
//! firing fast retransmissions directly from the ACK stream.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::{fs, thread};

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::log::{Direction, EventLog};
use crate::seg::{Segment, SegmentKind};
use crate::timer::RetransmitTimer;
use crate::{Error, MAX_CTRL_RETRANSMITS, MAX_FILE_LEN, MSS, POLL_INTERVAL_MS};

mod window;
pub use window::{AckOutcome, SendWindow};

const USAGE: &str = "sender <sender_port> <receiver_port> <input_file> <max_win> <rto_ms>";

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub local_port: u16,
    pub peer_port: u16,
    pub input: PathBuf,
    /// Window size in bytes, a positive multiple of MSS.
    pub max_win: usize,
    pub rto: Duration,
    pub isn: u16,
    pub log_path: PathBuf,
}

impl SenderConfig {
    pub fn from_args(args: &[String]) -> Result<Self, Error> {
        let [sender_port, receiver_port, input, max_win, rto] = args else {
            return Err(Error::Usage(USAGE));
        };

        let local_port = crate::parse_port(sender_port)?;
        let peer_port = crate::parse_port(receiver_port)?;

        let max_win: usize = max_win.parse().map_err(|_| Error::InvalidArgument {
            name: "max_win",
            value: max_win.clone(),
        })?;
        if max_win == 0 || max_win % MSS != 0 {
            return Err(Error::InvalidArgument {
                name: "max_win",
                value: max_win.to_string(),
            });
        }

        let rto_ms: u64 = rto.parse().map_err(|_| Error::InvalidArgument {
            name: "rto",
            value: rto.clone(),
        })?;

        Ok(SenderConfig {
            local_port,
            peer_port,
            input: PathBuf::from(input),
            max_win,
            rto: Duration::from_millis(rto_ms),
            isn: rand::random(),
            log_path: PathBuf::from("sender_log.txt"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SenderStats {
    /// Original file bytes cumulatively acknowledged by the peer.
    pub data_bytes: u64,
    /// DATA segments put on the wire for the first time.
    pub data_segments: u64,
    /// DATA retransmissions, timeout and fast alike.
    pub retransmissions: u64,
    /// Duplicate acknowledgments observed.
    pub dup_acks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SynSent,
    Established,
    Closing,
    FinWait,
    Closed,
    /// The peer sent RESET.
    PeerReset,
    /// The receive context hit a fatal error; see `Shared::failure`.
    Failed,
}

#[derive(Debug)]
struct Shared {
    phase: Phase,
    window: SendWindow,
    timer: RetransmitTimer,
    stats: SenderStats,
    log: EventLog,
    failure: Option<Error>,
}

impl Shared {
    fn interrupted(&mut self) -> Option<Error> {
        match self.phase {
            Phase::PeerReset => Some(Error::ConnectionReset),
            Phase::Failed => Some(self.failure.take().unwrap_or(Error::ConnectionReset)),
            _ => None,
        }
    }
}

/// Transfer the configured file and return the footer statistics.
pub fn run(config: SenderConfig) -> Result<SenderStats, Error> {
    let file = fs::read(&config.input)?;
    if file.len() as u64 > MAX_FILE_LEN {
        return Err(Error::FileTooLarge {
            path: config.input.clone(),
            len: file.len() as u64,
        });
    }

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.local_port))?;
    socket.connect((Ipv4Addr::LOCALHOST, config.peer_port))?;
    let socket = Arc::new(socket);

    let shared = Arc::new((
        Mutex::new(Shared {
            phase: Phase::SynSent,
            window: SendWindow::new(config.isn, config.max_win, Bytes::from(file)),
            timer: RetransmitTimer::new(),
            stats: SenderStats::default(),
            log: EventLog::create(&config.log_path)?,
            failure: None,
        }),
        Condvar::new(),
    ));
    let shutdown = Arc::new(AtomicBool::new(false));

    let receive = thread::spawn({
        let socket = socket.clone();
        let shared = shared.clone();
        let shutdown = shutdown.clone();
        let rto = config.rto;
        move || receive_loop(socket, shared, shutdown, rto)
    });

    let (lock, cvar) = &*shared;
    let result = drive(&socket, lock, cvar, config.rto);

    shutdown.store(true, Ordering::Release);
    receive.join().unwrap();

    let mut sh = lock.lock().unwrap();
    let acked = sh.window.acked_bytes() as u64;
    sh.stats.data_bytes = acked;
    let stats = sh.stats;
    sh.log.footer(&[
        ("Original data transferred", stats.data_bytes),
        ("Original data segments sent", stats.data_segments),
        ("Retransmitted data segments", stats.retransmissions),
        ("Duplicate acknowledgements received", stats.dup_acks),
    ])?;

    result.map(|()| stats)
}

/// The transmit context: handshake, window-limited data transfer with the
/// single retransmission timer, then teardown.
fn drive(
    socket: &UdpSocket,
    lock: &Mutex<Shared>,
    cvar: &Condvar,
    rto: Duration,
) -> Result<(), Error> {
    let mut sh = lock.lock().unwrap();

    let syn = Segment::syn(sh.window.isn());
    transmit(socket, &mut sh, &syn)?;
    sh.timer.arm(Instant::now() + rto);
    sh = await_control_ack(
        socket,
        cvar,
        sh,
        &syn,
        rto,
        Phase::SynSent,
        Error::HandshakeExhausted,
    )?;
    if let Some(err) = sh.interrupted() {
        return Err(err);
    }
    tracing::debug!("connection established");

    loop {
        // Fill the window while a full MSS still fits.
        while sh.phase == Phase::Established {
            let now = Instant::now();
            let Some((seq_start, payload)) = sh.window.next_segment(now) else {
                break;
            };

            let seg = Segment::data(seq_start, payload);
            transmit(socket, &mut sh, &seg)?;
            sh.stats.data_segments += 1;
            if !sh.timer.is_armed() {
                sh.timer.arm(now + rto);
            }
        }

        if let Some(err) = sh.interrupted() {
            return Err(err);
        }
        if sh.window.all_data_acked() {
            break;
        }

        let now = Instant::now();
        let Some(deadline) = sh.timer.deadline() else {
            sh = cvar.wait(sh).unwrap();
            continue;
        };
        if now < deadline {
            let generation = sh.timer.generation();
            let (guard, _) = cvar.wait_timeout(sh, deadline - now).unwrap();
            sh = guard;
            if !sh.timer.expired(generation, Instant::now()) {
                continue;
            }
        }

        // Timeout: retransmit only the oldest unacked segment and rearm.
        let now = Instant::now();
        if let Some((seq_start, payload)) = sh.window.retransmit_oldest(now) {
            let seg = Segment::data(seq_start, payload);
            transmit(socket, &mut sh, &seg)?;
            sh.stats.retransmissions += 1;
            sh.timer.arm(now + rto);
        } else {
            sh.timer.disarm();
        }
    }
    tracing::debug!(bytes = sh.window.file_len(), "all data acknowledged");

    sh.phase = Phase::Closing;
    let fin = Segment::fin(sh.window.fin_seq());
    transmit(socket, &mut sh, &fin)?;
    sh.phase = Phase::FinWait;
    sh.timer.arm(Instant::now() + rto);
    sh = await_control_ack(
        socket,
        cvar,
        sh,
        &fin,
        rto,
        Phase::FinWait,
        Error::TeardownExhausted,
    )?;
    if let Some(err) = sh.interrupted() {
        return Err(err);
    }

    sh.timer.disarm();
    tracing::debug!("connection closed");
    Ok(())
}

/// Wait in `waiting` until the receive context acknowledges the control
/// segment, retransmitting it at `rto` spacing. The timeout after the third
/// retransmission gives up with a RESET.
fn await_control_ack<'a>(
    socket: &UdpSocket,
    cvar: &Condvar,
    mut sh: MutexGuard<'a, Shared>,
    seg: &Segment,
    rto: Duration,
    waiting: Phase,
    exhausted: fn(u32) -> Error,
) -> Result<MutexGuard<'a, Shared>, Error> {
    let mut retransmits = 0u32;

    while sh.phase == waiting {
        let now = Instant::now();
        let Some(deadline) = sh.timer.deadline() else {
            sh = cvar.wait(sh).unwrap();
            continue;
        };
        if now < deadline {
            let generation = sh.timer.generation();
            let (guard, _) = cvar.wait_timeout(sh, deadline - now).unwrap();
            sh = guard;
            if !sh.timer.expired(generation, Instant::now()) {
                continue;
            }
        }

        if retransmits == MAX_CTRL_RETRANSMITS {
            transmit(socket, &mut sh, &Segment::reset())?;
            sh.phase = Phase::Closed;
            sh.timer.disarm();
            return Err(exhausted(retransmits));
        }

        transmit(socket, &mut sh, seg)?;
        retransmits += 1;
        sh.timer.arm(Instant::now() + rto);
    }

    Ok(sh)
}

/// The receive context: decode inbound datagrams and apply ACKs to the
/// shared window state.
fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    rto: Duration,
) {
    if let Err(err) = receive_loop_inner(&socket, &shared, &shutdown, rto) {
        let (lock, cvar) = &*shared;
        let mut sh = lock.lock().unwrap();
        sh.failure = Some(err);
        sh.phase = Phase::Failed;
        cvar.notify_all();
    }
}

fn receive_loop_inner(
    socket: &UdpSocket,
    shared: &(Mutex<Shared>, Condvar),
    shutdown: &AtomicBool,
    rto: Duration,
) -> Result<(), Error> {
    let mut buf = [0u8; 2048];
    let fd = socket.as_raw_fd();

    while !shutdown.load(Ordering::Acquire) {
        // Bound the blocking read so the shutdown flag stays observable.
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut pfd[..], POLL_INTERVAL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32).into()),
        }

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            // ICMP unreachable from a peer that is not up yet surfaces here
            // on a connected UDP socket.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        };

        let seg = match Segment::decode(&buf[..n]) {
            Ok(seg) => seg,
            Err(err) => {
                tracing::trace!(%err, "ignoring malformed datagram");
                continue;
            }
        };

        let (lock, cvar) = shared;
        let mut sh = lock.lock().unwrap();

        match seg.kind {
            SegmentKind::Ack => {
                sh.log.event(Direction::Rcv, SegmentKind::Ack, seg.seq, 0)?;
                on_ack(socket, &mut sh, seg.seq, rto)?;
                cvar.notify_all();
            }
            SegmentKind::Reset => {
                sh.log.event(Direction::Rcv, SegmentKind::Reset, seg.seq, 0)?;
                sh.phase = Phase::PeerReset;
                cvar.notify_all();
                return Ok(());
            }
            other => {
                tracing::trace!(kind = %other, "unexpected segment at the sender");
            }
        }
    }

    Ok(())
}

/// The ACK-handling rules, shared-state side.
fn on_ack(socket: &UdpSocket, sh: &mut Shared, a: u16, rto: Duration) -> Result<(), Error> {
    match sh.phase {
        Phase::SynSent => {
            if a == sh.window.isn().wrapping_add(1) {
                sh.phase = Phase::Established;
                sh.timer.disarm();
            }
        }
        Phase::Established | Phase::Closing => {
            let now = Instant::now();
            match sh.window.on_ack(a) {
                AckOutcome::Advanced { .. } => {
                    if sh.window.has_unacked() {
                        sh.timer.arm(now + rto);
                    } else {
                        sh.timer.disarm();
                    }
                }
                AckOutcome::Duplicate { fast_retransmit } => {
                    sh.stats.dup_acks += 1;
                    if fast_retransmit {
                        if let Some((seq_start, payload)) = sh.window.retransmit_oldest(now) {
                            tracing::debug!(seq = seq_start, "fast retransmit");
                            let seg = Segment::data(seq_start, payload);
                            transmit(socket, sh, &seg)?;
                            sh.stats.retransmissions += 1;
                            sh.timer.arm(now + rto);
                        }
                    }
                }
                AckOutcome::Ignored => {}
            }
        }
        Phase::FinWait => {
            if a == sh.window.fin_seq().wrapping_add(1) {
                sh.phase = Phase::Closed;
                sh.timer.disarm();
            }
        }
        Phase::Closed | Phase::PeerReset | Phase::Failed => {}
    }

    Ok(())
}

fn transmit(socket: &UdpSocket, sh: &mut Shared, seg: &Segment) -> Result<(), Error> {
    match socket.send(&seg.encode()) {
        Ok(_) => {}
        // A connected UDP socket reports queued ICMP unreachable errors on
        // send as well; the retransmission machinery covers the gap.
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) => {}
        Err(e) => return Err(e.into()),
    }

    sh.log
        .event(Direction::Snd, seg.kind, seg.seq, seg.payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_valid_arguments() {
        let config =
            SenderConfig::from_args(&args(&["53331", "53332", "input.bin", "5000", "100"]))
                .unwrap();

        assert_eq!(config.local_port, 53331);
        assert_eq!(config.peer_port, 53332);
        assert_eq!(config.input, PathBuf::from("input.bin"));
        assert_eq!(config.max_win, 5000);
        assert_eq!(config.rto, Duration::from_millis(100));
        assert_eq!(config.log_path, PathBuf::from("sender_log.txt"));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(
            SenderConfig::from_args(&args(&["53331", "53332"])),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn rejects_window_not_multiple_of_mss() {
        assert!(matches!(
            SenderConfig::from_args(&args(&["53331", "53332", "f", "1500", "100"])),
            Err(Error::InvalidArgument { name: "max_win", .. })
        ));
        assert!(matches!(
            SenderConfig::from_args(&args(&["53331", "53332", "f", "0", "100"])),
            Err(Error::InvalidArgument { name: "max_win", .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(matches!(
            SenderConfig::from_args(&args(&["1000", "53332", "f", "1000", "100"])),
            Err(Error::PortOutOfRange(1000))
        ));
    }
}
