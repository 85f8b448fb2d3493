//! The receiver endpoint.
//!
//! A spawned receive context owns the socket read side: it runs inbound
//! segments through the loss channel, feeds survivors to the reassembly
//! buffer, writes delivered bytes to the output file, and answers every
//! processed segment with one cumulative ACK. The calling thread is the
//! lifecycle context: it waits for the connection to leave ESTABLISHED,
//! serves the 2-second TIME_WAIT, and finalizes the log.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::log::{Direction, EventLog};
use crate::seg::{Segment, SegmentKind};
use crate::{seq, Error, POLL_INTERVAL_MS, TIME_WAIT};

mod assembler;
mod loss;

pub use assembler::{Assembler, DataOutcome};
pub use loss::LossChannel;

const USAGE: &str = "receiver <receiver_port> <sender_port> <output_file> <flp> <rlp>";

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub local_port: u16,
    pub peer_port: u16,
    pub output: PathBuf,
    /// Forward loss probability applied to inbound DATA/SYN/FIN.
    pub flp: f64,
    /// Reverse loss probability applied to outbound ACKs.
    pub rlp: f64,
    pub seed: u64,
    pub log_path: PathBuf,
}

impl ReceiverConfig {
    pub fn from_args(args: &[String]) -> Result<Self, Error> {
        let [receiver_port, sender_port, output, flp, rlp] = args else {
            return Err(Error::Usage(USAGE));
        };

        let local_port = crate::parse_port(receiver_port)?;
        let peer_port = crate::parse_port(sender_port)?;
        let flp = parse_probability("flp", flp)?;
        let rlp = parse_probability("rlp", rlp)?;

        let seed = match std::env::var("STP_SEED") {
            Ok(value) => value.parse().map_err(|_| Error::InvalidArgument {
                name: "STP_SEED",
                value,
            })?,
            Err(_) => rand::random(),
        };

        Ok(ReceiverConfig {
            local_port,
            peer_port,
            output: PathBuf::from(output),
            flp,
            rlp,
            seed,
            log_path: PathBuf::from("receiver_log.txt"),
        })
    }
}

fn parse_probability(name: &'static str, value: &str) -> Result<f64, Error> {
    let p: f64 = value.parse().map_err(|_| Error::InvalidArgument {
        name,
        value: value.to_string(),
    })?;

    if !(0.0..=1.0).contains(&p) {
        return Err(Error::InvalidArgument {
            name,
            value: value.to_string(),
        });
    }

    Ok(p)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    /// Original bytes delivered to the output file.
    pub data_bytes: u64,
    /// Original (non-duplicate) DATA segments accepted.
    pub data_segments: u64,
    pub dup_data_segments: u64,
    /// DATA segments the loss channel swallowed.
    pub data_dropped: u64,
    /// ACKs the loss channel swallowed.
    pub acks_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listen,
    Established,
    TimeWait,
    /// The peer sent RESET.
    PeerReset,
    /// Protocol violation or fatal I/O; see `Shared::failure`.
    Failed,
}

#[derive(Debug)]
struct Shared {
    phase: Phase,
    peer_isn: u16,
    assembler: Assembler,
    loss: LossChannel,
    stats: ReceiverStats,
    log: EventLog,
    out: BufWriter<File>,
    failure: Option<Error>,
}

/// Receive one file transfer and return the footer statistics.
pub fn run(config: ReceiverConfig) -> Result<ReceiverStats, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.local_port))?;
    socket.connect((Ipv4Addr::LOCALHOST, config.peer_port))?;
    let socket = Arc::new(socket);

    let shared = Arc::new((
        Mutex::new(Shared {
            phase: Phase::Listen,
            peer_isn: 0,
            assembler: Assembler::new(0),
            loss: LossChannel::new(config.seed, config.flp, config.rlp),
            stats: ReceiverStats::default(),
            log: EventLog::create(&config.log_path)?,
            out: BufWriter::new(File::create(&config.output)?),
            failure: None,
        }),
        Condvar::new(),
    ));
    let shutdown = Arc::new(AtomicBool::new(false));

    let receive = thread::spawn({
        let socket = socket.clone();
        let shared = shared.clone();
        let shutdown = shutdown.clone();
        move || segment_loop(socket, shared, shutdown)
    });

    // Lifecycle context: wait out the connection, then TIME_WAIT.
    let (lock, cvar) = &*shared;
    let mut sh = lock.lock().unwrap();
    while matches!(sh.phase, Phase::Listen | Phase::Established) {
        sh = cvar.wait(sh).unwrap();
    }
    let reached_time_wait = sh.phase == Phase::TimeWait;
    drop(sh);

    if reached_time_wait {
        // Retransmitted FINs are still re-acknowledged by the receive
        // context during this window.
        thread::sleep(TIME_WAIT);
    }

    shutdown.store(true, Ordering::Release);
    receive.join().unwrap();

    let mut sh = lock.lock().unwrap();
    sh.out.flush()?;
    let stats = sh.stats;
    sh.log.footer(&[
        ("Original data received", stats.data_bytes),
        ("Original data segments received", stats.data_segments),
        ("Duplicate data segments received", stats.dup_data_segments),
        ("Data segments dropped", stats.data_dropped),
        ("Ack segments dropped", stats.acks_dropped),
    ])?;

    match sh.phase {
        Phase::PeerReset => Err(Error::ConnectionReset),
        Phase::Failed => Err(sh.failure.take().unwrap_or(Error::ConnectionReset)),
        _ => {
            tracing::debug!(bytes = stats.data_bytes, "connection closed");
            Ok(stats)
        }
    }
}

fn segment_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(err) = segment_loop_inner(&socket, &shared, &shutdown) {
        let (lock, cvar) = &*shared;
        let mut sh = lock.lock().unwrap();
        sh.failure = Some(err);
        sh.phase = Phase::Failed;
        cvar.notify_all();
    }
}

fn segment_loop_inner(
    socket: &UdpSocket,
    shared: &(Mutex<Shared>, Condvar),
    shutdown: &AtomicBool,
) -> Result<(), Error> {
    let mut buf = [0u8; 2048];
    let fd = socket.as_raw_fd();

    while !shutdown.load(Ordering::Acquire) {
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut pfd[..], POLL_INTERVAL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32).into()),
        }

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
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
        let done = dispatch(socket, &mut sh, seg)?;
        cvar.notify_all();
        if done {
            return Ok(());
        }
    }

    Ok(())
}

/// Process one decoded segment against the current lifecycle state. `true`
/// means the loop should stop (the peer reset the connection).
fn dispatch(socket: &UdpSocket, sh: &mut Shared, seg: Segment) -> Result<bool, Error> {
    match seg.kind {
        SegmentKind::Reset => {
            sh.log.event(Direction::Rcv, SegmentKind::Reset, seg.seq, 0)?;
            sh.out.flush()?;
            sh.phase = Phase::PeerReset;
            Ok(true)
        }

        // An ACK can never legitimately reach this endpoint.
        SegmentKind::Ack => violation(socket, sh, "ACK received by the receiver"),

        SegmentKind::Syn => match sh.phase {
            Phase::Listen => {
                if sh.loss.drop_inbound() {
                    sh.log.event(Direction::Drp, SegmentKind::Syn, seg.seq, 0)?;
                    return Ok(false);
                }

                sh.log.event(Direction::Rcv, SegmentKind::Syn, seg.seq, 0)?;
                sh.peer_isn = seg.seq;
                sh.assembler = Assembler::new(seg.seq.wrapping_add(1));
                send_ack(socket, sh)?;
                sh.phase = Phase::Established;
                tracing::debug!(peer_isn = seg.seq, "connection established");
                Ok(false)
            }
            Phase::Established | Phase::TimeWait if seg.seq == sh.peer_isn => {
                // Retransmitted SYN: the handshake ACK was lost.
                if sh.loss.drop_inbound() {
                    sh.log.event(Direction::Drp, SegmentKind::Syn, seg.seq, 0)?;
                } else {
                    sh.log.event(Direction::Rcv, SegmentKind::Syn, seg.seq, 0)?;
                    send_ack(socket, sh)?;
                }
                Ok(false)
            }
            _ => violation(socket, sh, "unexpected SYN"),
        },

        SegmentKind::Data => match sh.phase {
            Phase::Established | Phase::TimeWait => {
                if sh.loss.drop_inbound() {
                    sh.stats.data_dropped += 1;
                    sh.log
                        .event(Direction::Drp, SegmentKind::Data, seg.seq, seg.payload.len())?;
                    return Ok(false);
                }

                sh.log
                    .event(Direction::Rcv, SegmentKind::Data, seg.seq, seg.payload.len())?;

                match sh.assembler.on_data(seg.seq, seg.payload) {
                    DataOutcome::InOrder { delivered } => {
                        sh.stats.data_segments += 1;
                        for chunk in &delivered {
                            sh.out.write_all(chunk)?;
                            sh.stats.data_bytes += chunk.len() as u64;
                        }
                        // Keep the on-disk file a prefix of the input at
                        // every instant.
                        sh.out.flush()?;
                    }
                    DataOutcome::Buffered => sh.stats.data_segments += 1,
                    DataOutcome::Duplicate => sh.stats.dup_data_segments += 1,
                }

                send_ack(socket, sh)?;
                Ok(false)
            }
            _ => violation(socket, sh, "DATA before handshake"),
        },

        SegmentKind::Fin => match sh.phase {
            Phase::Established => {
                if sh.loss.drop_inbound() {
                    sh.log.event(Direction::Drp, SegmentKind::Fin, seg.seq, 0)?;
                    return Ok(false);
                }

                sh.log.event(Direction::Rcv, SegmentKind::Fin, seg.seq, 0)?;
                let expected = sh.assembler.expected_seq();
                if seg.seq == expected {
                    sh.assembler.consume_fin();
                    send_ack(socket, sh)?;
                    sh.out.flush()?;
                    sh.phase = Phase::TimeWait;
                    Ok(false)
                } else if seq::seq_lt(seg.seq, expected) {
                    // Duplicate of a FIN already consumed.
                    send_ack(socket, sh)?;
                    Ok(false)
                } else {
                    violation(socket, sh, "FIN ahead of the contiguous prefix")
                }
            }
            Phase::TimeWait => {
                // Retransmitted FIN while waiting out the close.
                if sh.loss.drop_inbound() {
                    sh.log.event(Direction::Drp, SegmentKind::Fin, seg.seq, 0)?;
                } else {
                    sh.log.event(Direction::Rcv, SegmentKind::Fin, seg.seq, 0)?;
                    send_ack(socket, sh)?;
                }
                Ok(false)
            }
            _ => violation(socket, sh, "FIN before handshake"),
        },
    }
}

/// Emit the cumulative ACK for the current contiguous high-water mark,
/// subject to the reverse loss channel.
fn send_ack(socket: &UdpSocket, sh: &mut Shared) -> Result<(), Error> {
    let ack_seq = sh.assembler.expected_seq();

    if sh.loss.drop_ack() {
        sh.stats.acks_dropped += 1;
        sh.log.event(Direction::Drp, SegmentKind::Ack, ack_seq, 0)
    } else {
        send_datagram(socket, &Segment::ack(ack_seq))?;
        sh.log.event(Direction::Snd, SegmentKind::Ack, ack_seq, 0)
    }
}

/// RESET the peer and fail the endpoint. RESET bypasses the loss channel.
fn violation(socket: &UdpSocket, sh: &mut Shared, what: &'static str) -> Result<bool, Error> {
    tracing::warn!(what, "protocol violation");
    send_datagram(socket, &Segment::reset())?;
    sh.log.event(Direction::Snd, SegmentKind::Reset, 0, 0)?;
    sh.out.flush()?;

    Err(Error::ProtocolViolation(what))
}

fn send_datagram(socket: &UdpSocket, seg: &Segment) -> Result<(), Error> {
    match socket.send(&seg.encode()) {
        Ok(_) => Ok(()),
        // The peer may already be gone when the last ACKs go out.
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
