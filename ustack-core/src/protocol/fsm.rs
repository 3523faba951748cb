//! TCP connection state machine, covering the passive-open subset of
//! [RFC 793]: three-way handshake, ACKed data transfer, and the four-way
//! close. There is no retransmission, no acceptability-window checking, and
//! no TIME-WAIT; segments that do not match a known transition tear the
//! connection down.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

use std::collections::VecDeque;
use std::fmt;
use std::io;

use crate::debug;
use crate::protocol::Quad;
use crate::protocol::Segment;
use crate::protocol::headers::TcpHeader;
use crate::{Error, ProtocolError, Result, UserError};

/// Our window size advertised to the peer.
pub const RCV_WND_SIZE: u16 = 1024;

/// States of a TCP connection.
///
/// Only the states reachable from a passive open are represented; there is no
/// SYN-SENT, CLOSING, or TIME-WAIT.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum State {
    /// Waiting for a connection request from any remote TCP and port.
    LISTEN,
    /// Waiting for a confirming connection request acknowledgment after
    /// having both received and sent a connection request.
    SYN_RECEIVED,
    /// An open connection; data received can be delivered to the user.
    ESTABLISHED,
    /// Waiting for a connection termination request from the remote TCP, or
    /// an acknowledgment of the termination request previously sent.
    FIN_WAIT_1,
    /// Waiting for a connection termination request from the remote TCP.
    FIN_WAIT_2,
    /// Waiting for a connection termination request from the local user.
    CLOSE_WAIT,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent to the remote TCP.
    LAST_ACK,
    /// No connection state at all.
    CLOSED,
}

impl State {
    /// Returns the canonical display name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::LISTEN => "LISTEN",
            State::SYN_RECEIVED => "SYN-RECEIVED",
            State::ESTABLISHED => "ESTABLISHED",
            State::FIN_WAIT_1 => "FIN-WAIT-1",
            State::FIN_WAIT_2 => "FIN-WAIT-2",
            State::CLOSE_WAIT => "CLOSE-WAIT",
            State::LAST_ACK => "LAST-ACK",
            State::CLOSED => "CLOSED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers of unacknowledged data
///        3 - sequence numbers allowed for new data transmission
///        4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug)]
pub struct SendSeqSpace {
    /// SND.UNA - send unacknowledged
    una: u32,
    /// SND.NXT - send next
    nxt: u32,
    /// SND.WND - send window
    wnd: u16,
    /// SND.UP  - send urgent pointer
    #[allow(dead_code)]
    up: u16,
    /// SND.WL1 - segment sequence number used for last window update
    #[allow(dead_code)]
    wl1: u32,
    /// SND.WL2 - segment acknowledgment number used for last window update
    #[allow(dead_code)]
    wl2: u32,
    /// ISS     - initial send sequence number
    iss: u32,
}

/// Receive Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers allowed for new reception
///        3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug)]
pub struct RecvSeqSpace {
    /// RCV.NXT - receive next
    nxt: u32,
    /// RCV.WND - receive window
    wnd: u16,
    /// RCV.UP  - receive urgent pointer
    #[allow(dead_code)]
    up: u16,
    /// IRS     - initial receive sequence number
    #[allow(dead_code)]
    irs: u32,
}

/// A single TCP connection: current state, sequence spaces, and the buffer of
/// locally written but not yet acknowledged bytes.
#[derive(Debug)]
pub struct Connection {
    /// Current state of the connection.
    state: State,
    /// The connection quadruple, stored as received (peer side first).
    quad: Quad,
    /// Send Sequence Space for the connection.
    snd: SendSeqSpace,
    /// Receive Sequence Space for the connection.
    rcv: RecvSeqSpace,
    /// Bytes accepted by `write` and not yet acknowledged by the peer.
    snd_buf: VecDeque<u8>,
}

impl Connection {
    /// Creates a connection for a quadruple seen for the first time,
    /// initializing both sequence spaces from the incoming segment.
    ///
    /// The initial send sequence number is drawn at random. The connection
    /// starts in LISTEN; the caller hands the same segment to
    /// [Connection::handle_segment] to drive the first transition.
    pub fn initialize(quad: Quad, tcph: &TcpHeader) -> Self {
        let iss = rand::random::<u32>();

        Self {
            state: State::LISTEN,
            quad,
            snd: SendSeqSpace {
                // No sequence numbers have been acknowledged yet.
                una: iss,
                // Accounts for the SYN that the handshake response consumes.
                nxt: iss.wrapping_add(1),
                // The window size advertised by the peer.
                wnd: tcph.window(),
                up: 0,
                wl1: 0,
                wl2: 0,
                iss,
            },
            rcv: RecvSeqSpace {
                // The next sequence number we expect from the peer.
                nxt: tcph.seq_number().wrapping_add(1),
                // The window size we advertise to the peer.
                wnd: RCV_WND_SIZE,
                up: tcph.urgent_pointer(),
                // What sequence number the peer chose to start from.
                irs: tcph.seq_number(),
            },
            snd_buf: VecDeque::new(),
        }
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> State {
        self.state
    }

    /// Processes one incoming segment for this connection, delivering any
    /// payload to `sink`, and returns the response segment to transmit, if
    /// any.
    ///
    /// At most one response is produced per segment.
    ///
    /// # Errors
    ///
    /// Returns [ProtocolError] if the segment's control bits have no
    /// transition out of the current state; the caller is expected to discard
    /// the connection. Returns [Error::Io] if delivering payload to `sink`
    /// fails.
    pub fn handle_segment<W: io::Write>(
        &mut self,
        tcph: &TcpHeader,
        payload: &[u8],
        sink: &mut W,
    ) -> Result<Option<Segment>> {
        if self.state != State::LISTEN {
            if tcph.rst() {
                return Err(self.violation("unexpected RST"));
            }

            if tcph.syn() {
                return Err(self.violation("unexpected SYN on existing connection"));
            }
        }

        let seqn = tcph.seq_number();
        let ackn = tcph.ack_number();

        match self.state {
            State::LISTEN => {
                if !tcph.syn() {
                    return Err(self.violation("SYN bit not set"));
                }

                self.state = State::SYN_RECEIVED;

                debug!(
                    "[{}] (LISTEN) received SYN, constructing SYN-ACK: LISTEN -> SYN-RECEIVED",
                    self.quad
                );

                // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
                Ok(Some(self.create_syn_ack()))
            }
            State::SYN_RECEIVED => {
                if !tcph.ack() {
                    return Err(self.violation("ACK bit not set"));
                }

                // Our SYN was acknowledged; re-anchor the send space on the
                // peer's view of it.
                self.snd.una = ackn;
                self.snd.nxt = ackn;
                self.snd.wnd = tcph.window();
                self.state = State::ESTABLISHED;

                debug!(
                    "[{}] (SYN-RECEIVED) received ACK: SYN-RECEIVED -> ESTABLISHED",
                    self.quad
                );

                Ok(None)
            }
            State::ESTABLISHED => {
                if tcph.fin() {
                    let n = self.deliver(payload, sink)?;

                    // The FIN consumes one sequence number past the data.
                    self.rcv.nxt = seqn.wrapping_add(n as u32).wrapping_add(1);
                    self.state = State::CLOSE_WAIT;

                    debug!(
                        "[{}] (ESTABLISHED) received FIN, constructing ACK: ESTABLISHED -> CLOSE-WAIT",
                        self.quad
                    );

                    return Ok(Some(self.create_ack(&[])));
                }

                let n = self.deliver(payload, sink)?;

                // A bare ACK carries nothing to acknowledge back.
                if n == 0 {
                    return Ok(None);
                }

                self.rcv.nxt = seqn.wrapping_add(n as u32);

                if tcph.ack() {
                    let acked = ackn.wrapping_sub(self.snd.una) as usize;
                    self.snd.una = ackn;
                    self.snd.wnd = tcph.window();
                    self.drain_acked(acked);
                }

                debug!(
                    "[{}] (ESTABLISHED) delivered {n} bytes, constructing ACK",
                    self.quad
                );

                Ok(Some(self.create_ack(&[])))
            }
            State::FIN_WAIT_1 => match (tcph.fin(), tcph.ack()) {
                (true, true) => {
                    // Simultaneous close resolution: the peer acknowledged
                    // our FIN and sent its own.
                    self.rcv.nxt = seqn.wrapping_add(1);
                    self.snd.una = ackn;
                    self.snd.nxt = self.snd.nxt.wrapping_add(1);
                    self.state = State::CLOSED;

                    debug!(
                        "[{}] (FIN-WAIT-1) received FIN-ACK, constructing ACK: FIN-WAIT-1 -> CLOSED",
                        self.quad
                    );

                    Ok(Some(self.create_ack(&[])))
                }
                (false, true) => {
                    self.state = State::FIN_WAIT_2;

                    debug!(
                        "[{}] (FIN-WAIT-1) received ACK for FIN: FIN-WAIT-1 -> FIN-WAIT-2",
                        self.quad
                    );

                    Ok(None)
                }
                (true, false) => Err(self.violation("FIN wasn't ACKed")),
                (false, false) => Err(self.violation("ACK bit not set")),
            },
            State::FIN_WAIT_2 => {
                if !tcph.fin() {
                    return Err(self.violation("FIN bit not set"));
                }

                self.rcv.nxt = seqn.wrapping_add(1);
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
                self.state = State::CLOSED;

                debug!(
                    "[{}] (FIN-WAIT-2) received FIN, constructing ACK: FIN-WAIT-2 -> CLOSED",
                    self.quad
                );

                Ok(Some(self.create_ack(&[])))
            }
            State::CLOSE_WAIT => Err(self.violation("remote half already closed")),
            State::LAST_ACK => {
                if !tcph.ack() {
                    return Err(self.violation("ACK bit not set"));
                }

                self.state = State::CLOSED;

                debug!(
                    "[{}] (LAST-ACK) received ACK for FIN: LAST-ACK -> CLOSED",
                    self.quad
                );

                Ok(None)
            }
            State::CLOSED => Err(self.violation("connection is closed")),
        }
    }

    /// Queues `buf` for transmission and returns the data segment carrying
    /// it.
    ///
    /// Permitted only in ESTABLISHED and CLOSE-WAIT. The write is bounded by
    /// the available send window, `(SND.UNA + SND.WND) - SND.NXT`, which
    /// also bounds the write buffer: it never holds more than a window's
    /// worth of unacknowledged bytes.
    ///
    /// # Errors
    ///
    /// Returns [UserError::IllegalState] in any other state and
    /// [UserError::BufferFull] when the window bound is exceeded; the
    /// connection is unchanged in both cases.
    pub fn write(&mut self, buf: &[u8]) -> Result<Segment> {
        if !matches!(self.state, State::ESTABLISHED | State::CLOSE_WAIT) {
            return Err(Error::User(UserError::IllegalState {
                op: "write to",
                state: self.state,
            }));
        }

        let window_avail = self
            .snd
            .una
            .wrapping_add(u32::from(self.snd.wnd))
            .wrapping_sub(self.snd.nxt) as usize;

        if buf.len() > window_avail {
            return Err(Error::User(UserError::BufferFull {
                requested: buf.len(),
                available: window_avail,
            }));
        }

        // The segment carries the pre-advance SND.NXT as its sequence number.
        let segment = self.create_ack(buf);

        self.snd_buf.extend(buf);
        self.snd.nxt = self.snd.nxt.wrapping_add(buf.len() as u32);

        debug!(
            "[{}] ({}) queued {} bytes, constructing data segment",
            self.quad,
            self.state,
            buf.len()
        );

        Ok(segment)
    }

    /// Initiates a graceful close of the local half of the connection and
    /// returns the FIN-ACK segment to transmit.
    ///
    /// Permitted only in ESTABLISHED, SYN-RECEIVED, and CLOSE-WAIT.
    ///
    /// # Errors
    ///
    /// Returns [UserError::IllegalState] in any other state; the connection
    /// is unchanged.
    pub fn close(&mut self) -> Result<Segment> {
        let next = match self.state {
            State::ESTABLISHED | State::SYN_RECEIVED => State::FIN_WAIT_1,
            State::CLOSE_WAIT => State::LAST_ACK,
            _ => {
                return Err(Error::User(UserError::IllegalState {
                    op: "close",
                    state: self.state,
                }));
            }
        };

        let fin_ack = self.create_fin_ack();

        // The FIN consumes one sequence number.
        self.snd.nxt = self.snd.nxt.wrapping_add(1);

        debug!(
            "[{}] ({}) close call received, constructing FIN-ACK: {} -> {next}",
            self.quad, self.state, self.state
        );

        self.state = next;

        Ok(fin_ack)
    }

    /// Writes `payload` to the upstream sink, returning the number of bytes
    /// delivered.
    fn deliver<W: io::Write>(&self, payload: &[u8], sink: &mut W) -> Result<usize> {
        if !payload.is_empty() {
            sink.write_all(payload)?;
            sink.flush()?;
        }

        Ok(payload.len())
    }

    /// Drops up to `acked` bytes from the front of the write buffer.
    fn drain_acked(&mut self, acked: usize) {
        let drained = usize::min(acked, self.snd_buf.len());
        self.snd_buf.drain(..drained);
    }

    fn violation(&self, reason: &'static str) -> Error {
        Error::Protocol(ProtocolError::UnexpectedSegment {
            state: self.state,
            reason,
        })
    }

    /// Creates a `SYN-ACK` segment in response to the peer's connection
    /// request. Its sequence number is the ISS the SYN consumes.
    fn create_syn_ack(&self) -> Segment {
        let mut syn_ack = self.response_header(self.snd.iss);
        syn_ack.set_syn();

        Segment::new(syn_ack, &[])
    }

    /// Creates an `ACK` segment, carrying `payload` (with PSH) when
    /// non-empty.
    fn create_ack(&self, payload: &[u8]) -> Segment {
        let mut ack = self.response_header(self.snd.nxt);

        if !payload.is_empty() {
            ack.set_psh();
        }

        Segment::new(ack, payload)
    }

    /// Creates a `FIN-ACK` segment for a graceful local close.
    fn create_fin_ack(&self) -> Segment {
        let mut fin_ack = self.response_header(self.snd.nxt);
        fin_ack.set_fin();

        Segment::new(fin_ack, &[])
    }

    /// Builds the common response header: ports mirrored from the quadruple,
    /// the given sequence number, our advertised window, and the ACK bit
    /// (set on every generated response) acknowledging RCV.NXT.
    fn response_header(&self, seq: u32) -> TcpHeader {
        let mut tcph = TcpHeader::new(self.quad.dst.port, self.quad.src.port, seq, self.rcv.wnd);

        tcph.set_ack_number(self.rcv.nxt);
        tcph.set_ack();

        tcph
    }
}
