//! Per-peer reliable ordered stream state machine (spec §3, §4.1).
//!
//! `Stream` is a pure, synchronous state machine: it never touches a socket
//! or a clock directly. It decides *what* to send and *when* the next retry
//! should fire (returning a `Duration` hint), and the socket driver
//! (`socket.rs`) is the one actually holding a `tokio::time::Sleep` and a
//! `DatagramSocket`. This split keeps the retransmission algorithm testable
//! without a runtime, the same way the teacher crate's
//! `transport::reliable_ordered` sender/receiver are plain data structures
//! with no I/O.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::frame::{encode_stream_frame, tag_stream_datagram, DecodedStreamFrame, SEQ_CLOSE};
use crate::oracle::{Message, Oracle};

/// `MIN_RETRY` from spec §6.
pub const MIN_RETRY: Duration = Duration::from_millis(500);
/// `MAX_RETRY` from spec §6.
pub const MAX_RETRY: Duration = Duration::from_millis(3000);
/// Back-off step from spec §6.
pub const RETRY_STEP: Duration = Duration::from_millis(500);

/// Tunable limits for a `Stream`. Defaults match spec §3/§6 exactly.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub min_retry: Duration,
    pub max_retry: Duration,
    pub retry_step: Duration,
    /// `max_attempts` while `OPEN`.
    pub max_attempts_open: u32,
    /// `max_attempts` once locally `closing`.
    pub max_attempts_closing: u32,
    /// `max_attempts` once the remote has been observed to close.
    pub max_attempts_remote_closed: u32,
    /// Outbound datagram body budget in bytes (excludes the 1-byte tag).
    pub max_frame_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_retry: MIN_RETRY,
            max_retry: MAX_RETRY,
            retry_step: RETRY_STEP,
            max_attempts_open: 10,
            max_attempts_closing: 5,
            max_attempts_remote_closed: 1,
            max_frame_size: 1400,
        }
    }
}

/// Coarse lifecycle per spec §4.1: `OPEN -> CLOSING -> ENDED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closing,
    Ended,
}

/// What the driver should do after a coalesced-send tick.
pub struct TickOutcome {
    /// The datagram to transmit (tag byte included), or `None` if the
    /// stream ended this tick without sending (attempts exhausted).
    pub bytes: Option<Bytes>,
    /// If `Some`, arm a retry timer for this long from now.
    pub next_retry: Option<Duration>,
    /// Whether the stream reached `Ended` as a result of this tick.
    pub ended: bool,
}

/// What the driver should do after processing an inbound frame.
pub struct ReceiveOutcome {
    /// Newly-delivered items, in order, ready for the stream handler.
    pub delivered: Vec<(u16, Box<dyn Message>)>,
    /// Whether a send should now be scheduled (an ack needs to go back, or a
    /// close confirmation does) if one is not already.
    pub need_schedule: bool,
    /// Whether progress was observed (spec §4.1 receive step 3): the driver
    /// must cancel any armed retry timer it is holding for this stream, since
    /// `Stream` has already reset its own retry back-off to `min_retry`.
    pub cancel_retry: bool,
    /// Whether the stream reached `Ended` as a direct result of this receive.
    pub ended: bool,
}

/// A reliable, ordered channel to one remote endpoint.
pub struct Stream {
    remote: SocketAddr,
    version: u8,
    local_seq: u16,
    remote_seq: u16,
    pending: BTreeMap<u16, Box<dyn Message>>,
    send_scheduled: bool,
    /// Whether a retry timer is currently counting down in the driver for
    /// this stream, distinct from `send_scheduled` (the immediate-next-tick
    /// flag). Spec §4.1's data model lists these as two separate fields so
    /// that a later enqueue/receive doesn't need to queue a second, parallel
    /// tick while a retry is already armed -- invariant #4 is "at most one
    /// coalesced send outstanding", counting both together.
    retry_armed: bool,
    retry_interval: Duration,
    attempts: u32,
    max_attempts: u32,
    closing: bool,
    state: StreamState,
    config: StreamConfig,
    /// Set when a remote close sentinel was just observed: the next tick
    /// must send one confirming frame and then end unconditionally, per
    /// spec §4.1 ("immediately after the single confirm exchange").
    confirm_then_end: bool,
}

impl Stream {
    pub fn new(remote: SocketAddr, version: u8, config: StreamConfig) -> Self {
        let retry_interval = config.min_retry;
        let max_attempts = config.max_attempts_open;
        Self {
            remote,
            version,
            local_seq: 0,
            remote_seq: 0,
            pending: BTreeMap::new(),
            send_scheduled: false,
            retry_armed: false,
            retry_interval,
            attempts: 0,
            max_attempts,
            closing: false,
            state: StreamState::Open,
            config,
            confirm_then_end: false,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn send_scheduled(&self) -> bool {
        self.send_scheduled
    }

    pub fn retry_armed(&self) -> bool {
        self.retry_armed
    }

    /// Whether some coalesced send (an immediate next-tick, or an already
    /// counting-down retry timer) is already outstanding for this stream.
    /// Invariant #4 requires at most one such send in flight at a time.
    fn has_outstanding_send(&self) -> bool {
        self.send_scheduled || self.retry_armed
    }

    /// Assign the next sequence number and queue `msg` for sending.
    ///
    /// Returns `Ok(true)` if this call newly scheduled a send (the driver
    /// should queue a tick), `Ok(false)` if one was already outstanding (a
    /// tick or a retry timer) or the stream is `closing`. Per spec §4.1,
    /// enqueueing on a closing stream fails silently -- it is not an error.
    pub fn enqueue(&mut self, msg: Box<dyn Message>) -> Result<bool> {
        if self.closing {
            return Ok(false);
        }
        self.local_seq = self.local_seq.wrapping_add(1);
        self.pending.insert(self.local_seq, msg);
        let need_schedule = !self.has_outstanding_send();
        if need_schedule {
            self.send_scheduled = true;
        }
        Ok(need_schedule)
    }

    /// Begin a graceful close. Idempotent.
    pub fn close(&mut self) -> bool {
        if self.state == StreamState::Ended {
            return false;
        }
        if !self.closing {
            self.closing = true;
            self.max_attempts = self.config.max_attempts_closing;
        }
        if self.state == StreamState::Open {
            self.state = StreamState::Closing;
        }
        let need_schedule = !self.has_outstanding_send();
        if need_schedule {
            self.send_scheduled = true;
        }
        need_schedule
    }

    /// Local teardown without further protocol traffic. Idempotent; returns
    /// `true` only the first time (callers use this to fire `on_close`
    /// exactly once per spec invariant 3).
    pub fn end(&mut self) -> bool {
        if self.state == StreamState::Ended {
            return false;
        }
        self.state = StreamState::Ended;
        self.closing = true;
        self.send_scheduled = false;
        self.retry_armed = false;
        self.confirm_then_end = false;
        true
    }

    /// Run one coalesced-send tick (spec §4.1 "Retransmission algorithm").
    pub fn on_tick(&mut self, oracle: &dyn Oracle) -> TickOutcome {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            self.end();
            return TickOutcome {
                bytes: None,
                next_retry: None,
                ended: true,
            };
        }

        let total_pending = self.pending.len();
        let items: Vec<(u16, &dyn Message)> = self
            .pending
            .iter()
            .map(|(&seq, msg)| (seq, msg.as_ref()))
            .collect();
        let encoded = encode_stream_frame(
            oracle,
            self.remote_seq,
            items,
            total_pending,
            self.closing,
            self.config.max_frame_size,
        );
        // This tick consumes whatever was outstanding -- the immediate
        // schedule or an armed retry timer -- so both clear here. If another
        // send is still needed (pending non-empty, or still closing), it
        // re-arms the retry timer below, never both at once.
        self.send_scheduled = false;
        self.retry_armed = false;
        let bytes = tag_stream_datagram(encoded.bytes);

        if self.confirm_then_end {
            self.confirm_then_end = false;
            self.end();
            return TickOutcome {
                bytes: Some(bytes),
                next_retry: None,
                ended: true,
            };
        }

        let should_arm = !self.pending.is_empty() || self.closing;
        let next_retry = if should_arm {
            let delay = self.retry_interval;
            self.retry_interval = (self.retry_interval + self.config.retry_step)
                .min(self.config.max_retry);
            self.retry_armed = true;
            Some(delay)
        } else {
            self.attempts = 0;
            None
        };

        TickOutcome {
            bytes: Some(bytes),
            next_retry,
            ended: false,
        }
    }

    /// Process one decoded inbound STREAM frame (spec §4.1 "Receive algorithm").
    pub fn on_receive(&mut self, decoded: DecodedStreamFrame) -> ReceiveOutcome {
        let ack = decoded.ack;
        self.pending.retain(|&seq, _| seq > ack);
        self.attempts = 0;

        if ack == SEQ_CLOSE {
            let ended = self.end();
            return ReceiveOutcome {
                delivered: Vec::new(),
                need_schedule: false,
                cancel_retry: false,
                ended,
            };
        }

        // Progress was observed: reset the back-off and cancel any armed
        // retry timer (spec §4.1 receive step 3). A fresh send re-arms one
        // below if there is still something to say.
        self.retry_interval = self.config.min_retry;
        self.retry_armed = false;

        let mut delivered = Vec::new();
        let mut need_schedule = false;
        for (seq, msg) in decoded.items {
            if seq <= self.remote_seq {
                continue; // duplicate, silently discarded
            }
            if !self.has_outstanding_send() {
                need_schedule = true;
                self.send_scheduled = true;
            }
            self.remote_seq = seq;
            delivered.push((seq, msg));
        }

        if decoded.remote_closing {
            self.remote_seq = SEQ_CLOSE;
            if !self.confirm_then_end {
                self.confirm_then_end = true;
                self.closing = true;
                self.max_attempts = self.config.max_attempts_remote_closed;
                if self.state == StreamState::Open {
                    self.state = StreamState::Closing;
                }
                if !self.has_outstanding_send() {
                    need_schedule = true;
                    self.send_scheduled = true;
                }
            }
        }

        ReceiveOutcome {
            delivered,
            need_schedule,
            cancel_retry: true,
            ended: false,
        }
    }
}
