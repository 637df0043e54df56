//! XEP-0198 stream management: acknowledgements and session resumption.
//!
//! Sequence numbers are assigned when a stanza is submitted, under the same
//! lock that appends it to the unacknowledged queue; the driver then reports
//! how far it has actually written. Only written stanzas are replayed on
//! resumption, the rest are still on their way through the outbound queue.
//! All counters wrap modulo 2^32 and are compared by modular distance.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::{self, SmEnabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SmState {
    Disabled,
    /// `<enable/>` sent, waiting for `<enabled/>` or `<failed/>`.
    Enabling,
    Active,
    /// `<resume/>` sent on a fresh transport.
    Resuming,
    Resumed,
    Failed,
}

/// A stanza sent but not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unacked {
    pub seq: u32,
    pub id: Option<String>,
    pub xml: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmSnapshot {
    pub state: SmState,
    pub session_id: Option<String>,
    pub resumable: bool,
    pub location: Option<String>,
    pub outbound: u32,
    pub transmitted: u32,
    pub inbound: u32,
    pub last_acked: u32,
    pub unacked: usize,
}

/// True when `seq` is at or before `h` in modulo 2^32 order.
pub fn is_acked(seq: u32, h: u32) -> bool {
    (h.wrapping_sub(seq) as i32) >= 0
}

#[derive(Debug)]
pub struct StreamManager {
    state: SmState,
    session_id: Option<String>,
    resumable: bool,
    max: Option<u32>,
    location: Option<String>,
    /// Sequence number of the last stanza submitted.
    outbound: u32,
    /// Sequence number of the last stanza written to a transport.
    transmitted: u32,
    /// Stanzas received since enabling.
    inbound: u32,
    last_acked: u32,
    queue: VecDeque<Unacked>,
    /// Bumped whenever the queue is discarded; outbound entries tagged with an
    /// older epoch were already reported lost.
    epoch: u64,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            state: SmState::Disabled,
            session_id: None,
            resumable: false,
            max: None,
            location: None,
            outbound: 0,
            transmitted: 0,
            inbound: 0,
            last_acked: 0,
            queue: VecDeque::new(),
            epoch: 0,
        }
    }

    pub fn state(&self) -> SmState {
        self.state
    }

    /// Whether stanzas are currently counted and queued.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SmState::Active | SmState::Resumed)
    }

    pub fn inbound_count(&self) -> u32 {
        self.inbound
    }

    pub fn unacked_len(&self) -> usize {
        self.queue.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Session id and preferred reconnect location, when resumption is possible.
    pub fn resumption(&self) -> Option<(&str, Option<&str>)> {
        if !self.resumable {
            return None;
        }
        self.session_id
            .as_deref()
            .map(|id| (id, self.location.as_deref()))
    }

    /// Build `<enable/>` and wait for the reply.
    pub fn enable(&mut self, resume: bool, max: Option<u32>) -> String {
        self.state = SmState::Enabling;
        protocol::sm_enable(resume, max)
    }

    pub fn on_enabled(&mut self, enabled: &SmEnabled) {
        self.session_id = enabled.id.clone();
        self.resumable = enabled.resume && enabled.id.is_some();
        self.max = enabled.max;
        self.location = enabled.location.clone();
        self.outbound = 0;
        self.transmitted = 0;
        self.inbound = 0;
        self.last_acked = 0;
        self.queue.clear();
        self.epoch += 1;
        self.state = SmState::Active;
        info!(
            session_id = ?self.session_id,
            resumable = self.resumable,
            max = ?self.max,
            "Stream management enabled"
        );
    }

    pub fn on_enable_failed(&mut self, condition: Option<&str>) {
        warn!(condition = ?condition, "Stream management could not be enabled");
        self.session_id = None;
        self.resumable = false;
        self.state = SmState::Failed;
    }

    /// Assign the next sequence number to a submitted stanza.
    ///
    /// Returns `None` when stream management is not in use; the stanza is
    /// then not tracked. A session waiting for resumption keeps counting.
    pub fn on_send(&mut self, id: Option<&str>, xml: &str) -> Option<u32> {
        if !matches!(self.state, SmState::Active | SmState::Resuming | SmState::Resumed) {
            return None;
        }
        self.outbound = self.outbound.wrapping_add(1);
        self.queue.push_back(Unacked {
            seq: self.outbound,
            id: id.map(str::to_string),
            xml: xml.to_string(),
        });
        Some(self.outbound)
    }

    /// The stanza numbered `seq` is about to be written to the transport.
    pub fn mark_transmitted(&mut self, seq: u32) {
        if is_acked(self.transmitted, seq) {
            self.transmitted = seq;
        }
    }

    /// Count one inbound stanza.
    pub fn on_inbound_stanza(&mut self) {
        if self.is_active() {
            self.inbound = self.inbound.wrapping_add(1);
        }
    }

    /// `<a h='…'/>` answering the server's `<r/>`.
    pub fn ack_response(&self) -> String {
        protocol::sm_ack(self.inbound)
    }

    /// Drop every queued stanza the server has acknowledged. Returns how many.
    pub fn on_ack(&mut self, h: u32) -> usize {
        if !is_acked(self.last_acked, h) {
            debug!(h, last_acked = self.last_acked, "Ignoring stale ack");
            return 0;
        }
        let h = if is_acked(h, self.transmitted) {
            h
        } else {
            warn!(h, sent = self.transmitted, "Server acknowledged more stanzas than were sent");
            self.transmitted
        };
        self.last_acked = h;

        let mut removed = 0;
        while self.queue.front().is_some_and(|entry| is_acked(entry.seq, h)) {
            self.queue.pop_front();
            removed += 1;
        }
        removed
    }

    /// The transport dropped. With a resumable session the queue is kept for
    /// replay; otherwise it is discarded and returned as lost.
    pub fn on_transport_lost(&mut self) -> Vec<Unacked> {
        match self.state {
            SmState::Active | SmState::Resumed | SmState::Resuming if self.resumption().is_some() => {
                debug!(unacked = self.queue.len(), "Keeping unacknowledged stanzas for resumption");
                Vec::new()
            }
            _ => self.discard(SmState::Disabled),
        }
    }

    /// Build `<resume/>` for the previous session.
    pub fn resume_request(&mut self) -> Option<String> {
        let (previd, _) = self.resumption()?;
        let request = protocol::sm_resume(previd, self.inbound);
        self.state = SmState::Resuming;
        Some(request)
    }

    /// The server accepted `<resume/>`. Returns the written but unacknowledged
    /// stanzas to retransmit, in their original order.
    pub fn on_resumed(&mut self, h: u32) -> Vec<Unacked> {
        if self.state != SmState::Resuming {
            warn!(state = ?self.state, "Unexpected resumed outside of resumption");
            return Vec::new();
        }
        self.on_ack(h);
        self.state = SmState::Resumed;
        let transmitted = self.transmitted;
        let replay: Vec<Unacked> = self
            .queue
            .iter()
            .take_while(|entry| is_acked(entry.seq, transmitted))
            .cloned()
            .collect();
        info!(h, replay = replay.len(), pending = self.queue.len() - replay.len(), "Stream resumed");
        replay
    }

    /// The server rejected `<resume/>`. Every queued stanza is lost.
    pub fn on_resume_failed(&mut self, condition: Option<&str>) -> Vec<Unacked> {
        warn!(condition = ?condition, unacked = self.queue.len(), "Stream resumption failed");
        self.discard(SmState::Failed)
    }

    /// Forget the session entirely (fresh connect or explicit disconnect).
    pub fn reset(&mut self) -> Vec<Unacked> {
        self.discard(SmState::Disabled)
    }

    fn discard(&mut self, state: SmState) -> Vec<Unacked> {
        self.state = state;
        self.session_id = None;
        self.resumable = false;
        self.location = None;
        self.outbound = 0;
        self.transmitted = 0;
        self.inbound = 0;
        self.last_acked = 0;
        self.epoch += 1;
        self.queue.drain(..).collect()
    }

    pub fn snapshot(&self) -> SmSnapshot {
        SmSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            resumable: self.resumable,
            location: self.location.clone(),
            outbound: self.outbound,
            transmitted: self.transmitted,
            inbound: self.inbound,
            last_acked: self.last_acked,
            unacked: self.queue.len(),
        }
    }
}
