// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::collections::{vec_deque, VecDeque};

use crate::protocol::sm;
use crate::protocol::stream_error::{parse_host_address, DefinedCondition, StreamError};

use super::error::OpaqueIoError;
use super::queue::{PacketState, QueueEntry};

/// Queue an ack request after this many sent stanzas without one.
pub(super) const ACK_REQUEST_INTERVAL: u32 = 8;

#[derive(Debug)]
pub(super) enum SmResumeInfo {
    NotResumable,
    Resumable {
        /// XEP-0198 stream ID
        id: String,

        /// Preferred host and port for resumption as indicated by the
        /// peer.
        location: Option<(String, u16)>,
    },
}

/// State for stream management.
pub(super) struct SmState {
    /// Stanza count at the front of the unacked queue, i.e. the last
    /// remote counter value we have processed.
    outbound_base: u32,

    /// Counter for received stanzas.
    inbound_ctr: u32,

    /// Number of `<sm:a/>` we still owe the peer.
    ///
    /// Acks cannot always be sent right away (the tx buffer may be
    /// full); a counter of unanswered `<sm:r/>` replaces queueing them.
    pub(super) pending_acks: usize,

    /// Flag indicating that a `<sm:r/>` should be sent.
    pub(super) pending_req: bool,

    /// Stanzas sent since the last `<sm:r/>`; drives the automatic ack
    /// request policy.
    sent_since_req: u32,

    /// Information about resumability of the stream.
    resumption: SmResumeInfo,

    /// Unacked stanzas in the order they were sent.
    // VecDeque fits the ringbuffer-style usage: pushed at the back,
    // drained from the front as acks arrive.
    unacked_stanzas: VecDeque<QueueEntry>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

#[derive(Debug)]
pub(super) enum SmError {
    RemoteAckedMoreStanzas {
        local_base: u32,
        queue_len: u32,
        remote_ctr: u32,
    },
    RemoteAckWentBackwards {
        local_base: u32,
        remote_ctr: u32,
    },
}

impl From<SmError> for StreamError {
    fn from(other: SmError) -> Self {
        let text = other.to_string();
        StreamError::with_text(DefinedCondition::UndefinedCondition, text)
    }
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}, queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
            } => {
                write!(f, "remote acked fewer stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
        }
    }
}

impl SmState {
    /// The sequence number of the *next* stanza to be sent.
    #[cfg(test)]
    pub fn outgoing_seq(&self) -> u32 {
        self.outbound_base
            .wrapping_add(self.unacked_stanzas.len() as u32)
    }

    /// Mark a stanza as sent and keep it for retransmission.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        // The SM counters are mod 2^32, and RFC 1982 serial arithmetic
        // makes differences beyond half the number space ambiguous, so
        // the queue must stay below that.
        const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;
        if self.unacked_stanzas.len() >= MAX_QUEUE_SIZE {
            // No way to report this to the sender anymore; a queue of
            // two billion stanzas is fatal in any case.
            panic!("Too many pending stanzas.");
        }

        self.unacked_stanzas.push_back(entry);
        self.sent_since_req = self.sent_since_req.saturating_add(1);
        if self.sent_since_req >= ACK_REQUEST_INTERVAL {
            self.pending_req = true;
        }
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Request an ack from the peer at the next write opportunity.
    ///
    /// Multiple calls may coalesce into a single `<sm:r/>`.
    pub fn request_ack(&mut self) {
        self.pending_req = true;
    }

    pub(super) fn ack_request_sent(&mut self) {
        self.pending_req = false;
        self.sent_since_req = 0;
    }

    /// Count a received stanza.
    ///
    /// Must be called exactly once per stanza (never for nonzas), only
    /// while the stream is past SM negotiation.
    pub fn count_inbound(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Process resumption.
    ///
    /// Updates internal state from the received remote counter and
    /// returns the queue entries which need to be retransmitted, in
    /// their original send order.
    pub fn resume(&mut self, h: u32) -> Result<vec_deque::Drain<'_, QueueEntry>, SmError> {
        self.remote_acked(h)?;
        // Everything left in the queue was never seen by the peer; it
        // has to be retransmitted on the new stream.
        Ok(self.unacked_stanzas.drain(..))
    }

    /// Process a remote `<sm:a/>`.
    pub fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 counters are mod 2^32, which is handy with u32.
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop == 0 {
            log::trace!("remote_acked: no stanzas to drop");
            return Ok(());
        }
        log::trace!("remote_acked: need to drop {to_drop} stanzas");
        if to_drop > self.unacked_stanzas.len() {
            if to_drop as u32 > u32::MAX / 2 {
                // In RFC 1982 terms a wrapped difference beyond half the
                // number space is negative: h went backwards.
                return Err(SmError::RemoteAckWentBackwards {
                    local_base: self.outbound_base,
                    remote_ctr: h,
                });
            } else {
                return Err(SmError::RemoteAckedMoreStanzas {
                    local_base: self.outbound_base,
                    queue_len: self.unacked_stanzas.len() as u32,
                    remote_ctr: h,
                });
            }
        }
        for entry in self.unacked_stanzas.drain(..to_drop) {
            entry.token.send_replace(PacketState::Acked);
        }
        self.outbound_base = h;
        log::debug!("remote_acked: remote acked {to_drop} stanzas");
        Ok(())
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Get the info necessary for resumption: the stream ID and the
    /// current inbound counter, or `None` when the stream is not
    /// resumable.
    pub fn resume_info(&self) -> Option<(&str, u32)> {
        match self.resumption {
            SmResumeInfo::Resumable { ref id, .. } => Some((id, self.inbound_ctr)),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// The peer's preferred reconnection address, if it told us one.
    pub fn resume_location(&self) -> Option<&(String, u16)> {
        match self.resumption {
            SmResumeInfo::Resumable { ref location, .. } => location.as_ref(),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Whether this state is worth keeping across a connection loss.
    pub fn is_resumable(&self) -> bool {
        matches!(self.resumption, SmResumeInfo::Resumable { .. })
    }

    /// Fail all unacked stanzas, e.g. when resumption is given up.
    pub fn fail_all(&mut self, error: &OpaqueIoError) {
        for entry in self.unacked_stanzas.drain(..) {
            entry.token.send_replace(PacketState::Failed {
                error: error.clone(),
            });
        }
    }
}

/// Initialize stream management state from the peer's `<enabled/>`.
impl From<sm::Enabled> for SmState {
    fn from(other: sm::Enabled) -> Self {
        let resumption = if other.resume {
            match other.id {
                Some(id) => SmResumeInfo::Resumable {
                    location: other.location.as_deref().and_then(|location| {
                        let (host, port) = parse_host_address(location)?;
                        Some((host, port.unwrap_or(5222)))
                    }),
                    id,
                },
                None => {
                    log::warn!("peer replied with <enabled resume='true'/>, but without an ID! cannot make this stream resumable.");
                    SmResumeInfo::NotResumable
                }
            }
        } else {
            SmResumeInfo::NotResumable
        };

        Self {
            outbound_base: 0,
            inbound_ctr: 0,
            pending_acks: 0,
            pending_req: false,
            sent_since_req: 0,
            resumption,
            unacked_stanzas: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Stanza, XmppStreamElement};
    use crate::stanzastream::queue::PacketToken;

    fn enabled(resume: bool) -> sm::Enabled {
        sm::Enabled {
            id: Some("SM123".to_owned()),
            resume,
            max: None,
            location: None,
        }
    }

    fn entry() -> (QueueEntry, PacketToken) {
        QueueEntry::tracked(Box::new(XmppStreamElement::Stanza(Stanza::Message(
            Message::new(None),
        ))))
    }

    #[test]
    fn outgoing_seq_counts_sent_stanzas() {
        let mut state = SmState::from(enabled(true));
        assert_eq!(state.outgoing_seq(), 0);
        for expected in 1..=3u32 {
            let (e, _t) = entry();
            state.enqueue(e);
            assert_eq!(state.outgoing_seq(), expected);
        }
    }

    #[test]
    fn acks_resolve_in_order_and_advance_the_base() {
        let mut state = SmState::from(enabled(true));
        let tokens: Vec<_> = (0..3)
            .map(|_| {
                let (e, t) = entry();
                state.enqueue(e);
                t
            })
            .collect();

        state.remote_acked(2).unwrap();
        assert!(matches!(tokens[0].state(), PacketState::Acked));
        assert!(matches!(tokens[1].state(), PacketState::Acked));
        assert!(matches!(tokens[2].state(), PacketState::Queued));

        // Acking the same value again is a no-op.
        state.remote_acked(2).unwrap();
        state.remote_acked(3).unwrap();
        assert!(matches!(tokens[2].state(), PacketState::Acked));
    }

    #[test]
    fn overshooting_ack_is_an_error() {
        let mut state = SmState::from(enabled(true));
        let (e, _t) = entry();
        state.enqueue(e);
        assert!(matches!(
            state.remote_acked(5),
            Err(SmError::RemoteAckedMoreStanzas { .. })
        ));
    }

    #[test]
    fn backwards_ack_is_an_error() {
        let mut state = SmState::from(enabled(true));
        for _ in 0..4 {
            let (e, _t) = entry();
            state.enqueue(e);
        }
        state.remote_acked(4).unwrap();
        assert!(matches!(
            state.remote_acked(2),
            Err(SmError::RemoteAckWentBackwards { .. })
        ));
    }

    #[test]
    fn resume_drains_only_unacked_entries() {
        let mut state = SmState::from(enabled(true));
        let tokens: Vec<_> = (0..3)
            .map(|_| {
                let (e, t) = entry();
                state.enqueue(e);
                t
            })
            .collect();

        // Scenario: the server acked 1 of 3 before the drop; on resume
        // it reports h=1, so entries 2 and 3 must be retransmitted.
        let to_retransmit: Vec<_> = state.resume(1).unwrap().collect();
        assert_eq!(to_retransmit.len(), 2);
        assert!(matches!(tokens[0].state(), PacketState::Acked));
    }

    #[test]
    fn inbound_counting_is_explicit() {
        let mut state = SmState::from(enabled(true));
        assert_eq!(state.inbound_ctr(), 0);
        state.count_inbound();
        state.count_inbound();
        assert_eq!(state.inbound_ctr(), 2);
        assert_eq!(state.resume_info().unwrap(), ("SM123", 2));
    }

    #[test]
    fn ack_request_after_interval() {
        let mut state = SmState::from(enabled(false));
        for _ in 0..ACK_REQUEST_INTERVAL - 1 {
            let (e, _t) = entry();
            state.enqueue(e);
            assert!(!state.pending_req);
        }
        let (e, _t) = entry();
        state.enqueue(e);
        assert!(state.pending_req);
        state.ack_request_sent();
        assert!(!state.pending_req);
    }

    #[test]
    fn non_resumable_state_reports_it() {
        let state = SmState::from(enabled(false));
        assert!(!state.is_resumable());
        assert!(state.resume_info().is_none());

        let state = SmState::from(sm::Enabled {
            id: None,
            resume: true,
            max: None,
            location: None,
        });
        assert!(!state.is_resumable());
    }

    #[test]
    fn location_is_parsed() {
        let state = SmState::from(sm::Enabled {
            id: Some("x".to_owned()),
            resume: true,
            max: None,
            location: Some("alt.example:5299".to_owned()),
        });
        assert_eq!(
            state.resume_location(),
            Some(&("alt.example".to_owned(), 5299))
        );
    }
}
