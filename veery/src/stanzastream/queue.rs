// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;
use core::task::{Context, Poll};
use std::collections::VecDeque;

use futures::ready;

use tokio::sync::{mpsc, watch};

use crate::protocol::XmppStreamElement;

pub use super::error::OpaqueIoError;

/// The stages of packet transmission.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum PacketStage {
    /// The packet is in the transmit queue, but has not been serialized
    /// or written to the stream yet.
    Queued,

    /// The packet has been serialized and written to the transport.
    Sent,

    /// The packet has been acked by the peer using XEP-0198.
    ///
    /// **Note:** This stage is only ever reached on streams where
    /// XEP-0198 was negotiated successfully.
    Acked,

    /// Packet transmission or serialization failed.
    Failed,

    /// The packet was dropped from the transmit queue before it could be
    /// sent, e.g. because the stream broke fatally.
    Dropped,
}

/// State of a packet in transit to the peer.
#[derive(Debug, Clone)]
pub enum PacketState {
    /// The packet is in the local queue, not sent yet.
    Queued,

    /// The packet has been written to the transport, but there is no
    /// proof yet that the peer received it.
    Sent,

    /// The peer confirmed reception of the packet.
    Acked,

    /// Sending failed in a non-recoverable manner.
    Failed {
        /// The error which caused the sending to fail.
        error: OpaqueIoError,
    },

    /// The packet was dropped out of the queue for unspecified reasons,
    /// such as the stream breaking fatally.
    Dropped,
}

impl From<&PacketState> for PacketStage {
    fn from(other: &PacketState) -> Self {
        match other {
            PacketState::Queued => Self::Queued,
            PacketState::Sent => Self::Sent,
            PacketState::Acked => Self::Acked,
            PacketState::Failed { .. } => Self::Failed,
            PacketState::Dropped => Self::Dropped,
        }
    }
}

impl PartialEq<PacketStage> for PacketState {
    fn eq(&self, other: &PacketStage) -> bool {
        PacketStage::from(self).eq(other)
    }
}

impl PartialOrd<PacketStage> for PacketState {
    fn partial_cmp(&self, other: &PacketStage) -> Option<Ordering> {
        PacketStage::from(self).partial_cmp(other)
    }
}

/// Track packet transmission through the
/// [`StanzaStream`][`super::StanzaStream`] up to the peer.
///
/// This is the observable half of the per-packet send contract: it moves
/// through [`PacketStage::Queued`], [`PacketStage::Sent`] and (on
/// XEP-0198 streams) [`PacketStage::Acked`], or ends in
/// [`PacketStage::Failed`]/[`PacketStage::Dropped`].
#[derive(Clone)]
pub struct PacketToken {
    inner: watch::Receiver<PacketState>,
}

impl PacketToken {
    /// Wait for the transmission to reach the given stage.
    ///
    /// If the packet is removed from tracking before that stage is
    /// reached, `None` is returned; [`Self::state`] then holds the final
    /// state.
    pub async fn wait_for(&mut self, stage: PacketStage) -> Option<PacketState> {
        self.inner
            .wait_for(|st| *st >= stage)
            .await
            .map(|x| x.clone())
            .ok()
    }

    pub(crate) fn into_stream(self) -> tokio_stream::wrappers::WatchStream<PacketState> {
        tokio_stream::wrappers::WatchStream::new(self.inner)
    }

    /// Read the current transmission state.
    pub fn state(&self) -> PacketState {
        self.inner.borrow().clone()
    }
}

/// A queued outbound element together with its token.
pub(super) struct QueueEntry {
    pub element: Box<XmppStreamElement>,
    pub token: watch::Sender<PacketState>,
}

impl QueueEntry {
    pub fn untracked(element: Box<XmppStreamElement>) -> Self {
        Self::tracked(element).0
    }

    pub fn tracked(element: Box<XmppStreamElement>) -> (Self, PacketToken) {
        let (tx, rx) = watch::channel(PacketState::Queued);
        let token = PacketToken { inner: rx };
        (
            QueueEntry {
                element,
                token: tx,
            },
            token,
        )
    }

    /// Whether this entry is a stanza and therefore subject to stream
    /// management sequence counting.
    pub fn is_stanza(&self) -> bool {
        self.element.is_stanza()
    }
}

/// Reference to a transmit queue entry.
///
/// On drop, the entry stays in the queue.
pub(super) struct TransmitQueueRef<'x, T> {
    q: &'x mut VecDeque<T>,
}

impl<'x, T> TransmitQueueRef<'x, T> {
    /// Take the item out of the queue.
    pub fn take(self) -> T {
        // Unwrap: this type is only created after checking that the
        // queue has a front item, and the borrow prevents changes.
        self.q.pop_front().unwrap()
    }
}

/// A transmit queue coupled to an [`mpsc::Receiver`].
///
/// Only a handful of elements are held outside the inner receiver; the
/// main queueing happens inside the channel, governed by its depth and
/// the backpressure it creates. The local head exists so that items can
/// be put back at the front for retransmission.
pub(super) struct TransmitQueue<T: Unpin> {
    inner: mpsc::Receiver<T>,
    peek: VecDeque<T>,
}

impl<T: Unpin> TransmitQueue<T> {
    /// Create a new transmission queue around an existing receiver.
    pub fn wrap(ch: mpsc::Receiver<T>) -> Self {
        Self {
            inner: ch,
            peek: VecDeque::with_capacity(1),
        }
    }

    /// Create a new channel and wrap its receiving side in a
    /// transmission queue.
    pub fn channel(depth: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, Self::wrap(rx))
    }

    /// Poll the queue for the next item to transmit.
    pub fn poll_next(&mut self, cx: &mut Context) -> Poll<Option<TransmitQueueRef<'_, T>>> {
        if !self.peek.is_empty() {
            // Going through the borrow twice keeps the borrowchecker
            // happy (the reference must not be created before the
            // branch).
            return Poll::Ready(Some(TransmitQueueRef { q: &mut self.peek }));
        }
        // The local head usually holds at most one element; retransmit
        // bursts grow it temporarily, so give memory back once they are
        // over.
        if self.peek.capacity() > 32 {
            let mut fresh = VecDeque::with_capacity(1);
            core::mem::swap(&mut self.peek, &mut fresh);
        }
        match ready!(self.inner.poll_recv(cx)) {
            None => Poll::Ready(None),
            Some(v) => {
                self.peek.push_back(v);
                Poll::Ready(Some(TransmitQueueRef { q: &mut self.peek }))
            }
        }
    }

    /// Requeue a sequence of items at the front of the queue, preserving
    /// the order of `iter`.
    pub fn requeue_all<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        let to_reserve = iter.size_hint().1.unwrap_or(iter.size_hint().0);
        self.peek.reserve(to_reserve);
        let mut n = 0;
        for item in iter {
            self.peek.push_front(item);
            n += 1;
        }
        // The front-pushes above reversed the order; undo that.
        for i in 0..(n / 2) {
            let j = n - (i + 1);
            self.peek.swap(i, j);
        }
    }

    /// Enqueue an item behind the *local* head but before everything
    /// still inside the channel.
    pub fn enqueue(&mut self, item: T) {
        self.peek.push_back(item);
    }

    /// Whether the sender side of the queue is closed.
    ///
    /// Items may still be retrievable from a closed queue.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl TransmitQueue<QueueEntry> {
    /// Fail all currently queued items with the given error.
    ///
    /// Future items are not affected.
    pub fn fail(&mut self, error: &OpaqueIoError) {
        for item in self.peek.drain(..) {
            item.token.send_replace(PacketState::Failed {
                error: error.clone(),
            });
        }
        while let Ok(item) = self.inner.try_recv() {
            item.token.send_replace(PacketState::Failed {
                error: error.clone(),
            });
        }
        self.peek.shrink_to(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Stanza};

    fn entry() -> (QueueEntry, PacketToken) {
        QueueEntry::tracked(Box::new(XmppStreamElement::Stanza(Stanza::Message(
            Message::new(None),
        ))))
    }

    #[test]
    fn tracked_entries_start_queued() {
        let (entry, token) = entry();
        assert!(matches!(token.state(), PacketState::Queued));
        assert!(entry.is_stanza());
    }

    #[tokio::test]
    async fn requeue_preserves_order() {
        let (_tx, mut q) = TransmitQueue::<u32>::channel(4);
        q.requeue_all([1u32, 2, 3]);
        let mut out = Vec::new();
        futures::future::poll_fn(|cx| {
            while let Poll::Ready(Some(item)) = q.poll_next(cx) {
                out.push(item.take());
                if out.len() == 3 {
                    break;
                }
            }
            Poll::Ready(())
        })
        .await;
        assert_eq!(out, [1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_resolves_queued_entries() {
        let (tx, mut q) = TransmitQueue::channel(4);
        let (e1, t1) = entry();
        tx.send(e1).await.unwrap();
        let (e2, t2) = entry();
        q.enqueue(e2);
        q.fail(&OpaqueIoError::disconnected());
        assert!(matches!(t1.state(), PacketState::Failed { .. }));
        assert!(matches!(t2.state(), PacketState::Failed { .. }));
    }
}
