// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tracking of outgoing IQ requests and correlation of their responses.

use core::fmt;
use core::future::Future;
use core::ops::ControlFlow;
use core::pin::Pin;
use core::task::{ready, Context, Poll};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use minidom::Element;
use tokio::sync::oneshot;

use veery_jid::Jid;

use crate::event::make_id;
use crate::protocol::stanza::{Iq, IqType};
use crate::protocol::stanza_error::StanzaError;
use crate::stanzastream::{PacketState, PacketToken};

/// An IQ request payload
pub enum IqRequest {
    /// Payload for a `type="get"` request
    Get(Element),

    /// Payload for a `type="set"` request
    Set(Element),
}

impl From<IqRequest> for IqType {
    fn from(other: IqRequest) -> IqType {
        match other {
            IqRequest::Get(v) => Self::Get(v),
            IqRequest::Set(v) => Self::Set(v),
        }
    }
}

impl From<IqResponse> for IqType {
    fn from(other: IqResponse) -> IqType {
        match other {
            IqResponse::Result(v) => Self::Result(v),
            IqResponse::Error(v) => Self::Error(v),
        }
    }
}

/// An IQ response payload
#[derive(Debug)]
pub enum IqResponse {
    /// Payload for a `type="result"` response.
    ///
    /// The payload is handed over as the raw element, so that callers
    /// can parse it with whatever typed schema they bring along.
    Result(Option<Element>),

    /// Payload for a `type="error"` response.
    Error(StanzaError),
}

/// Ways in which an IQ request can fail without a response.
#[derive(Debug)]
pub enum IqFailure {
    /// The stream worker dropped the token before a response was
    /// received; most likely the stream died with a panic.
    LostWorker,

    /// The IQ could not be sent due to an I/O or serialization error.
    SendError(io::Error),

    /// The session ended, non-resumably, before a response arrived.
    Disconnected,
}

impl fmt::Display for IqFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LostWorker => {
                f.write_str("disconnected from internal connection worker while sending IQ")
            }
            Self::SendError(e) => write!(f, "send error: {e}"),
            Self::Disconnected => f.write_str("session ended before the IQ response arrived"),
        }
    }
}

impl std::error::Error for IqFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SendError(ref e) => Some(e),
            Self::LostWorker | Self::Disconnected => None,
        }
    }
}

struct PendingIq {
    /// The bare JID the response must come from.
    recipient: Jid,
    sink: oneshot::Sender<Result<IqResponse, IqFailure>>,
}

type IqMap = BTreeMap<String, PendingIq>;

struct IqMapEntryHandle {
    id: String,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let Ok(mut map) = map.lock() else {
            return;
        };
        map.remove(&self.id);
    }
}

pin_project_lite::pin_project! {
    /// Handle for awaiting an IQ response.
    ///
    /// Completes once the response has been received. Note that an
    /// `Ok(_)` result does **not** imply that the remote operation
    /// succeeded: it may hold an [`IqResponse::Error`].
    ///
    /// There are no internal timeouts: when a reply never arrives, the
    /// future never completes. Combine it with
    /// [`tokio::time::timeout`].
    ///
    /// Dropping the token removes the internal tracking entry.
    pub struct IqResponseToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        packet_token: Option<tokio_stream::wrappers::WatchStream<PacketState>>,
        #[pin]
        inner: oneshot::Receiver<Result<IqResponse, IqFailure>>,
    }
}

impl IqResponseToken {
    /// Tie the packet token of the IQ **request** to this response
    /// token, so that send failures surface here.
    pub(crate) fn set_packet_token(&mut self, token: PacketToken) {
        assert!(self.packet_token.is_none());
        self.packet_token = Some(token.into_stream());
    }
}

impl Future for IqResponseToken {
    type Output = Result<IqResponse, IqFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => {
                // Release the map entry.
                this.entry.take();
                return Poll::Ready(v);
            }
            Poll::Ready(Err(_)) => {
                log::warn!("IqResponseToken oneshot::Receiver returned receive error!");
                this.entry.take();
                return Poll::Ready(Err(IqFailure::LostWorker));
            }
            Poll::Pending => (),
        };

        loop {
            match this.packet_token.as_mut().as_pin_mut() {
                Some(stream) => match ready!(stream.poll_next(cx)) {
                    // Still in the queue.
                    Some(PacketState::Queued) => (),

                    Some(PacketState::Dropped) | None => {
                        log::warn!("IQ request was dropped before transmission.");
                        this.entry.take();
                        return Poll::Ready(Err(IqFailure::LostWorker));
                    }

                    Some(PacketState::Failed { error }) => {
                        this.entry.take();
                        return Poll::Ready(Err(IqFailure::SendError(error.into_io_error())));
                    }

                    Some(PacketState::Sent) | Some(PacketState::Acked) => {
                        // Sent successfully; from here on only the
                        // response channel matters.
                        *this.packet_token = None;
                        return Poll::Pending;
                    }
                },

                None => return Poll::Pending,
            }
        }
    }
}

/// Utility struct to track IQ responses.
///
/// Matching follows RFC 6120 § 8.2.3: a `result`/`error` IQ belongs to a
/// pending request iff the id matches *and* the sender is the recipient
/// the request went to (compared as bare JIDs), or the sender is absent
/// while the request went to the account's own bare JID.
pub struct IqResponseTracker {
    map: Arc<Mutex<IqMap>>,
}

impl IqResponseTracker {
    /// Create a new empty response tracker.
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(IqMap::new())),
        }
    }

    /// Attempt to handle an IQ stanza as a tracked IQ response.
    ///
    /// Returns the stanza unharmed if it does not belong to any tracked
    /// request.
    ///
    /// `local_jid` is the session's own address, used for the implicit
    /// "server answered on behalf of my account" rule.
    pub fn handle_iq(&self, iq: Iq, local_jid: &Jid) -> ControlFlow<(), Iq> {
        let payload = match iq.payload {
            IqType::Error(error) => IqResponse::Error(error),
            IqType::Result(result) => IqResponse::Result(result),
            _ => return ControlFlow::Continue(iq),
        };
        let mut map = self.map.lock().unwrap();
        let Some(entry) = map.get(&iq.id) else {
            log::trace!(
                "not handling IQ response with id {:?}: no active tracker for this id",
                iq.id,
            );
            return ControlFlow::Continue(Iq {
                from: iq.from,
                to: iq.to,
                id: iq.id,
                lang: iq.lang,
                payload: payload.into(),
            });
        };

        match iq.from.as_ref() {
            Some(from) if from.bare_eq(&entry.recipient) => (),
            None if entry.recipient.bare_eq(local_jid) => (),
            None => {
                // The lax reading of RFC 6120 § 8.1.2.1 would accept
                // this; we go with the strict one and only log how close
                // the stanza came.
                log::warn!(
                    "IQ response with id {:?} has no 'from', but the request went to {}; not treating it as the response.",
                    iq.id,
                    entry.recipient,
                );
                return ControlFlow::Continue(Iq {
                    from: iq.from,
                    to: iq.to,
                    id: iq.id,
                    lang: iq.lang,
                    payload: payload.into(),
                });
            }
            Some(from) => {
                // Id collision with a foreign (possibly malicious)
                // sender: the pending request stays pending, and the
                // stanza is dropped so nobody mistakes it for the
                // response.
                log::warn!(
                    "IQ response with id {:?} came from {} instead of {}; ignoring it.",
                    iq.id,
                    from,
                    entry.recipient,
                );
                return ControlFlow::Break(());
            }
        }

        // Unwrap: presence was checked above, the lock is still held.
        let entry = map.remove(&iq.id).unwrap();
        let _: Result<_, _> = entry.sink.send(Ok(payload));
        ControlFlow::Break(())
    }

    /// Allocate a tracking handle for a fresh IQ request.
    ///
    /// The request is assigned a unique generated id.
    pub fn allocate_iq_handle(&self, to: Jid, req: IqRequest) -> (Iq, IqResponseToken) {
        let mut map = self.map.lock().unwrap();
        let mut id = make_id();
        while map.contains_key(&id) {
            log::warn!("generated IQ id {:?} is already tracked, regenerating", id);
            id = make_id();
        }
        let (tx, rx) = oneshot::channel();
        let token = IqResponseToken {
            entry: Some(IqMapEntryHandle {
                id: id.clone(),
                map: Arc::downgrade(&self.map),
            }),
            packet_token: None,
            inner: rx,
        };
        map.insert(
            id.clone(),
            PendingIq {
                recipient: to.clone(),
                sink: tx,
            },
        );
        (
            Iq {
                from: None,
                to: Some(to),
                id,
                lang: None,
                payload: req.into(),
            },
            token,
        )
    }

    /// Fail all pending requests.
    ///
    /// Used when the session ends without the possibility of resumption:
    /// none of the outstanding requests can be answered anymore.
    pub fn cancel_all(&self) {
        let mut map = self.map.lock().unwrap();
        for (_, entry) in core::mem::take(&mut *map) {
            let _: Result<_, _> = entry.sink.send(Err(IqFailure::Disconnected));
        }
    }
}

impl Default for IqResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stanza_error::{DefinedCondition, ErrorType};

    fn tracker_with_request(to: &str) -> (IqResponseTracker, Iq, IqResponseToken) {
        let tracker = IqResponseTracker::new();
        let (iq, token) = tracker.allocate_iq_handle(
            Jid::new(to).unwrap(),
            IqRequest::Get(Element::builder("ping", "urn:xmpp:ping").build()),
        );
        (tracker, iq, token)
    }

    fn local() -> Jid {
        Jid::new("me@example.org/res").unwrap()
    }

    #[tokio::test]
    async fn matching_result_resolves_the_request() {
        let (tracker, iq, token) = tracker_with_request("svc.example.org");
        let response = Iq {
            from: Some(Jid::new("svc.example.org").unwrap()),
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Break(())
        ));
        match token.await {
            Ok(IqResponse::Result(None)) => (),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_jid_responder_matches_on_bare() {
        let (tracker, iq, token) = tracker_with_request("peer@example.org");
        let response = Iq {
            from: Some(Jid::new("peer@example.org/phone").unwrap()),
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Error(StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::ItemNotFound,
            )),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Break(())
        ));
        match token.await {
            Ok(IqResponse::Error(error)) => {
                assert_eq!(error.defined_condition, DefinedCondition::ItemNotFound)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn mismatched_sender_neither_resolves_nor_passes_on() {
        let (tracker, iq, mut token) = tracker_with_request("svc.example.org");
        let response = Iq {
            from: Some(Jid::new("evil@other.org").unwrap()),
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Result(None),
        };
        // The spoofed response is consumed without resolving anything.
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Break(())
        ));
        assert!(futures::poll!(Pin::new(&mut token)).is_pending());
    }

    #[tokio::test]
    async fn absent_from_matches_only_own_bare_jid() {
        // Request to the own account: the server may answer without a
        // 'from'.
        let (tracker, iq, token) = tracker_with_request("me@example.org");
        let response = Iq {
            from: None,
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Break(())
        ));
        assert!(token.await.is_ok());

        // Request to a third party: an answer without a 'from' is not
        // good enough.
        let (tracker, iq, mut token) = tracker_with_request("svc.example.org");
        let response = Iq {
            from: None,
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Continue(_)
        ));
        assert!(futures::poll!(Pin::new(&mut token)).is_pending());
    }

    #[tokio::test]
    async fn unknown_ids_pass_through() {
        let tracker = IqResponseTracker::new();
        let response = Iq {
            from: Some(Jid::new("svc.example.org").unwrap()),
            to: Some(local()),
            id: "A1".to_owned(),
            lang: None,
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Continue(_)
        ));
    }

    #[tokio::test]
    async fn requests_are_not_matched_as_responses() {
        let (tracker, iq, _token) = tracker_with_request("svc.example.org");
        // An inbound get with a colliding id must not touch the tracker.
        let request = Iq {
            from: Some(Jid::new("svc.example.org").unwrap()),
            to: Some(local()),
            id: iq.id.clone(),
            lang: None,
            payload: IqType::Get(Element::builder("ping", "urn:xmpp:ping").build()),
        };
        assert!(matches!(
            tracker.handle_iq(request, &local()),
            ControlFlow::Continue(_)
        ));
    }

    #[tokio::test]
    async fn cancel_all_fails_pending_requests() {
        let (tracker, _iq, token) = tracker_with_request("svc.example.org");
        tracker.cancel_all();
        match token.await {
            Err(IqFailure::Disconnected) => (),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_the_token_releases_the_entry() {
        let (tracker, iq, token) = tracker_with_request("svc.example.org");
        drop(token);
        let response = Iq {
            from: Some(Jid::new("svc.example.org").unwrap()),
            to: Some(local()),
            id: iq.id,
            lang: None,
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(response, &local()),
            ControlFlow::Continue(_)
        ));
    }
}
