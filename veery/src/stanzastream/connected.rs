// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use veery_jid::Jid;

use crate::protocol::stream_error::{DefinedCondition, StreamError};
use crate::protocol::{sm, StreamFeatures, XmppStreamElement};
use crate::xmlstream::ReadError;

use super::error::OpaqueIoError;
use super::negotiation::{NegotiationResult, NegotiationState};
use super::queue::{PacketState, QueueEntry, TransmitQueue};
use super::stream_management::SmState;
use super::worker::{Never, WorkerEvent, XmppStream};

/// Outcome of polling a [`ConnectedState`].
pub(super) enum ConnectedEvent {
    /// An event to deliver to the worker loop.
    Worker(WorkerEvent),

    /// The stream broke or received a stream error.
    Disconnect {
        /// Stream management state worth keeping for resumption.
        sm_state: Option<SmState>,

        /// The error which broke the stream, if any.
        error: Option<io::Error>,
    },

    /// The peer closed the stream cleanly with a footer.
    RemoteShutdown {
        /// Stream management state worth keeping for resumption.
        sm_state: Option<SmState>,
    },

    /// The frontend dropped its queue handle; the session should shut
    /// down cleanly.
    LocalShutdownRequested,
}

/// The per-connection state machine, from post-authentication
/// negotiation to stanza exchange.
pub(super) enum ConnectedState {
    /// Driving resource binding and stream management negotiation.
    Negotiating { substate: NegotiationState },

    /// Session is established; stanzas flow in both directions.
    Ready {
        sm_state: Option<SmState>,

        /// A write error latched by `poll_writes`, reported on the next
        /// duplex poll.
        write_error: Option<io::Error>,
    },

    /// Terminating the stream with a stream error of our own.
    Failing {
        error: Option<StreamError>,
        sm_state: Option<SmState>,
    },
}

/// Keep the state only when it is worth resuming with; fail all pending
/// entries otherwise.
fn take_resumable(sm_state: Option<SmState>, error: &OpaqueIoError) -> Option<SmState> {
    match sm_state {
        Some(sm_state) if sm_state.is_resumable() => Some(sm_state),
        Some(mut sm_state) => {
            sm_state.fail_all(error);
            None
        }
        None => None,
    }
}

impl ConnectedState {
    pub(super) fn negotiate(
        features: &StreamFeatures,
        sm_state: Option<SmState>,
        pre_bound: Option<Jid>,
    ) -> io::Result<Self> {
        Ok(Self::Negotiating {
            substate: NegotiationState::new(features, sm_state, pre_bound)?,
        })
    }

    /// Drive reads and writes; emits the next event for the worker.
    ///
    /// Returning `None` means "poll again", used after internal state
    /// transitions.
    pub(super) fn poll(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        identity: &Jid,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<ConnectedEvent>> {
        match self {
            Self::Negotiating { substate } => {
                match ready!(substate.advance(stream, identity, transmit_queue, cx)) {
                    core::ops::ControlFlow::Continue(None) => Poll::Ready(None),
                    core::ops::ControlFlow::Continue(Some(stanza)) => {
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Stanza(stanza))))
                    }
                    core::ops::ControlFlow::Break(NegotiationResult::StreamReset {
                        sm_state,
                        bound_jid,
                    }) => {
                        *self = Self::Ready {
                            sm_state,
                            write_error: None,
                        };
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Reset {
                            bound_jid,
                        })))
                    }
                    core::ops::ControlFlow::Break(NegotiationResult::StreamResumed {
                        sm_state,
                    }) => {
                        *self = Self::Ready {
                            sm_state: Some(sm_state),
                            write_error: None,
                        };
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Resumed)))
                    }
                    core::ops::ControlFlow::Break(NegotiationResult::Disconnect {
                        sm_state,
                        error,
                    }) => Poll::Ready(Some(ConnectedEvent::Disconnect {
                        sm_state,
                        error: Some(error),
                    })),
                    core::ops::ControlFlow::Break(NegotiationResult::StreamError { error }) => {
                        *self = Self::Failing {
                            error: Some(error),
                            sm_state: None,
                        };
                        Poll::Ready(None)
                    }
                }
            }

            Self::Ready {
                sm_state,
                write_error,
            } => {
                if let Some(error) = write_error.take() {
                    let opaque = OpaqueIoError::from(&error);
                    return Poll::Ready(Some(ConnectedEvent::Disconnect {
                        sm_state: take_resumable(sm_state.take(), &opaque),
                        error: Some(error),
                    }));
                }

                // Writes first: pending acks, queued elements, pending
                // ack requests.
                match Self::drive_writes(sm_state, stream.as_mut(), transmit_queue, cx) {
                    WriteOutcome::Idle | WriteOutcome::Blocked => (),
                    WriteOutcome::QueueClosed => {
                        return Poll::Ready(Some(ConnectedEvent::LocalShutdownRequested))
                    }
                    WriteOutcome::Error(error) => {
                        let opaque = OpaqueIoError::from(&error);
                        return Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state: take_resumable(sm_state.take(), &opaque),
                            error: Some(error),
                        }));
                    }
                }
                // Opportunistic flush; backpressure is fine.
                match <XmppStream as Sink<&XmppStreamElement>>::poll_flush(stream.as_mut(), cx) {
                    Poll::Pending | Poll::Ready(Ok(())) => (),
                    Poll::Ready(Err(error)) => {
                        let opaque = OpaqueIoError::from(&error);
                        return Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state: take_resumable(sm_state.take(), &opaque),
                            error: Some(error),
                        }));
                    }
                }

                // Then reads.
                match ready!(stream.poll_next(cx)) {
                    Some(Ok(element)) => {
                        match Self::handle_element(sm_state, element, transmit_queue) {
                            None => Poll::Ready(None),
                            Some(ReadOutcome::Event(ev)) => Poll::Ready(Some(ev)),
                            Some(ReadOutcome::Fail(error)) => {
                                let sm_state = take_resumable(
                                    sm_state.take(),
                                    &OpaqueIoError::disconnected(),
                                );
                                *self = Self::Failing {
                                    error: Some(error),
                                    sm_state,
                                };
                                Poll::Ready(None)
                            }
                        }
                    }
                    Some(Err(ReadError::SoftTimeout)) => {
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::SoftTimeout)))
                    }
                    Some(Err(ReadError::ParseError(e))) => {
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::ParseError(e))))
                    }
                    Some(Err(ReadError::HardError(error))) => {
                        let opaque = OpaqueIoError::from(&error);
                        Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state: take_resumable(sm_state.take(), &opaque),
                            error: Some(error),
                        }))
                    }
                    Some(Err(ReadError::StreamFooterReceived)) => {
                        Poll::Ready(Some(ConnectedEvent::RemoteShutdown {
                            sm_state: take_resumable(
                                sm_state.take(),
                                &OpaqueIoError::disconnected(),
                            ),
                        }))
                    }
                    None => Poll::Ready(Some(ConnectedEvent::Disconnect {
                        sm_state: take_resumable(sm_state.take(), &OpaqueIoError::disconnected()),
                        error: Some(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "eof without stream footer",
                        )),
                    })),
                }
            }

            Self::Failing { error, sm_state } => {
                if error.is_some() {
                    match <XmppStream as Sink<&XmppStreamElement>>::poll_ready(
                        stream.as_mut(),
                        cx,
                    ) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(())) => {
                            let error = error.take().unwrap();
                            log::debug!("Sending stream error: {error}");
                            let _: Result<_, _> = stream
                                .as_mut()
                                .start_send(&XmppStreamElement::StreamError(error));
                        }
                        Poll::Ready(Err(e)) => {
                            let opaque = OpaqueIoError::from(&e);
                            return Poll::Ready(Some(ConnectedEvent::Disconnect {
                                sm_state: take_resumable(sm_state.take(), &opaque),
                                error: Some(e),
                            }));
                        }
                    }
                }
                match ready!(<XmppStream as Sink<&XmppStreamElement>>::poll_flush(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) | Err(_) => (),
                }
                let error = io::Error::new(
                    io::ErrorKind::InvalidData,
                    "stream failed with a local stream error",
                );
                let opaque = OpaqueIoError::from(&error);
                Poll::Ready(Some(ConnectedEvent::Disconnect {
                    sm_state: take_resumable(sm_state.take(), &opaque),
                    error: Some(error),
                }))
            }
        }
    }

    /// Drive only the write side.
    ///
    /// Never completes; errors are latched and surface on the next call
    /// to [`Self::poll`]. Used while the worker is blocked delivering an
    /// event to the frontend, so that transmission never stalls behind a
    /// slow consumer.
    pub(super) fn poll_writes(
        &mut self,
        stream: Pin<&mut XmppStream>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<Never> {
        match self {
            Self::Ready {
                sm_state,
                write_error,
            } if write_error.is_none() => {
                match Self::drive_writes(sm_state, stream, transmit_queue, cx) {
                    WriteOutcome::Idle | WriteOutcome::Blocked | WriteOutcome::QueueClosed => (),
                    WriteOutcome::Error(error) => *write_error = Some(error),
                }
                Poll::Pending
            }
            _ => Poll::Pending,
        }
    }

    fn drive_writes(
        sm_state: &mut Option<SmState>,
        mut stream: Pin<&mut XmppStream>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> WriteOutcome {
        macro_rules! ready_or {
            ($blocked:expr) => {
                match <XmppStream as Sink<&XmppStreamElement>>::poll_ready(stream.as_mut(), cx) {
                    Poll::Pending => return $blocked,
                    Poll::Ready(Ok(())) => (),
                    Poll::Ready(Err(e)) => return WriteOutcome::Error(e),
                }
            };
        }

        // Outstanding <a/> answers take priority: the peer may be
        // blocking on them.
        if let Some(sm) = sm_state.as_mut() {
            while sm.pending_acks > 0 {
                ready_or!(WriteOutcome::Blocked);
                let ack = XmppStreamElement::Sm(sm::Nonza::Ack(sm.inbound_ctr()));
                if let Err(e) = stream.as_mut().start_send(&ack) {
                    return WriteOutcome::Error(e);
                }
                sm.pending_acks -= 1;
            }
        }

        loop {
            match transmit_queue.poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(None) => return WriteOutcome::QueueClosed,
                Poll::Ready(Some(entry_ref)) => {
                    ready_or!(WriteOutcome::Blocked);
                    let entry = entry_ref.take();
                    if let Err(e) = stream.as_mut().start_send(&entry.element) {
                        entry.token.send_replace(PacketState::Failed {
                            error: OpaqueIoError::from(&e),
                        });
                        return WriteOutcome::Error(e);
                    }
                    entry.token.send_replace(PacketState::Sent);
                    match sm_state.as_mut() {
                        // Only stanzas enter the unacked queue and the
                        // sequence counting; nonzas are done once
                        // written.
                        Some(sm) if entry.is_stanza() => sm.enqueue(entry),
                        _ => (),
                    }
                }
            }
        }

        if let Some(sm) = sm_state.as_mut() {
            if sm.pending_req {
                ready_or!(WriteOutcome::Blocked);
                let req = XmppStreamElement::Sm(sm::Nonza::Req);
                if let Err(e) = stream.as_mut().start_send(&req) {
                    return WriteOutcome::Error(e);
                }
                sm.ack_request_sent();
            }
        }

        WriteOutcome::Idle
    }

    fn handle_element(
        sm_state: &mut Option<SmState>,
        element: XmppStreamElement,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
    ) -> Option<ReadOutcome> {
        match element {
            XmppStreamElement::Stanza(stanza) => {
                if let Some(sm) = sm_state.as_mut() {
                    sm.count_inbound();
                }
                Some(ReadOutcome::Event(ConnectedEvent::Worker(
                    WorkerEvent::Stanza(stanza),
                )))
            }
            XmppStreamElement::Sm(sm::Nonza::Ack(h)) => match sm_state.as_mut() {
                Some(sm) => match sm.remote_acked(h) {
                    Ok(()) => None,
                    Err(e) => {
                        log::error!("Peer sent a nonsensical ack: {e}");
                        Some(ReadOutcome::Fail(e.into()))
                    }
                },
                None => {
                    log::warn!("Received <a/> without stream management being enabled.");
                    None
                }
            },
            XmppStreamElement::Sm(sm::Nonza::Req) => match sm_state.as_mut() {
                Some(sm) => {
                    sm.pending_acks += 1;
                    None
                }
                None => {
                    log::warn!("Received <r/> without stream management being enabled.");
                    None
                }
            },
            XmppStreamElement::Sm(other) => {
                log::warn!("Ignoring unexpected SM nonza after negotiation: {other:?}");
                None
            }
            XmppStreamElement::StreamError(error) => {
                if matches!(error.condition, DefinedCondition::SeeOtherHost(_)) {
                    // A redirect is not the end of the session: the new
                    // host may resume it, so both the SM state and the
                    // queued stanzas survive.
                    log::debug!("Received stream error: {error}; following the redirect.");
                    let error = io::Error::new(io::ErrorKind::Other, error);
                    return Some(ReadOutcome::Event(ConnectedEvent::Disconnect {
                        sm_state: take_resumable(
                            sm_state.take(),
                            &OpaqueIoError::disconnected(),
                        ),
                        error: Some(error),
                    }));
                }
                log::debug!("Received stream error: {error}; failing stream.");
                let error = io::Error::new(io::ErrorKind::Other, error);
                transmit_queue.fail(&(&error).into());
                if let Some(mut sm) = sm_state.take() {
                    // Any other stream error ends the session; the
                    // server will not let us resume it.
                    sm.fail_all(&(&error).into());
                }
                Some(ReadOutcome::Event(ConnectedEvent::Disconnect {
                    sm_state: None,
                    error: Some(error),
                }))
            }
            other => {
                log::warn!("Ignoring unsupported stream element: {other:?}");
                None
            }
        }
    }

    /// Queue a `<sm:r/>` if stream management is enabled.
    ///
    /// Multiple calls may result in a single `<sm:r/>`. Returns false
    /// when stream management is not active.
    pub(super) fn queue_sm_request(&mut self) -> bool {
        match self {
            Self::Ready {
                sm_state: Some(sm),
                ..
            } => {
                sm.request_ack();
                true
            }
            _ => false,
        }
    }

    /// Flush what can be flushed, then close the stream with a footer.
    pub(super) fn poll_close(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if let Self::Ready { sm_state, .. } = self {
            // Last chance for enqueued elements to leave; remaining
            // unacked entries end in the Sent stage, which is exactly
            // what a graceful close promises.
            match Self::drive_writes(sm_state, stream.as_mut(), transmit_queue, cx) {
                WriteOutcome::Blocked => return Poll::Pending,
                WriteOutcome::Idle | WriteOutcome::QueueClosed => (),
                WriteOutcome::Error(e) => return Poll::Ready(Err(e)),
            }
        }
        <XmppStream as Sink<&XmppStreamElement>>::poll_close(stream, cx)
    }
}

enum WriteOutcome {
    /// Nothing (more) to write.
    Idle,
    /// The transport exerts backpressure.
    Blocked,
    /// The frontend dropped the queue sender.
    QueueClosed,
    /// The transport failed.
    Error(io::Error),
}

enum ReadOutcome {
    Event(ConnectedEvent),
    Fail(StreamError),
}
