// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::ops::ControlFlow::{self, Break, Continue};
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use veery_jid::Jid;

use crate::protocol::bind::{BindQuery, BindResponse};
use crate::protocol::stanza::{Iq, IqType, Stanza};
use crate::protocol::stanza_error::DefinedCondition as StanzaCondition;
use crate::protocol::stream_error::{DefinedCondition, StreamError};
use crate::protocol::{sm, AsElement, FromElement, StreamFeatures, XmppStreamElement};
use crate::xmlstream::ReadError;

use super::error::OpaqueIoError;
use super::queue::{QueueEntry, TransmitQueue};
use super::stream_management::{SmState, SmError};
use super::worker::XmppStream;

static BIND_REQ_ID: &str = "session-bind";

/// The post-authentication negotiation steps: classic resource binding,
/// then stream management enabling or resumption.
pub(super) enum NegotiationState {
    /// Nothing left to negotiate; report the stream as established.
    ///
    /// Reached directly when Bind 2 already bound the resource inline
    /// and the server offers no stream management.
    Complete {
        /// The inline-bound JID.
        bound_jid: Jid,
    },

    /// Send a request to bind a resource.
    SendBindRequest { sm_supported: bool },

    /// Receive the bind response.
    ReceiveBindResponse { sm_supported: bool },

    /// Send a request to enable or resume stream management.
    SendSmRequest {
        /// Stream management state. If present, resumption is attempted;
        /// otherwise a fresh session is established.
        sm_state: Option<SmState>,

        /// The freshly bound JID, carried along until negotiation ends.
        bound_jid: Option<Jid>,
    },

    /// Await the response to the SM enable/resume request.
    ReceiveSmResponse {
        sm_state: Option<SmState>,
        bound_jid: Option<Jid>,
    },
}

/// The ultimate result of a stream negotiation.
pub(super) enum NegotiationResult {
    /// An unplanned disconnect happened or a stream error was received
    /// from the remote party.
    Disconnect {
        /// Stream management state for a later resumption attempt.
        sm_state: Option<SmState>,

        /// I/O error which came along the disconnect.
        error: io::Error,
    },

    /// The negotiation completed successfully, but the stream was reset:
    /// stream management and all other session state was lost.
    StreamReset {
        /// Fresh stream management state, present when the new stream
        /// negotiated stream management.
        sm_state: Option<SmState>,

        /// The JID to which the stream is now bound.
        bound_jid: Jid,
    },

    /// The negotiation completed successfully by resuming a previous
    /// session.
    StreamResumed {
        /// Negotiated stream management state.
        sm_state: SmState,
    },

    /// The negotiation failed and we need to emit a stream error.
    ///
    /// Stream errors *received* from the peer are signalled using
    /// [`Self::Disconnect`] instead, with an I/O error of kind `Other`.
    StreamError {
        /// Stream error to send to the remote party.
        error: StreamError,
    },
}

impl NegotiationState {
    pub fn new(
        features: &StreamFeatures,
        sm_state: Option<SmState>,
        pre_bound: Option<Jid>,
    ) -> io::Result<Self> {
        if let Some(sm_state) = sm_state {
            if features.stream_management {
                return Ok(Self::SendSmRequest {
                    sm_state: Some(sm_state),
                    bound_jid: None,
                });
            }
            log::warn!("Peer is not offering stream management anymore. Dropping state.");
            let mut sm_state = sm_state;
            sm_state.fail_all(&OpaqueIoError::disconnected());
        }

        if let Some(bound_jid) = pre_bound {
            // Bind 2 already completed inline during authentication.
            if features.stream_management {
                return Ok(Self::SendSmRequest {
                    sm_state: None,
                    bound_jid: Some(bound_jid),
                });
            }
            return Ok(Self::Complete { bound_jid });
        }

        if !features.can_bind() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Peer is not offering the bind feature. Cannot proceed with stream negotiation.",
            ));
        }

        Ok(Self::SendBindRequest {
            sm_supported: features.stream_management,
        })
    }

    fn flush(stream: Pin<&mut XmppStream>, cx: &mut Context) -> ControlFlow<io::Error, ()> {
        match <XmppStream as Sink<&XmppStreamElement>>::poll_flush(stream, cx) {
            Poll::Pending | Poll::Ready(Ok(())) => Continue(()),
            Poll::Ready(Err(error)) => Break(error),
        }
    }

    /// Drive the negotiation one step.
    ///
    /// `Continue(Some(_))` yields a stanza which arrived before the
    /// negotiation finished; such stanzas are *not* counted by stream
    /// management, because counting only starts once the `<enabled/>` or
    /// `<resumed/>` has been processed.
    pub fn advance(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        jid: &Jid,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<ControlFlow<NegotiationResult, Option<Stanza>>> {
        match self {
            Self::Complete { bound_jid } => Poll::Ready(Break(NegotiationResult::StreamReset {
                sm_state: None,
                bound_jid: bound_jid.clone(),
            })),

            Self::SendBindRequest { sm_supported } => {
                // This is a fresh stream, so the tx buffers are empty
                // enough that sending without reading cannot deadlock.
                match ready!(<XmppStream as Sink<&XmppStreamElement>>::poll_ready(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) => (),
                    Err(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }
                };

                let resource = jid.resource().map(str::to_owned);
                let iq = Iq::from_set(BIND_REQ_ID, BindQuery::new(resource).as_element());
                match stream.start_send(&XmppStreamElement::Stanza(Stanza::Iq(iq))) {
                    Ok(()) => (),
                    Err(e) => panic!("failed to serialize bind request: {}", e),
                };

                *self = Self::ReceiveBindResponse {
                    sm_supported: *sm_supported,
                };
                Poll::Ready(Continue(None))
            }

            Self::ReceiveBindResponse { sm_supported } => {
                if let Break(error) = Self::flush(stream.as_mut(), cx) {
                    return Poll::Ready(Break(NegotiationResult::Disconnect {
                        sm_state: None,
                        error,
                    }));
                }

                let item = ready!(stream.poll_next(cx)).unwrap_or_else(|| {
                    Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                });

                match item {
                    Ok(XmppStreamElement::Stanza(Stanza::Iq(iq))) if iq.id == BIND_REQ_ID => {
                        match iq.payload {
                            IqType::Result(Some(payload)) => {
                                match BindResponse::from_element(payload) {
                                    Ok(response) => {
                                        let bound_jid = Jid::from(response.jid);
                                        if *sm_supported {
                                            *self = Self::SendSmRequest {
                                                sm_state: None,
                                                bound_jid: Some(bound_jid),
                                            };
                                            Poll::Ready(Continue(None))
                                        } else {
                                            Poll::Ready(Break(NegotiationResult::StreamReset {
                                                sm_state: None,
                                                bound_jid,
                                            }))
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Bind response failed to parse ({e}); emitting stream error.");
                                        Poll::Ready(Break(NegotiationResult::StreamError {
                                            error: StreamError::with_text(
                                                DefinedCondition::UndefinedCondition,
                                                e.to_string(),
                                            ),
                                        }))
                                    }
                                }
                            }
                            IqType::Error(stanza_error) => {
                                log::warn!("Resource binding failed: {stanza_error}");
                                // A bind conflict inhibits reconnection,
                                // exactly like a stream-level conflict.
                                let error = if stanza_error.defined_condition
                                    == StanzaCondition::Conflict
                                {
                                    io::Error::new(
                                        io::ErrorKind::Other,
                                        StreamError::new(DefinedCondition::Conflict),
                                    )
                                } else {
                                    io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        format!("resource binding failed: {stanza_error}"),
                                    )
                                };
                                transmit_queue.fail(&(&error).into());
                                Poll::Ready(Break(NegotiationResult::Disconnect {
                                    sm_state: None,
                                    error,
                                }))
                            }
                            _ => {
                                log::warn!("Unexpected IQ type in response to bind request; emitting stream error.");
                                Poll::Ready(Break(NegotiationResult::StreamError {
                                    error: StreamError::new(DefinedCondition::UndefinedCondition),
                                }))
                            }
                        }
                    }

                    Ok(XmppStreamElement::Stanza(other)) => {
                        log::debug!("Received stanza before bind response, delivering.");
                        Poll::Ready(Continue(Some(other)))
                    }

                    Ok(XmppStreamElement::StreamError(error)) => {
                        log::debug!("Received stream error, failing stream and discarding any stream management state.");
                        let error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&error).into());
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }

                    Ok(other) => {
                        log::warn!("Received unsupported stream element during bind: {other:?}. Emitting stream error.");
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError::new(DefinedCondition::UnsupportedStanzaType),
                        }))
                    }

                    // Soft timeouts during negotiation are a bad sign,
                    // but nothing to write home about.
                    Err(ReadError::SoftTimeout) => Poll::Ready(Continue(None)),

                    Err(ReadError::ParseError(e)) => {
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError::with_text(
                                DefinedCondition::InvalidXml,
                                e.to_string(),
                            ),
                        }))
                    }

                    Err(ReadError::HardError(error)) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }

                    Err(ReadError::StreamFooterReceived) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream footer received during negotiation",
                            ),
                        }))
                    }
                }
            }

            Self::SendSmRequest {
                sm_state,
                bound_jid,
            } => {
                match ready!(<XmppStream as Sink<&XmppStreamElement>>::poll_ready(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) => (),
                    Err(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error,
                        }))
                    }
                };

                let nonza = if let Some((id, inbound_ctr)) =
                    sm_state.as_ref().and_then(|x| x.resume_info())
                {
                    // Attempt resumption.
                    sm::Nonza::Resume(sm::Resume {
                        h: inbound_ctr,
                        previd: id.to_owned(),
                    })
                } else {
                    // Attempt enabling.
                    sm::Nonza::Enable(sm::Enable {
                        resume: true,
                        max: None,
                    })
                };
                match stream.start_send(&XmppStreamElement::Sm(nonza)) {
                    Ok(()) => (),
                    Err(e) => {
                        // After poll_ready confirmed readiness, only our
                        // own data can make start_send fail.
                        panic!("Failed to send SM nonza: {}", e);
                    }
                }

                *self = Self::ReceiveSmResponse {
                    sm_state: sm_state.take(),
                    bound_jid: bound_jid.take(),
                };
                // Ask to be polled again immediately to start flushing.
                Poll::Ready(Continue(None))
            }

            Self::ReceiveSmResponse {
                sm_state,
                bound_jid,
            } => {
                if let Break(error) = Self::flush(stream.as_mut(), cx) {
                    return Poll::Ready(Break(NegotiationResult::Disconnect {
                        sm_state: sm_state.take(),
                        error,
                    }));
                }

                let item = ready!(stream.poll_next(cx)).unwrap_or_else(|| {
                    Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                });
                match item {
                    // Pre-SM data: must not be counted, the counter only
                    // runs once <enabled/>/<resumed/> has been seen.
                    Ok(XmppStreamElement::Stanza(data)) => Poll::Ready(Continue(Some(data))),

                    Ok(XmppStreamElement::Sm(sm::Nonza::Enabled(enabled))) => {
                        if sm_state.is_some() {
                            // The peer answered a <resume/> with
                            // <enabled/>: someone is confused. Proceed
                            // with the fresh session either way.
                            log::warn!(
                                "Received <enabled/> in response to a resumption attempt. Proceeding with a fresh session.",
                            );
                            if let Some(mut old) = sm_state.take() {
                                old.fail_all(&OpaqueIoError::disconnected());
                            }
                        }
                        Poll::Ready(Break(NegotiationResult::StreamReset {
                            sm_state: Some(enabled.into()),
                            bound_jid: bound_jid.take().expect(
                                "State machine error: no bound_jid available in SM negotiation.",
                            ),
                        }))
                    }

                    Ok(XmppStreamElement::Sm(sm::Nonza::Resumed(resumed))) => {
                        match sm_state.take() {
                            Some(mut sm_state) => {
                                match sm_state.resume(resumed.h) {
                                    Ok(to_retransmit) => transmit_queue.requeue_all(to_retransmit),
                                    Err(e) => {
                                        log::error!("Resumption failed: {e}");
                                        return Poll::Ready(Break(
                                            NegotiationResult::StreamError { error: e.into() },
                                        ));
                                    }
                                }
                                Poll::Ready(Break(NegotiationResult::StreamResumed { sm_state }))
                            }
                            None => {
                                // Without matching state the stream dies
                                // as soon as the peer asks for our
                                // counters; terminate now instead.
                                Poll::Ready(Break(NegotiationResult::Disconnect {
                                    sm_state: None,
                                    error: io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "peer replied to <enable/> request with <resumed/>",
                                    ),
                                }))
                            }
                        }
                    }

                    Ok(XmppStreamElement::Sm(sm::Nonza::Failed(failed))) => {
                        match sm_state.take() {
                            Some(mut sm_state) => {
                                log::debug!("Received <failed/> in response to resumption request. Failing pending stanzas and renegotiating a session.");
                                if let Some(h) = failed.h {
                                    // Only an optimization: whatever the
                                    // peer acked does not need to fail.
                                    let _: Result<_, SmError> = sm_state.remote_acked(h);
                                }
                                sm_state.fail_all(&OpaqueIoError::disconnected());
                                *self = Self::SendBindRequest { sm_supported: true };
                                Poll::Ready(Continue(None))
                            }
                            None => {
                                log::warn!("Received <failed/> in response to enable request. Proceeding without stream management.");
                                Poll::Ready(Break(NegotiationResult::StreamReset {
                                    bound_jid: bound_jid.take().expect(
                                        "State machine error: no bound_jid available in SM negotiation.",
                                    ),
                                    sm_state: None,
                                }))
                            }
                        }
                    }

                    Ok(XmppStreamElement::StreamError(error)) => {
                        log::debug!("Received stream error, failing stream and discarding any stream management state.");
                        let error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&error).into());
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }

                    Ok(other) => {
                        log::warn!("Received unsupported stream element during negotiation: {other:?}. Emitting stream error.");
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError::new(DefinedCondition::UnsupportedStanzaType),
                        }))
                    }

                    Err(ReadError::SoftTimeout) => Poll::Ready(Continue(None)),

                    Err(ReadError::ParseError(e)) => {
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError::with_text(
                                DefinedCondition::InvalidXml,
                                e.to_string(),
                            ),
                        }))
                    }

                    Err(ReadError::HardError(error)) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error,
                        }))
                    }

                    Err(ReadError::StreamFooterReceived) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream footer received during negotiation",
                            ),
                        }))
                    }
                }
            }
        }
    }
}
