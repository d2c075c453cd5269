// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;

use rand::{thread_rng, Rng};

use futures::{ready, SinkExt, StreamExt};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use veery_jid::Jid;

use crate::protocol::ping;
use crate::protocol::stanza::Iq;
use crate::protocol::stream_error::{DefinedCondition, StreamError};
use crate::protocol::{ParseError, StreamFeatures, XmppStreamElement};
use crate::xmlstream::{ReadError, XmlStream};

use super::connected::{ConnectedEvent, ConnectedState};
use super::queue::{QueueEntry, TransmitQueue};
use super::stream_management::SmState;
use super::{Event, StreamEvent};

/// Convenience alias for the type-erased XML stream the worker drives.
pub type XmppStream =
    XmlStream<Box<dyn crate::connect::AsyncReadAndWrite + Send + 'static>, XmppStreamElement>;

/// Underlying connection for a [`StanzaStream`][`super::StanzaStream`].
pub struct Connection {
    /// The stream to use to send and receive XMPP data.
    ///
    /// The stream must be freshly authenticated, with the
    /// post-authentication features already received.
    pub stream: XmppStream,

    /// The features of the post-authentication stream.
    pub features: StreamFeatures,

    /// The identity this stream is authenticated for. May carry a
    /// resource to request it at bind time.
    pub identity: Jid,

    /// When authentication already bound a resource inline (Bind 2),
    /// the JID it bound; resource binding is skipped then.
    pub bound: Option<Jid>,
}

/// Hints passed to the reconnection backend.
#[derive(Debug, Clone, Default)]
pub struct ReconnectHint {
    /// Dial this address instead of the configured one: the SM
    /// resumption location or a `<see-other-host/>` target.
    pub location: Option<(String, u16)>,

    /// Reconnect after a short, fixed delay: the connection died from a
    /// keep-alive timeout, not from a connect failure.
    pub quick: bool,
}

// Allow for up to 10s for local shutdown.
pub(super) static LOCAL_SHUTDOWN_TIMEOUT: Duration = Duration::new(10, 0);
pub(super) static REMOTE_SHUTDOWN_TIMEOUT: Duration = Duration::new(5, 0);
pub(super) static PING_PROBE_ID_PREFIX: &str = "veery-liveness-probe";

pub(super) enum Never {}

pub(super) enum WorkerEvent {
    /// The stream was reset and is ready for rx/tx.
    Reset { bound_jid: Jid },

    /// The stream has been resumed successfully.
    Resumed,

    /// A stanza arrived.
    Stanza(crate::protocol::Stanza),

    /// Failed to parse an element from the stream.
    ParseError(ParseError),

    /// Soft timeout noted by the underlying stream.
    SoftTimeout,

    /// Stream disconnected; a reconnect may happen.
    Disconnected {
        /// Slot for a new connection.
        slot: oneshot::Sender<Connection>,

        /// Hints for the reconnect backend.
        hint: ReconnectHint,

        /// None when the stream was closed cleanly by the remote side.
        error: Option<io::Error>,
    },

    /// Stream ended for good; no reconnect will be attempted.
    Fatal(crate::Error),

    /// The reconnection backend dropped the connection channel.
    ReconnectAborted,
}

enum WorkerStream {
    /// Pending connection.
    Connecting {
        /// Receiver slot for the next connection.
        slot: oneshot::Receiver<Connection>,

        /// Stream management state from a previous connection.
        sm_state: Option<SmState>,
    },

    /// Connection available.
    Connected {
        stream: XmppStream,
        substate: ConnectedState,
        features: StreamFeatures,
        identity: Jid,
    },

    /// Disconnected permanently.
    Terminated,
}

/// Extract the stream error from a disconnect error, if one caused it.
fn stream_error_of(error: &io::Error) -> Option<&StreamError> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<StreamError>())
}

impl WorkerStream {
    /// Transition into Connecting, computing the reconnect hints from
    /// the stream management state and the error which took the
    /// connection down.
    fn disconnect(&mut self, sm_state: Option<SmState>, error: Option<io::Error>) -> WorkerEvent {
        let mut hint = ReconnectHint::default();
        if let Some(sm) = sm_state.as_ref() {
            hint.location = sm.resume_location().cloned();
        }
        if let Some(error) = error.as_ref() {
            if error.kind() == io::ErrorKind::TimedOut {
                // Keep-alive loss: retry quickly, the network may just
                // have flapped.
                hint.quick = true;
            }
            if let Some(stream_error) = stream_error_of(error) {
                match &stream_error.condition {
                    DefinedCondition::Conflict => {
                        // Another session took over this resource;
                        // reconnecting would only steal it back and
                        // forth.
                        let error = crate::Error::Stream(stream_error.clone());
                        *self = Self::Terminated;
                        return WorkerEvent::Fatal(error);
                    }
                    DefinedCondition::SeeOtherHost(_) => {
                        hint.location = stream_error.redirect();
                    }
                    _ => (),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        *self = Self::Connecting { slot: rx, sm_state };
        WorkerEvent::Disconnected {
            slot: tx,
            hint,
            error,
        }
    }

    fn poll_duplex(
        self: Pin<&mut Self>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<WorkerEvent>> {
        let this = self.get_mut();
        loop {
            match this {
                // Disconnected permanently: signal end of stream.
                Self::Terminated => return Poll::Ready(None),

                // Reconnect in progress: wait for it and switch states.
                Self::Connecting { slot, sm_state } => {
                    match ready!(Pin::new(slot).poll(cx)) {
                        Ok(Connection {
                            stream,
                            features,
                            identity,
                            bound,
                        }) => {
                            // A panic here crashes the worker and thus
                            // the stream, which is exactly what an
                            // unnegotiable stream deserves.
                            let substate =
                                ConnectedState::negotiate(&features, sm_state.take(), bound)
                                    .expect("Non-negotiable stream");
                            *this = Self::Connected {
                                substate,
                                stream,
                                features,
                                identity,
                            };
                        }
                        Err(_) => {
                            // The sender was dropped: the backend gave
                            // up. This is fatal.
                            *this = Self::Terminated;
                            return Poll::Ready(Some(WorkerEvent::ReconnectAborted));
                        }
                    }
                }

                Self::Connected {
                    stream,
                    identity,
                    substate,
                    ..
                } => {
                    match ready!(substate.poll(Pin::new(stream), identity, transmit_queue, cx)) {
                        // Internal transition; keep looping.
                        None => (),

                        Some(ConnectedEvent::Worker(v)) => {
                            if let WorkerEvent::Reset { ref bound_jid } = v {
                                // Keep the bound JID for later bind
                                // requests and ping probes.
                                *identity = bound_jid.clone();
                            }
                            return Poll::Ready(Some(v));
                        }

                        Some(ConnectedEvent::Disconnect { sm_state, error }) => {
                            return Poll::Ready(Some(this.disconnect(sm_state, error)));
                        }

                        Some(ConnectedEvent::RemoteShutdown { sm_state }) => {
                            let error = io::Error::new(
                                io::ErrorKind::ConnectionAborted,
                                "peer closed the XML stream",
                            );
                            let hint = ReconnectHint {
                                location: sm_state
                                    .as_ref()
                                    .and_then(|sm| sm.resume_location().cloned()),
                                quick: false,
                            };
                            let (tx, rx) = oneshot::channel();
                            let mut new_state = Self::Connecting { slot: rx, sm_state };
                            core::mem::swap(this, &mut new_state);
                            match new_state {
                                Self::Connected { stream, .. } => {
                                    // Dispose of the old stream in the
                                    // background, politely.
                                    tokio::spawn(shutdown_stream_by_remote_choice(
                                        stream,
                                        REMOTE_SHUTDOWN_TIMEOUT,
                                    ));
                                }
                                _ => unreachable!(),
                            }
                            return Poll::Ready(Some(WorkerEvent::Disconnected {
                                slot: tx,
                                hint,
                                error: Some(error),
                            }));
                        }

                        Some(ConnectedEvent::LocalShutdownRequested) => {
                            // Not Terminated yet: close() still needs
                            // the connection; but the event stream ends.
                            return Poll::Ready(None);
                        }
                    }
                }
            }
        }
    }

    /// Poll the stream write-only.
    ///
    /// Never completes; I/O errors surface on the next `poll_duplex`.
    /// Runs in parallel to a blocking frontend send so that transmission
    /// does not stall behind a slow event consumer.
    fn poll_writes(
        &mut self,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context,
    ) -> Poll<Never> {
        match self {
            Self::Terminated | Self::Connecting { .. } => Poll::Pending,
            Self::Connected {
                substate, stream, ..
            } => {
                ready!(substate.poll_writes(Pin::new(stream), transmit_queue, cx));
                Poll::Pending
            }
        }
    }

    fn start_send_stream_error(&mut self, error: StreamError) {
        match self {
            // Not connected: feign success and terminate.
            Self::Terminated | Self::Connecting { .. } => {
                *self = Self::Terminated;
            }
            Self::Connected { substate, .. } => {
                *substate = ConnectedState::Failing {
                    error: Some(error),
                    sm_state: None,
                };
            }
        }
    }

    fn poll_close(
        &mut self,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context,
    ) -> Poll<io::Result<()>> {
        match self {
            Self::Terminated => Poll::Ready(Ok(())),
            Self::Connecting { .. } => {
                *self = Self::Terminated;
                Poll::Ready(Ok(()))
            }
            Self::Connected {
                substate, stream, ..
            } => {
                let result = ready!(substate.poll_close(Pin::new(stream), transmit_queue, cx));
                *self = Self::Terminated;
                Poll::Ready(result)
            }
        }
    }

    fn drive_duplex<'a>(
        &'a mut self,
        transmit_queue: &'a mut TransmitQueue<QueueEntry>,
    ) -> DriveDuplex<'a> {
        DriveDuplex {
            stream: Pin::new(self),
            queue: transmit_queue,
        }
    }

    fn drive_writes<'a>(
        &'a mut self,
        transmit_queue: &'a mut TransmitQueue<QueueEntry>,
    ) -> DriveWrites<'a> {
        DriveWrites {
            stream: Pin::new(self),
            queue: transmit_queue,
        }
    }

    fn close<'a>(&'a mut self, transmit_queue: &'a mut TransmitQueue<QueueEntry>) -> Close<'a> {
        Close {
            stream: Pin::new(self),
            queue: transmit_queue,
        }
    }

    /// Enqueue a `<sm:r/>`, if stream management is enabled.
    fn queue_sm_request(&mut self) -> bool {
        match self {
            Self::Terminated | Self::Connecting { .. } => false,
            Self::Connected { substate, .. } => substate.queue_sm_request(),
        }
    }

    /// The domain to address liveness probes to.
    fn ping_target(&self) -> Option<Jid> {
        match self {
            Self::Connected { identity, .. } => Jid::new(identity.domain()).ok(),
            _ => None,
        }
    }
}

struct DriveDuplex<'x> {
    stream: Pin<&'x mut WorkerStream>,
    queue: &'x mut TransmitQueue<QueueEntry>,
}

impl<'x> Future for DriveDuplex<'x> {
    type Output = Option<WorkerEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.as_mut().poll_duplex(this.queue, cx)
    }
}

struct DriveWrites<'x> {
    stream: Pin<&'x mut WorkerStream>,
    queue: &'x mut TransmitQueue<QueueEntry>,
}

impl<'x> Future for DriveWrites<'x> {
    type Output = Never;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.as_mut().poll_writes(this.queue, cx)
    }
}

struct Close<'x> {
    stream: Pin<&'x mut WorkerStream>,
    queue: &'x mut TransmitQueue<QueueEntry>,
}

impl<'x> Future for Close<'x> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.as_mut().poll_close(this.queue, cx)
    }
}

/// Worker task behind a [`StanzaStream`][`super::StanzaStream`].
pub(super) struct StanzaStreamWorker {
    reconnector: Box<dyn FnMut(ReconnectHint, oneshot::Sender<Connection>) + Send + 'static>,
    frontend_tx: mpsc::Sender<Event>,
    stream: WorkerStream,
    transmit_queue: TransmitQueue<QueueEntry>,

    /// Whether the last disconnect was a keep-alive loss; decides which
    /// error to report when the backend refuses to reconnect.
    keepalive_loss: bool,
}

macro_rules! send_or_break {
    ($value:expr => $permit:ident in $ch:expr, $txq:expr => $stream:expr$(,)?) => {
        if let Some(permit) = $permit.take() {
            log::trace!("stanza received, passing to frontend via permit");
            permit.send($value);
        } else {
            log::trace!("no permit for received stanza available, blocking on channel send while handling writes");
            tokio::select! {
                // drive_writes never completes: I/O errors are reported
                // on the next drive_duplex() call, which makes it ideal
                // to run next to $ch.send().
                result = $stream.drive_writes(&mut $txq) => { match result {} },
                result = $ch.send($value) => match result {
                    Err(_) => break,
                    Ok(()) => (),
                },
            }
        }
    };
}

impl StanzaStreamWorker {
    pub fn spawn(
        mut reconnector: Box<dyn FnMut(ReconnectHint, oneshot::Sender<Connection>) + Send + 'static>,
        queue_depth: usize,
    ) -> (mpsc::Sender<QueueEntry>, mpsc::Receiver<Event>) {
        let (conn_tx, conn_rx) = oneshot::channel();
        reconnector(ReconnectHint::default(), conn_tx);
        // c2f = core to frontend, f2c = frontend to core
        let (c2f_tx, c2f_rx) = mpsc::channel(queue_depth);
        let (f2c_tx, transmit_queue) = TransmitQueue::channel(queue_depth);
        let mut worker = StanzaStreamWorker {
            reconnector,
            frontend_tx: c2f_tx,
            stream: WorkerStream::Connecting {
                slot: conn_rx,
                sm_state: None,
            },
            transmit_queue,
            keepalive_loss: false,
        };
        tokio::spawn(async move { worker.run().await });
        (f2c_tx, c2f_rx)
    }

    pub async fn run(&mut self) {
        // Random starting value to avoid clashes with application ids.
        let mut ping_probe_ctr: u64 = thread_rng().gen();

        // A reserved permit guarantees that an event can be passed to
        // the frontend without blocking. Without a permit, send_or_break
        // uses the blocking send path and services stream writes in
        // parallel.
        let mut permit = None;
        loop {
            tokio::select! {
                new_permit = self.frontend_tx.reserve(), if permit.is_none() && !self.frontend_tx.is_closed() => match new_permit {
                    Ok(new_permit) => permit = Some(new_permit),
                    // Receiver side dropped: stream closure.
                    Err(_) => break,
                },
                ev = self.stream.drive_duplex(&mut self.transmit_queue) => {
                    let Some(ev) = ev else {
                        // Stream terminated by local choice.
                        break;
                    };
                    match ev {
                        WorkerEvent::Reset { bound_jid } => {
                            let features = match &self.stream {
                                WorkerStream::Connected { features, .. } => features.clone(),
                                _ => unreachable!("Reset event from a disconnected stream"),
                            };
                            send_or_break!(
                                Event::Stream(StreamEvent::Reset { bound_jid, features }) => permit in self.frontend_tx,
                                self.transmit_queue => self.stream,
                            );
                        }
                        WorkerEvent::Resumed => send_or_break!(
                            Event::Stream(StreamEvent::Resumed) => permit in self.frontend_tx,
                            self.transmit_queue => self.stream,
                        ),
                        WorkerEvent::Stanza(stanza) => send_or_break!(
                            Event::Stanza(stanza) => permit in self.frontend_tx,
                            self.transmit_queue => self.stream,
                        ),
                        WorkerEvent::Disconnected { slot, hint, error } => {
                            self.keepalive_loss = hint.quick;
                            send_or_break!(
                                Event::Stream(StreamEvent::Suspended) => permit in self.frontend_tx,
                                self.transmit_queue => self.stream,
                            );
                            if let Some(error) = error {
                                log::debug!("Backend stream got disconnected because of an I/O error: {error}. Attempting reconnect.");
                            } else {
                                log::debug!("Backend stream got disconnected for an unknown reason. Attempting reconnect.");
                            }
                            if self.frontend_tx.is_closed() || self.transmit_queue.is_closed() {
                                log::debug!("Immediately aborting reconnect because the frontend is gone.");
                                break;
                            }
                            (self.reconnector)(hint, slot);
                        }
                        WorkerEvent::Fatal(error) => {
                            log::debug!("Stream ended fatally: {error}");
                            send_or_break!(
                                Event::Stream(StreamEvent::Failed { error }) => permit in self.frontend_tx,
                                self.transmit_queue => self.stream,
                            );
                            break;
                        }
                        WorkerEvent::ParseError(e) => {
                            log::error!("Parse error on stream: {e}");
                            self.stream.start_send_stream_error(StreamError::with_text(
                                DefinedCondition::InvalidXml,
                                e.to_string(),
                            ));
                            // Not break-ing here: drive_duplex sends the
                            // error and reports the disconnect.
                        }
                        WorkerEvent::SoftTimeout => {
                            if self.stream.queue_sm_request() {
                                log::debug!("SoftTimeout tripped: enqueued <sm:r/>");
                            } else {
                                log::debug!("SoftTimeout tripped. Stream management is not enabled, enqueueing ping IQ");
                                ping_probe_ctr = ping_probe_ctr.wrapping_add(1);
                                let mut iq = Iq::from_get(
                                    format!("{}-{}", PING_PROBE_ID_PREFIX, ping_probe_ctr),
                                    ping::ping_payload(),
                                );
                                iq.to = self.stream.ping_target();
                                self.transmit_queue.enqueue(QueueEntry::untracked(Box::new(
                                    XmppStreamElement::Stanza(iq.into()),
                                )));
                            }
                        }
                        WorkerEvent::ReconnectAborted => {
                            log::error!("Reconnection backend gave up; ending the stream.");
                            let error = if self.keepalive_loss {
                                crate::Error::KeepAlive
                            } else {
                                crate::Error::Disconnected
                            };
                            send_or_break!(
                                Event::Stream(StreamEvent::Failed { error }) => permit in self.frontend_tx,
                                self.transmit_queue => self.stream,
                            );
                            break;
                        }
                    }
                },
            }
        }
        match self.stream.close(&mut self.transmit_queue).await {
            Ok(()) => log::debug!("Stream closed successfully"),
            Err(e) => log::debug!("Stream closure failed: {e}"),
        }
    }
}

/// Politely close a stream the remote side has already abandoned.
pub(super) async fn shutdown_stream_by_remote_choice(mut stream: XmppStream, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    match tokio::time::timeout_at(
        deadline,
        <XmppStream as SinkExt<&XmppStreamElement>>::close(&mut stream),
    )
    .await
    {
        // Success or failure does not matter; only the deadline does.
        Ok(_) => (),
        Err(_) => {
            log::debug!("Giving up on clean stream shutdown after timeout elapsed.");
            return;
        }
    }
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            _ = &mut timeout => {
                log::debug!("Giving up on clean stream shutdown after timeout elapsed.");
                break;
            }
            ev = stream.next() => match ev {
                None => break,
                Some(Ok(data)) => {
                    log::debug!("Ignoring data on stream during shutdown: {data:?}");
                }
                Some(Err(ReadError::HardError(e))) => {
                    log::debug!("Ignoring stream I/O error during shutdown: {e}");
                    break;
                }
                Some(Err(ReadError::SoftTimeout)) => (),
                Some(Err(ReadError::ParseError(_))) => (),
                Some(Err(ReadError::StreamFooterReceived)) => break,
            }
        }
    }
}
