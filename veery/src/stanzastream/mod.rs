// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Resilient stanza stream
//!
//! This module provides the [`StanzaStream`], the level above the
//! low-level [`XmlStream`][`crate::xmlstream::XmlStream`].
//!
//! The stanza stream knows about XMPP, and most importantly it knows how
//! to fix a broken connection with a reconnect and how to do so smoothly
//! using [XEP-0198 (Stream
//! Management)](https://xmpp.org/extensions/xep-0198.html), when the
//! peer supports it. Without XEP-0198, automatic reconnects still
//! happen, but with more undetectable data loss.

use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, Stream};

use tokio::sync::{mpsc, oneshot};

use veery_jid::Jid;

use crate::client::auth::{client_auth, TokenStore};
use crate::client::Config;
use crate::connect::ServerConnector;
use crate::error::Error;
use crate::protocol::{Stanza, StreamFeatures, XmppStreamElement};

mod connected;
mod error;
mod negotiation;
mod queue;
mod stream_management;
mod worker;

use self::queue::QueueEntry;
pub use self::error::OpaqueIoError;
pub use self::queue::{PacketStage, PacketState, PacketToken};
pub use self::worker::{Connection, ReconnectHint, XmppStream};
use self::worker::{StanzaStreamWorker, LOCAL_SHUTDOWN_TIMEOUT};

/// Event informing about a change of the [`StanzaStream`]'s status.
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream was (re-)established **with** loss of state.
    Reset {
        /// The new JID to which the stream is bound.
        bound_jid: Jid,

        /// The features reported by the stream.
        features: StreamFeatures,
    },

    /// The stream is currently inactive because a connection was lost.
    ///
    /// Resumption without loss of state is still possible. This event is
    /// merely informative and may be used to prolong timeouts or to tell
    /// the user that the connection is unstable.
    Suspended,

    /// The stream was reestablished **without** loss of state.
    Resumed,

    /// The stream ended for good and no reconnect will be attempted,
    /// e.g. because another session took over the resource.
    Failed {
        /// The error which ended the stream.
        error: Error,
    },
}

/// Event emitted by the [`StanzaStream`].
///
/// Stream closure is not an explicit event; it is the end of the event
/// stream itself.
#[derive(Debug)]
pub enum Event {
    /// The stream's connectivity status has changed.
    Stream(StreamEvent),

    /// A stanza was received over the stream.
    Stanza(Stanza),
}

/// The reconnect backoff schedule.
///
/// Keep-alive losses retry after a single second: the connection was
/// live not long ago, so chances are a quick retry fixes things.
fn reconnect_delay(attempt: u32, quick: bool) -> Duration {
    if quick {
        return Duration::new(1, 0);
    }
    match attempt {
        0 => Duration::ZERO,
        1..=4 => Duration::new(10, 0),
        5..=9 => Duration::new(20, 0),
        10..=14 => Duration::new(40, 0),
        _ => Duration::new(60, 0),
    }
}

/// Frontend interface to a reliable, always-online stanza stream.
pub struct StanzaStream {
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<QueueEntry>,
}

impl StanzaStream {
    /// Establish a new client-to-server stream using the given
    /// [`ServerConnector`].
    ///
    /// `config` carries the account credentials and session options;
    /// `tokens` is the (possibly pre-seeded) FAST token store shared
    /// with the host application.
    ///
    /// The `queue_depth` controls the sizes of the incoming and outgoing
    /// stanza queues. If a size is exceeded, the corresponding direction
    /// blocks until the queue can be flushed; the reverse direction is
    /// unaffected.
    pub fn new_c2s<C: ServerConnector + Sync>(
        server: C,
        config: Arc<Config>,
        tokens: TokenStore,
        queue_depth: usize,
    ) -> Self {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut first = true;
        let reconnector = Box::new(
            move |hint: ReconnectHint, slot: oneshot::Sender<Connection>| {
                if !first && !config.auto_reconnect {
                    log::debug!("Not reconnecting: auto_reconnect is disabled.");
                    // Dropping the slot tells the worker that no
                    // connection will come.
                    drop(slot);
                    return;
                }
                first = false;

                let config = config.clone();
                let tokens = tokens.clone();
                let attempts = attempts.clone();
                let server = match &hint.location {
                    Some((host, port)) => server.with_preferred_address(host, *port),
                    None => server.clone(),
                };
                tokio::spawn(async move {
                    let mut quick = hint.quick;
                    loop {
                        let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                        let delay = reconnect_delay(attempt, quick);
                        quick = false;
                        if !delay.is_zero() {
                            log::debug!("Waiting {delay:?} before connection attempt.");
                            tokio::time::sleep(delay).await;
                        }
                        log::debug!("Starting new connection as {}", config.jid);
                        match client_auth(&server, &config, &tokens).await {
                            Ok(conn) => {
                                log::debug!("Connection as {} established", config.jid);
                                let Err(mut conn) = slot.send(conn) else {
                                    // Send succeeded; the session is
                                    // live again.
                                    attempts.store(0, Ordering::Relaxed);
                                    return;
                                };

                                log::debug!("StanzaStream dropped, attempting graceful termination of fresh stream.");
                                // The stanza stream is gone; be polite
                                // and close the fresh stream, but give
                                // up after a deadline.
                                let _: Result<_, _> = tokio::time::timeout(
                                    LOCAL_SHUTDOWN_TIMEOUT,
                                    <XmppStream as SinkExt<&XmppStreamElement>>::close(
                                        &mut conn.stream,
                                    ),
                                )
                                .await;
                                return;
                            }
                            Err(Error::Auth(e)) => {
                                // Authentication failures will not fix
                                // themselves by retrying with the same
                                // credentials.
                                log::error!("Authentication failed: {e}. Giving up.");
                                return;
                            }
                            Err(e) => {
                                log::error!("Failed to connect: {e}. Retrying.");
                            }
                        }
                    }
                });
            },
        );
        Self::new(reconnector, queue_depth)
    }

    /// Create a new stanza stream from a custom reconnection backend.
    ///
    /// The `connector` is responsible for producing a new authenticated
    /// [`Connection`] whenever asked. It must always eventually send to
    /// the channel it is given (dropping the channel ends the stream
    /// fatally), and all connections it produces must be authenticated
    /// for the same entity; otherwise queued stanzas could leak across
    /// identities on a reconnect.
    ///
    /// Resource binding is **not** the connector's business: the stanza
    /// stream negotiates it (unless authentication already bound
    /// inline).
    pub fn new(
        connector: Box<dyn FnMut(ReconnectHint, oneshot::Sender<Connection>) + Send + 'static>,
        queue_depth: usize,
    ) -> Self {
        // c2f = core to frontend, f2c = frontend to core
        let (f2c_tx, c2f_rx) = StanzaStreamWorker::spawn(connector, queue_depth);
        Self {
            tx: f2c_tx,
            rx: c2f_rx,
        }
    }

    async fn assert_send(&self, entry: QueueEntry) {
        match self.tx.send(entry).await {
            Ok(()) => (),
            Err(_) => panic!("Stream closed or the stream's background workers have crashed."),
        }
    }

    /// Close the stream.
    ///
    /// Initiates a clean shutdown and cancels all further reconnection
    /// attempts.
    pub async fn close(mut self) {
        drop(self.tx); // closes stream.
        while let Some(ev) = self.rx.recv().await {
            log::trace!("discarding event {:?} after stream closure", ev);
        }
    }

    /// Send a stanza via the stream.
    ///
    /// Completion of this function only means the stanza was enqueued:
    /// it may sit in the transmission queue for a while if the stream is
    /// currently disconnected. Progress can be observed via the returned
    /// [`PacketToken`].
    ///
    /// # Panics
    ///
    /// If the stream has failed catastrophically (i.e. due to a software
    /// bug), this function may panic.
    pub async fn send(&self, stanza: Box<Stanza>) -> PacketToken {
        let (entry, token) =
            QueueEntry::tracked(Box::new(XmppStreamElement::Stanza(*stanza)));
        self.assert_send(entry).await;
        token
    }

    /// Send a non-stanza stream element (e.g. a CSI nonza).
    ///
    /// Nonzas are not retained for retransmission: stream management
    /// never acks them, and their token completes at
    /// [`PacketStage::Sent`].
    pub async fn send_nonza(&self, nonza: Box<XmppStreamElement>) -> PacketToken {
        debug_assert!(!nonza.is_stanza(), "stanzas must go through send()");
        let (entry, token) = QueueEntry::tracked(nonza);
        self.assert_send(entry).await;
        token
    }
}

impl Stream for StanzaStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
