// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::ops::ControlFlow;
use core::time::Duration;
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;

use minidom::Element;

use veery_jid::Jid;

use crate::connect::ServerConnector;
use crate::error::Error;
use crate::event::Event;
use crate::modules::{DispatchOutcome, ExtensionBus, Module, ModuleContext};
use crate::protocol::csi::ClientState;
use crate::protocol::sasl2::UserAgent;
use crate::protocol::stanza::Stanza;
use crate::protocol::{StreamFeatures, XmppStreamElement};
use crate::stanzastream::{
    Event as StreamLevelEvent, PacketToken, StanzaStream, StreamEvent,
};
use crate::xmlstream::Timeouts;

pub(crate) mod auth;
mod iq;

pub use auth::{FastToken, TokenStore};
pub use iq::{IqFailure, IqRequest, IqResponse, IqResponseToken};

#[cfg(feature = "starttls")]
use crate::connect::starttls::{StartTlsServerConnector, TlsOptions, TlsPolicy};
#[cfg(feature = "dns")]
use crate::connect::DnsConfig;

/// Transport security policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Use STARTTLS when the server offers it.
    Enabled,
    /// Never use TLS.
    Disabled,
    /// Require STARTTLS; fail when the server does not offer it.
    #[default]
    Required,
    /// Handshake TLS directly after connecting (legacy SSL, port 5223).
    LegacySsl,
}

/// Everything configurable about a session.
///
/// Construct with [`Config::new`] and adjust the public fields as
/// needed.
#[derive(Debug, Clone)]
pub struct Config {
    /// The account JID; a full JID requests that specific resource.
    pub jid: Jid,
    /// The account password.
    pub password: String,

    /// Dial this host instead of resolving SRV records.
    pub host: Option<String>,
    /// The port for `host`.
    pub port: Option<u16>,

    /// Transport security policy.
    pub tls_mode: TlsMode,
    /// Extra trust anchors, DER encoded.
    pub ca_certificates: Vec<Vec<u8>>,
    /// Skip TLS certificate verification (test servers only).
    pub ignore_tls_errors: bool,

    /// Allow XEP-0078 legacy authentication against pre-XMPP-1.0
    /// servers.
    pub non_sasl_auth: bool,
    /// Use SASL-2 (XEP-0388) when the server offers it.
    pub sasl2: bool,
    /// Try this SASL mechanism first.
    pub sasl_preferred_mechanism: Option<String>,
    /// Never use these SASL mechanisms.
    pub sasl_disabled_mechanisms: HashSet<String>,
    /// The user agent sent in SASL-2 authentication requests.
    pub sasl2_user_agent: Option<UserAgent>,

    /// Facebook application id for X-FACEBOOK-PLATFORM.
    pub facebook_app_id: Option<String>,
    /// Facebook access token for X-FACEBOOK-PLATFORM.
    pub facebook_access_token: Option<String>,
    /// Google access token for X-OAUTH2.
    pub google_access_token: Option<String>,
    /// Windows Live access token for X-MESSENGER-OAUTH2.
    pub windows_live_access_token: Option<String>,

    /// Prefix for generated resources (legacy auth, Bind 2 tags).
    pub resource_prefix: Option<String>,

    /// Interval of outbound keep-alive probes; zero disables the
    /// keep-alive machinery entirely.
    pub keep_alive_interval: Duration,
    /// How long to wait for any response after a probe before the
    /// connection is declared dead.
    pub keep_alive_timeout: Duration,

    /// Reconnect automatically after connection loss.
    pub auto_reconnect: bool,

    /// Automatically accept inbound presence subscription requests.
    ///
    /// The session core carries this setting; acting on it is the
    /// roster module's business.
    pub auto_accept_subscriptions: bool,
}

impl Config {
    /// A configuration with sensible defaults: TLS required, SASL-2
    /// on, PLAIN disabled, keep-alive 60 s/20 s, reconnect on.
    pub fn new<P: Into<String>>(jid: Jid, password: P) -> Config {
        Config {
            jid,
            password: password.into(),
            host: None,
            port: None,
            tls_mode: TlsMode::Required,
            ca_certificates: Vec::new(),
            ignore_tls_errors: false,
            non_sasl_auth: false,
            sasl2: true,
            sasl_preferred_mechanism: None,
            sasl_disabled_mechanisms: ["PLAIN".to_owned()].into_iter().collect(),
            sasl2_user_agent: None,
            facebook_app_id: None,
            facebook_access_token: None,
            google_access_token: None,
            windows_live_access_token: None,
            resource_prefix: None,
            keep_alive_interval: Duration::new(60, 0),
            keep_alive_timeout: Duration::new(20, 0),
            auto_reconnect: true,
            auto_accept_subscriptions: false,
        }
    }

    /// The stream silence timeouts corresponding to the keep-alive
    /// settings.
    pub(crate) fn timeouts(&self) -> Timeouts {
        if self.keep_alive_interval.is_zero() {
            Timeouts::disabled()
        } else {
            Timeouts {
                read_timeout: Some(self.keep_alive_interval),
                response_timeout: self.keep_alive_timeout,
            }
        }
    }
}

/// Transforms applied by an end-to-end encryption implementation.
///
/// The hook sits directly at the send contract: outbound stanzas are
/// transformed before serialization, inbound IQ payloads may be
/// decrypted before response correlation. Nothing else about delivery
/// semantics changes.
pub trait E2eeTransform: Send {
    /// Transform an outbound stanza (e.g. wrap the payloads into an
    /// encrypted envelope).
    fn encrypt_outbound(&mut self, stanza: Stanza) -> Stanza;

    /// Optionally decrypt an inbound IQ payload. Returning `None` keeps
    /// the original.
    fn decrypt_iq_payload(&mut self, payload: &Element) -> Option<Element>;
}

/// XMPP client session.
///
/// Owns the reliable [`StanzaStream`], the outgoing IQ tracker and the
/// extension bus. Drive it by calling [`Client::next`] in a loop.
pub struct Client {
    stream: StanzaStream,
    config: Arc<Config>,
    bound_jid: Option<Jid>,
    features: Option<StreamFeatures>,
    iq_tracker: iq::IqResponseTracker,
    bus: ExtensionBus,
    tokens: TokenStore,
    own_bare: Jid,
    e2ee: Option<Box<dyn E2eeTransform>>,
    terminated: bool,
}

#[cfg(feature = "starttls")]
impl Client {
    /// Start a new client session for the given configuration.
    ///
    /// Connection establishment begins immediately in the background;
    /// poll [`Client::next`] to observe it.
    pub fn new(config: Config) -> Client {
        Self::new_with_tokens(config, TokenStore::new())
    }

    /// Like [`Client::new`], with a FAST token store carried over from a
    /// previous process lifetime.
    pub fn new_with_tokens(config: Config, tokens: TokenStore) -> Client {
        let dns = match (config.host.as_deref(), config.port) {
            (Some(host), Some(port)) => DnsConfig::no_srv(host, port),
            (Some(host), None) => DnsConfig::no_srv(
                host,
                if config.tls_mode == TlsMode::LegacySsl {
                    5223
                } else {
                    5222
                },
            ),
            _ => DnsConfig::srv_default_client(config.jid.domain()),
        };
        let connector = StartTlsServerConnector {
            dns,
            policy: match config.tls_mode {
                TlsMode::Enabled => TlsPolicy::Opportunistic,
                TlsMode::Disabled => TlsPolicy::Disabled,
                TlsMode::Required => TlsPolicy::Required,
                TlsMode::LegacySsl => TlsPolicy::Direct,
            },
            tls: TlsOptions {
                ca_certificates: config.ca_certificates.clone(),
                ignore_certificate_errors: config.ignore_tls_errors,
            },
        };
        Self::new_with_connector(config, connector, tokens)
    }
}

impl Client {
    /// Start a new client session on a custom connector.
    pub fn new_with_connector<C: ServerConnector + Sync>(
        config: Config,
        connector: C,
        tokens: TokenStore,
    ) -> Client {
        let own_bare = config.jid.to_bare().into();
        let config = Arc::new(config);
        let stream = StanzaStream::new_c2s(connector, config.clone(), tokens.clone(), 16);
        Client {
            stream,
            config,
            bound_jid: None,
            features: None,
            iq_tracker: iq::IqResponseTracker::new(),
            bus: ExtensionBus::new(),
            tokens,
            own_bare,
            e2ee: None,
            terminated: false,
        }
    }

    /// Register an extension module.
    ///
    /// Dispatch order is registration order.
    pub fn register_module<M: Module + 'static>(&mut self, module: M) {
        self.bus.register(Box::new(module));
    }

    /// Install an end-to-end encryption transform.
    pub fn set_e2ee_transform<T: E2eeTransform + 'static>(&mut self, transform: T) {
        self.e2ee = Some(Box::new(transform));
    }

    /// Get the client's bound JID (the one reported by the server).
    ///
    /// `None` while no session is established.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    /// The features of the current stream, if a session is established.
    pub fn stream_features(&self) -> Option<&StreamFeatures> {
        self.features.as_ref()
    }

    /// The currently held FAST token, for persistence by the host
    /// application.
    pub fn fast_token(&self) -> Option<FastToken> {
        self.tokens.current()
    }

    /// Send a stanza.
    ///
    /// An id is assigned when the stanza has none. The returned
    /// [`PacketToken`] observes the packet through the send contract:
    /// queued, sent, acknowledged (on XEP-0198 streams) or failed.
    pub async fn send_stanza(&mut self, mut stanza: Stanza) -> PacketToken {
        stanza.ensure_id();
        if let Some(e2ee) = self.e2ee.as_mut() {
            stanza = e2ee.encrypt_outbound(stanza);
        }
        self.stream.send(Box::new(stanza)).await
    }

    /// Send an IQ request and track its response.
    ///
    /// An empty `to` addresses the account's own bare JID, mirroring
    /// RFC 6120 § 10.3.3.
    pub async fn send_iq(&mut self, to: Option<Jid>, request: IqRequest) -> IqResponseToken {
        let to = to.unwrap_or_else(|| self.own_bare.clone());
        let (iq, mut token) = self.iq_tracker.allocate_iq_handle(to, request);
        let mut stanza: Stanza = iq.into();
        if let Some(e2ee) = self.e2ee.as_mut() {
            stanza = e2ee.encrypt_outbound(stanza);
        }
        let packet_token = self.stream.send(Box::new(stanza)).await;
        token.set_packet_token(packet_token);
        token
    }

    /// Signal the client's activity state (XEP-0352) to the server.
    ///
    /// A no-op when the server does not support client state
    /// indication.
    pub async fn set_client_state(&mut self, state: ClientState) {
        let supported = self
            .features
            .as_ref()
            .map(|features| features.client_state_indication)
            .unwrap_or(false);
        if !supported {
            log::debug!("Server does not support client state indication; not sending {state:?}");
            return;
        }
        let _token = self
            .stream
            .send_nonza(Box::new(XmppStreamElement::Csi(state)))
            .await;
    }

    /// Wait for the next event.
    ///
    /// `None` means the stream is gone for good (after a final
    /// [`Event::Disconnected`] has been delivered).
    pub async fn next(&mut self) -> Option<Event> {
        if self.terminated {
            return None;
        }
        loop {
            match self.stream.next().await {
                None => {
                    self.terminated = true;
                    self.bound_jid = None;
                    return Some(Event::Disconnected(Error::Disconnected));
                }
                Some(StreamLevelEvent::Stream(StreamEvent::Reset {
                    bound_jid,
                    features,
                })) => {
                    self.bound_jid = Some(bound_jid.clone());
                    self.features = Some(features);
                    // The previous session is gone; nothing will answer
                    // the IQs it still had in flight.
                    self.iq_tracker.cancel_all();
                    return Some(Event::Online {
                        bound_jid,
                        resumed: false,
                    });
                }
                Some(StreamLevelEvent::Stream(StreamEvent::Resumed)) => {
                    let bound_jid = self
                        .bound_jid
                        .clone()
                        .expect("resumed a session which was never bound");
                    return Some(Event::Online {
                        bound_jid,
                        resumed: true,
                    });
                }
                Some(StreamLevelEvent::Stream(StreamEvent::Suspended)) => {
                    // Transparent; the stream reconnects on its own.
                    continue;
                }
                Some(StreamLevelEvent::Stream(StreamEvent::Failed { error })) => {
                    self.terminated = true;
                    self.bound_jid = None;
                    self.iq_tracker.cancel_all();
                    return Some(Event::Disconnected(error));
                }
                Some(StreamLevelEvent::Stanza(stanza)) => {
                    if let Some(event) = self.dispatch_stanza(stanza).await {
                        return Some(event);
                    }
                }
            }
        }
    }

    /// Run one stanza through the inbound chain: IQ tracker, then the
    /// module bus, then the automatic fallback replies.
    async fn dispatch_stanza(&mut self, stanza: Stanza) -> Option<Event> {
        let stanza = match stanza {
            Stanza::Iq(mut iq) => {
                if let Some(e2ee) = self.e2ee.as_mut() {
                    if let crate::protocol::IqType::Result(Some(ref payload)) = iq.payload {
                        if let Some(decrypted) = e2ee.decrypt_iq_payload(payload) {
                            iq.payload = crate::protocol::IqType::Result(Some(decrypted));
                        }
                    }
                }
                match self.iq_tracker.handle_iq(iq, &self.own_bare) {
                    ControlFlow::Break(()) => return None,
                    ControlFlow::Continue(iq) => Stanza::Iq(iq),
                }
            }
            other => other,
        };

        let mut ctx = ModuleContext::new(self.bound_jid.as_ref(), &self.config);
        let outcome = self.bus.dispatch(&mut ctx, stanza);
        for stanza in ctx.into_outbound() {
            // Module responses flow through the regular send contract;
            // their tokens are intentionally dropped.
            let _token = self.stream.send(Box::new(stanza)).await;
        }
        match outcome {
            DispatchOutcome::Handled => None,
            DispatchOutcome::Unhandled(stanza) => Some(Event::Stanza(stanza)),
        }
    }

    /// Close the session cleanly: flush the transmit queue, send the
    /// stream footer and tear the connection down.
    pub async fn send_end(self) -> Result<(), Error> {
        self.stream.close().await;
        Ok(())
    }
}
