// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Authentication profile negotiation: SASL (RFC 6120), SASL-2
//! (XEP-0388) with FAST (XEP-0484) and Bind 2 (XEP-0386), and legacy
//! non-SASL authentication (XEP-0078) for pre-XMPP-1.0 servers.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};

use veery_jid::Jid;
use veery_sasl::client::mechanisms::{
    Anonymous, DigestMd5, Facebook, HashedToken, MessengerOAuth2, Plain, Scram, XOAuth2,
};
use veery_sasl::client::Mechanism;
use veery_sasl::common::ht::{HtBinding, Sha256 as HtSha256, Sha3_512 as HtSha3_512, Sha512 as HtSha512};
use veery_sasl::common::scram::{Sha1, Sha256, Sha512};
use veery_sasl::common::ChannelBinding;

use crate::client::Config;
use crate::connect::{ConnectedStream, ServerConnector};
use crate::error::{AuthError, Error, ProtocolError};
use crate::event::make_id;
use crate::protocol::features::Sasl2Authentication;
use crate::protocol::sasl2::{Bind2Request, UserAgent};
use crate::protocol::stanza::{Iq, IqType, Stanza};
use crate::protocol::{ns, sasl, sasl2, StreamFeatures, XmppStreamElement};
use crate::stanzastream::Connection;
use crate::xmlstream::{ReadError, XmlStream};

use minidom::Element;

/// A FAST token held by the client (XEP-0484).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastToken {
    /// The HT-* mechanism this token is valid for.
    pub mechanism: String,
    /// The token secret.
    pub secret: String,
    /// The expiry timestamp as sent by the server, verbatim.
    pub expiry: Option<String>,
}

/// Shared storage for the FAST token.
///
/// The token rotates with every FAST authentication, so the store is
/// shared between the reconnect machinery (which consumes and replaces
/// tokens) and the host application (which persists them). Replacement
/// only happens after a `<success/>` has been fully parsed; a token is
/// never lost to a half-completed authentication attempt.
#[derive(Clone, Default)]
pub struct TokenStore {
    inner: Arc<Mutex<Option<FastToken>>>,
}

impl TokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a persisted token.
    pub fn seeded(token: FastToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(token))),
        }
    }

    /// The currently held token, if any.
    pub fn current(&self) -> Option<FastToken> {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn store(&self, token: FastToken) {
        *self.inner.lock().unwrap() = Some(token);
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

/// Whether the transport produced usable channel binding material.
fn has_binding_data(cb: &ChannelBinding) -> bool {
    !matches!(cb, ChannelBinding::None | ChannelBinding::Unsupported)
}

/// Construct the mechanism with the given name, when its credentials are
/// configured.
fn build_mechanism(
    name: &str,
    config: &Config,
    cb: &ChannelBinding,
) -> Option<Box<dyn Mechanism + Send>> {
    let username = config.jid.node().unwrap_or_default();
    // A SCRAM downgrade from the -PLUS variant announces "y" in the gs2
    // header so the server can detect a stripped offer (RFC 5802 § 6).
    let scram_cb = |plus: bool| {
        if plus {
            cb.clone()
        } else if has_binding_data(cb) {
            ChannelBinding::Unsupported
        } else {
            ChannelBinding::None
        }
    };
    let password_configured = !config.password.is_empty() && !username.is_empty();
    Some(match name {
        "SCRAM-SHA-512-PLUS" if password_configured && has_binding_data(cb) => Box::new(
            Scram::<Sha512>::new(username, config.password.as_str(), scram_cb(true)).ok()?,
        ),
        "SCRAM-SHA-256-PLUS" if password_configured && has_binding_data(cb) => Box::new(
            Scram::<Sha256>::new(username, config.password.as_str(), scram_cb(true)).ok()?,
        ),
        "SCRAM-SHA-1-PLUS" if password_configured && has_binding_data(cb) => Box::new(
            Scram::<Sha1>::new(username, config.password.as_str(), scram_cb(true)).ok()?,
        ),
        "SCRAM-SHA-512" if password_configured => Box::new(
            Scram::<Sha512>::new(username, config.password.as_str(), scram_cb(false)).ok()?,
        ),
        "SCRAM-SHA-256" if password_configured => Box::new(
            Scram::<Sha256>::new(username, config.password.as_str(), scram_cb(false)).ok()?,
        ),
        "SCRAM-SHA-1" if password_configured => Box::new(
            Scram::<Sha1>::new(username, config.password.as_str(), scram_cb(false)).ok()?,
        ),
        "DIGEST-MD5" if password_configured => Box::new(DigestMd5::new(
            username,
            config.password.as_str(),
            "xmpp",
            config.jid.domain(),
        )),
        "X-OAUTH2" => Box::new(XOAuth2::new(
            username,
            config.google_access_token.clone()?,
        )),
        "X-FACEBOOK-PLATFORM" => Box::new(Facebook::new(
            config.facebook_app_id.clone()?,
            config.facebook_access_token.clone()?,
        )),
        "X-MESSENGER-OAUTH2" => Box::new(MessengerOAuth2::new(
            config.windows_live_access_token.clone()?,
        )),
        "PLAIN" if password_configured => {
            Box::new(Plain::new(username, config.password.as_str()))
        }
        "ANONYMOUS" if username.is_empty() => Box::new(Anonymous::new()),
        _ => return None,
    })
}

/// The descending strength order used when no preferred mechanism
/// matches.
static MECHANISM_ORDER: &[&str] = &[
    "SCRAM-SHA-512-PLUS",
    "SCRAM-SHA-256-PLUS",
    "SCRAM-SHA-1-PLUS",
    "SCRAM-SHA-512",
    "SCRAM-SHA-256",
    "SCRAM-SHA-1",
    "DIGEST-MD5",
    "X-OAUTH2",
    "X-FACEBOOK-PLATFORM",
    "X-MESSENGER-OAUTH2",
    "PLAIN",
    "ANONYMOUS",
];

/// Pick a mechanism from the advertised set.
///
/// Locally disabled mechanisms and mechanisms whose credentials are not
/// configured never match; among the rest, the configured preference
/// wins, then descending strength.
fn choose_mechanism(
    offered: &[String],
    config: &Config,
    cb: &ChannelBinding,
) -> Result<Box<dyn Mechanism + Send>, AuthError> {
    let usable = |name: &str| {
        offered.iter().any(|offer| offer == name)
            && !config.sasl_disabled_mechanisms.contains(name)
    };

    if let Some(preferred) = config.sasl_preferred_mechanism.as_deref() {
        if usable(preferred) {
            if let Some(mechanism) = build_mechanism(preferred, config, cb) {
                return Ok(mechanism);
            }
            log::debug!("Preferred mechanism {preferred} lacks credentials; falling back.");
        }
    }

    for name in MECHANISM_ORDER {
        if usable(name) {
            if let Some(mechanism) = build_mechanism(name, config, cb) {
                log::info!("SASL mechanism '{}' selected", mechanism.name());
                return Ok(mechanism);
            }
        }
    }

    Err(AuthError::MechanismMismatch)
}

/// Parse an `HT-<HASH>-<BINDING>` mechanism name and construct it with
/// the given token secret.
///
/// Returns `None` when the hash is unknown or the transport cannot
/// produce the required binding material.
fn build_ht_mechanism(
    name: &str,
    username: &str,
    secret: &str,
    cb: &ChannelBinding,
) -> Option<Box<dyn Mechanism + Send>> {
    let rest = name.strip_prefix("HT-")?;
    let (hash, binding) = rest.rsplit_once('-')?;
    let binding = HtBinding::from_suffix(binding)?;
    Some(match hash {
        "SHA-256" => Box::new(HashedToken::<HtSha256>::new(username, secret, binding, cb).ok()?),
        "SHA-512" => Box::new(HashedToken::<HtSha512>::new(username, secret, binding, cb).ok()?),
        "SHA3-512" => {
            Box::new(HashedToken::<HtSha3_512>::new(username, secret, binding, cb).ok()?)
        }
        _ => return None,
    })
}

/// Of the server's FAST mechanisms, the one we would like a token for:
/// strongest hash first, and the strongest channel binding the transport
/// can actually produce.
fn choose_fast_mechanism(offered: &[String], cb: &ChannelBinding) -> Option<String> {
    const HASH_ORDER: &[&str] = &["SHA3-512", "SHA-512", "SHA-256"];
    const BINDING_ORDER: &[HtBinding] = &[
        HtBinding::Expr,
        HtBinding::Uniq,
        HtBinding::Endp,
        HtBinding::None,
    ];
    for binding in BINDING_ORDER {
        if binding.material(cb).is_none() {
            continue;
        }
        for hash in HASH_ORDER {
            let name = format!("HT-{}-{}", hash, binding.suffix());
            if offered.iter().any(|offer| *offer == name) {
                return Some(name);
            }
        }
    }
    None
}

/// Authenticate a freshly connected stream and return the connection the
/// stanza stream works with.
pub(crate) async fn client_auth<C: ServerConnector>(
    server: &C,
    config: &Config,
    tokens: &TokenStore,
) -> Result<Connection, Error> {
    let connected = server.connect(&config.jid, config.timeouts()).await?;

    if !connected.header.supports_features() {
        if config.non_sasl_auth {
            log::info!("Server predates XMPP 1.0; using non-SASL authentication");
            return non_sasl_auth(connected, config).await;
        }
        return Err(ProtocolError::UnsupportedVersion.into());
    }

    let channel_binding = C::channel_binding(connected.stream.get_stream())?;

    if config.sasl2 {
        if let Some(sasl2_features) = connected.features.sasl2.clone() {
            return sasl2_auth(connected, &sasl2_features, config, tokens, channel_binding).await;
        }
    }

    if !connected.features.sasl_mechanisms.is_empty() {
        return sasl1_auth(connected, config, channel_binding).await;
    }

    if connected.features.non_sasl_auth && config.non_sasl_auth {
        return non_sasl_auth(connected, config).await;
    }

    Err(AuthError::MechanismMismatch.into())
}

/// RFC 6120 § 6: the original SASL profile, with a stream restart after
/// success.
async fn sasl1_auth<S: crate::connect::AsyncReadAndWrite + 'static>(
    connected: ConnectedStream<S>,
    config: &Config,
    channel_binding: ChannelBinding,
) -> Result<Connection, Error> {
    let mut stream = connected.stream;
    let mut mechanism = choose_mechanism(
        &connected.features.sasl_mechanisms,
        config,
        &channel_binding,
    )?;

    stream
        .send(&XmppStreamElement::Sasl(sasl::Nonza::Auth {
            mechanism: mechanism.name().to_owned(),
            data: mechanism.initial(),
        }))
        .await?;

    loop {
        match stream.next().await {
            Some(Ok(XmppStreamElement::Sasl(sasl::Nonza::Challenge(data)))) => {
                let response = mechanism
                    .response(&data)
                    .map_err(|e| AuthError::Sasl(e))?;
                stream
                    .send(&XmppStreamElement::Sasl(sasl::Nonza::Response(response)))
                    .await?;
            }
            Some(Ok(XmppStreamElement::Sasl(sasl::Nonza::Success(data)))) => {
                mechanism.success(&data).map_err(|e| AuthError::Sasl(e))?;
                break;
            }
            Some(Ok(XmppStreamElement::Sasl(sasl::Nonza::Failure(failure)))) => {
                return Err(AuthError::from_condition(failure.condition).into());
            }
            Some(Ok(XmppStreamElement::StreamError(error))) => {
                return Err(Error::Stream(error));
            }
            Some(Ok(_)) => (), // ignore and loop
            Some(Err(ReadError::SoftTimeout)) => (),
            Some(Err(ReadError::ParseError(_))) => return Err(AuthError::ProcessingError.into()),
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::StreamFooterReceived)) | None => return Err(Error::Disconnected),
        }
    }

    // Authenticated; RFC 6120 requires a fresh stream now.
    let connected = crate::connect::reopen_stream(stream, config.jid.domain()).await?;
    Ok(Connection {
        stream: connected.stream.box_stream(),
        features: connected.features,
        identity: config.jid.clone(),
        bound: None,
    })
}

/// XEP-0388: the SASL-2 profile. No stream restart; the server sends the
/// post-authentication features directly after `<success/>`.
async fn sasl2_auth<S: crate::connect::AsyncReadAndWrite + 'static>(
    connected: ConnectedStream<S>,
    sasl2_features: &Sasl2Authentication,
    config: &Config,
    tokens: &TokenStore,
    channel_binding: ChannelBinding,
) -> Result<Connection, Error> {
    let mut stream = connected.stream;
    let username = config.jid.node().unwrap_or_default().to_owned();

    // Decide between a held FAST token and a regular mechanism.
    let stored = tokens.current().filter(|token| {
        sasl2_features
            .fast_mechanisms
            .iter()
            .any(|offer| *offer == token.mechanism)
    });

    let mut fast_in_use = false;
    let mut mechanism: Box<dyn Mechanism + Send>;
    let mut request_token = None;
    match stored {
        Some(token) => {
            match build_ht_mechanism(&token.mechanism, &username, &token.secret, &channel_binding)
            {
                Some(ht) => {
                    log::info!("Authenticating with FAST token ({})", token.mechanism);
                    fast_in_use = true;
                    mechanism = ht;
                }
                None => {
                    log::debug!(
                        "Held FAST token's binding is unavailable on this transport; using a regular mechanism."
                    );
                    mechanism =
                        choose_mechanism(&sasl2_features.mechanisms, config, &channel_binding)?;
                    request_token =
                        choose_fast_mechanism(&sasl2_features.fast_mechanisms, &channel_binding);
                }
            }
        }
        None => {
            mechanism = choose_mechanism(&sasl2_features.mechanisms, config, &channel_binding)?;
            request_token =
                choose_fast_mechanism(&sasl2_features.fast_mechanisms, &channel_binding);
        }
    }

    let user_agent = Some(config.sasl2_user_agent.clone().unwrap_or_else(|| UserAgent {
        id: None,
        software: Some(env!("CARGO_PKG_NAME").to_owned()),
        device: None,
    }));
    let bind = sasl2_features.bind2.then(|| Bind2Request {
        tag: config.resource_prefix.clone(),
    });

    loop {
        stream
            .send(&XmppStreamElement::Sasl2(sasl2::Nonza::Authenticate {
                mechanism: mechanism.name().to_owned(),
                initial_response: Some(mechanism.initial()),
                user_agent: user_agent.clone(),
                bind: bind.clone(),
                fast: fast_in_use,
                request_token: request_token.clone(),
            }))
            .await?;

        loop {
            match stream.next().await {
                Some(Ok(XmppStreamElement::Sasl2(sasl2::Nonza::Challenge(data)))) => {
                    let response = mechanism
                        .response(&data)
                        .map_err(|e| AuthError::Sasl(e))?;
                    stream
                        .send(&XmppStreamElement::Sasl2(sasl2::Nonza::Response(response)))
                        .await?;
                }
                Some(Ok(XmppStreamElement::Sasl2(sasl2::Nonza::Success {
                    additional_data,
                    authorization_identifier,
                    bound,
                    token,
                }))) => {
                    mechanism
                        .success(&additional_data.unwrap_or_default())
                        .map_err(|e| AuthError::Sasl(e))?;

                    // Token rotation is persist-on-success: the new
                    // secret replaces the old one only here, after the
                    // success has been parsed completely.
                    if let Some(token) = token {
                        let mechanism_name = if fast_in_use {
                            tokens.current().map(|t| t.mechanism)
                        } else {
                            request_token.clone()
                        };
                        if let Some(mechanism_name) = mechanism_name {
                            log::debug!("Storing rotated FAST token for {mechanism_name}");
                            tokens.store(FastToken {
                                mechanism: mechanism_name,
                                secret: token.secret,
                                expiry: token.expiry,
                            });
                        }
                    }

                    let bound_jid = if bound || authorization_identifier.is_some() {
                        authorization_identifier.filter(|jid| jid.is_full())
                    } else {
                        None
                    };

                    // XEP-0388 continues on the same stream: the server
                    // sends the remaining features without a restart.
                    let features = recv_post_sasl2_features(&mut stream).await?;
                    return Ok(Connection {
                        stream: stream.box_stream(),
                        features,
                        identity: config.jid.clone(),
                        bound: bound_jid,
                    });
                }
                Some(Ok(XmppStreamElement::Sasl2(sasl2::Nonza::Continue { tasks, .. }))) => {
                    // Task lists (e.g. 2FA) are outside this client's
                    // abilities; abort the attempt.
                    return Err(AuthError::RequiredTasks(tasks).into());
                }
                Some(Ok(XmppStreamElement::Sasl2(sasl2::Nonza::Failure(failure)))) => {
                    if fast_in_use {
                        // The token was rejected. Discard it and retry
                        // immediately with the regular credentials on
                        // the same stream.
                        log::info!("FAST token rejected; falling back to regular authentication");
                        tokens.clear();
                        fast_in_use = false;
                        mechanism =
                            choose_mechanism(&sasl2_features.mechanisms, config, &channel_binding)?;
                        request_token = choose_fast_mechanism(
                            &sasl2_features.fast_mechanisms,
                            &channel_binding,
                        );
                        break; // outer loop: send a fresh <authenticate/>
                    }
                    return Err(AuthError::from_condition(failure.condition).into());
                }
                Some(Ok(XmppStreamElement::StreamError(error))) => {
                    return Err(Error::Stream(error));
                }
                Some(Ok(_)) => (), // ignore and loop
                Some(Err(ReadError::SoftTimeout)) => (),
                Some(Err(ReadError::ParseError(_))) => {
                    return Err(AuthError::ProcessingError.into())
                }
                Some(Err(ReadError::HardError(e))) => return Err(e.into()),
                Some(Err(ReadError::StreamFooterReceived)) | None => {
                    return Err(Error::Disconnected)
                }
            }
        }
    }
}

/// After a SASL-2 success the server continues with `<stream:features/>`
/// on the same stream.
async fn recv_post_sasl2_features<S: crate::connect::AsyncReadAndWrite>(
    stream: &mut XmlStream<S, XmppStreamElement>,
) -> Result<StreamFeatures, Error> {
    loop {
        match stream.next().await {
            Some(Ok(XmppStreamElement::StreamFeatures(features))) => return Ok(features),
            Some(Ok(XmppStreamElement::StreamError(error))) => return Err(Error::Stream(error)),
            Some(Ok(other)) => {
                log::warn!("Unexpected element while waiting for post-authentication features: {other:?}");
                return Err(ProtocolError::UnexpectedElement.into());
            }
            Some(Err(ReadError::SoftTimeout)) => (),
            Some(Err(ReadError::ParseError(e))) => return Err(e.into()),
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::StreamFooterReceived)) | None => return Err(Error::Disconnected),
        }
    }
}

/// XEP-0078 non-SASL authentication for servers which predate XMPP 1.0.
///
/// The digest variant hashes the stream id with the password; the
/// plaintext variant is only used when the server offers nothing else.
async fn non_sasl_auth<S: crate::connect::AsyncReadAndWrite + 'static>(
    connected: ConnectedStream<S>,
    config: &Config,
) -> Result<Connection, Error> {
    let mut stream = connected.stream;
    let stream_id = connected.header.id.as_deref().unwrap_or_default().to_owned();
    let username = config.jid.node().unwrap_or_default().to_owned();
    let domain = Jid::new(config.jid.domain())?;
    let resource = match config.jid.resource() {
        Some(resource) => resource.to_owned(),
        None => format!(
            "{}{}",
            config.resource_prefix.as_deref().unwrap_or("veery."),
            &make_id()[..8],
        ),
    };

    // Query the supported fields first.
    let query_id = make_id();
    let fields_query = Iq::from_get(
        query_id.clone(),
        Element::builder("query", ns::AUTH)
            .append(
                Element::builder("username", ns::AUTH)
                    .append(username.as_str())
                    .build(),
            )
            .build(),
    )
    .with_to(domain.clone());
    stream
        .send(&XmppStreamElement::Stanza(fields_query.into()))
        .await?;

    let fields = loop {
        match await_iq_response(&mut stream, &query_id).await? {
            IqType::Result(Some(payload)) if payload.is("query", ns::AUTH) => break payload,
            IqType::Result(_) => return Err(AuthError::ProcessingError.into()),
            IqType::Error(error) => {
                log::warn!("Non-SASL field query failed: {error}");
                return Err(AuthError::ProcessingError.into());
            }
            _ => return Err(AuthError::ProcessingError.into()),
        }
    };

    let offers_digest = fields.has_child("digest", ns::AUTH) && !stream_id.is_empty();
    let offers_password = fields.has_child("password", ns::AUTH);

    let mut query = Element::builder("query", ns::AUTH)
        .append(
            Element::builder("username", ns::AUTH)
                .append(username.as_str())
                .build(),
        )
        .append(
            Element::builder("resource", ns::AUTH)
                .append(resource.as_str())
                .build(),
        );
    if offers_digest {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(stream_id.as_bytes());
        hasher.update(config.password.as_bytes());
        let digest = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        query = query.append(
            Element::builder("digest", ns::AUTH)
                .append(digest.as_str())
                .build(),
        );
    } else if offers_password {
        query = query.append(
            Element::builder("password", ns::AUTH)
                .append(config.password.as_str())
                .build(),
        );
    } else {
        log::warn!("No supported non-SASL authentication mechanism available");
        return Err(AuthError::MechanismMismatch.into());
    }

    let auth_id = make_id();
    let auth_iq = Iq::from_set(auth_id.clone(), query.build()).with_to(domain);
    stream
        .send(&XmppStreamElement::Stanza(auth_iq.into()))
        .await?;

    match await_iq_response(&mut stream, &auth_id).await? {
        IqType::Result(_) => {
            log::debug!("Authenticated (non-SASL)");
            let bound = config.jid.with_resource(
                &resource
                    .parse()
                    .map_err(Error::JidParse)?,
            );
            Ok(Connection {
                stream: stream.box_stream(),
                // Pre-1.0 streams have no features: no stream
                // management, no binding step.
                features: StreamFeatures::default(),
                identity: config.jid.clone(),
                bound: Some(bound.into()),
            })
        }
        IqType::Error(error) => {
            log::warn!("Non-SASL authentication failed: {error}");
            Err(AuthError::NotAuthorized.into())
        }
        _ => Err(AuthError::ProcessingError.into()),
    }
}

/// Wait for the IQ response with the given id during the login sequence.
async fn await_iq_response<S: crate::connect::AsyncReadAndWrite>(
    stream: &mut XmlStream<S, XmppStreamElement>,
    id: &str,
) -> Result<IqType, Error> {
    loop {
        match stream.next().await {
            Some(Ok(XmppStreamElement::Stanza(Stanza::Iq(iq)))) if iq.id == id => {
                return Ok(iq.payload)
            }
            Some(Ok(XmppStreamElement::StreamError(error))) => return Err(Error::Stream(error)),
            Some(Ok(_)) => (),
            Some(Err(ReadError::SoftTimeout)) => (),
            Some(Err(ReadError::ParseError(_))) => (),
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::StreamFooterReceived)) | None => return Err(Error::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config_with(password: &str) -> Config {
        let mut config = Config::new(Jid::new("foo@example.org").unwrap(), password);
        config.sasl_disabled_mechanisms = HashSet::new();
        config
    }

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strongest_mechanism_wins() {
        let config = config_with("bar");
        let mechanism = choose_mechanism(
            &offered(&["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"]),
            &config,
            &ChannelBinding::None,
        )
        .unwrap();
        assert_eq!(mechanism.name(), "SCRAM-SHA-256");
    }

    #[test]
    fn disabled_mechanisms_are_skipped() {
        let mut config = config_with("bar");
        config.sasl_disabled_mechanisms =
            ["SCRAM-SHA-256".to_owned()].into_iter().collect();
        let mechanism = choose_mechanism(
            &offered(&["PLAIN", "SCRAM-SHA-256"]),
            &config,
            &ChannelBinding::None,
        )
        .unwrap();
        assert_eq!(mechanism.name(), "PLAIN");
    }

    #[test]
    fn preferred_mechanism_wins_over_strength() {
        let mut config = config_with("bar");
        config.sasl_preferred_mechanism = Some("PLAIN".to_owned());
        let mechanism = choose_mechanism(
            &offered(&["PLAIN", "SCRAM-SHA-512"]),
            &config,
            &ChannelBinding::None,
        )
        .unwrap();
        assert_eq!(mechanism.name(), "PLAIN");
    }

    #[test]
    fn credential_less_mechanisms_never_match() {
        let config = config_with("bar");
        // No Facebook tokens configured, so the only usable offer fails.
        let result = choose_mechanism(
            &offered(&["X-FACEBOOK-PLATFORM"]),
            &config,
            &ChannelBinding::None,
        );
        assert!(matches!(result, Err(AuthError::MechanismMismatch)));
    }

    #[test]
    fn provider_tokens_unlock_their_mechanisms() {
        let mut config = config_with("");
        config.google_access_token = Some("token".to_owned());
        let mechanism = choose_mechanism(
            &offered(&["X-OAUTH2", "PLAIN"]),
            &config,
            &ChannelBinding::None,
        )
        .unwrap();
        assert_eq!(mechanism.name(), "X-OAUTH2");
    }

    #[test]
    fn plus_variants_require_binding_material() {
        let config = config_with("bar");
        let mechanism = choose_mechanism(
            &offered(&["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]),
            &config,
            &ChannelBinding::None,
        )
        .unwrap();
        assert_eq!(mechanism.name(), "SCRAM-SHA-256");

        let mechanism = choose_mechanism(
            &offered(&["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]),
            &config,
            &ChannelBinding::TlsExporter(vec![1, 2, 3]),
        )
        .unwrap();
        assert_eq!(mechanism.name(), "SCRAM-SHA-256-PLUS");
    }

    #[test]
    fn fast_request_prefers_strong_hash_and_available_binding() {
        let offered = offered(&["HT-SHA-256-NONE", "HT-SHA3-512-NONE", "HT-SHA-256-EXPR"]);
        assert_eq!(
            choose_fast_mechanism(&offered, &ChannelBinding::None).as_deref(),
            Some("HT-SHA3-512-NONE"),
        );
        assert_eq!(
            choose_fast_mechanism(&offered, &ChannelBinding::TlsExporter(vec![1])).as_deref(),
            Some("HT-SHA-256-EXPR"),
        );
    }

    #[test]
    fn ht_names_parse_into_mechanisms() {
        let cb = ChannelBinding::None;
        let mechanism = build_ht_mechanism("HT-SHA3-512-NONE", "user", "secret", &cb).unwrap();
        assert_eq!(mechanism.name(), "HT-SHA3-512-NONE");
        assert!(build_ht_mechanism("HT-SHA3-512-EXPR", "user", "secret", &cb).is_none());
        assert!(build_ht_mechanism("HT-MD5-NONE", "user", "secret", &cb).is_none());
    }

    #[test]
    fn token_store_round_trips() {
        let store = TokenStore::new();
        assert!(store.current().is_none());
        store.store(FastToken {
            mechanism: "HT-SHA-256-NONE".to_owned(),
            secret: "s3cr3t".to_owned(),
            expiry: None,
        });
        assert_eq!(store.current().unwrap().secret, "s3cr3t");
        store.clear();
        assert!(store.current().is_none());
    }
}
