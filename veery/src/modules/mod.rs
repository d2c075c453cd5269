// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The extension module system.
//!
//! Everything above the session core (roster, receipts, MUC, pubsub,
//! and whatever the host application brings) hooks into the stream by
//! registering a [`Module`]. Inbound stanzas which neither stream
//! management nor the IQ tracker consumed are offered to each module in
//! registration order; the first module to claim a stanza ends the
//! chain.
//!
//! Modules never touch the socket. Outbound traffic goes through the
//! [`ModuleContext`], which feeds the same transmit queue as
//! [`Client::send_stanza`][`crate::Client::send_stanza`].

use veery_jid::Jid;

use crate::protocol::disco::{DiscoInfoQuery, DiscoInfoResult, Identity};
use crate::protocol::stanza::{Iq, IqType, Stanza};
use crate::protocol::stanza_error::{DefinedCondition, ErrorType, StanzaError};
use crate::protocol::ns;

mod ping;
mod receipts;

pub use ping::PingModule;
pub use receipts::{DeliveryLog, ReceiptsModule};

/// Context handed to modules while they handle a stanza.
///
/// Outbound stanzas queued here are flushed through the regular send
/// contract once the handler returns.
pub struct ModuleContext<'x> {
    bound_jid: Option<&'x Jid>,
    config: &'x crate::Config,
    outbound: Vec<Stanza>,
}

impl<'x> ModuleContext<'x> {
    pub(crate) fn new(bound_jid: Option<&'x Jid>, config: &'x crate::Config) -> Self {
        Self {
            bound_jid,
            config,
            outbound: Vec::new(),
        }
    }

    pub(crate) fn into_outbound(self) -> Vec<Stanza> {
        self.outbound
    }

    /// The JID this session is bound to, if the session is established.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid
    }

    /// Read-only access to the session configuration.
    pub fn config(&self) -> &crate::Config {
        self.config
    }

    /// Queue a stanza for sending.
    pub fn send_stanza<S: Into<Stanza>>(&mut self, stanza: S) {
        let mut stanza = stanza.into();
        stanza.ensure_id();
        self.outbound.push(stanza);
    }

    /// Queue an IQ result in response to `request`.
    pub fn reply_result(&mut self, request: &Iq, payload: Option<minidom::Element>) {
        self.outbound.push(Iq::result_of(request, payload).into());
    }

    /// Queue an IQ error in response to `request`.
    pub fn reply_error(&mut self, request: &Iq, error: StanzaError) {
        self.outbound.push(Iq::error_of(request, error).into());
    }
}

/// An extension module observing the stanza stream.
pub trait Module: Send {
    /// Offer an inbound stanza to this module.
    ///
    /// Return true to claim the stanza and stop the dispatch chain.
    fn handle_stanza(&mut self, ctx: &mut ModuleContext<'_>, stanza: &Stanza) -> bool;

    /// The service discovery features this module provides.
    fn discovery_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// The service discovery identities this module provides.
    fn identities(&self) -> Vec<Identity> {
        Vec::new()
    }
}

/// The ordered module registry with its dispatch logic.
///
/// Registration order is dispatch order. The bus itself answers
/// disco#info queries from the aggregated features and identities of
/// all modules, and replies with `service-unavailable` to IQ requests
/// nobody claims.
pub struct ExtensionBus {
    modules: Vec<Box<dyn Module>>,
}

/// Outcome of offering a stanza to the bus.
pub(crate) enum DispatchOutcome {
    /// A module claimed the stanza.
    Handled,

    /// Nobody claimed it; the stanza goes to the host application as a
    /// generic received event.
    Unhandled(Stanza),
}

impl ExtensionBus {
    pub(crate) fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// All features: the core's own plus every module's.
    pub(crate) fn discovery_features(&self) -> Vec<String> {
        let mut features = vec![ns::DISCO_INFO.to_owned()];
        for module in &self.modules {
            features.extend(module.discovery_features());
        }
        features.sort();
        features.dedup();
        features
    }

    pub(crate) fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<_> = self
            .modules
            .iter()
            .flat_map(|module| module.identities())
            .collect();
        if identities.is_empty() {
            identities.push(Identity::new("client", "bot"));
        }
        identities
    }

    pub(crate) fn dispatch(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        stanza: Stanza,
    ) -> DispatchOutcome {
        for module in &mut self.modules {
            if module.handle_stanza(ctx, &stanza) {
                return DispatchOutcome::Handled;
            }
        }

        // Unclaimed IQ requests must not go unanswered (RFC 6120
        // § 8.2.3); disco#info we can answer ourselves.
        if let Stanza::Iq(iq) = &stanza {
            match &iq.payload {
                IqType::Get(payload) if DiscoInfoQuery::matches(payload) => {
                    let node = payload.attr("node").map(str::to_owned);
                    ctx.reply_result(
                        iq,
                        Some(
                            crate::protocol::AsElement::as_element(&DiscoInfoResult {
                                node,
                                identities: self.identities(),
                                features: self.discovery_features(),
                            }),
                        ),
                    );
                    return DispatchOutcome::Handled;
                }
                IqType::Get(_) | IqType::Set(_) => {
                    ctx.reply_error(
                        iq,
                        StanzaError::new(
                            ErrorType::Cancel,
                            DefinedCondition::ServiceUnavailable,
                        ),
                    );
                    return DispatchOutcome::Handled;
                }
                _ => (),
            }
        }

        DispatchOutcome::Unhandled(stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;
    use crate::protocol::Message;

    fn test_config() -> crate::Config {
        crate::Config::new(Jid::new("me@example.org").unwrap(), "pw")
    }

    struct ClaimBodies {
        seen: usize,
    }

    impl Module for ClaimBodies {
        fn handle_stanza(&mut self, _ctx: &mut ModuleContext<'_>, stanza: &Stanza) -> bool {
            match stanza {
                Stanza::Message(message) => {
                    if message.body().is_some() {
                        self.seen += 1;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        }

        fn discovery_features(&self) -> Vec<String> {
            vec!["urn:example:bodies".to_owned()]
        }
    }

    struct CountAll {
        seen: usize,
    }

    impl Module for CountAll {
        fn handle_stanza(&mut self, _ctx: &mut ModuleContext<'_>, _stanza: &Stanza) -> bool {
            self.seen += 1;
            false
        }
    }

    fn message_with_body() -> Stanza {
        Message::chat(Jid::new("a@example.org").unwrap(), "hi").into()
    }

    #[test]
    fn first_claiming_module_stops_the_chain() {
        let mut bus = ExtensionBus::new();
        bus.register(Box::new(ClaimBodies { seen: 0 }));
        bus.register(Box::new(CountAll { seen: 0 }));

        let config = test_config();

        let mut ctx = ModuleContext::new(None, &config);
        assert!(matches!(
            bus.dispatch(&mut ctx, message_with_body()),
            DispatchOutcome::Handled
        ));
        // The second module must not have seen the claimed stanza.
        // (Boxed modules are opaque; re-dispatch an unclaimable stanza
        // and check it travelled the whole chain.)
        let presence = Stanza::Presence(crate::protocol::Presence::available());
        assert!(matches!(
            bus.dispatch(&mut ctx, presence),
            DispatchOutcome::Unhandled(_)
        ));
    }

    #[test]
    fn unclaimed_iq_requests_get_an_error_reply() {
        let mut bus = ExtensionBus::new();
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let iq = Iq::from_get("x1", Element::builder("query", "urn:example:unknown").build());
        let iq = Iq {
            from: Some(Jid::new("peer@example.org").unwrap()),
            ..iq
        };
        assert!(matches!(
            bus.dispatch(&mut ctx, iq.into()),
            DispatchOutcome::Handled
        ));
        let outbound = ctx.into_outbound();
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            Stanza::Iq(reply) => {
                assert_eq!(reply.id, "x1");
                assert_eq!(
                    reply.to.as_ref().unwrap().as_str(),
                    "peer@example.org"
                );
                match &reply.payload {
                    IqType::Error(error) => {
                        assert_eq!(error.defined_condition, DefinedCondition::ServiceUnavailable)
                    }
                    other => panic!("unexpected reply payload: {:?}", other),
                }
            }
            other => panic!("unexpected outbound stanza: {:?}", other),
        }
    }

    #[test]
    fn disco_info_is_answered_from_aggregated_features() {
        let mut bus = ExtensionBus::new();
        bus.register(Box::new(ClaimBodies { seen: 0 }));
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let iq = Iq {
            from: Some(Jid::new("peer@example.org").unwrap()),
            ..Iq::from_get(
                "d1",
                Element::builder("query", ns::DISCO_INFO).build(),
            )
        };
        assert!(matches!(
            bus.dispatch(&mut ctx, iq.into()),
            DispatchOutcome::Handled
        ));
        let outbound = ctx.into_outbound();
        match &outbound[0] {
            Stanza::Iq(reply) => match &reply.payload {
                IqType::Result(Some(payload)) => {
                    let result =
                        crate::protocol::FromElement::from_element(payload.clone());
                    let result: DiscoInfoResult = result.unwrap();
                    assert!(result.features.contains(&"urn:example:bodies".to_owned()));
                    assert!(result.features.contains(&ns::DISCO_INFO.to_owned()));
                }
                other => panic!("unexpected reply payload: {:?}", other),
            },
            other => panic!("unexpected outbound stanza: {:?}", other),
        }
    }

    #[test]
    fn unclaimed_messages_surface_to_the_application() {
        let mut bus = ExtensionBus::new();
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        assert!(matches!(
            bus.dispatch(&mut ctx, message_with_body()),
            DispatchOutcome::Unhandled(Stanza::Message(_))
        ));
    }
}
