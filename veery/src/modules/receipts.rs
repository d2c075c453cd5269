// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0184: message delivery receipts.

use std::sync::{Arc, Mutex};

use minidom::Element;

use crate::modules::{Module, ModuleContext};
use crate::protocol::stanza::{Message, MessageType, Stanza};
use crate::protocol::ns;

/// Ids of sent messages whose delivery receipts have arrived.
///
/// Shared between the registered [`ReceiptsModule`] and the host
/// application.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<Vec<String>>>,
}

impl DeliveryLog {
    /// Take all ids recorded since the last call.
    pub fn take(&self) -> Vec<String> {
        core::mem::take(&mut *self.inner.lock().unwrap())
    }

    fn push(&self, id: String) {
        self.inner.lock().unwrap().push(id);
    }
}

/// Emits receipts for messages which request them and records receipts
/// for messages this client sent.
#[derive(Default)]
pub struct ReceiptsModule {
    delivered: DeliveryLog,
}

impl ReceiptsModule {
    /// Create the module.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto the log of delivered message ids; keep it around
    /// before registering the module.
    pub fn delivery_log(&self) -> DeliveryLog {
        self.delivered.clone()
    }

    /// Stamp a receipt request onto an outbound message.
    pub fn request_receipt(message: &mut Message) {
        if message.payload("request", ns::RECEIPTS).is_none() {
            message
                .payloads
                .push(Element::builder("request", ns::RECEIPTS).build());
        }
    }
}

impl Module for ReceiptsModule {
    fn handle_stanza(&mut self, ctx: &mut ModuleContext<'_>, stanza: &Stanza) -> bool {
        let Stanza::Message(message) = stanza else {
            return false;
        };

        // A receipt for something we sent earlier.
        if let Some(received) = message.payload("received", ns::RECEIPTS) {
            if let Some(id) = received.attr("id") {
                self.delivered.push(id.to_owned());
            }
            return true;
        }

        // A request for a receipt from us. Error messages never get
        // receipts, and messages without ids cannot be referenced.
        if message.payload("request", ns::RECEIPTS).is_some()
            && message.type_ != MessageType::Error
        {
            if let (Some(id), Some(from)) = (message.id.as_ref(), message.from.as_ref()) {
                let mut receipt = Message::new(Some(from.clone()));
                receipt.type_ = message.type_;
                receipt.payloads.push(
                    Element::builder("received", ns::RECEIPTS)
                        .attr("id", id.as_str())
                        .build(),
                );
                ctx.send_stanza(receipt);
            }
            // The message itself still carries content for the
            // application; only the receipt bookkeeping is ours.
            return false;
        }

        false
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::RECEIPTS.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veery_jid::Jid;

    fn test_config() -> crate::Config {
        crate::Config::new(Jid::new("me@example.org").unwrap(), "pw")
    }

    fn peer() -> Jid {
        Jid::new("alice@example.org/home").unwrap()
    }

    #[test]
    fn receipt_requests_are_answered() {
        let mut module = ReceiptsModule::new();
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let mut message = Message::chat(Jid::new("me@example.org").unwrap(), "hi");
        message.from = Some(peer());
        message.id = Some("m-77".to_owned());
        ReceiptsModule::request_receipt(&mut message);

        // Not claimed: the body still belongs to the application.
        assert!(!module.handle_stanza(&mut ctx, &message.into()));

        let outbound = ctx.into_outbound();
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            Stanza::Message(receipt) => {
                assert_eq!(receipt.to.as_ref().unwrap(), &peer());
                assert_eq!(
                    receipt
                        .payload("received", ns::RECEIPTS)
                        .unwrap()
                        .attr("id"),
                    Some("m-77")
                );
            }
            other => panic!("unexpected outbound stanza: {:?}", other),
        }
    }

    #[test]
    fn incoming_receipts_are_recorded_exactly_once() {
        let mut module = ReceiptsModule::new();
        let log = module.delivery_log();
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let mut receipt = Message::new(None);
        receipt.from = Some(peer());
        receipt.payloads.push(
            Element::builder("received", ns::RECEIPTS)
                .attr("id", "m-42")
                .build(),
        );

        assert!(module.handle_stanza(&mut ctx, &receipt.into()));
        assert_eq!(log.take(), ["m-42"]);
        assert!(log.take().is_empty());
        assert!(ctx.into_outbound().is_empty());
    }

    #[test]
    fn unreferencable_requests_are_ignored() {
        let mut module = ReceiptsModule::new();
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        // No id: no receipt can be generated.
        let mut message = Message::new(None);
        message.from = Some(peer());
        ReceiptsModule::request_receipt(&mut message);
        assert!(!module.handle_stanza(&mut ctx, &message.into()));
        assert!(ctx.into_outbound().is_empty());
    }
}
