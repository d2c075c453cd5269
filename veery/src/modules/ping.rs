// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0199: answer inbound pings.

use crate::modules::{Module, ModuleContext};
use crate::protocol::ping;
use crate::protocol::stanza::Stanza;
use crate::protocol::ns;

/// Replies to `urn:xmpp:ping` IQ requests.
///
/// Outbound keep-alive pings are not this module's business; the stream
/// worker emits those on its own when the connection goes quiet.
#[derive(Default)]
pub struct PingModule;

impl Module for PingModule {
    fn handle_stanza(&mut self, ctx: &mut ModuleContext<'_>, stanza: &Stanza) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        if !ping::is_ping(iq) {
            return false;
        }
        ctx.reply_result(iq, None);
        true
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::PING.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stanza::{Iq, IqType};
    use veery_jid::Jid;

    fn test_config() -> crate::Config {
        crate::Config::new(Jid::new("me@example.org").unwrap(), "pw")
    }

    #[test]
    fn pings_are_answered() {
        let mut module = PingModule;
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let iq = Iq {
            from: Some(Jid::new("example.org").unwrap()),
            ..Iq::from_get("p1", ping::ping_payload())
        };
        assert!(module.handle_stanza(&mut ctx, &iq.into()));
        let outbound = ctx.into_outbound();
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            Stanza::Iq(reply) => {
                assert_eq!(reply.id, "p1");
                assert!(matches!(reply.payload, IqType::Result(None)));
            }
            other => panic!("unexpected outbound stanza: {:?}", other),
        }
    }

    #[test]
    fn other_iqs_pass() {
        let mut module = PingModule;
        let config = test_config();
        let mut ctx = ModuleContext::new(None, &config);
        let iq = Iq::from_get(
            "v1",
            minidom::Element::builder("query", "jabber:iq:version").build(),
        );
        assert!(!module.handle_stanza(&mut ctx, &iq.into()));
    }
}
