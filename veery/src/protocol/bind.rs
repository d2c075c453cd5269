// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Classic resource binding (RFC 6120 § 7).

use minidom::Element;

use veery_jid::FullJid;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// The payload of the bind request IQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindQuery {
    /// The requested resource; the server picks one when absent.
    pub resource: Option<String>,
}

impl BindQuery {
    /// Create a bind request for the given resource.
    pub fn new(resource: Option<String>) -> BindQuery {
        BindQuery { resource }
    }
}

impl AsElement for BindQuery {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("bind", ns::BIND);
        if let Some(resource) = &self.resource {
            builder = builder.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.as_str())
                    .build(),
            );
        }
        builder.build()
    }
}

/// The payload of the bind result IQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    /// The full JID the stream is now bound to.
    pub jid: FullJid,
}

impl FromElement for BindResponse {
    fn from_element(element: Element) -> Result<BindResponse, ParseError> {
        if !element.is("bind", ns::BIND) {
            return Err(ParseError("not a bind element"));
        }
        let jid = element
            .get_child("jid", ns::BIND)
            .ok_or(ParseError("bind response without jid"))?
            .text();
        let jid = FullJid::new(jid.trim()).map_err(|_| ParseError("bind response with invalid jid"))?;
        Ok(BindResponse { jid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_full_jid() {
        let element: Element =
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>foo@example.org/Host</jid></bind>"
                .parse()
                .unwrap();
        let response = BindResponse::from_element(element).unwrap();
        assert_eq!(response.jid.as_str(), "foo@example.org/Host");
    }

    #[test]
    fn response_without_resource_is_rejected() {
        let element: Element =
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>foo@example.org</jid></bind>"
                .parse()
                .unwrap();
        assert!(BindResponse::from_element(element).is_err());
    }
}
