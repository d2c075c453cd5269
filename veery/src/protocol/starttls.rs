// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! STARTTLS nonzas (RFC 6120 § 5).

use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// Any STARTTLS nonza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonza {
    /// `<starttls/>`, sent by the client.
    Request,
    /// `<proceed/>`: the TLS handshake may start.
    Proceed,
    /// `<failure/>`: the negotiation failed, the stream is void.
    Failure,
}

impl FromElement for Nonza {
    fn from_element(element: Element) -> Result<Nonza, ParseError> {
        if element.ns() != ns::TLS {
            return Err(ParseError("not a starttls element"));
        }
        Ok(match element.name() {
            "starttls" => Nonza::Request,
            "proceed" => Nonza::Proceed,
            "failure" => Nonza::Failure,
            _ => return Err(ParseError("unknown starttls element")),
        })
    }
}

impl AsElement for Nonza {
    fn as_element(&self) -> Element {
        let name = match self {
            Nonza::Request => "starttls",
            Nonza::Proceed => "proceed",
            Nonza::Failure => "failure",
        };
        Element::builder(name, ns::TLS).build()
    }
}
