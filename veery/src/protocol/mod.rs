// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed views of the XML elements the protocol core speaks.
//!
//! Every type here is a thin, hand-written binding over
//! [`minidom::Element`]: parsing never interprets payload children beyond
//! what the core protocol requires, so extension payloads reach their
//! handlers as raw element trees.

use core::fmt;

use minidom::Element;

pub mod bind;
pub mod csi;
pub mod disco;
pub mod features;
pub mod ns;
pub mod ping;
pub mod sasl;
pub mod sasl2;
pub mod sm;
pub mod stanza;
pub mod stanza_error;
pub mod starttls;
pub mod stream_error;

pub use self::features::StreamFeatures;
pub use self::stanza::{Iq, IqType, Message, MessageType, Presence, PresenceType, Stanza};
pub use self::stanza_error::{ErrorType, StanzaError};
pub use self::stream_error::StreamError;

/// An error produced when an element does not match the type it was
/// parsed into.
///
/// Parse errors are recoverable at the stream level: the offending
/// element has been consumed in its entirety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub &'static str);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ParseError {}

/// Parse a type out of an XML element.
pub trait FromElement: Sized {
    /// Parse the given element.
    fn from_element(element: Element) -> Result<Self, ParseError>;
}

/// Serialize a type into an XML element.
pub trait AsElement {
    /// Build the element representation.
    fn as_element(&self) -> Element;
}

impl FromElement for Element {
    fn from_element(element: Element) -> Result<Element, ParseError> {
        Ok(element)
    }
}

impl AsElement for Element {
    fn as_element(&self) -> Element {
        self.clone()
    }
}

/// Any top-level element which may appear on a client-to-server stream.
#[derive(Debug)]
pub enum XmppStreamElement {
    /// A message, presence or iq stanza.
    Stanza(Stanza),

    /// `<stream:features/>`
    StreamFeatures(StreamFeatures),

    /// `<stream:error/>`
    StreamError(StreamError),

    /// A SASL nonza (RFC 6120 profile).
    Sasl(sasl::Nonza),

    /// A SASL-2 nonza (XEP-0388 profile).
    Sasl2(sasl2::Nonza),

    /// A STARTTLS nonza.
    Starttls(starttls::Nonza),

    /// A stream management nonza.
    Sm(sm::Nonza),

    /// A client state indication nonza (outbound only).
    Csi(csi::ClientState),
}

impl XmppStreamElement {
    /// Whether this element is a stanza (and therefore subject to stream
    /// management counting).
    pub fn is_stanza(&self) -> bool {
        matches!(self, XmppStreamElement::Stanza(_))
    }
}

impl FromElement for XmppStreamElement {
    fn from_element(element: Element) -> Result<XmppStreamElement, ParseError> {
        let ns = element.ns();
        Ok(match ns.as_str() {
            ns::JABBER_CLIENT => XmppStreamElement::Stanza(Stanza::from_element(element)?),
            ns::STREAM => match element.name() {
                "features" => {
                    XmppStreamElement::StreamFeatures(StreamFeatures::from_element(element)?)
                }
                "error" => XmppStreamElement::StreamError(StreamError::from_element(element)?),
                _ => return Err(ParseError("unknown stream-level element")),
            },
            ns::SASL => XmppStreamElement::Sasl(sasl::Nonza::from_element(element)?),
            ns::SASL2 => XmppStreamElement::Sasl2(sasl2::Nonza::from_element(element)?),
            ns::TLS => XmppStreamElement::Starttls(starttls::Nonza::from_element(element)?),
            ns::SM => XmppStreamElement::Sm(sm::Nonza::from_element(element)?),
            _ => return Err(ParseError("element in unsupported namespace")),
        })
    }
}

impl AsElement for XmppStreamElement {
    fn as_element(&self) -> Element {
        match self {
            XmppStreamElement::Stanza(v) => v.as_element(),
            XmppStreamElement::StreamFeatures(v) => v.as_element(),
            XmppStreamElement::StreamError(v) => v.as_element(),
            XmppStreamElement::Sasl(v) => v.as_element(),
            XmppStreamElement::Sasl2(v) => v.as_element(),
            XmppStreamElement::Starttls(v) => v.as_element(),
            XmppStreamElement::Sm(v) => v.as_element(),
            XmppStreamElement::Csi(v) => v.as_element(),
        }
    }
}

impl From<Stanza> for XmppStreamElement {
    fn from(other: Stanza) -> XmppStreamElement {
        XmppStreamElement::Stanza(other)
    }
}

impl From<sm::Nonza> for XmppStreamElement {
    fn from(other: sm::Nonza) -> XmppStreamElement {
        XmppStreamElement::Sm(other)
    }
}

pub(crate) fn required_attr(
    element: &Element,
    name: &'static str,
    missing: &'static str,
) -> Result<String, ParseError> {
    element
        .attr(name)
        .map(str::to_owned)
        .ok_or(ParseError(missing))
}
