// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level errors (RFC 6120 § 4.9).

use core::fmt;

use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

macro_rules! defined_conditions {
    ($($(#[$meta:meta])* $variant:ident => $name:literal,)+) => {
        /// The defined stream error conditions of RFC 6120 § 4.9.3.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum DefinedCondition {
            $($(#[$meta])* $variant,)+

            /// The server is redirecting the client to another host; the
            /// payload is the `host[:port]` text of the condition element.
            SeeOtherHost(String),
        }

        impl DefinedCondition {
            /// The element name of this condition.
            pub fn element_name(&self) -> &'static str {
                match self {
                    $(DefinedCondition::$variant => $name,)+
                    DefinedCondition::SeeOtherHost(_) => "see-other-host",
                }
            }

            fn parse(child: &Element) -> Option<DefinedCondition> {
                match child.name() {
                    $($name => Some(DefinedCondition::$variant),)+
                    "see-other-host" => Some(DefinedCondition::SeeOtherHost(child.text())),
                    _ => None,
                }
            }
        }
    };
}

defined_conditions! {
    /// The entity has sent XML that cannot be processed.
    BadFormat => "bad-format",
    /// The entity has sent a namespace prefix that is unsupported.
    BadNamespacePrefix => "bad-namespace-prefix",
    /// The server is closing the stream because a new stream conflicts
    /// with this one, or a resource conflict occurred.
    Conflict => "conflict",
    /// One party is closing the stream due to inactivity.
    ConnectionTimeout => "connection-timeout",
    /// The hostname is no longer serviced by the server.
    HostGone => "host-gone",
    /// The hostname is unknown to the server.
    HostUnknown => "host-unknown",
    /// A stanza between two servers lacks a valid address.
    ImproperAddressing => "improper-addressing",
    /// The server has experienced a misconfiguration or other internal
    /// error.
    InternalServerError => "internal-server-error",
    /// The `from` address does not match an authorized JID.
    InvalidFrom => "invalid-from",
    /// The namespace is invalid.
    InvalidNamespace => "invalid-namespace",
    /// The entity has sent invalid XML.
    InvalidXml => "invalid-xml",
    /// The entity has attempted to send data before authenticating.
    NotAuthorized => "not-authorized",
    /// The entity has sent XML that is not well-formed.
    NotWellFormed => "not-well-formed",
    /// The entity has violated some local service policy.
    PolicyViolation => "policy-violation",
    /// A remote server needed to fulfill a request could not be reached.
    RemoteConnectionFailed => "remote-connection-failed",
    /// The server is undergoing a reset and the stream must be closed.
    Reset => "reset",
    /// The server lacks the resources to service the stream.
    ResourceConstraint => "resource-constraint",
    /// The entity has attempted to send restricted XML features such as
    /// comments, PIs or DTD subsets.
    RestrictedXml => "restricted-xml",
    /// The server is being shut down.
    SystemShutdown => "system-shutdown",
    /// The condition is not one of those defined here.
    UndefinedCondition => "undefined-condition",
    /// The entity has sent an encoding that is not supported.
    UnsupportedEncoding => "unsupported-encoding",
    /// The entity has sent a first-level child the server does not
    /// understand.
    UnsupportedStanzaType => "unsupported-stanza-type",
    /// The entity has requested an unsupported stream version.
    UnsupportedVersion => "unsupported-version",
}

/// A `<stream:error/>` received from (or to be sent to) the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,
    /// Human-readable description, if any.
    pub text: Option<String>,
}

impl StreamError {
    /// Create an error carrying only a condition.
    pub fn new(condition: DefinedCondition) -> StreamError {
        StreamError {
            condition,
            text: None,
        }
    }

    /// Create an error with a condition and text.
    pub fn with_text<T: Into<String>>(condition: DefinedCondition, text: T) -> StreamError {
        StreamError {
            condition,
            text: Some(text.into()),
        }
    }

    /// The `see-other-host` redirect target, if this error is one.
    pub fn redirect(&self) -> Option<(String, u16)> {
        match &self.condition {
            DefinedCondition::SeeOtherHost(address) => {
                let (host, port) = parse_host_address(address)?;
                Some((host, port.unwrap_or(5222)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream error: {}", self.condition.element_name())?;
        if let Some(text) = &self.text {
            write!(f, " ({})", text)?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamError {}

impl FromElement for StreamError {
    fn from_element(element: Element) -> Result<StreamError, ParseError> {
        if !element.is("error", ns::STREAM) {
            return Err(ParseError("not a stream error"));
        }
        let mut condition = None;
        let mut text = None;
        for child in element.children() {
            if child.ns() != ns::XMPP_STREAMS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else if condition.is_none() {
                condition = DefinedCondition::parse(child);
            }
        }
        Ok(StreamError {
            condition: condition.unwrap_or(DefinedCondition::UndefinedCondition),
            text,
        })
    }
}

impl AsElement for StreamError {
    fn as_element(&self) -> Element {
        let condition = match &self.condition {
            DefinedCondition::SeeOtherHost(host) => {
                Element::builder("see-other-host", ns::XMPP_STREAMS)
                    .append(host.as_str())
                    .build()
            }
            other => Element::builder(other.element_name(), ns::XMPP_STREAMS).build(),
        };
        let mut builder = Element::builder("error", ns::STREAM).append(condition);
        if let Some(text) = &self.text {
            builder = builder
                .append(Element::builder("text", ns::XMPP_STREAMS).append(text.as_str()).build());
        }
        builder.build()
    }
}

/// Split a `host[:port]` string, with IPv6 literals in brackets.
///
/// Returns `None` when the host part is empty.
pub fn parse_host_address(address: &str) -> Option<(String, Option<u16>)> {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        // [2001:db8::1]:5222
        let (host, rest) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None => None,
        };
        return Some((host.to_owned(), port));
    }
    // More than one colon without brackets: a bare IPv6 address.
    if address.matches(':').count() > 1 {
        return Some((address.to_owned(), None));
    }
    match address.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_owned(), port.parse().ok())),
        Some(_) => None,
        None if address.is_empty() => None,
        None => Some((address.to_owned(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_condition() {
        let element: Element = "<error xmlns='http://etherx.jabber.org/streams' xmlns:stream='http://etherx.jabber.org/streams'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></error>"
            .parse()
            .unwrap();
        let error = StreamError::from_element(element).unwrap();
        assert_eq!(error.condition, DefinedCondition::Conflict);
    }

    #[test]
    fn see_other_host_redirect() {
        let element: Element = "<error xmlns='http://etherx.jabber.org/streams'><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>other.example:5299</see-other-host></error>"
            .parse()
            .unwrap();
        let error = StreamError::from_element(element).unwrap();
        assert_eq!(error.redirect(), Some(("other.example".to_owned(), 5299)));
    }

    #[test]
    fn host_address_forms() {
        assert_eq!(
            parse_host_address("x.example"),
            Some(("x.example".to_owned(), None))
        );
        assert_eq!(
            parse_host_address("x.example:5223"),
            Some(("x.example".to_owned(), Some(5223)))
        );
        assert_eq!(
            parse_host_address("[2001:db8::1]:443"),
            Some(("2001:db8::1".to_owned(), Some(443)))
        );
        assert_eq!(
            parse_host_address("2001:db8::1"),
            Some(("2001:db8::1".to_owned(), None))
        );
        assert_eq!(parse_host_address(""), None);
    }
}
