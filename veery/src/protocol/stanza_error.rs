// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza-level errors (RFC 6120 § 8.3).

use core::fmt;

use minidom::Element;

use veery_jid::Jid;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// The `type` attribute of a stanza error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry; the error cannot be remedied.
    Cancel,
    /// Proceed; the condition was only a warning.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting.
    Wait,
}

impl ErrorType {
    fn from_attr(attr: &str) -> Result<ErrorType, ParseError> {
        Ok(match attr {
            "auth" => ErrorType::Auth,
            "cancel" => ErrorType::Cancel,
            "continue" => ErrorType::Continue,
            "modify" => ErrorType::Modify,
            "wait" => ErrorType::Wait,
            _ => return Err(ParseError("invalid stanza error type")),
        })
    }

    fn attr(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

macro_rules! defined_conditions {
    ($($(#[$meta:meta])* $variant:ident => $name:literal,)+) => {
        /// The defined conditions of RFC 6120 § 8.3.3.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum DefinedCondition {
            $($(#[$meta])* $variant,)+
        }

        impl DefinedCondition {
            fn element_name(self) -> &'static str {
                match self {
                    $(DefinedCondition::$variant => $name,)+
                }
            }

            fn from_element_name(name: &str) -> Option<DefinedCondition> {
                match name {
                    $($name => Some(DefinedCondition::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

defined_conditions! {
    /// The sender has sent a stanza containing XML that does not conform
    /// to the appropriate schema or cannot be processed.
    BadRequest => "bad-request",
    /// Access cannot be granted because an existing resource exists with
    /// the same name or address.
    Conflict => "conflict",
    /// The feature represented in the XML stanza is not implemented by the
    /// intended recipient or server.
    FeatureNotImplemented => "feature-not-implemented",
    /// The requesting entity does not possess the necessary permissions.
    Forbidden => "forbidden",
    /// The recipient or server can no longer be contacted at this address.
    Gone => "gone",
    /// The server has experienced a misconfiguration or other internal
    /// error.
    InternalServerError => "internal-server-error",
    /// The addressed JID or item requested cannot be found.
    ItemNotFound => "item-not-found",
    /// The sending entity has provided an XMPP address or aspect thereof
    /// that violates the rules of RFC 7622.
    JidMalformed => "jid-malformed",
    /// The recipient or server understands the request but cannot process
    /// it because it does not meet criteria defined by the recipient or
    /// server.
    NotAcceptable => "not-acceptable",
    /// The recipient or server does not allow any entity to perform the
    /// action.
    NotAllowed => "not-allowed",
    /// The sender needs to provide credentials before being allowed to
    /// perform the action.
    NotAuthorized => "not-authorized",
    /// The entity has violated some service policy.
    PolicyViolation => "policy-violation",
    /// The intended recipient is temporarily unavailable.
    RecipientUnavailable => "recipient-unavailable",
    /// The recipient or server is redirecting requests for this
    /// information to another entity.
    Redirect => "redirect",
    /// The requesting entity is not authorized to access the requested
    /// service because prior registration is required.
    RegistrationRequired => "registration-required",
    /// A remote server or service specified as part or all of the JID of
    /// the intended recipient does not exist.
    RemoteServerNotFound => "remote-server-not-found",
    /// A remote server could not be contacted within a reasonable amount
    /// of time.
    RemoteServerTimeout => "remote-server-timeout",
    /// The server or recipient lacks the system resources necessary to
    /// service the request.
    ResourceConstraint => "resource-constraint",
    /// The server or recipient does not currently provide the requested
    /// service.
    ServiceUnavailable => "service-unavailable",
    /// The requesting entity is not authorized to access the requested
    /// service because a subscription is required.
    SubscriptionRequired => "subscription-required",
    /// The error condition is not one of those defined by the other
    /// conditions; the error element carries an application-specific
    /// condition.
    UndefinedCondition => "undefined-condition",
    /// The recipient or server understood the request but was not
    /// expecting it at this time.
    UnexpectedRequest => "unexpected-request",
}

/// A stanza-level `<error/>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// The error type.
    pub type_: ErrorType,
    /// The entity which generated the error, if stamped.
    pub by: Option<Jid>,
    /// The defined condition.
    pub defined_condition: DefinedCondition,
    /// Human-readable description, if any.
    pub text: Option<String>,
    /// An application-specific condition element, if any.
    pub other: Option<Element>,
}

impl StanzaError {
    /// Create an error with just a type and a defined condition.
    pub fn new(type_: ErrorType, defined_condition: DefinedCondition) -> StanzaError {
        StanzaError {
            type_,
            by: None,
            defined_condition,
            text: None,
            other: None,
        }
    }

    /// Attach a human-readable text.
    pub fn with_text<T: Into<String>>(mut self, text: T) -> StanzaError {
        self.text = Some(text.into());
        self
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.defined_condition.element_name(),
            self.type_.attr()
        )?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

impl FromElement for StanzaError {
    fn from_element(element: Element) -> Result<StanzaError, ParseError> {
        if element.name() != "error" {
            return Err(ParseError("not an error element"));
        }
        let type_ = ErrorType::from_attr(
            element
                .attr("type")
                .ok_or(ParseError("stanza error without type"))?,
        )?;
        let by = match element.attr("by") {
            None => None,
            Some(v) => Some(Jid::new(v).map_err(|_| ParseError("invalid by attribute"))?),
        };

        let mut defined_condition = None;
        let mut text = None;
        let mut other = None;
        for child in element.children() {
            if child.ns() == ns::XMPP_STANZAS {
                if child.name() == "text" {
                    text = Some(child.text());
                    continue;
                }
                if let Some(condition) = DefinedCondition::from_element_name(child.name()) {
                    defined_condition = Some(condition);
                    continue;
                }
            }
            if other.is_none() {
                other = Some(child.clone());
            }
        }

        Ok(StanzaError {
            type_,
            by,
            // RFC 6120 § 8.3.2 requires a defined condition; tolerate
            // legacy errors without one.
            defined_condition: defined_condition.unwrap_or(DefinedCondition::UndefinedCondition),
            text,
            other,
        })
    }
}

impl AsElement for StanzaError {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.type_.attr())
            .attr("by", self.by.as_ref().map(Jid::as_str))
            .append(
                Element::builder(self.defined_condition.element_name(), ns::XMPP_STANZAS).build(),
            );
        if let Some(text) = &self.text {
            builder = builder
                .append(Element::builder("text", ns::XMPP_STANZAS).append(text.as_str()).build());
        }
        if let Some(other) = &self.other {
            builder = builder.append(other.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_condition_and_text() {
        let element: Element = "<error xmlns='jabber:client' type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone</text></error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(element).unwrap();
        assert_eq!(error.type_, ErrorType::Cancel);
        assert_eq!(error.defined_condition, DefinedCondition::ItemNotFound);
        assert_eq!(error.text.as_deref(), Some("gone"));
    }

    #[test]
    fn keeps_application_specific_condition() {
        let element: Element = "<error xmlns='jabber:client' type='wait'><resource-constraint xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><over-quota xmlns='urn:example:errors'/></error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(element).unwrap();
        assert!(error.other.unwrap().is("over-quota", "urn:example:errors"));
    }
}
