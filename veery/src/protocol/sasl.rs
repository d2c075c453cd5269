// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL nonzas of the RFC 6120 profile.

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// Decode the base64 text content of a SASL element. A single `=`
/// denotes an empty payload.
pub(crate) fn decode_data(element: &Element) -> Result<Vec<u8>, ParseError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Base64
        .decode(text)
        .map_err(|_| ParseError("invalid base64 in SASL element"))
}

/// Encode a SASL payload; empty data is sent as `=` per RFC 6120 § 6.4.2.
pub(crate) fn encode_data(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_owned()
    } else {
        Base64.encode(data)
    }
}

macro_rules! sasl_conditions {
    ($($(#[$meta:meta])* $variant:ident => $name:literal,)+) => {
        /// The SASL error conditions of RFC 6120 § 6.5.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum DefinedCondition {
            $($(#[$meta])* $variant,)+
        }

        impl DefinedCondition {
            /// The element name of this condition.
            pub fn element_name(self) -> &'static str {
                match self {
                    $(DefinedCondition::$variant => $name,)+
                }
            }

            pub(crate) fn from_element_name(name: &str) -> Option<DefinedCondition> {
                match name {
                    $($name => Some(DefinedCondition::$variant),)+
                    // RFC 3920 used "not-authorized"; some broken servers
                    // still send "bad-auth".
                    "bad-auth" => Some(DefinedCondition::NotAuthorized),
                    _ => None,
                }
            }
        }
    };
}

sasl_conditions! {
    /// The client aborted the exchange.
    Aborted => "aborted",
    /// The account is disabled.
    AccountDisabled => "account-disabled",
    /// The credentials have expired.
    CredentialsExpired => "credentials-expired",
    /// The mechanism is only available on encrypted streams.
    EncryptionRequired => "encryption-required",
    /// The data was not encoded correctly.
    IncorrectEncoding => "incorrect-encoding",
    /// The authzid was invalid.
    InvalidAuthzid => "invalid-authzid",
    /// The requested mechanism is not supported.
    InvalidMechanism => "invalid-mechanism",
    /// The request was malformed.
    MalformedRequest => "malformed-request",
    /// The mechanism is too weak for this account.
    MechanismTooWeak => "mechanism-too-weak",
    /// The credentials were wrong.
    NotAuthorized => "not-authorized",
    /// Authentication failed temporarily.
    TemporaryAuthFailure => "temporary-auth-failure",
}

/// A SASL failure element.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// The failure condition.
    pub condition: DefinedCondition,
    /// Human-readable description, if any.
    pub text: Option<String>,
}

fn parse_failure(element: &Element, namespace: &str) -> Failure {
    let mut condition = None;
    let mut text = None;
    for child in element.children() {
        if child.ns() != namespace {
            continue;
        }
        if child.name() == "text" {
            text = Some(child.text());
        } else if condition.is_none() {
            condition = DefinedCondition::from_element_name(child.name());
        }
    }
    Failure {
        condition: condition.unwrap_or(DefinedCondition::NotAuthorized),
        text,
    }
}

impl Failure {
    pub(crate) fn from_sasl_element(
        element: &Element,
        namespace: &str,
    ) -> Result<Failure, ParseError> {
        Ok(parse_failure(element, namespace))
    }
}

/// Any SASL nonza of the RFC 6120 profile.
#[derive(Debug, Clone, PartialEq)]
pub enum Nonza {
    /// `<auth/>`, sent by the client to start authentication.
    Auth {
        /// The chosen mechanism name.
        mechanism: String,
        /// The initial response.
        data: Vec<u8>,
    },

    /// `<challenge/>`, sent by the server.
    Challenge(Vec<u8>),

    /// `<response/>`, sent by the client.
    Response(Vec<u8>),

    /// `<success/>`, possibly carrying additional data.
    Success(Vec<u8>),

    /// `<failure/>`.
    Failure(Failure),

    /// `<abort/>`, sent by the client.
    Abort,
}

impl FromElement for Nonza {
    fn from_element(element: Element) -> Result<Nonza, ParseError> {
        if element.ns() != ns::SASL {
            return Err(ParseError("not a SASL element"));
        }
        Ok(match element.name() {
            "auth" => Nonza::Auth {
                mechanism: super::required_attr(&element, "mechanism", "auth without mechanism")?,
                data: decode_data(&element)?,
            },
            "challenge" => Nonza::Challenge(decode_data(&element)?),
            "response" => Nonza::Response(decode_data(&element)?),
            "success" => Nonza::Success(decode_data(&element)?),
            "failure" => Nonza::Failure(Failure::from_sasl_element(&element, ns::SASL)?),
            "abort" => Nonza::Abort,
            _ => return Err(ParseError("unknown SASL element")),
        })
    }
}

impl AsElement for Nonza {
    fn as_element(&self) -> Element {
        match self {
            Nonza::Auth { mechanism, data } => Element::builder("auth", ns::SASL)
                .attr("mechanism", mechanism.as_str())
                .append(encode_data(data))
                .build(),
            Nonza::Challenge(data) => Element::builder("challenge", ns::SASL)
                .append(encode_data(data))
                .build(),
            Nonza::Response(data) => Element::builder("response", ns::SASL)
                .append(encode_data(data))
                .build(),
            Nonza::Success(data) => {
                let builder = Element::builder("success", ns::SASL);
                if data.is_empty() {
                    builder.build()
                } else {
                    builder.append(encode_data(data)).build()
                }
            }
            Nonza::Failure(failure) => {
                let mut builder = Element::builder("failure", ns::SASL).append(
                    Element::builder(failure.condition.element_name(), ns::SASL).build(),
                );
                if let Some(text) = &failure.text {
                    builder = builder
                        .append(Element::builder("text", ns::SASL).append(text.as_str()).build());
                }
                builder.build()
            }
            Nonza::Abort => Element::builder("abort", ns::SASL).build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_encodes_plain_credentials() {
        let nonza = Nonza::Auth {
            mechanism: "PLAIN".to_owned(),
            data: b"\0foo\0bar".to_vec(),
        };
        let element = nonza.as_element();
        assert_eq!(element.attr("mechanism"), Some("PLAIN"));
        assert_eq!(element.text(), "AGZvbwBiYXI=");
    }

    #[test]
    fn empty_data_round_trips_as_equals_sign() {
        let nonza = Nonza::Auth {
            mechanism: "ANONYMOUS".to_owned(),
            data: Vec::new(),
        };
        let element = nonza.as_element();
        assert_eq!(element.text(), "=");
        match Nonza::from_element(element).unwrap() {
            Nonza::Auth { data, .. } => assert!(data.is_empty()),
            other => panic!("wrong nonza: {:?}", other),
        }
    }

    #[test]
    fn failure_condition_parses() {
        let element: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><account-disabled/><text>call support</text></failure>"
            .parse()
            .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Failure(failure) => {
                assert_eq!(failure.condition, DefinedCondition::AccountDisabled);
                assert_eq!(failure.text.as_deref(), Some("call support"));
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }

    #[test]
    fn bad_auth_is_remapped() {
        let element: Element =
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><bad-auth/></failure>"
                .parse()
                .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Failure(failure) => {
                assert_eq!(failure.condition, DefinedCondition::NotAuthorized)
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }
}
