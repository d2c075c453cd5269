// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL-2 nonzas (XEP-0388), including the FAST (XEP-0484) and Bind 2
//! (XEP-0386) elements the core integrates inline.

use minidom::Element;

use veery_jid::Jid;

use crate::protocol::sasl::{decode_data, encode_data, DefinedCondition, Failure};
use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// The `<user-agent/>` element sent inside `<authenticate/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgent {
    /// A stable, unique identifier of this client installation.
    pub id: Option<String>,
    /// The software name.
    pub software: Option<String>,
    /// The user-facing device name.
    pub device: Option<String>,
}

impl UserAgent {
    fn as_element(&self) -> Element {
        let mut builder =
            Element::builder("user-agent", ns::SASL2).attr("id", self.id.as_deref());
        if let Some(software) = &self.software {
            builder = builder.append(
                Element::builder("software", ns::SASL2)
                    .append(software.as_str())
                    .build(),
            );
        }
        if let Some(device) = &self.device {
            builder = builder.append(
                Element::builder("device", ns::SASL2)
                    .append(device.as_str())
                    .build(),
            );
        }
        builder.build()
    }
}

/// A FAST token issued by the server (XEP-0484).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastToken {
    /// The token secret.
    pub secret: String,
    /// The expiry timestamp, verbatim.
    pub expiry: Option<String>,
}

/// An inline Bind 2 request (XEP-0386).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bind2Request {
    /// The human-readable tag from which the server derives the resource.
    pub tag: Option<String>,
}

/// Any SASL-2 nonza.
#[derive(Debug, Clone, PartialEq)]
pub enum Nonza {
    /// `<authenticate/>`, sent by the client.
    Authenticate {
        /// The chosen mechanism name.
        mechanism: String,
        /// The initial response, if the mechanism is client-first.
        initial_response: Option<Vec<u8>>,
        /// The user agent description.
        user_agent: Option<UserAgent>,
        /// An inline Bind 2 request.
        bind: Option<Bind2Request>,
        /// Marks authentication with a FAST token.
        fast: bool,
        /// Request a FAST token for the named mechanism.
        request_token: Option<String>,
    },

    /// `<challenge/>`, sent by the server.
    Challenge(Vec<u8>),

    /// `<response/>`, sent by the client.
    Response(Vec<u8>),

    /// `<success/>`.
    Success {
        /// Final mechanism data (e.g. the SCRAM server signature).
        additional_data: Option<Vec<u8>>,
        /// The negotiated identity, a full JID when Bind 2 ran inline.
        authorization_identifier: Option<Jid>,
        /// Whether resource binding completed inline.
        bound: bool,
        /// A freshly issued FAST token.
        token: Option<FastToken>,
    },

    /// `<failure/>`.
    Failure(Failure),

    /// `<continue/>`: the server requires additional tasks (e.g. 2FA).
    Continue {
        /// The task names.
        tasks: Vec<String>,
        /// Human-readable description, if any.
        text: Option<String>,
    },
}

impl FromElement for Nonza {
    fn from_element(element: Element) -> Result<Nonza, ParseError> {
        if element.ns() != ns::SASL2 {
            return Err(ParseError("not a SASL-2 element"));
        }
        Ok(match element.name() {
            "authenticate" => {
                let mechanism =
                    super::required_attr(&element, "mechanism", "authenticate without mechanism")?;
                let initial_response = match element.get_child("initial-response", ns::SASL2) {
                    Some(el) => Some(decode_data(el)?),
                    None => None,
                };
                let user_agent = element.get_child("user-agent", ns::SASL2).map(|el| {
                    UserAgent {
                        id: el.attr("id").map(str::to_owned),
                        software: el.get_child("software", ns::SASL2).map(|el| el.text()),
                        device: el.get_child("device", ns::SASL2).map(|el| el.text()),
                    }
                });
                let bind = element.get_child("bind", ns::BIND2).map(|el| Bind2Request {
                    tag: el.get_child("tag", ns::BIND2).map(|el| el.text()),
                });
                Nonza::Authenticate {
                    mechanism,
                    initial_response,
                    user_agent,
                    bind,
                    fast: element.has_child("fast", ns::FAST),
                    request_token: element
                        .get_child("request-token", ns::FAST)
                        .and_then(|el| el.attr("mechanism"))
                        .map(str::to_owned),
                }
            }
            "challenge" => Nonza::Challenge(decode_data(&element)?),
            "response" => Nonza::Response(decode_data(&element)?),
            "success" => {
                let additional_data = match element.get_child("additional-data", ns::SASL2) {
                    Some(el) => Some(decode_data(el)?),
                    None => None,
                };
                let authorization_identifier = match element
                    .get_child("authorization-identifier", ns::SASL2)
                {
                    Some(el) => Some(
                        Jid::new(el.text().trim())
                            .map_err(|_| ParseError("invalid authorization identifier"))?,
                    ),
                    None => None,
                };
                let token = element.get_child("token", ns::FAST).map(|el| FastToken {
                    secret: el.attr("secret").unwrap_or_default().to_owned(),
                    expiry: el.attr("expiry").map(str::to_owned),
                });
                Nonza::Success {
                    additional_data,
                    authorization_identifier,
                    bound: element.has_child("bound", ns::BIND2),
                    token,
                }
            }
            "failure" => Nonza::Failure(parse_sasl2_failure(&element)),
            "continue" => {
                let tasks = element
                    .get_child("tasks", ns::SASL2)
                    .map(|tasks| {
                        tasks
                            .children()
                            .filter(|el| el.is("task", ns::SASL2))
                            .map(|el| el.text())
                            .collect()
                    })
                    .unwrap_or_default();
                Nonza::Continue {
                    tasks,
                    text: element.get_child("text", ns::SASL2).map(|el| el.text()),
                }
            }
            _ => return Err(ParseError("unknown SASL-2 element")),
        })
    }
}

/// The failure conditions of SASL-2 live in the RFC 6120 SASL namespace;
/// the text element lives in the SASL-2 namespace.
fn parse_sasl2_failure(element: &Element) -> Failure {
    let mut condition = None;
    let mut text = None;
    for child in element.children() {
        if child.name() == "text" {
            text = Some(child.text());
        } else if condition.is_none() && child.ns() == ns::SASL {
            condition = DefinedCondition::from_element_name(child.name());
        }
    }
    Failure {
        condition: condition.unwrap_or(DefinedCondition::NotAuthorized),
        text,
    }
}

impl AsElement for Nonza {
    fn as_element(&self) -> Element {
        match self {
            Nonza::Authenticate {
                mechanism,
                initial_response,
                user_agent,
                bind,
                fast,
                request_token,
            } => {
                let mut builder = Element::builder("authenticate", ns::SASL2)
                    .attr("mechanism", mechanism.as_str());
                if let Some(data) = initial_response {
                    builder = builder.append(
                        Element::builder("initial-response", ns::SASL2)
                            .append(encode_data(data))
                            .build(),
                    );
                }
                if let Some(user_agent) = user_agent {
                    builder = builder.append(user_agent.as_element());
                }
                if let Some(bind) = bind {
                    let mut bind_builder = Element::builder("bind", ns::BIND2);
                    if let Some(tag) = &bind.tag {
                        bind_builder = bind_builder.append(
                            Element::builder("tag", ns::BIND2).append(tag.as_str()).build(),
                        );
                    }
                    builder = builder.append(bind_builder.build());
                }
                if let Some(mechanism) = request_token {
                    builder = builder.append(
                        Element::builder("request-token", ns::FAST)
                            .attr("mechanism", mechanism.as_str())
                            .build(),
                    );
                }
                if *fast {
                    builder = builder.append(Element::builder("fast", ns::FAST).build());
                }
                builder.build()
            }
            Nonza::Challenge(data) => Element::builder("challenge", ns::SASL2)
                .append(encode_data(data))
                .build(),
            Nonza::Response(data) => Element::builder("response", ns::SASL2)
                .append(encode_data(data))
                .build(),
            Nonza::Success {
                additional_data,
                authorization_identifier,
                bound,
                token,
            } => {
                let mut builder = Element::builder("success", ns::SASL2);
                if let Some(data) = additional_data {
                    builder = builder.append(
                        Element::builder("additional-data", ns::SASL2)
                            .append(encode_data(data))
                            .build(),
                    );
                }
                if let Some(jid) = authorization_identifier {
                    builder = builder.append(
                        Element::builder("authorization-identifier", ns::SASL2)
                            .append(jid.as_str())
                            .build(),
                    );
                }
                if *bound {
                    builder = builder.append(Element::builder("bound", ns::BIND2).build());
                }
                if let Some(token) = token {
                    builder = builder.append(
                        Element::builder("token", ns::FAST)
                            .attr("secret", token.secret.as_str())
                            .attr("expiry", token.expiry.as_deref())
                            .build(),
                    );
                }
                builder.build()
            }
            Nonza::Failure(failure) => {
                let mut builder = Element::builder("failure", ns::SASL2).append(
                    Element::builder(failure.condition.element_name(), ns::SASL).build(),
                );
                if let Some(text) = &failure.text {
                    builder = builder
                        .append(Element::builder("text", ns::SASL2).append(text.as_str()).build());
                }
                builder.build()
            }
            Nonza::Continue { tasks, text } => {
                let mut tasks_builder = Element::builder("tasks", ns::SASL2);
                for task in tasks {
                    tasks_builder = tasks_builder
                        .append(Element::builder("task", ns::SASL2).append(task.as_str()).build());
                }
                let mut builder =
                    Element::builder("continue", ns::SASL2).append(tasks_builder.build());
                if let Some(text) = text {
                    builder = builder
                        .append(Element::builder("text", ns::SASL2).append(text.as_str()).build());
                }
                builder.build()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_carries_fast_elements() {
        let nonza = Nonza::Authenticate {
            mechanism: "PLAIN".to_owned(),
            initial_response: Some(b"\0foo\0bar".to_vec()),
            user_agent: Some(UserAgent {
                id: Some("d4565fa7-4d72-4749-b3d3-740edbf87770".to_owned()),
                software: Some("veery".to_owned()),
                device: None,
            }),
            bind: None,
            fast: false,
            request_token: Some("HT-SHA3-512-NONE".to_owned()),
        };
        let element = nonza.as_element();
        assert_eq!(element.attr("mechanism"), Some("PLAIN"));
        assert_eq!(
            element
                .get_child("initial-response", ns::SASL2)
                .unwrap()
                .text(),
            "AGZvbwBiYXI="
        );
        assert_eq!(
            element
                .get_child("request-token", ns::FAST)
                .unwrap()
                .attr("mechanism"),
            Some("HT-SHA3-512-NONE")
        );
        assert!(!element.has_child("fast", ns::FAST));
    }

    #[test]
    fn success_parses_token_and_bound() {
        let element: Element = "<success xmlns='urn:xmpp:sasl:2'>\
            <authorization-identifier>foo@example.org/A</authorization-identifier>\
            <bound xmlns='urn:xmpp:bind:0'/>\
            <token xmlns='urn:xmpp:fast:0' secret='s3cr3tt0k3n' expiry='2024-07-11T14:00:00Z'/>\
          </success>"
            .parse()
            .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Success {
                authorization_identifier,
                bound,
                token,
                ..
            } => {
                assert_eq!(
                    authorization_identifier.unwrap().as_str(),
                    "foo@example.org/A"
                );
                assert!(bound);
                let token = token.unwrap();
                assert_eq!(token.secret, "s3cr3tt0k3n");
                assert_eq!(token.expiry.as_deref(), Some("2024-07-11T14:00:00Z"));
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }

    #[test]
    fn continue_surfaces_tasks() {
        let element: Element = "<continue xmlns='urn:xmpp:sasl:2'>\
            <tasks><task>two-factor</task></tasks>\
            <text>second factor needed</text>\
          </continue>"
            .parse()
            .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Continue { tasks, text } => {
                assert_eq!(tasks, ["two-factor"]);
                assert_eq!(text.as_deref(), Some("second factor needed"));
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }

    #[test]
    fn failure_condition_is_in_sasl_namespace() {
        let element: Element = "<failure xmlns='urn:xmpp:sasl:2'>\
            <credentials-expired xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>\
          </failure>"
            .parse()
            .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Failure(failure) => {
                assert_eq!(failure.condition, DefinedCondition::CredentialsExpired)
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }
}
