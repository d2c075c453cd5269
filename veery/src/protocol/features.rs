// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `<stream:features/>` parsing.

use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// The STARTTLS feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartTls {
    /// Whether the server requires TLS before anything else.
    pub required: bool,
}

/// The SASL-2 `<authentication/>` feature (XEP-0388), including the
/// inline features the core cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sasl2Authentication {
    /// The offered mechanisms.
    pub mechanisms: Vec<String>,
    /// Whether Bind 2 can be performed inline.
    pub bind2: bool,
    /// The HT-* mechanisms usable with a FAST token, if FAST is offered.
    pub fast_mechanisms: Vec<String>,
}

/// The parsed features of the current stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// STARTTLS offering, if any.
    pub starttls: Option<StartTls>,
    /// SASL (RFC 6120 profile) mechanisms.
    pub sasl_mechanisms: Vec<String>,
    /// SASL-2 (XEP-0388) authentication offering, if any.
    pub sasl2: Option<Sasl2Authentication>,
    /// Whether resource binding is offered.
    pub bind: bool,
    /// Whether stream management (XEP-0198) is offered.
    pub stream_management: bool,
    /// Whether client state indication (XEP-0352) is offered.
    pub client_state_indication: bool,
    /// Whether legacy non-SASL authentication (XEP-0078) is advertised.
    pub non_sasl_auth: bool,
}

impl StreamFeatures {
    /// Can TLS be started on this stream?
    pub fn can_starttls(&self) -> bool {
        self.starttls.is_some()
    }

    /// Does the server require TLS?
    pub fn tls_required(&self) -> bool {
        self.starttls.as_ref().map(|tls| tls.required).unwrap_or(false)
    }

    /// Can a resource be bound on this stream?
    pub fn can_bind(&self) -> bool {
        self.bind
    }
}

impl FromElement for StreamFeatures {
    fn from_element(element: Element) -> Result<StreamFeatures, ParseError> {
        if !element.is("features", ns::STREAM) {
            return Err(ParseError("not a stream features element"));
        }

        let mut features = StreamFeatures::default();

        for child in element.children() {
            match (child.name(), child.ns().as_str()) {
                ("starttls", ns::TLS) => {
                    features.starttls = Some(StartTls {
                        required: child.has_child("required", ns::TLS),
                    });
                }
                ("mechanisms", ns::SASL) => {
                    features.sasl_mechanisms = child
                        .children()
                        .filter(|el| el.is("mechanism", ns::SASL))
                        .map(|el| el.text())
                        .collect();
                }
                ("authentication", ns::SASL2) => {
                    let mut sasl2 = Sasl2Authentication {
                        mechanisms: child
                            .children()
                            .filter(|el| el.is("mechanism", ns::SASL2))
                            .map(|el| el.text())
                            .collect(),
                        ..Sasl2Authentication::default()
                    };
                    if let Some(inline) = child.get_child("inline", ns::SASL2) {
                        sasl2.bind2 = inline.has_child("bind", ns::BIND2);
                        if let Some(fast) = inline.get_child("fast", ns::FAST) {
                            sasl2.fast_mechanisms = fast
                                .children()
                                .filter(|el| el.is("mechanism", ns::FAST))
                                .map(|el| el.text())
                                .collect();
                        }
                    }
                    features.sasl2 = Some(sasl2);
                }
                ("bind", ns::BIND) => features.bind = true,
                ("sm", ns::SM) => features.stream_management = true,
                ("csi", ns::CSI) => features.client_state_indication = true,
                ("auth", "http://jabber.org/features/iq-auth") => features.non_sasl_auth = true,
                _ => (),
            }
        }

        Ok(features)
    }
}

impl AsElement for StreamFeatures {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("features", ns::STREAM);
        if let Some(starttls) = &self.starttls {
            let mut tls = Element::builder("starttls", ns::TLS);
            if starttls.required {
                tls = tls.append(Element::builder("required", ns::TLS).build());
            }
            builder = builder.append(tls.build());
        }
        if !self.sasl_mechanisms.is_empty() {
            let mut mechanisms = Element::builder("mechanisms", ns::SASL);
            for mechanism in &self.sasl_mechanisms {
                mechanisms = mechanisms.append(
                    Element::builder("mechanism", ns::SASL)
                        .append(mechanism.as_str())
                        .build(),
                );
            }
            builder = builder.append(mechanisms.build());
        }
        if let Some(sasl2) = &self.sasl2 {
            let mut authentication = Element::builder("authentication", ns::SASL2);
            for mechanism in &sasl2.mechanisms {
                authentication = authentication.append(
                    Element::builder("mechanism", ns::SASL2)
                        .append(mechanism.as_str())
                        .build(),
                );
            }
            if sasl2.bind2 || !sasl2.fast_mechanisms.is_empty() {
                let mut inline = Element::builder("inline", ns::SASL2);
                if sasl2.bind2 {
                    inline = inline.append(Element::builder("bind", ns::BIND2).build());
                }
                if !sasl2.fast_mechanisms.is_empty() {
                    let mut fast = Element::builder("fast", ns::FAST);
                    for mechanism in &sasl2.fast_mechanisms {
                        fast = fast.append(
                            Element::builder("mechanism", ns::FAST)
                                .append(mechanism.as_str())
                                .build(),
                        );
                    }
                    inline = inline.append(fast.build());
                }
                authentication = authentication.append(inline.build());
            }
            builder = builder.append(authentication.build());
        }
        if self.bind {
            builder = builder.append(Element::builder("bind", ns::BIND).build());
        }
        if self.stream_management {
            builder = builder.append(Element::builder("sm", ns::SM).build());
        }
        if self.client_state_indication {
            builder = builder.append(Element::builder("csi", ns::CSI).build());
        }
        if self.non_sasl_auth {
            builder = builder
                .append(Element::builder("auth", "http://jabber.org/features/iq-auth").build());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_classic_features() {
        let element: Element = "<features xmlns='http://etherx.jabber.org/streams'>\
            <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
            <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
              <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
            </mechanisms>\
            <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
            <sm xmlns='urn:xmpp:sm:3'/>\
          </features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::from_element(element).unwrap();
        assert!(features.tls_required());
        assert_eq!(features.sasl_mechanisms, ["SCRAM-SHA-1", "PLAIN"]);
        assert!(features.can_bind());
        assert!(features.stream_management);
        assert!(features.sasl2.is_none());
    }

    #[test]
    fn parses_sasl2_with_inline_features() {
        let element: Element = "<features xmlns='http://etherx.jabber.org/streams'>\
            <authentication xmlns='urn:xmpp:sasl:2'>\
              <mechanism>SCRAM-SHA-256</mechanism>\
              <inline>\
                <bind xmlns='urn:xmpp:bind:0'/>\
                <fast xmlns='urn:xmpp:fast:0'><mechanism>HT-SHA-256-NONE</mechanism></fast>\
              </inline>\
            </authentication>\
          </features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::from_element(element).unwrap();
        let sasl2 = features.sasl2.unwrap();
        assert_eq!(sasl2.mechanisms, ["SCRAM-SHA-256"]);
        assert!(sasl2.bind2);
        assert_eq!(sasl2.fast_mechanisms, ["HT-SHA-256-NONE"]);
    }
}
