// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service discovery (XEP-0030) info queries and results.

use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

/// An identity inside a disco#info result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The category, e.g. `client`.
    pub category: String,
    /// The type within the category, e.g. `pc`.
    pub type_: String,
    /// The human-readable name, if any.
    pub name: Option<String>,
}

impl Identity {
    /// Create an identity.
    pub fn new<C, T>(category: C, type_: T) -> Identity
    where
        C: Into<String>,
        T: Into<String>,
    {
        Identity {
            category: category.into(),
            type_: type_.into(),
            name: None,
        }
    }

    /// Attach a human-readable name.
    pub fn with_name<N: Into<String>>(mut self, name: N) -> Identity {
        self.name = Some(name.into());
        self
    }
}

/// A disco#info query payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfoQuery {
    /// The queried node, if any.
    pub node: Option<String>,
}

impl DiscoInfoQuery {
    /// Whether the given IQ payload is a disco#info query.
    pub fn matches(payload: &Element) -> bool {
        payload.is("query", ns::DISCO_INFO)
    }
}

impl FromElement for DiscoInfoQuery {
    fn from_element(element: Element) -> Result<DiscoInfoQuery, ParseError> {
        if !element.is("query", ns::DISCO_INFO) {
            return Err(ParseError("not a disco#info query"));
        }
        Ok(DiscoInfoQuery {
            node: element.attr("node").map(str::to_owned),
        })
    }
}

impl AsElement for DiscoInfoQuery {
    fn as_element(&self) -> Element {
        Element::builder("query", ns::DISCO_INFO)
            .attr("node", self.node.as_deref())
            .build()
    }
}

/// A disco#info result payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfoResult {
    /// The queried node, if any.
    pub node: Option<String>,
    /// The responder's identities.
    pub identities: Vec<Identity>,
    /// The responder's feature strings.
    pub features: Vec<String>,
}

impl FromElement for DiscoInfoResult {
    fn from_element(element: Element) -> Result<DiscoInfoResult, ParseError> {
        if !element.is("query", ns::DISCO_INFO) {
            return Err(ParseError("not a disco#info result"));
        }
        let mut result = DiscoInfoResult {
            node: element.attr("node").map(str::to_owned),
            ..DiscoInfoResult::default()
        };
        for child in element.children() {
            match child.name() {
                "identity" => result.identities.push(Identity {
                    category: child.attr("category").unwrap_or_default().to_owned(),
                    type_: child.attr("type").unwrap_or_default().to_owned(),
                    name: child.attr("name").map(str::to_owned),
                }),
                "feature" => {
                    if let Some(var) = child.attr("var") {
                        result.features.push(var.to_owned());
                    }
                }
                _ => (),
            }
        }
        Ok(result)
    }
}

impl AsElement for DiscoInfoResult {
    fn as_element(&self) -> Element {
        let mut builder =
            Element::builder("query", ns::DISCO_INFO).attr("node", self.node.as_deref());
        for identity in &self.identities {
            builder = builder.append(
                Element::builder("identity", ns::DISCO_INFO)
                    .attr("category", identity.category.as_str())
                    .attr("type", identity.type_.as_str())
                    .attr("name", identity.name.as_deref())
                    .build(),
            );
        }
        for feature in &self.features {
            builder = builder.append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature.as_str())
                    .build(),
            );
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trip() {
        let result = DiscoInfoResult {
            node: None,
            identities: vec![Identity::new("client", "pc").with_name("veery")],
            features: vec![ns::DISCO_INFO.to_owned(), ns::PING.to_owned()],
        };
        let parsed = DiscoInfoResult::from_element(result.as_element()).unwrap();
        assert_eq!(parsed, result);
    }
}
