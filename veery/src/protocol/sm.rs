// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream management nonzas (XEP-0198).

use minidom::Element;

use crate::protocol::{ns, AsElement, FromElement, ParseError};

fn parse_h(element: &Element) -> Result<u32, ParseError> {
    element
        .attr("h")
        .ok_or(ParseError("sm element without h"))?
        .parse()
        .map_err(|_| ParseError("invalid h value"))
}

fn parse_bool(attr: Option<&str>) -> bool {
    matches!(attr, Some("true") | Some("1"))
}

/// `<enable/>`, sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enable {
    /// Request a resumable session.
    pub resume: bool,
    /// The maximum resumption time the client prefers, in seconds.
    pub max: Option<u32>,
}

/// `<enabled/>`, the server's answer to `<enable/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enabled {
    /// The stream identifier to resume with.
    pub id: Option<String>,
    /// Whether the session can be resumed.
    pub resume: bool,
    /// The maximum resumption time the server allows, in seconds.
    pub max: Option<u32>,
    /// The server's preferred reconnection address.
    pub location: Option<String>,
}

/// `<resume/>`, sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    /// The last handled inbound stanza count.
    pub h: u32,
    /// The stream identifier from `<enabled/>`.
    pub previd: String,
}

/// `<resumed/>`, the server's answer to `<resume/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    /// The server's count of handled stanzas.
    pub h: u32,
    /// The stream identifier.
    pub previd: String,
}

/// `<failed/>`, the negative answer to `<enable/>` or `<resume/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failed {
    /// The server's count of handled stanzas, when it reports one.
    pub h: Option<u32>,
}

/// Any stream management nonza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nonza {
    /// `<enable/>`
    Enable(Enable),
    /// `<enabled/>`
    Enabled(Enabled),
    /// `<resume/>`
    Resume(Resume),
    /// `<resumed/>`
    Resumed(Resumed),
    /// `<failed/>`
    Failed(Failed),
    /// `<a/>`: an acknowledgement carrying the handled count.
    Ack(u32),
    /// `<r/>`: a request for an acknowledgement.
    Req,
}

impl FromElement for Nonza {
    fn from_element(element: Element) -> Result<Nonza, ParseError> {
        if element.ns() != ns::SM {
            return Err(ParseError("not a stream management element"));
        }
        Ok(match element.name() {
            "enable" => Nonza::Enable(Enable {
                resume: parse_bool(element.attr("resume")),
                max: element.attr("max").and_then(|v| v.parse().ok()),
            }),
            "enabled" => Nonza::Enabled(Enabled {
                id: element.attr("id").map(str::to_owned),
                resume: parse_bool(element.attr("resume")),
                max: element.attr("max").and_then(|v| v.parse().ok()),
                location: element.attr("location").map(str::to_owned),
            }),
            "resume" => Nonza::Resume(Resume {
                h: parse_h(&element)?,
                previd: super::required_attr(&element, "previd", "resume without previd")?,
            }),
            "resumed" => Nonza::Resumed(Resumed {
                h: parse_h(&element)?,
                previd: super::required_attr(&element, "previd", "resumed without previd")?,
            }),
            "failed" => Nonza::Failed(Failed {
                h: element.attr("h").and_then(|v| v.parse().ok()),
            }),
            "a" => Nonza::Ack(parse_h(&element)?),
            "r" => Nonza::Req,
            _ => return Err(ParseError("unknown stream management element")),
        })
    }
}

impl AsElement for Nonza {
    fn as_element(&self) -> Element {
        match self {
            Nonza::Enable(enable) => Element::builder("enable", ns::SM)
                .attr("resume", enable.resume.then_some("true"))
                .attr("max", enable.max.map(|v| v.to_string()))
                .build(),
            Nonza::Enabled(enabled) => Element::builder("enabled", ns::SM)
                .attr("id", enabled.id.as_deref())
                .attr("resume", enabled.resume.then_some("true"))
                .attr("max", enabled.max.map(|v| v.to_string()))
                .attr("location", enabled.location.as_deref())
                .build(),
            Nonza::Resume(resume) => Element::builder("resume", ns::SM)
                .attr("h", resume.h.to_string())
                .attr("previd", resume.previd.as_str())
                .build(),
            Nonza::Resumed(resumed) => Element::builder("resumed", ns::SM)
                .attr("h", resumed.h.to_string())
                .attr("previd", resumed.previd.as_str())
                .build(),
            Nonza::Failed(failed) => Element::builder("failed", ns::SM)
                .attr("h", failed.h.map(|v| v.to_string()))
                .build(),
            Nonza::Ack(h) => Element::builder("a", ns::SM).attr("h", h.to_string()).build(),
            Nonza::Req => Element::builder("r", ns::SM).build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_round_trip() {
        let element: Element =
            "<enabled xmlns='urn:xmpp:sm:3' id='SM123' resume='true' location='alt.example:5222'/>"
                .parse()
                .unwrap();
        match Nonza::from_element(element).unwrap() {
            Nonza::Enabled(enabled) => {
                assert_eq!(enabled.id.as_deref(), Some("SM123"));
                assert!(enabled.resume);
                assert_eq!(enabled.location.as_deref(), Some("alt.example:5222"));
            }
            other => panic!("wrong nonza: {:?}", other),
        }
    }

    #[test]
    fn ack_and_req() {
        let element: Element = "<a xmlns='urn:xmpp:sm:3' h='7'/>".parse().unwrap();
        assert_eq!(Nonza::from_element(element).unwrap(), Nonza::Ack(7));

        let element: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        assert_eq!(Nonza::from_element(element).unwrap(), Nonza::Req);
    }

    #[test]
    fn resume_requires_previd() {
        let element: Element = "<resume xmlns='urn:xmpp:sm:3' h='3'/>".parse().unwrap();
        assert!(Nonza::from_element(element).is_err());
    }
}
