// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The three stanza kinds of RFC 6120/6121.

use minidom::Element;

use veery_jid::Jid;

use crate::protocol::stanza_error::StanzaError;
use crate::protocol::{ns, AsElement, FromElement, ParseError};

fn parse_jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, ParseError> {
    match element.attr(name) {
        None => Ok(None),
        Some(v) => Jid::new(v)
            .map(Some)
            .map_err(|_| ParseError("invalid JID in stanza attribute")),
    }
}

fn lang_attr(element: &Element) -> Option<String> {
    element.attr("xml:lang").map(str::to_owned)
}

/// A `<message/>` stanza.
#[derive(Debug, Clone)]
pub struct Message {
    /// The sender address.
    pub from: Option<Jid>,
    /// The recipient address.
    pub to: Option<Jid>,
    /// The stanza identifier.
    pub id: Option<String>,
    /// The message type.
    pub type_: MessageType,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// All child elements, uninterpreted.
    pub payloads: Vec<Element>,
}

/// The `type` attribute of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// One-to-one chat message.
    Chat,
    /// An error in response to a previous message.
    Error,
    /// Group chat message.
    Groupchat,
    /// Subscription-style message.
    Headline,
    /// The default, untyped message.
    #[default]
    Normal,
}

impl MessageType {
    fn from_attr(attr: Option<&str>) -> Result<MessageType, ParseError> {
        Ok(match attr {
            Some("chat") => MessageType::Chat,
            Some("error") => MessageType::Error,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("normal") | None => MessageType::Normal,
            Some(_) => return Err(ParseError("invalid message type")),
        })
    }

    fn attr(self) -> Option<&'static str> {
        match self {
            MessageType::Chat => Some("chat"),
            MessageType::Error => Some("error"),
            MessageType::Groupchat => Some("groupchat"),
            MessageType::Headline => Some("headline"),
            MessageType::Normal => None,
        }
    }
}

impl Message {
    /// Create an empty message addressed to `to`.
    pub fn new(to: Option<Jid>) -> Message {
        Message {
            from: None,
            to,
            id: None,
            type_: MessageType::Normal,
            lang: None,
            payloads: Vec::new(),
        }
    }

    /// Create a chat message with a `<body/>` payload.
    pub fn chat<B: AsRef<str>>(to: Jid, body: B) -> Message {
        let body = Element::builder("body", ns::JABBER_CLIENT)
            .append(body.as_ref())
            .build();
        Message {
            from: None,
            to: Some(to),
            id: None,
            type_: MessageType::Chat,
            lang: None,
            payloads: vec![body],
        }
    }

    /// The first payload matching (name, namespace), if any.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find(|el| el.is(name, namespace))
    }

    /// The text of the `<body/>` payload, if any.
    pub fn body(&self) -> Option<String> {
        self.payload("body", ns::JABBER_CLIENT).map(|el| el.text())
    }
}

impl FromElement for Message {
    fn from_element(element: Element) -> Result<Message, ParseError> {
        if !element.is("message", ns::JABBER_CLIENT) {
            return Err(ParseError("not a message element"));
        }
        Ok(Message {
            from: parse_jid_attr(&element, "from")?,
            to: parse_jid_attr(&element, "to")?,
            id: element.attr("id").map(str::to_owned),
            type_: MessageType::from_attr(element.attr("type"))?,
            lang: lang_attr(&element),
            payloads: element.children().cloned().collect(),
        })
    }
}

impl AsElement for Message {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("message", ns::JABBER_CLIENT)
            .attr("from", self.from.as_ref().map(Jid::as_str))
            .attr("to", self.to.as_ref().map(Jid::as_str))
            .attr("id", self.id.as_deref())
            .attr("type", self.type_.attr())
            .attr("xml:lang", self.lang.as_deref());
        for payload in &self.payloads {
            builder = builder.append(payload.clone());
        }
        builder.build()
    }
}

/// A `<presence/>` stanza.
#[derive(Debug, Clone)]
pub struct Presence {
    /// The sender address.
    pub from: Option<Jid>,
    /// The recipient address.
    pub to: Option<Jid>,
    /// The stanza identifier.
    pub id: Option<String>,
    /// The presence type.
    pub type_: PresenceType,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// All child elements, uninterpreted.
    pub payloads: Vec<Element>,
}

/// The `type` attribute of a presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    /// The default: the sender is available.
    #[default]
    Available,
    /// An error in response to a previous presence.
    Error,
    /// A request for the recipient's presence.
    Probe,
    /// The sender wants to subscribe to the recipient's presence.
    Subscribe,
    /// The sender allowed the recipient to receive its presence.
    Subscribed,
    /// The sender is no longer available.
    Unavailable,
    /// The sender is unsubscribing from the recipient's presence.
    Unsubscribe,
    /// The subscription has been denied or cancelled.
    Unsubscribed,
}

impl PresenceType {
    fn from_attr(attr: Option<&str>) -> Result<PresenceType, ParseError> {
        Ok(match attr {
            None => PresenceType::Available,
            Some("error") => PresenceType::Error,
            Some("probe") => PresenceType::Probe,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unavailable") => PresenceType::Unavailable,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some(_) => return Err(ParseError("invalid presence type")),
        })
    }

    fn attr(self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Error => Some("error"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
        }
    }
}

impl Presence {
    /// Create an available presence without payloads.
    pub fn available() -> Presence {
        Presence {
            from: None,
            to: None,
            id: None,
            type_: PresenceType::Available,
            lang: None,
            payloads: Vec::new(),
        }
    }

    /// Create a presence of the given type.
    pub fn new(type_: PresenceType) -> Presence {
        Presence {
            from: None,
            to: None,
            id: None,
            type_,
            lang: None,
            payloads: Vec::new(),
        }
    }
}

impl FromElement for Presence {
    fn from_element(element: Element) -> Result<Presence, ParseError> {
        if !element.is("presence", ns::JABBER_CLIENT) {
            return Err(ParseError("not a presence element"));
        }
        Ok(Presence {
            from: parse_jid_attr(&element, "from")?,
            to: parse_jid_attr(&element, "to")?,
            id: element.attr("id").map(str::to_owned),
            type_: PresenceType::from_attr(element.attr("type"))?,
            lang: lang_attr(&element),
            payloads: element.children().cloned().collect(),
        })
    }
}

impl AsElement for Presence {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("from", self.from.as_ref().map(Jid::as_str))
            .attr("to", self.to.as_ref().map(Jid::as_str))
            .attr("id", self.id.as_deref())
            .attr("type", self.type_.attr())
            .attr("xml:lang", self.lang.as_deref());
        for payload in &self.payloads {
            builder = builder.append(payload.clone());
        }
        builder.build()
    }
}

/// An `<iq/>` stanza.
#[derive(Debug, Clone)]
pub struct Iq {
    /// The sender address.
    pub from: Option<Jid>,
    /// The recipient address.
    pub to: Option<Jid>,
    /// The stanza identifier. Mandatory for IQs.
    pub id: String,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// The type together with the typed payload.
    pub payload: IqType,
}

/// The type and payload of an IQ stanza.
#[derive(Debug, Clone)]
pub enum IqType {
    /// A `get` request.
    Get(Element),
    /// A `set` request.
    Set(Element),
    /// A `result` response, possibly empty.
    Result(Option<Element>),
    /// An `error` response.
    Error(StanzaError),
}

impl IqType {
    fn attr(&self) -> &'static str {
        match self {
            IqType::Get(_) => "get",
            IqType::Set(_) => "set",
            IqType::Result(_) => "result",
            IqType::Error(_) => "error",
        }
    }

    /// Whether this is a request (`get` or `set`).
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get(_) | IqType::Set(_))
    }
}

impl Iq {
    /// Create a `get` request.
    pub fn from_get<I: Into<String>>(id: I, payload: Element) -> Iq {
        Iq {
            from: None,
            to: None,
            id: id.into(),
            lang: None,
            payload: IqType::Get(payload),
        }
    }

    /// Create a `set` request.
    pub fn from_set<I: Into<String>>(id: I, payload: Element) -> Iq {
        Iq {
            from: None,
            to: None,
            id: id.into(),
            lang: None,
            payload: IqType::Set(payload),
        }
    }

    /// Create a `result` response to the given request.
    pub fn result_of(request: &Iq, payload: Option<Element>) -> Iq {
        Iq {
            from: None,
            to: request.from.clone(),
            id: request.id.clone(),
            lang: None,
            payload: IqType::Result(payload),
        }
    }

    /// Create an `error` response to the given request.
    pub fn error_of(request: &Iq, error: StanzaError) -> Iq {
        Iq {
            from: None,
            to: request.from.clone(),
            id: request.id.clone(),
            lang: None,
            payload: IqType::Error(error),
        }
    }

    /// Set the recipient.
    pub fn with_to(mut self, to: Jid) -> Iq {
        self.to = Some(to);
        self
    }

    /// The request payload, when this is a `get` or `set`.
    pub fn request_payload(&self) -> Option<&Element> {
        match &self.payload {
            IqType::Get(el) | IqType::Set(el) => Some(el),
            _ => None,
        }
    }
}

impl FromElement for Iq {
    fn from_element(element: Element) -> Result<Iq, ParseError> {
        if !element.is("iq", ns::JABBER_CLIENT) {
            return Err(ParseError("not an iq element"));
        }
        let id = super::required_attr(&element, "id", "iq without id")?;
        let type_ = super::required_attr(&element, "type", "iq without type")?;

        let mut error = None;
        let mut payload = None;
        for child in element.children() {
            if child.is("error", ns::JABBER_CLIENT) {
                error = Some(StanzaError::from_element(child.clone())?);
            } else if payload.is_none() {
                payload = Some(child.clone());
            }
        }

        let payload = match type_.as_str() {
            "get" => IqType::Get(payload.ok_or(ParseError("iq get without payload"))?),
            "set" => IqType::Set(payload.ok_or(ParseError("iq set without payload"))?),
            "result" => IqType::Result(payload),
            "error" => IqType::Error(error.ok_or(ParseError("iq error without error element"))?),
            _ => return Err(ParseError("invalid iq type")),
        };

        Ok(Iq {
            from: parse_jid_attr(&element, "from")?,
            to: parse_jid_attr(&element, "to")?,
            id,
            lang: lang_attr(&element),
            payload,
        })
    }
}

impl AsElement for Iq {
    fn as_element(&self) -> Element {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("from", self.from.as_ref().map(Jid::as_str))
            .attr("to", self.to.as_ref().map(Jid::as_str))
            .attr("id", self.id.as_str())
            .attr("type", self.payload.attr())
            .attr("xml:lang", self.lang.as_deref());
        match &self.payload {
            IqType::Get(el) | IqType::Set(el) => builder = builder.append(el.clone()),
            IqType::Result(Some(el)) => builder = builder.append(el.clone()),
            IqType::Result(None) => (),
            IqType::Error(error) => builder = builder.append(error.as_element()),
        }
        builder.build()
    }
}

/// A stanza sent or received over the stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),

    /// Message stanza
    Message(Message),

    /// Presence stanza
    Presence(Presence),
}

impl Stanza {
    /// Assign a random ID to the stanza, if no ID has been assigned yet.
    pub fn ensure_id(&mut self) -> &str {
        match self {
            Stanza::Iq(iq) => {
                if iq.id.is_empty() {
                    iq.id = crate::event::make_id();
                }
                &iq.id
            }
            Stanza::Message(message) => message.id.get_or_insert_with(crate::event::make_id),
            Stanza::Presence(presence) => presence.id.get_or_insert_with(crate::event::make_id),
        }
    }

    /// The sender address.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.from.as_ref(),
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
        }
    }

    /// The recipient address.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.to.as_ref(),
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
        }
    }
}

impl FromElement for Stanza {
    fn from_element(element: Element) -> Result<Stanza, ParseError> {
        match element.name() {
            "message" => Ok(Stanza::Message(Message::from_element(element)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(element)?)),
            "iq" => Ok(Stanza::Iq(Iq::from_element(element)?)),
            _ => Err(ParseError("unknown stanza kind")),
        }
    }
}

impl AsElement for Stanza {
    fn as_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => iq.as_element(),
            Stanza::Message(message) => message.as_element(),
            Stanza::Presence(presence) => presence.as_element(),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Stanza {
        Stanza::Iq(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Stanza {
        Stanza::Message(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Stanza {
        Stanza::Presence(other)
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Message, Stanza> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Presence, Stanza> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Iq, Stanza> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let element: Element =
            "<message xmlns='jabber:client' from='a@x.example' to='b@x.example' type='chat' id='m1'><body>hi</body></message>"
                .parse()
                .unwrap();
        let message = Message::from_element(element.clone()).unwrap();
        assert_eq!(message.type_, MessageType::Chat);
        assert_eq!(message.body().unwrap(), "hi");
        assert_eq!(message.as_element(), element);
    }

    #[test]
    fn iq_types_carry_payloads() {
        let element: Element =
            "<iq xmlns='jabber:client' type='get' id='42'><ping xmlns='urn:xmpp:ping'/></iq>"
                .parse()
                .unwrap();
        let iq = Iq::from_element(element).unwrap();
        match &iq.payload {
            IqType::Get(el) => assert!(el.is("ping", "urn:xmpp:ping")),
            other => panic!("wrong payload: {:?}", other),
        }

        let element: Element = "<iq xmlns='jabber:client' type='result' id='42'/>"
            .parse()
            .unwrap();
        let iq = Iq::from_element(element).unwrap();
        assert!(matches!(iq.payload, IqType::Result(None)));
    }

    #[test]
    fn iq_without_id_is_rejected() {
        let element: Element = "<iq xmlns='jabber:client' type='get'><x xmlns='y'/></iq>"
            .parse()
            .unwrap();
        assert!(Iq::from_element(element).is_err());
    }

    #[test]
    fn iq_error_response_parses_error_child() {
        let element: Element = "<iq xmlns='jabber:client' type='error' id='1'><query xmlns='jabber:iq:version'/><error type='cancel'><feature-not-implemented xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
            .parse()
            .unwrap();
        let iq = Iq::from_element(element).unwrap();
        match iq.payload {
            IqType::Error(error) => {
                assert_eq!(error.type_, crate::protocol::ErrorType::Cancel);
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn ensure_id_only_fills_gaps() {
        let mut stanza: Stanza = Message::new(None).into();
        let id = stanza.ensure_id().to_owned();
        assert!(!id.is_empty());
        assert_eq!(stanza.ensure_id(), id);
    }
}
