// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Namespace constants used by the protocol core.

/// RFC 6120: client-to-server stanzas
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: stream-level elements
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: stream errors
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: stanza errors
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// RFC 6120: STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// XEP-0388: Extensible SASL Profile
pub const SASL2: &str = "urn:xmpp:sasl:2";

/// RFC 6120: resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// XEP-0386: Bind 2
pub const BIND2: &str = "urn:xmpp:bind:0";

/// XEP-0484: Fast Authentication Streamlining Tokens
pub const FAST: &str = "urn:xmpp:fast:0";

/// XEP-0198: Stream Management
pub const SM: &str = "urn:xmpp:sm:3";

/// XEP-0199: XMPP Ping
pub const PING: &str = "urn:xmpp:ping";

/// XEP-0352: Client State Indication
pub const CSI: &str = "urn:xmpp:csi:0";

/// XEP-0030: Service Discovery (info)
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// XEP-0030: Service Discovery (items)
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// XEP-0078: Non-SASL Authentication
pub const AUTH: &str = "jabber:iq:auth";

/// XEP-0184: Message Delivery Receipts
pub const RECEIPTS: &str = "urn:xmpp:receipts";
