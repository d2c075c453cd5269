// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use rand::{thread_rng, Rng};

use veery_jid::Jid;

use crate::protocol::Stanza;
use crate::Error;

/// Generate a random id suitable for stanzas and nonces.
pub(crate) fn make_id() -> String {
    let id: u128 = thread_rng().gen();
    format!("{:032x}", id)
}

/// High-level event emitted by the [`Client`][`crate::Client`].
#[derive(Debug)]
pub enum Event {
    /// The session is established and stanzas can flow.
    Online {
        /// The server-assigned JID for this session.
        ///
        /// This may differ from the configured JID (most prominently in
        /// the resource), so use this one when addressing matters.
        bound_jid: Jid,

        /// Whether the previous session was resumed without loss of
        /// state. When false, all session state (presence,
        /// subscriptions, pending IQs) started over.
        resumed: bool,
    },

    /// The stream ended and will not reconnect on its own.
    Disconnected(Error),

    /// A stanza which neither the core nor any registered module
    /// claimed.
    Stanza(Stanza),
}

impl Event {
    /// `Online` event?
    pub fn is_online(&self) -> bool {
        matches!(self, Event::Online { .. })
    }

    /// Get the server-assigned JID for the `Online` event.
    pub fn get_jid(&self) -> Option<&Jid> {
        match self {
            Event::Online { bound_jid, .. } => Some(bound_jid),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, get its data.
    pub fn as_stanza(&self) -> Option<&Stanza> {
        match self {
            Event::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, unwrap into its data.
    pub fn into_stanza(self) -> Option<Stanza> {
        match self {
            Event::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }
}
