// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0199 ping payload.

use minidom::Element;

use crate::protocol::stanza::{Iq, IqType};
use crate::protocol::ns;

/// Build the `<ping/>` payload element.
pub fn ping_payload() -> Element {
    Element::builder("ping", ns::PING).build()
}

/// Whether the given IQ is a ping request.
pub fn is_ping(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(payload) => payload.is("ping", ns::PING),
        _ => false,
    }
}
