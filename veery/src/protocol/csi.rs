// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client state indication nonzas (XEP-0352).

use minidom::Element;

use crate::protocol::{ns, AsElement};

/// The client activity state signalled to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// The user is actively interacting with the client.
    Active,
    /// The client is in the background; the server may defer traffic.
    Inactive,
}

impl AsElement for ClientState {
    fn as_element(&self) -> Element {
        let name = match self {
            ClientState::Active => "active",
            ClientState::Inactive => "inactive",
        };
        Element::builder(name, ns::CSI).build()
    }
}
