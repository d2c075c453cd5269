// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reliable asynchronous [XMPP](https://xmpp.org/) client sessions with
//! [tokio](https://tokio.rs/).
//!
//! The crate implements the client-to-server protocol core: connection
//! establishment (DNS SRV, STARTTLS or direct TLS), SASL and SASL-2
//! authentication including FAST tokens, resource binding, XEP-0198
//! stream management with transparent resumption, outgoing IQ tracking,
//! keep-alive and reconnection. Everything above that level (roster,
//! MUC, pubsub, ...) plugs in through the [`modules`] system.
//!
//! # Getting started
//!
//! Create a [`Client`] from a [`Config`] and call its `next` method in a
//! loop. Sending returns per-packet tokens which observe the packet all
//! the way to the server's XEP-0198 acknowledgement.
//!
//! # Supported transports
//!
//! - TCP with STARTTLS (with SRV resolution)
//! - TCP with direct TLS (legacy SSL ports)
//! - Plaintext TCP (for tests; feature `insecure-tcp`)

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(all(
    not(doc),
    feature = "tls-native",
    feature = "tls-rust"
))]
compile_error!("Both tls-native and tls-rust features can't be enabled at the same time.");

#[cfg(all(
    feature = "starttls",
    not(feature = "tls-native"),
    not(feature = "tls-rust")
))]
compile_error!(
    "when starttls feature enabled one of tls-native and tls-rust features must be enabled."
);

extern crate alloc;

pub use minidom;
pub use veery_jid as jid;
pub use veery_sasl as sasl;

mod client;
pub mod connect;
/// Detailed error types
pub mod error;
mod event;
pub mod modules;
pub mod protocol;
pub mod stanzastream;
pub mod xmlstream;

#[doc(inline)]
/// Generic veery error
pub use crate::error::Error;
pub use client::{
    Client, Config, E2eeTransform, FastToken, IqFailure, IqRequest, IqResponse, IqResponseToken,
    TlsMode, TokenStore,
};
pub use event::Event;
pub use protocol::{Iq, IqType, Message, Presence, Stanza};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::minidom;
        #[allow(unused_imports)]
        use crate::sasl;
    }
}
