// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hash providers and channel-binding naming for the HT-* (Hashed Token)
//! mechanism family used by XEP-0484 FAST.
//!
//! A mechanism name has the shape `HT-<HASH>-<BINDING>`, e.g.
//! `HT-SHA-256-NONE` or `HT-SHA3-512-EXPR`.

use hmac::{digest::InvalidLength, Hmac, Mac};
use sha2::{Sha256 as Sha256Hash, Sha512 as Sha512Hash};
use sha3::Sha3_512 as Sha3_512Hash;

use crate::common::ChannelBinding;

/// A hash usable with the HT-* mechanism family.
pub trait HtProvider {
    /// The hash name as it appears in the mechanism name.
    fn name() -> &'static str;

    /// Compute an HMAC with this hash.
    fn hmac(data: &[u8], key: &[u8]) -> Result<Vec<u8>, InvalidLength>;
}

macro_rules! ht_provider {
    ($(#[$meta:meta])* $provider:ident, $hash:ident, $name:literal) => {
        $(#[$meta])*
        pub struct $provider;

        impl HtProvider for $provider {
            fn name() -> &'static str {
                $name
            }

            fn hmac(data: &[u8], key: &[u8]) -> Result<Vec<u8>, InvalidLength> {
                let mut mac = Hmac::<$hash>::new_from_slice(key)?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    };
}

ht_provider!(
    /// The HT-SHA-256-* hash.
    Sha256,
    Sha256Hash,
    "SHA-256"
);
ht_provider!(
    /// The HT-SHA-512-* hash.
    Sha512,
    Sha512Hash,
    "SHA-512"
);
ht_provider!(
    /// The HT-SHA3-512-* hash.
    Sha3_512,
    Sha3_512Hash,
    "SHA3-512"
);

/// The channel binding variants the HT-* family encodes in its mechanism
/// names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HtBinding {
    /// `-NONE`: no channel binding material.
    None,
    /// `-UNIQ`: tls-unique (TLS 1.2).
    Uniq,
    /// `-EXPR`: tls-exporter (TLS 1.3).
    Expr,
    /// `-ENDP`: tls-server-end-point (server certificate hash).
    Endp,
}

impl HtBinding {
    /// The suffix of the mechanism name.
    pub fn suffix(self) -> &'static str {
        match self {
            HtBinding::None => "NONE",
            HtBinding::Uniq => "UNIQ",
            HtBinding::Expr => "EXPR",
            HtBinding::Endp => "ENDP",
        }
    }

    /// Parse the suffix of a mechanism name.
    pub fn from_suffix(suffix: &str) -> Option<HtBinding> {
        Some(match suffix {
            "NONE" => HtBinding::None,
            "UNIQ" => HtBinding::Uniq,
            "EXPR" => HtBinding::Expr,
            "ENDP" => HtBinding::Endp,
            _ => return None,
        })
    }

    /// Extract the binding material this variant needs from the channel
    /// binding data the transport produced.
    ///
    /// Returns `None` when the transport cannot provide the required
    /// material, in which case the mechanism variant must not be used.
    pub fn material<'a>(self, cb: &'a ChannelBinding) -> Option<&'a [u8]> {
        match (self, cb) {
            (HtBinding::None, _) => Some(&[]),
            (HtBinding::Uniq, ChannelBinding::TlsUnique(data)) => Some(data),
            (HtBinding::Expr, ChannelBinding::TlsExporter(data)) => Some(data),
            (HtBinding::Endp, ChannelBinding::TlsServerEndPoint(data)) => Some(data),
            _ => None,
        }
    }
}
