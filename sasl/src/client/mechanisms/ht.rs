// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL "HT-*" (Hashed Token) mechanism family used for
//! XEP-0484 FAST token authentication.

use core::marker::PhantomData;

use crate::client::{Mechanism, MechanismError};
use crate::common::ht::{HtBinding, HtProvider};
use crate::common::{ChannelBinding, Credentials, Identity, Secret};

/// A struct for the SASL HT-* mechanisms.
///
/// The token proof is `HMAC-<hash>(token-secret, user || 0x00 ||
/// channel-binding-material)`; the initial response carries the user name,
/// a NUL byte and the proof.
pub struct HashedToken<S: HtProvider> {
    name: String,
    username: String,
    token: String,
    binding: HtBinding,
    material: Vec<u8>,
    _marker: PhantomData<S>,
}

impl<S: HtProvider> HashedToken<S> {
    /// Constructs a new struct for authenticating with a hashed token.
    ///
    /// Fails with [`MechanismError::ChannelBindingUnavailable`] when the
    /// transport cannot produce the material the `binding` variant needs.
    pub fn new<N: Into<String>, T: Into<String>>(
        username: N,
        token: T,
        binding: HtBinding,
        channel_binding: &ChannelBinding,
    ) -> Result<HashedToken<S>, MechanismError> {
        let material = binding
            .material(channel_binding)
            .ok_or(MechanismError::ChannelBindingUnavailable)?
            .to_vec();
        Ok(HashedToken {
            name: format!("HT-{}-{}", S::name(), binding.suffix()),
            username: username.into(),
            token: token.into(),
            binding,
            material,
            _marker: PhantomData,
        })
    }

    /// The channel binding variant this instance uses.
    pub fn binding(&self) -> HtBinding {
        self.binding
    }
}

impl<S: HtProvider> Mechanism for HashedToken<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn from_credentials(credentials: Credentials) -> Result<HashedToken<S>, MechanismError> {
        let Secret::Token(token) = credentials.secret else {
            return Err(MechanismError::RequiresToken);
        };
        let Identity::Username(username) = credentials.identity else {
            return Err(MechanismError::RequiresUsername);
        };
        HashedToken::new(
            username,
            token,
            HtBinding::None,
            &credentials.channel_binding,
        )
    }

    fn initial(&mut self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend(self.username.bytes());
        message.push(0);
        message.extend(&self.material);
        // Unwrap: HMAC accepts keys of any length for the hashes we ship.
        let proof = S::hmac(&message, self.token.as_bytes()).unwrap();

        let mut out = Vec::new();
        out.extend(self.username.bytes());
        out.push(0);
        out.extend(proof);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ht::{Sha256, Sha3_512};
    use hmac::{Hmac, Mac};

    #[test]
    fn mechanism_names_encode_hash_and_binding() {
        let cb = ChannelBinding::None;
        let mechanism: HashedToken<Sha256> =
            HashedToken::new("user", "tok", HtBinding::None, &cb).unwrap();
        assert_eq!(mechanism.name(), "HT-SHA-256-NONE");

        let cb = ChannelBinding::TlsExporter(vec![1, 2, 3]);
        let mechanism: HashedToken<Sha3_512> =
            HashedToken::new("user", "tok", HtBinding::Expr, &cb).unwrap();
        assert_eq!(mechanism.name(), "HT-SHA3-512-EXPR");
    }

    #[test]
    fn unavailable_binding_material_is_refused() {
        let cb = ChannelBinding::None;
        let result: Result<HashedToken<Sha256>, _> =
            HashedToken::new("user", "tok", HtBinding::Expr, &cb);
        assert_eq!(
            result.err().unwrap(),
            MechanismError::ChannelBindingUnavailable
        );
    }

    #[test]
    fn proof_covers_user_and_binding_material() {
        let cb = ChannelBinding::TlsExporter(b"exported".to_vec());
        let mut mechanism: HashedToken<Sha256> =
            HashedToken::new("user", "s3cr3t", HtBinding::Expr, &cb).unwrap();
        let initial = mechanism.initial();

        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"s3cr3t").unwrap();
        mac.update(b"user\0exported");
        let expected = mac.finalize().into_bytes();

        assert_eq!(&initial[..5], b"user\0");
        assert_eq!(&initial[5..], expected.as_slice());
    }
}
