// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL "SCRAM-*" mechanisms (RFCs 5802, 7677).

use core::marker::PhantomData;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

use crate::client::{Mechanism, MechanismError};
use crate::common::scram::{generate_nonce, ScramProvider};
use crate::common::{parse_frame, xor, ChannelBinding, Credentials, Identity, Secret};

enum ScramState {
    Init,
    SentInitialMessage {
        client_first_bare: Vec<u8>,
        gs2_header: Vec<u8>,
    },
    SentFinalMessage {
        server_signature: Vec<u8>,
    },
    Done,
}

/// A struct for the SASL SCRAM-* and SCRAM-*-PLUS mechanisms.
pub struct Scram<S: ScramProvider> {
    name: String,
    name_plus: String,
    username: String,
    password: crate::common::Password,
    client_nonce: String,
    state: ScramState,
    channel_binding: ChannelBinding,
    _marker: PhantomData<S>,
}

impl<S: ScramProvider> Scram<S> {
    /// Constructs a new struct for authenticating using the SASL SCRAM-*
    /// and SCRAM-*-PLUS mechanisms, depending on the passed channel
    /// binding.
    ///
    /// It is recommended that instead you use a `Credentials` struct and
    /// turn it into the requested mechanism using `from_credentials`.
    pub fn new<N: Into<String>, P: Into<crate::common::Password>>(
        username: N,
        password: P,
        channel_binding: ChannelBinding,
    ) -> Result<Scram<S>, MechanismError> {
        Ok(Scram {
            name: format!("SCRAM-{}", S::name()),
            name_plus: format!("SCRAM-{}-PLUS", S::name()),
            username: username.into(),
            password: password.into(),
            client_nonce: generate_nonce().map_err(|_| MechanismError::CannotGenerateNonce)?,
            state: ScramState::Init,
            channel_binding,
            _marker: PhantomData,
        })
    }

    /// Like [`Scram::new`], but with a fixed nonce instead of a random one.
    ///
    /// Only useful for tests against published protocol vectors.
    #[doc(hidden)]
    pub fn new_with_nonce<N: Into<String>, P: Into<crate::common::Password>>(
        username: N,
        password: P,
        nonce: String,
    ) -> Scram<S> {
        Scram {
            name: format!("SCRAM-{}", S::name()),
            name_plus: format!("SCRAM-{}-PLUS", S::name()),
            username: username.into(),
            password: password.into(),
            client_nonce: nonce,
            state: ScramState::Init,
            channel_binding: ChannelBinding::None,
            _marker: PhantomData,
        }
    }
}

impl<S: ScramProvider> Mechanism for Scram<S> {
    fn name(&self) -> &str {
        match self.channel_binding {
            ChannelBinding::None | ChannelBinding::Unsupported => &self.name,
            _ => &self.name_plus,
        }
    }

    fn from_credentials(credentials: Credentials) -> Result<Scram<S>, MechanismError> {
        if let Secret::Password(password) = credentials.secret {
            if let Identity::Username(username) = credentials.identity {
                Scram::new(username, password, credentials.channel_binding)
            } else {
                Err(MechanismError::RequiresUsername)
            }
        } else {
            Err(MechanismError::RequiresPassword)
        }
    }

    fn initial(&mut self) -> Vec<u8> {
        let gs2_header = self.channel_binding.header().to_vec();
        let mut bare = Vec::new();
        bare.extend(b"n=");
        bare.extend(self.username.bytes());
        bare.extend(b",r=");
        bare.extend(self.client_nonce.bytes());
        let mut data = Vec::with_capacity(gs2_header.len() + bare.len());
        data.extend(&gs2_header);
        data.extend(&bare);
        self.state = ScramState::SentInitialMessage {
            client_first_bare: bare,
            gs2_header,
        };
        data
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let ScramState::SentInitialMessage {
            client_first_bare,
            gs2_header,
        } = core::mem::replace(&mut self.state, ScramState::Done)
        else {
            return Err(MechanismError::InvalidState);
        };

        let frame = parse_frame(challenge).map_err(|_| MechanismError::CannotDecodeChallenge)?;
        let server_nonce = frame.get("r").ok_or(MechanismError::NoServerNonce)?;
        let salt = frame
            .get("s")
            .and_then(|v| Base64.decode(v).ok())
            .ok_or(MechanismError::NoServerSalt)?;
        let iterations = frame
            .get("i")
            .and_then(|v| v.parse().ok())
            .ok_or(MechanismError::NoServerIterations)?;

        // RFC 5802 § 5.1: the server nonce must extend the client nonce.
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(MechanismError::ServerNonceMismatch);
        }

        let mut client_final_without_proof = Vec::new();
        client_final_without_proof.extend(b"c=");
        let mut cb_data = Vec::new();
        cb_data.extend(gs2_header);
        cb_data.extend(self.channel_binding.data());
        client_final_without_proof.extend(Base64.encode(&cb_data).bytes());
        client_final_without_proof.extend(b",r=");
        client_final_without_proof.extend(server_nonce.bytes());

        let salted_password = S::derive(&self.password, &salt, iterations)
            .map_err(|_| MechanismError::CannotDeriveKeys)?;
        let client_key = S::hmac(b"Client Key", &salted_password)
            .map_err(|_| MechanismError::InvalidKeyLength)?;
        let server_key = S::hmac(b"Server Key", &salted_password)
            .map_err(|_| MechanismError::InvalidKeyLength)?;

        let mut auth_message = Vec::new();
        auth_message.extend(client_first_bare);
        auth_message.push(b',');
        auth_message.extend(challenge);
        auth_message.push(b',');
        auth_message.extend(&client_final_without_proof);

        let stored_key = S::hash(&client_key);
        let client_signature =
            S::hmac(&auth_message, &stored_key).map_err(|_| MechanismError::InvalidKeyLength)?;
        let client_proof = xor(&client_key, &client_signature);
        let server_signature =
            S::hmac(&auth_message, &server_key).map_err(|_| MechanismError::InvalidKeyLength)?;

        let mut client_final = client_final_without_proof;
        client_final.extend(b",p=");
        client_final.extend(Base64.encode(&client_proof).bytes());

        self.state = ScramState::SentFinalMessage { server_signature };
        Ok(client_final)
    }

    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        let ScramState::SentFinalMessage { server_signature } =
            core::mem::replace(&mut self.state, ScramState::Done)
        else {
            return Err(MechanismError::InvalidState);
        };

        let frame =
            parse_frame(data).map_err(|_| MechanismError::CannotDecodeSuccessResponse)?;
        let signature = frame
            .get("v")
            .and_then(|v| Base64.decode(v).ok())
            .ok_or(MechanismError::NoSignatureInSuccessResponse)?;
        if signature == server_signature {
            Ok(())
        } else {
            Err(MechanismError::InvalidSignatureInSuccessResponse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::scram::{Sha1, Sha256};

    #[test]
    fn scram_sha1_works() {
        // Source: https://wiki.xmpp.org/web/SASLandSCRAM-SHA-1
        let username = "user";
        let password = "pencil";
        let client_nonce = "fyko+d2lbbFgONRv9qkxdawL";
        let client_init = b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL";
        let server_init = b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let client_final =
            b"c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=";
        let server_final = b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=";
        let mut mechanism =
            Scram::<Sha1>::new_with_nonce(username, password, client_nonce.to_owned());
        let init = mechanism.initial();
        assert_eq!(
            core::str::from_utf8(&init).unwrap(),
            core::str::from_utf8(client_init).unwrap()
        );
        let resp = mechanism.response(&server_init[..]).unwrap();
        assert_eq!(
            core::str::from_utf8(&resp).unwrap(),
            core::str::from_utf8(client_final).unwrap()
        );
        mechanism.success(&server_final[..]).unwrap();
    }

    #[test]
    fn scram_sha256_works() {
        // Source: RFC 7677
        let username = "user";
        let password = "pencil";
        let client_nonce = "rOprNGfwEbeRWgbNEkqO";
        let client_init = b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO";
        let server_init = b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = b"c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
        let server_final = b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";
        let mut mechanism =
            Scram::<Sha256>::new_with_nonce(username, password, client_nonce.to_owned());
        let init = mechanism.initial();
        assert_eq!(
            core::str::from_utf8(&init).unwrap(),
            core::str::from_utf8(client_init).unwrap()
        );
        let resp = mechanism.response(&server_init[..]).unwrap();
        assert_eq!(
            core::str::from_utf8(&resp).unwrap(),
            core::str::from_utf8(client_final).unwrap()
        );
        mechanism.success(&server_final[..]).unwrap();
    }

    #[test]
    fn server_nonce_must_extend_client_nonce() {
        let mut mechanism =
            Scram::<Sha1>::new_with_nonce("user", "pencil", "fyko+d2lbbFgONRv9qkxdawL".to_owned());
        let _ = mechanism.initial();
        let err = mechanism
            .response(b"r=completely-different,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap_err();
        assert_eq!(err, MechanismError::ServerNonceMismatch);
    }

    #[test]
    fn tampered_server_signature_is_rejected() {
        let mut mechanism =
            Scram::<Sha1>::new_with_nonce("user", "pencil", "fyko+d2lbbFgONRv9qkxdawL".to_owned());
        let _ = mechanism.initial();
        let _ = mechanism
            .response(&b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096"[..])
            .unwrap();
        let err = mechanism
            .success(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert_eq!(err, MechanismError::InvalidSignatureInSuccessResponse);
    }
}
