// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The client side of SASL authentication.

use core::fmt;

use crate::common::Credentials;

/// Errors a mechanism can produce.
#[derive(Debug, PartialEq)]
pub enum MechanismError {
    /// The OS random number generator failed.
    CannotGenerateNonce,
    /// This mechanism needs a username, but none was provided.
    RequiresUsername,
    /// This mechanism needs a plaintext or derived password.
    RequiresPassword,
    /// This mechanism needs a token secret.
    RequiresToken,
    /// The transport cannot produce the channel binding material this
    /// mechanism variant requires.
    ChannelBindingUnavailable,
    /// The server challenge could not be decoded.
    CannotDecodeChallenge,
    /// The server first message did not contain a nonce.
    NoServerNonce,
    /// The server first message did not contain a salt.
    NoServerSalt,
    /// The server first message did not contain an iteration count.
    NoServerIterations,
    /// The server nonce did not start with the client nonce.
    ServerNonceMismatch,
    /// Key derivation failed.
    CannotDeriveKeys,
    /// The HMAC key had an invalid length.
    InvalidKeyLength,
    /// A challenge arrived in a state which does not expect one.
    InvalidState,
    /// The additional data in the success response could not be decoded.
    CannotDecodeSuccessResponse,
    /// The success response did not carry a server signature.
    NoSignatureInSuccessResponse,
    /// The server signature did not verify.
    InvalidSignatureInSuccessResponse,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MechanismError::CannotGenerateNonce => "can't generate nonce",
            MechanismError::RequiresUsername => "mechanism requires a username",
            MechanismError::RequiresPassword => "mechanism requires a password",
            MechanismError::RequiresToken => "mechanism requires a token",
            MechanismError::ChannelBindingUnavailable => {
                "transport can't provide the required channel binding material"
            }
            MechanismError::CannotDecodeChallenge => "can't decode challenge",
            MechanismError::NoServerNonce => "no server nonce",
            MechanismError::NoServerSalt => "no server salt",
            MechanismError::NoServerIterations => "no server iterations",
            MechanismError::ServerNonceMismatch => "server nonce doesn't extend the client nonce",
            MechanismError::CannotDeriveKeys => "can't derive keys",
            MechanismError::InvalidKeyLength => "invalid key length",
            MechanismError::InvalidState => "not in the right state to receive this payload",
            MechanismError::CannotDecodeSuccessResponse => "can't decode success response",
            MechanismError::NoSignatureInSuccessResponse => {
                "no server signature in success response"
            }
            MechanismError::InvalidSignatureInSuccessResponse => {
                "invalid server signature in success response"
            }
        })
    }
}

impl std::error::Error for MechanismError {}

/// A trait which defines SASL mechanisms.
pub trait Mechanism {
    /// The name of the mechanism.
    fn name(&self) -> &str;

    /// Creates this mechanism from `Credentials`.
    fn from_credentials(credentials: Credentials) -> Result<Self, MechanismError>
    where
        Self: Sized;

    /// Provides initial payload of the SASL mechanism.
    fn initial(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Creates a response to the SASL challenge.
    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }

    /// Verifies the server success response, if there is one.
    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}

pub mod mechanisms;
