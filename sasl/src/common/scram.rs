// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hash providers for the SCRAM-* mechanism family.

use getrandom::{getrandom, Error as RngError};
use hmac::{digest::InvalidLength, Hmac, Mac};
use pbkdf2::pbkdf2;
use sha1::{Digest, Sha1 as Sha1Hash};
use sha2::{Sha256 as Sha256Hash, Sha512 as Sha512Hash};

use crate::common::Password;
use crate::secret;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

/// Generate a nonce for SCRAM authentication.
pub fn generate_nonce() -> Result<String, RngError> {
    let mut data = [0u8; 32];
    getrandom(&mut data)?;
    Ok(Base64.encode(data))
}

/// An error during PBKDF2 key derivation.
#[derive(Debug, PartialEq)]
pub enum DeriveError {
    /// A stored digest was derived with a different hash.
    IncompatibleHashingMethod(String, String),
    /// A stored digest was derived with a different salt.
    IncorrectSalt,
    /// A stored digest was derived with a different iteration count.
    IncompatibleIterationCount(u32, u32),
}

impl std::fmt::Display for DeriveError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeriveError::IncompatibleHashingMethod(one, two) => {
                write!(fmt, "incompatible hashing method, {} is not {}", one, two)
            }
            DeriveError::IncorrectSalt => write!(fmt, "incorrect salt"),
            DeriveError::IncompatibleIterationCount(one, two) => {
                write!(fmt, "incompatible iteration count, {} is not {}", one, two)
            }
        }
    }
}

impl std::error::Error for DeriveError {}

/// A trait which defines the needed methods for SCRAM.
pub trait ScramProvider {
    /// The kind of secret this `ScramProvider` requires.
    type Secret: secret::Secret;

    /// The name of the hash function.
    fn name() -> &'static str;

    /// A function which hashes the data using the hash function.
    fn hash(data: &[u8]) -> Vec<u8>;

    /// A function which performs an HMAC using the hash function.
    fn hmac(data: &[u8], key: &[u8]) -> Result<Vec<u8>, InvalidLength>;

    /// A function which does PBKDF2 key derivation using the hash function.
    fn derive(data: &Password, salt: &[u8], iterations: u32) -> Result<Vec<u8>, DeriveError>;
}

macro_rules! scram_provider {
    ($(#[$meta:meta])* $provider:ident, $hash:ident, $name:literal, $digest_len:literal, $secret:ident) => {
        $(#[$meta])*
        pub struct $provider;

        impl ScramProvider for $provider {
            type Secret = secret::$secret;

            fn name() -> &'static str {
                $name
            }

            fn hash(data: &[u8]) -> Vec<u8> {
                $hash::digest(data).to_vec()
            }

            fn hmac(data: &[u8], key: &[u8]) -> Result<Vec<u8>, InvalidLength> {
                let mut mac = Hmac::<$hash>::new_from_slice(key)?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }

            fn derive(
                password: &Password,
                salt: &[u8],
                iterations: u32,
            ) -> Result<Vec<u8>, DeriveError> {
                match *password {
                    Password::Plain(ref plain) => {
                        let mut result = vec![0; $digest_len];
                        pbkdf2::<Hmac<$hash>>(plain.as_bytes(), salt, iterations, &mut result);
                        Ok(result)
                    }
                    Password::Pbkdf2 {
                        ref method,
                        salt: ref stored_salt,
                        iterations: stored_iterations,
                        ref data,
                    } => {
                        if method != Self::name() {
                            Err(DeriveError::IncompatibleHashingMethod(
                                method.to_string(),
                                Self::name().to_string(),
                            ))
                        } else if stored_salt != salt {
                            Err(DeriveError::IncorrectSalt)
                        } else if stored_iterations != iterations {
                            Err(DeriveError::IncompatibleIterationCount(
                                stored_iterations,
                                iterations,
                            ))
                        } else {
                            Ok(data.to_vec())
                        }
                    }
                }
            }
        }
    };
}

scram_provider!(
    /// A `ScramProvider` for SCRAM-SHA-1 and SCRAM-SHA-1-PLUS.
    Sha1,
    Sha1Hash,
    "SHA-1",
    20,
    Pbkdf2Sha1
);
scram_provider!(
    /// A `ScramProvider` for SCRAM-SHA-256 and SCRAM-SHA-256-PLUS.
    Sha256,
    Sha256Hash,
    "SHA-256",
    32,
    Pbkdf2Sha256
);
scram_provider!(
    /// A `ScramProvider` for SCRAM-SHA-512 and SCRAM-SHA-512-PLUS.
    Sha512,
    Sha512Hash,
    "SHA-512",
    64,
    Pbkdf2Sha512
);
