// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL "PLAIN" mechanism.

use crate::client::{Mechanism, MechanismError};
use crate::common::{Credentials, Identity, Password, Secret};

/// A struct for the SASL PLAIN mechanism.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    /// Constructs a new struct for authenticating using the SASL PLAIN
    /// mechanism.
    ///
    /// It is recommended that instead you use a `Credentials` struct and
    /// turn it into the requested mechanism using `from_credentials`.
    pub fn new<N: Into<String>, P: Into<String>>(username: N, password: P) -> Plain {
        Plain {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn from_credentials(credentials: Credentials) -> Result<Plain, MechanismError> {
        if let Secret::Password(Password::Plain(password)) = credentials.secret {
            if let Identity::Username(username) = credentials.identity {
                Ok(Plain::new(username, password))
            } else {
                Err(MechanismError::RequiresUsername)
            }
        } else {
            Err(MechanismError::RequiresPassword)
        }
    }

    fn initial(&mut self) -> Vec<u8> {
        let mut auth = Vec::new();
        auth.push(0);
        auth.extend(self.username.bytes());
        auth.push(0);
        auth.extend(self.password.bytes());
        auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_is_nul_separated() {
        let mut mechanism = Plain::new("foo", "bar");
        assert_eq!(mechanism.initial(), b"\0foo\0bar");
    }
}
