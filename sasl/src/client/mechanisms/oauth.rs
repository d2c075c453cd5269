// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The proprietary token mechanisms some legacy services speak:
//! X-OAUTH2 (Google), X-FACEBOOK-PLATFORM and X-MESSENGER-OAUTH2
//! (Windows Live).

use crate::client::{Mechanism, MechanismError};
use crate::common::{Credentials, Identity, Secret};

/// The X-OAUTH2 mechanism: like PLAIN, with an access token in the
/// password slot.
pub struct XOAuth2 {
    username: String,
    access_token: String,
}

impl XOAuth2 {
    /// Constructs a new struct for authenticating using X-OAUTH2.
    pub fn new<N: Into<String>, T: Into<String>>(username: N, access_token: T) -> XOAuth2 {
        XOAuth2 {
            username: username.into(),
            access_token: access_token.into(),
        }
    }
}

impl Mechanism for XOAuth2 {
    fn name(&self) -> &str {
        "X-OAUTH2"
    }

    fn from_credentials(credentials: Credentials) -> Result<XOAuth2, MechanismError> {
        let Secret::Token(token) = credentials.secret else {
            return Err(MechanismError::RequiresToken);
        };
        let Identity::Username(username) = credentials.identity else {
            return Err(MechanismError::RequiresUsername);
        };
        Ok(XOAuth2::new(username, token))
    }

    fn initial(&mut self) -> Vec<u8> {
        let mut auth = Vec::new();
        auth.push(0);
        auth.extend(self.username.bytes());
        auth.push(0);
        auth.extend(self.access_token.bytes());
        auth
    }
}

/// The X-FACEBOOK-PLATFORM mechanism: the server challenge is a query
/// string, the response echoes its nonce together with the application id
/// and access token.
pub struct Facebook {
    app_id: String,
    access_token: String,
}

impl Facebook {
    /// Constructs a new struct for authenticating using
    /// X-FACEBOOK-PLATFORM.
    pub fn new<A: Into<String>, T: Into<String>>(app_id: A, access_token: T) -> Facebook {
        Facebook {
            app_id: app_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl Mechanism for Facebook {
    fn name(&self) -> &str {
        "X-FACEBOOK-PLATFORM"
    }

    fn from_credentials(credentials: Credentials) -> Result<Facebook, MechanismError> {
        let Secret::Token(token) = credentials.secret else {
            return Err(MechanismError::RequiresToken);
        };
        let Identity::Username(app_id) = credentials.identity else {
            return Err(MechanismError::RequiresUsername);
        };
        Ok(Facebook::new(app_id, token))
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let challenge =
            core::str::from_utf8(challenge).map_err(|_| MechanismError::CannotDecodeChallenge)?;
        let mut method = None;
        let mut nonce = None;
        for pair in challenge.split('&') {
            match pair.split_once('=') {
                Some(("method", v)) => method = Some(v),
                Some(("nonce", v)) => nonce = Some(v),
                _ => (),
            }
        }
        let method = method.ok_or(MechanismError::CannotDecodeChallenge)?;
        let nonce = nonce.ok_or(MechanismError::CannotDecodeChallenge)?;
        Ok(format!(
            "method={}&nonce={}&access_token={}&api_key={}&call_id=0&v=1.0",
            method, nonce, self.access_token, self.app_id
        )
        .into_bytes())
    }
}

/// The X-MESSENGER-OAUTH2 mechanism: the initial response is the bare
/// access token.
pub struct MessengerOAuth2 {
    access_token: String,
}

impl MessengerOAuth2 {
    /// Constructs a new struct for authenticating using
    /// X-MESSENGER-OAUTH2.
    pub fn new<T: Into<String>>(access_token: T) -> MessengerOAuth2 {
        MessengerOAuth2 {
            access_token: access_token.into(),
        }
    }
}

impl Mechanism for MessengerOAuth2 {
    fn name(&self) -> &str {
        "X-MESSENGER-OAUTH2"
    }

    fn from_credentials(credentials: Credentials) -> Result<MessengerOAuth2, MechanismError> {
        let Secret::Token(token) = credentials.secret else {
            return Err(MechanismError::RequiresToken);
        };
        Ok(MessengerOAuth2::new(token))
    }

    fn initial(&mut self) -> Vec<u8> {
        self.access_token.clone().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_is_nul_separated() {
        let mut mechanism = XOAuth2::new("user", "token");
        assert_eq!(mechanism.initial(), b"\0user\0token");
    }

    #[test]
    fn facebook_echoes_method_and_nonce() {
        let mut mechanism = Facebook::new("12345", "tok");
        let response = mechanism
            .response(b"method=auth.xmpp_login&nonce=abc&version=1")
            .unwrap();
        assert_eq!(
            response,
            b"method=auth.xmpp_login&nonce=abc&access_token=tok&api_key=12345&call_id=0&v=1.0"
        );
    }
}
