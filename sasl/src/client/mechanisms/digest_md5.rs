// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL "DIGEST-MD5" mechanism (RFC 2831).

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::client::{Mechanism, MechanismError};
use crate::common::{Credentials, Identity, Password, Secret};

/// A struct for the SASL DIGEST-MD5 mechanism.
pub struct DigestMd5 {
    username: String,
    password: String,
    service: String,
    host: String,
    cnonce: String,
    step: Step,
}

enum Step {
    WaitingChallenge,
    WaitingRspauth { rspauth: String },
    Done,
}

/// Parse a digest-challenge/digest-response string: comma-separated
/// `key=value` pairs where values may be quoted and contain commas.
fn parse_digest(input: &[u8]) -> Result<HashMap<String, String>, MechanismError> {
    let input =
        core::str::from_utf8(input).map_err(|_| MechanismError::CannotDecodeChallenge)?;
    let mut map = HashMap::new();
    let mut rest = input.trim_start_matches(',');
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or(MechanismError::CannotDecodeChallenge)?;
        let key = rest[..eq].trim().to_owned();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = stripped.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => out.push(escaped),
                        None => return Err(MechanismError::CannotDecodeChallenge),
                    },
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    c => out.push(c),
                }
            }
            let end = end.ok_or(MechanismError::CannotDecodeChallenge)?;
            value = out;
            rest = stripped[end + 1..].trim_start_matches(',');
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].to_owned();
            rest = &rest[(end + 1).min(rest.len())..];
        }
        map.insert(key, value);
    }
    Ok(map)
}

fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn md5(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}

impl DigestMd5 {
    /// Constructs a new struct for authenticating using the SASL DIGEST-MD5
    /// mechanism. The digest-uri is built as `<service>/<host>`.
    pub fn new<N, P, S, H>(username: N, password: P, service: S, host: H) -> DigestMd5
    where
        N: Into<String>,
        P: Into<String>,
        S: Into<String>,
        H: Into<String>,
    {
        DigestMd5 {
            username: username.into(),
            password: password.into(),
            service: service.into(),
            host: host.into(),
            cnonce: generate_cnonce(),
            step: Step::WaitingChallenge,
        }
    }

    /// Like [`DigestMd5::new`], but with a fixed cnonce. Only useful for
    /// tests against published protocol vectors.
    #[doc(hidden)]
    pub fn new_with_cnonce<N, P, S, H>(
        username: N,
        password: P,
        service: S,
        host: H,
        cnonce: String,
    ) -> DigestMd5
    where
        N: Into<String>,
        P: Into<String>,
        S: Into<String>,
        H: Into<String>,
    {
        DigestMd5 {
            username: username.into(),
            password: password.into(),
            service: service.into(),
            host: host.into(),
            cnonce,
            step: Step::WaitingChallenge,
        }
    }

    /// Compute the response-value of RFC 2831 § 2.1.2.1.
    ///
    /// `a2_prefix` is "AUTHENTICATE" for the client response and "" for the
    /// server's rspauth.
    fn response_value(
        &self,
        realm: &str,
        nonce: &str,
        digest_uri: &str,
        a2_prefix: &str,
    ) -> String {
        let mut a1 = md5(format!("{}:{}:{}", self.username, realm, self.password).as_bytes());
        a1.extend(format!(":{}:{}", nonce, self.cnonce).bytes());
        let ha1 = hex(&md5(&a1));
        let ha2 = hex(&md5(format!("{}:{}", a2_prefix, digest_uri).as_bytes()));
        hex(&md5(
            format!("{}:{}:00000001:{}:auth:{}", ha1, nonce, self.cnonce, ha2).as_bytes(),
        ))
    }
}

fn generate_cnonce() -> String {
    let mut data = [0u8; 16];
    // Zeroed cnonce beats a panic; the server nonce still varies.
    let _ = getrandom::getrandom(&mut data);
    hex(&data)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &str {
        "DIGEST-MD5"
    }

    fn from_credentials(credentials: Credentials) -> Result<DigestMd5, MechanismError> {
        if let Secret::Password(Password::Plain(password)) = credentials.secret {
            if let Identity::Username(username) = credentials.identity {
                Ok(DigestMd5::new(username, password, "xmpp", ""))
            } else {
                Err(MechanismError::RequiresUsername)
            }
        } else {
            Err(MechanismError::RequiresPassword)
        }
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let fields = parse_digest(challenge)?;

        match core::mem::replace(&mut self.step, Step::Done) {
            Step::WaitingChallenge => {
                let nonce = fields
                    .get("nonce")
                    .ok_or(MechanismError::NoServerNonce)?
                    .clone();
                // When the server offers no realm, the host is used.
                let realm = fields
                    .get("realm")
                    .cloned()
                    .unwrap_or_else(|| self.host.clone());
                let host = if self.host.is_empty() {
                    realm.clone()
                } else {
                    self.host.clone()
                };
                let digest_uri = format!("{}/{}", self.service, host);

                let response = self.response_value(&realm, &nonce, &digest_uri, "AUTHENTICATE");
                let rspauth = self.response_value(&realm, &nonce, &digest_uri, "");

                let mut out = String::new();
                out.push_str(&format!("username={}", quote(&self.username)));
                out.push_str(&format!(",realm={}", quote(&realm)));
                out.push_str(&format!(",nonce={}", quote(&nonce)));
                out.push_str(&format!(",cnonce={}", quote(&self.cnonce)));
                out.push_str(",nc=00000001");
                out.push_str(",qop=auth");
                out.push_str(&format!(",digest-uri={}", quote(&digest_uri)));
                out.push_str(&format!(",response={}", response));
                out.push_str(",charset=utf-8");

                self.step = Step::WaitingRspauth { rspauth };
                Ok(out.into_bytes())
            }
            Step::WaitingRspauth { rspauth } => {
                let received = fields
                    .get("rspauth")
                    .ok_or(MechanismError::NoSignatureInSuccessResponse)?;
                if *received == rspauth {
                    // RFC 2831: the client responds to the rspauth
                    // challenge with an empty response.
                    Ok(Vec::new())
                } else {
                    Err(MechanismError::InvalidSignatureInSuccessResponse)
                }
            }
            Step::Done => Err(MechanismError::InvalidState),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        // Some servers carry the rspauth inside <success/> instead of a
        // second challenge.
        match core::mem::replace(&mut self.step, Step::Done) {
            Step::WaitingRspauth { rspauth } if !data.is_empty() => {
                let fields = parse_digest(data)?;
                let received = fields
                    .get("rspauth")
                    .ok_or(MechanismError::NoSignatureInSuccessResponse)?;
                if *received == rspauth {
                    Ok(())
                } else {
                    Err(MechanismError::InvalidSignatureInSuccessResponse)
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The example exchange from RFC 2831 § 4.
    const CHALLENGE: &[u8] = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",algorithm=md5-sess,charset=utf-8"#;

    #[test]
    fn rfc2831_example_exchange() {
        let mut mechanism = DigestMd5::new_with_cnonce(
            "chris",
            "secret",
            "imap",
            "elwood.innosoft.com",
            "OA6MHXh6VqTrRk".to_owned(),
        );
        assert!(mechanism.initial().is_empty());

        let response = mechanism.response(CHALLENGE).unwrap();
        let fields = parse_digest(&response).unwrap();
        assert_eq!(fields.get("username").unwrap(), "chris");
        assert_eq!(fields.get("realm").unwrap(), "elwood.innosoft.com");
        assert_eq!(fields.get("digest-uri").unwrap(), "imap/elwood.innosoft.com");
        assert_eq!(fields.get("nc").unwrap(), "00000001");
        assert_eq!(
            fields.get("response").unwrap(),
            "d388dad90d4bbd760a152321f2143af7"
        );

        // Second challenge carries the server's rspauth.
        let second = br#"rspauth=ea40f60335c427b5527b84dbabcdfffd"#;
        assert_eq!(mechanism.response(second).unwrap(), b"");
    }

    #[test]
    fn wrong_rspauth_is_rejected() {
        let mut mechanism = DigestMd5::new_with_cnonce(
            "chris",
            "secret",
            "imap",
            "elwood.innosoft.com",
            "OA6MHXh6VqTrRk".to_owned(),
        );
        let _ = mechanism.response(CHALLENGE).unwrap();
        let err = mechanism
            .response(br#"rspauth=00000000000000000000000000000000"#)
            .unwrap_err();
        assert_eq!(err, MechanismError::InvalidSignatureInSuccessResponse);
    }

    #[test]
    fn quoted_values_with_commas_parse() {
        let fields = parse_digest(br#"realm="a,b",nonce="x\"y",qop=auth"#).unwrap();
        assert_eq!(fields.get("realm").unwrap(), "a,b");
        assert_eq!(fields.get("nonce").unwrap(), "x\"y");
        assert_eq!(fields.get("qop").unwrap(), "auth");
    }
}
