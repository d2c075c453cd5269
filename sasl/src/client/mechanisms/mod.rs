// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL mechanisms this crate implements.

#[cfg(feature = "anonymous")]
mod anonymous;
#[cfg(feature = "digest-md5")]
mod digest_md5;
#[cfg(feature = "ht")]
mod ht;
mod oauth;
mod plain;
#[cfg(feature = "scram")]
mod scram;

#[cfg(feature = "anonymous")]
pub use self::anonymous::Anonymous;
#[cfg(feature = "digest-md5")]
pub use self::digest_md5::DigestMd5;
#[cfg(feature = "ht")]
pub use self::ht::HashedToken;
pub use self::oauth::{Facebook, MessengerOAuth2, XOAuth2};
pub use self::plain::Plain;
#[cfg(feature = "scram")]
pub use self::scram::Scram;
