// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(missing_docs)]

//! Client-side SASL mechanism implementations.
//!
//! # Examples
//!
//! ```rust
//! use veery_sasl::client::mechanisms::Plain;
//! use veery_sasl::client::Mechanism;
//! use veery_sasl::common::Credentials;
//!
//! let creds = Credentials::default()
//!     .with_username("user")
//!     .with_password("pencil");
//!
//! let mut mechanism = Plain::from_credentials(creds).unwrap();
//!
//! assert_eq!(mechanism.initial(), b"\0user\0pencil");
//! ```
//!
//! The tests in `client/mechanisms/scram.rs` show more advanced usage.

pub mod client;
pub mod common;
mod error;
pub mod secret;

pub use crate::error::Error;
