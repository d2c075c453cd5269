// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;

#[cfg(feature = "scram")]
use getrandom::Error as RngError;

/// A wrapper enum for things that could go wrong in this crate.
#[derive(Debug)]
pub enum Error {
    #[cfg(feature = "scram")]
    #[cfg_attr(docsrs, doc(cfg(feature = "scram")))]
    /// An error while initializing the Rng.
    RngError(RngError),

    /// An error in a SASL mechanism.
    SaslError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            #[cfg(feature = "scram")]
            Error::RngError(e) => write!(f, "rng error: {e}"),
            Error::SaslError(s) => write!(f, "sasl error: {s}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(feature = "scram")]
impl From<RngError> for Error {
    fn from(err: RngError) -> Error {
        Error::RngError(err)
    }
}
