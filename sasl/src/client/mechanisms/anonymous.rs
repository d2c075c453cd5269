// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides the SASL "ANONYMOUS" mechanism.

use crate::client::{Mechanism, MechanismError};
use crate::common::{Credentials, Secret};

/// A struct for the SASL ANONYMOUS mechanism.
pub struct Anonymous;

impl Anonymous {
    /// Constructs a new struct for authenticating using the SASL ANONYMOUS
    /// mechanism.
    pub fn new() -> Anonymous {
        Anonymous
    }
}

impl Default for Anonymous {
    fn default() -> Anonymous {
        Anonymous::new()
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn from_credentials(credentials: Credentials) -> Result<Anonymous, MechanismError> {
        if let Secret::None = credentials.secret {
            Ok(Anonymous)
        } else {
            Err(MechanismError::RequiresPassword)
        }
    }
}
