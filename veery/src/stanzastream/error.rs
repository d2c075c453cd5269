// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::io;

/// A cloneable stand-in for [`std::io::Error`], which is not `Clone`.
///
/// Packet tokens are watch channels, so the error which failed a packet
/// must be cloneable to every observer.
#[derive(Debug, Clone)]
pub struct OpaqueIoError {
    kind: io::ErrorKind,
    message: String,
}

impl OpaqueIoError {
    /// The kind of the original error.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Convert into a real [`io::Error`].
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(self.kind, self.message)
    }

    /// Create a real [`io::Error`] without consuming this one.
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }

    pub(crate) fn disconnected() -> Self {
        Self {
            kind: io::ErrorKind::NotConnected,
            message: "stream disconnected without resumption".to_owned(),
        }
    }
}

impl From<io::Error> for OpaqueIoError {
    fn from(other: io::Error) -> Self {
        <Self as From<&io::Error>>::from(&other)
    }
}

impl From<&io::Error> for OpaqueIoError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for OpaqueIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl core::error::Error for OpaqueIoError {}
