// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::error::Error as StdError;

/// An error which occurred while parsing a JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The complete JID exceeded 3071 octets.
    JidTooLong,

    /// The node part failed the nodeprep profile.
    NodePrep,

    /// The node part was empty despite the presence of a `@`.
    NodeEmpty,

    /// The node part exceeded 1023 octets.
    NodeTooLong,

    /// The domain part failed the nameprep profile.
    NamePrep,

    /// The domain part was empty.
    DomainEmpty,

    /// The domain part exceeded 1023 octets.
    DomainTooLong,

    /// The resource part failed the resourceprep profile.
    ResourcePrep,

    /// The resource part was empty despite the presence of a `/`.
    ResourceEmpty,

    /// The resource part exceeded 1023 octets.
    ResourceTooLong,

    /// A full JID was required, but the input had no resource.
    ResourceMissingInFullJid,

    /// A bare JID was required, but the input carried a resource.
    ResourceInBareJid,
}

impl StdError for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Error::JidTooLong => "JID longer than 3071 octets",
            Error::NodePrep => "node part violates the nodeprep profile",
            Error::NodeEmpty => "node part empty despite the presence of a @",
            Error::NodeTooLong => "node part longer than 1023 octets",
            Error::NamePrep => "domain part violates the nameprep profile",
            Error::DomainEmpty => "no domain part in this JID",
            Error::DomainTooLong => "domain part longer than 1023 octets",
            Error::ResourcePrep => "resource part violates the resourceprep profile",
            Error::ResourceEmpty => "resource part empty despite the presence of a /",
            Error::ResourceTooLong => "resource part longer than 1023 octets",
            Error::ResourceMissingInFullJid => "no resource part in this full JID",
            Error::ResourceInBareJid => "resource part present in a bare JID",
        })
    }
}
