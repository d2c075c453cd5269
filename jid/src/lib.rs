// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(missing_docs)]

//! Represents XMPP addresses, also known as JIDs.
//!
//! A JID has the shape `node@domain/resource`, where both the node and the
//! resource are optional. The address without a resource is called a *bare*
//! JID, an address carrying one a *full* JID.
//!
//! This crate stores every JID in a single normalized string. Node and
//! domain are case-folded through their respective stringprep profiles at
//! parse time, so two JIDs which differ only in the case of node or domain
//! compare equal. The resource is case-sensitive.

use core::fmt;
use core::num::NonZeroU16;
use core::str::FromStr;

use memchr::memchr;
use stringprep::{nameprep, nodeprep, resourceprep};

#[cfg(feature = "serde")]
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

mod error;
mod parts;

pub use crate::error::Error;
pub use crate::parts::{DomainPart, NodePart, ResourcePart};

/// RFC 7622 limits each part to 1023 octets; with the two separators, a
/// complete JID never exceeds 3071 octets.
const MAX_JID_LEN: usize = 3071;
const MAX_PART_LEN: usize = 1023;

fn part_check(len: usize, empty: Error, too_long: Error) -> Result<(), Error> {
    if len == 0 {
        Err(empty)
    } else if len > MAX_PART_LEN {
        Err(too_long)
    } else {
        Ok(())
    }
}

/// A normalized XMPP address.
///
/// `Jid` covers both bare and full addresses; [`BareJid`] and [`FullJid`]
/// are thin wrappers which guarantee the absence or presence of a resource
/// at the type level.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    normalized: String,
    // Byte offset of the '@' in `normalized`, if a node is present. The
    // node part is never empty, so the offset can never be zero.
    at: Option<NonZeroU16>,
    // Byte offset of the '/' in `normalized`, if a resource is present.
    // The domain part is never empty either.
    slash: Option<NonZeroU16>,
}

impl Jid {
    /// Parse and normalize a JID from its string representation.
    pub fn new(s: &str) -> Result<Jid, Error> {
        if s.len() > MAX_JID_LEN {
            return Err(Error::JidTooLong);
        }

        let bytes = s.as_bytes();
        let at = memchr(b'@', bytes);
        let slash = memchr(b'/', bytes);
        // An '@' after the first '/' belongs to the resource.
        let at = match (at, slash) {
            (Some(at), Some(slash)) if at > slash => None,
            (at, _) => at,
        };

        let node = match at {
            Some(at) => {
                let node = nodeprep(&s[..at]).map_err(|_| Error::NodePrep)?;
                part_check(node.len(), Error::NodeEmpty, Error::NodeTooLong)?;
                Some(node)
            }
            None => None,
        };

        let domain_start = at.map(|at| at + 1).unwrap_or(0);
        let domain_end = slash.unwrap_or(s.len());
        if domain_start > domain_end {
            return Err(Error::DomainEmpty);
        }
        let domain = nameprep(&s[domain_start..domain_end]).map_err(|_| Error::NamePrep)?;
        // Nameprep keeps trailing dots; domains are compared without them.
        let domain = domain.strip_suffix('.').unwrap_or(&domain);
        part_check(domain.len(), Error::DomainEmpty, Error::DomainTooLong)?;

        let resource = match slash {
            Some(slash) => {
                let resource = resourceprep(&s[slash + 1..]).map_err(|_| Error::ResourcePrep)?;
                part_check(resource.len(), Error::ResourceEmpty, Error::ResourceTooLong)?;
                Some(resource)
            }
            None => None,
        };

        let mut normalized = String::with_capacity(s.len());
        let mut at = None;
        let mut slash = None;
        if let Some(node) = &node {
            normalized.push_str(node);
            at = NonZeroU16::new(normalized.len() as u16);
            normalized.push('@');
        }
        normalized.push_str(domain);
        if let Some(resource) = &resource {
            slash = NonZeroU16::new(normalized.len() as u16);
            normalized.push('/');
            normalized.push_str(resource);
        }

        Ok(Jid {
            normalized,
            at,
            slash,
        })
    }

    /// Build a JID from already prepped parts.
    pub fn from_parts(
        node: Option<&NodePart>,
        domain: &DomainPart,
        resource: Option<&ResourcePart>,
    ) -> Jid {
        let mut normalized = String::new();
        let mut at = None;
        let mut slash = None;
        if let Some(node) = node {
            normalized.push_str(node.as_str());
            at = NonZeroU16::new(normalized.len() as u16);
            normalized.push('@');
        }
        normalized.push_str(domain.as_str());
        if let Some(resource) = resource {
            slash = NonZeroU16::new(normalized.len() as u16);
            normalized.push('/');
            normalized.push_str(resource.as_str());
        }
        Jid {
            normalized,
            at,
            slash,
        }
    }

    /// The node part (the part before the `@`), if any.
    pub fn node(&self) -> Option<&str> {
        self.at.map(|at| &self.normalized[..at.get() as usize])
    }

    /// The domain part. Always present.
    pub fn domain(&self) -> &str {
        let start = self.at.map(|at| at.get() as usize + 1).unwrap_or(0);
        let end = self
            .slash
            .map(|slash| slash.get() as usize)
            .unwrap_or(self.normalized.len());
        &self.normalized[start..end]
    }

    /// The resource part (the part after the `/`), if any.
    pub fn resource(&self) -> Option<&str> {
        self.slash
            .map(|slash| &self.normalized[slash.get() as usize + 1..])
    }

    /// The normalized string representation.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Whether this JID carries a resource.
    pub fn is_full(&self) -> bool {
        self.slash.is_some()
    }

    /// Whether this JID has no resource.
    pub fn is_bare(&self) -> bool {
        self.slash.is_none()
    }

    /// The bare form of this JID, with any resource stripped.
    pub fn to_bare(&self) -> BareJid {
        match self.slash {
            None => BareJid {
                inner: self.clone(),
            },
            Some(slash) => BareJid {
                inner: Jid {
                    normalized: self.normalized[..slash.get() as usize].to_owned(),
                    at: self.at,
                    slash: None,
                },
            },
        }
    }

    /// Compare the bare parts of two JIDs, ignoring resources.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        let own_end = self
            .slash
            .map(|s| s.get() as usize)
            .unwrap_or(self.normalized.len());
        let other_end = other
            .slash
            .map(|s| s.get() as usize)
            .unwrap_or(other.normalized.len());
        self.normalized[..own_end] == other.normalized[..other_end]
    }

    /// Try to convert to a [`FullJid`]; fails when no resource is present.
    pub fn try_into_full(self) -> Result<FullJid, Error> {
        if self.is_full() {
            Ok(FullJid { inner: self })
        } else {
            Err(Error::ResourceMissingInFullJid)
        }
    }

    /// Replace or attach a resource.
    pub fn with_resource(&self, resource: &ResourcePart) -> FullJid {
        let bare = self.to_bare();
        let mut normalized = bare.inner.normalized;
        let slash = NonZeroU16::new(normalized.len() as u16);
        normalized.push('/');
        normalized.push_str(resource.as_str());
        FullJid {
            inner: Jid {
                normalized,
                at: self.at,
                slash,
            },
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Jid, Error> {
        Jid::new(s)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl fmt::Debug for Jid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Jid({})", self.normalized)
    }
}

impl PartialEq<str> for Jid {
    fn eq(&self, other: &str) -> bool {
        self.normalized == other
    }
}

#[cfg(feature = "serde")]
impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.normalized)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Jid::new(&s).map_err(de::Error::custom)
    }
}

macro_rules! wrapper_jid {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            inner: Jid,
        }

        impl $name {
            /// The node part (the part before the `@`), if any.
            pub fn node(&self) -> Option<&str> {
                self.inner.node()
            }

            /// The domain part. Always present.
            pub fn domain(&self) -> &str {
                self.inner.domain()
            }

            /// The normalized string representation.
            pub fn as_str(&self) -> &str {
                self.inner.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.inner, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.inner.normalized)
            }
        }

        impl From<$name> for Jid {
            fn from(other: $name) -> Jid {
                other.inner
            }
        }

        impl AsRef<Jid> for $name {
            fn as_ref(&self) -> &Jid {
                &self.inner
            }
        }

        impl PartialEq<Jid> for $name {
            fn eq(&self, other: &Jid) -> bool {
                &self.inner == other
            }
        }

        impl PartialEq<$name> for Jid {
            fn eq(&self, other: &$name) -> bool {
                self == &other.inner
            }
        }
    };
}

wrapper_jid!(
    /// A JID which is guaranteed to have no resource.
    BareJid
);
wrapper_jid!(
    /// A JID which is guaranteed to carry a resource.
    FullJid
);

impl BareJid {
    /// Parse a bare JID. Fails if the input carries a resource.
    pub fn new(s: &str) -> Result<BareJid, Error> {
        let jid = Jid::new(s)?;
        if jid.is_full() {
            return Err(Error::ResourceInBareJid);
        }
        Ok(BareJid { inner: jid })
    }

    /// Build a bare JID from prepped parts.
    pub fn from_parts(node: Option<&NodePart>, domain: &DomainPart) -> BareJid {
        BareJid {
            inner: Jid::from_parts(node, domain, None),
        }
    }

    /// Attach a resource, producing a full JID.
    pub fn with_resource(&self, resource: &ResourcePart) -> FullJid {
        self.inner.with_resource(resource)
    }
}

impl FromStr for BareJid {
    type Err = Error;

    fn from_str(s: &str) -> Result<BareJid, Error> {
        BareJid::new(s)
    }
}

impl FullJid {
    /// Parse a full JID. Fails if the input has no resource.
    pub fn new(s: &str) -> Result<FullJid, Error> {
        Jid::new(s)?.try_into_full()
    }

    /// The resource part.
    pub fn resource(&self) -> &str {
        // Unwrap: presence of the resource is this type's invariant.
        self.inner.resource().unwrap()
    }

    /// The bare form of this JID.
    pub fn to_bare(&self) -> BareJid {
        self.inner.to_bare()
    }
}

impl FromStr for FullJid {
    type Err = Error;

    fn from_str(s: &str) -> Result<FullJid, Error> {
        FullJid::new(s)
    }
}

impl TryFrom<Jid> for FullJid {
    type Error = Error;

    fn try_from(jid: Jid) -> Result<FullJid, Error> {
        jid.try_into_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_shapes() {
        let jid = Jid::new("node@example.org/res").unwrap();
        assert_eq!(jid.node(), Some("node"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("res"));

        let jid = Jid::new("node@example.org").unwrap();
        assert_eq!(jid.node(), Some("node"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), None);

        let jid = Jid::new("example.org/res").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("res"));

        let jid = Jid::new("example.org").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn at_inside_resource_is_not_a_separator() {
        let jid = Jid::new("example.org/foo@bar").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("foo@bar"));
    }

    #[test]
    fn node_and_domain_are_case_folded() {
        let a = Jid::new("Romeo@Example.ORG/Balcony").unwrap();
        let b = Jid::new("romeo@example.org/Balcony").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "romeo@example.org/Balcony");

        // The resource stays case-sensitive.
        let c = Jid::new("romeo@example.org/balcony").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn bare_comparison_ignores_resources() {
        let a = Jid::new("juliet@example.org/chamber").unwrap();
        let b = Jid::new("juliet@example.org/garden").unwrap();
        assert!(a.bare_eq(&b));
        assert_eq!(a.to_bare(), b.to_bare());
        assert!(!a.bare_eq(&Jid::new("romeo@example.org").unwrap()));
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(Jid::new("@example.org"), Err(Error::NodeEmpty));
        assert_eq!(Jid::new("example.org/"), Err(Error::ResourceEmpty));
        assert_eq!(Jid::new(""), Err(Error::DomainEmpty));
        assert_eq!(Jid::new("node@/res"), Err(Error::DomainEmpty));
    }

    #[test]
    fn length_limits() {
        let node = "x".repeat(1024);
        assert_eq!(
            Jid::new(&format!("{node}@example.org")),
            Err(Error::NodeTooLong)
        );
        let giant = "x".repeat(3100);
        assert_eq!(Jid::new(&giant), Err(Error::JidTooLong));
    }

    #[test]
    fn full_and_bare_wrappers() {
        let full = FullJid::new("a@b.example/c").unwrap();
        assert_eq!(full.resource(), "c");
        assert_eq!(full.to_bare().as_str(), "a@b.example");
        assert!(FullJid::new("a@b.example").is_err());
        assert!(BareJid::new("a@b.example/c").is_err());
    }

    #[test]
    fn with_resource_replaces() {
        let jid = Jid::new("a@b.example/old").unwrap();
        let resource = ResourcePart::new("new").unwrap();
        assert_eq!(jid.with_resource(&resource).as_str(), "a@b.example/new");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        use serde_test::{assert_tokens, Token};
        let jid = Jid::new("node@example.org/res").unwrap();
        assert_tokens(&jid, &[Token::Str("node@example.org/res")]);
    }
}
