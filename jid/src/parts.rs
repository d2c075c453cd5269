// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use core::str::FromStr;

use stringprep::{nameprep, nodeprep, resourceprep};

use crate::Error;

macro_rules! part {
    ($(#[$meta:meta])* $name:ident, $prep:ident, $prep_err:expr, $empty:expr, $too_long:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            /// Prepare and validate the given string as this part.
            pub fn new(s: &str) -> Result<$name, Error> {
                let prepped = $prep(s).map_err(|_| $prep_err)?;
                if prepped.is_empty() {
                    return Err($empty);
                }
                if prepped.len() > 1023 {
                    return Err($too_long);
                }
                Ok($name(prepped.into_owned()))
            }

            /// The prepared string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<$name, Error> {
                $name::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

part!(
    /// The node part of a JID, prepared with nodeprep.
    NodePart,
    nodeprep,
    Error::NodePrep,
    Error::NodeEmpty,
    Error::NodeTooLong
);
part!(
    /// The domain part of a JID, prepared with nameprep.
    DomainPart,
    nameprep,
    Error::NamePrep,
    Error::DomainEmpty,
    Error::DomainTooLong
);
part!(
    /// The resource part of a JID, prepared with resourceprep.
    ResourcePart,
    resourceprep,
    Error::ResourcePrep,
    Error::ResourceEmpty,
    Error::ResourceTooLong
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_prepped() {
        assert_eq!(NodePart::new("Romeo").unwrap().as_str(), "romeo");
        assert_eq!(DomainPart::new("EXAMPLE.org").unwrap().as_str(), "example.org");
        assert_eq!(ResourcePart::new("Balcony").unwrap().as_str(), "Balcony");
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(NodePart::new(""), Err(Error::NodeEmpty));
        assert_eq!(ResourcePart::new(""), Err(Error::ResourceEmpty));
    }
}
