//! A library for python version numbers and specifiers, implementing
//! [PEP 440](https://peps.python.org/pep-0440).
//!
//! ```rust
//! use std::str::FromStr;
//! use fromager_pep440::{Version, VersionSpecifiers};
//!
//! let version = Version::from_str("1.19").unwrap();
//! let specifiers = VersionSpecifiers::from_str(">=1.16, <2.0").unwrap();
//! assert!(specifiers.contains(&version));
//! ```

pub use crate::version::{
    LocalSegment, Prerelease, PrereleaseKind, Version, VersionParseError,
};
pub use crate::version_specifier::{
    Operator, VersionSpecifier, VersionSpecifierParseError, VersionSpecifiers,
};

mod version;
mod version_specifier;
