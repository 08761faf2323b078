//! Parsing of Python distribution file names: wheels per
//! [PEP 427](https://peps.python.org/pep-0427/) and source distributions per
//! [PEP 625](https://peps.python.org/pep-0625/).

pub use crate::build_tag::{BuildTag, BuildTagError};
pub use crate::source_dist::{SourceDistExtension, SourceDistFilename, SourceDistFilenameError};
pub use crate::wheel::{WheelFilename, WheelFilenameError};

mod build_tag;
mod source_dist;
mod wheel;

use fromager_normalize::PackageName;
use fromager_pep440::Version;

/// A wheel or source distribution filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistFilename {
    SourceDistFilename(SourceDistFilename),
    WheelFilename(WheelFilename),
}

impl DistFilename {
    /// Parse a filename as either kind of distribution of the given package.
    ///
    /// Returns `None` for filenames of other packages or unrecognized
    /// formats, the lenient behavior the simple-index candidate loop needs.
    pub fn try_from_filename(filename: &str, package_name: &PackageName) -> Option<Self> {
        if filename.ends_with(".whl") {
            WheelFilename::from_str_checked(filename, package_name)
                .ok()
                .map(Self::WheelFilename)
        } else {
            SourceDistFilename::parse(filename, package_name)
                .ok()
                .map(Self::SourceDistFilename)
        }
    }

    pub fn name(&self) -> &PackageName {
        match self {
            Self::SourceDistFilename(filename) => &filename.name,
            Self::WheelFilename(filename) => &filename.name,
        }
    }

    pub fn version(&self) -> &Version {
        match self {
            Self::SourceDistFilename(filename) => &filename.version,
            Self::WheelFilename(filename) => &filename.version,
        }
    }

    pub fn is_sdist(&self) -> bool {
        matches!(self, Self::SourceDistFilename(_))
    }
}
