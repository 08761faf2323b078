use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildTagError {
    #[error("must not be empty")]
    Empty,
    #[error("must start with a digit")]
    NoLeadingDigit,
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

/// The optional build tag for a wheel:
///
/// > Must start with a digit. Acts as a tie-breaker if two wheel file names
/// > are the same in all other respects (i.e. name, version, and other tags).
/// > Sort as an empty tuple if unspecified, else sort as a two-item tuple
/// > with the first item being the initial digits as an int, and the second
/// > item being the remainder of the tag as a str.
///
/// The empty tuple is represented as `Option::<BuildTag>::None` at use sites.
///
/// See: <https://packaging.python.org/en/latest/specifications/binary-distribution-format/#file-name-convention>
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct BuildTag(u64, Option<String>);

impl BuildTag {
    pub fn new(number: u64, suffix: Option<String>) -> Self {
        Self(number, suffix)
    }

    pub fn number(&self) -> u64 {
        self.0
    }

    pub fn suffix(&self) -> Option<&str> {
        self.1.as_deref()
    }
}

impl Display for BuildTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.1 {
            Some(suffix) => write!(f, "{}{}", self.0, suffix),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for BuildTag {
    type Err = BuildTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A build tag must not be empty.
        if s.is_empty() {
            return Err(BuildTagError::Empty);
        }

        // A build tag must start with a digit.
        let (prefix, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
            // Ex) `abc`
            Some(0) => return Err(BuildTagError::NoLeadingDigit),
            // Ex) `123abc`
            Some(split) => {
                let (prefix, suffix) = s.split_at(split);
                (prefix, Some(suffix))
            }
            // Ex) `123`
            None => (s, None),
        };

        Ok(BuildTag(prefix.parse::<u64>()?, suffix.map(String::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(BuildTag::from_str("2").unwrap(), BuildTag::new(2, None));
        assert_eq!(
            BuildTag::from_str("202206090410").unwrap(),
            BuildTag::new(202206090410, None)
        );
        assert_eq!(
            BuildTag::from_str("3rc1").unwrap(),
            BuildTag::new(3, Some("rc1".to_string()))
        );
    }

    #[test]
    fn errors() {
        assert_eq!(BuildTag::from_str("").unwrap_err(), BuildTagError::Empty);
        assert_eq!(
            BuildTag::from_str("abc").unwrap_err(),
            BuildTagError::NoLeadingDigit
        );
    }

    #[test]
    fn ordering() {
        assert!(BuildTag::from_str("2").unwrap() < BuildTag::from_str("10").unwrap());
        assert!(BuildTag::from_str("2").unwrap() < BuildTag::from_str("2a").unwrap());
    }
}
