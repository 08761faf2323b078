use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::version::{Version, VersionParseError};

/// One of `~=` `==` `!=` `<=` `>=` `<` `>` `===`, including the `.*` wildcard
/// forms of `==` and `!=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    /// `== 1.2.3`
    Equal,
    /// `== 1.2.*`
    EqualStar,
    /// `===` (discouraged)
    ///
    /// <https://peps.python.org/pep-0440/#arbitrary-equality>
    ExactEqual,
    /// `!= 1.2.3`
    NotEqual,
    /// `!= 1.2.*`
    NotEqualStar,
    /// `~=`
    TildeEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanEqual,
}

impl Operator {
    /// Returns `true` if this operator represents a wildcard.
    pub fn is_star(self) -> bool {
        matches!(self, Self::EqualStar | Self::NotEqualStar)
    }
}

impl FromStr for Operator {
    type Err = OperatorParseError;

    /// Notably, this does not know about star versions, it just assumes the
    /// base operator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let operator = match s {
            "==" => Self::Equal,
            "===" => Self::ExactEqual,
            "!=" => Self::NotEqual,
            "~=" => Self::TildeEqual,
            "<" => Self::LessThan,
            "<=" => Self::LessThanEqual,
            ">" => Self::GreaterThan,
            ">=" => Self::GreaterThanEqual,
            other => {
                return Err(OperatorParseError {
                    got: other.to_string(),
                })
            }
        };
        Ok(operator)
    }
}

impl Display for Operator {
    /// Note the `EqualStar` is also `==`; the star is printed with the
    /// version.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let operator = match self {
            Self::Equal | Self::EqualStar => "==",
            Self::ExactEqual => "===",
            Self::NotEqual | Self::NotEqualStar => "!=",
            Self::TildeEqual => "~=",
            Self::LessThan => "<",
            Self::LessThanEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanEqual => ">=",
        };
        write!(f, "{operator}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no such comparison operator \"{got}\", must be one of ~= == != <= >= < > ===")]
pub struct OperatorParseError {
    got: String,
}

/// A single version specifier such as `>=1.19` or `== 1.1.*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionSpecifier {
    operator: Operator,
    version: Version,
}

impl VersionSpecifier {
    /// Build a specifier from parts, converting `==`/`!=` into their star
    /// forms when requested.
    pub fn new(
        operator: Operator,
        version: Version,
        star: bool,
    ) -> Result<Self, VersionSpecifierParseError> {
        let operator = if star {
            match operator {
                Operator::Equal => Operator::EqualStar,
                Operator::NotEqual => Operator::NotEqualStar,
                other => {
                    return Err(VersionSpecifierParseError::InvalidStar(other));
                }
            }
        } else {
            operator
        };
        if operator == Operator::TildeEqual && version.release().len() < 2 {
            return Err(VersionSpecifierParseError::TildeEqualTooShort(
                version.to_string(),
            ));
        }
        Ok(Self { operator, version })
    }

    /// Shorthand for `== version`.
    pub fn equals_version(version: Version) -> Self {
        Self {
            operator: Operator::Equal,
            version,
        }
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether the given version satisfies this specifier.
    ///
    /// Implements the exclusion rules of PEP 440's ordered comparisons:
    /// `>V` does not match post-releases or local versions of `V`'s base,
    /// and `<V` does not match pre-releases of `V`'s base.
    pub fn contains(&self, version: &Version) -> bool {
        match self.operator {
            Operator::Equal => {
                if self.version.is_local() {
                    version.cmp(&self.version) == Ordering::Equal
                } else {
                    // A specifier without a local segment matches any local
                    // variant of the pinned version.
                    version.without_local().cmp(&self.version) == Ordering::Equal
                }
            }
            Operator::EqualStar => starts_with(version, &self.version),
            Operator::ExactEqual => version.to_string() == self.version.to_string(),
            Operator::NotEqual => {
                !Self {
                    operator: Operator::Equal,
                    version: self.version.clone(),
                }
                .contains(version)
            }
            Operator::NotEqualStar => !starts_with(version, &self.version),
            Operator::TildeEqual => {
                // `~= 2.2` is `>= 2.2, == 2.*`.
                if version.without_local() < self.version {
                    return false;
                }
                if version.epoch() != self.version.epoch() {
                    return false;
                }
                let prefix = &self.version.release()[..self.version.release().len() - 1];
                prefix.iter().enumerate().all(|(index, segment)| {
                    version.release().get(index).copied().unwrap_or_default() == *segment
                })
            }
            Operator::LessThan => {
                if version >= &self.version {
                    return false;
                }
                // `< V` must not match pre-releases of V's base unless V is
                // itself a pre-release.
                if !self.version.is_prerelease()
                    && version.is_prerelease()
                    && version.base_version() == self.version.base_version()
                {
                    return false;
                }
                true
            }
            Operator::LessThanEqual => version.without_local() <= self.version,
            Operator::GreaterThan => {
                if version <= &self.version {
                    return false;
                }
                if version.base_version() == self.version.base_version() {
                    // `> V` must not match post-releases or local versions of
                    // V's base unless V is itself a post-release.
                    if !self.version.is_postrelease() && version.is_postrelease() {
                        return false;
                    }
                    if version.is_local() {
                        return false;
                    }
                }
                true
            }
            Operator::GreaterThanEqual => version.without_local() >= self.version,
        }
    }
}

/// Wildcard match: the candidate's epoch and leading release segments equal
/// the specifier's, ignoring everything after.
fn starts_with(version: &Version, spec: &Version) -> bool {
    if version.epoch() != spec.epoch() {
        return false;
    }
    let release = version.release();
    spec.release().iter().enumerate().all(|(index, segment)| {
        release.get(index).copied().unwrap_or_default() == *segment
    })
}

impl Display for VersionSpecifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.operator.is_star() {
            write!(f, "{}{}.*", self.operator, self.version)
        } else {
            write!(f, "{}{}", self.operator, self.version)
        }
    }
}

impl FromStr for VersionSpecifier {
    type Err = VersionSpecifierParseError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let operator_len = spec
            .bytes()
            .take_while(|b| matches!(b, b'=' | b'!' | b'~' | b'<' | b'>'))
            .count();
        if operator_len == 0 {
            return Err(VersionSpecifierParseError::MissingOperator(
                spec.to_string(),
            ));
        }
        let operator = Operator::from_str(&spec[..operator_len])
            .map_err(VersionSpecifierParseError::InvalidOperator)?;
        let version_part = spec[operator_len..].trim();
        let (version_part, star) = match version_part.strip_suffix(".*") {
            Some(stripped) => (stripped, true),
            None => (version_part, false),
        };
        let version = Version::from_str(version_part)
            .map_err(|err| VersionSpecifierParseError::InvalidVersion(spec.to_string(), err))?;
        Self::new(operator, version, star)
    }
}

impl Serialize for VersionSpecifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionSpecifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionSpecifierParseError {
    #[error("specifier `{0}` is missing a comparison operator")]
    MissingOperator(String),
    #[error(transparent)]
    InvalidOperator(OperatorParseError),
    #[error("specifier `{0}` has an invalid version: {1}")]
    InvalidVersion(String, VersionParseError),
    #[error("operator {0} cannot be combined with a `.*` suffix")]
    InvalidStar(Operator),
    #[error("the ~= operator requires at least two release segments, got `{0}`")]
    TildeEqualTooShort(String),
}

/// A comma-separated conjunction of version specifiers, e.g. `>=1.16, <2.0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionSpecifiers(Vec<VersionSpecifier>);

impl VersionSpecifiers {
    /// The empty set, which matches every (non-pre-release) version.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionSpecifier> {
        self.0.iter()
    }

    /// Whether the given version satisfies every specifier, excluding
    /// pre-releases unless the set itself pins one.
    pub fn contains(&self, version: &Version) -> bool {
        self.contains_with_prereleases(version, false)
    }

    /// Like [`Self::contains`], with an explicit pre-release opt-in.
    ///
    /// Pre-releases are admitted when the caller allows them or when any
    /// member specifier mentions a pre-release version.
    pub fn contains_with_prereleases(&self, version: &Version, allow_prerelease: bool) -> bool {
        if version.is_prerelease() && !(allow_prerelease || self.prereleases_allowed()) {
            return false;
        }
        self.0.iter().all(|specifier| specifier.contains(version))
    }

    /// Whether any member specifier explicitly mentions a pre-release.
    pub fn prereleases_allowed(&self) -> bool {
        self.0
            .iter()
            .any(|specifier| specifier.version().is_prerelease())
    }
}

impl From<VersionSpecifier> for VersionSpecifiers {
    fn from(specifier: VersionSpecifier) -> Self {
        Self(vec![specifier])
    }
}

impl FromIterator<VersionSpecifier> for VersionSpecifiers {
    fn from_iter<T: IntoIterator<Item = VersionSpecifier>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for VersionSpecifiers {
    type Err = VersionSpecifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::empty());
        }
        s.split(',')
            .map(VersionSpecifier::from_str)
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl Display for VersionSpecifiers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for specifier in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{specifier}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for VersionSpecifiers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionSpecifiers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn specifier(s: &str) -> VersionSpecifier {
        VersionSpecifier::from_str(s).unwrap()
    }

    fn specifiers(s: &str) -> VersionSpecifiers {
        VersionSpecifiers::from_str(s).unwrap()
    }

    #[test]
    fn equal_pads() {
        assert!(specifier("==1.0").contains(&version("1.0.0")));
        assert!(specifier("== 1.2.3").contains(&version("1.2.3")));
        assert!(!specifier("==1.2.3").contains(&version("1.2.4")));
    }

    #[test]
    fn equal_ignores_candidate_local() {
        assert!(specifier("==1.0").contains(&version("1.0+local")));
        assert!(specifier("==1.0+local").contains(&version("1.0+local")));
        assert!(!specifier("==1.0+other").contains(&version("1.0+local")));
    }

    #[test]
    fn star() {
        let spec = specifier("==1.1.*");
        assert!(spec.contains(&version("1.1")));
        assert!(spec.contains(&version("1.1.9")));
        assert!(spec.contains(&version("1.1rc1")));
        assert!(!spec.contains(&version("1.2")));
        assert!(specifier("!=1.1.*").contains(&version("1.2")));
    }

    #[test]
    fn tilde_equal() {
        let spec = specifier("~=2.2");
        assert!(spec.contains(&version("2.2")));
        assert!(spec.contains(&version("2.9")));
        assert!(!spec.contains(&version("3.0")));
        assert!(!spec.contains(&version("2.1")));

        let spec = specifier("~=1.4.5");
        assert!(spec.contains(&version("1.4.9")));
        assert!(!spec.contains(&version("1.5.0")));
        assert!(VersionSpecifier::from_str("~=2").is_err());
    }

    #[test]
    fn ordered_excludes_prerelease_of_base() {
        assert!(!specifier("<1.0").contains(&version("1.0rc1")));
        assert!(specifier("<1.0rc2").contains(&version("1.0rc1")));
        assert!(specifier("<1.1").contains(&version("1.0")));
    }

    #[test]
    fn ordered_excludes_post_of_base() {
        assert!(!specifier(">1.0").contains(&version("1.0.post1")));
        assert!(specifier(">1.0.post1").contains(&version("1.0.post2")));
        assert!(specifier(">1.0").contains(&version("1.1")));
        assert!(!specifier(">1.0").contains(&version("1.0+local")));
    }

    #[test]
    fn set_conjunction() {
        let specs = specifiers(">=1.16, <2.0");
        assert!(specs.contains(&version("1.19")));
        assert!(!specs.contains(&version("2.0")));
        assert!(!specs.contains(&version("1.15")));
    }

    #[test]
    fn set_excludes_prereleases_by_default() {
        let specs = specifiers(">=1.0");
        assert!(!specs.contains(&version("2.0rc1")));
        assert!(specs.contains_with_prereleases(&version("2.0rc1"), true));
    }

    #[test]
    fn set_with_prerelease_pin_allows_them() {
        let specs = specifiers("==2.0rc1");
        assert!(specs.prereleases_allowed());
        assert!(specs.contains(&version("2.0rc1")));
    }

    #[test]
    fn display_round_trip() {
        for s in ["==1.2.3", ">=1.16,<2.0", "==1.1.*", "~=2.2", "===1.0"] {
            assert_eq!(specifiers(s).to_string(), s);
        }
    }

    #[test]
    fn empty_set_matches_all_final() {
        let specs = VersionSpecifiers::empty();
        assert!(specs.contains(&version("1.0")));
        assert!(!specs.contains(&version("1.0rc1")));
    }
}
