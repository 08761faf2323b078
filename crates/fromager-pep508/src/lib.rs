//! A library for python dependency specifiers, better known as
//! [PEP 508](https://peps.python.org/pep-0508/).
//!
//! ```rust
//! use std::str::FromStr;
//! use fromager_pep508::Requirement;
//!
//! let req = Requirement::from_str("requests[security]>=2.26; python_version > '3.7'").unwrap();
//! assert_eq!(req.name.as_str(), "requests");
//! ```

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use fromager_normalize::{ExtraName, PackageName};
use fromager_pep440::VersionSpecifiers;

pub use crate::marker::{
    MarkerEnvironment, MarkerExpression, MarkerOperator, MarkerTree, MarkerValue, MarkerValueKey,
};

mod cursor;
mod marker;

use crate::cursor::Cursor;

/// A parse error with the offending input and position.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at position {pos}: `{input}`")]
pub struct Pep508Error {
    input: String,
    pos: usize,
    message: String,
}

impl Pep508Error {
    pub(crate) fn new(input: &str, pos: usize, message: &str) -> Self {
        Self {
            input: input.to_string(),
            pos,
            message: message.to_string(),
        }
    }
}

/// A PEP 508 dependency specifier, e.g.
/// `requests[security,tests] >= 2.8.1, == 2.8.* ; python_version > "3.8"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Requirement {
    /// The normalized name of the distribution.
    pub name: PackageName,
    /// The requested extras, normalized.
    pub extras: Vec<ExtraName>,
    /// The version constraints; empty when unconstrained.
    pub specifiers: VersionSpecifiers,
    /// A direct reference, e.g. `name @ https://…`; mutually exclusive with
    /// non-empty specifiers.
    pub url: Option<Url>,
    /// The environment marker, if any.
    pub marker: Option<MarkerTree>,
}

impl Requirement {
    /// A bare requirement on the given name.
    pub fn new(name: PackageName) -> Self {
        Self {
            name,
            extras: Vec::new(),
            specifiers: VersionSpecifiers::empty(),
            url: None,
            marker: None,
        }
    }

    /// `name==version` as a requirement, the shape used for exact-pin
    /// re-resolution.
    pub fn pinned(name: PackageName, version: &fromager_pep440::Version) -> Self {
        Self {
            name,
            extras: Vec::new(),
            specifiers: fromager_pep440::VersionSpecifier::equals_version(version.clone()).into(),
            url: None,
            marker: None,
        }
    }

    /// The extras sorted and deduplicated, the canonical form used for seen
    /// keys.
    pub fn sorted_extras(&self) -> Vec<ExtraName> {
        let set: BTreeSet<_> = self.extras.iter().cloned().collect();
        set.into_iter().collect()
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[")?;
            let mut first = true;
            for extra in &self.extras {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{extra}")?;
                first = false;
            }
            write!(f, "]")?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {url}")?;
        } else if !self.specifiers.is_empty() {
            write!(f, "{}", self.specifiers)?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = Pep508Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_requirement(&mut Cursor::new(input), input)
    }
}

impl Serialize for Requirement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

fn parse_requirement(cursor: &mut Cursor, input: &str) -> Result<Requirement, Pep508Error> {
    cursor.eat_whitespace();

    // Name
    let (start, len) = cursor.take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if len == 0 {
        return Err(Pep508Error::new(input, start, "expected a package name"));
    }
    let name = PackageName::new(cursor.slice(start, len))
        .map_err(|err| Pep508Error::new(input, start, &err.to_string()))?;

    // Extras
    let mut extras = Vec::new();
    cursor.eat_whitespace();
    if cursor.eat_char('[') {
        loop {
            cursor.eat_whitespace();
            let (start, len) =
                cursor.take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if len == 0 {
                return Err(Pep508Error::new(input, start, "expected an extra name"));
            }
            let extra = ExtraName::new(cursor.slice(start, len))
                .map_err(|err| Pep508Error::new(input, start, &err.to_string()))?;
            extras.push(extra);
            cursor.eat_whitespace();
            if cursor.eat_char(',') {
                continue;
            }
            if cursor.eat_char(']') {
                break;
            }
            return Err(Pep508Error::new(
                input,
                cursor.pos(),
                "expected `,` or `]` in extras",
            ));
        }
    }

    // Version specifiers or URL
    cursor.eat_whitespace();
    let mut url = None;
    let mut specifiers = VersionSpecifiers::empty();
    if cursor.eat_char('@') {
        cursor.eat_whitespace();
        let (start, len) = cursor.take_while(|c| !c.is_whitespace() && c != ';');
        let raw = cursor.slice(start, len);
        url = Some(
            Url::parse(raw).map_err(|err| Pep508Error::new(input, start, &err.to_string()))?,
        );
    } else {
        let mut specifier_part = cursor.take_while(|c| c != ';');
        // Parenthesized specifiers, e.g. `name (>=1.0)`, are legacy but legal.
        let mut raw = cursor.slice(specifier_part.0, specifier_part.1).trim();
        if let Some(stripped) = raw.strip_prefix('(') {
            raw = stripped.strip_suffix(')').unwrap_or(stripped);
            specifier_part.0 += 1;
        }
        if !raw.is_empty() {
            specifiers = VersionSpecifiers::from_str(raw)
                .map_err(|err| Pep508Error::new(input, specifier_part.0, &err.to_string()))?;
        }
    }

    // Marker
    let marker = if cursor.eat_char(';') {
        cursor.eat_whitespace();
        let tree = marker::parse_marker_or(cursor)?;
        cursor.eat_whitespace();
        if !cursor.at_end() {
            return Err(Pep508Error::new(
                input,
                cursor.pos(),
                "unexpected trailing characters after marker",
            ));
        }
        Some(tree)
    } else {
        cursor.eat_whitespace();
        if !cursor.at_end() {
            return Err(Pep508Error::new(
                input,
                cursor.pos(),
                "unexpected trailing characters",
            ));
        }
        None
    };

    Ok(Requirement {
        name,
        extras,
        specifiers,
        url,
        marker,
    })
}

/// Whether `req` applies in the context of `parent`.
///
/// Returns true if `req` carries no marker, or if its marker evaluates true
/// under `env`, trying each of `parent.extras ∪ extras` as the `extra`
/// variable (any single match suffices). A marker that references `extra`
/// with no extras supplied is evaluated with `extra` unset.
pub fn evaluate_marker(
    env: &MarkerEnvironment,
    parent: &Requirement,
    req: &Requirement,
    extras: &[ExtraName],
) -> bool {
    let Some(marker) = &req.marker else {
        return true;
    };
    let mut candidates: BTreeSet<ExtraName> = parent.extras.iter().cloned().collect();
    candidates.extend(extras.iter().cloned());
    if candidates.is_empty() {
        return marker.evaluate(env, None);
    }
    candidates
        .iter()
        .any(|extra| marker.evaluate(env, Some(extra)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    fn env() -> MarkerEnvironment {
        MarkerEnvironment::for_python("3.11.4")
    }

    #[test]
    fn parse_name_only() {
        let r = req("requests");
        assert_eq!(r.name.as_str(), "requests");
        assert!(r.extras.is_empty());
        assert!(r.specifiers.is_empty());
        assert!(r.marker.is_none());
    }

    #[test]
    fn parse_full() {
        let r = req("requests [security,tests] >= 2.8.1, == 2.8.* ; python_version > '3.8'");
        assert_eq!(r.name.as_str(), "requests");
        assert_eq!(
            r.extras,
            vec![
                ExtraName::new("security").unwrap(),
                ExtraName::new("tests").unwrap()
            ]
        );
        assert_eq!(r.specifiers.to_string(), ">=2.8.1,==2.8.*");
        assert!(r.marker.is_some());
    }

    #[test]
    fn parse_url() {
        let r = req("pip @ https://github.com/pypa/pip/archive/22.0.2.zip");
        assert_eq!(
            r.url.unwrap().as_str(),
            "https://github.com/pypa/pip/archive/22.0.2.zip"
        );
    }

    #[test]
    fn parse_parenthesized() {
        let r = req("name (>=3)");
        assert_eq!(r.specifiers.to_string(), ">=3");
    }

    #[test]
    fn parse_normalizes_name() {
        assert_eq!(req("Flask_SQLAlchemy").name.as_str(), "flask-sqlalchemy");
    }

    #[test]
    fn parse_errors() {
        assert!(Requirement::from_str("").is_err());
        assert!(Requirement::from_str("name[").is_err());
        assert!(Requirement::from_str("name==1.0 garbage").is_err());
    }

    #[test]
    fn display_round_trip() {
        for s in [
            "requests",
            "requests[security]>=2.26",
            "name; python_version >= '3.8'",
        ] {
            assert_eq!(req(s).to_string(), s);
        }
    }

    #[test]
    fn marker_filtering_on_extras() {
        // Parent `a[b-c]`, child `d; extra == "b_c"`: canonicalized extras
        // match.
        let parent = req("a[b-c]");
        let child = req("d; extra == 'b_c'");
        assert!(evaluate_marker(&env(), &parent, &child, &[]));

        let unrelated = req("d; extra == 'other'");
        assert!(!evaluate_marker(&env(), &parent, &unrelated, &[]));
    }

    #[test]
    fn marker_absent_is_true() {
        let parent = req("a");
        assert!(evaluate_marker(&env(), &parent, &req("d"), &[]));
    }

    #[test]
    fn marker_with_supplied_extras() {
        let parent = req("a");
        let child = req("d; extra == 'cuda'");
        let cuda = ExtraName::new("cuda").unwrap();
        assert!(evaluate_marker(&env(), &parent, &child, &[cuda]));
        assert!(!evaluate_marker(&env(), &parent, &child, &[]));
    }

    #[test]
    fn marker_environment_only() {
        let parent = req("a");
        let child = req("d; python_version < '3.0'");
        assert!(!evaluate_marker(&env(), &parent, &child, &[]));
    }

    #[test]
    fn sorted_extras_dedup() {
        let r = req("a[z,b,z]");
        let sorted = r.sorted_extras();
        assert_eq!(
            sorted,
            vec![ExtraName::new("b").unwrap(), ExtraName::new("z").unwrap()]
        );
    }
}
