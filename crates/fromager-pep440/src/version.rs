use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The kind of a pre-release segment: `a`, `b`, or `rc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrereleaseKind {
    /// alpha release, spelled `a`, `alpha`
    Alpha,
    /// beta release, spelled `b`, `beta`
    Beta,
    /// release candidate, spelled `rc`, `c`, `pre`, `preview`
    Rc,
}

impl Display for PrereleaseKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alpha => write!(f, "a"),
            Self::Beta => write!(f, "b"),
            Self::Rc => write!(f, "rc"),
        }
    }
}

/// A pre-release segment, e.g. the `rc1` of `1.2.3rc1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prerelease {
    pub kind: PrereleaseKind,
    pub number: u64,
}

impl Display for Prerelease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind, self.number)
    }
}

/// One segment of a local version identifier, e.g. `ubuntu` or `1` of
/// `1.0+ubuntu.1`.
///
/// Numeric segments compare greater than string segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalSegment {
    /// Compared lexically, lowest.
    String(String),
    /// Compared numerically, highest.
    Number(u64),
}

impl Display for LocalSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(string) => write!(f, "{string}"),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

/// A PEP 440 version, such as `1.19`, `2!1.0.dev1` or `22.0rc2.post3+g1234`.
///
/// Equality and ordering follow PEP 440: `1.0` equals `1.0.0`, pre-releases
/// sort before the final release, dev releases before pre-releases, and
/// post-releases after.
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<Prerelease>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Vec<LocalSegment>,
}

impl Version {
    /// Construct a final release from its release segments, e.g.
    /// `Version::new([3, 12])` for `3.12`.
    pub fn new(release: impl IntoIterator<Item = u64>) -> Self {
        Self {
            epoch: 0,
            release: release.into_iter().collect(),
            pre: None,
            post: None,
            dev: None,
            local: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre(&self) -> Option<Prerelease> {
        self.pre
    }

    pub fn post(&self) -> Option<u64> {
        self.post
    }

    pub fn dev(&self) -> Option<u64> {
        self.dev
    }

    pub fn local(&self) -> &[LocalSegment] {
        &self.local
    }

    /// Whether this version has a pre-release or dev segment.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// Whether this version has a post-release segment.
    pub fn is_postrelease(&self) -> bool {
        self.post.is_some()
    }

    /// Whether this version has a local segment.
    pub fn is_local(&self) -> bool {
        !self.local.is_empty()
    }

    /// The version without pre/post/dev/local segments, e.g. `1.2.3` for
    /// `1.2.3rc1.post2+local`.
    pub fn base_version(&self) -> Version {
        Self {
            epoch: self.epoch,
            release: self.release.clone(),
            pre: None,
            post: None,
            dev: None,
            local: Vec::new(),
        }
    }

    /// The version without its local segment.
    pub fn without_local(&self) -> Version {
        Self {
            local: Vec::new(),
            ..self.clone()
        }
    }

    /// Release segments without trailing zeroes, the canonical form for
    /// equality and hashing.
    fn trimmed_release(&self) -> &[u64] {
        let mut end = self.release.len();
        while end > 1 && self.release[end - 1] == 0 {
            end -= 1;
        }
        &self.release[..end]
    }

    /// Sort key for the pre/post/dev suffix, per `packaging._cmpkey`:
    /// a dev release without pre and post sorts before everything, a
    /// pre-release before the plain release, the plain release before
    /// post-releases.
    fn pre_key(&self) -> (u8, u8, u64) {
        match self.pre {
            Some(pre) => (1, pre.kind as u8, pre.number),
            None if self.post.is_none() && self.dev.is_some() => (0, 0, 0),
            None => (2, 0, 0),
        }
    }

    fn post_key(&self) -> (u8, u64) {
        match self.post {
            Some(post) => (1, post),
            None => (0, 0),
        }
    }

    fn dev_key(&self) -> (u8, u64) {
        match self.dev {
            Some(dev) => (0, dev),
            None => (1, 0),
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_release(&self.release, &other.release))
            .then_with(|| self.pre_key().cmp(&other.pre_key()))
            .then_with(|| self.post_key().cmp(&other.post_key()))
            .then_with(|| self.dev_key().cmp(&other.dev_key()))
            .then_with(|| self.local.cmp(&other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.epoch.hash(state);
        self.trimmed_release().hash(state);
        self.pre.hash(state);
        self.post.hash(state);
        self.dev.hash(state);
        self.local.hash(state);
    }
}

/// Compare release segments, padding the shorter sequence with zeroes.
fn compare_release(this: &[u64], other: &[u64]) -> Ordering {
    for index in 0..this.len().max(other.len()) {
        let left = this.get(index).copied().unwrap_or_default();
        let right = other.get(index).copied().unwrap_or_default();
        match left.cmp(&right) {
            Ordering::Equal => {}
            ordering => return ordering,
        }
    }
    Ordering::Equal
}

impl Display for Version {
    /// The normalized form per PEP 440, e.g. `1!1.2.3rc4.post5.dev6+deadbeef`.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let mut first = true;
        for segment in &self.release {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        if let Some(pre) = self.pre {
            write!(f, "{pre}")?;
        }
        if let Some(post) = self.post {
            write!(f, ".post{post}")?;
        }
        if let Some(dev) = self.dev {
            write!(f, ".dev{dev}")?;
        }
        if !self.local.is_empty() {
            write!(f, "+")?;
            let mut first = true;
            for segment in &self.local {
                if !first {
                    write!(f, ".")?;
                }
                write!(f, "{segment}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        Parser::new(version).parse()
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("expected version to start with a number, but no leading ASCII digits were found")]
    NoLeadingNumber,
    #[error("version is empty")]
    Empty,
    #[error("invalid number in version `{0}`")]
    InvalidNumber(String),
    #[error("unexpected trailing characters `{1}` in version `{0}`")]
    TrailingCharacters(String, String),
    #[error("local segment of `{0}` is empty or malformed")]
    InvalidLocal(String),
}

/// A hand-rolled parser for the (case-insensitive, separator-tolerant)
/// PEP 440 grammar.
struct Parser<'a> {
    input: &'a str,
    lowered: String,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            lowered: input.trim().to_ascii_lowercase(),
            pos: 0,
        }
    }

    fn rest(&self) -> &str {
        &self.lowered[self.pos..]
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn eat_separator(&mut self) -> bool {
        self.eat(".") || self.eat("-") || self.eat("_")
    }

    fn take_number(&mut self) -> Option<u64> {
        let digits: usize = self
            .rest()
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits == 0 {
            return None;
        }
        let number = self.rest()[..digits].parse().ok()?;
        self.pos += digits;
        Some(number)
    }

    fn parse(mut self) -> Result<Version, VersionParseError> {
        if self.lowered.is_empty() {
            return Err(VersionParseError::Empty);
        }
        // An optional `v` prefix is allowed, e.g. `v1.0`.
        self.eat("v");

        let first = self
            .take_number()
            .ok_or(VersionParseError::NoLeadingNumber)?;

        // `N!` epoch prefix
        let (epoch, mut release) = if self.eat("!") {
            let first_release = self
                .take_number()
                .ok_or(VersionParseError::NoLeadingNumber)?;
            (first, vec![first_release])
        } else {
            (0, vec![first])
        };

        while self.rest().starts_with('.')
            && self.rest()[1..].starts_with(|c: char| c.is_ascii_digit())
        {
            self.pos += 1;
            release.push(
                self.take_number()
                    .ok_or_else(|| VersionParseError::InvalidNumber(self.input.to_string()))?,
            );
        }

        let pre = self.parse_pre();
        let post = self.parse_post();
        let dev = self.parse_dev();
        let local = self.parse_local()?;

        if !self.rest().is_empty() {
            return Err(VersionParseError::TrailingCharacters(
                self.input.to_string(),
                self.rest().to_string(),
            ));
        }

        Ok(Version {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        })
    }

    fn parse_pre(&mut self) -> Option<Prerelease> {
        let checkpoint = self.pos;
        self.eat_separator();
        let kind = if self.eat("alpha") || self.eat("a") {
            PrereleaseKind::Alpha
        } else if self.eat("beta") || self.eat("b") {
            PrereleaseKind::Beta
        } else if self.eat("rc") || self.eat("preview") || self.eat("pre") || self.eat("c") {
            PrereleaseKind::Rc
        } else {
            self.pos = checkpoint;
            return None;
        };
        self.eat_separator();
        let number = self.take_number().unwrap_or(0);
        Some(Prerelease { kind, number })
    }

    fn parse_post(&mut self) -> Option<u64> {
        let checkpoint = self.pos;
        // The implicit post syntax, e.g. `1.0-1`.
        if self.rest().starts_with('-')
            && self.rest()[1..].starts_with(|c: char| c.is_ascii_digit())
        {
            self.pos += 1;
            return self.take_number();
        }
        self.eat_separator();
        if self.eat("post") || self.eat("rev") || self.eat("r") {
            self.eat_separator();
            Some(self.take_number().unwrap_or(0))
        } else {
            self.pos = checkpoint;
            None
        }
    }

    fn parse_dev(&mut self) -> Option<u64> {
        let checkpoint = self.pos;
        self.eat_separator();
        if self.eat("dev") {
            self.eat_separator();
            Some(self.take_number().unwrap_or(0))
        } else {
            self.pos = checkpoint;
            None
        }
    }

    fn parse_local(&mut self) -> Result<Vec<LocalSegment>, VersionParseError> {
        if !self.eat("+") {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for raw in self
            .rest()
            .split(['.', '-', '_'])
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(VersionParseError::InvalidLocal(self.input.to_string()));
            }
            segments.push(match raw.parse::<u64>() {
                Ok(number) => LocalSegment::Number(number),
                Err(_) => LocalSegment::String(raw),
            });
        }
        self.pos = self.lowered.len();
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    #[test]
    fn parse_basic() {
        let v = version("1.2.3");
        assert_eq!(v.release(), &[1, 2, 3]);
        assert_eq!(v.epoch(), 0);
        assert!(!v.is_prerelease());
    }

    #[test]
    fn parse_complex() {
        let v = version("2!1.0.post1.dev3+ubuntu.1");
        assert_eq!(v.epoch(), 2);
        assert_eq!(v.post(), Some(1));
        assert_eq!(v.dev(), Some(3));
        assert_eq!(
            v.local(),
            &[
                LocalSegment::String("ubuntu".to_string()),
                LocalSegment::Number(1)
            ]
        );
    }

    #[test]
    fn parse_normalizes_spellings() {
        assert_eq!(version("1.0Alpha1"), version("1.0a1"));
        assert_eq!(version("1.0-preview-2"), version("1.0rc2"));
        assert_eq!(version("1.0-rev_4"), version("1.0.post4"));
        assert_eq!(version("V1.0"), version("1.0"));
        assert_eq!(version("1.0-1"), version("1.0.post1"));
    }

    #[test]
    fn trailing_garbage() {
        assert!(Version::from_str("1.0.x").is_err());
        assert!(Version::from_str("hello").is_err());
        assert!(Version::from_str("").is_err());
    }

    #[test]
    fn ordering() {
        // From the PEP 440 example sequence.
        let ordered = [
            "1.0.dev456",
            "1.0a1",
            "1.0a2.dev456",
            "1.0a12.dev456",
            "1.0a12",
            "1.0b1.dev456",
            "1.0b2",
            "1.0b2.post345.dev456",
            "1.0b2.post345",
            "1.0rc1.dev456",
            "1.0rc1",
            "1.0",
            "1.0+abc.5",
            "1.0+abc.7",
            "1.0+5",
            "1.0.post456.dev34",
            "1.0.post456",
            "1.1.dev1",
        ];
        for pair in ordered.windows(2) {
            assert!(
                version(pair[0]) < version(pair[1]),
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn equality_pads_release() {
        assert_eq!(version("1.0"), version("1.0.0"));
        assert_eq!(version("1"), version("1.0.0.0"));
        assert_ne!(version("1.0"), version("1.0.1"));
    }

    #[test]
    fn hash_matches_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(version("1.0"));
        assert!(set.contains(&version("1.0.0")));
    }

    #[test]
    fn display_round_trip() {
        for s in ["1.2.3", "2!1.0rc1", "1.0.post4.dev5", "1.0+ubuntu.1", "1.0a0"] {
            assert_eq!(version(s).to_string(), s);
        }
    }

    #[test]
    fn prerelease_detection() {
        assert!(version("1.0a1").is_prerelease());
        assert!(version("1.0.dev3").is_prerelease());
        assert!(!version("1.0.post3").is_prerelease());
        assert!(version("1.0.post3").is_postrelease());
    }
}
