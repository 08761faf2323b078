//! PEP 508 environment markers: parsing and evaluation.
//!
//! <https://packaging.python.org/en/latest/specifications/dependency-specifiers/#environment-markers>

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use fromager_normalize::ExtraName;
use fromager_pep440::{Version, VersionSpecifier};

use crate::cursor::Cursor;
use crate::Pep508Error;

/// The environment a marker is evaluated against, mirroring
/// `packaging.markers.default_environment()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEnvironment {
    pub implementation_name: String,
    pub implementation_version: String,
    pub os_name: String,
    pub platform_machine: String,
    pub platform_python_implementation: String,
    pub platform_release: String,
    pub platform_system: String,
    pub platform_version: String,
    pub python_full_version: String,
    pub python_version: String,
    pub sys_platform: String,
}

impl MarkerEnvironment {
    /// An environment for a CPython of the given full version on the host
    /// platform.
    pub fn for_python(python_full_version: &str) -> Self {
        let python_version = python_full_version
            .splitn(3, '.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".");
        let (os_name, platform_system, sys_platform) = if cfg!(windows) {
            ("nt", "Windows", "win32")
        } else if cfg!(target_os = "macos") {
            ("posix", "Darwin", "darwin")
        } else {
            ("posix", "Linux", "linux")
        };
        let platform_machine = if cfg!(target_arch = "aarch64") {
            if cfg!(target_os = "macos") {
                "arm64"
            } else {
                "aarch64"
            }
        } else {
            "x86_64"
        };
        Self {
            implementation_name: "cpython".to_string(),
            implementation_version: python_full_version.to_string(),
            os_name: os_name.to_string(),
            platform_machine: platform_machine.to_string(),
            platform_python_implementation: "CPython".to_string(),
            platform_release: String::new(),
            platform_system: platform_system.to_string(),
            platform_version: String::new(),
            python_full_version: python_full_version.to_string(),
            python_version,
            sys_platform: sys_platform.to_string(),
        }
    }

    fn get(&self, key: MarkerValueKey) -> &str {
        match key {
            MarkerValueKey::ImplementationName => &self.implementation_name,
            MarkerValueKey::ImplementationVersion => &self.implementation_version,
            MarkerValueKey::OsName => &self.os_name,
            MarkerValueKey::PlatformMachine => &self.platform_machine,
            MarkerValueKey::PlatformPythonImplementation => &self.platform_python_implementation,
            MarkerValueKey::PlatformRelease => &self.platform_release,
            MarkerValueKey::PlatformSystem => &self.platform_system,
            MarkerValueKey::PlatformVersion => &self.platform_version,
            MarkerValueKey::PythonFullVersion => &self.python_full_version,
            MarkerValueKey::PythonVersion => &self.python_version,
            MarkerValueKey::SysPlatform => &self.sys_platform,
            MarkerValueKey::Extra => "",
        }
    }
}

/// The environment variables a marker expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerValueKey {
    ImplementationName,
    ImplementationVersion,
    OsName,
    PlatformMachine,
    PlatformPythonImplementation,
    PlatformRelease,
    PlatformSystem,
    PlatformVersion,
    PythonFullVersion,
    PythonVersion,
    SysPlatform,
    Extra,
}

impl MarkerValueKey {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "implementation_name" => Self::ImplementationName,
            "implementation_version" => Self::ImplementationVersion,
            "os_name" | "os.name" => Self::OsName,
            "platform_machine" | "platform.machine" => Self::PlatformMachine,
            "platform_python_implementation" | "platform.python_implementation" => {
                Self::PlatformPythonImplementation
            }
            "platform_release" => Self::PlatformRelease,
            "platform_system" => Self::PlatformSystem,
            "platform_version" | "platform.version" => Self::PlatformVersion,
            "python_full_version" => Self::PythonFullVersion,
            "python_version" | "python.version" => Self::PythonVersion,
            "sys_platform" | "sys.platform" => Self::SysPlatform,
            "extra" => Self::Extra,
            _ => return None,
        })
    }

    fn is_version_key(self) -> bool {
        matches!(
            self,
            Self::ImplementationVersion | Self::PythonFullVersion | Self::PythonVersion
        )
    }
}

impl Display for MarkerValueKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ImplementationName => "implementation_name",
            Self::ImplementationVersion => "implementation_version",
            Self::OsName => "os_name",
            Self::PlatformMachine => "platform_machine",
            Self::PlatformPythonImplementation => "platform_python_implementation",
            Self::PlatformRelease => "platform_release",
            Self::PlatformSystem => "platform_system",
            Self::PlatformVersion => "platform_version",
            Self::PythonFullVersion => "python_full_version",
            Self::PythonVersion => "python_version",
            Self::SysPlatform => "sys_platform",
            Self::Extra => "extra",
        };
        write!(f, "{name}")
    }
}

/// One side of a marker expression: an environment key or a quoted string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerValue {
    Key(MarkerValueKey),
    QuotedString(String),
}

impl Display for MarkerValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => write!(f, "{key}"),
            Self::QuotedString(string) => write!(f, "'{string}'"),
        }
    }
}

/// The comparison operators of the marker grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    TildeEqual,
    In,
    NotIn,
}

impl Display for MarkerOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let operator = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::GreaterEqual => ">=",
            Self::LessThan => "<",
            Self::LessEqual => "<=",
            Self::TildeEqual => "~=",
            Self::In => "in",
            Self::NotIn => "not in",
        };
        write!(f, "{operator}")
    }
}

/// A single comparison, e.g. `python_version >= '3.8'` or `extra == 'cuda'`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerExpression {
    pub l_value: MarkerValue,
    pub operator: MarkerOperator,
    pub r_value: MarkerValue,
}

impl MarkerExpression {
    fn evaluate(&self, env: &MarkerEnvironment, extra: Option<&ExtraName>) -> bool {
        let left = self.resolve(&self.l_value, env, extra);
        let right = self.resolve(&self.r_value, env, extra);

        // `extra == "name"` comparisons canonicalize both sides, per PEP 685.
        if self.l_value == MarkerValue::Key(MarkerValueKey::Extra)
            || self.r_value == MarkerValue::Key(MarkerValueKey::Extra)
        {
            let left = canonical_extra(&left);
            let right = canonical_extra(&right);
            return match self.operator {
                MarkerOperator::Equal => left == right,
                MarkerOperator::NotEqual => left != right,
                _ => false,
            };
        }

        // Version comparison when either side is a version-valued key and
        // both sides parse as versions; string comparison otherwise.
        let version_context = match (&self.l_value, &self.r_value) {
            (MarkerValue::Key(key), _) | (_, MarkerValue::Key(key)) => key.is_version_key(),
            _ => false,
        };
        if version_context {
            if let (Ok(left), Ok(right)) =
                (Version::from_str(&left), Version::from_str(&right))
            {
                return self.compare_versions(&left, &right);
            }
        }
        self.compare_strings(&left, &right)
    }

    fn resolve(
        &self,
        value: &MarkerValue,
        env: &MarkerEnvironment,
        extra: Option<&ExtraName>,
    ) -> String {
        match value {
            MarkerValue::Key(MarkerValueKey::Extra) => extra
                .map(|extra| extra.as_str().to_string())
                .unwrap_or_default(),
            MarkerValue::Key(key) => env.get(*key).to_string(),
            MarkerValue::QuotedString(string) => string.clone(),
        }
    }

    fn compare_versions(&self, left: &Version, right: &Version) -> bool {
        match self.operator {
            MarkerOperator::Equal => {
                VersionSpecifier::equals_version(right.clone()).contains(left)
            }
            MarkerOperator::NotEqual => {
                !VersionSpecifier::equals_version(right.clone()).contains(left)
            }
            MarkerOperator::GreaterThan => left > right,
            MarkerOperator::GreaterEqual => left >= right,
            MarkerOperator::LessThan => left < right,
            MarkerOperator::LessEqual => left <= right,
            MarkerOperator::TildeEqual => {
                VersionSpecifier::new(fromager_pep440::Operator::TildeEqual, right.clone(), false)
                    .map(|specifier| specifier.contains(left))
                    .unwrap_or(false)
            }
            MarkerOperator::In | MarkerOperator::NotIn => false,
        }
    }

    fn compare_strings(&self, left: &str, right: &str) -> bool {
        match self.operator {
            MarkerOperator::Equal => left == right,
            MarkerOperator::NotEqual => left != right,
            MarkerOperator::GreaterThan => left > right,
            MarkerOperator::GreaterEqual => left >= right,
            MarkerOperator::LessThan => left < right,
            MarkerOperator::LessEqual => left <= right,
            MarkerOperator::TildeEqual => false,
            MarkerOperator::In => right.contains(left),
            MarkerOperator::NotIn => !right.contains(left),
        }
    }
}

fn canonical_extra(value: &str) -> String {
    ExtraName::new(value)
        .map(|extra| extra.as_str().to_string())
        .unwrap_or_else(|_| value.to_string())
}

impl Display for MarkerExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.l_value, self.operator, self.r_value)
    }
}

/// A parsed marker: a tree of and/or-joined comparisons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerTree {
    Expression(MarkerExpression),
    And(Vec<MarkerTree>),
    Or(Vec<MarkerTree>),
}

impl MarkerTree {
    /// Evaluate against an environment, with an optional active `extra`.
    pub fn evaluate(&self, env: &MarkerEnvironment, extra: Option<&ExtraName>) -> bool {
        match self {
            Self::Expression(expression) => expression.evaluate(env, extra),
            Self::And(trees) => trees.iter().all(|tree| tree.evaluate(env, extra)),
            Self::Or(trees) => trees.iter().any(|tree| tree.evaluate(env, extra)),
        }
    }

    /// Whether the marker mentions the `extra` variable at all.
    pub fn references_extra(&self) -> bool {
        match self {
            Self::Expression(expression) => {
                expression.l_value == MarkerValue::Key(MarkerValueKey::Extra)
                    || expression.r_value == MarkerValue::Key(MarkerValueKey::Extra)
            }
            Self::And(trees) | Self::Or(trees) => {
                trees.iter().any(MarkerTree::references_extra)
            }
        }
    }
}

impl Display for MarkerTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expression(expression) => write!(f, "{expression}"),
            Self::And(trees) => {
                let mut first = true;
                for tree in trees {
                    if !first {
                        write!(f, " and ")?;
                    }
                    match tree {
                        Self::Or(_) => write!(f, "({tree})")?,
                        _ => write!(f, "{tree}")?,
                    }
                    first = false;
                }
                Ok(())
            }
            Self::Or(trees) => {
                let mut first = true;
                for tree in trees {
                    if !first {
                        write!(f, " or ")?;
                    }
                    write!(f, "{tree}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for MarkerTree {
    type Err = Pep508Error;

    fn from_str(marker: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(marker);
        let tree = parse_marker_or(&mut cursor)?;
        cursor.eat_whitespace();
        if !cursor.at_end() {
            return Err(Pep508Error::new(
                marker,
                cursor.pos(),
                "unexpected trailing characters in marker",
            ));
        }
        Ok(tree)
    }
}

pub(crate) fn parse_marker_or(cursor: &mut Cursor) -> Result<MarkerTree, Pep508Error> {
    let mut trees = vec![parse_marker_and(cursor)?];
    loop {
        cursor.eat_whitespace();
        if eat_keyword(cursor, "or") {
            trees.push(parse_marker_and(cursor)?);
        } else {
            break;
        }
    }
    Ok(if trees.len() == 1 {
        trees.pop().unwrap()
    } else {
        MarkerTree::Or(trees)
    })
}

fn parse_marker_and(cursor: &mut Cursor) -> Result<MarkerTree, Pep508Error> {
    let mut trees = vec![parse_marker_atom(cursor)?];
    loop {
        cursor.eat_whitespace();
        if eat_keyword(cursor, "and") {
            trees.push(parse_marker_atom(cursor)?);
        } else {
            break;
        }
    }
    Ok(if trees.len() == 1 {
        trees.pop().unwrap()
    } else {
        MarkerTree::And(trees)
    })
}

fn parse_marker_atom(cursor: &mut Cursor) -> Result<MarkerTree, Pep508Error> {
    cursor.eat_whitespace();
    if cursor.eat_char('(') {
        let tree = parse_marker_or(cursor)?;
        cursor.eat_whitespace();
        if !cursor.eat_char(')') {
            return Err(Pep508Error::new(
                cursor.to_end(),
                cursor.pos(),
                "expected closing parenthesis in marker",
            ));
        }
        return Ok(tree);
    }
    let l_value = parse_marker_value(cursor)?;
    let operator = parse_marker_operator(cursor)?;
    let r_value = parse_marker_value(cursor)?;
    Ok(MarkerTree::Expression(MarkerExpression {
        l_value,
        operator,
        r_value,
    }))
}

fn parse_marker_value(cursor: &mut Cursor) -> Result<MarkerValue, Pep508Error> {
    cursor.eat_whitespace();
    match cursor.peek_char() {
        Some(quote @ ('\'' | '"')) => {
            cursor.next();
            let (start, len) = cursor.take_while(|c| c != quote);
            if !cursor.eat_char(quote) {
                return Err(Pep508Error::new(
                    cursor.to_end(),
                    cursor.pos(),
                    "unterminated string in marker",
                ));
            }
            Ok(MarkerValue::QuotedString(
                cursor.slice(start, len).to_string(),
            ))
        }
        Some(c) if c.is_alphanumeric() || c == '_' => {
            let (start, len) = cursor.take_while(|c| c.is_alphanumeric() || c == '_' || c == '.');
            let name = cursor.slice(start, len);
            MarkerValueKey::from_name(name).map(MarkerValue::Key).ok_or_else(|| {
                Pep508Error::new(name, start, "not a valid marker environment variable")
            })
        }
        _ => Err(Pep508Error::new(
            cursor.to_end(),
            cursor.pos(),
            "expected a marker value",
        )),
    }
}

fn parse_marker_operator(cursor: &mut Cursor) -> Result<MarkerOperator, Pep508Error> {
    cursor.eat_whitespace();
    if eat_keyword(cursor, "in") {
        return Ok(MarkerOperator::In);
    }
    if eat_keyword(cursor, "not") {
        cursor.eat_whitespace();
        if eat_keyword(cursor, "in") {
            return Ok(MarkerOperator::NotIn);
        }
        return Err(Pep508Error::new(
            cursor.to_end(),
            cursor.pos(),
            "expected `in` after `not` in marker",
        ));
    }
    let (start, len) = cursor.take_while(|c| matches!(c, '=' | '!' | '<' | '>' | '~'));
    match cursor.slice(start, len) {
        "==" => Ok(MarkerOperator::Equal),
        "!=" => Ok(MarkerOperator::NotEqual),
        ">" => Ok(MarkerOperator::GreaterThan),
        ">=" => Ok(MarkerOperator::GreaterEqual),
        "<" => Ok(MarkerOperator::LessThan),
        "<=" => Ok(MarkerOperator::LessEqual),
        "~=" => Ok(MarkerOperator::TildeEqual),
        other => Err(Pep508Error::new(
            other,
            start,
            "not a valid marker comparison operator",
        )),
    }
}

/// Consume a bare keyword (`and`, `or`, `in`, `not`) if it is followed by a
/// non-identifier character.
fn eat_keyword(cursor: &mut Cursor, keyword: &str) -> bool {
    let mut lookahead = cursor.clone();
    for wanted in keyword.chars() {
        if lookahead.next() != Some(wanted) {
            return false;
        }
    }
    if matches!(lookahead.peek_char(), Some(c) if c.is_alphanumeric() || c == '_') {
        return false;
    }
    *cursor = lookahead;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MarkerEnvironment {
        MarkerEnvironment::for_python("3.11.4")
    }

    fn marker(s: &str) -> MarkerTree {
        MarkerTree::from_str(s).unwrap()
    }

    #[test]
    fn python_version_comparison() {
        assert!(marker("python_version >= '3.8'").evaluate(&env(), None));
        assert!(!marker("python_version < '3.8'").evaluate(&env(), None));
        assert!(marker("python_full_version == '3.11.4'").evaluate(&env(), None));
    }

    #[test]
    fn and_or_precedence() {
        let tree = marker("python_version >= '3.8' and (os_name == 'nt' or os_name == 'posix')");
        assert!(tree.evaluate(&env(), None));
        let tree = marker("os_name == 'nt' or os_name == 'posix' and python_version >= '3.8'");
        assert!(tree.evaluate(&env(), None));
    }

    #[test]
    fn extra_comparison_canonicalizes() {
        let tree = marker("extra == 'b_c'");
        let extra = ExtraName::new("b-c").unwrap();
        assert!(tree.evaluate(&env(), Some(&extra)));
        assert!(!tree.evaluate(&env(), None));
    }

    #[test]
    fn in_operator() {
        assert!(marker("'linux' in sys_platform").evaluate(&env(), None));
        assert!(marker("sys_platform not in 'win32 cygwin'").evaluate(&env(), None));
    }

    #[test]
    fn references_extra() {
        assert!(marker("extra == 'cuda'").references_extra());
        assert!(!marker("python_version > '3'").references_extra());
        assert!(
            marker("python_version > '3' and extra == 'cuda'").references_extra()
        );
    }

    #[test]
    fn display_round_trip() {
        let tree = marker("python_version >= '3.8' and (extra == 'a' or extra == 'b')");
        assert_eq!(
            tree.to_string(),
            "python_version >= '3.8' and (extra == 'a' or extra == 'b')"
        );
    }

    #[test]
    fn version_comparison_tilde() {
        assert!(marker("python_version ~= '3.10'").evaluate(&env(), None));
    }
}
