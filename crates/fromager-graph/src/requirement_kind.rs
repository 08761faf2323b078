use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Why a requirement entered the graph. Drives both traversal policy and
/// filtering: install-type edges define the runtime closure, build-type
/// edges the build-environment closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequirementKind {
    /// Supplied by the caller at the top of a bootstrap.
    TopLevel,
    /// From a built wheel's `Requires-Dist`.
    Install,
    /// From `[build-system] requires` in `pyproject.toml`.
    BuildSystem,
    /// From the PEP 517 `get_requires_for_build_wheel` hook.
    BuildBackend,
    /// Needed to build the source distribution itself.
    BuildSdist,
}

impl RequirementKind {
    /// True for the three build-time kinds.
    pub fn is_build_requirement(self) -> bool {
        matches!(
            self,
            Self::BuildSystem | Self::BuildBackend | Self::BuildSdist
        )
    }

    /// True for the kinds that end up installed at runtime.
    pub fn is_install_requirement(self) -> bool {
        matches!(self, Self::TopLevel | Self::Install)
    }
}

impl Display for RequirementKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::TopLevel => "toplevel",
            Self::Install => "install",
            Self::BuildSystem => "build-system",
            Self::BuildBackend => "build-backend",
            Self::BuildSdist => "build-sdist",
        };
        write!(f, "{label}")
    }
}

impl FromStr for RequirementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "toplevel" => Ok(Self::TopLevel),
            "install" => Ok(Self::Install),
            "build-system" => Ok(Self::BuildSystem),
            "build-backend" => Ok(Self::BuildBackend),
            "build-sdist" => Ok(Self::BuildSdist),
            other => Err(format!("unknown requirement kind `{other}`")),
        }
    }
}

impl Serialize for RequirementKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequirementKind {
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

    #[test]
    fn predicates() {
        assert!(RequirementKind::BuildSystem.is_build_requirement());
        assert!(RequirementKind::BuildBackend.is_build_requirement());
        assert!(RequirementKind::BuildSdist.is_build_requirement());
        assert!(!RequirementKind::Install.is_build_requirement());

        assert!(RequirementKind::TopLevel.is_install_requirement());
        assert!(RequirementKind::Install.is_install_requirement());
        assert!(!RequirementKind::BuildSystem.is_install_requirement());
    }

    #[test]
    fn string_round_trip() {
        for kind in [
            RequirementKind::TopLevel,
            RequirementKind::Install,
            RequirementKind::BuildSystem,
            RequirementKind::BuildBackend,
            RequirementKind::BuildSdist,
        ] {
            assert_eq!(kind.to_string().parse::<RequirementKind>().unwrap(), kind);
        }
    }
}
