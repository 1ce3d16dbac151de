use admission_policy_controller_k8s_api::{GroupVersionKind, ParamKind};
use std::{fmt, str::FromStr};

/// The logical identity of a parameter resource kind, as declared by a
/// definition's `spec.paramKind`.
///
/// Watches are keyed by this value, so two definitions that spell the same
/// kind identically share a watch.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ParamKindRef {
    pub api_version: String,
    pub kind: String,
}

/// An API group and version, e.g. `apps/v1`. The core group is empty.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[error("unexpected GroupVersion string: {0}")]
pub struct ParseGroupVersionError(String);

// === impl ParamKindRef ===

impl ParamKindRef {
    pub fn new(api_version: impl ToString, kind: impl ToString) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn group_version(&self) -> Result<GroupVersion, ParseGroupVersionError> {
        self.api_version.parse()
    }

    /// Parses the API version and qualifies it with this kind.
    pub fn group_version_kind(&self) -> Result<GroupVersionKind, ParseGroupVersionError> {
        let GroupVersion { group, version } = self.group_version()?;
        Ok(GroupVersionKind::gvk(&group, &version, &self.kind))
    }
}

impl From<&ParamKind> for ParamKindRef {
    fn from(kind: &ParamKind) -> Self {
        Self {
            api_version: kind.api_version.clone().unwrap_or_default(),
            kind: kind.kind.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ParamKindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version, self.kind)
    }
}

// === impl GroupVersion ===

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    /// An empty string (or a lone `/`) parses to an empty group-version; it is
    /// left to resolution to reject it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "/" {
            return Ok(Self::default());
        }

        match s.split_once('/') {
            None => Ok(Self {
                group: String::new(),
                version: s.to_string(),
            }),
            Some((group, version)) if !version.contains('/') => Ok(Self {
                group: group.to_string(),
                version: version.to_string(),
            }),
            Some(_) => Err(ParseGroupVersionError(s.to_string())),
        }
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            return self.version.fmt(f);
        }
        write!(f, "{}/{}", self.group, self.version)
    }
}
