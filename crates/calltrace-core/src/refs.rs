//! Object references
//!
//! Saved ops, datasets and arbitrary objects are addressed by URIs of the form
//! `calltrace:///<entity>/<project>/<kind>/<name>:<digest>`.

use crate::error::RefError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// URI scheme prefix for all references
pub const REF_SCHEME: &str = "calltrace:///";

/// What a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Op,
    Dataset,
    Object,
}

impl RefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RefKind::Op => "op",
            RefKind::Dataset => "dataset",
            RefKind::Object => "object",
        }
    }
}

impl FromStr for RefKind {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "op" => Ok(RefKind::Op),
            "dataset" => Ok(RefKind::Dataset),
            "object" => Ok(RefKind::Object),
            other => Err(RefError::UnknownKind(other.to_string())),
        }
    }
}

/// A stable reference to a saved object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub entity: String,
    pub project: String,
    pub kind: RefKind,
    pub name: String,
    pub digest: String,
}

impl ObjectRef {
    pub fn new(
        entity: impl Into<String>,
        project: impl Into<String>,
        kind: RefKind,
        name: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            project: project.into(),
            kind,
            name: name.into(),
            digest: digest.into(),
        }
    }

    /// Parse a `calltrace:///` URI
    pub fn parse(uri: &str) -> Result<Self, RefError> {
        let rest = uri.strip_prefix(REF_SCHEME).ok_or_else(|| RefError::BadScheme {
            uri: uri.to_string(),
            expected: REF_SCHEME,
        })?;

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(RefError::BadPath {
                uri: uri.to_string(),
                found: parts.len(),
            });
        }

        let (name, digest) = parts[3]
            .rsplit_once(':')
            .filter(|(name, digest)| !name.is_empty() && !digest.is_empty())
            .ok_or_else(|| RefError::MissingDigest(uri.to_string()))?;

        Ok(Self {
            entity: parts[0].to_string(),
            project: parts[1].to_string(),
            kind: parts[2].parse()?,
            name: name.to_string(),
            digest: digest.to_string(),
        })
    }

    /// Whether a string looks like a reference URI
    pub fn is_ref_uri(s: &str) -> bool {
        s.starts_with(REF_SCHEME)
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}/{}:{}",
            REF_SCHEME,
            self.entity,
            self.project,
            self.kind.as_str(),
            self.name,
            self.digest
        )
    }
}

impl FromStr for ObjectRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Refs travel as their URI string
impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uri = String::deserialize(deserializer)?;
        ObjectRef::parse(&uri).map_err(serde::de::Error::custom)
    }
}
