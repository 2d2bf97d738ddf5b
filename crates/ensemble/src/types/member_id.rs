use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordination-assigned name of a candidate in an election scope.
///
/// Candidates are created ephemeral-sequential, so the lexical order of ids is
/// their creation order and the smallest living id is the leader.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Last path segment of a candidate path.
    pub fn from_path(path: &str) -> Self {
        let name = match path.rfind('/') {
            Some(slash) => &path[slash + 1..],
            None => path,
        };
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MemberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
