use crate::error::HomologyError;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref IDENTIFIER_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_.|\-]+$").expect("identifier pattern compiles");
}

/// `<workspace>/<object>[/<version>]`, validated before any network call.
///
/// Workspace and object may be numeric ids or names; the version, when
/// present, must be a non-negative integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub workspace: String,
    pub object: String,
    pub version: Option<u64>,
}

impl ObjectReference {
    pub fn parse(raw: &str) -> Result<Self, HomologyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HomologyError::invalid_reference(raw, "reference is empty"));
        }
        if trimmed.starts_with('/') {
            return Err(HomologyError::invalid_reference(
                raw,
                "reference must not start with '/'",
            ));
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(HomologyError::invalid_reference(
                raw,
                format!(
                    "expected workspace/object[/version], found {} component(s)",
                    parts.len()
                ),
            ));
        }
        for (label, part) in [("workspace", parts[0]), ("object", parts[1])] {
            if !IDENTIFIER_RE.is_match(part) {
                return Err(HomologyError::invalid_reference(
                    raw,
                    format!("{label} component '{part}' is not a valid id or name"),
                ));
            }
        }
        let version = match parts.get(2) {
            Some(raw_version) => Some(raw_version.parse::<u64>().map_err(|_| {
                HomologyError::invalid_reference(
                    raw,
                    format!("version '{raw_version}' is not a non-negative integer"),
                )
            })?),
            None => None,
        };
        Ok(Self {
            workspace: parts[0].to_string(),
            object: parts[1].to_string(),
            version,
        })
    }

    pub fn resolved(workspace_id: u64, object_id: u64, version: u64) -> Self {
        Self {
            workspace: workspace_id.to_string(),
            object: object_id.to_string(),
            version: Some(version),
        }
    }

    /// Reference path reaching `linked` through this object, which is how
    /// the workspace grants access to objects referenced by a readable one.
    pub fn path_to(&self, linked: &ObjectReference) -> String {
        format!("{self};{linked}")
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(version) => write!(f, "{}/{}/{}", self.workspace, self.object, version),
            None => write!(f, "{}/{}", self.workspace, self.object),
        }
    }
}
