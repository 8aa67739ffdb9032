//! Composition and parsing of backend drive names.
//!
//! Local volumes live in a per-owner directory: `"{owner_id}/{name}"`.
//! Network volumes share one flat namespace per cluster, so the owner is
//! appended after a separator: `"{name}__SEPID__{owner_id}"`, optionally
//! prefixed with `"{namespace}/"`.

use std::fmt;

use thiserror::Error;

use crate::backend::BackendKind;

/// Separator between the volume name and the owner id in network drive names.
pub const OWNER_SEPARATOR: &str = "__SEPID__";

/// Separator between the namespace and the rest of a network drive name.
pub const NAMESPACE_SEPARATOR: char = '/';

/// Errors raised when a drive name cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriveNameError {
    /// Raised when the owner part is missing or not numeric.
    #[error("drive name {drive_name} carries no owner id")]
    MissingOwner {
        /// Offending drive name.
        drive_name: String,
    },
    /// Raised when the volume name is empty.
    #[error("drive name {drive_name} carries no volume name")]
    EmptyName {
        /// Offending drive name.
        drive_name: String,
    },
}

/// Structured view of a drive name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriveName {
    /// Namespace prefix; always `None` for local drives.
    pub namespace: Option<String>,
    /// User-facing volume name.
    pub name: String,
    /// Owner of the volume.
    pub owner_id: u64,
    kind: BackendKind,
}

impl DriveName {
    /// Builds the drive name of `name` owned by `owner_id` for `kind`.
    ///
    /// Empty namespaces are treated as absent; local drives ignore it.
    #[must_use]
    pub fn compose(kind: BackendKind, namespace: Option<&str>, owner_id: u64, name: &str) -> Self {
        let namespace = match kind {
            BackendKind::Local => None,
            BackendKind::Clustered | BackendKind::Cloud => namespace
                .filter(|ns| !ns.is_empty())
                .map(str::to_owned),
        };
        Self {
            namespace,
            name: name.to_owned(),
            owner_id,
            kind,
        }
    }

    /// Recovers the parts of a drive name produced for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DriveNameError`] when the owner or name part is missing.
    pub fn parse(kind: BackendKind, drive_name: &str) -> Result<Self, DriveNameError> {
        let missing_owner = || DriveNameError::MissingOwner {
            drive_name: drive_name.to_owned(),
        };
        let (namespace, name, owner) = match kind {
            BackendKind::Local => {
                let (owner, name) = drive_name.split_once('/').ok_or_else(missing_owner)?;
                (None, name, owner)
            }
            BackendKind::Clustered | BackendKind::Cloud => {
                let (qualified, owner) = drive_name
                    .rsplit_once(OWNER_SEPARATOR)
                    .ok_or_else(missing_owner)?;
                match qualified.split_once(NAMESPACE_SEPARATOR) {
                    Some((ns, name)) => (Some(ns.to_owned()), name, owner),
                    None => (None, qualified, owner),
                }
            }
        };
        let owner_id = owner.parse().map_err(|_| missing_owner())?;
        if name.is_empty() {
            return Err(DriveNameError::EmptyName {
                drive_name: drive_name.to_owned(),
            });
        }
        Ok(Self {
            namespace,
            name: name.to_owned(),
            owner_id,
            kind,
        })
    }

    /// Backend the drive name was built for.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl fmt::Display for DriveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BackendKind::Local => write!(f, "{}/{}", self.owner_id, self.name),
            BackendKind::Clustered | BackendKind::Cloud => {
                if let Some(ns) = &self.namespace {
                    write!(f, "{ns}{NAMESPACE_SEPARATOR}")?;
                }
                write!(f, "{}{OWNER_SEPARATOR}{}", self.name, self.owner_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::local(BackendKind::Local, Some("kd"), "42/data")]
    #[case::ceph_plain(BackendKind::Clustered, None, "data__SEPID__42")]
    #[case::ceph_namespaced(BackendKind::Clustered, Some("kd"), "kd/data__SEPID__42")]
    #[case::cloud_empty_namespace(BackendKind::Cloud, Some(""), "data__SEPID__42")]
    fn composes_per_backend(
        #[case] kind: BackendKind,
        #[case] namespace: Option<&str>,
        #[case] expected: &str,
    ) {
        let drive = DriveName::compose(kind, namespace, 42, "data");
        assert_eq!(drive.to_string(), expected);
        assert_eq!(DriveName::parse(kind, expected).expect("parse"), drive);
    }

    #[test]
    fn separator_inside_name_keeps_last_owner() {
        let drive =
            DriveName::parse(BackendKind::Clustered, "ns/a__SEPID__b__SEPID__7").expect("parse");
        assert_eq!(drive.name, "a__SEPID__b");
        assert_eq!(drive.owner_id, 7);
        assert_eq!(drive.namespace.as_deref(), Some("ns"));
    }

    #[rstest]
    #[case(BackendKind::Clustered, "no-owner")]
    #[case(BackendKind::Clustered, "name__SEPID__abc")]
    #[case(BackendKind::Local, "plain")]
    fn rejects_names_without_owner(#[case] kind: BackendKind, #[case] raw: &str) {
        assert!(matches!(
            DriveName::parse(kind, raw),
            Err(DriveNameError::MissingOwner { .. })
        ));
    }
}
