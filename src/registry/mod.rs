//! npm registry domain types and collaborators.
//!
//! A package is addressed either as `name` or as `@scope/name`.  The
//! [`PackageIdentity`] type carries both forms and guarantees that every
//! component is a single, traversal-free path segment so that it can be
//! joined onto the cache root safely.

pub mod patch;
pub mod upstream;

use std::fmt;

use anyhow::Result;

// ---------------------------------------------------------------------------
// Package identity
// ---------------------------------------------------------------------------

/// Identifies a package, optionally within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentity {
    scope: Option<String>,
    name: String,
}

impl PackageIdentity {
    /// Build an unscoped identity (`name`).
    pub fn unscoped(name: &str) -> Result<Self> {
        validate_segment(name, "package name")?;
        Ok(Self {
            scope: None,
            name: name.to_owned(),
        })
    }

    /// Build a scoped identity (`scope/name`).  The scope is kept verbatim,
    /// including its leading `@`.
    pub fn scoped(scope: &str, name: &str) -> Result<Self> {
        validate_segment(scope, "scope")?;
        validate_segment(name, "package name")?;
        Ok(Self {
            scope: Some(scope.to_owned()),
            name: name.to_owned(),
        })
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical key: `scope/name` when scoped, else `name`.
    pub fn full_name(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{scope}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Tarball request
// ---------------------------------------------------------------------------

/// A request for one version's tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballRequest {
    pub identity: PackageIdentity,
    pub version: String,
}

impl TarballRequest {
    /// Parse the version out of a `<name>-<version>.tgz` filename.
    ///
    /// Returns an error when the filename does not carry the package name
    /// prefix, lacks the `.tgz` suffix, or has an empty version.
    pub fn from_filename(identity: PackageIdentity, filename: &str) -> Result<Self> {
        let version = filename
            .strip_prefix(identity.name())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".tgz"))
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "tarball {filename:?} does not match {}-<version>.tgz",
                    identity.name()
                )
            })?;
        validate_segment(version, "version")?;
        Ok(Self {
            version: version.to_owned(),
            identity,
        })
    }

    /// Conventional tarball filename for this request.
    pub fn filename(&self) -> String {
        format!("{}-{}.tgz", self.identity.name(), self.version)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject values that are not a single path component below the cache root.
/// `.` is refused as well as `..`, since it resolves to the enclosing directory.
fn validate_segment(segment: &str, label: &str) -> Result<()> {
    anyhow::ensure!(!segment.is_empty(), "{label} must not be empty");
    anyhow::ensure!(
        !segment.contains(['/', '\\', '\0']) && segment != "." && segment != "..",
        "invalid {label}: {segment:?}"
    );
    Ok(())
}
