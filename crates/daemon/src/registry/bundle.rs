// Bundle archives and their on-disk extraction.
//
// An archive is a JSON document naming the package, the classes it exports
// and its files (base64). Extraction goes to
// `<root>/<partition>/<module>/<version>` through a staging directory that is
// renamed into place once complete, so a half-written bundle is never loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use mcpd_common::path::{bundle_entry_path, storage_segment};
use mcpd_common::types::Partition;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const MANIFEST_FILE: &str = ".mcpd-manifest.json";
const COMPLETE_MARKER: &str = ".mcpd-complete";
const RESERVED_PREFIX: &str = ".mcpd-";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("bundle archive is malformed: {0}")]
    Malformed(String),

    #[error("bundle entry `{path}` rejected: {reason}")]
    InvalidEntry { path: String, reason: String },

    #[error("bundle I/O failed at {path}: {message}")]
    Io { path: String, message: String },
}

impl BundleError {
    fn io(path: &Path, error: io::Error) -> Self {
        Self::Io { path: path.display().to_string(), message: error.to_string() }
    }
}

/// Wire form of a bundle as stored in the blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleArchive {
    pub package_name: String,
    #[serde(default)]
    pub classes: Vec<String>,
    /// Relative path → base64 content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl BundleArchive {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self { package_name: package_name.into(), classes: Vec::new(), files: BTreeMap::new() }
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.classes.push(class_name.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: &[u8]) -> Self {
        self.files.insert(path.into(), STANDARD.encode(contents));
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BundleError> {
        serde_json::to_vec(self).map_err(|error| BundleError::Malformed(error.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BundleError> {
        serde_json::from_slice(bytes).map_err(|error| BundleError::Malformed(error.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ExtractedManifest {
    package_name: String,
    classes: BTreeSet<String>,
    version: String,
}

/// An extracted bundle ready for class instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedBundle {
    pub package_name: String,
    pub classes: BTreeSet<String>,
    pub version: String,
    pub dir: PathBuf,
}

/// Version id for a module revision: stable for a given source and update time.
pub fn bundle_version(source_uri: &str, updated_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update(b"\n");
    hasher.update(updated_at.to_rfc3339().as_bytes());
    hasher.finalize().iter().take(12).map(|b| format!("{b:02x}")).collect()
}

pub fn bundle_dir(root: &Path, partition: &Partition, module_name: &str, version: &str) -> Result<PathBuf, BundleError> {
    let segment = |value: &str| {
        storage_segment(value).map_err(|error| BundleError::InvalidEntry { path: value.to_string(), reason: error.to_string() })
    };
    Ok(root.join(segment(partition.as_str())?).join(segment(module_name)?).join(version))
}

/// A previously completed extraction at `dir`, if any.
pub fn load_extracted(dir: &Path) -> Result<Option<MaterializedBundle>, BundleError> {
    if !dir.join(COMPLETE_MARKER).is_file() {
        return Ok(None);
    }
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read(&manifest_path).map_err(|error| BundleError::io(&manifest_path, error))?;
    let manifest: ExtractedManifest =
        serde_json::from_slice(&raw).map_err(|error| BundleError::Malformed(error.to_string()))?;
    Ok(Some(MaterializedBundle {
        package_name: manifest.package_name,
        classes: manifest.classes,
        version: manifest.version,
        dir: dir.to_path_buf(),
    }))
}

/// Extract `bytes` into `dir` unless a complete extraction is already there.
pub fn extract(bytes: &[u8], dir: &Path, version: &str) -> Result<MaterializedBundle, BundleError> {
    if let Some(existing) = load_extracted(dir)? {
        return Ok(existing);
    }

    let archive = BundleArchive::from_bytes(bytes)?;
    let parent = dir
        .parent()
        .ok_or_else(|| BundleError::InvalidEntry { path: dir.display().to_string(), reason: "no parent".into() })?;
    fs::create_dir_all(parent).map_err(|error| BundleError::io(parent, error))?;
    restrict_to_owner(parent).map_err(|error| BundleError::io(parent, error))?;

    let staging = parent.join(format!(".staging-{}", Uuid::new_v4()));
    let written = write_staging(&archive, &staging, version);
    if let Err(error) = written {
        let _ = fs::remove_dir_all(&staging);
        return Err(error);
    }

    if let Err(error) = fs::rename(&staging, dir) {
        let _ = fs::remove_dir_all(&staging);
        // Another process may have finished the same version first.
        return load_extracted(dir)?.ok_or_else(|| BundleError::io(dir, error));
    }
    load_extracted(dir)?.ok_or_else(|| BundleError::Malformed("extraction did not complete".into()))
}

fn write_staging(archive: &BundleArchive, staging: &Path, version: &str) -> Result<(), BundleError> {
    fs::create_dir_all(staging).map_err(|error| BundleError::io(staging, error))?;
    restrict_to_owner(staging).map_err(|error| BundleError::io(staging, error))?;

    for (raw_path, encoded) in &archive.files {
        let relative = bundle_entry_path(raw_path)
            .map_err(|error| BundleError::InvalidEntry { path: raw_path.clone(), reason: error.to_string() })?;
        if relative.starts_with(RESERVED_PREFIX) {
            return Err(BundleError::InvalidEntry { path: raw_path.clone(), reason: "reserved name".into() });
        }
        let contents = STANDARD
            .decode(encoded)
            .map_err(|error| BundleError::InvalidEntry { path: raw_path.clone(), reason: error.to_string() })?;

        let target = staging.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|error| BundleError::io(parent, error))?;
        }
        fs::write(&target, contents).map_err(|error| BundleError::io(&target, error))?;
    }

    let manifest = ExtractedManifest {
        package_name: archive.package_name.clone(),
        classes: archive.classes.iter().cloned().collect(),
        version: version.to_string(),
    };
    let manifest_path = staging.join(MANIFEST_FILE);
    let encoded = serde_json::to_vec_pretty(&manifest).map_err(|error| BundleError::Malformed(error.to_string()))?;
    fs::write(&manifest_path, encoded).map_err(|error| BundleError::io(&manifest_path, error))?;

    let marker = staging.join(COMPLETE_MARKER);
    fs::write(&marker, version).map_err(|error| BundleError::io(&marker, error))
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive() -> BundleArchive {
        BundleArchive::new("math_pkg")
            .with_class("Calculator")
            .with_file("math_pkg/__init__.py", b"")
            .with_file("math_pkg/calc.py", b"def add(a, b): return a + b\n")
    }

    #[test]
    fn version_depends_on_source_and_update_time() {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z").unwrap().with_timezone(&Utc);

        let v = bundle_version("mem://math.zip", t0);
        assert_eq!(v, bundle_version("mem://math.zip", t0));
        assert_ne!(v, bundle_version("mem://math.zip", t1));
        assert_ne!(v, bundle_version("mem://other.zip", t0));
        assert_eq!(v.len(), 24);
    }

    #[test]
    fn extraction_writes_files_and_is_reused() {
        let root = TempDir::new().unwrap();
        let dir = bundle_dir(root.path(), &Partition::new("t1"), "math", "v1").unwrap();
        let bytes = archive().to_bytes().unwrap();

        let bundle = extract(&bytes, &dir, "v1").expect("extraction should succeed");
        assert_eq!(bundle.package_name, "math_pkg");
        assert!(bundle.classes.contains("Calculator"));
        assert_eq!(fs::read_to_string(dir.join("math_pkg/calc.py")).unwrap(), "def add(a, b): return a + b\n");

        // Garbage bytes are never parsed once a complete extraction exists.
        let again = extract(b"not json", &dir, "v1").expect("existing extraction should be reused");
        assert_eq!(again, bundle);
    }

    #[test]
    fn traversal_entries_abort_without_leaving_a_bundle() {
        let root = TempDir::new().unwrap();
        let dir = bundle_dir(root.path(), &Partition::new("t1"), "evil", "v1").unwrap();
        let bytes = BundleArchive::new("evil").with_file("../../escape.txt", b"x").to_bytes().unwrap();

        let error = extract(&bytes, &dir, "v1").unwrap_err();
        assert!(matches!(error, BundleError::InvalidEntry { .. }));
        assert!(load_extracted(&dir).unwrap().is_none());
        assert!(!root.path().join("escape.txt").exists());
    }

    #[test]
    fn malformed_archive_is_reported() {
        let root = TempDir::new().unwrap();
        let dir = bundle_dir(root.path(), &Partition::new("t1"), "math", "v1").unwrap();
        assert!(matches!(extract(b"\x00\x01", &dir, "v1"), Err(BundleError::Malformed(_))));
    }

    #[test]
    fn bundle_dir_rejects_unsafe_identifiers() {
        let root = TempDir::new().unwrap();
        assert!(bundle_dir(root.path(), &Partition::new("../t1"), "math", "v1").is_err());
        assert!(bundle_dir(root.path(), &Partition::new("t1"), "a/b", "v1").is_err());
    }
}
