//! Unit Store: discovers migration units in the canonical units directory.
//!
//! Names are validated twice: first against the identifier pattern and the
//! required extension, then the resolved path is checked to lie inside the
//! canonicalized units directory. The second check catches symlinks that
//! satisfy the pattern but point elsewhere.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use regex::Regex;

use cms_migrate_core::{Config, MigrationUnit};

use crate::{Result, StorageError};

/// Identifier pattern every caller-supplied unit name must satisfy.
fn unit_name_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w.-]+$").expect("valid regex"))
}

/// Discovered files must start with a digit sequence (timestamp-style prefix).
fn unit_file_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+[\w.-]*$").expect("valid regex"))
}

/// Pattern + suffix check without any filesystem access.
///
/// `suffix` includes the leading dot (e.g. `.sh`). The name must be longer
/// than the suffix so a bare `.sh` is rejected.
#[must_use]
pub fn is_valid_unit_name(name: &str, suffix: &str) -> bool {
    name.len() > suffix.len() && name.ends_with(suffix) && unit_name_re().is_match(name)
}

/// Enumerates and resolves migration units.
#[derive(Debug, Clone)]
pub struct UnitStore {
    units_dir: PathBuf,
    suffix: String,
    ignored: Vec<String>,
}

impl UnitStore {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            units_dir: config.units_dir.clone(),
            suffix: config.unit_suffix(),
            ignored: config.ignored_units.clone(),
        }
    }

    #[must_use]
    pub fn units_dir(&self) -> &Path {
        &self.units_dir
    }

    /// Identifier pattern and required extension.
    #[must_use]
    pub fn validate_name(&self, name: &str) -> bool {
        is_valid_unit_name(name, &self.suffix)
    }

    #[must_use]
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|n| n == name)
    }

    /// Resolve a caller-supplied name to a boundary-checked unit.
    ///
    /// Errors:
    /// - [`StorageError::InvalidUnitName`] when the pattern or suffix check fails
    /// - [`StorageError::InvalidPath`] when the resolved file lies outside the units dir
    /// - [`StorageError::UnitNotFound`] when no such file exists
    pub fn resolve(&self, name: &str) -> Result<MigrationUnit> {
        if !self.validate_name(name) {
            return Err(StorageError::InvalidUnitName(name.to_string()));
        }

        let root = match self.units_dir.canonicalize() {
            Ok(root) => root,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::UnitNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let candidate = match root.join(name).canonicalize() {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::UnitNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if candidate == root || !candidate.starts_with(&root) {
            tracing::warn!(
                unit = %name,
                resolved = %candidate.display(),
                "migration unit resolves outside the units directory"
            );
            return Err(StorageError::InvalidPath(candidate));
        }

        if !candidate.is_file() {
            return Err(StorageError::UnitNotFound(name.to_string()));
        }

        Ok(MigrationUnit::new(name, candidate))
    }

    /// Non-recursive scan of the units directory, lexically sorted by name.
    ///
    /// A missing directory yields an empty list.
    pub fn list_units(&self) -> Result<Vec<MigrationUnit>> {
        let entries = match fs::read_dir(&self.units_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !unit_file_re().is_match(&name) || !self.validate_name(&name) {
                continue;
            }
            if self.is_ignored(&name) {
                tracing::debug!(unit = %name, "skipping ignored migration unit");
                continue;
            }
            match self.resolve(&name) {
                Ok(unit) => units.push(unit),
                Err(StorageError::InvalidPath(path)) => {
                    tracing::warn!(
                        unit = %name,
                        resolved = %path.display(),
                        "excluding migration unit that escapes the units directory"
                    );
                }
                // Directories and dangling symlinks are not units.
                Err(StorageError::UnitNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> UnitStore {
        let config = Config::rooted_at(tmp.path());
        fs::create_dir_all(&config.units_dir).unwrap();
        UnitStore::new(&config)
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "#!/bin/sh\nexit 0\n").unwrap();
    }

    #[test]
    fn test_validate_name() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert!(store.validate_name("0001_init.sh"));
        assert!(store.validate_name("2025_05_15_create-users.v2.sh"));
        assert!(!store.validate_name("0001_init.sql"));
        assert!(!store.validate_name(".sh"));
        assert!(!store.validate_name("../../etc/passwd"));
        assert!(!store.validate_name("../0001_init.sh"));
        assert!(!store.validate_name("/abs/0001_init.sh"));
        assert!(!store.validate_name("0001 init.sh"));
        assert!(!store.validate_name(""));
    }

    #[test]
    fn test_missing_directory_yields_empty_list() {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(&tmp.path().join("nope"));
        let store = UnitStore::new(&config);
        assert!(store.list_units().unwrap().is_empty());
    }

    #[test]
    fn test_list_units_filters_and_sorts_lexically() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let dir = store.units_dir().to_path_buf();
        touch(&dir, "0010_c.sh");
        touch(&dir, "0001_a.sh");
        touch(&dir, "0002_b.sh");
        touch(&dir, "README.sh"); // no digit prefix
        touch(&dir, "0003_notes.txt"); // wrong extension
        fs::create_dir(dir.join("0004_dir.sh")).unwrap(); // directory, not a unit
        fs::create_dir(dir.join("nested")).unwrap();
        touch(&dir.join("nested"), "0005_nested.sh"); // non-recursive

        let names: Vec<String> = store
            .list_units()
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["0001_a.sh", "0002_b.sh", "0010_c.sh"]);
    }

    #[test]
    fn test_ignored_units_are_excluded() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::rooted_at(tmp.path());
        config.ignored_units = vec!["0002_b.sh".to_string()];
        fs::create_dir_all(&config.units_dir).unwrap();
        touch(&config.units_dir, "0001_a.sh");
        touch(&config.units_dir, "0002_b.sh");
        let store = UnitStore::new(&config);

        let names: Vec<String> = store
            .list_units()
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["0001_a.sh"]);
    }

    #[test]
    fn test_resolve_returns_canonical_path_inside_root() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        touch(store.units_dir(), "0001_init.sh");

        let unit = store.resolve("0001_init.sh").unwrap();
        assert_eq!(unit.name, "0001_init.sh");
        let root = store.units_dir().canonicalize().unwrap();
        assert!(unit.source_path.starts_with(&root));
        assert!(unit.source_path.is_absolute());
    }

    #[test]
    fn test_resolve_rejects_traversal_even_if_target_exists() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        // A same-named file outside the units dir.
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc").join("passwd"), "root:x:0:0").unwrap();

        let err = store.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUnitName(_)));
        let err = store.resolve("../etc/passwd.sh").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUnitName(_)));
    }

    #[test]
    fn test_resolve_missing_unit() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let err = store.resolve("0009_missing.sh").unwrap_err();
        assert!(matches!(err, StorageError::UnitNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_units_dir_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let outside = tmp.path().join("outside.sh");
        fs::write(&outside, "echo pwned").unwrap();
        std::os::unix::fs::symlink(&outside, store.units_dir().join("0001_evil.sh")).unwrap();

        let err = store.resolve("0001_evil.sh").unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));

        // Discovery leaves it out instead of handing it to the executor.
        assert!(store.list_units().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_units_dir_is_allowed() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        touch(store.units_dir(), "0001_real.sh");
        std::os::unix::fs::symlink(
            store.units_dir().join("0001_real.sh"),
            store.units_dir().join("0002_alias.sh"),
        )
        .unwrap();
        assert!(store.resolve("0002_alias.sh").is_ok());
    }

    proptest! {
        #[test]
        fn prop_names_with_separators_are_rejected(
            prefix in "[a-z0-9._-]{0,8}",
            suffix in "[a-z0-9._-]{0,8}",
            sep in prop::sample::select(vec!['/', '\\', '\0', ' ', ':'])
        ) {
            let name = format!("{prefix}{sep}{suffix}.sh");
            prop_assert!(!is_valid_unit_name(&name, ".sh"));
        }

        #[test]
        fn prop_timestamp_prefixed_names_are_accepted(
            stamp in "[0-9]{4,14}",
            label in "[a-z][a-z0-9_]{0,20}"
        ) {
            let name = format!("{stamp}_{label}.sh");
            prop_assert!(is_valid_unit_name(&name, ".sh"));
            prop_assert!(unit_file_re().is_match(&name));
        }
    }
}
