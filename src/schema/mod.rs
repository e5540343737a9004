//! Schema Version Registry
//!
//! Declares every supported store layout in order and computes the chain
//! of migration steps from an on-disk version to the latest one. A store's
//! version is recognised from its structural signature, not from the
//! number recorded in its settings table.

pub mod signature;
mod versions;

pub use versions::builtin_versions;

use rusqlite::Connection;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Transform applied by a migration step. Runs against the destination
/// store with the source store attached read-only as `src`.
pub type MappingFn = fn(&Connection) -> rusqlite::Result<()>;

/// Schema error types
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Store layout {signature} matches no known schema version")]
    NoCompatibleVersion { signature: String },

    #[error("Unknown schema version {0}")]
    UnknownVersion(u32),

    #[error("Cannot migrate from version {from} down to {to}")]
    Downgrade { from: u32, to: u32 },

    #[error("Invalid version chain: {0}")]
    InvalidChain(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One declared store layout
#[derive(Clone, Copy)]
pub struct SchemaVersion {
    pub number: u32,
    /// DDL that creates an empty store at this version
    pub ddl: &'static str,
    /// Explicit transform to the next version; `None` copies matching columns
    pub mapping_to_next: Option<MappingFn>,
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaVersion")
            .field("number", &self.number)
            .field("explicit_mapping", &self.mapping_to_next.is_some())
            .finish()
    }
}

/// How rows move from the source to the destination store
#[derive(Clone, Copy)]
pub enum Mapping {
    /// Copy every column the two layouts share
    Inferred,
    Explicit(MappingFn),
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inferred => f.write_str("Inferred"),
            Self::Explicit(_) => f.write_str("Explicit"),
        }
    }
}

/// A single transform from one version to its immediate successor
#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub source: u32,
    pub destination: u32,
    pub destination_ddl: &'static str,
    pub destination_signature: String,
    pub mapping: Mapping,
}

/// Ordered, linear chain of declared versions
pub struct VersionRegistry {
    versions: Vec<SchemaVersion>,
    signatures: Vec<OnceLock<String>>,
}

impl VersionRegistry {
    /// Build a registry; versions must be non-empty and strictly increasing
    pub fn new(versions: Vec<SchemaVersion>) -> Result<Self, SchemaError> {
        if versions.is_empty() {
            return Err(SchemaError::InvalidChain("no versions declared".to_string()));
        }
        if let Some(pair) = versions.windows(2).find(|w| w[0].number >= w[1].number) {
            return Err(SchemaError::InvalidChain(format!(
                "version {} declared after {}",
                pair[1].number, pair[0].number
            )));
        }
        Ok(Self::from_versions(versions))
    }

    /// The versions this build knows about
    pub fn builtin() -> Self {
        let versions = builtin_versions();
        debug_assert!(versions.windows(2).all(|w| w[0].number < w[1].number));
        Self::from_versions(versions)
    }

    fn from_versions(versions: Vec<SchemaVersion>) -> Self {
        let signatures = versions.iter().map(|_| OnceLock::new()).collect();
        Self { versions, signatures }
    }

    /// Last declared version
    pub fn latest(&self) -> &SchemaVersion {
        // `new` and `builtin` never produce an empty chain
        &self.versions[self.versions.len() - 1]
    }

    pub fn versions(&self) -> &[SchemaVersion] {
        &self.versions
    }

    pub fn get(&self, number: u32) -> Option<&SchemaVersion> {
        self.versions.iter().find(|v| v.number == number)
    }

    fn index_of(&self, number: u32) -> Result<usize, SchemaError> {
        self.versions
            .iter()
            .position(|v| v.number == number)
            .ok_or(SchemaError::UnknownVersion(number))
    }

    /// Structural signature of a declared version, computed once
    pub fn signature_of(&self, number: u32) -> Result<&str, SchemaError> {
        let index = self.index_of(number)?;
        if let Some(sig) = self.signatures[index].get() {
            return Ok(sig.as_str());
        }
        let sig = signature::signature_of_ddl(self.versions[index].ddl)?;
        Ok(self.signatures[index].get_or_init(|| sig).as_str())
    }

    /// Recognise the version of an existing store.
    ///
    /// Newest versions are checked first, so a current store only costs
    /// one comparison.
    pub fn detect(&self, conn: &Connection) -> Result<&SchemaVersion, SchemaError> {
        let store_signature = signature::structural_signature(conn)?;

        let mut found: Option<&SchemaVersion> = None;
        for version in self.versions.iter().rev() {
            if self.signature_of(version.number)? != store_signature {
                continue;
            }
            match found {
                None => {
                    found = Some(version);
                    if !cfg!(debug_assertions) {
                        break;
                    }
                }
                Some(first) => {
                    debug_assert!(
                        false,
                        "schema versions {} and {} share a structural signature",
                        first.number,
                        version.number
                    );
                }
            }
        }

        match found {
            Some(version) => {
                log::debug!("Store matches schema version {}", version.number);
                Ok(version)
            }
            None => Err(SchemaError::NoCompatibleVersion {
                signature: store_signature,
            }),
        }
    }

    /// Steps from `from` to the latest version; empty iff `from` is latest
    pub fn migration_path(&self, from: u32) -> Result<Vec<MigrationStep>, SchemaError> {
        self.migration_path_to(from, self.latest().number)
    }

    /// Steps from `from` to `to`, in order
    pub fn migration_path_to(&self, from: u32, to: u32) -> Result<Vec<MigrationStep>, SchemaError> {
        let start = self.index_of(from)?;
        let end = self.index_of(to)?;
        if end < start {
            return Err(SchemaError::Downgrade { from, to });
        }

        (start..end)
            .map(|i| {
                let source = &self.versions[i];
                let destination = &self.versions[i + 1];
                Ok(MigrationStep {
                    source: source.number,
                    destination: destination.number,
                    destination_ddl: destination.ddl,
                    destination_signature: self.signature_of(destination.number)?.to_string(),
                    mapping: source.mapping_to_next.map_or(Mapping::Inferred, Mapping::Explicit),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Connection) -> rusqlite::Result<()> {
        Ok(())
    }

    fn toy_registry() -> VersionRegistry {
        VersionRegistry::new(vec![
            SchemaVersion { number: 1, ddl: "CREATE TABLE a (x TEXT);", mapping_to_next: None },
            SchemaVersion { number: 2, ddl: "CREATE TABLE a (x TEXT, y TEXT);", mapping_to_next: Some(noop) },
            SchemaVersion { number: 3, ddl: "CREATE TABLE a (x TEXT, y TEXT, z TEXT);", mapping_to_next: None },
        ])
        .unwrap()
    }

    #[test]
    fn test_builtin_chain_is_valid() {
        let registry = VersionRegistry::new(builtin_versions()).unwrap();
        assert_eq!(registry.latest().number, 13);
        assert_eq!(registry.versions().first().map(|v| v.number), Some(8));
    }

    #[test]
    fn test_builtin_signatures_are_distinct() {
        let registry = VersionRegistry::builtin();
        let mut signatures: Vec<String> = registry
            .versions()
            .iter()
            .map(|v| registry.signature_of(v.number).unwrap().to_string())
            .collect();
        let count = signatures.len();
        signatures.sort();
        signatures.dedup();
        assert_eq!(signatures.len(), count);
    }

    #[test]
    fn test_rejects_unordered_chain() {
        let result = VersionRegistry::new(vec![
            SchemaVersion { number: 2, ddl: "", mapping_to_next: None },
            SchemaVersion { number: 1, ddl: "", mapping_to_next: None },
        ]);
        assert!(matches!(result, Err(SchemaError::InvalidChain(_))));
        assert!(matches!(VersionRegistry::new(vec![]), Err(SchemaError::InvalidChain(_))));
    }

    #[test]
    fn test_migration_path_empty_iff_latest() {
        let registry = VersionRegistry::builtin();
        let latest = registry.latest().number;

        for version in registry.versions() {
            let path = registry.migration_path(version.number).unwrap();
            assert_eq!(path.is_empty(), version.number == latest);
            if let (Some(first), Some(last)) = (path.first(), path.last()) {
                assert_eq!(first.source, version.number);
                assert_eq!(last.destination, latest);
                assert!(path.windows(2).all(|w| w[0].destination == w[1].source));
            }
        }
    }

    #[test]
    fn test_path_uses_declared_mappings() {
        let registry = toy_registry();
        let path = registry.migration_path(1).unwrap();
        assert_eq!(path.len(), 2);
        assert!(matches!(path[0].mapping, Mapping::Inferred));
        assert!(matches!(path[1].mapping, Mapping::Explicit(_)));
        assert_eq!(path[1].destination_signature, registry.signature_of(3).unwrap());
    }

    #[test]
    fn test_unknown_and_downgrade() {
        let registry = toy_registry();
        assert!(matches!(registry.migration_path(7), Err(SchemaError::UnknownVersion(7))));
        assert!(matches!(
            registry.migration_path_to(3, 1),
            Err(SchemaError::Downgrade { from: 3, to: 1 })
        ));
    }

    #[test]
    fn test_detect_each_builtin_version() {
        let registry = VersionRegistry::builtin();
        for version in registry.versions() {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch(version.ddl).unwrap();
            assert_eq!(registry.detect(&conn).unwrap().number, version.number);
        }
    }

    #[test]
    fn test_detect_unknown_layout() {
        let registry = VersionRegistry::builtin();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE books (id TEXT, title TEXT);").unwrap();
        assert!(matches!(
            registry.detect(&conn),
            Err(SchemaError::NoCompatibleVersion { .. })
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "share a structural signature")]
    fn test_duplicate_signatures_caught_in_debug() {
        let registry = VersionRegistry::new(vec![
            SchemaVersion { number: 1, ddl: "CREATE TABLE a (x TEXT);", mapping_to_next: None },
            SchemaVersion { number: 2, ddl: "CREATE TABLE a (x TEXT);", mapping_to_next: None },
        ])
        .unwrap();

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE a (x TEXT);").unwrap();
        let _ = registry.detect(&conn);
    }
}
