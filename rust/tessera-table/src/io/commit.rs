// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Version resolution and manifest commits.
//!
//! Committing version `n` means writing `_versions/{n}.manifest`, and that
//! file must be written at most once when writers race for it.
//!
//! The default [CommitHandler] is [ConditionalPutCommitHandler], which writes
//! the manifest with a create-if-not-exists put. Whoever creates
//! `_versions/{n}.manifest` first owns version `n`.

use std::fmt::Debug;

use object_store::path::Path;
use snafu::location;
use tracing::{debug, instrument};

use tessera_core::{Error, Result};
use tessera_io::ObjectStore;

use crate::format::Manifest;

pub const VERSIONS_DIR: &str = "_versions";
const MANIFEST_EXTENSION: &str = "manifest";

/// `{base}/_versions/{version}.manifest`
pub fn manifest_path(base: &Path, version: u64) -> Path {
    base.child(VERSIONS_DIR)
        .child(format!("{version}.{MANIFEST_EXTENSION}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocation {
    pub version: u64,
    pub path: Path,
    /// Size of the manifest file in bytes, when the listing reported it.
    pub size: Option<u64>,
}

/// The version number in a `{n}.manifest` file name.
pub fn parse_version_from_path(path: &Path) -> Result<u64> {
    let version = path
        .filename()
        .and_then(|name| name.strip_suffix(MANIFEST_EXTENSION))
        .and_then(|stem| stem.strip_suffix('.'))
        .and_then(|version| version.parse().ok());
    version.ok_or_else(|| {
        Error::internal(
            format!("{path} is not a manifest file"),
            location!(),
        )
    })
}

/// List the committed versions of the dataset at `base`, oldest first.
///
/// Files in the versions directory that are not manifests are ignored.
pub async fn list_manifests(
    object_store: &ObjectStore,
    base: &Path,
) -> Result<Vec<ManifestLocation>> {
    let listing = object_store
        .inner
        .list_with_delimiter(Some(&base.child(VERSIONS_DIR)))
        .await?;
    let mut manifests = listing
        .objects
        .into_iter()
        .filter_map(|meta| {
            let version = parse_version_from_path(&meta.location).ok()?;
            Some(ManifestLocation {
                version,
                path: meta.location,
                size: Some(meta.size as u64),
            })
        })
        .collect::<Vec<_>>();
    manifests.sort_by_key(|location| location.version);
    Ok(manifests)
}

/// The highest committed version, or `NotFound` if there is none.
async fn latest_manifest(object_store: &ObjectStore, base: &Path) -> Result<ManifestLocation> {
    match list_manifests(object_store, base).await?.pop() {
        Some(latest) => Ok(latest),
        None => Err(Error::NotFound {
            uri: manifest_path(base, 1).to_string(),
            location: location!(),
        }),
    }
}

/// Read and parse the manifest at `path`.
pub async fn read_manifest(object_store: &ObjectStore, path: &Path) -> Result<Manifest> {
    let data = object_store.read_one_all(path).await?;
    Manifest::from_json(&data)
        .map_err(|e| Error::corrupt_file(path.clone(), e.to_string(), location!()))
}

#[derive(Debug)]
pub enum CommitError {
    /// Another writer already committed this version.
    CommitConflict { version: u64 },
    OtherError(Error),
}

impl From<Error> for CommitError {
    fn from(e: Error) -> Self {
        Self::OtherError(e)
    }
}

impl From<CommitError> for Error {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::CommitConflict { version } => Self::CommitConflict {
                version,
                source: format!("version {version} was already committed by another writer")
                    .into(),
                location: location!(),
            },
            CommitError::OtherError(e) => e,
        }
    }
}

/// Where manifests live and how a new one is written.
///
/// When several writers try to commit the same version, exactly one must
/// succeed. That only holds if all writers of a dataset use the same handler.
#[async_trait::async_trait]
pub trait CommitHandler: Debug + Send + Sync {
    async fn resolve_latest_location(
        &self,
        base_path: &Path,
        object_store: &ObjectStore,
    ) -> Result<ManifestLocation> {
        latest_manifest(object_store, base_path).await
    }

    /// The latest version number, without reading its manifest.
    async fn resolve_latest_version_id(
        &self,
        base_path: &Path,
        object_store: &ObjectStore,
    ) -> Result<u64> {
        Ok(latest_manifest(object_store, base_path).await?.version)
    }

    /// Path of the manifest of `version`. It may not exist.
    async fn resolve_version(&self, base_path: &Path, version: u64) -> Result<Path> {
        Ok(manifest_path(base_path, version))
    }

    /// Write `manifest` as its version, or fail with
    /// [CommitError::CommitConflict] if that version already exists.
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
    ) -> std::result::Result<Path, CommitError>;
}

/// A commit implementation that relies on the store refusing to overwrite
/// an existing object.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalPutCommitHandler;

#[async_trait::async_trait]
impl CommitHandler for ConditionalPutCommitHandler {
    #[instrument(level = "debug", skip_all, fields(version = manifest.version))]
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
    ) -> std::result::Result<Path, CommitError> {
        let path = self.resolve_version(base_path, manifest.version).await?;
        let data = manifest.to_json()?;
        if object_store.put_if_not_exists(&path, data).await? {
            debug!(path = %path, "wrote manifest");
            Ok(path)
        } else {
            Err(CommitError::CommitConflict {
                version: manifest.version,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema};
    use tessera_core::datatypes::Schema;

    use super::*;

    fn manifest() -> Manifest {
        let schema = Schema::try_from(&ArrowSchema::new(vec![ArrowField::new(
            "a",
            DataType::Int32,
            true,
        )]))
        .unwrap();
        Manifest::new(schema, Arc::new(vec![]))
    }

    #[test]
    fn test_parse_version() {
        let base = Path::from("ds");
        assert_eq!(parse_version_from_path(&manifest_path(&base, 12)).unwrap(), 12);
        assert!(parse_version_from_path(&base.child("_versions").child("x.manifest")).is_err());
        assert!(parse_version_from_path(&base.child("_versions").child("3.txt")).is_err());
    }

    #[tokio::test]
    async fn test_commit_conflict() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (store, base) = ObjectStore::from_uri(tmp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let handler = ConditionalPutCommitHandler;

        assert!(handler
            .resolve_latest_location(&base, &store)
            .await
            .unwrap_err()
            .is_not_found());

        let mut manifest = manifest();
        let path = handler.commit(&manifest, &base, &store).await.unwrap();
        assert_eq!(path, manifest_path(&base, 1));

        manifest.tag = Some("other writer".to_string());
        let err = handler.commit(&manifest, &base, &store).await.unwrap_err();
        assert!(matches!(err, CommitError::CommitConflict { version: 1 }));
        assert!(matches!(
            Error::from(err),
            Error::CommitConflict { version: 1, .. }
        ));

        // The first writer's manifest is untouched
        let stored = read_manifest(&store, &path).await.unwrap();
        assert_eq!(stored.tag, None);

        let next = Manifest::new_from_previous(&manifest, manifest.schema.clone(), Arc::new(vec![]));
        handler.commit(&next, &base, &store).await.unwrap();
        // Stray files are not manifests
        store
            .put(&base.child(VERSIONS_DIR).child("notes.txt"), "hi")
            .await
            .unwrap();

        let latest = handler.resolve_latest_location(&base, &store).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(
            list_manifests(&store, &base)
                .await
                .unwrap()
                .iter()
                .map(|m| m.version)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
