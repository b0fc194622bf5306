// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Tessera Dataset
//!

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::prelude::*;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use snafu::location;
use tracing::{info, instrument};

use tessera_core::datatypes::Schema;
use tessera_core::stream::StreamingWriteSource;
use tessera_core::{box_error, Error, Result};
use tessera_io::{ObjectStore, ObjectStoreParams};
use tessera_table::format::{Fragment, Manifest};
use tessera_table::io::commit::{
    list_manifests, read_manifest, CommitHandler, ConditionalPutCommitHandler,
};

pub mod fragment;
pub mod progress;
pub mod scanner;
pub mod transaction;
pub mod write;

use self::fragment::FileFragment;
use self::scanner::Scanner;
use self::transaction::{Operation, Transaction};
use self::write::do_write_fragments;

pub use write::{write_fragments, WriteMode, WriteParams};

pub const DATA_DIR: &str = "data";

/// Fragments counted or rewritten at the same time.
const FRAGMENT_CONCURRENCY: usize = 16;

/// Tessera Dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    pub object_store: Arc<ObjectStore>,
    pub(crate) commit_handler: Arc<dyn CommitHandler>,
    /// The uri the dataset was opened with. [Dataset::base] is relative to
    /// the store and may not name the bucket.
    uri: String,
    pub(crate) base: Path,
    pub(crate) manifest: Arc<Manifest>,
}

/// Dataset Version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// version number
    pub version: u64,

    /// Timestamp of dataset creation in UTC.
    pub timestamp: DateTime<Utc>,

    /// Key-value pairs of metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Convert Manifest to Data Version.
impl From<&Manifest> for Version {
    fn from(m: &Manifest) -> Self {
        let mut metadata = BTreeMap::new();
        if let Some(operation) = &m.operation {
            metadata.insert("operation".to_string(), operation.clone());
        }
        if let Some(tag) = &m.tag {
            metadata.insert("tag".to_string(), tag.clone());
        }
        Self {
            version: m.version,
            timestamp: m.timestamp(),
            metadata,
        }
    }
}

fn default_commit_handler() -> Arc<dyn CommitHandler> {
    Arc::new(ConditionalPutCommitHandler)
}

/// Report a missing manifest as a missing dataset.
fn dataset_not_found(uri: &str, e: Error) -> Error {
    match e {
        Error::NotFound { .. } => Error::DatasetNotFound {
            path: uri.to_string(),
            source: box_error(e),
            location: location!(),
        },
        _ => e,
    }
}

impl Dataset {
    /// Open an existing dataset.
    ///
    /// See also [`Dataset::open_with_params`].
    #[instrument]
    pub async fn open(uri: &str) -> Result<Self> {
        Self::open_with_params(uri, &ObjectStoreParams::default()).await
    }

    /// Open the latest version of an existing dataset with custom store parameters.
    pub async fn open_with_params(uri: &str, params: &ObjectStoreParams) -> Result<Self> {
        let (object_store, base) = ObjectStore::from_uri_and_params(uri, params).await?;
        Self::load(object_store, base, uri, default_commit_handler()).await
    }

    async fn load(
        object_store: Arc<ObjectStore>,
        base: Path,
        uri: &str,
        commit_handler: Arc<dyn CommitHandler>,
    ) -> Result<Self> {
        let location = commit_handler
            .resolve_latest_location(&base, &object_store)
            .await
            .map_err(|e| dataset_not_found(uri, e))?;
        let manifest = read_manifest(&object_store, &location.path)
            .await
            .map_err(|e| dataset_not_found(uri, e))?;
        Ok(Self {
            object_store,
            commit_handler,
            uri: uri.to_string(),
            base,
            manifest: Arc::new(manifest),
        })
    }

    /// Check out a specific version of the dataset.
    pub async fn checkout_version(&self, version: u64) -> Result<Self> {
        let path = self.commit_handler.resolve_version(&self.base, version).await?;
        let manifest = read_manifest(&self.object_store, &path)
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => Error::DatasetNotFound {
                    path: format!("{} (version {})", self.uri, version),
                    source: box_error(e),
                    location: location!(),
                },
                _ => e,
            })?;
        Ok(Self {
            manifest: Arc::new(manifest),
            ..self.clone()
        })
    }

    /// Check out the latest version of the dataset
    pub async fn checkout_latest(&mut self) -> Result<()> {
        let location = self
            .commit_handler
            .resolve_latest_location(&self.base, &self.object_store)
            .await?;
        self.manifest = Arc::new(read_manifest(&self.object_store, &location.path).await?);
        Ok(())
    }

    /// Write to or Create a [Dataset] with a stream of [RecordBatch](arrow_array::RecordBatch)es.
    ///
    /// The data is split into fragments following `params`, then committed
    /// as a single new version:
    ///
    /// * [WriteMode::Create] fails with [Error::DatasetAlreadyExists] if there
    ///   is a dataset at `uri`.
    /// * [WriteMode::Append] adds the fragments to the latest version, or
    ///   creates the dataset if it does not exist. The data must match the
    ///   dataset schema.
    /// * [WriteMode::Overwrite] replaces all fragments and the schema.
    #[instrument(level = "debug", skip_all, fields(uri = uri))]
    pub async fn write(
        source: impl StreamingWriteSource,
        uri: &str,
        params: Option<WriteParams>,
    ) -> Result<Self> {
        let params = params.unwrap_or_default();
        let store_params = params.store_params.clone().unwrap_or_default();
        let (object_store, base) = ObjectStore::from_uri_and_params(uri, &store_params).await?;
        let commit_handler = params
            .commit_handler
            .clone()
            .unwrap_or_else(default_commit_handler);

        let existing =
            match Self::load(object_store.clone(), base.clone(), uri, commit_handler.clone())
                .await
            {
                Ok(dataset) => Some(dataset),
                Err(Error::DatasetNotFound { .. }) => None,
                Err(e) => return Err(e),
            };
        if params.mode == WriteMode::Create && existing.is_some() {
            return Err(Error::DatasetAlreadyExists {
                uri: uri.to_string(),
                location: location!(),
            });
        }

        let (stream, mut schema) = source.into_stream_and_schema()?;
        if schema.is_empty() {
            return Err(Error::invalid_input(
                "Cannot write with an empty schema.",
                location!(),
            ));
        }
        let append_to = existing
            .as_ref()
            .filter(|_| params.mode == WriteMode::Append);
        if let Some(dataset) = append_to {
            // Use the schema from the dataset, because it has the correct
            // field ids.
            schema.check_compatible(dataset.schema())?;
            schema = dataset.schema().clone();
        }

        let first_fragment_id = existing
            .as_ref()
            .map(|d| d.manifest.next_fragment_id())
            .unwrap_or_default();
        let fragments = do_write_fragments(
            object_store.clone(),
            &base,
            &schema,
            stream,
            &params,
            first_fragment_id,
        )
        .await?;

        let operation = if append_to.is_some() {
            Operation::Append { fragments }
        } else {
            Operation::Overwrite { fragments, schema }
        };
        let read_version = existing.as_ref().map(|d| d.manifest.version).unwrap_or(0);
        let transaction = Transaction::new(read_version, operation, None);
        Self::commit_transaction(object_store, base, uri, commit_handler, &transaction).await
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Get the full manifest of the dataset version.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Create a new version of [`Dataset`] from a collection of fragments.
    ///
    /// The fragments are usually written with [`write_fragments`] or
    /// [`FileFragment::create`] and collected from independent writers.
    ///
    /// # Arguments
    ///
    /// * `base_uri` - The base URI of the dataset
    /// * `operation` - A description of the change to commit
    /// * `read_version` - The version of the dataset that this change is based on.
    ///   May be omitted for an overwrite, which does not depend on previous data.
    /// * `store_params` Parameters controlling object store access to the manifest
    /// * `commit_handler` - How versions are resolved and written. Defaults to
    ///   [`ConditionalPutCommitHandler`].
    ///
    /// Nothing is written if the operation is invalid. If another writer
    /// committed the same version first, this fails with
    /// [`Error::CommitConflict`] and the other writer's version stays current.
    #[instrument(level = "debug", skip_all, fields(uri = base_uri, operation = operation.name()))]
    pub async fn commit(
        base_uri: &str,
        operation: Operation,
        read_version: Option<u64>,
        store_params: Option<ObjectStoreParams>,
        commit_handler: Option<Arc<dyn CommitHandler>>,
    ) -> Result<Self> {
        let read_version = match (read_version, &operation) {
            (Some(read_version), _) => read_version,
            (None, Operation::Overwrite { .. }) => 0,
            (None, _) => {
                return Err(Error::invalid_input(
                    format!(
                        "read_version must be specified for operation {}",
                        operation.name()
                    ),
                    location!(),
                ))
            }
        };
        let (object_store, base) =
            ObjectStore::from_uri_and_params(base_uri, &store_params.unwrap_or_default()).await?;
        let commit_handler = commit_handler.unwrap_or_else(default_commit_handler);
        let transaction = Transaction::new(read_version, operation, None);
        Self::commit_transaction(object_store, base, base_uri, commit_handler, &transaction).await
    }

    /// Build the next manifest on top of the latest version and commit it.
    async fn commit_transaction(
        object_store: Arc<ObjectStore>,
        base: Path,
        uri: &str,
        commit_handler: Arc<dyn CommitHandler>,
        transaction: &Transaction,
    ) -> Result<Self> {
        let latest = match commit_handler
            .resolve_latest_location(&base, &object_store)
            .await
        {
            Ok(location) => Some(read_manifest(&object_store, &location.path).await?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(latest) = &latest {
            if !transaction.can_rebase_onto(latest.version) {
                return Err(Error::CommitConflict {
                    version: latest.version + 1,
                    source: format!(
                        "{} was based on version {} but version {} has been committed since",
                        transaction.operation.name(),
                        transaction.read_version,
                        latest.version
                    )
                    .into(),
                    location: location!(),
                });
            }
        }

        let mut manifest = transaction.build_manifest(latest.as_ref())?;
        manifest.set_timestamp(Utc::now());
        commit_handler
            .commit(&manifest, &base, &object_store)
            .await?;
        info!(
            uri,
            version = manifest.version,
            operation = transaction.operation.name(),
            fragments = manifest.fragments.len(),
            "committed dataset version"
        );

        Ok(Self {
            object_store,
            commit_handler,
            uri: uri.to_string(),
            base,
            manifest: Arc::new(manifest),
        })
    }

    /// Create a Scanner to scan the dataset.
    pub fn scan(&self) -> Scanner {
        Scanner::new(Arc::new(self.clone()))
    }

    /// Count the rows of the dataset, or the rows matching `filter`.
    ///
    /// Without a filter only fragment metadata is read, unless a fragment
    /// does not record its physical row count.
    #[instrument(skip_all)]
    pub async fn count_rows(&self, filter: Option<String>) -> Result<usize> {
        match filter {
            Some(filter) => {
                let mut scanner = self.scan();
                scanner.filter(&filter)?;
                Ok(scanner.count_rows().await? as usize)
            }
            None => self.count_all_rows().await,
        }
    }

    pub(crate) async fn count_all_rows(&self) -> Result<usize> {
        self.sum_over_fragments(|f| async move { f.count_rows().await })
            .await
    }

    /// Number of rows marked deleted across all fragments.
    pub async fn count_deleted_rows(&self) -> Result<usize> {
        self.sum_over_fragments(|f| async move { f.count_deletions().await })
            .await
    }

    async fn sum_over_fragments<F, Fut>(&self, count: F) -> Result<usize>
    where
        F: Fn(FileFragment) -> Fut,
        Fut: std::future::Future<Output = Result<usize>>,
    {
        futures::stream::iter(self.get_fragments())
            .map(count)
            .buffer_unordered(FRAGMENT_CONCURRENCY)
            .try_fold(0, |total, n| futures::future::ready(Ok(total + n)))
            .await
    }

    /// Delete the rows matching `predicate`.
    ///
    /// Commits a new version in which the matching rows are marked deleted,
    /// even if nothing matched. Fragments left without rows are dropped from
    /// the version.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&mut self, predicate: &str) -> Result<()> {
        let outcomes = futures::stream::iter(self.get_fragments())
            .map(|fragment| async move {
                let before = fragment.metadata().clone();
                let after = fragment.delete(predicate).await?;
                Ok::<_, Error>((before, after.map(|f| f.metadata)))
            })
            .buffered(FRAGMENT_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        let mut updated_fragments = Vec::new();
        let mut deleted_fragment_ids = Vec::new();
        for (before, after) in outcomes {
            match after {
                None => deleted_fragment_ids.push(before.id),
                Some(after) if after != before => updated_fragments.push(after),
                Some(_) => {}
            }
        }

        let transaction = Transaction::new(
            self.manifest.version,
            Operation::Delete {
                updated_fragments,
                deleted_fragment_ids,
                predicate: predicate.to_string(),
            },
            None,
        );
        let committed = Self::commit_transaction(
            self.object_store.clone(),
            self.base.clone(),
            &self.uri,
            self.commit_handler.clone(),
            &transaction,
        )
        .await?;
        self.manifest = committed.manifest;
        Ok(())
    }

    pub(crate) fn object_store(&self) -> &ObjectStore {
        &self.object_store
    }

    pub(crate) fn data_dir(&self) -> Path {
        self.base.child(DATA_DIR)
    }

    pub fn version(&self) -> Version {
        Version::from(self.manifest.as_ref())
    }

    /// Get all versions.
    pub async fn versions(&self) -> Result<Vec<Version>> {
        let mut versions = Vec::new();
        for location in list_manifests(&self.object_store, &self.base).await? {
            let manifest = read_manifest(&self.object_store, &location.path).await?;
            versions.push(Version::from(&manifest));
        }
        Ok(versions)
    }

    /// The number of the latest committed version.
    ///
    /// Only resolves the latest manifest location, without reading it.
    pub async fn latest_version_id(&self) -> Result<u64> {
        self.commit_handler
            .resolve_latest_version_id(&self.base, &self.object_store)
            .await
    }

    pub fn count_fragments(&self) -> usize {
        self.manifest.fragments.len()
    }

    pub fn schema(&self) -> &Schema {
        &self.manifest.schema
    }

    /// The fragments of this version, in manifest order.
    pub fn get_fragments(&self) -> Vec<FileFragment> {
        self.fragments_where(|_| true)
    }

    /// The fragment with id `fragment_id`, if this version has it.
    pub fn get_fragment(&self, fragment_id: usize) -> Option<FileFragment> {
        self.fragments_where(|f| f.id == fragment_id as u64)
            .into_iter()
            .next()
    }

    fn fragments_where(&self, keep: impl Fn(&Fragment) -> bool) -> Vec<FileFragment> {
        let dataset = Arc::new(self.clone());
        self.manifest
            .fragments
            .iter()
            .filter(|f| keep(f))
            .map(|f| FileFragment::new(dataset.clone(), f.clone()))
            .collect()
    }
}
