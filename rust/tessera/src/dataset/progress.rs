// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Progress tracking for fragment writes.
//!
//! A [WriteFragmentProgress] is told when a fragment starts and when it is
//! complete. [FileSystemFragmentWriteProgress] records both events in a
//! directory so that writes interrupted by a crash can be found and cleaned
//! up afterwards:
//!
//! * `fragment_{id}.in_progress` holds an [InProgressFragment] marker. It is
//!   written before any data of the fragment and removed once the fragment
//!   is complete. Its `multipart_id` is the key of the data file being
//!   uploaded, relative to the dataset's `data` directory.
//! * `fragment_{id}.json` holds the fragment metadata. It is first written
//!   with the data file paths only and overwritten with the final metadata
//!   on completion.
//!
//! The final metadata is always written before the marker is removed, so a
//! fragment is complete exactly when its metadata knows its row count.
//!
//! Data files are uploaded through `object_store`'s buffered writer, which
//! does not expose the store's own upload id. Cleanup therefore deletes the
//! object recorded in the marker. Parts of an upload that never completed
//! are left to the store's lifecycle rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::location;
use tracing::{debug, info, instrument, warn};

use tessera_core::{Error, Result};
use tessera_io::ObjectStore;
use tessera_table::format::Fragment;

use super::{Dataset, DATA_DIR};

const IN_PROGRESS_SUFFIX: &str = ".in_progress";
const METADATA_SUFFIX: &str = ".json";
const FILE_PREFIX: &str = "fragment_";

/// Progress of writing a [Fragment].
///
/// When start writing a [`Fragment`], WriteProgress::begin() will be called before
/// writing any data.
///
/// When stop writing a [`Fragment`], WriteProgress::complete() will be called after.
#[async_trait]
pub trait WriteFragmentProgress: std::fmt::Debug + Sync + Send {
    /// Indicate the beginning of writing a [Fragment], with the in-flight multipart ID.
    ///
    /// `multipart_id` is the key of the data file the upload targets,
    /// relative to the dataset's `data` directory. `fragment` lists the data
    /// files about to be written. Its row count is not known yet. Returning
    /// an error aborts the write.
    async fn begin(&self, fragment: &Fragment, multipart_id: &str) -> Result<()>;

    /// Complete writing a [Fragment].
    async fn complete(&self, fragment: &Fragment) -> Result<()>;
}

/// By default, Progress tracker is Noop.
#[derive(Debug, Clone, Default)]
pub struct NoopFragmentWriteProgress {}

impl NoopFragmentWriteProgress {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl WriteFragmentProgress for NoopFragmentWriteProgress {
    #[inline]
    async fn begin(&self, _fragment: &Fragment, _multipart_id: &str) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn complete(&self, _fragment: &Fragment) -> Result<()> {
        Ok(())
    }
}

/// Content of an in-progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressFragment {
    pub fragment_id: u64,
    /// Data file key of the upload, relative to the dataset's `data` directory.
    pub multipart_id: String,
    /// Caller supplied metadata, see [FileSystemFragmentWriteProgress::try_new].
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What [FileSystemFragmentWriteProgress::cleanup_partial_writes] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Markers of fragments whose final metadata had been written.
    pub completed_fragments: usize,
    /// Markers of fragments that never finished. Their files were removed.
    pub partial_fragments: usize,
    /// Data files deleted from the dataset directory.
    pub data_files_removed: usize,
}

/// Records write progress as JSON files under a directory.
#[derive(Debug, Clone)]
pub struct FileSystemFragmentWriteProgress {
    object_store: Arc<ObjectStore>,
    base: Path,
    metadata: HashMap<String, String>,
}

impl FileSystemFragmentWriteProgress {
    /// Track progress under `progress_uri`.
    ///
    /// `metadata` is copied into every in-progress marker, so a crashed
    /// write can be traced back to the job that started it.
    pub async fn try_new(progress_uri: &str, metadata: HashMap<String, String>) -> Result<Self> {
        let (object_store, base) = ObjectStore::from_uri(progress_uri).await?;
        Ok(Self {
            object_store,
            base,
            metadata,
        })
    }

    fn in_progress_path(&self, fragment_id: u64) -> Path {
        self.base
            .child(format!("{FILE_PREFIX}{fragment_id}{IN_PROGRESS_SUFFIX}"))
    }

    fn fragment_file(&self, fragment_id: u64) -> Path {
        self.base
            .child(format!("{FILE_PREFIX}{fragment_id}{METADATA_SUFFIX}"))
    }

    /// Fragment ids of the in-progress markers in the progress directory.
    async fn marker_ids(&self) -> Result<Vec<u64>> {
        let mut ids = self
            .object_store
            .list(Some(&self.base))
            .try_filter_map(|meta| async move {
                // Only direct children of the progress directory.
                if meta.location.prefix_match(&self.base).map(|p| p.count()) != Some(1) {
                    return Ok(None);
                }
                Ok(meta
                    .location
                    .filename()
                    .and_then(|name| name.strip_prefix(FILE_PREFIX))
                    .and_then(|name| name.strip_suffix(IN_PROGRESS_SUFFIX))
                    .and_then(|id| id.parse::<u64>().ok()))
            })
            .try_collect::<Vec<_>>()
            .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn read_marker(&self, fragment_id: u64) -> Result<InProgressFragment> {
        let data = self
            .object_store
            .read_one_all(&self.in_progress_path(fragment_id))
            .await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Read `fragment_{id}.json`. Returns None if it does not exist.
    async fn read_fragment_file(&self, fragment_id: u64) -> Result<Option<Fragment>> {
        let path = self.fragment_file(fragment_id);
        match self.object_store.read_one_all(&path).await {
            Ok(data) => {
                let json = String::from_utf8_lossy(&data);
                Fragment::from_json(&json)
                    .map(Some)
                    .map_err(|e| Error::corrupt_file(path, e.to_string(), location!()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The fragments that have begun but not completed.
    pub async fn in_progress_fragments(&self) -> Result<Vec<InProgressFragment>> {
        let mut markers = Vec::new();
        for id in self.marker_ids().await? {
            match self.read_marker(id).await {
                Ok(marker) => markers.push(marker),
                // Completed between listing and reading
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(markers)
    }

    /// Remove the leftovers of writes that never completed.
    ///
    /// Only fragments with an in-progress marker are considered. A fragment
    /// whose final metadata was written is complete and only loses its
    /// marker. Otherwise the upload named by the marker's `multipart_id` and
    /// the data files listed in the preliminary metadata are deleted from
    /// `dataset_uri`, followed by the metadata file and the marker. Files
    /// referenced by the current version of the dataset are never deleted.
    ///
    /// This must not run while the writes it cleans up are still active.
    #[instrument(level = "debug", skip(self))]
    pub async fn cleanup_partial_writes(&self, dataset_uri: &str) -> Result<CleanupStats> {
        let (dataset_store, dataset_base) = ObjectStore::from_uri(dataset_uri).await?;
        let committed_files = match Dataset::open(dataset_uri).await {
            Ok(dataset) => dataset
                .manifest()
                .fragments
                .iter()
                .flat_map(|f| f.files.iter().map(|file| file.path.clone()))
                .collect::<HashSet<_>>(),
            Err(Error::DatasetNotFound { .. }) => HashSet::new(),
            Err(e) => return Err(e),
        };
        let data_dir = dataset_base.child(DATA_DIR);

        let mut stats = CleanupStats::default();
        for fragment_id in self.marker_ids().await? {
            let marker = match self.read_marker(fragment_id).await {
                Ok(marker) => marker,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let preliminary = match self.read_fragment_file(fragment_id).await? {
                Some(fragment) if fragment.physical_rows.is_some() => {
                    stats.completed_fragments += 1;
                    self.object_store
                        .delete_if_exists(&self.in_progress_path(fragment_id))
                        .await?;
                    continue;
                }
                Some(fragment) => fragment.files,
                None => {
                    debug!(fragment_id, "in-progress marker without fragment metadata");
                    vec![]
                }
            };
            stats.partial_fragments += 1;

            let mut paths = vec![marker.multipart_id];
            for file in preliminary {
                if !paths.contains(&file.path) {
                    paths.push(file.path);
                }
            }
            for path in paths.iter().filter(|p| !p.is_empty()) {
                if committed_files.contains(path) {
                    warn!(
                        fragment_id,
                        path = %path,
                        "data file of an unfinished fragment is committed, keeping it"
                    );
                    continue;
                }
                if dataset_store
                    .delete_if_exists(&data_dir.child(path.as_str()))
                    .await?
                {
                    stats.data_files_removed += 1;
                }
            }
            self.object_store
                .delete_if_exists(&self.fragment_file(fragment_id))
                .await?;
            self.object_store
                .delete_if_exists(&self.in_progress_path(fragment_id))
                .await?;
        }
        info!(
            completed = stats.completed_fragments,
            partial = stats.partial_fragments,
            data_files_removed = stats.data_files_removed,
            "cleaned up partial fragment writes"
        );
        Ok(stats)
    }
}

#[async_trait]
impl WriteFragmentProgress for FileSystemFragmentWriteProgress {
    async fn begin(&self, fragment: &Fragment, multipart_id: &str) -> Result<()> {
        let marker = InProgressFragment {
            fragment_id: fragment.id,
            multipart_id: multipart_id.to_string(),
            metadata: self.metadata.clone(),
        };
        self.object_store
            .put(
                &self.in_progress_path(fragment.id),
                serde_json::to_vec(&marker)?,
            )
            .await?;
        self.object_store
            .put(&self.fragment_file(fragment.id), fragment.to_json()?)
            .await?;
        debug!(fragment_id = fragment.id, multipart_id, "fragment write started");
        Ok(())
    }

    async fn complete(&self, fragment: &Fragment) -> Result<()> {
        self.object_store
            .put(&self.fragment_file(fragment.id), fragment.to_json()?)
            .await?;
        self.object_store
            .delete_if_exists(&self.in_progress_path(fragment.id))
            .await?;
        debug!(fragment_id = fragment.id, "fragment write completed");
        Ok(())
    }
}
