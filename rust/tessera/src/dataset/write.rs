// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use snafu::location;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tessera_core::chunker::chunk_stream;
use tessera_core::datatypes::Schema;
use tessera_core::stream::{RecordBatchStreamAdapter, SendableRecordBatchStream, StreamingWriteSource};
use tessera_core::{Error, Result};
use tessera_file::{FileVersion, FileWriter, FileWriterOptions};
use tessera_io::{ObjectStore, ObjectStoreParams};
use tessera_table::format::{DataFile, Fragment};
use tessera_table::io::commit::CommitHandler;

use super::progress::{NoopFragmentWriteProgress, WriteFragmentProgress};
use super::DATA_DIR;

/// The mode to write dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create a new dataset. Expect the dataset does not exist.
    Create,
    /// Append to an existing dataset.
    Append,
    /// Overwrite a dataset as a new version, or create new dataset if not exist.
    Overwrite,
}

impl TryFrom<&str> for WriteMode {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "append" => Ok(Self::Append),
            "overwrite" => Ok(Self::Overwrite),
            _ => Err(Error::invalid_input(
                format!("Invalid write mode: {}", value),
                location!(),
            )),
        }
    }
}

/// Dataset Write Parameters
#[derive(Debug, Clone)]
pub struct WriteParams {
    /// Max number of records per file.
    pub max_rows_per_file: usize,

    /// Max number of rows per row group.
    ///
    /// Clamped to `max_rows_per_file`.
    pub max_rows_per_group: usize,

    /// Max file size in bytes.
    ///
    /// This is a soft limit. It is checked after writing each group, so if
    /// max_rows_per_group is set to a large value, this limit may be exceeded
    /// by a large amount.
    ///
    /// The default is 90 GB. If you are using an object store such as S3, we
    /// currently have a hard 100 GB limit.
    pub max_bytes_per_file: usize,

    /// Write mode
    pub mode: WriteMode,

    pub store_params: Option<ObjectStoreParams>,

    pub progress: Arc<dyn WriteFragmentProgress>,

    /// If present, dataset will use this to resolve and commit versions.
    ///
    /// Defaults to [`tessera_table::io::commit::ConditionalPutCommitHandler`].
    pub commit_handler: Option<Arc<dyn CommitHandler>>,

    /// The format version to use when writing data.
    ///
    /// If not specified then the latest stable version will be used.
    pub data_storage_version: Option<FileVersion>,
}

impl Default for WriteParams {
    fn default() -> Self {
        Self {
            max_rows_per_file: 1024 * 1024, // 1 million
            max_rows_per_group: 1024,
            // object-store has a 100GB limit, so we should at least make sure
            // we are under that.
            max_bytes_per_file: 90 * 1024 * 1024 * 1024, // 90 GB
            mode: WriteMode::Create,
            store_params: None,
            progress: Arc::new(NoopFragmentWriteProgress::new()),
            commit_handler: None,
            data_storage_version: None,
        }
    }
}

impl WriteParams {
    /// Create a new WriteParams with the given storage version.
    /// The other fields are set to their default values.
    pub fn with_storage_version(version: FileVersion) -> Self {
        Self {
            data_storage_version: Some(version),
            ..Default::default()
        }
    }

    pub fn storage_version_or_default(&self) -> FileVersion {
        self.data_storage_version.unwrap_or_default().resolve()
    }
}

/// Writes the given data to the dataset at `dest` and returns fragments.
///
/// The fragments get consecutive ids, starting at the next unused id of the
/// dataset, but are not committed. Pass them to [`super::Dataset::commit`]
/// to make them part of a version.
pub async fn write_fragments(
    dest: &str,
    data: impl StreamingWriteSource,
    params: WriteParams,
) -> Result<Vec<Fragment>> {
    super::fragment::write::FragmentCreateBuilder::new(dest)
        .write_params(&params)
        .write_fragments(data)
        .await
}

/// A fragment whose data file is open.
struct OpenFragment {
    writer: FileWriter,
    /// Path of the data file, relative to the data directory.
    data_file_key: String,
    fragment: Fragment,
    finalized: bool,
}

/// Open a new data file for fragment `id` and announce it to `progress`.
async fn open_fragment(
    object_store: &ObjectStore,
    base_dir: &Path,
    schema: &Schema,
    id: u64,
    storage_version: FileVersion,
    progress: &dyn WriteFragmentProgress,
) -> Result<OpenFragment> {
    let data_file_key = format!("{}.lance", Uuid::new_v4());
    let full_path = base_dir.child(DATA_DIR).child(data_file_key.as_str());
    let writer = FileWriter::try_new(
        object_store.create(&full_path),
        full_path.to_string(),
        schema.clone(),
        FileWriterOptions {
            data_storage_version: Some(storage_version),
            ..Default::default()
        },
    )?;
    let fragment = Fragment::with_file(
        id,
        &data_file_key,
        schema,
        writer.column_indices().to_vec(),
        writer.version().to_numbers(),
        None,
    );
    let mut open = OpenFragment {
        writer,
        data_file_key,
        fragment,
        finalized: false,
    };
    // The upload is recorded by its data file key, which cleanup deletes
    if let Err(e) = progress.begin(&open.fragment, &open.data_file_key).await {
        // Nothing was written yet, do not leave an upload behind.
        if let Err(abort_err) = open.writer.abort().await {
            warn!(error = %abort_err, "failed to abort data file after progress error");
        }
        return Err(e);
    }
    debug!(fragment_id = id, path = %full_path, "started fragment");
    Ok(open)
}

/// Finish the data file of `open`, if any, and report the fragment complete.
async fn finish_open(
    open: &mut Option<OpenFragment>,
    progress: &dyn WriteFragmentProgress,
) -> Result<Option<Fragment>> {
    let Some(current) = open.as_mut() else {
        return Ok(None);
    };
    let num_rows = current.writer.finish().await?;
    current.finalized = true;

    let (major, minor) = current.writer.version().to_numbers();
    let schema = current.writer.schema();
    let mut fragment = current.fragment.clone();
    fragment.files = vec![DataFile::new(
        current.data_file_key.clone(),
        schema.field_ids(),
        current.writer.column_indices().to_vec(),
        major,
        minor,
    )];
    fragment.physical_rows = Some(num_rows as usize);

    progress.complete(&fragment).await?;
    debug!(fragment_id = fragment.id, rows = num_rows, "finished fragment");
    *open = None;
    Ok(Some(fragment))
}

/// Pull batches until the first non-empty one.
///
/// Returns the stream with that batch put back in front, or None if the
/// stream has no rows.
async fn peek_first_rows(
    mut stream: SendableRecordBatchStream,
) -> Result<Option<SendableRecordBatchStream>> {
    let arrow_schema = stream.schema();
    while let Some(batch) = stream.try_next().await? {
        if batch.num_rows() > 0 {
            let rest = futures::stream::once(async move { Ok(batch) }).chain(stream);
            return Ok(Some(Box::pin(RecordBatchStreamAdapter::new(
                arrow_schema,
                rest,
            ))));
        }
    }
    Ok(None)
}

/// Writes the given data to fragments under `base_dir`.
///
/// Fragments get consecutive ids starting at `first_fragment_id`. Every
/// fragment holds exactly one data file. `progress.begin` is called when a
/// fragment's file is opened, before any of its data is written, and
/// `progress.complete` once the file is finished.
///
/// A stream without rows produces no fragments and no progress calls.
///
/// On failure the open data file is aborted. Progress markers are left in
/// place so the write can be cleaned up later.
#[instrument(level = "debug", skip_all, fields(base = %base_dir, first_fragment_id = first_fragment_id))]
pub(crate) async fn do_write_fragments(
    object_store: Arc<ObjectStore>,
    base_dir: &Path,
    schema: &Schema,
    data: SendableRecordBatchStream,
    params: &WriteParams,
    first_fragment_id: u64,
) -> Result<Vec<Fragment>> {
    if schema.is_empty() {
        return Err(Error::invalid_input(
            "Cannot write with an empty schema.",
            location!(),
        ));
    }
    let max_rows_per_file = params.max_rows_per_file.max(1);
    let max_rows_per_group = params.max_rows_per_group.clamp(1, max_rows_per_file);
    let storage_version = params.storage_version_or_default();
    let progress = params.progress.as_ref();

    let Some(data) = peek_first_rows(data).await? else {
        return Ok(vec![]);
    };

    // The first fragment is announced before the first row group is pulled,
    // so a source that fails early still leaves its marker behind.
    let mut open = Some(
        open_fragment(
            &object_store,
            base_dir,
            schema,
            first_fragment_id,
            storage_version,
            progress,
        )
        .await?,
    );
    let mut fragments = Vec::new();

    let result = async {
        let mut buffered_reader = chunk_stream(data, max_rows_per_group);
        while let Some(batch_chunk) = buffered_reader.next().await {
            let batch_chunk = batch_chunk?;
            for batch in batch_chunk.iter() {
                Schema::try_from(batch.schema().as_ref())?.check_compatible(schema)?;
            }

            let current = match open.take() {
                Some(current) => current,
                None => {
                    open_fragment(
                        &object_store,
                        base_dir,
                        schema,
                        first_fragment_id + fragments.len() as u64,
                        storage_version,
                        progress,
                    )
                    .await?
                }
            };
            let current = open.insert(current);

            current.writer.write(&batch_chunk).await?;
            if current.writer.rows_written() as usize >= max_rows_per_file
                || current.writer.tell().await? as usize >= params.max_bytes_per_file
            {
                if let Some(fragment) = finish_open(&mut open, progress).await? {
                    fragments.push(fragment);
                }
            }
        }
        if let Some(fragment) = finish_open(&mut open, progress).await? {
            fragments.push(fragment);
        }
        Ok::<_, Error>(())
    }
    .await;

    if let Err(e) = result {
        if let Some(current) = open.as_mut() {
            if !current.finalized {
                if let Err(abort_err) = current.writer.abort().await {
                    warn!(error = %abort_err, "failed to abort data file");
                }
            }
        }
        return Err(e);
    }
    Ok(fragments)
}
