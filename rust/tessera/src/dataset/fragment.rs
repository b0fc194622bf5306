// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! A fragment bound to the dataset version it belongs to.

pub mod write;

use std::cmp::Ordering;
use std::sync::Arc;

use arrow_array::Array;
use datafusion::prelude::Expr;
use datafusion::scalar::ScalarValue;
use futures::TryFutureExt;
use snafu::location;
use tracing::instrument;

use tessera_core::datatypes::Schema;
use tessera_core::stream::StreamingWriteSource;
use tessera_core::utils::deletion::DeletionVector;
use tessera_core::{Error, Result};
use tessera_file::FileReader;
use tessera_table::format::Fragment;
use tessera_table::io::deletion::{deletion_file_path, read_deletion_file, write_deletion_file};

use self::write::FragmentCreateBuilder;
use super::scanner::{read_fragment, Scanner};
use super::WriteParams;
use crate::dataset::Dataset;
use crate::io::exec::{evaluate_predicate, Planner};

/// A Fragment of a Tessera [`Dataset`].
#[derive(Debug, Clone)]
pub struct FileFragment {
    dataset: Arc<Dataset>,

    pub(super) metadata: Fragment,
}

impl FileFragment {
    /// Creates a new FileFragment.
    pub fn new(dataset: Arc<Dataset>, metadata: Fragment) -> Self {
        Self { dataset, metadata }
    }

    /// Create a new [`Fragment`] from a stream of record batches.
    ///
    /// Works whether or not a dataset exists at `dataset_uri`. Workers can
    /// each write a fragment this way and hand the results to a single
    /// [`Dataset::commit`].
    pub async fn create(
        dataset_uri: &str,
        id: usize,
        source: impl StreamingWriteSource,
        params: Option<WriteParams>,
    ) -> Result<Fragment> {
        let mut builder = FragmentCreateBuilder::new(dataset_uri);

        if let Some(params) = params.as_ref() {
            builder = builder.write_params(params);
        }

        builder.write(source, Some(id as u64)).await
    }

    pub fn dataset(&self) -> &Dataset {
        self.dataset.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        self.dataset.schema()
    }

    /// Returns the fragment's metadata.
    pub fn metadata(&self) -> &Fragment {
        &self.metadata
    }

    /// The id of this [`FileFragment`].
    pub fn id(&self) -> usize {
        self.metadata.id as usize
    }

    /// Live rows: physical rows minus deleted ones.
    ///
    /// Returns [`Error::CorruptFile`] if the metadata claims more deleted
    /// rows than the fragment holds.
    pub async fn count_rows(&self) -> Result<usize> {
        let (physical, deleted) =
            futures::future::try_join(self.physical_rows(), self.count_deletions()).await?;
        physical.checked_sub(deleted).ok_or_else(|| {
            let path = self.metadata.deletion_file.as_ref().map_or_else(
                || self.dataset.data_dir(),
                |file| deletion_file_path(&self.dataset.base, self.metadata.id, file),
            );
            Error::corrupt_file(
                path,
                format!(
                    "fragment {} has {} deleted rows but only {} physical rows",
                    self.metadata.id, deleted, physical
                ),
                location!(),
            )
        })
    }

    /// Rows marked deleted. Reads the deletion file only when its metadata
    /// does not record the count.
    pub async fn count_deletions(&self) -> Result<usize> {
        let Some(deletion_file) = &self.metadata.deletion_file else {
            return Ok(0);
        };
        if let Some(count) = deletion_file.num_deleted_rows {
            return Ok(count);
        }
        read_deletion_file(
            &self.dataset.base,
            &self.metadata,
            self.dataset.object_store(),
        )
        .map_ok(|dv| dv.map_or(0, |dv| dv.len()))
        .await
    }

    /// Rows stored in the fragment, deleted ones included.
    ///
    /// Falls back to counting the rows of the first data file when the
    /// fragment metadata predates the recorded count.
    pub async fn physical_rows(&self) -> Result<usize> {
        if let Some(physical_rows) = self.metadata.physical_rows {
            return Ok(physical_rows);
        }

        let [first, ..] = self.metadata.files.as_slice() else {
            return Err(Error::io(
                format!("Fragment {} does not contain any data", self.id()),
                location!(),
            ));
        };
        let reader = FileReader::try_open(
            self.dataset.object_store(),
            &self.dataset.data_dir().child(first.path.as_str()),
            first.schema(self.dataset.schema()),
            &first.column_indices,
        )
        .await?;
        reader.count_rows()
    }

    /// Scan this fragment only.
    pub fn scan(&self) -> Scanner {
        Scanner::from_fragment(self.dataset.clone(), self.metadata.clone())
    }

    /// Delete rows from the fragment.
    ///
    /// If all rows are deleted, returns `Ok(None)`. Otherwise, returns a new
    /// fragment with the updated deletion vector. This must be persisted to
    /// the manifest.
    #[instrument(level = "debug", skip(self), fields(id = self.metadata.id))]
    pub async fn delete(self, predicate: &str) -> Result<Option<Self>> {
        let mut scanner = self.scan();
        scanner.filter(predicate)?;
        let Some(filter) = scanner.filter else {
            return Ok(Some(self));
        };

        // Constant predicates need no read
        match &filter {
            Expr::Literal(ScalarValue::Boolean(Some(true))) => return Ok(None),
            Expr::Literal(ScalarValue::Boolean(_) | ScalarValue::Null) => return Ok(Some(self)),
            _ => {}
        }

        let mut deletion_vector = read_deletion_file(
            &self.dataset.base,
            &self.metadata,
            self.dataset.object_store(),
        )
        .await?
        .unwrap_or_default();
        let already_deleted = deletion_vector.len();

        // Evaluate over the physical rows so offsets match the deletion vector
        let mut columns = Planner::column_names_in_expr(&filter);
        if columns.is_empty() {
            columns.extend(self.dataset.schema().fields.first().map(|f| f.name.clone()));
        }
        let read_schema = self.dataset.schema().project(&columns)?;
        if let Some(batch) =
            read_fragment(&self.dataset, &self.metadata, &read_schema, false).await?
        {
            let predicate = Planner::new(batch.schema()).create_physical_expr(&filter)?;
            let matches = evaluate_predicate(predicate.as_ref(), &batch)?;
            deletion_vector.extend(
                (0..matches.len())
                    .filter(|i| matches.is_valid(*i) && matches.value(*i))
                    .map(|i| i as u32),
            );
        }

        if deletion_vector.len() == already_deleted {
            return Ok(Some(self));
        }
        self.write_deletions(deletion_vector).await
    }

    /// Persist `deletion_vector` as this fragment's deletion file, or return
    /// `None` if it covers every physical row.
    async fn write_deletions(mut self, deletion_vector: DeletionVector) -> Result<Option<Self>> {
        let physical_rows = self.physical_rows().await?;
        match deletion_vector.len().cmp(&physical_rows) {
            Ordering::Equal => return Ok(None),
            Ordering::Greater => {
                let out_of_range = deletion_vector
                    .to_sorted_vec()
                    .into_iter()
                    .filter(|offset| *offset as usize >= physical_rows)
                    .take(5)
                    .collect::<Vec<_>>();
                return Err(Error::Internal {
                    message: format!(
                        "fragment {} has {} physical rows but {} deleted rows, out of range: {:?}",
                        self.metadata.id,
                        physical_rows,
                        deletion_vector.len(),
                        out_of_range
                    ),
                    location: location!(),
                });
            }
            Ordering::Less => {}
        }

        self.metadata.deletion_file = write_deletion_file(
            &self.dataset.base,
            self.metadata.id,
            self.dataset.version().version,
            &deletion_vector,
            self.dataset.object_store(),
        )
        .await?;
        Ok(Some(self))
    }
}

impl From<FileFragment> for Fragment {
    fn from(fragment: FileFragment) -> Self {
        fragment.metadata
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int32Type;
    use arrow_array::{Int32Array, RecordBatch, RecordBatchIterator};
    use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema};
    use tessera_table::format::{DeletionFile, DeletionFileType};

    use super::*;

    async fn create_dataset(uri: &str) -> Dataset {
        let schema = Arc::new(ArrowSchema::new(vec![ArrowField::new(
            "i",
            DataType::Int32,
            true,
        )]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int32Array::from_iter_values(0..40))],
        );
        let params = WriteParams {
            max_rows_per_file: 20,
            ..Default::default()
        };
        Dataset::write(
            RecordBatchIterator::new(vec![batch], schema),
            uri,
            Some(params),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_fragment_count_rows() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let fragment = dataset.get_fragment(1).unwrap();
        assert_eq!(fragment.id(), 1);
        assert_eq!(fragment.physical_rows().await.unwrap(), 20);
        assert_eq!(fragment.count_rows().await.unwrap(), 20);
        assert_eq!(fragment.count_deletions().await.unwrap(), 0);

        // Unknown physical rows are read from the data file
        let mut metadata = fragment.metadata().clone();
        metadata.physical_rows = None;
        let legacy = FileFragment::new(Arc::new(dataset.clone()), metadata);
        assert_eq!(legacy.physical_rows().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_count_rows_rejects_excess_deletions() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;

        let mut metadata = dataset.get_fragment(0).unwrap().metadata().clone();
        metadata.deletion_file = Some(DeletionFile {
            read_version: 1,
            id: 3,
            file_type: DeletionFileType::Array,
            num_deleted_rows: Some(21),
        });
        let fragment = FileFragment::new(Arc::new(dataset), metadata);
        let err = fragment.count_rows().await.unwrap_err();
        assert!(matches!(err, Error::CorruptFile { .. }), "{err:?}");
        assert!(err.to_string().contains("21 deleted rows"), "{err}");
    }

    #[tokio::test]
    async fn test_fragment_delete() {
        let test_dir = tempfile::tempdir().unwrap();
        let dataset = create_dataset(test_dir.path().to_str().unwrap()).await;
        let fragment = dataset.get_fragment(0).unwrap();

        // Nothing matches
        let same = fragment.clone().delete("i > 100").await.unwrap().unwrap();
        assert_eq!(same.metadata(), fragment.metadata());
        let same = fragment.clone().delete("false").await.unwrap().unwrap();
        assert!(same.metadata().deletion_file.is_none());

        let updated = fragment.clone().delete("i < 5").await.unwrap().unwrap();
        let deletion_file = updated.metadata().deletion_file.clone().unwrap();
        assert_eq!(deletion_file.num_deleted_rows, Some(5));
        assert_eq!(deletion_file.read_version, 1);
        assert_eq!(updated.count_rows().await.unwrap(), 15);

        // The scan never returns deleted rows
        let batch = updated.scan().try_into_batch().await.unwrap();
        assert_eq!(
            batch["i"].as_primitive::<Int32Type>().values().to_vec(),
            (5..20).collect::<Vec<_>>()
        );

        // Deletes accumulate, already deleted rows are not counted twice
        let updated = updated.delete("i < 8").await.unwrap().unwrap();
        assert_eq!(updated.count_deletions().await.unwrap(), 8);

        assert!(updated.clone().delete("i >= 0").await.unwrap().is_none());
        assert!(fragment.delete("true").await.unwrap().is_none());
    }
}
