// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_ipc::reader::FileReader as IpcFileReader;
use arrow_schema::Schema as ArrowSchema;
use bytes::Bytes;
use object_store::path::Path;
use snafu::location;
use tracing::instrument;

use tessera_core::datatypes::Schema;
use tessera_core::{Error, Result};
use tessera_io::ObjectStore;

use crate::version::FileVersion;
use crate::{default_column_indices, FILE_VERSION_KEY};

/// Reads a data file written by [`crate::FileWriter`].
///
/// The whole file is fetched on open. Row groups are decoded on demand.
#[derive(Debug, Clone)]
pub struct FileReader {
    path: Path,
    /// The fields stored in the file.
    schema: Schema,
    /// Column index of each field of `schema`, in pre-order.
    column_indices: Vec<i32>,
    version: FileVersion,
    num_row_groups: usize,
    bytes: Bytes,
}

impl FileReader {
    /// Open the data file at `path`.
    ///
    /// `schema` holds the fields stored in the file. `column_indices` maps
    /// them to file columns; when empty, top level fields are assumed to be
    /// stored in order.
    #[instrument(level = "debug", skip(object_store, schema, column_indices))]
    pub async fn try_open(
        object_store: &ObjectStore,
        path: &Path,
        schema: Schema,
        column_indices: &[i32],
    ) -> Result<Self> {
        let bytes = object_store.read_one_all(path).await?;
        let reader = IpcFileReader::try_new(Cursor::new(bytes.clone()), None)
            .map_err(|e| Error::corrupt_file(path.clone(), e.to_string(), location!()))?;

        let version = match reader.schema().metadata().get(FILE_VERSION_KEY) {
            Some(version) => FileVersion::from_str(version)?,
            None => FileVersion::Legacy,
        };
        let num_row_groups = reader.num_batches();

        let column_indices = if column_indices.is_empty() {
            default_column_indices(&schema)
        } else {
            column_indices.to_vec()
        };
        let num_fields = schema.fields_pre_order().count();
        if column_indices.len() != num_fields {
            return Err(Error::corrupt_file(
                path.clone(),
                format!(
                    "expected {} column indices but found {}",
                    num_fields,
                    column_indices.len()
                ),
                location!(),
            ));
        }

        Ok(Self {
            path: path.clone(),
            schema,
            column_indices,
            version,
            num_row_groups,
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn version(&self) -> FileVersion {
        self.version
    }

    pub fn num_row_groups(&self) -> usize {
        self.num_row_groups
    }

    /// Resolve the top level fields of `projection` to file columns.
    ///
    /// Returns the column indices and the schema of the decoded batches.
    /// Projecting into a struct reads the whole struct.
    fn plan_projection(&self, projection: &Schema) -> Result<(Vec<usize>, Schema)> {
        let field_ids = self.schema.field_ids();
        let mut columns = Vec::with_capacity(projection.fields.len());
        let mut top_level_ids = Vec::with_capacity(projection.fields.len());
        for field in projection.fields.iter() {
            let column = field_ids
                .iter()
                .position(|id| *id == field.id)
                .map(|pos| self.column_indices[pos])
                .filter(|column| *column >= 0)
                .ok_or_else(|| {
                    Error::invalid_input(
                        format!(
                            "field '{}' (id {}) is not stored in data file {}",
                            field.name, field.id, self.path
                        ),
                        location!(),
                    )
                })?;
            columns.push(column as usize);
            top_level_ids.push(field.id);
        }
        // Keep the caller's column order
        let mut output = self.schema.project_by_ids(&top_level_ids, true);
        output.fields = top_level_ids
            .iter()
            .filter_map(|id| output.fields.iter().find(|f| f.id == *id).cloned())
            .collect();
        Ok((columns, output))
    }

    /// Decode every row group, keeping only the fields in `projection`.
    ///
    /// Returns one batch per row group.
    pub fn read_all(&self, projection: &Schema) -> Result<Vec<RecordBatch>> {
        let (columns, output_schema) = self.plan_projection(projection)?;
        let output_schema = Arc::new(ArrowSchema::from(&output_schema));
        let reader = IpcFileReader::try_new(Cursor::new(self.bytes.clone()), Some(columns))
            .map_err(|e| Error::corrupt_file(self.path.clone(), e.to_string(), location!()))?;
        reader
            .map(|batch| -> Result<RecordBatch> {
                let batch = batch?;
                Ok(RecordBatch::try_new(
                    output_schema.clone(),
                    batch.columns().to_vec(),
                )?)
            })
            .collect()
    }

    /// Total number of rows stored in the file.
    pub fn count_rows(&self) -> Result<usize> {
        let first = self
            .schema
            .fields
            .first()
            .ok_or_else(|| Error::corrupt_file(self.path.clone(), "no fields", location!()))?;
        let projection = self.schema.project_by_ids(&[first.id], true);
        Ok(self
            .read_all(&projection)?
            .iter()
            .map(|batch| batch.num_rows())
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field as ArrowField};

    use super::*;
    use crate::{FileWriter, FileWriterOptions};

    async fn write_test_file(store: &ObjectStore, path: &Path, options: FileWriterOptions) -> Schema {
        let arrow_schema = Arc::new(ArrowSchema::new(vec![
            ArrowField::new("a", DataType::Int64, false),
            ArrowField::new("b", DataType::Utf8, true),
        ]));
        let schema = Schema::try_from(arrow_schema.as_ref()).unwrap();
        let mut writer =
            FileWriter::try_new(store.create(path), path.to_string(), schema.clone(), options)
                .unwrap();
        for start in [0, 10, 20] {
            let batch = RecordBatch::try_new(
                arrow_schema.clone(),
                vec![
                    Arc::new(Int64Array::from_iter_values(start..start + 10)),
                    Arc::new(StringArray::from_iter_values(
                        (start..start + 10).map(|i| format!("s-{i}")),
                    )),
                ],
            )
            .unwrap();
            writer.write(&[batch]).await.unwrap();
        }
        assert_eq!(writer.finish().await.unwrap(), 30);
        schema
    }

    #[tokio::test]
    async fn test_read_projection() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (store, base) = ObjectStore::from_uri(tmp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let path = base.child("data.lance");
        let schema = write_test_file(&store, &path, FileWriterOptions::default()).await;

        let reader = FileReader::try_open(&store, &path, schema.clone(), &[])
            .await
            .unwrap();
        assert_eq!(reader.num_row_groups(), 3);
        assert_eq!(reader.version(), FileVersion::V1_0);
        assert_eq!(reader.count_rows().unwrap(), 30);

        let projection = schema.project(&["b"]).unwrap();
        let batches = reader.read_all(&projection).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].num_columns(), 1);
        assert_eq!(batches[1].schema().field(0).name(), "b");
        let b = batches[1]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(b.value(0), "s-10");
    }

    #[tokio::test]
    async fn test_compressed_file() {
        let store = ObjectStore::memory();
        let path = Path::from("reader_test/compressed.lance");
        let options = FileWriterOptions {
            compression: Some(arrow_ipc::CompressionType::ZSTD),
            ..Default::default()
        };
        let schema = write_test_file(&store, &path, options).await;
        let reader = FileReader::try_open(&store, &path, schema.clone(), &[0, 1])
            .await
            .unwrap();
        let batches = reader.read_all(&schema.project(&["a"]).unwrap()).unwrap();
        let a = batches[2]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(a.values().to_vec(), (20..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let store = ObjectStore::memory();
        let path = Path::from("reader_test/garbage.lance");
        store.put(&path, b"not a data file".to_vec()).await.unwrap();
        let schema = Schema::try_from(&ArrowSchema::new(vec![ArrowField::new(
            "a",
            DataType::Int64,
            false,
        )]))
        .unwrap();
        let err = FileReader::try_open(&store, &path, schema, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptFile { .. }), "{err:?}");
    }
}
