// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_ipc::writer::{FileWriter as IpcFileWriter, IpcWriteOptions};
use arrow_ipc::CompressionType;
use arrow_schema::{Schema as ArrowSchema, SchemaRef};
use arrow_select::concat::concat_batches;
use snafu::location;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use tessera_core::datatypes::Schema;
use tessera_core::{Error, Result};
use tessera_io::object_writer::ObjectWriter;
use tessera_io::traits::Writer;

use crate::version::FileVersion;
use crate::{default_column_indices, FILE_VERSION_KEY};

#[derive(Debug, Clone, Default)]
pub struct FileWriterOptions {
    /// Compress column buffers. Off by default.
    pub compression: Option<CompressionType>,
    /// Version of the file layout to write. Defaults to the stable version.
    pub data_storage_version: Option<FileVersion>,
}

/// Writes one data file.
///
/// Every call to [`Self::write`] produces one row group. Encoded bytes are
/// handed to the object writer right away so [`Self::tell`] reflects the
/// size of the file so far.
pub struct FileWriter {
    writer: ObjectWriter,
    path: String,
    schema: Schema,
    arrow_schema: SchemaRef,
    encoder: IpcFileWriter<Vec<u8>>,
    column_indices: Vec<i32>,
    version: FileVersion,
    rows_written: u64,
    num_row_groups: u32,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("rows_written", &self.rows_written)
            .field("num_row_groups", &self.num_row_groups)
            .finish()
    }
}

impl FileWriter {
    /// Create a new FileWriter
    pub fn try_new(
        object_writer: ObjectWriter,
        path: String,
        schema: Schema,
        options: FileWriterOptions,
    ) -> Result<Self> {
        if schema.is_empty() {
            return Err(Error::invalid_input(
                "Cannot write with an empty schema.",
                location!(),
            ));
        }
        schema.validate()?;

        let version = options.data_storage_version.unwrap_or_default().resolve();
        if version == FileVersion::Legacy {
            return Err(Error::not_supported(
                format!("writing {} files", version),
                location!(),
            ));
        }

        let mut metadata = schema.metadata.clone();
        metadata.insert(FILE_VERSION_KEY.to_string(), version.to_string());
        let arrow_schema = Arc::new(ArrowSchema::from(&schema).with_metadata(metadata));

        let write_options = IpcWriteOptions::default().try_with_compression(options.compression)?;
        let encoder = IpcFileWriter::try_new_with_options(Vec::new(), &arrow_schema, write_options)?;

        Ok(Self {
            writer: object_writer,
            path,
            column_indices: default_column_indices(&schema),
            schema,
            arrow_schema,
            encoder,
            version,
            rows_written: 0,
            num_row_groups: 0,
        })
    }

    /// Hand everything the encoder produced so far to the object writer.
    async fn flush_encoded(&mut self) -> Result<()> {
        let encoded = std::mem::take(self.encoder.get_mut());
        if !encoded.is_empty() {
            self.writer.write_all(&encoded).await?;
        }
        Ok(())
    }

    /// Align a batch with the file schema, matching columns by name.
    fn conform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let columns = self
            .schema
            .fields
            .iter()
            .map(|field| {
                batch.column_by_name(&field.name).cloned().ok_or_else(|| {
                    Error::invalid_input(
                        format!(
                            "Cannot write batch.  The batch was missing the column `{}`",
                            field.name
                        ),
                        location!(),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new(self.arrow_schema.clone(), columns)?)
    }

    /// Write `batches` as a single row group.
    #[instrument(level = "debug", skip_all, fields(path = %self.path))]
    pub async fn write(&mut self, batches: &[RecordBatch]) -> Result<()> {
        let num_rows = batches.iter().map(|b| b.num_rows() as u64).sum::<u64>();
        if num_rows == 0 {
            return Ok(());
        }
        self.rows_written = self.rows_written.checked_add(num_rows).ok_or_else(|| {
            Error::invalid_input(
                format!(
                    "cannot write batch with {} rows because {} rows have already been written",
                    num_rows, self.rows_written
                ),
                location!(),
            )
        })?;

        let batches = batches
            .iter()
            .map(|batch| self.conform(batch))
            .collect::<Result<Vec<_>>>()?;
        let row_group = concat_batches(&self.arrow_schema, &batches)?;
        self.encoder.write(&row_group)?;
        self.num_row_groups += 1;
        self.flush_encoded().await?;
        // Let a multipart upload make progress between row groups.
        self.writer.flush().await?;
        Ok(())
    }

    /// Write the footer and close the file.
    ///
    /// Returns the total number of rows written.
    pub async fn finish(&mut self) -> Result<u64> {
        self.encoder.finish()?;
        self.flush_encoded().await?;
        let result = self.writer.shutdown().await?;
        debug!(
            path = %self.path,
            rows = self.rows_written,
            row_groups = self.num_row_groups,
            size = result.size,
            "finished data file"
        );
        Ok(self.rows_written)
    }

    /// Abandon the file. Nothing becomes visible at its path.
    pub async fn abort(&mut self) -> Result<()> {
        self.writer.abort().await
    }

    /// Bytes written to the file so far.
    pub async fn tell(&mut self) -> Result<u64> {
        Ok(self.writer.tell().await? as u64)
    }

    pub fn column_indices(&self) -> &[i32] {
        &self.column_indices
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn version(&self) -> FileVersion {
        self.version
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{Int32Array, StringArray, StructArray};
    use arrow_schema::{DataType, Field as ArrowField, Fields};
    use object_store::path::Path;
    use tessera_io::ObjectStore;

    use super::*;

    fn nested_schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            ArrowField::new("a", DataType::Int32, false),
            ArrowField::new(
                "s",
                DataType::Struct(Fields::from(vec![
                    ArrowField::new("x", DataType::Int32, true),
                    ArrowField::new("y", DataType::Utf8, true),
                ])),
                true,
            ),
            ArrowField::new("b", DataType::Utf8, true),
        ])
    }

    #[test]
    fn test_column_indices() {
        let schema = Schema::try_from(&nested_schema()).unwrap();
        assert_eq!(default_column_indices(&schema), vec![0, 1, -1, -1, 2]);
    }

    #[tokio::test]
    async fn test_write_row_groups() {
        let store = ObjectStore::memory();
        let path = Path::from("writer_test/data.lance");
        let arrow_schema = Arc::new(ArrowSchema::new(vec![ArrowField::new(
            "a",
            DataType::Int32,
            false,
        )]));
        let schema = Schema::try_from(arrow_schema.as_ref()).unwrap();

        let mut writer = FileWriter::try_new(
            store.create(&path),
            path.to_string(),
            schema,
            FileWriterOptions::default(),
        )
        .unwrap();
        assert_eq!(writer.version(), FileVersion::V1_0);

        let batch = |start: i32| {
            RecordBatch::try_new(
                arrow_schema.clone(),
                vec![Arc::new(Int32Array::from_iter_values(start..start + 50))],
            )
            .unwrap()
        };
        writer.write(&[batch(0), batch(50)]).await.unwrap();
        let after_first = writer.tell().await.unwrap();
        assert!(after_first > 0);
        writer.write(&[batch(100)]).await.unwrap();
        assert!(writer.tell().await.unwrap() > after_first);
        // Empty row groups are skipped
        writer.write(&[]).await.unwrap();

        assert_eq!(writer.finish().await.unwrap(), 150);
        assert!(store.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_column() {
        let store = ObjectStore::memory();
        let path = Path::from("writer_test/missing.lance");
        let schema = Schema::try_from(&nested_schema()).unwrap();
        let mut writer = FileWriter::try_new(
            store.create(&path),
            path.to_string(),
            schema,
            FileWriterOptions::default(),
        )
        .unwrap();

        let other = Arc::new(ArrowSchema::new(vec![ArrowField::new(
            "a",
            DataType::Int32,
            false,
        )]));
        let batch =
            RecordBatch::try_new(other, vec![Arc::new(Int32Array::from(vec![1, 2, 3]))]).unwrap();
        let err = writer.write(&[batch]).await.unwrap_err();
        assert!(err.to_string().contains("missing the column `s`"), "{err}");

        writer.abort().await.unwrap();
        assert!(!store.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_reject_empty_schema_and_legacy() {
        let store = ObjectStore::memory();
        let path = Path::from("writer_test/empty.lance");
        let err = FileWriter::try_new(
            store.create(&path),
            path.to_string(),
            Schema::default(),
            FileWriterOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));

        let schema = Schema::try_from(&nested_schema()).unwrap();
        let err = FileWriter::try_new(
            store.create(&path),
            path.to_string(),
            schema,
            FileWriterOptions {
                data_storage_version: Some(FileVersion::Legacy),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }

    #[tokio::test]
    async fn test_nested_batch() {
        let store = ObjectStore::memory();
        let path = Path::from("writer_test/nested.lance");
        let arrow_schema = Arc::new(nested_schema());
        let schema = Schema::try_from(arrow_schema.as_ref()).unwrap();
        let mut writer = FileWriter::try_new(
            store.create(&path),
            path.to_string(),
            schema,
            FileWriterOptions::default(),
        )
        .unwrap();

        let DataType::Struct(struct_fields) = arrow_schema.field(1).data_type().clone() else {
            unreachable!()
        };
        let s = StructArray::new(
            struct_fields,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None])),
                Arc::new(StringArray::from(vec!["x", "y"])),
            ],
            None,
        );
        let batch = RecordBatch::try_new(
            arrow_schema.clone(),
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(s),
                Arc::new(StringArray::from(vec![Some("b"), None])),
            ],
        )
        .unwrap();
        writer.write(&[batch]).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 2);
    }
}
