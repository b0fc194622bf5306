// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::borrow::Cow;
use std::sync::Arc;

use arrow_schema::Schema as ArrowSchema;
use object_store::path::Path;
use snafu::location;
use tracing::instrument;

use tessera_core::datatypes::Schema;
use tessera_core::stream::{SendableRecordBatchStream, StreamingWriteSource};
use tessera_core::Error;
use tessera_io::ObjectStore;
use tessera_table::format::Fragment;

use crate::dataset::write::do_write_fragments;
use crate::dataset::{Dataset, WriteMode, WriteParams};
use crate::Result;

/// Builder for writing fragments outside of a commit.
///
/// This builder can be re-used to write multiple fragments.
pub struct FragmentCreateBuilder<'a> {
    dataset_uri: &'a str,
    schema: Option<&'a Schema>,
    write_params: Option<&'a WriteParams>,
}

/// Everything resolved before the first byte is written.
struct WriteTarget<'a> {
    stream: SendableRecordBatchStream,
    schema: Schema,
    object_store: Arc<ObjectStore>,
    base: Path,
    params: Cow<'a, WriteParams>,
    /// The dataset at the destination, if one exists and was looked up.
    dataset: Option<Dataset>,
}

impl WriteTarget<'_> {
    fn next_fragment_id(&self) -> u64 {
        self.dataset
            .as_ref()
            .map(|dataset| dataset.manifest().next_fragment_id())
            .unwrap_or_default()
    }
}

impl<'a> FragmentCreateBuilder<'a> {
    pub fn new(dataset_uri: &'a str) -> Self {
        Self {
            dataset_uri,
            schema: None,
            write_params: None,
        }
    }

    /// Fix the schema of the written data, including its field ids.
    ///
    /// Without it, an [`WriteMode::Append`] write takes the schema of the
    /// existing dataset, and any other write derives one from the source.
    pub fn schema(mut self, schema: &'a Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the write parameters.
    pub fn write_params(mut self, params: &'a WriteParams) -> Self {
        self.write_params = Some(params);
        self
    }

    /// Write a single fragment.
    ///
    /// All the data goes into a single data file, regardless of
    /// `max_rows_per_file` and `max_bytes_per_file`. If `id` is not given,
    /// the next unused fragment id of the dataset is taken, or 0 if the
    /// dataset does not exist yet.
    ///
    /// The fragment is not committed to the dataset.
    #[instrument(level = "debug", skip_all, fields(uri = self.dataset_uri, id = ?id))]
    pub async fn write(
        &self,
        source: impl StreamingWriteSource,
        id: Option<u64>,
    ) -> Result<Fragment> {
        let target = self.prepare(source, id.is_none()).await?;
        let id = id.unwrap_or_else(|| target.next_fragment_id());
        let params = WriteParams {
            max_rows_per_file: usize::MAX,
            max_bytes_per_file: usize::MAX,
            ..target.params.into_owned()
        };

        let fragments = do_write_fragments(
            target.object_store,
            &target.base,
            &target.schema,
            target.stream,
            &params,
            id,
        )
        .await?;
        match <[Fragment; 1]>::try_from(fragments) {
            Ok([fragment]) => Ok(fragment),
            Err(fragments) if fragments.is_empty() => {
                Err(Error::invalid_input("Input data was empty.", location!()))
            }
            Err(fragments) => Err(Error::internal(
                format!("expected a single fragment but wrote {}", fragments.len()),
                location!(),
            )),
        }
    }

    /// Write as many fragments as `max_rows_per_file` and
    /// `max_bytes_per_file` call for, with consecutive ids.
    ///
    /// Returns no fragments if the source has no rows.
    #[instrument(level = "debug", skip_all, fields(uri = self.dataset_uri))]
    pub async fn write_fragments(
        &self,
        source: impl StreamingWriteSource,
    ) -> Result<Vec<Fragment>> {
        let target = self.prepare(source, true).await?;
        let first_id = target.next_fragment_id();
        do_write_fragments(
            target.object_store,
            &target.base,
            &target.schema,
            target.stream,
            &target.params,
            first_id,
        )
        .await
    }

    /// Check the source, then resolve the store, the schema and, when
    /// `need_dataset` is set or the schema comes from it, the existing dataset.
    async fn prepare(
        &self,
        source: impl StreamingWriteSource,
        need_dataset: bool,
    ) -> Result<WriteTarget<'a>> {
        check_not_empty(source.arrow_schema().as_ref())?;
        let params = self.write_params.map_or_else(
            || Cow::Owned(WriteParams::default()),
            Cow::Borrowed,
        );
        let store_params = params.store_params.clone().unwrap_or_default();

        let schema_from_dataset = self.schema.is_none() && params.mode == WriteMode::Append;
        let dataset = if need_dataset || schema_from_dataset {
            match Dataset::open_with_params(self.dataset_uri, &store_params).await {
                Ok(dataset) => Some(dataset),
                Err(Error::DatasetNotFound { .. }) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let (stream, schema) = match (self.schema, &dataset) {
            (Some(schema), _) => (source.into_stream(), schema.clone()),
            // The dataset schema carries the field ids of existing data.
            (None, Some(dataset)) if schema_from_dataset => {
                (source.into_stream(), dataset.schema().clone())
            }
            _ => source.into_stream_and_schema()?,
        };
        Schema::try_from(stream.schema().as_ref())?.check_compatible(&schema)?;

        let (object_store, base) =
            ObjectStore::from_uri_and_params(self.dataset_uri, &store_params).await?;
        Ok(WriteTarget {
            stream,
            schema,
            object_store,
            base,
            params,
            dataset,
        })
    }
}

fn check_not_empty(schema: &ArrowSchema) -> Result<()> {
    if schema.fields().is_empty() {
        return Err(Error::invalid_input(
            "Cannot write with an empty schema.",
            location!(),
        ));
    }
    Ok(())
}
