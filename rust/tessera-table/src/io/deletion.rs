// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Deletion files: the row offsets removed from a fragment.
//!
//! A deletion file is written once and never modified. Deleting more rows
//! writes a new file that holds every deleted offset so far.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, LazyLock};

use arrow_array::cast::AsArray;
use arrow_array::types::UInt32Type;
use arrow_array::{Array, RecordBatch, UInt32Array};
use arrow_ipc::reader::FileReader as ArrowFileReader;
use arrow_ipc::writer::{FileWriter as ArrowFileWriter, IpcWriteOptions};
use arrow_ipc::CompressionType;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bytes::{Buf, Bytes};
use object_store::path::Path;
use rand::Rng;
use roaring::bitmap::RoaringBitmap;
use snafu::location;
use tracing::debug;

use tessera_core::utils::deletion::DeletionVector;
use tessera_core::{Error, Result};
use tessera_io::ObjectStore;

use crate::format::{DeletionFile, DeletionFileType, Fragment};

pub const DELETION_DIRS: &str = "_deletions";

/// Schema of array deletion files: a single non-null `row_id` column.
static DELETION_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![Field::new(
        "row_id",
        DataType::UInt32,
        false,
    )]))
});

/// Path of a deletion file: `_deletions/{fragment_id}-{read_version}-{id}.{suffix}`
/// under the dataset root.
pub fn deletion_file_path(base: &Path, fragment_id: u64, deletion_file: &DeletionFile) -> Path {
    base.child(DELETION_DIRS).child(format!(
        "{}-{}-{}.{}",
        fragment_id,
        deletion_file.read_version,
        deletion_file.id,
        deletion_file.file_type.suffix()
    ))
}

fn encode_array(offsets: &HashSet<u32>) -> Result<Vec<u8>> {
    let mut offsets = offsets.iter().copied().collect::<Vec<_>>();
    offsets.sort_unstable();
    let batch = RecordBatch::try_new(
        DELETION_SCHEMA.clone(),
        vec![Arc::new(UInt32Array::from(offsets))],
    )?;

    let options = IpcWriteOptions::default().try_with_compression(Some(CompressionType::ZSTD))?;
    let mut writer =
        ArrowFileWriter::try_new_with_options(Vec::new(), DELETION_SCHEMA.as_ref(), options)?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(writer.into_inner()?)
}

fn encode_bitmap(bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut out)?;
    Ok(out)
}

fn decode_array(path: &Path, data: Bytes) -> Result<DeletionVector> {
    let corrupt = |message: String| Error::corrupt_file(path.clone(), message, location!());

    let reader =
        ArrowFileReader::try_new(Cursor::new(data), None).map_err(|e| corrupt(e.to_string()))?;
    if reader.schema() != *DELETION_SCHEMA {
        return Err(corrupt(format!(
            "Expected schema {:?} in deletion file, got {:?}",
            DELETION_SCHEMA,
            reader.schema()
        )));
    }
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| corrupt(e.to_string()))?;
    let [batch] = batches.as_slice() else {
        return Err(corrupt(format!(
            "Expected exactly one batch in deletion file, got {}",
            batches.len()
        )));
    };

    let row_ids = batch.column(0).as_primitive::<UInt32Type>();
    if row_ids.null_count() > 0 {
        return Err(corrupt(
            "Null values are not allowed in deletion files".to_string(),
        ));
    }
    Ok(DeletionVector::Set(row_ids.values().iter().copied().collect()))
}

fn decode_bitmap(path: &Path, data: Bytes) -> Result<DeletionVector> {
    RoaringBitmap::deserialize_from(data.reader())
        .map(DeletionVector::Bitmap)
        .map_err(|e| Error::corrupt_file(path.clone(), e.to_string(), location!()))
}

/// Write a deletion file for a fragment for a given deletion vector.
///
/// Small sets are stored as an Arrow array, large ones as a roaring bitmap.
/// Returns `Ok(None)` and writes nothing if no rows are deleted.
pub async fn write_deletion_file(
    base: &Path,
    fragment_id: u64,
    read_version: u64,
    removed_rows: &DeletionVector,
    object_store: &ObjectStore,
) -> Result<Option<DeletionFile>> {
    if removed_rows.is_empty() {
        return Ok(None);
    }
    let (file_type, data) = match removed_rows {
        DeletionVector::Bitmap(bitmap) => (DeletionFileType::Bitmap, encode_bitmap(bitmap)?),
        DeletionVector::Set(offsets) => (DeletionFileType::Array, encode_array(offsets)?),
        DeletionVector::NoDeletions => return Ok(None),
    };

    let deletion_file = DeletionFile {
        read_version,
        id: rand::thread_rng().gen::<u64>(),
        file_type,
        num_deleted_rows: Some(removed_rows.len()),
    };
    let path = deletion_file_path(base, fragment_id, &deletion_file);
    object_store.put(&path, data).await?;
    debug!(path = %path, rows = removed_rows.len(), "wrote deletion file");

    Ok(Some(deletion_file))
}

/// Read the deletion vector of a fragment.
///
/// Returns `Ok(None)` if the fragment has no deletion file, and
/// [`Error::CorruptFile`] if the file exists but cannot be decoded.
pub async fn read_deletion_file(
    base: &Path,
    fragment: &Fragment,
    object_store: &ObjectStore,
) -> Result<Option<DeletionVector>> {
    let Some(deletion_file) = &fragment.deletion_file else {
        return Ok(None);
    };
    let path = deletion_file_path(base, fragment.id, deletion_file);
    let data = object_store.read_one_all(&path).await?;

    let deletion_vector = match deletion_file.file_type {
        DeletionFileType::Array => decode_array(&path, data)?,
        DeletionFileType::Bitmap => decode_bitmap(&path, data)?,
    };
    Ok(Some(deletion_vector))
}
