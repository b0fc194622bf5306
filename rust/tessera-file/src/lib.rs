// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Tessera data files.
//!
//! A data file stores the columns of one fragment. Each row group is written
//! as one Arrow IPC record batch, so a file can be read back one row group at
//! a time.

pub mod reader;
pub mod version;
pub mod writer;

pub use reader::FileReader;
pub use version::FileVersion;
pub use writer::{FileWriter, FileWriterOptions};

/// Schema metadata key recording the format version a file was written with.
pub const FILE_VERSION_KEY: &str = "tessera:file_version";

/// Column index of every field of `schema`, in pre-order.
///
/// Top level fields are stored as one column each. Nested fields live inside
/// their parent's column and map to -1.
pub fn default_column_indices(schema: &tessera_core::datatypes::Schema) -> Vec<i32> {
    let mut next_column = 0;
    schema
        .fields_pre_order()
        .map(|field| {
            if field.parent_id() < 0 {
                next_column += 1;
                next_column - 1
            } else {
                -1
            }
        })
        .collect()
}
