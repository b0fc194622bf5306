// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Tessera datasets
//!
//! A dataset is a versioned list of fragments, each a set of Arrow data files
//! holding the same rows. Fragments are written independently, possibly by
//! many workers, and become visible when a single commit publishes them as a
//! new version.
//!
//! ## Examples
//!
//! ```no_run
//! # use std::sync::Arc;
//! use tessera::Dataset;
//! # use tokio::runtime::Runtime;
//! # use arrow_array::{Int32Array, RecordBatch, RecordBatchIterator};
//! # use arrow_schema::{Field, Schema, DataType};
//!
//! # let rt = Runtime::new().unwrap();
//! let schema = Arc::new(Schema::new(vec![Field::new(
//!     "i", DataType::Int32, false)]));
//! let batches: Vec<RecordBatch> = (0..20)
//!     .map(|i| { RecordBatch::try_new(schema.clone(),
//!         vec![Arc::new(Int32Array::from_iter_values(i * 20..(i + 1) * 20))],
//!     ).unwrap() }).collect();
//! let reader = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
//!
//! # rt.block_on(async {
//!     Dataset::write(reader, "/tmp/test.tessera", None).await.unwrap();
//! # })
//! ```
//!
//! Read the dataset:
//!
//! ```no_run
//! # use tokio::runtime::Runtime;
//! # use tessera::Dataset;
//! # let rt = Runtime::new().unwrap();
//! # rt.block_on(async {
//!     let dataset = Dataset::open("/tmp/test.tessera").await.unwrap();
//!     println!("Total records: {}", dataset.count_rows(None).await.unwrap());
//! # });
//! ```

pub mod dataset;
pub mod io;
pub mod utils;

pub use dataset::Dataset;
pub use tessera_core::datatypes;
pub use tessera_core::{Error, Result};
