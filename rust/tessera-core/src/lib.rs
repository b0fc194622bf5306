// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

pub mod chunker;
pub mod datatypes;
pub mod error;
pub mod stream;
pub mod utils;

pub use error::{box_error, Error, Result};
