// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! On-disk metadata of a dataset.

mod fragment;
mod manifest;

pub use fragment::*;
pub use manifest::Manifest;
