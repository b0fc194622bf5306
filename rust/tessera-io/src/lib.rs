// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

pub mod object_store;
pub mod object_writer;
pub mod traits;

pub use object_store::{ObjectStore, ObjectStoreParams};
