// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! I/O utilities.

pub mod exec;

pub use tessera_io::{ObjectStore, ObjectStoreParams};
