// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Filter and projection planning for scans, on top of DataFusion
//! expressions.

pub mod planner;

pub use planner::{evaluate_predicate, Planner};
