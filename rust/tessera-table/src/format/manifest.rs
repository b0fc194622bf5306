// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::sync::Arc;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use super::Fragment;
use tessera_core::datatypes::Schema;
use tessera_core::Result;

/// One version of a dataset: its schema and the fragments that hold its rows.
///
/// A manifest is written once, to `_versions/{version}.manifest`, and never
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: Schema,

    /// Starts at 1 and grows by one per commit.
    pub version: u64,

    pub fragments: Arc<Vec<Fragment>>,

    /// Commit time in nanoseconds since the epoch. Zero until committed.
    #[serde(default)]
    pub timestamp_nanos: u128,

    #[serde(default)]
    pub tag: Option<String>,

    /// Largest fragment id any version up to this one has used. Kept when
    /// fragments are removed, so ids are never handed out twice.
    #[serde(default)]
    pub max_fragment_id: Option<u64>,

    #[serde(default)]
    pub transaction_uuid: Option<String>,

    /// Name of the operation that produced this version.
    #[serde(default)]
    pub operation: Option<String>,
}

impl Manifest {
    /// The first version of a dataset.
    pub fn new(schema: Schema, fragments: Arc<Vec<Fragment>>) -> Self {
        Self::with_history(1, None, schema, fragments)
    }

    /// The version after `previous`.
    pub fn new_from_previous(
        previous: &Self,
        schema: Schema,
        fragments: Arc<Vec<Fragment>>,
    ) -> Self {
        Self::with_history(
            previous.version + 1,
            previous.max_fragment_id,
            schema,
            fragments,
        )
    }

    fn with_history(
        version: u64,
        max_fragment_id: Option<u64>,
        schema: Schema,
        fragments: Arc<Vec<Fragment>>,
    ) -> Self {
        let mut manifest = Self {
            schema,
            version,
            fragments,
            timestamp_nanos: 0,
            tag: None,
            max_fragment_id,
            transaction_uuid: None,
            operation: None,
        };
        manifest.update_max_fragment_id();
        manifest
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// The commit time. The epoch if the manifest was never committed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        const NANOS_PER_SECOND: u128 = 1_000_000_000;
        let seconds = (self.timestamp_nanos / NANOS_PER_SECOND) as i64;
        let nanos = (self.timestamp_nanos % NANOS_PER_SECOND) as u32;
        DateTime::from_timestamp(seconds, nanos).unwrap_or_default()
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp_nanos = timestamp
            .timestamp_nanos_opt()
            .map_or(0, |nanos| nanos.max(0) as u128);
    }

    /// Raise `max_fragment_id` to cover the current fragments.
    pub fn update_max_fragment_id(&mut self) {
        let current = self.fragments.iter().map(|f| f.id).max();
        self.max_fragment_id = self.max_fragment_id.max(current);
    }

    /// The largest fragment id ever used, or `None` if no fragment was ever
    /// added.
    pub fn max_fragment_id(&self) -> Option<u64> {
        self.max_fragment_id
    }

    /// The id the next new fragment should get.
    pub fn next_fragment_id(&self) -> u64 {
        self.max_fragment_id.map_or(0, |id| id + 1)
    }

    /// Total number of rows, if every fragment knows its row count.
    pub fn num_rows(&self) -> Option<usize> {
        self.fragments.iter().map(Fragment::num_rows).sum()
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema};

    use super::*;
    use crate::format::DataFile;

    fn fragment(id: u64, rows: Option<usize>) -> Fragment {
        let mut fragment = Fragment::new(id);
        fragment.add_file(DataFile::new(format!("{id}.lance"), vec![0], vec![0], 1, 0));
        fragment.physical_rows = rows;
        fragment
    }

    fn schema() -> Schema {
        Schema::try_from(&ArrowSchema::new(vec![ArrowField::new(
            "a",
            DataType::Int64,
            false,
        )]))
        .unwrap()
    }

    #[test]
    fn test_json_roundtrip() {
        let mut manifest = Manifest::new(
            schema(),
            Arc::new(vec![fragment(0, Some(10)), fragment(4, Some(5))]),
        );
        manifest.set_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        manifest.operation = Some("Overwrite".to_string());

        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(
            parsed.timestamp(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(parsed.next_fragment_id(), 5);
        assert_eq!(parsed.num_rows(), Some(15));
    }

    #[test]
    fn test_optional_fields_default() {
        let json = serde_json::json!({
            "schema": schema(),
            "version": 3,
            "fragments": [],
        });
        let manifest = Manifest::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.timestamp_nanos, 0);
        assert_eq!(manifest.timestamp(), DateTime::<Utc>::default());
        assert_eq!(manifest.max_fragment_id(), None);
        assert_eq!(manifest.operation, None);
    }

    #[test]
    fn test_max_fragment_id_survives_removal() {
        let first = Manifest::new(
            schema(),
            Arc::new(vec![fragment(0, Some(10)), fragment(1, Some(10))]),
        );
        let second =
            Manifest::new_from_previous(&first, schema(), Arc::new(vec![fragment(0, Some(10))]));
        assert_eq!(second.version, 2);
        assert_eq!(second.max_fragment_id(), Some(1));

        let third = Manifest::new_from_previous(&second, schema(), Arc::new(vec![]));
        assert_eq!(third.next_fragment_id(), 2);

        let empty = Manifest::new(schema(), Arc::new(vec![]));
        assert_eq!(empty.max_fragment_id(), None);
        assert_eq!(empty.next_fragment_id(), 0);
    }

    #[test]
    fn test_num_rows_unknown() {
        let manifest = Manifest::new(
            schema(),
            Arc::new(vec![fragment(0, Some(10)), fragment(1, None)]),
        );
        assert_eq!(manifest.num_rows(), None);
    }
}
