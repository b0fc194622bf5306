// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::collections::HashSet;

use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::location;

use tessera_core::datatypes::Schema;
use tessera_core::{Error, Result};

/// One file of a fragment, holding some or all of its columns.
///
/// Every field without a default is required in the JSON form. Files
/// recorded by old writers lack the column indices and format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Path of the data file, relative to the dataset's `data` directory.
    pub path: String,
    /// The ids of fields in this file, in pre-order.
    pub fields: Vec<i32>,
    /// The column of each field listed in `fields`. Empty when unknown,
    /// in which case top level fields are stored in order.
    #[serde(default)]
    pub column_indices: Vec<i32>,
    /// Format version the file was written with. 0.0 if not recorded.
    #[serde(default)]
    pub file_major_version: u32,
    #[serde(default)]
    pub file_minor_version: u32,
}

impl DataFile {
    pub fn new(
        path: impl Into<String>,
        fields: Vec<i32>,
        column_indices: Vec<i32>,
        file_major_version: u32,
        file_minor_version: u32,
    ) -> Self {
        Self {
            path: path.into(),
            fields,
            column_indices,
            file_major_version,
            file_minor_version,
        }
    }

    /// The part of `full_schema` stored in this file.
    pub fn schema(&self, full_schema: &Schema) -> Schema {
        full_schema.project_by_ids(&self.fields, false)
    }

    /// Check the field list. `base_path` only names the file in errors.
    pub fn validate(&self, base_path: &Path) -> Result<()> {
        let problem = if self.fields.is_empty() {
            "contained no fields"
        } else if self.fields.iter().collect::<HashSet<_>>().len() != self.fields.len() {
            "contained duplicate field ids"
        } else if !self.column_indices.is_empty()
            && self.column_indices.len() != self.fields.len()
        {
            "contained an unequal number of fields / column_indices"
        } else {
            return Ok(());
        };
        Err(Error::corrupt_file(
            base_path.child(self.path.as_str()),
            problem,
            location!(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionFileType {
    Array,
    Bitmap,
}

impl DeletionFileType {
    pub fn suffix(&self) -> &str {
        match self {
            Self::Array => "arrow",
            Self::Bitmap => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFile {
    pub read_version: u64,
    pub id: u64,
    pub file_type: DeletionFileType,
    /// Absent in files from writers that did not record the count.
    #[serde(default)]
    pub num_deleted_rows: Option<usize>,
}

/// A horizontal slice of a dataset: rows stored in one or more data files,
/// plus an optional file of deleted row offsets.
///
/// The JSON form produced by [`Fragment::to_json`] is what independent
/// writers hand to the committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Unique within a dataset. Fragments written outside a commit use 0
    /// until the commit assigns one.
    pub id: u64,

    pub files: Vec<DataFile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_file: Option<DeletionFile>,

    /// Number of rows written to the fragment, before deletions. None while
    /// the fragment is still being written, or when written by an old writer.
    #[serde(default)]
    pub physical_rows: Option<usize>,
}

impl Fragment {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            files: vec![],
            deletion_file: None,
            physical_rows: None,
        }
    }

    /// Number of rows visible after deletions, if known.
    pub fn num_rows(&self) -> Option<usize> {
        let physical_rows = self.physical_rows?;
        let deleted = match &self.deletion_file {
            None => 0,
            Some(deletion_file) => deletion_file.num_deleted_rows?,
        };
        Some(physical_rows.saturating_sub(deleted))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Create a `Fragment` with one DataFile holding every field of `schema`.
    pub fn with_file(
        id: u64,
        path: &str,
        schema: &Schema,
        column_indices: Vec<i32>,
        file_version: (u32, u32),
        physical_rows: Option<usize>,
    ) -> Self {
        let (major, minor) = file_version;
        Self {
            id,
            files: vec![DataFile::new(
                path,
                schema.field_ids(),
                column_indices,
                major,
                minor,
            )],
            deletion_file: None,
            physical_rows,
        }
    }

    pub fn add_file(&mut self, data_file: DataFile) {
        self.files.push(data_file);
    }

    /// Check that the metadata describes a complete fragment.
    ///
    /// `data_dir` is only used to name files in errors.
    pub fn validate(&self, data_dir: &Path) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::invalid_input(
                format!("fragment {} has no data files", self.id),
                location!(),
            ));
        }
        for file in &self.files {
            file.validate(data_dir)?;
        }
        if let (Some(physical_rows), Some(deleted)) = (
            self.physical_rows,
            self.deletion_file
                .as_ref()
                .and_then(|file| file.num_deleted_rows),
        ) {
            if deleted > physical_rows {
                return Err(Error::invalid_input(
                    format!(
                        "fragment {} deletes {} rows but only has {}",
                        self.id, deleted, physical_rows
                    ),
                    location!(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{
        DataType, Field as ArrowField, Fields as ArrowFields, Schema as ArrowSchema,
    };
    use rstest::rstest;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn test_new_fragment() {
        let path = "foobar.lance";

        let arrow_schema = ArrowSchema::new(vec![
            ArrowField::new(
                "s",
                DataType::Struct(ArrowFields::from(vec![
                    ArrowField::new("si", DataType::Int32, false),
                    ArrowField::new("sb", DataType::Binary, true),
                ])),
                true,
            ),
            ArrowField::new("bool", DataType::Boolean, true),
        ]);
        let schema = Schema::try_from(&arrow_schema).unwrap();
        let fragment = Fragment::with_file(123, path, &schema, vec![0, -1, -1, 1], (1, 0), Some(10));

        assert_eq!(123, fragment.id);
        assert_eq!(
            fragment.files,
            vec![DataFile::new(path, vec![0, 1, 2, 3], vec![0, -1, -1, 1], 1, 0)]
        );
        fragment.validate(&Path::from("data")).unwrap();
        assert_eq!(fragment.files[0].schema(&schema), schema);
    }

    #[test]
    fn test_to_json() {
        let mut fragment = Fragment::new(123);
        fragment.add_file(DataFile::new("foobar.lance", vec![0], vec![0], 1, 0));
        fragment.deletion_file = Some(DeletionFile {
            read_version: 123,
            id: 456,
            file_type: DeletionFileType::Array,
            num_deleted_rows: Some(10),
        });

        let json = fragment.to_json().unwrap();

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 123,
                "files":[
                    {"path": "foobar.lance", "fields": [0], "column_indices": [0],
                     "file_major_version": 1, "file_minor_version": 0}],
                "deletion_file": {"read_version": 123, "id": 456, "file_type": "array",
                                  "num_deleted_rows": 10},
                "physical_rows": None::<usize>}),
        );

        let frag2 = Fragment::from_json(&json).unwrap();
        assert_eq!(fragment, frag2);
    }

    #[test]
    fn test_parse_minimal_json() {
        // Written by older writers: no column indices, versions or row count
        let json = r#"{"id": 0, "files": [{"path": "0.lance", "fields": [0]}], "physical_rows": 100}"#;
        let fragment = Fragment::from_json(json).unwrap();
        assert_eq!(
            format!("{:?}", fragment),
            "Fragment { id: 0, files: [DataFile { path: \"0.lance\", fields: [0], \
             column_indices: [], file_major_version: 0, file_minor_version: 0 }], \
             deletion_file: None, physical_rows: Some(100) }"
        );
        assert_eq!(fragment.files[0].file_major_version, 0);

        let json = r#"{"id": 3, "files": [{"path": "3.lance", "fields": [0, 1]}]}"#;
        let fragment = Fragment::from_json(json).unwrap();
        assert_eq!(fragment.physical_rows, None);
        assert_eq!(fragment.num_rows(), None);

        assert!(matches!(
            Fragment::from_json("{\"id\": \"zero\"}"),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[rstest]
    #[case::no_deletions(Some(100), None, Some(100))]
    #[case::known_deletions(Some(100), Some(Some(40)), Some(60))]
    #[case::unknown_deletions(Some(100), Some(None), None)]
    #[case::unknown_length(None, None, None)]
    fn test_num_rows(
        #[case] physical_rows: Option<usize>,
        #[case] num_deleted_rows: Option<Option<usize>>,
        #[case] expected: Option<usize>,
    ) {
        let mut fragment = Fragment::new(1);
        fragment.physical_rows = physical_rows;
        fragment.deletion_file = num_deleted_rows.map(|num_deleted_rows| DeletionFile {
            read_version: 1,
            id: 2,
            file_type: DeletionFileType::Bitmap,
            num_deleted_rows,
        });
        assert_eq!(fragment.num_rows(), expected);
    }

    #[test]
    fn test_validate() {
        let data_dir = Path::from("data");
        assert!(Fragment::new(7).validate(&data_dir).is_err());

        for file in [
            DataFile::new("7.lance", vec![0, 1], vec![0], 1, 0),
            DataFile::new("7.lance", vec![0, 0], vec![0, 1], 1, 0),
            DataFile::new("7.lance", vec![], vec![], 1, 0),
        ] {
            let mut fragment = Fragment::new(7);
            fragment.add_file(file);
            assert!(matches!(
                fragment.validate(&data_dir),
                Err(Error::CorruptFile { .. })
            ));
        }

        let mut fragment = Fragment::new(7);
        fragment.add_file(DataFile::new("7.lance", vec![0, 1], vec![], 0, 0));
        fragment.physical_rows = Some(5);
        fragment.validate(&data_dir).unwrap();
        fragment.deletion_file = Some(DeletionFile {
            read_version: 1,
            id: 1,
            file_type: DeletionFileType::Array,
            num_deleted_rows: Some(6),
        });
        assert!(matches!(
            fragment.validate(&data_dir),
            Err(Error::InvalidInput { .. })
        ));
    }
}
