// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Schema

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Formatter};

use arrow_schema::{Field as ArrowField, Schema as ArrowSchema};
use serde::{Deserialize, Serialize};
use snafu::location;

use super::field::Field;
use crate::{Error, Result};

/// Tessera Schema.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Top-level fields in the dataset.
    pub fields: Vec<Field>,
    /// Metadata of the schema
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Schema {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compare top-level and nested fields by name, type and order.
    pub fn is_compatible_with(&self, expected: &Self) -> bool {
        self.fields.len() == expected.fields.len()
            && self
                .fields
                .iter()
                .zip(expected.fields.iter())
                .all(|(lhs, rhs)| lhs.is_compatible_with(rhs))
    }

    pub fn explain_difference(&self, expected: &Self) -> Option<String> {
        let differences = explain_fields_difference(&self.fields, &expected.fields, None);
        if differences.is_empty() {
            None
        } else {
            Some(differences.join(", "))
        }
    }

    /// Fails with [`Error::SchemaMismatch`] if `self` cannot be stored under `expected`.
    pub fn check_compatible(&self, expected: &Self) -> Result<()> {
        if !self.is_compatible_with(expected) {
            let difference = self.explain_difference(expected);
            Err(Error::SchemaMismatch {
                // unknown reason is messy but this shouldn't happen.
                difference: difference.unwrap_or("unknown reason".to_string()),
                location: location!(),
            })
        } else {
            Ok(())
        }
    }

    /// Project the schema by top-level or nested (`a.b`) column names.
    pub fn project<T: AsRef<str>>(&self, columns: &[T]) -> Result<Self> {
        let mut ids = Vec::with_capacity(columns.len());
        for col in columns {
            let field = self.field(col.as_ref()).ok_or_else(|| Error::Schema {
                message: format!("Column {} does not exist", col.as_ref()),
                location: location!(),
            })?;
            ids.push(field.id);
        }
        Ok(self.project_by_ids(&ids, true))
    }

    /// Check that field ids are unique and names are unique among siblings.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for field in self.fields_pre_order() {
            if field.id < 0 {
                return Err(Error::Schema {
                    message: format!("Field {} has no id assigned", field.name),
                    location: location!(),
                });
            }
            if !seen_ids.insert(field.id) {
                return Err(Error::Schema {
                    message: format!("Duplicate field id {} in schema:\n {:#?}", field.id, self),
                    location: location!(),
                });
            }
        }
        let mut seen_names = HashSet::new();
        for field in self.fields.iter() {
            if !seen_names.insert(field.name.as_str()) {
                return Err(Error::Schema {
                    message: format!("Duplicate field name \"{}\" in schema", field.name),
                    location: location!(),
                });
            }
        }
        Ok(())
    }

    /// Iterates over the fields using a pre-order traversal
    ///
    /// This is a DFS traversal where the parent is visited
    /// before its children
    pub fn fields_pre_order(&self) -> impl Iterator<Item = &Field> {
        let mut stack = self.fields.iter().rev().collect::<Vec<_>>();
        std::iter::from_fn(move || {
            let field = stack.pop()?;
            stack.extend(field.children.iter().rev());
            Some(field)
        })
    }

    /// Returns a new schema that only contains the fields in `column_ids`.
    ///
    /// If `include_all_children` is true, passing the id of a parent field
    /// includes all of its children.
    pub fn project_by_ids(&self, column_ids: &[i32], include_all_children: bool) -> Self {
        let filtered_fields = self
            .fields
            .iter()
            .filter_map(|f| f.project_by_ids(column_ids, include_all_children))
            .collect();
        Self {
            fields: filtered_fields,
            metadata: self.metadata.clone(),
        }
    }

    /// Get a field by name. Return `None` if the field does not exist.
    pub fn field(&self, name: &str) -> Option<&Field> {
        let mut path = name.split('.');
        let top = path.next()?;
        let top = self.fields.iter().find(|f| f.name == top)?;
        path.try_fold(top, |field, name| field.child(name))
    }

    /// Recursively collect all the field IDs, in pre-order traversal order.
    pub fn field_ids(&self) -> Vec<i32> {
        self.fields_pre_order().map(|f| f.id).collect()
    }

    /// Get field by its id.
    pub fn field_by_id(&self, id: impl Into<i32>) -> Option<&Field> {
        let id = id.into();
        self.fields_pre_order().find(|f| f.id == id)
    }

    /// Get the maximum field id in the schema.
    pub fn max_field_id(&self) -> Option<i32> {
        self.fields_pre_order().map(|f| f.id).max()
    }

    /// Walk through the fields and assign a new field id to each field that does
    /// not have one (e.g. is set to -1)
    ///
    /// Ids start after the larger of `max_existing_id` and the maximum id
    /// already present in this schema.
    pub fn set_field_id(&mut self, max_existing_id: Option<i32>) {
        let mut current_id = self.max_field_id().max(max_existing_id).unwrap_or(-1) + 1;
        self.fields
            .iter_mut()
            .for_each(|f| f.set_id(-1, &mut current_id));
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for field in self.fields.iter() {
            writeln!(f, "{field}")?
        }
        Ok(())
    }
}

/// Convert an Arrow schema, assigning field ids in pre-order from 0.
impl TryFrom<&ArrowSchema> for Schema {
    type Error = Error;

    fn try_from(schema: &ArrowSchema) -> Result<Self> {
        let mut schema = Self {
            fields: schema
                .fields
                .iter()
                .map(|f| Field::try_from(f.as_ref()))
                .collect::<Result<_>>()?,
            metadata: schema.metadata.clone(),
        };
        schema.set_field_id(None);

        Ok(schema)
    }
}

/// Convert Tessera Schema to Arrow Schema
impl From<&Schema> for ArrowSchema {
    fn from(schema: &Schema) -> Self {
        Self {
            fields: schema.fields.iter().map(ArrowField::from).collect(),
            metadata: schema.metadata.clone(),
        }
    }
}

/// Describe how `fields` differ from `expected`: missing or extra names,
/// a different order, then per field differences.
pub(super) fn explain_fields_difference(
    fields: &[Field],
    expected: &[Field],
    path: Option<&str>,
) -> Vec<String> {
    let qualified = |name: &str| match path {
        Some(path) => format!("{path}.{name}"),
        None => name.to_string(),
    };
    let names_not_in = |of: &[Field], other: &[Field]| {
        let other = other.iter().map(|f| f.name.as_str()).collect::<HashSet<_>>();
        let mut names = of
            .iter()
            .filter(|f| !other.contains(f.name.as_str()))
            .map(|f| qualified(&f.name))
            .collect::<Vec<_>>();
        names.sort();
        names
    };

    let mut differences = vec![];
    let missing = names_not_in(expected, fields);
    let unexpected = names_not_in(fields, expected);
    if !missing.is_empty() || !unexpected.is_empty() {
        differences.push(format!(
            "fields did not match, missing=[{}], unexpected=[{}]",
            missing.join(", "),
            unexpected.join(", ")
        ));
    }

    // Pairs of (expected, actual) fields sharing a name, in expected order
    let pairs = expected
        .iter()
        .filter_map(|e| {
            fields
                .iter()
                .position(|f| f.name == e.name)
                .map(|pos| (e, pos))
        })
        .collect::<Vec<_>>();
    if pairs.windows(2).any(|w| w[0].1 > w[1].1) {
        let names = |fields: &[Field]| {
            fields
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        differences.push(format!(
            "fields in different order, expected: [{}], actual: [{}]",
            names(expected),
            names(fields)
        ));
    }

    differences.extend(pairs.into_iter().filter_map(|(expected, pos)| {
        let diffs = fields[pos].explain_differences(expected, path);
        (!diffs.is_empty()).then(|| diffs.join(", "))
    }));
    differences
}
