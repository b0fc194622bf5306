// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Tessera Schema Field

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arrow_schema::{DataType, Field as ArrowField};
use serde::{Deserialize, Serialize};

use super::LogicalType;
use crate::{Error, Result};

/// Tessera Schema Field
///
/// Every field, nested or not, carries a dataset-wide unique `id`. Data files
/// reference the columns they store by these ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub id: i32,
    parent_id: i32,
    logical_type: LogicalType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Self>,
}

impl Field {
    /// Returns arrow data type.
    pub fn data_type(&self) -> DataType {
        match &self.logical_type {
            lt if lt.is_list() => DataType::List(Arc::new(self.child_arrow_field())),
            lt if lt.is_large_list() => DataType::LargeList(Arc::new(self.child_arrow_field())),
            lt if lt.is_struct() => {
                DataType::Struct(self.children.iter().map(ArrowField::from).collect())
            }
            lt => match lt.fsl_size() {
                Some(size) => DataType::FixedSizeList(Arc::new(self.child_arrow_field()), size),
                // Non-nested logical types are validated when they are built.
                None => DataType::try_from(lt).unwrap_or(DataType::Null),
            },
        }
    }

    fn child_arrow_field(&self) -> ArrowField {
        self.children
            .first()
            .map(ArrowField::from)
            .unwrap_or_else(|| ArrowField::new("item", DataType::Null, true))
    }

    pub fn logical_type(&self) -> &LogicalType {
        &self.logical_type
    }

    pub fn parent_id(&self) -> i32 {
        self.parent_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|f| f.name == name)
    }

    /// Project by field ids, keeping the parents of any selected child.
    pub(super) fn project_by_ids(&self, ids: &[i32], include_all_children: bool) -> Option<Self> {
        if ids.contains(&self.id) && (include_all_children || self.children.is_empty()) {
            return Some(self.clone());
        }
        let children = self
            .children
            .iter()
            .filter_map(|c| c.project_by_ids(ids, include_all_children))
            .collect::<Vec<_>>();
        if ids.contains(&self.id) || !children.is_empty() {
            Some(Self {
                children,
                ..self.clone()
            })
        } else {
            None
        }
    }

    /// Compare name, type and children. Field ids, metadata and nullability
    /// are not part of compatibility.
    pub fn is_compatible_with(&self, expected: &Self) -> bool {
        self.name == expected.name
            && self.logical_type == expected.logical_type
            && self.children.len() == expected.children.len()
            && self
                .children
                .iter()
                .zip(expected.children.iter())
                .all(|(lhs, rhs)| lhs.is_compatible_with(rhs))
    }

    pub(super) fn explain_differences(&self, expected: &Self, path: Option<&str>) -> Vec<String> {
        let qualified_name = path.map_or_else(
            || self.name.clone(),
            |path| format!("{path}.{}", self.name),
        );
        let mut differences = vec![];
        if self.name != expected.name {
            differences.push(format!(
                "expected name '{}' but name was '{}'",
                expected.name, self.name
            ));
        }
        if self.logical_type != expected.logical_type {
            differences.push(format!(
                "`{qualified_name}` should have type {} but type was {}",
                expected.data_type(),
                self.data_type()
            ));
        }
        differences.extend(super::schema::explain_fields_difference(
            &self.children,
            &expected.children,
            Some(&qualified_name),
        ));
        differences
    }

    /// Recursively set field ID and parent ID for this field and all its children.
    pub(super) fn set_id(&mut self, parent_id: i32, id_seed: &mut i32) {
        self.parent_id = parent_id;
        if self.id < 0 {
            self.id = *id_seed;
            *id_seed += 1;
        }
        let id = self.id;
        self.children
            .iter_mut()
            .for_each(|f| f.set_id(id, id_seed));
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (id={})", self.name, self.logical_type, self.id)?;
        if let Some((first, rest)) = self.children.split_first() {
            write!(f, " {{{first}")?;
            for child in rest {
                write!(f, ", {child}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl TryFrom<&ArrowField> for Field {
    type Error = Error;

    fn try_from(field: &ArrowField) -> Result<Self> {
        let children = match field.data_type() {
            DataType::Struct(children) => children
                .iter()
                .map(|f| Self::try_from(f.as_ref()))
                .collect::<Result<_>>()?,
            DataType::List(item) | DataType::LargeList(item) | DataType::FixedSizeList(item, _) => {
                vec![Self::try_from(item.as_ref())?]
            }
            _ => vec![],
        };
        Ok(Self {
            id: -1,
            parent_id: -1,
            name: field.name().clone(),
            logical_type: LogicalType::try_from(field.data_type())?,
            metadata: field.metadata().clone(),
            nullable: field.is_nullable(),
            children,
        })
    }
}

impl TryFrom<ArrowField> for Field {
    type Error = Error;

    fn try_from(field: ArrowField) -> Result<Self> {
        Self::try_from(&field)
    }
}

impl From<&Field> for ArrowField {
    fn from(field: &Field) -> Self {
        let out = Self::new(&field.name, field.data_type(), field.nullable);
        out.with_metadata(field.metadata.clone())
    }
}
