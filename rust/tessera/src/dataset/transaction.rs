// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Changes to a dataset and how they turn into the next manifest.
//!
//! The next manifest is always built from the latest committed one, so an
//! append or overwrite that loses the race for a version can simply be
//! rebuilt and committed again.
//!
//! | operation  | based on a stale version |
//! |------------|--------------------------|
//! | Append     | rebuilt on the latest version |
//! | Overwrite  | rebuilt on the latest version |
//! | Delete     | conflict, deletion files were computed from the old rows |

use std::collections::HashSet;
use std::sync::Arc;

use object_store::path::Path;
use snafu::location;

use tessera_core::datatypes::Schema;
use tessera_core::{Error, Result};
use tessera_table::format::{Fragment, Manifest};

use super::DATA_DIR;

/// A change to a dataset, recorded against the version it was computed from.
///
/// The next manifest is derived from whichever manifest is latest when the
/// transaction commits, see [`Transaction::build_manifest`].
#[derive(Debug, Clone)]
pub struct Transaction {
    /// The version the change was computed from, or 0 for a new dataset.
    pub read_version: u64,
    pub uuid: String,
    pub operation: Operation,
    pub tag: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Operation {
    /// Add fragments after the existing ones. They are renumbered on commit.
    Append { fragments: Vec<Fragment> },
    /// Swap in fragments carrying new deletion files and drop the fragments
    /// whose rows are all deleted.
    Delete {
        updated_fragments: Vec<Fragment>,
        deleted_fragment_ids: Vec<u64>,
        predicate: String,
    },
    /// Replace every fragment and the schema. Creating a dataset is an
    /// overwrite of nothing.
    Overwrite {
        fragments: Vec<Fragment>,
        schema: Schema,
    },
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Self::Append { .. } => "Append",
            Self::Delete { .. } => "Delete",
            Self::Overwrite { .. } => "Overwrite",
        }
    }

    /// The fragments this operation brings into the dataset.
    fn incoming_fragments(&self) -> &[Fragment] {
        match self {
            Self::Append { fragments } | Self::Overwrite { fragments, .. } => fragments,
            Self::Delete {
                updated_fragments, ..
            } => updated_fragments,
        }
    }
}

impl Transaction {
    pub fn new(read_version: u64, operation: Operation, tag: Option<String>) -> Self {
        Self {
            read_version,
            uuid: uuid::Uuid::new_v4().hyphenated().to_string(),
            operation,
            tag,
        }
    }

    /// Whether this transaction can still be applied on top of `latest_version`.
    pub fn can_rebase_onto(&self, latest_version: u64) -> bool {
        match self.operation {
            Operation::Append { .. } | Operation::Overwrite { .. } => true,
            Operation::Delete { .. } => self.read_version == latest_version,
        }
    }

    /// Create the manifest that results from applying this transaction on
    /// top of `current`.
    ///
    /// The timestamp is left for the caller to set at commit time.
    pub(crate) fn build_manifest(&self, current: Option<&Manifest>) -> Result<Manifest> {
        validate_operation(current, &self.operation)?;

        let (schema, fragments) = match (&self.operation, current) {
            (Operation::Overwrite { fragments, schema }, _) => {
                (schema.clone(), renumber_overwrite(fragments)?)
            }
            (Operation::Append { fragments }, Some(current)) => {
                let first_id = current.next_fragment_id();
                let appended = fragments.iter().zip(first_id..).map(|(fragment, id)| Fragment {
                    id,
                    ..fragment.clone()
                });
                let all = current.fragments.iter().cloned().chain(appended);
                (current.schema.clone(), all.collect())
            }
            (
                Operation::Delete {
                    updated_fragments,
                    deleted_fragment_ids,
                    ..
                },
                Some(current),
            ) => {
                let deleted = deleted_fragment_ids.iter().collect::<HashSet<_>>();
                let remaining = current
                    .fragments
                    .iter()
                    .filter(|f| !deleted.contains(&f.id))
                    .map(|f| {
                        updated_fragments
                            .iter()
                            .find(|updated| updated.id == f.id)
                            .unwrap_or(f)
                            .clone()
                    });
                (current.schema.clone(), remaining.collect())
            }
            (operation, None) => {
                return Err(Error::Internal {
                    message: format!(
                        "{} needs the current manifest to build on",
                        operation.name()
                    ),
                    location: location!(),
                })
            }
        };

        let fragments = Arc::new(fragments);
        let mut manifest = match current {
            Some(current) => Manifest::new_from_previous(current, schema, fragments),
            None => Manifest::new(schema, fragments),
        };
        manifest.tag.clone_from(&self.tag);
        manifest.transaction_uuid = Some(self.uuid.clone());
        manifest.operation = Some(self.operation.name().to_string());
        Ok(manifest)
    }
}

/// Keep the ids of overwriting fragments unique.
///
/// Fragments written independently all default to id 0. The first keeps
/// it and the others are renumbered after the largest id, in order. Any
/// other repeated id is an error.
fn renumber_overwrite(fragments: &[Fragment]) -> Result<Vec<Fragment>> {
    let mut next_id = fragments.iter().map(|f| f.id).max().unwrap_or(0) + 1;
    let mut seen = HashSet::with_capacity(fragments.len());
    let mut renumbered = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let mut fragment = fragment.clone();
        if !seen.insert(fragment.id) {
            if fragment.id != 0 {
                return Err(Error::invalid_input(
                    format!("Duplicate fragment id {} in overwrite", fragment.id),
                    location!(),
                ));
            }
            fragment.id = next_id;
            next_id += 1;
        }
        renumbered.push(fragment);
    }
    Ok(renumbered)
}

/// Check that `operation` can be applied on top of `manifest`.
///
/// Only an overwrite can create a dataset. The incoming fragments must store
/// exactly the fields of the resulting schema. `physical_rows` may be absent
/// on fragments written by older versions; readers fall back to the data file.
pub fn validate_operation(manifest: Option<&Manifest>, operation: &Operation) -> Result<()> {
    let schema = match (operation, manifest) {
        (Operation::Overwrite { schema, .. }, _) => schema,
        (_, Some(manifest)) => &manifest.schema,
        (_, None) => {
            return Err(Error::invalid_input(
                format!(
                    "Cannot apply operation {} to non-existent dataset",
                    operation.name()
                ),
                location!(),
            ))
        }
    };
    let data_dir = Path::from(DATA_DIR);
    operation
        .incoming_fragments()
        .iter()
        .try_for_each(|fragment| check_fragment(schema, fragment, &data_dir))
}

fn check_fragment(schema: &Schema, fragment: &Fragment, data_dir: &Path) -> Result<()> {
    fragment.validate(data_dir)?;

    let stored = fragment
        .files
        .iter()
        .flat_map(|file| file.fields.iter().map(move |id| (*id, file)))
        .collect::<Vec<_>>();
    if let Some((id, file)) = stored
        .iter()
        .find(|(id, _)| schema.field_by_id(*id).is_none())
    {
        return Err(Error::SchemaMismatch {
            difference: format!(
                "data file {} of fragment {} stores field id {} which is not in the schema",
                file.path, fragment.id, id
            ),
            location: location!(),
        });
    }
    match schema
        .fields_pre_order()
        .find(|field| !stored.iter().any(|(id, _)| *id == field.id))
    {
        Some(field) => Err(Error::invalid_input(
            format!(
                "Fragment {} does not contain field {:?}",
                fragment.id, field.name
            ),
            location!(),
        )),
        None => Ok(()),
    }
}
