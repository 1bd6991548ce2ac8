//! Schema Gate (spec.md §4.4): compares each datatype's schema file against
//! the table schema already published for it, decides whether a new table
//! schema needs publishing, and aborts startup if the new schema would drop
//! or retype a field the published one already has.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::store::ObjectStore;

/// One field of a datatype or table schema. `Name`/`Type` match the casing
/// used on the wire; `alias` accepts the lowercase spelling so schemas
/// published before this casing was settled on still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Type", alias = "type")]
    pub field_type: String,
    #[serde(rename = "Fields", alias = "fields", default)]
    pub fields: Vec<SchemaField>,
}

/// Dotted-path field name to type string, flattened from nested `Fields`.
pub type FieldMap = HashMap<String, String>;

fn flatten_into(prefix: &str, fields: &[SchemaField], out: &mut FieldMap) {
    for field in fields {
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        out.insert(path.clone(), field.field_type.clone());
        if !field.fields.is_empty() {
            flatten_into(&path, &field.fields, out);
        }
    }
}

pub fn field_map(fields: &[SchemaField]) -> FieldMap {
    let mut out = FieldMap::new();
    flatten_into("", fields, &mut out);
    out
}

/// Wraps a datatype's own field list in the standard-column envelope
/// (spec.md §6): every row carries `date`, `archiver`, and the
/// datatype-specific payload nested under `raw`.
pub fn standard_columns_schema(datatype_fields: Vec<SchemaField>) -> Vec<SchemaField> {
    vec![
        SchemaField {
            name: "date".to_string(),
            field_type: "DATE".to_string(),
            fields: Vec::new(),
        },
        SchemaField {
            name: "archiver".to_string(),
            field_type: "RECORD".to_string(),
            fields: vec![
                SchemaField {
                    name: "Version".to_string(),
                    field_type: "STRING".to_string(),
                    fields: Vec::new(),
                },
                SchemaField {
                    name: "GitCommit".to_string(),
                    field_type: "STRING".to_string(),
                    fields: Vec::new(),
                },
                SchemaField {
                    name: "ArchiveURL".to_string(),
                    field_type: "STRING".to_string(),
                    fields: Vec::new(),
                },
                SchemaField {
                    name: "Filename".to_string(),
                    field_type: "STRING".to_string(),
                    fields: Vec::new(),
                },
            ],
        },
        SchemaField {
            name: "raw".to_string(),
            field_type: "RECORD".to_string(),
            fields: datatype_fields,
        },
    ]
}

/// The four outcomes of comparing a new table schema against whatever is
/// already published (spec.md §4.4's compatibility table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Nothing published yet for this datatype; the new schema was uploaded.
    FirstPublish,
    /// A schema is already published and is byte-for-byte field-equivalent;
    /// no upload was needed.
    AlreadyPublished,
    /// A schema is already published; the new one only adds fields, so it
    /// was uploaded in place.
    CompatibleExtension,
    // The fourth case, an incompatible schema, is represented by
    // `SchemaError::Incompatible` rather than a variant here: it aborts the
    // gate with an error instead of returning an outcome.
}

pub struct SchemaGate<'a> {
    store: &'a dyn ObjectStore,
    object_store_home: &'a str,
    experiment: &'a str,
}

impl<'a> SchemaGate<'a> {
    pub fn new(store: &'a dyn ObjectStore, object_store_home: &'a str, experiment: &'a str) -> Self {
        Self {
            store,
            object_store_home,
            experiment,
        }
    }

    fn table_object_path(&self, datatype: &str) -> String {
        format!(
            "{}/tables/{}/{}.table.json",
            self.object_store_home, self.experiment, datatype
        )
    }

    /// Loads `schema_path`, wraps it in the standard-column envelope, and
    /// reconciles it against whatever is published for `datatype`.
    pub async fn check(&self, datatype: &str, schema_path: &Path) -> Result<GateOutcome, SchemaError> {
        let raw = std::fs::read_to_string(schema_path).map_err(|source| SchemaError::ReadSchema {
            path: schema_path.to_path_buf(),
            source,
        })?;
        let datatype_fields: Vec<SchemaField> =
            serde_json::from_str(&raw).map_err(SchemaError::Unmarshal)?;
        let new_schema = standard_columns_schema(datatype_fields);
        let new_map = field_map(&new_schema);

        let table_path = self.table_object_path(datatype);
        let published = self
            .store
            .download(&table_path)
            .await
            .map_err(SchemaError::Download)?;

        let Some(bytes) = published else {
            self.publish(&table_path, &new_schema).await?;
            return Ok(GateOutcome::FirstPublish);
        };

        let old_fields: Vec<SchemaField> =
            serde_json::from_slice(&bytes).map_err(SchemaError::Unmarshal)?;
        let old_map = field_map(&old_fields);

        if old_map == new_map {
            return Ok(GateOutcome::AlreadyPublished);
        }

        let (missing, mismatched) = compare(&old_map, &new_map);
        if missing == 0 && mismatched == 0 {
            self.publish(&table_path, &new_schema).await?;
            return Ok(GateOutcome::CompatibleExtension);
        }

        Err(SchemaError::Incompatible {
            datatype: datatype.to_string(),
            missing,
            mismatched,
        })
    }

    async fn publish(&self, table_path: &str, schema: &[SchemaField]) -> Result<(), SchemaError> {
        let bytes = serde_json::to_vec_pretty(schema).map_err(SchemaError::Unmarshal)?;
        self.store
            .upload(table_path, bytes)
            .await
            .map_err(SchemaError::Upload)
    }
}

/// Counts fields present in `old` that are either absent from `new`
/// (dropped) or present with a different type (retyped).
fn compare(old: &FieldMap, new: &FieldMap) -> (usize, usize) {
    let mut missing = 0;
    let mut mismatched = 0;
    for (path, old_type) in old {
        match new.get(path) {
            None => missing += 1,
            Some(new_type) if new_type != old_type => mismatched += 1,
            Some(_) => {}
        }
    }
    (missing, mismatched)
}
