//! Plan fixtures: seed rows plus the entities to save and delete.
//!
//! ```json
//! {
//!   "rows": [{ "type": "Order", "values": { "id": 7, "note": "first" } }],
//!   "save": [{ "type": "Order", "key": 7, "set": { "note": "rush" } }],
//!   "delete": [{ "type": "LineItem", "key": 3 }]
//! }
//! ```

use relgraph_core::{CoreError, EntityContext, Value};
use relgraph_persist::{MemoryDatabase, PersistError, PersistRequest};
use serde::Deserialize;
use serde_json::Map;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to parse fixture: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported value for '{field}': {value}")]
    UnsupportedValue { field: String, value: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Deserialize)]
pub struct FixtureRow {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub values: Map<String, serde_json::Value>,
}

/// An entity named by type and key, with optional value edits.
#[derive(Debug, Deserialize)]
pub struct EntitySpec {
    #[serde(rename = "type")]
    pub type_name: String,
    pub key: serde_json::Value,
    #[serde(default)]
    pub set: Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub rows: Vec<FixtureRow>,
    #[serde(default)]
    pub save: Vec<EntitySpec>,
    #[serde(default)]
    pub delete: Vec<EntitySpec>,
}

/// Converts a JSON scalar to a column value.
pub fn to_value(field: &str, json: &serde_json::Value) -> Result<Value, FixtureError> {
    let unsupported = || FixtureError::UnsupportedValue {
        field: field.to_string(),
        value: json.to_string(),
    };
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(unsupported)?),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => return Err(unsupported()),
    })
}

impl Fixture {
    pub fn from_json(json: &str) -> Result<Self, FixtureError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Inserts every fixture row.
    pub fn seed(&self, db: &MemoryDatabase) -> Result<usize, FixtureError> {
        for row in &self.rows {
            let values = row
                .values
                .iter()
                .map(|(node, json)| Ok((node.as_str(), to_value(node, json)?)))
                .collect::<Result<Vec<_>, FixtureError>>()?;
            db.insert(&row.type_name, values)?;
        }
        Ok(self.rows.len())
    }

    /// Loads the entities to save, applies their edits, and builds the
    /// request. Entities to delete are left for the analyser to fetch.
    pub fn request(&self, ctx: &EntityContext) -> Result<PersistRequest, FixtureError> {
        let mut request = PersistRequest::new();
        for spec in &self.save {
            let entity = ctx.get_or_create(&spec.type_name, to_value("key", &spec.key)?)?;
            ctx.fetch(&entity)?;
            for (node, json) in &spec.set {
                entity.borrow_mut().set_value(node, to_value(node, json)?)?;
            }
            request = request.save(&entity);
        }
        for spec in &self.delete {
            let entity = ctx.get_or_create(&spec.type_name, to_value("key", &spec.key)?)?;
            request = request.delete(&entity);
        }
        Ok(request)
    }
}
