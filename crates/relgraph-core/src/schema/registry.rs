//! The validated, immutable [`DefinitionSet`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::CoreError;
use crate::value::Value;

use super::definition::{EntityType, EntityTypeDef, NodeDefinition, NodeKind, SchemaSource};
use super::downcast::DowncastTable;

/// Registry of all entity types of one schema.
///
/// Built once from a [`SchemaSource`]; everything handed out is an
/// `Arc<EntityType>` that never changes afterwards.
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    namespace: Option<String>,
    types: IndexMap<String, Arc<EntityType>>,
    downcasts: HashMap<String, DowncastTable>,
}

impl DefinitionSet {
    /// Resolves inheritance, validates the schema and builds downcast tables.
    pub fn new(source: SchemaSource) -> Result<Self, CoreError> {
        let mut defs: IndexMap<String, EntityTypeDef> = IndexMap::new();
        for def in source.types {
            if defs.contains_key(&def.name) {
                return Err(CoreError::DuplicateEntityType { name: def.name });
            }
            defs.insert(def.name.clone(), def);
        }

        // (target type, foreign node) of every to-many collection.
        let back_refs: HashSet<(String, String)> = defs
            .values()
            .flat_map(|def| def.nodes.iter())
            .filter_map(|node| match &node.kind {
                NodeKind::ToMany {
                    target,
                    foreign_node: Some(foreign),
                } => Some((target.clone(), foreign.clone())),
                _ => None,
            })
            .collect();

        let mut resolved: IndexMap<String, Arc<EntityType>> = IndexMap::new();
        let names: Vec<String> = defs.keys().cloned().collect();
        for name in &names {
            resolve(name, &defs, &back_refs, &mut resolved, &mut HashSet::new())?;
        }
        // Keep declaration order regardless of resolution order.
        let types: IndexMap<String, Arc<EntityType>> = names
            .iter()
            .filter_map(|name| resolved.get(name).map(|t| (name.clone(), Arc::clone(t))))
            .collect();

        let mut set = DefinitionSet {
            namespace: source.namespace,
            types,
            downcasts: HashMap::new(),
        };
        set.validate_relations()?;
        set.build_downcasts()?;

        tracing::debug!(
            types = set.types.len(),
            abstract_types = set.downcasts.len(),
            "definition set built"
        );
        Ok(set)
    }

    /// Parses and builds from a JSON schema document.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Self::new(SchemaSource::from_json(json)?)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &str) -> Result<Arc<EntityType>, CoreError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownEntityType {
                name: name.to_string(),
            })
    }

    pub fn try_get(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.types.get(name)
    }

    /// All types in declaration order.
    pub fn types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns true if `name` is `ancestor` or inherits from it.
    pub fn is_a(&self, name: &str, ancestor: &str) -> bool {
        let mut current = Some(name);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.types.get(n).and_then(|t| t.extends());
        }
        false
    }

    /// Concrete descendants of `name`, in declaration order.
    pub fn subtypes_of(&self, name: &str) -> Vec<Arc<EntityType>> {
        self.types
            .values()
            .filter(|t| !t.is_abstract() && t.name() != name && self.is_a(t.name(), name))
            .cloned()
            .collect()
    }

    pub fn downcast_table(&self, name: &str) -> Option<&DowncastTable> {
        self.downcasts.get(name)
    }

    /// Resolves the concrete type for an entity of `entity_type` whose node
    /// values are given by `lookup`. Concrete types resolve to themselves.
    pub fn downcast<F>(
        &self,
        entity_type: &Arc<EntityType>,
        lookup: F,
    ) -> Result<Arc<EntityType>, CoreError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        if !entity_type.is_abstract() {
            return Ok(Arc::clone(entity_type));
        }
        let table = self
            .downcasts
            .get(entity_type.name())
            .ok_or_else(|| CoreError::NoDowncastCandidate {
                abstract_type: entity_type.name().to_string(),
            })?;
        let name = table.resolve(lookup)?;
        self.get(name)
    }

    fn validate_relations(&self) -> Result<(), CoreError> {
        for entity_type in self.types.values() {
            for node in entity_type.nodes() {
                match &node.kind {
                    NodeKind::Value => {
                        let column_type = node.column_type.ok_or_else(|| CoreError::Schema {
                            reason: format!(
                                "value node '{}.{}' declares no column type",
                                entity_type.name(),
                                node.name
                            ),
                        })?;
                        if let Some(fixed) = &node.fixed_value {
                            if !column_type.accepts(fixed) {
                                return Err(CoreError::Schema {
                                    reason: format!(
                                        "fixed value {} of '{}.{}' does not fit {:?}",
                                        fixed,
                                        entity_type.name(),
                                        node.name,
                                        column_type
                                    ),
                                });
                            }
                        }
                    }
                    NodeKind::Ref { target } => {
                        self.get(target)?;
                    }
                    NodeKind::ToMany {
                        target,
                        foreign_node,
                    } => {
                        let target_type = self.get(target)?;
                        let foreign = foreign_node.as_deref().ok_or_else(|| CoreError::Schema {
                            reason: format!(
                                "to-many node '{}.{}' declares no foreign node",
                                entity_type.name(),
                                node.name
                            ),
                        })?;
                        let back = target_type.require_node(foreign)?;
                        if !back.is_ref() {
                            return Err(CoreError::NodeKindMismatch {
                                entity_type: target_type.name().to_string(),
                                node: foreign.to_string(),
                                expected: "ref",
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn build_downcasts(&mut self) -> Result<(), CoreError> {
        let abstract_names: Vec<String> = self
            .types
            .values()
            .filter(|t| t.is_abstract())
            .map(|t| t.name().to_string())
            .collect();
        for name in abstract_names {
            let subtypes = self.subtypes_of(&name);
            let table = DowncastTable::build(&name, subtypes.iter().map(|t| t.as_ref()))?;
            self.downcasts.insert(name, table);
        }
        Ok(())
    }
}

/// Resolves `name` and its ancestors into `resolved`.
fn resolve(
    name: &str,
    defs: &IndexMap<String, EntityTypeDef>,
    back_refs: &HashSet<(String, String)>,
    resolved: &mut IndexMap<String, Arc<EntityType>>,
    visiting: &mut HashSet<String>,
) -> Result<Arc<EntityType>, CoreError> {
    if let Some(done) = resolved.get(name) {
        return Ok(Arc::clone(done));
    }
    if !visiting.insert(name.to_string()) {
        return Err(CoreError::Schema {
            reason: format!("inheritance cycle through '{name}'"),
        });
    }
    let def = defs.get(name).ok_or_else(|| CoreError::UnknownEntityType {
        name: name.to_string(),
    })?;

    let parent = match &def.extends {
        Some(parent) => Some(resolve(parent, defs, back_refs, resolved, visiting)?),
        None => None,
    };

    let mut nodes: IndexMap<String, NodeDefinition> = parent
        .as_ref()
        .map(|p| p.nodes().map(|n| (n.name.clone(), n.clone())).collect())
        .unwrap_or_default();
    for node in &def.nodes {
        let mut node = node.clone();
        if !node.is_to_many() && node.column.is_none() {
            node.column = Some(node.name.clone());
        }
        node.back_reference =
            node.is_ref() && nodes.get(&node.name).is_some_and(|n| n.back_reference);
        // Redeclaring an inherited node replaces it in place.
        nodes.insert(node.name.clone(), node);
    }
    for node in nodes.values_mut() {
        if node.is_ref() && back_refs.contains(&(name.to_string(), node.name.clone())) {
            node.back_reference = true;
        }
    }

    let table = def
        .table
        .clone()
        .or_else(|| parent.as_ref().map(|p| p.table().to_string()))
        .ok_or_else(|| CoreError::Schema {
            reason: format!("entity type '{name}' declares no table"),
        })?;

    let keys: Vec<&NodeDefinition> = nodes.values().filter(|n| n.primary_key).collect();
    if keys.len() != 1 {
        return Err(CoreError::Schema {
            reason: format!(
                "entity type '{name}' must declare exactly one primary key node, found {}",
                keys.len()
            ),
        });
    }
    let key_node = keys[0].name.clone();

    let entity_type = Arc::new(EntityType::new(
        name.to_string(),
        table,
        key_node,
        nodes,
        def.is_abstract,
        def.extends.clone(),
    ));
    visiting.remove(name);
    resolved.insert(name.to_string(), Arc::clone(&entity_type));
    Ok(entity_type)
}
