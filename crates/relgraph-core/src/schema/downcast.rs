//! Closed downcast tables for abstract entity types.
//!
//! Built once per abstract type when the [`DefinitionSet`](super::DefinitionSet)
//! is constructed. Each concrete descendant contributes the tuple of its
//! fixed-value nodes; resolving a row picks the candidate whose tuple matches.

use serde::Serialize;

use crate::error::CoreError;
use crate::value::Value;

use super::definition::EntityType;

/// One concrete subtype and the discriminator values that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DowncastCandidate {
    pub entity_type: String,
    pub fixed: Vec<(String, Value)>,
}

/// Dispatch table from fixed-value tuples to concrete subtypes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DowncastTable {
    abstract_type: String,
    candidates: Vec<DowncastCandidate>,
}

impl DowncastTable {
    /// Builds the table for `abstract_type` from its concrete descendants.
    ///
    /// Fails if a candidate pins no fixed values, or if two candidates pin
    /// the same tuple.
    pub(crate) fn build<'a>(
        abstract_type: &str,
        concrete: impl IntoIterator<Item = &'a EntityType>,
    ) -> Result<Self, CoreError> {
        let mut candidates: Vec<DowncastCandidate> = Vec::new();

        for entity_type in concrete {
            let mut fixed: Vec<(String, Value)> = entity_type
                .fixed_values()
                .into_iter()
                .map(|(node, value)| (node.to_string(), value.clone()))
                .collect();
            if fixed.is_empty() {
                return Err(CoreError::NoFixedValues {
                    abstract_type: abstract_type.to_string(),
                    candidate: entity_type.name().to_string(),
                });
            }
            fixed.sort_by(|a, b| a.0.cmp(&b.0));

            if let Some(clash) = candidates.iter().find(|c| c.fixed == fixed) {
                return Err(CoreError::AmbiguousDowncast {
                    abstract_type: abstract_type.to_string(),
                    candidates: vec![clash.entity_type.clone(), entity_type.name().to_string()],
                });
            }

            candidates.push(DowncastCandidate {
                entity_type: entity_type.name().to_string(),
                fixed,
            });
        }

        Ok(DowncastTable {
            abstract_type: abstract_type.to_string(),
            candidates,
        })
    }

    pub fn abstract_type(&self) -> &str {
        &self.abstract_type
    }

    pub fn candidates(&self) -> &[DowncastCandidate] {
        &self.candidates
    }

    /// Picks the most specific candidate whose fixed values all match.
    ///
    /// `lookup` returns the entity's current value for a node name, or
    /// `None` when the node is unknown.
    pub fn resolve<F>(&self, lookup: F) -> Result<&str, CoreError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let matches: Vec<&DowncastCandidate> = self
            .candidates
            .iter()
            .filter(|c| {
                c.fixed
                    .iter()
                    .all(|(node, value)| lookup(node).as_ref() == Some(value))
            })
            .collect();

        let best = matches.iter().map(|c| c.fixed.len()).max().ok_or_else(|| {
            CoreError::NoDowncastCandidate {
                abstract_type: self.abstract_type.clone(),
            }
        })?;

        let top: Vec<&DowncastCandidate> = matches
            .into_iter()
            .filter(|c| c.fixed.len() == best)
            .collect();
        if top.len() > 1 {
            return Err(CoreError::AmbiguousDowncast {
                abstract_type: self.abstract_type.clone(),
                candidates: top.iter().map(|c| c.entity_type.clone()).collect(),
            });
        }
        Ok(&top[0].entity_type)
    }
}
