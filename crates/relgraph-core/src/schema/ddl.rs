//! Table ordering for DDL and lock acquisition.
//!
//! Tables are ordered so that every table follows the tables its reference
//! columns point at. The same ranks drive deadlock avoidance in the persist
//! analyser: writers touch tables in one global order.

use std::collections::HashMap;
use std::sync::Arc;

use relgraph_deps::{sort, DependencyOrder, DependencyRules};

use crate::error::CoreError;

use super::definition::EntityType;
use super::registry::DefinitionSet;

/// Orders entity types by table. One representative type per table: the
/// first declared type stored there.
struct TableRules<'a> {
    defs: &'a DefinitionSet,
}

impl TableRules<'_> {
    fn representative(&self, table: &str) -> Option<Arc<EntityType>> {
        self.defs.types().find(|t| t.table() == table).cloned()
    }
}

impl DependencyRules for TableRules<'_> {
    type Item = Arc<EntityType>;
    type Key = String;
    type Error = CoreError;

    fn key(&self, item: &Arc<EntityType>) -> String {
        item.table().to_string()
    }

    fn dependencies_of(
        &mut self,
        item: &Arc<EntityType>,
    ) -> Result<Vec<Arc<EntityType>>, CoreError> {
        let mut deps = Vec::new();
        for sharing in self.defs.types().filter(|t| t.table() == item.table()) {
            for node in sharing.nodes().filter(|n| n.is_ref()) {
                let Some(target) = node.target() else { continue };
                let target = self.defs.get(target)?;
                if target.table() == item.table() {
                    continue;
                }
                if let Some(rep) = self.representative(target.table()) {
                    deps.push(rep);
                }
            }
        }
        Ok(deps)
    }
}

/// Orders all tables of `defs`, referenced tables first.
///
/// Call `reversed()` on the result for drop order.
pub fn ddl_order(defs: &DefinitionSet) -> Result<DependencyOrder<Arc<EntityType>>, CoreError> {
    let rules = TableRules { defs };
    let mut seen = std::collections::HashSet::new();
    let roots: Vec<Arc<EntityType>> = defs
        .types()
        .filter(|t| seen.insert(t.table().to_string()))
        .cloned()
        .collect();
    sort(rules, roots)
}

/// Position of every table in [`ddl_order`].
pub fn table_ranks(defs: &DefinitionSet) -> Result<HashMap<String, usize>, CoreError> {
    Ok(ddl_order(defs)?
        .iter()
        .enumerate()
        .map(|(rank, t)| (t.table().to_string(), rank))
        .collect())
}
