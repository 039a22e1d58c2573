//! Deterministic topological ordering of a schema graph.

use super::SchemaGraph;
use crate::error::MigrationError;
use crate::record::{MigrationId, MigrationRecord};
use std::collections::{BTreeMap, BTreeSet};

/// Orders a [`SchemaGraph`] into a single apply sequence.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Topologically order every record in the graph.
    ///
    /// Each record appears after all of its direct and transitive
    /// dependencies. Among records whose dependencies are all placed, the
    /// smallest `(app_label, name)` goes first, so the order is reproducible
    /// across runs and independent of discovery order.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Cycle`] if the graph is not acyclic.
    pub fn resolve(graph: &SchemaGraph) -> Result<Vec<&MigrationRecord>, MigrationError> {
        let mut remaining: BTreeMap<&MigrationId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&MigrationId, Vec<&MigrationId>> = BTreeMap::new();

        for (id, record) in graph.entries() {
            let unique: BTreeSet<&MigrationId> = record.dependencies.iter().collect();
            remaining.insert(id, unique.len());
            for dependency in unique {
                dependents.entry(dependency).or_default().push(id);
            }
        }

        let mut ready: BTreeSet<&MigrationId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(graph.len());

        while let Some(id) = ready.pop_first() {
            if let Some(record) = graph.get(id) {
                order.push(record);
            }
            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() != graph.len() {
            let chain = graph.find_cycle().unwrap_or_else(|| {
                remaining
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(id, _)| (*id).clone())
                    .collect()
            });
            return Err(MigrationError::Cycle { chain });
        }

        Ok(order)
    }

    /// Identities in resolve order.
    pub fn resolve_ids(graph: &SchemaGraph) -> Result<Vec<MigrationId>, MigrationError> {
        Ok(Self::resolve(graph)?
            .into_iter()
            .map(MigrationRecord::id)
            .collect())
    }
}
