//! The schema graph: every known migration and its dependency edges.

use crate::discovery::MigrationSource;
use crate::error::MigrationError;
use crate::record::{MigrationId, MigrationRecord};
use std::collections::{BTreeMap, HashMap};

/// DFS marking used for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Immutable mapping from migration identity to record.
///
/// Construction guarantees that every dependency resolves to a loaded record
/// and that the dependency relation is acyclic.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    records: BTreeMap<MigrationId, MigrationRecord>,
}

impl SchemaGraph {
    /// Build and validate a graph.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::Load`] for duplicate or malformed identities.
    /// - [`MigrationError::UnknownDependency`] for dangling dependency references.
    /// - [`MigrationError::Cycle`] if the dependency relation is not a DAG.
    pub fn load(records: impl IntoIterator<Item = MigrationRecord>) -> Result<Self, MigrationError> {
        let mut map = BTreeMap::new();
        for record in records {
            let id = record.id();
            record.validate_identity(&id.to_string())?;
            if map.insert(id.clone(), record).is_some() {
                return Err(MigrationError::Load {
                    source_name: id.to_string(),
                    reason: "duplicate migration identity".to_string(),
                });
            }
        }

        for (id, record) in &map {
            for dependency in &record.dependencies {
                if !map.contains_key(dependency) {
                    return Err(MigrationError::UnknownDependency {
                        migration: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let graph = Self { records: map };
        if let Some(chain) = graph.find_cycle() {
            return Err(MigrationError::Cycle { chain });
        }

        tracing::debug!(migrations = graph.len(), "schema graph loaded");
        Ok(graph)
    }

    /// Load and validate every record a source supplies.
    pub fn from_source(source: &dyn MigrationSource) -> Result<Self, MigrationError> {
        Self::load(source.load()?)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the graph has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record.
    pub fn get(&self, id: &MigrationId) -> Option<&MigrationRecord> {
        self.records.get(id)
    }

    /// Check whether a record is loaded.
    pub fn contains(&self, id: &MigrationId) -> bool {
        self.records.contains_key(id)
    }

    /// All identities in `(app_label, name)` order.
    pub fn ids(&self) -> impl Iterator<Item = &MigrationId> {
        self.records.keys()
    }

    /// All records in `(app_label, name)` order.
    pub fn records(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.values()
    }

    /// Identity and record pairs in `(app_label, name)` order.
    pub fn entries(&self) -> impl Iterator<Item = (&MigrationId, &MigrationRecord)> {
        self.records.iter()
    }

    /// Records with no dependents inside their own app label.
    pub fn leaf_nodes(&self, app_label: &str) -> Vec<&MigrationId> {
        self.records
            .keys()
            .filter(|id| id.app_label == app_label)
            .filter(|id| {
                !self.records.values().any(|record| {
                    record.app_label == app_label && record.dependencies.contains(id)
                })
            })
            .collect()
    }

    /// Depth-first search for a cycle.
    ///
    /// Returns the member chain of the first cycle found, with the entry node
    /// repeated at the end, e.g. `[a, b, a]`. Roots are visited in identity
    /// order so the reported cycle is deterministic.
    pub(crate) fn find_cycle(&self) -> Option<Vec<MigrationId>> {
        let mut marks: HashMap<&MigrationId, Mark> = HashMap::with_capacity(self.records.len());

        for root in self.records.keys() {
            if marks.get(root).copied().unwrap_or(Mark::Unvisited) != Mark::Unvisited {
                continue;
            }

            marks.insert(root, Mark::InProgress);
            let mut stack: Vec<(&MigrationId, usize)> = vec![(root, 0)];

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let index = top.1;
                let dependencies = self
                    .records
                    .get(node)
                    .map(|record| record.dependencies.as_slice())
                    .unwrap_or(&[]);

                if index >= dependencies.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }

                top.1 += 1;
                let dependency = &dependencies[index];
                match marks.get(dependency).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Unvisited => {
                        marks.insert(dependency, Mark::InProgress);
                        stack.push((dependency, 0));
                    }
                    Mark::InProgress => {
                        let start = stack.iter().position(|(id, _)| *id == dependency)?;
                        let mut chain: Vec<MigrationId> =
                            stack[start..].iter().map(|(id, _)| (*id).clone()).collect();
                        chain.push(dependency.clone());
                        return Some(chain);
                    }
                    Mark::Done => {}
                }
            }
        }

        None
    }

    /// Build a graph without validation. Only for exercising defensive checks.
    #[cfg(test)]
    pub(crate) fn unchecked(records: Vec<MigrationRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id(), r)).collect(),
        }
    }
}
