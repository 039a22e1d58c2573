//! Schema graph and dependency resolution.
//!
//! [`SchemaGraph::load`] validates the dependency relation once at startup;
//! [`DependencyResolver::resolve`] turns it into the deterministic apply order.

#[allow(clippy::module_inception)]
mod graph;
mod resolver;

pub use graph::SchemaGraph;
pub use resolver::DependencyResolver;
