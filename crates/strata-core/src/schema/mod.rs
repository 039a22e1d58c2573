//! Schema model, operation interpreter and DDL emission.

mod ddl;
mod interpreter;
mod model;

pub use ddl::{DdlEmitter, Dialect};
pub use interpreter::{InterpreterOptions, OperationInterpreter};
pub use model::{Enforcement, ForeignKeyConstraint, SchemaModel, TableState};
