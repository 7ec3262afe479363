//! Pipeline store — durable, ordered collection of Items keyed by stage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::PipelineStore;
