//! Database context: named collections, schema bootstrap, server clock.

mod clock;
mod context;
mod schema;

pub use context::DbContext;
pub use schema::SCHEMA_VERSION;
