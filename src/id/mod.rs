//! Identifier registries.
pub mod client;
pub mod server;

pub use client::ClientIdRegistry;
pub use server::{
    DimensionEntry, FileEntry, FileStatus, PendingDefinition, QueuedAttribute, ServerIdRegistry,
    VariableDeclaration, VariableEntry,
};
