//! # pagesnap-core
//!
//! Core types, traits, and abstractions for the pagesnap screenshot service.
//!
//! This crate provides the job model and its state machine, the collaborator
//! traits the lifecycle controller talks to (job store, message queue,
//! renderer, artifact publisher), the shared error types, and in-memory
//! implementations of the store and queue for tests and local runs.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, PublishError, RenderError, Result};
pub use memory::{InMemoryJobStore, InMemoryQueue};
pub use models::*;
pub use traits::*;
