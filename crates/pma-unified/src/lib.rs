//! Unified service layer
//!
//! Ties the registries, adapter registry, sync coordinator and push hub
//! together behind two collaborators: the `ActionPipeline`, which routes
//! control commands to owning adapters and reconciles the resulting
//! state, and the `UnifiedService` facade the HTTP surface calls.

pub mod pipeline;
pub mod service;

pub use pipeline::{ActionPipeline, ACTION_TIMEOUT, REFRESH_DELAY};
pub use service::{
    AreaRef, EntityWithContext, QueryOptions, RoomWithEntities, SystemStatus, UnifiedService,
};
