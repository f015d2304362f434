//! Core types for the PMA gateway
//!
//! This crate provides the fundamental types shared by every component of
//! the gateway: the unified Entity and Room model, actions and their
//! results, per-source sync results, and the error taxonomy the HTTP
//! surface maps onto status codes.

mod action;
mod entity;
mod error;
mod room;
mod sync;

pub use action::{Action, ActionContext, ActionError, ActionErrorCode, ActionResult};
pub use entity::{Capability, Entity, EntityMetadata, EntityState, EntityType};
pub use error::{CoreError, CoreResult};
pub use room::Room;
pub use sync::SyncResult;

/// Source tag for locally created entities and rooms.
///
/// Entities whose `metadata.source` equals this tag are owned by the
/// gateway itself and may be mutated through the HTTP surface; everything
/// else is owned by an adapter and is read-only outside the action
/// pipeline.
pub const SOURCE_PMA: &str = "pma";
