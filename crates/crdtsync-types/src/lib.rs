//! Shared types for the crdtsync client-side replication engine.
//!
//! This crate is deliberately CRDT-library-agnostic: it defines the
//! identifiers, wire DTOs, error taxonomy and `BackendApi` contract that
//! `crdtsync-core` builds on, without depending on `yrs` itself.

pub mod backend;
pub mod error;
pub mod ids;
pub mod material;
pub mod origin;
pub mod prose_json;

pub use error::{Error, Result, SyncError};
pub use ids::{ClientId, CollectionName, DocumentId, Seq};
pub use origin::OriginTag;

// vim: ts=4
