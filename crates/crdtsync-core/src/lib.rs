//! Client-side CRDT replication engine core: sub-document manager,
//! persistence, materialization, the reactive store, write actors, the
//! awareness provider, and the sync/recovery coordinator that ties them
//! into the public `Collection` surface.

pub mod actor;
pub mod awareness;
pub mod coordinator;
pub mod materialize;
pub mod mem;
pub mod persistence;
pub mod schema;
pub mod store;
pub mod subdoc;
pub mod ydoc;

pub use actor::{ActorConfig, ActorManagerStats, WriteActor, WriteActorManager};
pub use awareness::{AwarenessConfig, AwarenessProvider, LocalPresence, PresenceState};
pub use coordinator::{Collection, CollectionConfig, EditorBinding, Fragment, LazyCollection};
pub use materialize::{OpItem, OpsHandle};
pub use mem::MemoryStorageAdapter;
pub use persistence::{DocPersistenceProvider, DocStats, Kv, PersistenceFactory, StorageAdapter};
pub use schema::{CollectionSchema, FieldKind};
pub use store::{InMemoryStore, ReactiveStore, StoreEvent, WriteKind};
pub use subdoc::SubDocumentManager;

// vim: ts=4
