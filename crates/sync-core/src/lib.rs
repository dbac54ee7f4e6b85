//! compendium-sync-core: Platform-independent pieces of the compendium sync bridge.
//!
//! This crate provides:
//! - Flattening of document trees into keyed records
//! - Root resolution and lifecycle handling on the application side
//! - The custom-event protocol spoken with the dev server
//! - Materialization of records into a directory of JSON files
//! - FileSystem and Host trait abstractions

pub mod config;
pub mod conflict;
pub mod document;
pub mod flatten;
pub mod fs;
pub mod hooks;
pub mod host;
pub mod materialize;
pub mod naming;
pub mod protocol;
pub mod push;
pub mod root;
pub mod runtime;
pub mod transform;

pub use config::{ModuleManifest, SyncOptions};
pub use document::{Document, MemoryDocument, PackMetadata, Record};
pub use flatten::{composite_key, flatten};
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs};
pub use hooks::{HookBus, Subscription};
pub use host::{Host, InMemoryHost, Notice, NoticeLevel};
pub use materialize::{DeleteOutcome, MaterializeError, Materializer, UpdateOutcome, WriteLedger};
pub use protocol::{ClientMessage, Envelope, ServerMessage};
pub use push::PushBack;
pub use root::{resolve_root, RootResolution};
pub use runtime::{ApplyOutcome, Channel, LifecycleEvent, RuntimeSync, Session};
pub use transform::{Identity, Transformer, Verdict};
