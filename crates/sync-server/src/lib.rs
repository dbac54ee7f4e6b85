//! compendium-sync-server library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the dev server components,
//! allowing integration tests to access internal types.

pub mod compile;
pub mod connection;
pub mod dev_server;
pub mod native_fs;
pub mod server;
pub mod transform;
pub mod watcher;

// Re-export key types for convenience
pub use compile::{compile_packs, CommandCompiler, PackCompiler};
pub use connection::{ClientConnection, ConnectionEvent, IncomingFrame};
pub use dev_server::DevServer;
pub use native_fs::NativeFs;
pub use server::{ServerEvent, WebSocketServer};
pub use transform::CommandTransformer;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
