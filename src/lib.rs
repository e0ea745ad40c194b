pub mod cache;
pub mod client;
pub mod engine;
pub mod fsaccess;
pub mod node;
pub mod notifier;
pub mod paths;

pub use client::{SharedApp, SharedServices, SyncApp, SyncServices};
pub use engine::{EngineError, SyncConfig, SyncEngine, SyncFault, SyncState, TickOutcome};
pub use node::{LocalTree, NodeId, NodeKind, RemoteHandle, SharedTree};
