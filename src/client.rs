use std::sync::{Arc, Mutex};

use crate::engine::SyncState;
use crate::node::{NodeId, RemoteHandle, SyncTag};

/// Upward callbacks implemented by the outer application. Invoked from
/// within a tick, on the same thread that drives the engine.
pub trait SyncApp: Send {
    fn syncupdate_state(&mut self, sync: SyncTag, state: SyncState);

    fn syncupdate_local_file_addition(&mut self, sync: SyncTag, node: NodeId, path: &str);

    fn syncupdate_local_folder_addition(&mut self, sync: SyncTag, node: NodeId, path: &str);

    fn syncupdate_local_file_change(&mut self, sync: SyncTag, node: NodeId, path: &str);

    fn syncupdate_local_move(&mut self, sync: SyncTag, node: NodeId, new_path: &str);

    /// Gating predicate: whether a path may enter the sync. `name` is the
    /// display form of the last component; it is empty when an already
    /// modeled node is being re-examined, which should be accepted.
    fn sync_syncable(&mut self, name: &str, local_path: &[u8], local_name: &[u8]) -> bool;
}

/// Downward services provided by the outer client.
pub trait SyncServices: Send {
    /// Flush deferred remote deletions synchronously (used when a local
    /// move lands on top of an existing file).
    fn execsyncdeletions(&mut self);

    /// Refresh upload metadata after a local move.
    fn updateputs(&mut self);

    /// Cancel the in-flight transfer of a node.
    fn stopxfer(&mut self, node: NodeId);

    /// Cancel every transfer under a remote subtree (sync teardown).
    fn cancel_transfers_under(&mut self, remote: RemoteHandle);

    /// True while the client is busy adding remote nodes; the drain loop
    /// yields early when set.
    fn syncadding(&self) -> bool;

    /// Raised whenever a tick mutated the tree or left work queued.
    fn note_activity(&mut self);
}

pub type SharedApp = Arc<Mutex<dyn SyncApp>>;
pub type SharedServices = Arc<Mutex<dyn SyncServices>>;

pub fn shared_app<T: SyncApp + 'static>(app: T) -> SharedApp {
    Arc::new(Mutex::new(app))
}

pub fn shared_services<T: SyncServices + 'static>(services: T) -> SharedServices {
    Arc::new(Mutex::new(services))
}
