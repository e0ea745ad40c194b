use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};

use notify::RecommendedWatcher;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::cache::{CacheError, CacheSnapshot, NodeRecord, StateCache, cache_name};
use crate::client::{SharedApp, SharedServices};
use crate::fsaccess::{EntryType, FileInfo, FsAccess};
use crate::node::{LocalTree, NodeId, NodeKind, RemoteHandle, SharedTree, SyncTag};
use crate::notifier::{DirNotify, Dstime, NotifyQueue, start_notify_watcher};
use crate::paths::{self, PathCodec, PathError};

/// Entries younger than this many deciseconds are left in the queue so a
/// burst of writes settles before the file is fingerprinted.
const SCAN_DEBOUNCE_DS: Dstime = 3;

/// During the initial scan the cache is only flushed once this many inserts
/// have piled up.
const INITIAL_SCAN_FLUSH_THRESHOLD: usize = 100;

/// Reload recursion limit, a guard against corrupted parent chains.
const CACHE_RELOAD_MAX_DEPTH: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    InitialScan,
    Active,
    Paused,
    Failed,
    Canceled,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Failed | SyncState::Canceled)
    }
}

/// Hard condition that drove a sync into FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFault {
    RootIsFile,
    CacheCorrupt,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("sync is not in a terminal state")]
    NotTerminal,
}

/// What a tick left behind, for the outer loop's scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Both queues drained, nothing pending.
    Idle,
    /// Work remains; tick again as soon as convenient.
    Working,
    /// The queue head is debounced; come back in this many deciseconds.
    Wait(Dstime),
}

/// Classification result of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checked {
    Found(NodeId),
    /// No action: skipped, invalid, consumed by a move, or failed softly.
    Nothing,
    /// The parent is not modeled remotely yet; leave the entry queued.
    Defer,
}

/// One queue's drain result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Done,
    /// A deferred entry blocks the head; retry next tick.
    Again,
    Wait(Dstime),
}

pub struct SyncConfig {
    pub tag: SyncTag,
    /// Native path of the local root; becomes the root node's name.
    pub root_path: Vec<u8>,
    pub remote_root: RemoteHandle,
    pub user_id: u64,
    /// Directory holding the per-sync cache database; `None` disables the
    /// durable cache.
    pub cache_dir: Option<PathBuf>,
    pub key: [u8; 32],
    pub debris_name: Vec<u8>,
    /// Volume fingerprint override; 0 means read it from the filesystem.
    pub fsfp: u64,
    pub follow_symlinks: bool,
    pub enable_watcher: bool,
}

impl SyncConfig {
    pub fn new(tag: SyncTag, root_path: Vec<u8>, remote_root: RemoteHandle) -> Self {
        Self {
            tag,
            root_path,
            remote_root,
            user_id: 0,
            cache_dir: None,
            key: [0u8; 32],
            debris_name: b".debris".to_vec(),
            fsfp: 0,
            follow_symlinks: false,
            enable_watcher: false,
        }
    }
}

/// One synchronized (local root, remote node) pair: the scan engine, its
/// notification queues and its durable state cache. Driven by `tick`.
pub struct SyncEngine {
    tag: SyncTag,
    state: SyncState,
    fault: Option<SyncFault>,
    fullscan: bool,
    scan_seq: u32,
    now_ds: Dstime,

    root: NodeId,
    root_path: Vec<u8>,
    remote_root: RemoteHandle,
    debris_local: Vec<u8>,
    sep: Vec<u8>,
    follow_symlinks: bool,

    localbytes: i64,
    file_count: u64,
    folder_count: u64,
    /// Rows the last cache reload had to drop (corrupt or unattachable).
    reload_dropped: usize,

    tree: SharedTree,
    notify: DirNotify,
    cache: Option<StateCache>,
    insertq: BTreeSet<NodeId>,
    deleteq: BTreeSet<u32>,

    fs: Arc<dyn FsAccess>,
    codec: Arc<dyn PathCodec>,
    app: SharedApp,
    services: SharedServices,

    watcher: Option<RecommendedWatcher>,
    watcher_rx: Option<mpsc::UnboundedReceiver<PathBuf>>,
}

impl SyncEngine {
    /// Builds a sync, reloads its state cache and issues the initial read
    /// of the local subtree. The sync registers itself on the shared tree.
    pub async fn start(
        config: SyncConfig,
        tree: SharedTree,
        fs: Arc<dyn FsAccess>,
        codec: Arc<dyn PathCodec>,
        app: SharedApp,
        services: SharedServices,
    ) -> Result<SyncEngine, EngineError> {
        let fsfp = if config.fsfp != 0 {
            config.fsfp
        } else {
            fs.volume_fingerprint(&config.root_path)
        };
        let sep = codec.separator().to_vec();
        let debris_local = paths::join(&config.root_path, &config.debris_name, &sep);

        let root = {
            let mut t = tree.lock().expect("tree mutex poisoned");
            t.register_sync(config.tag, fsfp);
            let root = t.add_node(config.tag, NodeKind::Folder, None, config.root_path.clone());
            t.set_remote(root, Some(config.remote_root));
            root
        };

        let mut sync = SyncEngine {
            tag: config.tag,
            state: SyncState::InitialScan,
            fault: None,
            fullscan: true,
            scan_seq: 0,
            now_ds: 0,
            root,
            root_path: config.root_path.clone(),
            remote_root: config.remote_root,
            debris_local,
            sep,
            follow_symlinks: config.follow_symlinks,
            localbytes: 0,
            file_count: 0,
            folder_count: 0,
            reload_dropped: 0,
            tree,
            notify: DirNotify::new(fsfp),
            cache: None,
            insertq: BTreeSet::new(),
            deleteq: BTreeSet::new(),
            fs,
            codec,
            app,
            services,
            watcher: None,
            watcher_rx: None,
        };

        match sync.fs.open(&config.root_path, config.follow_symlinks) {
            Ok(info) if info.kind == EntryType::File => {
                sync.fault = Some(SyncFault::RootIsFile);
                sync.changestate(SyncState::Failed);
                return Ok(sync);
            }
            Ok(info) => {
                if let Some(dir) = &config.cache_dir
                    && info.inode_valid
                {
                    let name = cache_name(info.inode, config.remote_root, config.user_id);
                    let cache =
                        StateCache::open(&dir.join(format!("{name}.db")), &config.key).await?;
                    sync.cache = Some(cache);
                    sync.readstatecache().await?;
                }
            }
            Err(_) => {
                // unreadable root: stay cacheless, scanning will retry
            }
        }

        // reconcile the reloaded tree against on-disk reality
        sync.fullscan = true;
        sync.scan_seq = sync.scan_seq.wrapping_add(1);
        sync.statecacheadd(root);

        if config.enable_watcher {
            let root_dir = paths::native_to_path(&config.root_path)?;
            let (watcher, rx) = start_notify_watcher(&root_dir)?;
            sync.watcher = Some(watcher);
            sync.watcher_rx = Some(rx);
        }

        let root_path = sync.root_path.clone();
        sync.scan(&root_path);
        Ok(sync)
    }

    pub fn tag(&self) -> SyncTag {
        self.tag
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn fault(&self) -> Option<SyncFault> {
        self.fault
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn localbytes(&self) -> i64 {
        self.localbytes
    }

    pub fn node_counts(&self) -> (u64, u64) {
        (self.file_count, self.folder_count)
    }

    pub fn reload_dropped(&self) -> usize {
        self.reload_dropped
    }

    pub fn fs_fingerprint(&self) -> u64 {
        self.notify.fs_fingerprint()
    }

    pub fn cache(&self) -> Option<&StateCache> {
        self.cache.as_ref()
    }

    /// Entries pending across both queues.
    pub fn pending(&self) -> usize {
        self.notify.len(NotifyQueue::DirEvents) + self.notify.len(NotifyQueue::Retry)
    }

    /// Classifies one entry whose parent is already modeled: `path` is the
    /// absolute native path and `name` its last component. Lets the outer
    /// client reflect an entry it just materialized (a finished download,
    /// a directory it created) without a queue round trip. The caller is
    /// expected to have applied its own syncability gate. Returns the
    /// node, or `None` when the entry was skipped, consumed by a move, or
    /// cannot be examined yet.
    pub fn checkpath_name(&mut self, parent: NodeId, path: &[u8], name: &[u8]) -> Option<NodeId> {
        match self.checkpath(Some(parent), path, Some(name)) {
            Checked::Found(id) => Some(id),
            Checked::Nothing | Checked::Defer => None,
        }
    }

    /// Feeds an externally observed change (outer client's own watcher or a
    /// test). `path` is absolute, prefixed by the root's native path.
    pub fn notify_change(&mut self, path: &[u8], now: Dstime) {
        if paths::within(path, &self.debris_local, &self.sep) {
            return;
        }
        self.notify
            .notify(NotifyQueue::DirEvents, None, path.to_vec(), now);
    }

    pub fn pause(&mut self) {
        if self.state == SyncState::Active {
            self.changestate(SyncState::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.state == SyncState::Paused {
            self.changestate(SyncState::Active);
        }
    }

    pub fn fail(&mut self, fault: SyncFault) {
        if !self.state.is_terminal() {
            self.fault = Some(fault);
            self.changestate(SyncState::Failed);
        }
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.changestate(SyncState::Canceled);
        }
    }

    /// Kicks off another full pass over the subtree; missing nodes are then
    /// collected in bulk once the pass quiesces.
    pub fn rescan(&mut self) {
        if self.state.is_terminal() || self.state == SyncState::Paused {
            return;
        }
        self.fullscan = true;
        self.scan_seq = self.scan_seq.wrapping_add(1);
        let root_path = self.root_path.clone();
        self.scan(&root_path);
    }

    /// Tears the sync down. Only legal in a terminal state: cancels every
    /// transfer under the subtree, removes the nodes from the shared tree
    /// and unregisters.
    pub async fn destroy(self) -> Result<(), EngineError> {
        if !self.state.is_terminal() {
            return Err(EngineError::NotTerminal);
        }
        self.services
            .lock()
            .expect("services mutex poisoned")
            .cancel_transfers_under(self.remote_root);
        {
            let mut tree = self.tree.lock().expect("tree mutex poisoned");
            tree.remove_subtree(self.root);
            tree.unregister_sync(self.tag);
        }
        Ok(())
    }

    /// One cooperative slice of scanning: drains watcher events into the
    /// queues, then both queues subject to debounce and yield rules.
    pub async fn tick(&mut self, now_ds: Dstime) -> Result<TickOutcome, EngineError> {
        if self.state.is_terminal() || self.state == SyncState::Paused {
            return Ok(TickOutcome::Idle);
        }
        self.now_ds = now_ds;
        self.pump_watcher();

        let first = self.procscanq(NotifyQueue::DirEvents).await?;
        let second = self.procscanq(NotifyQueue::Retry).await?;

        if self.fullscan
            && self.notify.is_empty()
            && first == Drain::Done
            && second == Drain::Done
        {
            self.deletemissing(self.root);
            if self.state == SyncState::InitialScan {
                self.changestate(SyncState::Active);
            } else {
                self.fullscan = false;
            }
            self.cachenodes().await?;
        }

        if first == Drain::Again || second == Drain::Again {
            return Ok(TickOutcome::Working);
        }
        let wait = match (first, second) {
            (Drain::Wait(a), Drain::Wait(b)) => Some(a.min(b)),
            (Drain::Wait(a), _) => Some(a),
            (_, Drain::Wait(b)) => Some(b),
            _ => None,
        };
        if let Some(wait) = wait {
            return Ok(TickOutcome::Wait(wait));
        }
        if self.notify.is_empty() {
            Ok(TickOutcome::Idle)
        } else {
            Ok(TickOutcome::Working)
        }
    }

    fn tree(&self) -> MutexGuard<'_, LocalTree> {
        self.tree.lock().expect("tree mutex poisoned")
    }

    fn changestate(&mut self, new: SyncState) {
        if new != self.state {
            self.app
                .lock()
                .expect("app mutex poisoned")
                .syncupdate_state(self.tag, new);
            self.state = new;
            self.fullscan = false;
        }
    }

    fn pump_watcher(&mut self) {
        let Some(rx) = &mut self.watcher_rx else {
            return;
        };
        let mut incoming = Vec::new();
        while let Ok(path) = rx.try_recv() {
            incoming.push(path);
        }
        for path in incoming {
            let Ok(native) = paths::path_to_native(&path) else {
                continue;
            };
            if !paths::within(&native, &self.root_path, &self.sep)
                || paths::within(&native, &self.debris_local, &self.sep)
            {
                continue;
            }
            self.notify
                .notify(NotifyQueue::DirEvents, None, native, self.now_ds);
        }
    }

    /// Enumerates a directory and queues each syncable, non-debris child.
    /// Recursion is converted into queue entries so ticks stay short.
    fn scan(&mut self, path: &[u8]) -> bool {
        let sep = self.sep.clone();
        if paths::within(path, &self.debris_local, &sep) {
            return false;
        }
        let Ok(names) = self.fs.open_dir(path) else {
            return false;
        };
        for name in names {
            let display = self.codec.to_display_name(&name);
            let full = paths::join(path, &name, &sep);
            let syncable = self
                .app
                .lock()
                .expect("app mutex poisoned")
                .sync_syncable(&display, &full, &name);
            if syncable && !paths::within(&full, &self.debris_local, &sep) {
                let now = self.now_ds;
                self.notify.notify(NotifyQueue::DirEvents, None, full, now);
            }
        }
        true
    }

    async fn procscanq(&mut self, q: NotifyQueue) -> Result<Drain, EngineError> {
        let mut remaining = self.notify.len(q);
        let dsmin = self.now_ds.saturating_sub(SCAN_DEBOUNCE_DS);

        while remaining > 0 {
            remaining -= 1;
            let (hint, path, timestamp) = {
                let front = self.notify.front(q).expect("queue length checked");
                (front.hint, front.path.clone(), front.timestamp)
            };
            if timestamp > dsmin {
                return Ok(Drain::Wait(timestamp - dsmin));
            }

            let checked = self.checkpath(hint, &path, None);
            if checked == Checked::Defer {
                return Ok(Drain::Again);
            }
            self.notify.pop_front(q);

            // yield after one fingerprinted file so ticks stay short, and
            // while the outer client is busy adding remote nodes
            let hit_file = matches!(checked, Checked::Found(id)
                if self.tree().try_get(id).map(|n| n.kind == NodeKind::File).unwrap_or(false));
            if hit_file
                || self
                    .services
                    .lock()
                    .expect("services mutex poisoned")
                    .syncadding()
            {
                break;
            }
        }

        if self.notify.len(q) > 0 {
            if q == NotifyQueue::DirEvents {
                self.services
                    .lock()
                    .expect("services mutex poisoned")
                    .note_activity();
            }
        } else if self.notify.is_empty() {
            self.cachenodes().await?;
        }
        Ok(Drain::Done)
    }

    /// Classifies the entry at `path` (relative to `hint`, absolute when
    /// `hint` is none) and makes the tree reflect it: reuse, mutate, move
    /// or create the corresponding node.
    fn checkpath(&mut self, hint: Option<NodeId>, path: &[u8], last_name: Option<&[u8]>) -> Checked {
        if self.state.is_terminal() {
            return Checked::Nothing;
        }
        let sep = self.sep.clone();

        // the hinted node may have been destroyed since the entry was queued
        if let Some(h) = hint
            && !self.tree().contains(h)
        {
            return Checked::Nothing;
        }

        let abspath: Vec<u8>;
        let mut l: Option<NodeId>;
        let parent: Option<NodeId>;
        let residual: Vec<u8>;
        let isroot: bool;

        if let Some(name) = last_name {
            // shortcut: path is absolute and name its last component
            abspath = path.to_vec();
            l = None;
            parent = hint;
            residual = name.to_vec();
            isroot = false;
        } else {
            abspath = {
                let tree = self.tree();
                match hint {
                    Some(h) => {
                        let base = tree.path_of(h, &sep);
                        if path.is_empty() {
                            base
                        } else {
                            paths::join(&base, path, &sep)
                        }
                    }
                    None => path.to_vec(),
                }
            };

            let lookup = self.tree().lookup_by_path(hint, self.root, path, &sep);
            l = lookup.node;
            parent = lookup.parent;
            residual = lookup.residual;

            // separators left in the residual mean the parent directory has
            // not been scanned yet; queue it and drop this entry for now
            if let Some(idx) = paths::find_separator(&residual, &sep, 0) {
                let parentpath = abspath[..abspath.len() - residual.len() + idx].to_vec();
                eprintln!(
                    "[treesync] parent not modeled yet: {}",
                    self.codec.to_utf8(&parentpath)
                );
                let now = self.now_ds;
                self.notify
                    .notify(NotifyQueue::DirEvents, None, parentpath, now);
                return Checked::Nothing;
            }

            if l.is_none() && residual.is_empty() {
                eprintln!("[treesync] invalid path: {}", self.codec.to_utf8(&abspath));
                return Checked::Nothing;
            }

            let display = self.codec.to_display_name(&residual);
            if !self
                .app
                .lock()
                .expect("app mutex poisoned")
                .sync_syncable(&display, &abspath, &residual)
            {
                return Checked::Nothing;
            }

            isroot = l == Some(self.root) && residual.is_empty();
        }

        // postpone work under parents whose remote side is not known yet
        if let Some(p) = parent
            && self.tree().get(p).remote.is_none()
        {
            return Checked::Defer;
        }

        let info = match self.fs.open(&abspath, self.follow_symlinks) {
            Ok(info) => info,
            Err(err) => {
                if err.retry {
                    // in last-name mode the path is absolute, so the
                    // requeued entry must not be read relative to the hint
                    let requeue_hint = if last_name.is_some() { None } else { hint };
                    let now = self.now_ds;
                    self.notify
                        .notify(NotifyQueue::Retry, requeue_hint, path.to_vec(), now);
                } else if let Some(lid) = l {
                    self.stop_transfer(lid);
                    self.services
                        .lock()
                        .expect("services mutex poisoned")
                        .note_activity();
                    // during a full scan, missing nodes are collected in
                    // bulk by deletemissing instead
                    if !self.fullscan {
                        self.bump_not_seen(lid);
                    }
                }
                return Checked::Nothing;
            }
        };
        let fkind = match info.kind {
            EntryType::File => NodeKind::File,
            EntryType::Dir => NodeKind::Folder,
        };

        // cheap reattach during a full scan: matching identity means the
        // cached metadata can stand in for a fresh fingerprint
        if self.fullscan {
            let lastpart = self.codec.last_component_offset(&abspath);
            let fname = &abspath[lastpart..];
            let pid = parent.unwrap_or(self.root);
            let cl = self.tree().child_by_name(pid, fname);
            let same_identity = match cl {
                Some(cl) if info.inode_valid => self.tree().get(cl).inode == Some(info.inode),
                _ => false,
            };
            if let Some(cl) = cl
                && same_identity
            {
                let (kind, size, mtime) = {
                    let mut tree = self.tree();
                    let n = tree.get_mut(cl);
                    n.deleted = false;
                    n.not_seen = 0;
                    (n.kind, n.size, n.mtime)
                };
                l = Some(cl);
                if kind != NodeKind::File || (size == info.size && mtime == info.mtime) {
                    let seq = self.scan_seq;
                    self.tree().get_mut(cl).scan_seq = seq;
                    if kind == NodeKind::Folder {
                        self.scan(&abspath);
                    }
                    return Checked::Found(cl);
                }
            }
        }

        let mut newnode = false;

        if !isroot {
            if let Some(lid) = l {
                if self.tree().get(lid).kind == fkind {
                    self.tree().get_mut(lid).not_seen = 0;

                    if fkind == NodeKind::File {
                        if info.inode_valid && self.tree().get(lid).inode != Some(info.inode) {
                            // the file at this path carries a new identity:
                            // either something was moved over it, or the
                            // inode was recycled by a delete/create cycle
                            let other = self
                                .tree()
                                .node_by_inode(info.inode)
                                .filter(|&o| o != lid);
                            if let Some(other) = other {
                                let (osize, omtime, otag) = {
                                    let t = self.tree();
                                    let n = t.get(other);
                                    (n.size, n.mtime, n.sync_tag)
                                };
                                // inodes are only unique per volume, so the
                                // candidate counts solely within this
                                // volume's fingerprint class
                                let same_class = otag == self.tag || {
                                    let t = self.tree();
                                    let fp1 = t.fsfp_of(self.tag);
                                    fp1 != 0 && fp1 == t.fsfp_of(otag)
                                };
                                if omtime != info.mtime || osize != info.size {
                                    // recycled inode; the stale index entry
                                    // must not shadow this volume's files
                                    if same_class {
                                        self.tree().drop_inode_entry(info.inode);
                                    }
                                } else if same_class {
                                    eprintln!("[treesync] file move/overwrite detected");
                                    self.delete_subtree(lid);
                                    self.services
                                        .lock()
                                        .expect("services mutex poisoned")
                                        .execsyncdeletions();
                                    let display = self.codec.to_utf8(&abspath);
                                    self.app
                                        .lock()
                                        .expect("app mutex poisoned")
                                        .syncupdate_local_move(self.tag, other, &display);
                                    let lastpart = self.codec.last_component_offset(&abspath);
                                    let fname = abspath[lastpart..].to_vec();
                                    let pid = parent.unwrap_or(self.root);
                                    self.tree().set_name_parent(other, pid, fname);
                                    self.tree().get_mut(other).not_seen = 0;
                                    self.statecacheadd(other);
                                    return Checked::Found(other);
                                } else {
                                    // same inode value on another volume:
                                    // an unrelated file landed here
                                    self.tree().get_mut(lid).mtime = -1;
                                }
                            } else {
                                // unknown identity: force change detection
                                self.tree().get_mut(lid).mtime = -1;
                            }
                        }

                        let (lsize, lmtime) = {
                            let t = self.tree();
                            let n = t.get(lid);
                            (n.size, n.mtime)
                        };
                        if info.mtime != lmtime || info.size != lsize {
                            if info.inode_valid
                                && self.tree().get(lid).inode != Some(info.inode)
                            {
                                self.tree().set_inode(lid, info.inode);
                            }
                            let dsize = lsize.max(0);
                            if self.genfingerprint(lid, &info, &abspath) {
                                let newsize = self.tree().get(lid).size;
                                self.localbytes -= dsize - newsize;
                            }
                            let display = self.codec.to_utf8(&abspath);
                            self.app
                                .lock()
                                .expect("app mutex poisoned")
                                .syncupdate_local_file_change(self.tag, lid, &display);
                            self.stop_transfer(lid);
                            self.tree().get_mut(lid).deleted = false;
                            self.services
                                .lock()
                                .expect("services mutex poisoned")
                                .note_activity();
                            self.statecacheadd(lid);
                            return Checked::Found(lid);
                        }
                    } else {
                        // overwritten folders are tolerated, their content
                        // is re-scanned anyway
                        if info.inode_valid {
                            self.tree().set_inode(lid, info.inode);
                        }
                    }
                } else {
                    eprintln!("[treesync] node type changed, recreating");
                    self.delete_subtree(lid);
                    l = None;
                }
            }

            if l.is_none() {
                // apparition at a new path: rename/move of a known node?
                let candidate = if info.inode_valid {
                    self.tree().node_by_inode(info.inode)
                } else {
                    None
                };
                let mover = candidate.filter(|&c| {
                    let t = self.tree();
                    let n = t.get(c);
                    n.kind == fkind
                        && (parent.is_none()
                            || n.sync_tag == self.tag
                            || {
                                let fp1 = t.fsfp_of(n.sync_tag);
                                fp1 != 0 && fp1 == t.fsfp_of(self.tag)
                            })
                        && (n.kind != NodeKind::File
                            || (n.mtime == info.mtime && n.size == info.size))
                });
                if let Some(mover) = mover {
                    eprintln!("[treesync] move detected by inode");
                    let display = self.codec.to_utf8(&abspath);
                    self.app
                        .lock()
                        .expect("app mutex poisoned")
                        .syncupdate_local_move(self.tag, mover, &display);
                    let lastpart = self.codec.last_component_offset(&abspath);
                    let fname = abspath[lastpart..].to_vec();
                    let pid = parent.unwrap_or(self.root);
                    self.tree().set_name_parent(mover, pid, fname);
                    self.services
                        .lock()
                        .expect("services mutex poisoned")
                        .updateputs();
                    self.statecacheadd(mover);
                    self.tree().get_mut(mover).not_seen = 0;
                    if self.fullscan && self.tree().get(mover).kind == NodeKind::Folder {
                        self.scan(&abspath);
                    }
                    return Checked::Nothing;
                }

                let Some(pid) = parent else {
                    return Checked::Nothing;
                };
                let lastpart = self.codec.last_component_offset(&abspath);
                let fname = abspath[lastpart..].to_vec();
                let id = {
                    let mut tree = self.tree();
                    let id = tree.add_node(self.tag, fkind, Some(pid), fname);
                    if info.inode_valid {
                        tree.set_inode(id, info.inode);
                    }
                    let seq = self.scan_seq;
                    tree.get_mut(id).scan_seq = seq;
                    id
                };
                l = Some(id);
                newnode = true;
            }
        }

        let Some(lid) = l else {
            return Checked::Nothing;
        };

        if self.tree().get(lid).kind == NodeKind::Folder {
            if newnode {
                self.folder_count += 1;
                self.scan(&abspath);
                let display = self.codec.to_utf8(&abspath);
                self.app
                    .lock()
                    .expect("app mutex poisoned")
                    .syncupdate_local_folder_addition(self.tag, lid, &display);
                if !isroot {
                    self.statecacheadd(lid);
                }
                self.services
                    .lock()
                    .expect("services mutex poisoned")
                    .note_activity();
                Checked::Found(lid)
            } else {
                Checked::Nothing
            }
        } else if isroot {
            eprintln!("[treesync] the local sync root is a file");
            self.fault = Some(SyncFault::RootIsFile);
            self.changestate(SyncState::Failed);
            Checked::Nothing
        } else {
            let prevsize = self.tree().get(lid).size;
            if prevsize > 0 {
                self.localbytes -= prevsize;
            }
            let changed = self.genfingerprint(lid, &info, &abspath);
            if changed {
                self.tree().get_mut(lid).deleted = false;
            }
            let newsize = self.tree().get(lid).size;
            if newsize > 0 {
                self.localbytes += newsize;
            }
            if newnode {
                self.file_count += 1;
                let display = self.codec.to_utf8(&abspath);
                self.app
                    .lock()
                    .expect("app mutex poisoned")
                    .syncupdate_local_file_addition(self.tag, lid, &display);
            } else if changed {
                let display = self.codec.to_utf8(&abspath);
                self.app
                    .lock()
                    .expect("app mutex poisoned")
                    .syncupdate_local_file_change(self.tag, lid, &display);
            }
            if newnode || changed {
                self.statecacheadd(lid);
                self.services
                    .lock()
                    .expect("services mutex poisoned")
                    .note_activity();
            }
            Checked::Found(lid)
        }
    }

    /// Re-reads the content fingerprint; returns whether it changed. Size
    /// and mtime are adopted from the open only when the read succeeded.
    fn genfingerprint(&mut self, id: NodeId, info: &FileInfo, abspath: &[u8]) -> bool {
        let Ok(new) = self.fs.fingerprint(abspath) else {
            return false;
        };
        let mut tree = self.tree();
        let n = tree.get_mut(id);
        let changed = n.fingerprint.as_deref() != Some(new.as_slice());
        n.fingerprint = Some(new);
        n.size = info.size;
        n.mtime = info.mtime;
        changed
    }

    fn stop_transfer(&mut self, id: NodeId) {
        let token = {
            let mut tree = self.tree();
            tree.get_mut(id).transfer.take()
        };
        if let Some(token) = token {
            token.cancel();
            self.services
                .lock()
                .expect("services mutex poisoned")
                .stopxfer(id);
        }
    }

    fn bump_not_seen(&mut self, id: NodeId) {
        let count = {
            let mut tree = self.tree();
            let n = tree.get_mut(id);
            n.not_seen = n.not_seen.saturating_add(1);
            n.not_seen
        };
        if count == 1 {
            // give the entry one recheck before tombstoning
            let sep = self.sep.clone();
            let path = self.tree().path_of(id, &sep);
            let now = self.now_ds;
            self.notify.notify(NotifyQueue::Retry, None, path, now);
        } else {
            self.tree().get_mut(id).deleted = true;
            self.stop_transfer(id);
            self.services
                .lock()
                .expect("services mutex poisoned")
                .note_activity();
        }
    }

    /// Removes a subtree from the shared tree and routes the fallout: cache
    /// rows to the owning sync's delete queue, counters, transfer stops.
    fn delete_subtree(&mut self, id: NodeId) {
        let removed = {
            let mut tree = self.tree();
            tree.remove_subtree(id)
        };
        for r in removed {
            if r.sync_tag == self.tag {
                self.insertq.remove(&r.id);
                if self.state != SyncState::Canceled && r.cache_row != 0 {
                    self.deleteq.insert(r.cache_row);
                }
                match r.kind {
                    NodeKind::File => {
                        self.file_count = self.file_count.saturating_sub(1);
                        if r.size > 0 {
                            self.localbytes -= r.size;
                        }
                    }
                    NodeKind::Folder => {
                        self.folder_count = self.folder_count.saturating_sub(1);
                    }
                }
                if r.had_transfer {
                    self.services
                        .lock()
                        .expect("services mutex poisoned")
                        .stopxfer(r.id);
                }
            } else if r.cache_row != 0 {
                self.tree().push_pending_row_del(r.sync_tag, r.cache_row);
            }
        }
    }

    /// Drops every child whose scan generation lags by two or more, in
    /// post-order so descendants go first.
    fn deletemissing(&mut self, id: NodeId) {
        let children = {
            let tree = self.tree();
            if tree.contains(id) {
                tree.children_of(id)
            } else {
                Vec::new()
            }
        };
        for child in children {
            let lag = {
                let tree = self.tree();
                let Some(n) = tree.try_get(child) else {
                    continue;
                };
                self.scan_seq.wrapping_sub(n.scan_seq)
            };
            if lag > 1 {
                self.delete_subtree(child);
            } else {
                self.deletemissing(child);
            }
        }
    }

    /// Schedules a node for persistence. No-op once canceled.
    pub fn statecacheadd(&mut self, id: NodeId) {
        if self.state == SyncState::Canceled {
            return;
        }
        let row = self.tree().try_get(id).map(|n| n.cache_row).unwrap_or(0);
        if row != 0 {
            self.deleteq.remove(&row);
        }
        self.insertq.insert(id);
    }

    /// Schedules a node's row for removal. No-op once canceled.
    pub fn statecachedel(&mut self, id: NodeId) {
        if self.state == SyncState::Canceled {
            return;
        }
        self.insertq.remove(&id);
        let row = self.tree().try_get(id).map(|n| n.cache_row).unwrap_or(0);
        if row != 0 {
            self.deleteq.insert(row);
        }
    }

    /// Flushes the queued cache mutations in one transaction. Deletions go
    /// first; inserts are written in passes so a child is never persisted
    /// before its parent has a row.
    pub async fn cachenodes(&mut self) -> Result<(), EngineError> {
        if self.state != SyncState::Canceled {
            let pending = self.tree().take_pending_row_dels(self.tag);
            self.deleteq.extend(pending);
        }

        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let flushable = self.state == SyncState::Active
            || (self.state == SyncState::InitialScan
                && self.insertq.len() > INITIAL_SCAN_FLUSH_THRESHOLD);
        if !flushable || (self.insertq.is_empty() && self.deleteq.is_empty()) {
            return Ok(());
        }

        eprintln!(
            "[treesync] saving local tree: {} additions, {} deletions",
            self.insertq.len(),
            self.deleteq.len()
        );

        let mut txn = cache.begin().await?;
        for row in std::mem::take(&mut self.deleteq) {
            txn.del(row).await?;
        }

        loop {
            let mut batch: Vec<(NodeId, u32, NodeRecord)> = Vec::new();
            let mut vanished: Vec<NodeId> = Vec::new();
            {
                let tree = self.tree();
                for &id in &self.insertq {
                    let Some(node) = tree.try_get(id) else {
                        vanished.push(id);
                        continue;
                    };
                    let parent_row = match node.parent {
                        None => 0,
                        Some(p) => {
                            let row = tree.get(p).cache_row;
                            if row == 0 {
                                continue; // parent not persisted yet
                            }
                            row
                        }
                    };
                    batch.push((
                        id,
                        node.cache_row,
                        NodeRecord {
                            parent_row,
                            kind: node.kind,
                            name: node.name.clone(),
                            size: node.size,
                            mtime: node.mtime,
                            fingerprint: node.fingerprint.clone(),
                            inode: node.inode,
                        },
                    ));
                }
            }
            for id in vanished {
                self.insertq.remove(&id);
            }
            if batch.is_empty() {
                break;
            }
            for (id, row, record) in batch {
                let assigned = txn.put(row, &record).await?;
                self.insertq.remove(&id);
                self.tree().get_mut(id).cache_row = assigned;
            }
        }

        if !self.insertq.is_empty() {
            eprintln!(
                "[treesync] state caching did not complete: {} entries stuck",
                self.insertq.len()
            );
            self.insertq.clear();
        }

        txn.commit().await?;
        Ok(())
    }

    /// Rebuilds the tree from the cache so reattaching a large subtree
    /// avoids re-fingerprinting. Rows that fail to open or attach are
    /// dropped and counted; the following full scan re-adds them.
    async fn readstatecache(&mut self) -> Result<(), EngineError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        if self.state != SyncState::InitialScan {
            return Ok(());
        }
        let snapshot: CacheSnapshot = cache.load_all().await?;
        let mut skipped = snapshot.skipped;

        let mut by_parent: HashMap<u32, Vec<(u32, NodeRecord)>> = HashMap::new();
        let mut root_row = 0u32;
        for (row, record) in snapshot.rows {
            if record.parent_row == 0 && record.kind == NodeKind::Folder && root_row == 0 {
                root_row = row;
            } else {
                by_parent.entry(record.parent_row).or_default().push((row, record));
            }
        }

        if root_row != 0 {
            let scan_seq = self.scan_seq;
            let tag = self.tag;
            let root = self.root;
            let mut counts = (0u64, 0u64, 0i64);
            {
                let mut tree = self.tree();
                tree.get_mut(root).cache_row = root_row;
                attach_cached_children(
                    &mut tree,
                    &mut by_parent,
                    tag,
                    root,
                    root_row,
                    CACHE_RELOAD_MAX_DEPTH,
                    scan_seq,
                    &mut counts,
                );
            }
            self.file_count += counts.0;
            self.folder_count += counts.1;
            self.localbytes += counts.2;
        }

        skipped += by_parent.values().map(Vec::len).sum::<usize>();
        if skipped > 0 {
            eprintln!("[treesync] state cache reload dropped {skipped} rows");
        }
        self.reload_dropped = skipped;
        Ok(())
    }

    /// Renames a file into the dated debris folder instead of destroying
    /// it: first the plain date, then up to 100 time-stamped candidates.
    /// Bails on the first transient rename error so the caller can retry.
    pub fn move_to_local_debris(&mut self, path: &[u8]) -> bool {
        let sep = self.sep.clone();
        self.fs.mkdir(&self.debris_local, true);

        let now = OffsetDateTime::now_utc();
        let day = format!("{:04}-{:02}-{:02}", now.year(), u8::from(now.month()), now.day());
        let lastpart = self.codec.last_component_offset(path);

        for attempt in -1i32..100 {
            let candidate = if attempt < 0 {
                day.clone()
            } else {
                format!(
                    "{day} {:02}.{:02}.{:02}.{:02}",
                    now.hour(),
                    now.minute(),
                    now.second(),
                    attempt
                )
            };
            let dated = paths::join(&self.debris_local, &self.codec.to_native(&candidate), &sep);
            let made = self.fs.mkdir(&dated, true);
            let havedir = made.created || made.target_exists;

            let target = paths::join(&dated, &path[lastpart..], &sep);
            let outcome = self.fs.rename(path, &target, false);
            if outcome.renamed {
                return true;
            }
            if outcome.transient {
                return false;
            }
            if havedir && !outcome.target_exists {
                return false;
            }
        }
        false
    }
}

fn attach_cached_children(
    tree: &mut LocalTree,
    by_parent: &mut HashMap<u32, Vec<(u32, NodeRecord)>>,
    tag: SyncTag,
    parent: NodeId,
    parent_row: u32,
    depth: u32,
    scan_seq: u32,
    counts: &mut (u64, u64, i64),
) {
    if depth == 0 {
        return;
    }
    let Some(rows) = by_parent.remove(&parent_row) else {
        return;
    };
    for (row, record) in rows {
        let id = tree.add_node(tag, record.kind, Some(parent), record.name);
        {
            let n = tree.get_mut(id);
            n.size = record.size;
            n.mtime = record.mtime;
            n.fingerprint = record.fingerprint;
            n.cache_row = row;
            n.scan_seq = scan_seq;
        }
        if let Some(inode) = record.inode {
            tree.set_inode(id, inode);
        }
        match record.kind {
            NodeKind::File => {
                counts.0 += 1;
                counts.2 += record.size.max(0);
            }
            NodeKind::Folder => counts.1 += 1,
        }
        attach_cached_children(tree, by_parent, tag, id, row, depth - 1, scan_seq, counts);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
