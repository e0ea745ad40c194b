use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use super::*;
use crate::fsaccess::{MkdirOutcome, OpenError, RenameOutcome, StdFs};
use crate::node::shared_tree;
use crate::paths::{NativeCodec, path_to_native};

#[derive(Debug, Clone, PartialEq)]
enum AppEvent {
    State(SyncState),
    FileAdd(String),
    FolderAdd(String),
    FileChange(String),
    Move(String),
}

#[derive(Default)]
struct TestApp {
    events: Vec<AppEvent>,
    reject_names: Vec<String>,
    /// When set, new nodes get a remote handle right from the addition
    /// callback, the way a live client materializes the remote side.
    tree: Option<SharedTree>,
    assign_remote: bool,
    next_handle: u64,
}

impl TestApp {
    fn assign(&mut self, node: NodeId) {
        if self.assign_remote
            && let Some(tree) = &self.tree
        {
            self.next_handle += 1;
            let handle = RemoteHandle(0x4000 + self.next_handle);
            tree.lock().unwrap().set_remote(node, Some(handle));
        }
    }

    fn count(&self, pred: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl crate::client::SyncApp for TestApp {
    fn syncupdate_state(&mut self, _sync: i32, state: SyncState) {
        self.events.push(AppEvent::State(state));
    }

    fn syncupdate_local_file_addition(&mut self, _sync: i32, node: NodeId, path: &str) {
        self.events.push(AppEvent::FileAdd(path.to_string()));
        self.assign(node);
    }

    fn syncupdate_local_folder_addition(&mut self, _sync: i32, node: NodeId, path: &str) {
        self.events.push(AppEvent::FolderAdd(path.to_string()));
        self.assign(node);
    }

    fn syncupdate_local_file_change(&mut self, _sync: i32, _node: NodeId, path: &str) {
        self.events.push(AppEvent::FileChange(path.to_string()));
    }

    fn syncupdate_local_move(&mut self, _sync: i32, _node: NodeId, new_path: &str) {
        self.events.push(AppEvent::Move(new_path.to_string()));
    }

    fn sync_syncable(&mut self, name: &str, _local_path: &[u8], _local_name: &[u8]) -> bool {
        !self.reject_names.iter().any(|r| r == name)
    }
}

#[derive(Default)]
struct TestServices {
    execsyncdeletions: usize,
    updateputs: usize,
    stopped: Vec<NodeId>,
    canceled_under: Vec<RemoteHandle>,
    adding: bool,
    activity: usize,
}

impl crate::client::SyncServices for TestServices {
    fn execsyncdeletions(&mut self) {
        self.execsyncdeletions += 1;
    }

    fn updateputs(&mut self) {
        self.updateputs += 1;
    }

    fn stopxfer(&mut self, node: NodeId) {
        self.stopped.push(node);
    }

    fn cancel_transfers_under(&mut self, remote: RemoteHandle) {
        self.canceled_under.push(remote);
    }

    fn syncadding(&self) -> bool {
        self.adding
    }

    fn note_activity(&mut self) {
        self.activity += 1;
    }
}

/// Counts fingerprint computations so reattach tests can prove the cache
/// spared the re-read.
struct CountingFs {
    inner: StdFs,
    fingerprints: AtomicUsize,
}

impl CountingFs {
    fn new() -> Self {
        Self {
            inner: StdFs,
            fingerprints: AtomicUsize::new(0),
        }
    }

    fn fingerprint_calls(&self) -> usize {
        self.fingerprints.load(Ordering::SeqCst)
    }
}

impl crate::fsaccess::FsAccess for CountingFs {
    fn open(&self, path: &[u8], follow: bool) -> Result<crate::fsaccess::FileInfo, OpenError> {
        self.inner.open(path, follow)
    }

    fn open_dir(&self, path: &[u8]) -> Result<Vec<Vec<u8>>, OpenError> {
        self.inner.open_dir(path)
    }

    fn mkdir(&self, path: &[u8], recursive: bool) -> MkdirOutcome {
        self.inner.mkdir(path, recursive)
    }

    fn rename(&self, src: &[u8], dst: &[u8], replace: bool) -> RenameOutcome {
        self.inner.rename(src, dst, replace)
    }

    fn volume_fingerprint(&self, path: &[u8]) -> u64 {
        self.inner.volume_fingerprint(path)
    }

    fn fingerprint(&self, path: &[u8]) -> Result<Vec<u8>, OpenError> {
        self.fingerprints.fetch_add(1, Ordering::SeqCst);
        self.inner.fingerprint(path)
    }
}

struct Fixture {
    temp: TempDir,
    root: PathBuf,
    tree: SharedTree,
    app: Arc<Mutex<TestApp>>,
    services: Arc<Mutex<TestServices>>,
    fs: Arc<CountingFs>,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let tree = shared_tree();
        let app = Arc::new(Mutex::new(TestApp {
            tree: Some(tree.clone()),
            assign_remote: true,
            ..TestApp::default()
        }));
        Self {
            temp,
            root,
            tree,
            app,
            services: Arc::new(Mutex::new(TestServices::default())),
            fs: Arc::new(CountingFs::new()),
        }
    }

    fn root_native(&self) -> Vec<u8> {
        path_to_native(&self.root).unwrap()
    }

    fn native(&self, rel: &str) -> Vec<u8> {
        path_to_native(&self.root.join(rel)).unwrap()
    }

    fn config(&self, with_cache: bool) -> SyncConfig {
        let mut config = SyncConfig::new(1, self.root_native(), RemoteHandle(1000));
        config.key = [5u8; 32];
        if with_cache {
            let cache_dir = self.temp.path().join("cache");
            std::fs::create_dir_all(&cache_dir).unwrap();
            config.cache_dir = Some(cache_dir);
        }
        config
    }

    async fn start(&self, with_cache: bool) -> SyncEngine {
        SyncEngine::start(
            self.config(with_cache),
            self.tree.clone(),
            self.fs.clone(),
            Arc::new(NativeCodec::new()),
            self.app.clone(),
            self.services.clone(),
        )
        .await
        .unwrap()
    }

    fn events(&self) -> Vec<AppEvent> {
        self.app.lock().unwrap().events.clone()
    }

    fn child(&self, parent: NodeId, name: &[u8]) -> Option<NodeId> {
        self.tree.lock().unwrap().child_by_name(parent, name)
    }
}

fn inode_of(path: &Path) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).unwrap().ino()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0
    }
}

/// Ticks until the sync goes idle, advancing the decisecond clock as the
/// engine requests. Returns the clock value after the final tick.
async fn drive(sync: &mut SyncEngine, mut now: u64) -> u64 {
    for _ in 0..500 {
        match sync.tick(now).await.unwrap() {
            TickOutcome::Idle => return now,
            TickOutcome::Working => now += 1,
            TickOutcome::Wait(ds) => now += ds.max(1),
        }
    }
    panic!("sync did not quiesce");
}

#[cfg(unix)]
#[tokio::test]
async fn initial_scan_builds_tree_and_caches() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();
    std::fs::create_dir(fx.root.join("d")).unwrap();
    std::fs::write(fx.root.join("d/b.txt"), b"01234567890123456789").unwrap();

    let mut sync = fx.start(true).await;
    assert_eq!(sync.state(), SyncState::InitialScan);
    drive(&mut sync, 100).await;

    assert_eq!(sync.state(), SyncState::Active);
    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::State(SyncState::Active))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("a.txt"))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FolderAdd(p) if p.ends_with("d"))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("b.txt"))),
        1
    );
    drop(app);

    // tree shape: root { a.txt, d { b.txt } }, every child linked to its parent
    let tree = fx.tree.lock().unwrap();
    let root = sync.root();
    let a = tree.child_by_name(root, b"a.txt").unwrap();
    let d = tree.child_by_name(root, b"d").unwrap();
    let b = tree.child_by_name(d, b"b.txt").unwrap();
    assert_eq!(tree.get(a).kind, NodeKind::File);
    assert_eq!(tree.get(d).kind, NodeKind::Folder);
    assert_eq!(tree.get(a).parent, Some(root));
    assert_eq!(tree.get(b).parent, Some(d));
    assert_eq!(tree.get(a).size, 10);
    assert_eq!(tree.get(b).size, 20);
    assert!(tree.get(a).fingerprint.is_some());
    drop(tree);

    assert_eq!(sync.localbytes(), 30);
    assert_eq!(sync.node_counts(), (2, 1)); // a.txt + b.txt, d
    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn rename_with_same_inode_is_reported_as_move() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();

    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;

    let root = sync.root();
    let a = fx.child(root, b"a.txt").unwrap();
    let fingerprint_before = fx.tree.lock().unwrap().get(a).fingerprint.clone();
    let inode = inode_of(&fx.root.join("a.txt"));

    std::fs::rename(fx.root.join("a.txt"), fx.root.join("A.txt")).unwrap();
    sync.notify_change(&fx.native("A.txt"), now + 10);
    drive(&mut sync, now + 10).await;

    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::Move(p) if p.ends_with("A.txt"))),
        1
    );
    assert_eq!(app.count(|e| matches!(e, AppEvent::FileAdd(_))), 1); // no second addition
    drop(app);

    let tree = fx.tree.lock().unwrap();
    assert_eq!(tree.child_by_name(root, b"a.txt"), None);
    assert_eq!(tree.child_by_name(root, b"A.txt"), Some(a));
    assert_eq!(tree.node_by_inode(inode), Some(a));
    assert_eq!(tree.get(a).fingerprint, fingerprint_before);
    drop(tree);

    assert_eq!(fx.services.lock().unwrap().updateputs, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn overwrite_with_new_inode_is_a_content_change() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();

    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;
    assert_eq!(sync.localbytes(), 10);

    let root = sync.root();
    let a = fx.child(root, b"a.txt").unwrap();
    let old_inode = inode_of(&fx.root.join("a.txt"));

    // replace through a staging file so the path gets a fresh inode
    let staging = fx.temp.path().join("staging.txt");
    std::fs::write(&staging, b"0123456789abcde").unwrap(); // 15 bytes
    std::fs::rename(&staging, fx.root.join("a.txt")).unwrap();
    let new_inode = inode_of(&fx.root.join("a.txt"));
    assert_ne!(old_inode, new_inode);

    sync.notify_change(&fx.native("a.txt"), now + 10);
    drive(&mut sync, now + 10).await;

    let app = fx.app.lock().unwrap();
    assert_eq!(app.count(|e| matches!(e, AppEvent::FileChange(_))), 1);
    assert_eq!(app.count(|e| matches!(e, AppEvent::FileAdd(_))), 1);
    drop(app);

    let tree = fx.tree.lock().unwrap();
    assert_eq!(tree.node_by_inode(old_inode), None);
    assert_eq!(tree.node_by_inode(new_inode), Some(a));
    assert_eq!(tree.get(a).size, 15);
    drop(tree);

    assert_eq!(sync.localbytes(), 15);
}

#[cfg(unix)]
#[tokio::test]
async fn unlinked_file_is_dropped_after_two_generations() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();
    std::fs::create_dir(fx.root.join("d")).unwrap();
    std::fs::write(fx.root.join("d/b.txt"), b"01234567890123456789").unwrap();

    let mut sync = fx.start(true).await;
    let now = drive(&mut sync, 100).await;
    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 4);

    let root = sync.root();
    let d = fx.child(root, b"d").unwrap();
    assert!(fx.child(d, b"b.txt").is_some());

    std::fs::remove_file(fx.root.join("d/b.txt")).unwrap();

    // one full generation: unseen once, still present
    sync.rescan();
    let now = drive(&mut sync, now + 10).await;
    assert!(fx.child(d, b"b.txt").is_some());

    // second generation: collected by deletemissing, row deleted
    sync.rescan();
    drive(&mut sync, now + 10).await;
    assert!(fx.child(d, b"b.txt").is_none());
    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 3);
    assert_eq!(sync.node_counts(), (1, 1));
}

#[cfg(unix)]
#[tokio::test]
async fn move_onto_existing_file_deletes_then_moves() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("f7"), b"seven?!").unwrap(); // 7 bytes
    std::fs::write(fx.root.join("f8"), b"eight is a longer payload").unwrap(); // 25 bytes

    let mut sync = fx.start(true).await;
    let now = drive(&mut sync, 100).await;
    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 3);

    let root = sync.root();
    let f7 = fx.child(root, b"f7").unwrap();
    let f8 = fx.child(root, b"f8").unwrap();
    let inode7 = inode_of(&fx.root.join("f7"));
    let inode8 = inode_of(&fx.root.join("f8"));

    std::fs::rename(fx.root.join("f7"), fx.root.join("f8")).unwrap();
    sync.notify_change(&fx.native("f8"), now + 10);
    drive(&mut sync, now + 10).await;

    // the old occupant is gone, its remote deletion was flushed eagerly,
    // and the mover took the destination slot
    assert_eq!(fx.services.lock().unwrap().execsyncdeletions, 1);
    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::Move(p) if p.ends_with("f8"))),
        1
    );
    drop(app);

    let tree = fx.tree.lock().unwrap();
    assert!(!tree.contains(f8));
    assert_eq!(tree.node_by_inode(inode8), None);
    assert_eq!(tree.node_by_inode(inode7), Some(f7));
    assert_eq!(tree.child_by_name(root, b"f8"), Some(f7));
    assert_eq!(tree.child_by_name(root, b"f7"), None);
    drop(tree);

    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn checkpath_name_models_a_known_entry() {
    let fx = Fixture::new();
    let mut sync = fx.start(false).await;
    drive(&mut sync, 100).await;

    // the outer client materialized a file itself and reports it directly,
    // bypassing the notification queues
    std::fs::write(fx.root.join("pulled.txt"), b"downloaded").unwrap();
    let root = sync.root();
    let id = sync
        .checkpath_name(root, &fx.native("pulled.txt"), b"pulled.txt")
        .unwrap();

    let tree = fx.tree.lock().unwrap();
    assert_eq!(tree.child_by_name(root, b"pulled.txt"), Some(id));
    assert_eq!(tree.get(id).kind, NodeKind::File);
    assert_eq!(tree.get(id).size, 10);
    assert!(tree.get(id).fingerprint.is_some());
    drop(tree);

    assert_eq!(
        fx.app
            .lock()
            .unwrap()
            .count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("pulled.txt"))),
        1
    );
    assert_eq!(sync.localbytes(), 10);
}

#[cfg(unix)]
#[tokio::test]
async fn cross_volume_inode_match_is_not_a_move_over() {
    let fx = Fixture::new();
    let root2 = fx.temp.path().join("root2");
    std::fs::create_dir(&root2).unwrap();
    std::fs::write(fx.root.join("g"), b"gggg").unwrap();
    std::fs::write(root2.join("f"), b"fffffffff").unwrap();

    let mut config1 = fx.config(false);
    config1.fsfp = 111;
    let mut sync1 = SyncEngine::start(
        config1,
        fx.tree.clone(),
        fx.fs.clone(),
        Arc::new(NativeCodec::new()),
        fx.app.clone(),
        fx.services.clone(),
    )
    .await
    .unwrap();
    let now = drive(&mut sync1, 100).await;

    let mut config2 = SyncConfig::new(2, path_to_native(&root2).unwrap(), RemoteHandle(2000));
    config2.key = [5u8; 32];
    config2.fsfp = 222;
    let mut sync2 = SyncEngine::start(
        config2,
        fx.tree.clone(),
        fx.fs.clone(),
        Arc::new(NativeCodec::new()),
        fx.app.clone(),
        fx.services.clone(),
    )
    .await
    .unwrap();
    let now = drive(&mut sync2, now + 10).await;

    let g = fx.child(sync1.root(), b"g").unwrap();
    let f = fx.child(sync2.root(), b"f").unwrap();

    // the two roots share a real volume, but the registered fingerprints
    // differ, so the inode match must not be believed across the syncs
    std::fs::rename(root2.join("f"), fx.root.join("g")).unwrap();
    sync1.notify_change(&fx.native("g"), now + 10);
    drive(&mut sync1, now + 10).await;

    let app = fx.app.lock().unwrap();
    assert_eq!(app.count(|e| matches!(e, AppEvent::Move(_))), 0);
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileChange(p) if p.ends_with("g"))),
        1
    );
    drop(app);
    assert_eq!(fx.services.lock().unwrap().execsyncdeletions, 0);

    // the destination node absorbed the change in place and the foreign
    // sync's node was left untouched
    let tree = fx.tree.lock().unwrap();
    assert_eq!(tree.child_by_name(sync1.root(), b"g"), Some(g));
    assert_eq!(tree.get(g).size, 9);
    assert_eq!(tree.child_by_name(sync2.root(), b"f"), Some(f));
    assert_eq!(tree.get(f).parent, Some(sync2.root()));
}

#[cfg(unix)]
#[tokio::test]
async fn unmodeled_remote_parent_defers_entry() {
    let fx = Fixture::new();
    fx.app.lock().unwrap().assign_remote = false;
    std::fs::create_dir(fx.root.join("d")).unwrap();
    std::fs::write(fx.root.join("d/b.txt"), b"x").unwrap();

    let mut sync = fx.start(false).await;

    // the folder gets modeled, but its child cannot resolve until the
    // outer client materializes the folder's remote node
    let mut now = 100;
    for _ in 0..6 {
        match sync.tick(now).await.unwrap() {
            TickOutcome::Working => now += 1,
            TickOutcome::Wait(ds) => now += ds.max(1),
            TickOutcome::Idle => panic!("must not go idle while an entry is deferred"),
        }
    }
    assert_eq!(sync.pending(), 1);
    let app_events = fx.events();
    assert!(app_events.iter().any(|e| matches!(e, AppEvent::FolderAdd(_))));
    assert!(!app_events.iter().any(|e| matches!(e, AppEvent::FileAdd(_))));

    // remote side caught up: the queued entry resolves on the next tick
    let root = sync.root();
    let d = fx.child(root, b"d").unwrap();
    fx.tree
        .lock()
        .unwrap()
        .set_remote(d, Some(RemoteHandle(77)));
    drive(&mut sync, now + 10).await;

    assert_eq!(sync.pending(), 0);
    assert_eq!(
        fx.app
            .lock()
            .unwrap()
            .count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("b.txt"))),
        1
    );
    assert_eq!(sync.state(), SyncState::Active);
}

#[cfg(unix)]
#[tokio::test]
async fn recent_entries_are_debounced() {
    let fx = Fixture::new();
    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;

    std::fs::write(fx.root.join("late.txt"), b"x").unwrap();
    sync.notify_change(&fx.native("late.txt"), now + 5);

    // too fresh: the entry stays queued and the engine asks for a delay
    let outcome = sync.tick(now + 5).await.unwrap();
    assert_eq!(outcome, TickOutcome::Wait(3));
    assert_eq!(sync.pending(), 1);
    assert!(
        !fx.events()
            .iter()
            .any(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("late.txt")))
    );

    drive(&mut sync, now + 8).await;
    assert_eq!(
        fx.app
            .lock()
            .unwrap()
            .count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("late.txt"))),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn canceled_sync_ignores_everything() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();

    let mut sync = fx.start(true).await;
    let now = drive(&mut sync, 100).await;
    let rows_before = sync.cache().unwrap().row_count().await.unwrap();
    let root = sync.root();
    let a = fx.child(root, b"a.txt").unwrap();
    let events_before = fx.events().len();

    sync.cancel();
    assert_eq!(sync.state(), SyncState::Canceled);

    // cache scheduling is inert
    sync.statecachedel(a);
    sync.statecacheadd(a);
    sync.cachenodes().await.unwrap();
    assert_eq!(
        sync.cache().unwrap().row_count().await.unwrap(),
        rows_before
    );

    // notifications are inert too
    std::fs::write(fx.root.join("b.txt"), b"y").unwrap();
    sync.notify_change(&fx.native("b.txt"), now + 10);
    assert_eq!(sync.tick(now + 20).await.unwrap(), TickOutcome::Idle);
    // only the cancel transition itself was reported
    assert_eq!(fx.events().len(), events_before + 1);

    sync.destroy().await.unwrap();
    assert_eq!(
        fx.services.lock().unwrap().canceled_under,
        vec![RemoteHandle(1000)]
    );
    assert!(fx.tree.lock().unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn cache_reattach_restores_tree_without_refingerprinting() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();
    std::fs::create_dir(fx.root.join("d")).unwrap();
    std::fs::write(fx.root.join("d/b.txt"), b"01234567890123456789").unwrap();

    let mut sync = fx.start(true).await;
    drive(&mut sync, 100).await;
    let fingerprint_a = {
        let tree = fx.tree.lock().unwrap();
        let a = tree.child_by_name(sync.root(), b"a.txt").unwrap();
        tree.get(a).fingerprint.clone()
    };
    sync.cancel();
    sync.destroy().await.unwrap();
    assert!(fx.tree.lock().unwrap().is_empty());

    let calls_before = fx.fs.fingerprint_calls();
    let mut sync = fx.start(true).await;

    // the tree is back before any scanning happened
    {
        let tree = fx.tree.lock().unwrap();
        let root = sync.root();
        let a = tree.child_by_name(root, b"a.txt").unwrap();
        let d = tree.child_by_name(root, b"d").unwrap();
        let b = tree.child_by_name(d, b"b.txt").unwrap();
        assert_eq!(tree.get(a).size, 10);
        assert_eq!(tree.get(b).size, 20);
        assert_eq!(tree.get(a).fingerprint, fingerprint_a);
    }
    assert_eq!(sync.reload_dropped(), 0);
    assert_eq!(sync.node_counts(), (2, 1));

    // reconciliation pass reuses cached metadata instead of re-reading
    drive(&mut sync, 200).await;
    assert_eq!(sync.state(), SyncState::Active);
    assert_eq!(fx.fs.fingerprint_calls(), calls_before);
    assert_eq!(sync.cache().unwrap().row_count().await.unwrap(), 4);
    assert_eq!(sync.localbytes(), 30);
}

#[tokio::test]
async fn root_being_a_file_fails_the_sync() {
    let fx = Fixture::new();
    let file_root = fx.temp.path().join("actually-a-file");
    std::fs::write(&file_root, b"not a directory").unwrap();

    let mut config = SyncConfig::new(9, path_to_native(&file_root).unwrap(), RemoteHandle(2));
    config.key = [5u8; 32];
    let sync = SyncEngine::start(
        config,
        fx.tree.clone(),
        fx.fs.clone(),
        Arc::new(NativeCodec::new()),
        fx.app.clone(),
        fx.services.clone(),
    )
    .await
    .unwrap();

    assert_eq!(sync.state(), SyncState::Failed);
    assert_eq!(sync.fault(), Some(SyncFault::RootIsFile));
    assert_eq!(
        fx.app
            .lock()
            .unwrap()
            .count(|e| matches!(e, AppEvent::State(SyncState::Failed))),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn debris_relocation_uses_dated_folders() {
    let fx = Fixture::new();
    let mut sync = fx.start(false).await;
    drive(&mut sync, 100).await;

    std::fs::write(fx.root.join("junk.txt"), b"old").unwrap();
    assert!(sync.move_to_local_debris(&fx.native("junk.txt")));
    assert!(!fx.root.join("junk.txt").exists());

    // a second casualty with the same name dodges the collision via the
    // time-stamped candidate names
    std::fs::write(fx.root.join("junk.txt"), b"older").unwrap();
    assert!(sync.move_to_local_debris(&fx.native("junk.txt")));
    assert!(!fx.root.join("junk.txt").exists());

    let mut relocated = 0;
    for dated in std::fs::read_dir(fx.root.join(".debris")).unwrap() {
        let dated = dated.unwrap();
        assert!(dated.file_type().unwrap().is_dir());
        for entry in std::fs::read_dir(dated.path()).unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.file_name().to_string_lossy(), "junk.txt");
            relocated += 1;
        }
    }
    assert_eq!(relocated, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn debris_folder_is_skipped_by_scans() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.root.join(".debris/2024-01-01")).unwrap();
    std::fs::write(fx.root.join(".debris/2024-01-01/old.txt"), b"x").unwrap();
    std::fs::write(fx.root.join("kept.txt"), b"y").unwrap();

    let mut sync = fx.start(false).await;
    drive(&mut sync, 100).await;

    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("kept.txt"))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.contains("old.txt"))),
        0
    );
    assert_eq!(app.count(|e| matches!(e, AppEvent::FolderAdd(_))), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn type_change_recreates_node() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("thing"), b"file body").unwrap();

    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;
    let root = sync.root();
    let old = fx.child(root, b"thing").unwrap();

    std::fs::remove_file(fx.root.join("thing")).unwrap();
    std::fs::create_dir(fx.root.join("thing")).unwrap();
    std::fs::write(fx.root.join("thing/inner.txt"), b"z").unwrap();

    sync.notify_change(&fx.native("thing"), now + 10);
    drive(&mut sync, now + 10).await;

    let tree = fx.tree.lock().unwrap();
    assert!(!tree.contains(old));
    let fresh = tree.child_by_name(root, b"thing").unwrap();
    assert_eq!(tree.get(fresh).kind, NodeKind::Folder);
    assert!(tree.child_by_name(fresh, b"inner.txt").is_some());
    drop(tree);

    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FolderAdd(p) if p.ends_with("thing"))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("inner.txt"))),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn deep_path_queues_unmodeled_parent() {
    let fx = Fixture::new();
    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;

    std::fs::create_dir(fx.root.join("x")).unwrap();
    std::fs::write(fx.root.join("x/y.txt"), b"deep").unwrap();

    // only the deep path is reported; the engine must first model "x"
    sync.notify_change(&fx.native("x/y.txt"), now + 10);
    drive(&mut sync, now + 10).await;

    let tree = fx.tree.lock().unwrap();
    let root = sync.root();
    let x = tree.child_by_name(root, b"x").unwrap();
    assert!(tree.child_by_name(x, b"y.txt").is_some());
    drop(tree);

    let app = fx.app.lock().unwrap();
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FolderAdd(p) if p.ends_with("x"))),
        1
    );
    assert_eq!(
        app.count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("y.txt"))),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn hard_open_failure_tombstones_after_recheck() {
    let fx = Fixture::new();
    std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();

    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;
    let root = sync.root();
    let a = fx.child(root, b"a.txt").unwrap();

    std::fs::remove_file(fx.root.join("a.txt")).unwrap();
    sync.notify_change(&fx.native("a.txt"), now + 10);
    drive(&mut sync, now + 10).await;

    // unseen once, rechecked via the retry queue, then tombstoned
    let tree = fx.tree.lock().unwrap();
    assert!(tree.contains(a));
    assert!(tree.get(a).deleted);
    assert_eq!(tree.get(a).not_seen, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn syncadding_yields_between_entries() {
    let fx = Fixture::new();
    std::fs::create_dir(fx.root.join("d1")).unwrap();
    std::fs::create_dir(fx.root.join("d2")).unwrap();
    fx.services.lock().unwrap().adding = true;

    let mut sync = fx.start(false).await;
    assert_eq!(sync.tick(100).await.unwrap(), TickOutcome::Working);
    // only one entry was consumed before yielding back
    assert_eq!(
        fx.app.lock().unwrap().count(|e| matches!(e, AppEvent::FolderAdd(_))),
        1
    );

    fx.services.lock().unwrap().adding = false;
    drive(&mut sync, 101).await;
    assert_eq!(
        fx.app.lock().unwrap().count(|e| matches!(e, AppEvent::FolderAdd(_))),
        2
    );
}

#[cfg(unix)]
#[tokio::test]
async fn pause_blocks_processing_until_resume() {
    let fx = Fixture::new();
    let mut sync = fx.start(false).await;
    let now = drive(&mut sync, 100).await;

    sync.pause();
    assert_eq!(sync.state(), SyncState::Paused);

    std::fs::write(fx.root.join("while-paused.txt"), b"z").unwrap();
    sync.notify_change(&fx.native("while-paused.txt"), now + 10);
    assert_eq!(sync.tick(now + 20).await.unwrap(), TickOutcome::Idle);
    assert!(
        !fx.events()
            .iter()
            .any(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("while-paused.txt")))
    );

    sync.resume();
    assert_eq!(sync.state(), SyncState::Active);
    drive(&mut sync, now + 20).await;
    assert_eq!(
        fx.app
            .lock()
            .unwrap()
            .count(|e| matches!(e, AppEvent::FileAdd(p) if p.ends_with("while-paused.txt"))),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn syncable_gate_excludes_names() {
    let fx = Fixture::new();
    fx.app.lock().unwrap().reject_names = vec!["ignored.tmp".to_string()];
    std::fs::write(fx.root.join("ignored.tmp"), b"scratch").unwrap();
    std::fs::write(fx.root.join("kept.txt"), b"real").unwrap();

    let mut sync = fx.start(false).await;
    drive(&mut sync, 100).await;

    let tree = fx.tree.lock().unwrap();
    let root = sync.root();
    assert!(tree.child_by_name(root, b"ignored.tmp").is_none());
    assert!(tree.child_by_name(root, b"kept.txt").is_some());
}
