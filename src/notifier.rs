use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::node::NodeId;

/// Monotonic deciseconds, supplied by the outer loop.
pub type Dstime = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyQueue {
    /// Scan results and watcher events.
    DirEvents,
    /// Paths whose open failed transiently, to be re-examined.
    Retry,
}

/// A path pending (re)examination. `hint` is the node the path is relative
/// to; `None` means the path is absolute, prefixed by the sync root's name.
#[derive(Debug, Clone)]
pub struct NotifyEntry {
    pub hint: Option<NodeId>,
    pub path: Vec<u8>,
    pub timestamp: Dstime,
}

/// The two FIFO notification queues of one sync, plus the volume
/// fingerprint of the watched root.
pub struct DirNotify {
    direvents: VecDeque<NotifyEntry>,
    retry: VecDeque<NotifyEntry>,
    fsfp: u64,
}

impl DirNotify {
    pub fn new(fsfp: u64) -> Self {
        Self {
            direvents: VecDeque::new(),
            retry: VecDeque::new(),
            fsfp,
        }
    }

    pub fn fs_fingerprint(&self) -> u64 {
        self.fsfp
    }

    pub fn notify(&mut self, queue: NotifyQueue, hint: Option<NodeId>, path: Vec<u8>, now: Dstime) {
        self.queue_mut(queue).push_back(NotifyEntry {
            hint,
            path,
            timestamp: now,
        });
    }

    pub fn front(&self, queue: NotifyQueue) -> Option<&NotifyEntry> {
        self.queue(queue).front()
    }

    pub fn pop_front(&mut self, queue: NotifyQueue) -> Option<NotifyEntry> {
        self.queue_mut(queue).pop_front()
    }

    pub fn len(&self, queue: NotifyQueue) -> usize {
        self.queue(queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.direvents.is_empty() && self.retry.is_empty()
    }

    fn queue(&self, queue: NotifyQueue) -> &VecDeque<NotifyEntry> {
        match queue {
            NotifyQueue::DirEvents => &self.direvents,
            NotifyQueue::Retry => &self.retry,
        }
    }

    fn queue_mut(&mut self, queue: NotifyQueue) -> &mut VecDeque<NotifyEntry> {
        match queue {
            NotifyQueue::DirEvents => &mut self.direvents,
            NotifyQueue::Retry => &mut self.retry,
        }
    }
}

/// Paths touched by a filesystem event. The engine re-opens every reported
/// path itself, so rename events simply contribute both sides.
pub fn event_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event.paths,
        _ => Vec::new(),
    }
}

/// Starts a recursive watcher on `root`, forwarding affected paths through
/// an unbounded channel. The engine drains the channel into DIREVENTS at
/// each tick; dropping the watcher stops the stream.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for path in event_paths(event) {
                let _ = tx.send(path);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}
