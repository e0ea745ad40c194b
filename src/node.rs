use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::paths::find_separator;

pub type SyncTag = i32;

/// Stable handle into the shared node arena. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// Handle of the corresponding remote node, owned by the outer client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Folder,
}

/// One synced file or folder in the in-memory shadow tree.
#[derive(Debug)]
pub struct LocalNode {
    pub sync_tag: SyncTag,
    pub kind: NodeKind,
    /// Last path component in native bytes; for a sync root, the full root path.
    pub name: Vec<u8>,
    pub parent: Option<NodeId>,
    pub children: HashMap<Vec<u8>, NodeId>,
    /// Fallback mapping for name collisions (case folds, renamed-pending).
    pub shadow_children: HashMap<Vec<u8>, NodeId>,
    pub remote: Option<RemoteHandle>,
    pub inode: Option<u64>,
    pub size: i64,
    pub mtime: i64,
    /// Content fingerprint; meaningful only for files that are still seen.
    pub fingerprint: Option<Vec<u8>>,
    /// Non-zero once the node is represented in the state cache.
    pub cache_row: u32,
    pub scan_seq: u32,
    pub not_seen: u8,
    /// Tombstone awaiting remote propagation.
    pub deleted: bool,
    /// In-flight transfer, canceled when the node is destroyed.
    pub transfer: Option<CancellationToken>,
    in_shadow: bool,
}

/// Result of a component-wise path walk.
#[derive(Debug)]
pub struct Lookup {
    pub node: Option<NodeId>,
    pub parent: Option<NodeId>,
    pub residual: Vec<u8>,
}

/// A node removed by a cascade, reported so the owning sync can clean up
/// its cache row and accounting.
#[derive(Debug)]
pub struct RemovedNode {
    pub id: NodeId,
    pub sync_tag: SyncTag,
    pub kind: NodeKind,
    pub size: i64,
    pub cache_row: u32,
    pub remote: Option<RemoteHandle>,
    pub had_transfer: bool,
}

#[derive(Debug, Default)]
struct SyncEntry {
    fsfp: u64,
    /// Cache rows of this sync's nodes that another sync's scan destroyed;
    /// drained by the owner on its next flush.
    pending_row_dels: Vec<u32>,
}

/// Arena of local nodes shared by every sync of one owner client, together
/// with the global by-inode and by-remote indices used for move detection.
#[derive(Default)]
pub struct LocalTree {
    nodes: HashMap<NodeId, LocalNode>,
    next_id: u64,
    by_inode: HashMap<u64, NodeId>,
    by_remote: HashMap<RemoteHandle, NodeId>,
    syncs: HashMap<SyncTag, SyncEntry>,
}

pub type SharedTree = Arc<Mutex<LocalTree>>;

pub fn shared_tree() -> SharedTree {
    Arc::new(Mutex::new(LocalTree::default()))
}

impl LocalTree {
    pub fn register_sync(&mut self, tag: SyncTag, fsfp: u64) {
        self.syncs.insert(
            tag,
            SyncEntry {
                fsfp,
                pending_row_dels: Vec::new(),
            },
        );
    }

    pub fn unregister_sync(&mut self, tag: SyncTag) {
        self.syncs.remove(&tag);
    }

    pub fn fsfp_of(&self, tag: SyncTag) -> u64 {
        self.syncs.get(&tag).map(|entry| entry.fsfp).unwrap_or(0)
    }

    pub fn push_pending_row_del(&mut self, tag: SyncTag, row: u32) {
        if let Some(entry) = self.syncs.get_mut(&tag) {
            entry.pending_row_dels.push(row);
        }
    }

    pub fn take_pending_row_dels(&mut self, tag: SyncTag) -> Vec<u32> {
        self.syncs
            .get_mut(&tag)
            .map(|entry| std::mem::take(&mut entry.pending_row_dels))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> &LocalNode {
        &self.nodes[&id]
    }

    pub fn try_get(&self, id: NodeId) -> Option<&LocalNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut LocalNode {
        self.nodes.get_mut(&id).expect("node id out of arena")
    }

    pub fn add_node(
        &mut self,
        tag: SyncTag,
        kind: NodeKind,
        parent: Option<NodeId>,
        name: Vec<u8>,
    ) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(
            id,
            LocalNode {
                sync_tag: tag,
                kind,
                name: name.clone(),
                parent,
                children: HashMap::new(),
                shadow_children: HashMap::new(),
                remote: None,
                inode: None,
                size: 0,
                mtime: 0,
                fingerprint: None,
                cache_row: 0,
                scan_seq: 0,
                not_seen: 0,
                deleted: false,
                transfer: None,
                in_shadow: false,
            },
        );
        if let Some(parent) = parent {
            self.attach_child(parent, name, id);
        }
        id
    }

    fn attach_child(&mut self, parent: NodeId, name: Vec<u8>, id: NodeId) {
        let slot_taken = self
            .nodes
            .get(&parent)
            .map(|p| p.children.contains_key(&name))
            .unwrap_or(false);
        let p = self.nodes.get_mut(&parent).expect("parent id out of arena");
        if slot_taken {
            p.shadow_children.insert(name, id);
            self.get_mut(id).in_shadow = true;
        } else {
            p.children.insert(name, id);
            self.get_mut(id).in_shadow = false;
        }
    }

    fn detach_child(&mut self, id: NodeId) {
        let (parent, name, in_shadow) = {
            let node = self.get(id);
            (node.parent, node.name.clone(), node.in_shadow)
        };
        let Some(parent) = parent else { return };
        let Some(p) = self.nodes.get_mut(&parent) else {
            return;
        };
        let map = if in_shadow {
            &mut p.shadow_children
        } else {
            &mut p.children
        };
        if map.get(&name) == Some(&id) {
            map.remove(&name);
        }
    }

    pub fn child_by_name(&self, parent: NodeId, name: &[u8]) -> Option<NodeId> {
        let p = self.try_get(parent)?;
        p.children
            .get(name)
            .or_else(|| p.shadow_children.get(name))
            .copied()
    }

    /// Walks `path` one component at a time from `start` (or from `root`
    /// after stripping the root's native name). Returns the deepest matched
    /// node, its would-be parent and the unmatched residual. Separators are
    /// honored only at offsets aligned to the separator length.
    pub fn lookup_by_path(
        &self,
        start: Option<NodeId>,
        root: NodeId,
        path: &[u8],
        sep: &[u8],
    ) -> Lookup {
        let (mut cur, mut rest): (NodeId, &[u8]) = match start {
            Some(start) => (start, path),
            None => {
                let rootname = &self.get(root).name;
                if path == &rootname[..] {
                    return Lookup {
                        node: Some(root),
                        parent: None,
                        residual: Vec::new(),
                    };
                }
                let prefix_len = rootname.len() + sep.len();
                if path.len() > prefix_len
                    && path.starts_with(rootname)
                    && &path[rootname.len()..prefix_len] == sep
                {
                    (root, &path[prefix_len..])
                } else {
                    return Lookup {
                        node: None,
                        parent: None,
                        residual: path.to_vec(),
                    };
                }
            }
        };

        if rest.is_empty() {
            let parent = self.get(cur).parent;
            return Lookup {
                node: Some(cur),
                parent,
                residual: Vec::new(),
            };
        }

        loop {
            let (name, remaining) = match find_separator(rest, sep, 0) {
                Some(idx) => (&rest[..idx], &rest[idx + sep.len()..]),
                None => (rest, &[][..]),
            };
            match self.child_by_name(cur, name) {
                Some(next) if remaining.is_empty() => {
                    return Lookup {
                        node: Some(next),
                        parent: Some(cur),
                        residual: Vec::new(),
                    };
                }
                Some(next) => {
                    cur = next;
                    rest = remaining;
                }
                None => {
                    return Lookup {
                        node: None,
                        parent: Some(cur),
                        residual: rest.to_vec(),
                    };
                }
            }
        }
    }

    /// Atomically reparents and renames a node. After this returns the node
    /// is reachable only under its new parent; the inode and remote indices
    /// keep pointing at the same node.
    pub fn set_name_parent(&mut self, id: NodeId, new_parent: NodeId, new_name: Vec<u8>) {
        self.detach_child(id);
        {
            let node = self.get_mut(id);
            node.name = new_name.clone();
            node.parent = Some(new_parent);
        }
        self.attach_child(new_parent, new_name, id);
    }

    pub fn set_inode(&mut self, id: NodeId, inode: u64) {
        let old = self.get(id).inode;
        if old == Some(inode) {
            return;
        }
        if let Some(old) = old
            && self.by_inode.get(&old) == Some(&id)
        {
            self.by_inode.remove(&old);
        }
        self.get_mut(id).inode = Some(inode);
        self.by_inode.insert(inode, id);
    }

    /// Discards a stale by-inode entry (inode reuse on the same volume).
    pub fn drop_inode_entry(&mut self, inode: u64) {
        self.by_inode.remove(&inode);
    }

    pub fn node_by_inode(&self, inode: u64) -> Option<NodeId> {
        self.by_inode.get(&inode).copied()
    }

    pub fn set_remote(&mut self, id: NodeId, remote: Option<RemoteHandle>) {
        let old = self.get(id).remote;
        if let Some(old) = old
            && self.by_remote.get(&old) == Some(&id)
        {
            self.by_remote.remove(&old);
        }
        self.get_mut(id).remote = remote;
        if let Some(remote) = remote {
            self.by_remote.insert(remote, id);
        }
    }

    pub fn node_by_remote(&self, remote: RemoteHandle) -> Option<NodeId> {
        self.by_remote.get(&remote).copied()
    }

    /// Full native path of a node: the root's name is already a full path,
    /// descendants append one separator-joined component each.
    pub fn path_of(&self, id: NodeId, sep: &[u8]) -> Vec<u8> {
        let mut names: Vec<&[u8]> = Vec::new();
        let mut cur = Some(id);
        while let Some(at) = cur {
            let node = self.get(at);
            names.push(&node.name);
            cur = node.parent;
        }
        let mut out = Vec::new();
        for (i, name) in names.iter().rev().enumerate() {
            if i > 0 {
                out.extend_from_slice(sep);
            }
            out.extend_from_slice(name);
        }
        out
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        let node = self.get(id);
        node.children
            .values()
            .chain(node.shadow_children.values())
            .copied()
            .collect()
    }

    /// Removes a node and all descendants, cancels their transfers and
    /// cleans both global indices. Returns the removed nodes in post-order.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<RemovedNode> {
        if !self.contains(id) {
            return Vec::new();
        }
        self.detach_child(id);

        // collect in pre-order, emit in post-order
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(at) = stack.pop() {
            order.push(at);
            stack.extend(self.children_of(at));
        }

        let mut removed = Vec::with_capacity(order.len());
        for at in order.into_iter().rev() {
            let node = self.nodes.remove(&at).expect("subtree node in arena");
            if let Some(transfer) = &node.transfer {
                transfer.cancel();
            }
            if let Some(inode) = node.inode
                && self.by_inode.get(&inode) == Some(&at)
            {
                self.by_inode.remove(&inode);
            }
            if let Some(remote) = node.remote
                && self.by_remote.get(&remote) == Some(&at)
            {
                self.by_remote.remove(&remote);
            }
            removed.push(RemovedNode {
                id: at,
                sync_tag: node.sync_tag,
                kind: node.kind,
                size: node.size,
                cache_row: node.cache_row,
                remote: node.remote,
                had_transfer: node.transfer.is_some(),
            });
        }
        removed
    }
}
