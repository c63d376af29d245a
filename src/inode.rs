// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

use crate::{dentry::DentrySet, fat::ClusterId};

bitflags! {
    pub struct FatAttr: u16 {
        /// This inode is read only.
        const READONLY  = 0x0001;
        /// This inode is hidden.
        const HIDDEN    = 0x0002;
        /// This inode belongs to the OS.
        const SYSTEM    = 0x0004;
        /// This inode represents a volume label.
        const VOLUME    = 0x0008;
        /// This inode represents a directory.
        const DIRECTORY = 0x0010;
        /// This file has been touched since the last backup.
        const ARCHIVE   = 0x0020;
    }
}

/// Index of a node in the [`InodeArena`].
pub type InodeId = usize;

/// One live file or directory met during traversal. Directory nodes are kept
/// in the arena until their subtree has been checked; file nodes live only
/// for the duration of their own checks.
#[derive(Debug)]
pub struct ExfatInode {
    pub parent: Option<InodeId>,
    pub children: Vec<InodeId>,
    pub first_clus: ClusterId,
    pub size: u64,
    pub attr: FatAttr,
    pub is_contiguous: bool,
    /// UTF-16 name as stored in the name dentries.
    pub name: Vec<u16>,
    /// Copy of the dentry set describing this inode, kept so the allocator
    /// can rewrite it in place. The root has none.
    pub dentry_set: Option<DentrySet>,
    /// Device offset of the dentry set.
    pub dev_offset: Option<u64>,
}

impl ExfatInode {
    pub fn new(attr: FatAttr) -> Self {
        ExfatInode {
            parent: None,
            children: Vec::new(),
            first_clus: 0,
            size: 0,
            attr,
            is_contiguous: false,
            name: Vec::new(),
            dentry_set: None,
            dev_offset: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr.contains(FatAttr::DIRECTORY)
    }
}

/// The directory tree, arena-owned and keyed by stable indices. Parent links
/// are plain indices, so no ownership cycle exists.
#[derive(Debug, Default)]
pub struct InodeArena {
    nodes: Vec<ExfatInode>,
}

impl InodeArena {
    pub fn new() -> Self {
        InodeArena::default()
    }

    /// Insert a node and link it under `parent`.
    pub fn insert(&mut self, mut node: ExfatInode, parent: Option<InodeId>) -> InodeId {
        let id = self.nodes.len();
        node.parent = parent;
        self.nodes.push(node);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    pub fn get(&self, id: InodeId) -> &ExfatInode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: InodeId) -> &mut ExfatInode {
        &mut self.nodes[id]
    }

    /// Drop the buffers a finished node holds.
    fn release(&mut self, id: InodeId) {
        let node = &mut self.nodes[id];
        node.name = Vec::new();
        node.children = Vec::new();
        node.dentry_set = None;
    }

    /// Release `id` and every ancestor whose subtree has completed, walking
    /// towards the root. A node with children still pending stops the walk.
    pub fn release_ancestors(&mut self, mut id: InodeId) {
        loop {
            if !self.nodes[id].children.is_empty() {
                break;
            }
            let parent = self.nodes[id].parent;
            self.release(id);
            let Some(parent_id) = parent else {
                break;
            };
            self.nodes[parent_id].children.retain(|&child| child != id);
            id = parent_id;
        }
    }
}

const PATH_RESOLVE_MAX_DEPTH: usize = 255;

/// UTF-8 path of a node in the tree, for diagnostics.
pub fn resolve_path(arena: &InodeArena, id: InodeId) -> String {
    let mut ancestors = Vec::new();
    let mut cursor = Some(id);
    while let Some(node_id) = cursor {
        if ancestors.len() >= PATH_RESOLVE_MAX_DEPTH {
            break;
        }
        ancestors.push(node_id);
        cursor = arena.get(node_id).parent;
    }

    let mut path = String::new();
    for &node_id in ancestors.iter().rev() {
        let node = arena.get(node_id);
        if node.parent.is_none() {
            continue;
        }
        path.push('/');
        path.push_str(&String::from_utf16_lossy(&node.name));
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Path of a node that is not (or not yet) linked into the arena, shown
/// under its parent directory.
pub fn resolve_path_parent(arena: &InodeArena, parent: InodeId, node: &ExfatInode) -> String {
    let parent_path = resolve_path(arena, parent);
    let name = String::from_utf16_lossy(&node.name);
    if parent_path == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent_path, name)
    }
}
