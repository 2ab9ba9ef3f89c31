use std::{
    collections::HashMap,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use fuse_backend_rs::api::filesystem::ROOT_ID;

struct InodeData {
    path: Arc<Path>,
    lookups: u64,
}

/// InodeTracker hands out inodes for paths below the root of the mount, and
/// keeps them as long as the kernel holds a reference.
///
/// Paths are relative to the root of the mount, and start with a `/`.
pub struct InodeTracker {
    data: HashMap<u64, InodeData>,

    // lookup table for inodes by their current path
    path_to_inode: HashMap<Arc<Path>, u64>,

    // the next inode to allocate
    next_inode: u64,
}

impl Default for InodeTracker {
    fn default() -> Self {
        let root: Arc<Path> = Arc::from(Path::new("/"));
        Self {
            data: HashMap::from([(
                ROOT_ID,
                InodeData {
                    path: root.clone(),
                    lookups: 1,
                },
            )]),
            path_to_inode: HashMap::from([(root, ROOT_ID)]),

            next_inode: ROOT_ID + 1,
        }
    }
}

impl InodeTracker {
    // Retrieves the path for a given inode, if it exists.
    pub fn get(&self, ino: u64) -> Option<Arc<Path>> {
        self.data.get(&ino).map(|d| d.path.clone())
    }

    // Returns the inode for a path, allocating one if needed, and counts a
    // lookup for it.
    pub fn put(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.path_to_inode.get(path) {
            if let Some(data) = self.data.get_mut(ino) {
                data.lookups += 1;
            }
            return *ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;

        let path: Arc<Path> = Arc::from(path);
        self.path_to_inode.insert(path.clone(), ino);
        self.data.insert(ino, InodeData { path, lookups: 1 });
        ino
    }

    // Drops `count` lookups of an inode, forgetting about it once there's none
    // left. The root is never forgotten.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_ID {
            return;
        }

        let Some(data) = self.data.get_mut(&ino) else {
            return;
        };
        data.lookups = data.lookups.saturating_sub(count);
        if data.lookups > 0 {
            return;
        }

        if let Some(data) = self.data.remove(&ino) {
            // only drop the path mapping if it still points to us.
            if self.path_to_inode.get(&data.path) == Some(&ino) {
                self.path_to_inode.remove(&data.path);
            }
        }
    }

    // Removes the path from the lookup table, after it was unlinked. Inodes
    // still referenced keep their (now stale) path until forgotten.
    pub fn remove_path(&mut self, path: &Path) {
        self.path_to_inode.remove(path);
    }

    // Moves `from`, and everything below it, to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        // whatever was at the destination has been replaced.
        self.remove_path(to);

        let moved: Vec<(Arc<Path>, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old_path, ino) in moved {
            self.path_to_inode.remove(&old_path);

            let suffix = old_path
                .strip_prefix(from)
                .expect("filtered on starts_with");
            let new_path: Arc<Path> = if suffix.as_os_str().is_empty() {
                Arc::from(to)
            } else {
                Arc::from(to.join(suffix))
            };

            if let Some(data) = self.data.get_mut(&ino) {
                data.path = new_path.clone();
            }
            self.path_to_inode.insert(new_path, ino);
        }
    }
}

/// Joins a mount path and a directory entry name.
pub fn child_path(parent: &Path, name: &[u8]) -> PathBuf {
    parent.join(OsStr::from_bytes(name))
}
