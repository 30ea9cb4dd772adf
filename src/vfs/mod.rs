//! Boundary to the host kernel's virtual filesystem layer.
//!
//! The adapter keeps a bijection between live on-disk entries and inode
//! numbers (an entry's inode is its volume-relative first sector), owns one
//! cached entry object per inode the host still references, and translates
//! the host's callbacks into volume-engine operations.
//!
//! Every cached entry sits behind a reader/writer lock: callbacks take the
//! read side for pure observation and the write side for mutation, parent
//! directory before child, and `rename` orders its two directory locks by
//! inode. Guards release on every exit path. After a successful mutating
//! callback both the entry record and the bitmap are flushed; no journaling
//! is promised beyond that.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use checked_num::CheckedU64;

use crate::{
    SECTOR_SIZE,
    dir::{DEFAULT_DIR_SLOTS, Directory, EntryPointer, entry::DirEntry},
    disk::{ReadOffset, WriteOffset},
    error::FsError,
    fs::{FsElement, MountOptions, Volume},
};

/// Short name the module registers under.
pub const FS_SHORT_NAME: &str = "redseafs";
/// Pretty name the module registers under.
pub const FS_PRETTY_NAME: &str = "RedSea File System";
/// Volume name reported by `read_fs_info`.
pub const VOLUME_NAME: &str = "RedSea Volume";
/// Filesystem name reported by `read_fs_info`.
pub const FS_NAME: &str = "RedSeaFS";

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
const DEFAULT_FILE_MODE: u32 = 0o666;

bitflags! {
    /// Capabilities the module advertises to the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        const SUPPORTS_WRITING = 1 << 0;
    }
}

bitflags! {
    /// Volume status bits reported by [`RedSeaFs::read_fs_info`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsInfoFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

bitflags! {
    /// Field mask for [`RedSeaFs::write_stat`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteStatMask: u32 {
        const SIZE = 1 << 0;
    }
}

/// Registration metadata for the host's module table.
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub short_name: &'static str,
    pub pretty_name: &'static str,
    pub flags: ModuleFlags,
}

pub fn module_info() -> ModuleInfo {
    ModuleInfo {
        short_name: FS_SHORT_NAME,
        pretty_name: FS_PRETTY_NAME,
        flags: ModuleFlags::SUPPORTS_WRITING,
    }
}

/// Volume statistics for the host's `statfs` equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u32,
    pub io_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub flags: FsInfoFlags,
    pub volume_name: &'static str,
    pub fs_name: &'static str,
}

/// Subset of a POSIX `stat` the driver can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Access mode remembered by an open cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn can_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    fn can_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// One directory entry as returned by [`RedSeaFs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub name: String,
}

/// Open-file state handed back from [`RedSeaFs::create`] and
/// [`RedSeaFs::open`]. Holding the cookie keeps the entry object alive even
/// if its inode is dropped concurrently.
pub struct FileCookie<D> {
    node: Arc<Vnode<D>>,
    mode: AccessMode,
}

/// Directory iteration state: a monotonic live-entry index.
pub struct DirCookie<D> {
    node: Arc<Vnode<D>>,
    index: u64,
}

/// A cached entry object, shared between the inode table and open cookies.
pub(crate) struct Vnode<D> {
    element: RwLock<FsElement<D>>,
}

impl<D> Vnode<D> {
    fn read(&self) -> RwLockReadGuard<'_, FsElement<D>> {
        self.element.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FsElement<D>> {
        self.element.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct VnodeSlot<D> {
    node: Arc<Vnode<D>>,
    /// Host-held references. The slot is evicted when the count drops to
    /// zero.
    refs: u64,
}

/// A mounted RedSea filesystem as the host kernel sees it.
pub struct RedSeaFs<D> {
    volume: Arc<Volume<D>>,
    root_ino: u64,
    nodes: Mutex<HashMap<u64, VnodeSlot<D>>>,
    options: MountOptions,
}

impl<D: ReadOffset + WriteOffset> RedSeaFs<D> {
    /// Mounts a volume from an opened device and publishes the root
    /// directory. Fails with [`FsError::InvalidVolume`] when the boot record
    /// does not validate.
    pub fn mount(device: D, options: MountOptions) -> Result<Self, FsError> {
        let volume = Volume::open(device, &options)?;

        let root = volume.open_entry(volume.root_pointer())?;
        let root_ino = root.ino();

        let fs = Self {
            volume,
            root_ino,
            nodes: Mutex::new(HashMap::new()),
            options,
        };
        fs.nodes_guard().insert(
            root_ino,
            VnodeSlot {
                node: Arc::new(Vnode {
                    element: RwLock::new(root),
                }),
                refs: 1,
            },
        );

        log::debug!("mounted, root inode {root_ino}");
        Ok(fs)
    }

    /// Releases the volume. The host is responsible for flushing and
    /// dropping outstanding vnodes first.
    pub fn unmount(self) -> Result<(), FsError> {
        if self.options.flush_on_unmount() && !self.volume.is_read_only() {
            self.volume.flush_bitmap()?;
        }

        let nodes = self.nodes_guard();
        if nodes.len() > 1 {
            log::warn!("unmounting with {} vnode(s) still referenced", nodes.len() - 1);
        }
        Ok(())
    }

    /// Inode of the root directory.
    pub fn root_ino(&self) -> u64 {
        self.root_ino
    }

    pub fn volume(&self) -> &Arc<Volume<D>> {
        &self.volume
    }

    pub fn read_fs_info(&self) -> FsInfo {
        let total_blocks = self.volume.boot().total_sectors();
        let mut flags = FsInfoFlags::empty();
        if self.volume.is_read_only() {
            flags |= FsInfoFlags::READ_ONLY;
        }

        FsInfo {
            block_size: SECTOR_SIZE as u32,
            io_size: SECTOR_SIZE as u32,
            total_blocks,
            free_blocks: total_blocks.saturating_sub(self.volume.used_sectors()),
            flags,
            volume_name: VOLUME_NAME,
            fs_name: FS_NAME,
        }
    }

    /// Resolves `name` among the live children of `dir_ino` (`.` resolves to
    /// the directory itself) and returns the child's inode with a reference
    /// held for the caller.
    pub fn lookup(&self, dir_ino: u64, name: &str) -> Result<u64, FsError> {
        let dir_node = self.peek(dir_ino)?;
        let guard = dir_node.read();
        let dir = guard.as_dir()?;

        if name == "." {
            drop(guard);
            self.get(dir_ino)?;
            return Ok(dir_ino);
        }

        let pointer = dir.find(name)?.ok_or(FsError::NotFound)?;
        drop(guard);

        let (ino, _node) = self.acquire(pointer)?;
        Ok(ino)
    }

    /// Releases one caller-held reference on `ino`.
    pub fn put(&self, ino: u64) {
        let mut nodes = self.nodes_guard();
        if let Some(slot) = nodes.get_mut(&ino) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 && ino != self.root_ino {
                nodes.remove(&ino);
            }
        }
    }

    pub fn get_vnode_name(&self, ino: u64) -> Result<String, FsError> {
        let node = self.peek(ino)?;
        let guard = node.read();
        Ok(guard.entry().name())
    }

    pub fn read_stat(&self, ino: u64) -> Result<Stat, FsError> {
        let node = self.peek(ino)?;
        let guard = node.read();
        let entry = guard.entry();

        Ok(Stat {
            mode: DEFAULT_FILE_MODE | if entry.is_dir() { S_IFDIR } else { S_IFREG },
            size: entry.size(),
            blksize: SECTOR_SIZE as u32,
            blocks: entry.sectors(),
            nlink: 0,
            uid: 0,
            gid: 0,
        })
    }

    /// Applies the masked `stat` fields. Only the size is writable; resizing
    /// flushes the entry and the bitmap.
    pub fn write_stat(&self, ino: u64, stat: &Stat, mask: WriteStatMask) -> Result<(), FsError> {
        if !mask.contains(WriteStatMask::SIZE) {
            return Ok(());
        }

        let node = self.peek(ino)?;
        let mut guard = node.write();

        let old_ino = guard.ino();
        guard.resize(stat.size)?;
        guard.entry().flush()?;
        self.volume.flush_bitmap()?;

        let new_ino = guard.ino();
        drop(guard);
        self.rekey(old_ino, new_ino);
        Ok(())
    }

    /// Creates an empty file in `dir_ino` and opens it. The returned inode
    /// carries a reference for the caller.
    pub fn create(
        &self,
        dir_ino: u64,
        name: &str,
        mode: AccessMode,
    ) -> Result<(u64, FileCookie<D>), FsError> {
        let dir_node = self.peek(dir_ino)?;
        let mut guard = dir_node.write();
        let pointer = guard.as_dir_mut()?.create_file(name, 0)?;
        drop(guard);

        self.volume.flush_bitmap()?;

        let (ino, node) = self.acquire(pointer)?;
        log::debug!("created '{name}' as inode {ino}");
        Ok((ino, FileCookie { node, mode }))
    }

    /// Opens an inode. `truncate` resizes a file to zero before the cookie
    /// is handed out.
    pub fn open(&self, ino: u64, mode: AccessMode, truncate: bool) -> Result<FileCookie<D>, FsError> {
        let node = self.get(ino)?;

        if truncate {
            let mut guard = node.write();
            if guard.is_dir() {
                drop(guard);
                self.put(ino);
                return Err(FsError::IsADirectory);
            }
            guard.entry_mut().resize(0)?;
            guard.entry().flush()?;
            self.volume.flush_bitmap()?;
        }

        Ok(FileCookie { node, mode })
    }

    /// Releases the cookie's reference.
    pub fn close(&self, cookie: FileCookie<D>) {
        let ino = cookie.node.read().ino();
        drop(cookie);
        self.put(ino);
    }

    pub fn read(&self, cookie: &FileCookie<D>, pos: u64, buffer: &mut [u8]) -> Result<usize, FsError> {
        if !cookie.mode.can_read() {
            return Err(FsError::NotPermitted);
        }

        let guard = cookie.node.read();
        guard.entry().read_content(pos, buffer)
    }

    /// Writes at `pos`, growing the file first when the write reaches past
    /// its end. Growth may relocate the extent; the inode table is re-keyed
    /// to the new first sector in that case.
    pub fn write(&self, cookie: &FileCookie<D>, pos: u64, buffer: &[u8]) -> Result<usize, FsError> {
        if !cookie.mode.can_write() {
            return Err(FsError::NotPermitted);
        }

        let mut guard = cookie.node.write();
        let end = (CheckedU64::new(pos) + buffer.len() as u64).ok_or(FsError::OffsetPastEnd)?;

        if end > guard.entry().size() {
            let old_ino = guard.ino();
            guard.resize(end)?;
            guard.entry().flush()?;
            self.volume.flush_bitmap()?;
            self.rekey(old_ino, guard.ino());
        }

        guard.entry().write_content(pos, buffer)
    }

    /// Removes the file named `name` from `dir_ino`, releases its sectors
    /// and drops its inode.
    pub fn unlink(&self, dir_ino: u64, name: &str) -> Result<(), FsError> {
        self.remove_named(dir_ino, name, false)
    }

    /// Creates a subdirectory with [`DEFAULT_DIR_SLOTS`] slots and publishes
    /// it. The returned inode carries a reference for the caller.
    pub fn create_dir(&self, dir_ino: u64, name: &str) -> Result<u64, FsError> {
        let dir_node = self.peek(dir_ino)?;
        let mut guard = dir_node.write();
        let pointer = guard.as_dir_mut()?.create_directory(name, DEFAULT_DIR_SLOTS)?;
        drop(guard);

        self.volume.flush_bitmap()?;

        let (ino, _node) = self.acquire(pointer)?;
        log::debug!("created directory '{name}' as inode {ino}");
        Ok(ino)
    }

    /// Removes the empty directory named `name` from `dir_ino`.
    pub fn remove_dir(&self, dir_ino: u64, name: &str) -> Result<(), FsError> {
        self.remove_named(dir_ino, name, true)
    }

    /// Moves `from_name` out of `from_ino` into `to_ino` under the name
    /// `to_name`. On failure the source directory is left untouched. Both
    /// directory locks are taken lowest inode first.
    pub fn rename(
        &self,
        from_ino: u64,
        from_name: &str,
        to_ino: u64,
        to_name: &str,
    ) -> Result<(), FsError> {
        let from_node = self.peek(from_ino)?;

        if from_ino == to_ino {
            let mut guard = from_node.write();
            let dir = guard.as_dir_mut()?;
            return self.rename_within(dir, from_name, to_name, from_ino);
        }

        let to_node = self.peek(to_ino)?;

        let (low_node, high_node) = if from_ino < to_ino {
            (&from_node, &to_node)
        } else {
            (&to_node, &from_node)
        };
        let mut low_guard = low_node.write();
        let mut high_guard = high_node.write();
        let (from_guard, to_guard) = if from_ino < to_ino {
            (&mut low_guard, &mut high_guard)
        } else {
            (&mut high_guard, &mut low_guard)
        };
        let from_dir = from_guard.as_dir_mut()?;
        let to_dir = to_guard.as_dir_mut()?;

        let pointer = from_dir.find(from_name)?.ok_or(FsError::NotFound)?;
        let (child_ino, child_node) = self.acquire(pointer)?;
        if child_ino == from_ino || child_ino == to_ino {
            self.put(child_ino);
            return Err(FsError::NotPermitted);
        }

        let outcome: Result<(), FsError> = (|| {
            let mut child = child_node.write();
            let mut record = *child.entry().record();
            record.set_name(to_name);

            // target first, so a full target leaves the source untouched
            let new_pointer = to_dir.add_entry(&record)?;
            from_dir.remove_entry(child.entry_mut())?;

            child
                .entry_mut()
                .assign(record, new_pointer.location(), Some(to_ino));
            Ok(())
        })();

        self.put(child_ino);
        outcome
    }

    /// Opens a directory cursor positioned at the first live entry.
    pub fn open_dir(&self, ino: u64) -> Result<DirCookie<D>, FsError> {
        let node = self.get(ino)?;
        if !node.read().is_dir() {
            self.put(ino);
            return Err(FsError::NotADirectory);
        }

        Ok(DirCookie { node, index: 0 })
    }

    /// Yields the next live entry, or `None` when the cursor is exhausted.
    /// `buffer_size` models the host's dirent buffer: a name that does not
    /// fit (with its NUL) fails with [`FsError::BufferOverflow`] and leaves
    /// the cursor in place.
    pub fn read_dir(
        &self,
        cookie: &mut DirCookie<D>,
        buffer_size: usize,
    ) -> Result<Option<Dirent>, FsError> {
        let guard = cookie.node.read();
        let dir = guard.as_dir()?;

        if cookie.index >= dir.count_entries() {
            return Ok(None);
        }

        let pointer = dir.get_entry(cookie.index).ok_or(FsError::NotFound)?;
        let entry = DirEntry::load(self.volume.clone(), pointer.location(), pointer.parent())?;
        let name = entry.name();

        if name.len() + 1 > buffer_size {
            return Err(FsError::BufferOverflow);
        }

        cookie.index += 1;
        Ok(Some(Dirent {
            ino: entry.ino(),
            name,
        }))
    }

    pub fn rewind_dir(&self, cookie: &mut DirCookie<D>) {
        cookie.index = 0;
    }

    /// Releases the cursor's reference.
    pub fn close_dir(&self, cookie: DirCookie<D>) {
        let ino = cookie.node.read().ino();
        drop(cookie);
        self.put(ino);
    }

    /// Permission probe. The format stores no ownership, so any access to a
    /// known inode is allowed.
    pub fn access(&self, ino: u64, _mode: u32) -> Result<(), FsError> {
        self.peek(ino).map(|_| ())
    }

    fn nodes_guard(&self) -> MutexGuard<'_, HashMap<u64, VnodeSlot<D>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Node for an inode the host already holds, without touching the
    /// reference count.
    fn peek(&self, ino: u64) -> Result<Arc<Vnode<D>>, FsError> {
        self.nodes_guard()
            .get(&ino)
            .map(|slot| slot.node.clone())
            .ok_or(FsError::NotFound)
    }

    /// Acquires a reference on `ino`, rebuilding an evicted directory from
    /// its self-record. Evicted files cannot be rebuilt from the inode
    /// alone.
    fn get(&self, ino: u64) -> Result<Arc<Vnode<D>>, FsError> {
        {
            let mut nodes = self.nodes_guard();
            if let Some(slot) = nodes.get_mut(&ino) {
                slot.refs += 1;
                return Ok(slot.node.clone());
            }
        }

        let pointer = EntryPointer::new(ino * SECTOR_SIZE, None);
        let element = self.volume.open_entry(pointer)?;
        let attributes = element.entry().attributes();
        if !element.is_dir()
            || element.ino() != ino
            || attributes.contains(crate::dir::entry::EntryAttributes::DELETED)
        {
            return Err(FsError::NotFound);
        }

        Ok(self.install(ino, element))
    }

    /// Publishes the entry behind `pointer`, or bumps the reference of the
    /// already-cached node for the same inode.
    fn acquire(&self, pointer: EntryPointer) -> Result<(u64, Arc<Vnode<D>>), FsError> {
        let element = self.volume.open_entry(pointer)?;
        let ino = element.ino();
        Ok((ino, self.install(ino, element)))
    }

    fn install(&self, ino: u64, element: FsElement<D>) -> Arc<Vnode<D>> {
        let mut nodes = self.nodes_guard();
        match nodes.entry(ino) {
            MapEntry::Occupied(mut occupied) => {
                occupied.get_mut().refs += 1;
                occupied.get().node.clone()
            }
            MapEntry::Vacant(vacant) => {
                let node = Arc::new(Vnode {
                    element: RwLock::new(element),
                });
                vacant.insert(VnodeSlot {
                    node: node.clone(),
                    refs: 1,
                });
                node
            }
        }
    }

    /// Drops the inode regardless of outstanding references; open cookies
    /// keep their entry object alive through their own handle.
    fn remove(&self, ino: u64) {
        self.nodes_guard().remove(&ino);
    }

    /// Moves a table slot after a relocating resize changed the entry's
    /// first sector, and with it its inode.
    fn rekey(&self, old_ino: u64, new_ino: u64) {
        if old_ino == new_ino {
            return;
        }

        let mut nodes = self.nodes_guard();
        if let Some(slot) = nodes.remove(&old_ino) {
            nodes.insert(new_ino, slot);
        }
        log::debug!("inode {old_ino} relocated to {new_ino}");
    }

    fn remove_named(&self, dir_ino: u64, name: &str, want_dir: bool) -> Result<(), FsError> {
        let dir_node = self.peek(dir_ino)?;
        let mut guard = dir_node.write();
        let dir = guard.as_dir_mut()?;

        let pointer = dir.find(name)?.ok_or(FsError::NotFound)?;
        let (child_ino, child_node) = self.acquire(pointer)?;
        if child_ino == dir_ino {
            self.put(child_ino);
            return Err(FsError::NotPermitted);
        }

        let outcome = Self::delete_child(&self.volume, dir, &child_node, want_dir);
        self.put(child_ino);
        outcome?;

        self.remove(child_ino);
        log::debug!("removed '{name}' (inode {child_ino})");
        Ok(())
    }

    fn delete_child(
        volume: &Arc<Volume<D>>,
        dir: &mut Directory<D>,
        child_node: &Arc<Vnode<D>>,
        want_dir: bool,
    ) -> Result<(), FsError> {
        let mut child = child_node.write();

        match (child.is_dir(), want_dir) {
            (true, false) => return Err(FsError::IsADirectory),
            (false, true) => return Err(FsError::NotADirectory),
            _ => {}
        }
        if let FsElement::D(child_dir) = &*child {
            // everything but the ".." back-reference must be gone
            if child_dir.count_entries() > 1 {
                return Err(FsError::DirectoryNotEmpty);
            }
        }

        child.entry_mut().delete()?;
        child.entry().flush()?;
        volume.flush_bitmap()?;

        // the tombstone must show up in the parent's attribute cache
        dir.refresh_cache()
    }

    fn rename_within(
        &self,
        dir: &mut Directory<D>,
        from_name: &str,
        to_name: &str,
        dir_ino: u64,
    ) -> Result<(), FsError> {
        let pointer = dir.find(from_name)?.ok_or(FsError::NotFound)?;
        let (child_ino, child_node) = self.acquire(pointer)?;
        if child_ino == dir_ino {
            self.put(child_ino);
            return Err(FsError::NotPermitted);
        }

        let outcome: Result<(), FsError> = (|| {
            let mut child = child_node.write();
            let mut record = *child.entry().record();
            record.set_name(to_name);

            // the tombstone left behind guarantees the re-add a slot
            dir.remove_entry(child.entry_mut())?;
            let new_pointer = dir.add_entry(&record)?;

            child
                .entry_mut()
                .assign(record, new_pointer.location(), Some(dir_ino));
            Ok(())
        })();

        self.put(child_ino);
        outcome
    }
}
