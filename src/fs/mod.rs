use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_builder::Builder;
use file::File;

use crate::{
    SECTOR_SIZE,
    bitmap::SectorBitmap,
    boot::BootRecord,
    dir::{Directory, EntryPointer, entry::DirEntry},
    disk::{ReadOffset, WriteOffset},
    error::FsError,
};

pub mod file;

/// Mount-time options. Built with [`MountOptionsBuilder`].
#[derive(Builder, Copy, Clone, Debug)]
pub struct MountOptions {
    /// Reject every mutation of the volume. Defaults to `false`.
    #[builder(default)]
    read_only: bool,
    /// Write the allocation bitmap back on unmount. Defaults to `true`.
    #[builder(default = true)]
    flush_on_unmount: bool,
}

impl MountOptions {
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn flush_on_unmount(&self) -> bool {
        self.flush_on_unmount
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            flush_on_unmount: true,
        }
    }
}

/// A live directory entry, discriminated by its attribute bits.
pub enum FsElement<D> {
    F(File<D>),
    D(Directory<D>),
}

impl<D: ReadOffset + WriteOffset> FsElement<D> {
    pub fn entry(&self) -> &DirEntry<D> {
        match self {
            FsElement::F(file) => file.entry(),
            FsElement::D(dir) => dir.entry(),
        }
    }

    pub fn entry_mut(&mut self) -> &mut DirEntry<D> {
        match self {
            FsElement::F(file) => file.entry_mut(),
            FsElement::D(dir) => dir.entry_mut(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FsElement::D(_))
    }

    pub fn ino(&self) -> u64 {
        self.entry().ino()
    }

    pub fn as_dir(&self) -> Result<&Directory<D>, FsError> {
        match self {
            FsElement::D(dir) => Ok(dir),
            FsElement::F(_) => Err(FsError::NotADirectory),
        }
    }

    pub fn as_dir_mut(&mut self) -> Result<&mut Directory<D>, FsError> {
        match self {
            FsElement::D(dir) => Ok(dir),
            FsElement::F(_) => Err(FsError::NotADirectory),
        }
    }

    pub fn into_dir(self) -> Result<Directory<D>, FsError> {
        match self {
            FsElement::D(dir) => Ok(dir),
            FsElement::F(_) => Err(FsError::NotADirectory),
        }
    }

    /// Resizes the underlying entry. Directories additionally zero any new
    /// slot space and keep their self-record in sync.
    pub(crate) fn resize(&mut self, preferred_size: u64) -> Result<(), FsError> {
        match self {
            FsElement::F(file) => file.entry_mut().resize(preferred_size),
            FsElement::D(dir) => dir.resize(preferred_size),
        }
    }
}

/// One mounted RedSea volume: the device handle, the immutable boot record
/// and the in-memory allocation bitmap.
///
/// Every mutation passes through the in-memory bitmap; the on-disk copy
/// changes only via [`Volume::flush_bitmap`].
pub struct Volume<D> {
    device: Arc<D>,
    boot: BootRecord,
    bitmap: Mutex<SectorBitmap>,
    read_only: bool,
}

impl<D: ReadOffset + WriteOffset> Volume<D> {
    /// Reads the boot record and the allocation bitmap from an opened
    /// device. Fails with [`FsError::InvalidVolume`] when the boot record
    /// signatures do not match.
    pub fn open(device: D, options: &MountOptions) -> Result<Arc<Self>, FsError> {
        let device = Arc::new(device);
        let boot = BootRecord::load(&device)?;
        let bitmap = SectorBitmap::load(&device, boot.bitmap_sectors())?;

        log::debug!(
            "volume: {} sectors, bitmap {} sector(s), base offset {}, id {:#x}",
            boot.total_sectors(),
            boot.bitmap_sectors(),
            boot.base_offset(),
            boot.unique_id(),
        );

        Ok(Arc::new(Self {
            device,
            boot,
            bitmap: Mutex::new(bitmap),
            read_only: options.read_only(),
        }))
    }

    pub fn boot(&self) -> &BootRecord {
        &self.boot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }

    fn ensure_writable(&self) -> Result<(), FsError> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn bitmap(&self) -> MutexGuard<'_, SectorBitmap> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FsError> {
        Ok(self.device.read_at(offset, buffer)?)
    }

    pub(crate) fn read_exact_at(&self, offset: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        Ok(self.device.read_exact_at(offset, buffer)?)
    }

    pub(crate) fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<usize, FsError> {
        self.ensure_writable()?;
        Ok(self.device.write_at(offset, buffer)?)
    }

    pub(crate) fn write_all_at(&self, offset: u64, buffer: &[u8]) -> Result<(), FsError> {
        self.ensure_writable()?;
        Ok(self.device.write_all_at(offset, buffer)?)
    }

    /// First-fit allocation of `count` contiguous sectors in the in-memory
    /// bitmap.
    pub fn allocate(&self, count: u64) -> Result<u64, FsError> {
        self.ensure_writable()?;
        self.bitmap().allocate(count).ok_or(FsError::NoSpace)
    }

    /// Releases `count` sectors starting at `start` in the in-memory bitmap.
    pub fn deallocate(&self, start: u64, count: u64) -> Result<(), FsError> {
        self.ensure_writable()?;
        self.bitmap().deallocate(start, count);
        Ok(())
    }

    /// Atomically probes the sector positions that would extend the run
    /// `[first, first + current)` to `preferred` sectors and marks them
    /// allocated when they are all free. Returns whether the extent grew.
    pub(crate) fn extend_in_place(
        &self,
        first: u64,
        current: u64,
        preferred: u64,
    ) -> Result<bool, FsError> {
        self.ensure_writable()?;

        let mut bitmap = self.bitmap();
        if !(current..preferred).all(|i| bitmap.is_free(first + i)) {
            return Ok(false);
        }
        for i in current..preferred {
            bitmap.force_allocate(first + i);
        }
        Ok(true)
    }

    pub fn is_free(&self, sector: u64) -> bool {
        self.bitmap().is_free(sector)
    }

    /// Allocated sectors, including the reserved boot and bitmap prefix.
    pub fn used_sectors(&self) -> u64 {
        self.bitmap().used_sectors()
    }

    /// Writes the in-memory bitmap back to disk.
    pub fn flush_bitmap(&self) -> Result<(), FsError> {
        self.ensure_writable()?;
        Ok(self.bitmap().flush(&self.device)?)
    }

    /// Pointer to the root directory's own record.
    pub fn root_pointer(&self) -> EntryPointer {
        let root_relative = self
            .boot
            .root_sector()
            .wrapping_sub(self.boot.base_offset());
        EntryPointer::new(root_relative * SECTOR_SIZE, None)
    }

    /// Materializes the record behind `pointer` as a file or directory,
    /// discriminated by its attribute bits.
    pub fn open_entry(self: &Arc<Self>, pointer: EntryPointer) -> Result<FsElement<D>, FsError> {
        let entry = DirEntry::load(Arc::clone(self), pointer.location(), pointer.parent())?;

        Ok(if entry.is_dir() {
            FsElement::D(Directory::from_entry(entry)?)
        } else {
            FsElement::F(File::new(entry))
        })
    }

    /// Like [`Volume::open_entry`], for pointers known to name a directory.
    pub fn open_dir(self: &Arc<Self>, pointer: EntryPointer) -> Result<Directory<D>, FsError> {
        self.open_entry(pointer)?.into_dir()
    }

    /// Like [`Volume::open_entry`], for pointers known to name a file.
    pub fn open_file(self: &Arc<Self>, pointer: EntryPointer) -> Result<File<D>, FsError> {
        match self.open_entry(pointer)? {
            FsElement::F(file) => Ok(file),
            FsElement::D(_) => Err(FsError::IsADirectory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    #[test]
    fn read_only_mounts_reject_mutation() {
        let disk = ImageBuilder::new().build();
        let options = MountOptionsBuilder::default()
            .read_only(true)
            .build()
            .unwrap();
        let volume = Volume::open(disk, &options).unwrap();

        assert!(matches!(volume.allocate(1), Err(FsError::ReadOnly)));
        assert!(matches!(volume.flush_bitmap(), Err(FsError::ReadOnly)));
        assert!(matches!(
            volume.write_all_at(1024, &[0u8; 4]),
            Err(FsError::ReadOnly)
        ));
    }

    #[test]
    fn opens_the_root_directory() {
        let volume = ImageBuilder::new()
            .file("first", b"1")
            .file("second", b"2")
            .build_volume();

        let root = volume.open_dir(volume.root_pointer()).unwrap();
        assert_eq!(root.entry().ino(), 2);
        // ".." plus the two files
        assert_eq!(root.count_entries(), 3);
    }

    #[test]
    fn used_sectors_track_the_payloads() {
        let volume = ImageBuilder::new()
            .file("a", &[1u8; 1024])
            .build_volume();

        // boot + bitmap + root (16 slots, 2 sectors) + 2 payload sectors
        assert_eq!(volume.used_sectors(), 6);
    }
}
