use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use endify::Endify;

use crate::{
    SECTOR_SIZE,
    disk::{ReadOffset, WriteOffset},
    error::FsError,
    fs::Volume,
    sectors_for,
};

/// Size of one on-disk directory record.
pub(crate) const ENTRY_SIZE: u64 = 64;
/// Capacity of the name field, including the terminating NUL.
pub(crate) const NAME_CAPACITY: usize = 38;
/// Longest representable entry name.
pub const MAX_NAME_LEN: usize = 37;

/// Tick rate of the sub-day part of an entry's date-time stamp.
pub const TICK_HZ: u32 = 49_710;

bitflags! {
    /// Attribute word of a directory record.
    ///
    /// A slot with a zero word has never been used; a slot with `DELETED`
    /// set is a tombstone and may be recycled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryAttributes: u16 {
        const DIR = 0x0010;
        const DELETED = 0x0100;
        /// Present in the format, ignored by this driver.
        const COMPRESSED = 0x0400;
        /// Always set by this driver on create: entries own a single
        /// contiguous run of sectors.
        const CONTIGUOUS = 0x0800;
    }
}

/// Whether an attribute word describes a live slot.
pub(crate) fn live_attributes(word: u16) -> bool {
    word != 0 && word & EntryAttributes::DELETED.bits() == 0
}

/// Packed date-time stamp: the high 32 bits count days since year 1, the low
/// 32 bits count [`TICK_HZ`] ticks within the day. The driver stores and
/// copies stamps verbatim, it never normalizes them.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Endify)]
pub struct DateTime(u64);

impl DateTime {
    pub fn new(days: u32, ticks: u32) -> Self {
        Self((days as u64) << 32 | ticks as u64)
    }

    pub fn days(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn ticks(&self) -> u32 {
        self.0 as u32
    }
}

/// Buffer used to read a directory record.
#[repr(align(8))]
pub(crate) struct AlignedRecord(pub(crate) [u8; ENTRY_SIZE as usize]);

/// One on-disk 64-byte directory record. All numeric fields are
/// little-endian on disk.
#[derive(Debug, Clone, Copy, Pod, Zeroable, Endify)]
#[repr(C)]
pub(crate) struct RawDirEntry {
    /// Attribute bitfield, see [`EntryAttributes`].
    pub(crate) attributes: u16,

    /// NUL-terminated name, at most [`MAX_NAME_LEN`] bytes.
    pub(crate) name: [u8; NAME_CAPACITY],

    /// First sector of the entry's payload. Absolute on disk; the in-memory
    /// form is volume-relative.
    pub(crate) first_sector: u64,

    /// Payload size in bytes.
    pub(crate) size: u64,

    pub(crate) date_time: DateTime,
}

impl RawDirEntry {
    pub(crate) fn new(
        attributes: EntryAttributes,
        name: &str,
        first_sector: u64,
        size: u64,
    ) -> Self {
        let mut record = Self::zeroed();
        record.attributes = attributes.bits();
        record.set_name(name);
        record.first_sector = first_sector;
        record.size = size;
        record
    }

    /// Name up to the first NUL, lossily decoded.
    pub(crate) fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Stores `name`, truncated to [`MAX_NAME_LEN`] bytes on a character
    /// boundary and NUL-padded.
    pub(crate) fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }

        self.name = [0u8; NAME_CAPACITY];
        self.name[..end].copy_from_slice(&name.as_bytes()[..end]);
    }

    pub(crate) fn attributes(&self) -> EntryAttributes {
        EntryAttributes::from_bits_retain(self.attributes)
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.attributes().contains(EntryAttributes::DIR)
    }

    /// Copy with every multi-byte field in its little-endian form, ready for
    /// [`bytemuck::bytes_of`].
    pub(crate) fn to_le(self) -> Self {
        Self {
            attributes: self.attributes.to_le(),
            name: self.name,
            first_sector: self.first_sector.to_le(),
            size: self.size.to_le(),
            date_time: DateTime(self.date_time.0.to_le()),
        }
    }
}

/// In-memory view of one directory record, tied to its on-disk location.
///
/// The record keeps the first sector in volume-relative form; the partition
/// base offset is re-added only while serializing. Mutations touch the
/// in-memory bitmap and this record only; callers persist them with
/// [`DirEntry::flush`] and [`Volume::flush_bitmap`].
pub struct DirEntry<D> {
    volume: Arc<Volume<D>>,
    record: RawDirEntry,
    /// Byte offset of the 64-byte record within the volume.
    location: u64,
    /// Inode of the owning directory. `None` for the root and for synthetic
    /// self-views.
    parent: Option<u64>,
}

impl<D: ReadOffset + WriteOffset> DirEntry<D> {
    /// Reads the record at `location` and converts the first-sector field to
    /// its volume-relative form.
    pub(crate) fn load(
        volume: Arc<Volume<D>>,
        location: u64,
        parent: Option<u64>,
    ) -> Result<Self, FsError> {
        let mut buffer = AlignedRecord([0u8; ENTRY_SIZE as usize]);
        volume.read_exact_at(location, &mut buffer.0)?;

        let mut record: RawDirEntry = Endify::from_le(*bytemuck::from_bytes(&buffer.0));
        record.first_sector = record
            .first_sector
            .wrapping_sub(volume.boot().base_offset());

        Ok(Self {
            volume,
            record,
            location,
            parent,
        })
    }

    /// Wraps a freshly built record that is not on disk yet. `record` holds
    /// the volume-relative first sector.
    pub(crate) fn from_record(
        volume: Arc<Volume<D>>,
        record: RawDirEntry,
        location: u64,
        parent: Option<u64>,
    ) -> Self {
        Self {
            volume,
            record,
            location,
            parent,
        }
    }

    pub fn name(&self) -> String {
        self.record.name()
    }

    pub fn size(&self) -> u64 {
        self.record.size
    }

    /// Volume-relative first sector of the payload.
    pub fn first_sector(&self) -> u64 {
        self.record.first_sector
    }

    /// The entry's inode: its volume-relative first sector. Live entries
    /// occupy disjoint sector runs, so this is unique, and a directory's
    /// self-slot and parent back-references share their target's inode.
    pub fn ino(&self) -> u64 {
        self.record.first_sector
    }

    /// Sectors spanned by the payload.
    pub fn sectors(&self) -> u64 {
        sectors_for(self.record.size)
    }

    pub fn attributes(&self) -> EntryAttributes {
        self.record.attributes()
    }

    pub fn is_dir(&self) -> bool {
        self.record.is_dir()
    }

    pub fn date_time(&self) -> DateTime {
        self.record.date_time
    }

    /// Byte offset of the record within the volume.
    pub fn location(&self) -> u64 {
        self.location
    }

    /// Inode of the owning directory, if any.
    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub(crate) fn volume(&self) -> &Arc<Volume<D>> {
        &self.volume
    }

    pub(crate) fn record(&self) -> &RawDirEntry {
        &self.record
    }

    /// Points this object at a different slot, after a rename moved the
    /// record.
    pub(crate) fn assign(&mut self, record: RawDirEntry, location: u64, parent: Option<u64>) {
        self.record = record;
        self.location = location;
        self.parent = parent;
    }

    /// Writes the 64-byte record back to its on-disk location. The
    /// first-sector field is re-offset by the partition base in the
    /// serialized copy only.
    pub fn flush(&self) -> Result<(), FsError> {
        let mut on_disk = self.record;
        on_disk.first_sector = on_disk
            .first_sector
            .wrapping_add(self.volume.boot().base_offset());

        let on_disk = on_disk.to_le();
        self.volume
            .write_all_at(self.location, bytemuck::bytes_of(&on_disk))
    }

    /// Tombstones the entry and releases its sectors in the in-memory
    /// bitmap. Callers persist with [`DirEntry::flush`] and
    /// [`Volume::flush_bitmap`]; the slot is recyclable immediately.
    pub fn delete(&mut self) -> Result<(), FsError> {
        self.volume
            .deallocate(self.record.first_sector, self.sectors())?;
        self.record.attributes |= EntryAttributes::DELETED.bits();
        Ok(())
    }

    /// Tombstones the record without touching the bitmap.
    pub(crate) fn mark_deleted(&mut self) {
        self.record.attributes |= EntryAttributes::DELETED.bits();
    }

    /// Changes the payload size.
    ///
    /// Shrinking releases the tail sectors. Growing first probes the sector
    /// positions that would extend the run in place; if any is busy, a file
    /// is relocated to a fresh contiguous run (payload copied, old run
    /// released) while a directory fails, since other records may reference
    /// its sectors. Fails with [`FsError::NoSpace`] when no run fits. A
    /// failed relocation leaves the original extent intact.
    ///
    /// The record is updated in memory only; the caller flushes it and the
    /// bitmap.
    pub fn resize(&mut self, preferred_size: u64) -> Result<(), FsError> {
        let current = sectors_for(self.record.size);
        let preferred = sectors_for(preferred_size);
        let first = self.record.first_sector;

        if preferred == current {
            self.record.size = preferred_size;
            return Ok(());
        }

        if preferred < current {
            self.volume
                .deallocate(first + preferred, current - preferred)?;
            self.record.size = preferred_size;
            return Ok(());
        }

        if self.volume.extend_in_place(first, current, preferred)? {
            self.record.size = preferred_size;
            return Ok(());
        }

        if self.is_dir() {
            return Err(FsError::NoSpace);
        }

        let new_first = self.volume.allocate(preferred)?;
        if let Err(e) = self.copy_payload(first, new_first, current) {
            let _ = self.volume.deallocate(new_first, preferred);
            return Err(e);
        }
        self.volume.deallocate(first, current)?;

        log::debug!(
            "relocated '{}': sector {first} -> {new_first} ({current} -> {preferred} sectors)",
            self.name()
        );
        self.record.first_sector = new_first;
        self.record.size = preferred_size;
        Ok(())
    }

    /// Bounded read within the payload. Fails when `offset` lies past the
    /// size; the count is clamped to the bytes that remain.
    pub fn read_content(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FsError> {
        if offset > self.record.size {
            return Err(FsError::OffsetPastEnd);
        }

        let count = u64::min(buffer.len() as u64, self.record.size - offset) as usize;
        if count == 0 {
            return Ok(0);
        }

        self.volume.read_at(
            self.record.first_sector * SECTOR_SIZE + offset,
            &mut buffer[..count],
        )
    }

    /// Bounded write within the payload, clamped like [`Self::read_content`].
    /// Writing past the end requires a prior [`Self::resize`].
    pub fn write_content(&self, offset: u64, buffer: &[u8]) -> Result<usize, FsError> {
        if offset > self.record.size {
            return Err(FsError::OffsetPastEnd);
        }

        let count = u64::min(buffer.len() as u64, self.record.size - offset) as usize;
        if count == 0 {
            return Ok(0);
        }

        self.volume.write_at(
            self.record.first_sector * SECTOR_SIZE + offset,
            &buffer[..count],
        )
    }

    fn copy_payload(&self, from: u64, to: u64, sectors: u64) -> Result<(), FsError> {
        let mut buffer = [0u8; 8 * SECTOR_SIZE as usize];

        let total = sectors * SECTOR_SIZE;
        let mut copied = 0u64;
        while copied < total {
            let chunk = u64::min(total - copied, buffer.len() as u64) as usize;
            self.volume
                .read_exact_at(from * SECTOR_SIZE + copied, &mut buffer[..chunk])?;
            self.volume
                .write_all_at(to * SECTOR_SIZE + copied, &buffer[..chunk])?;
            copied += chunk as u64;
        }
        Ok(())
    }
}
