use checked_num::CheckedU64;

use crate::{
    SECTOR_SIZE,
    disk::{ReadOffset, WriteOffset},
    error::FsError,
    sectors_for,
};

use entry::{DirEntry, ENTRY_SIZE, EntryAttributes, RawDirEntry, live_attributes};

pub mod entry;

/// Number of slots a freshly created directory gets (1 KiB of slot table).
pub const DEFAULT_DIR_SLOTS: u64 = 16;

/// Location of one directory record: its byte offset within the volume and
/// the inode of the directory that holds the slot (`None` for the root and
/// for self-views).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointer {
    location: u64,
    parent: Option<u64>,
}

impl EntryPointer {
    pub(crate) fn new(location: u64, parent: Option<u64>) -> Self {
        Self { location, parent }
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }
}

/// A directory: an entry whose payload is a table of 64-byte slots.
///
/// Slot 0 is the directory's own record, slot 1 the `..` parent
/// back-reference, the rest are children. Only each slot's attribute word is
/// cached here; child entries are re-read on demand and owned by whoever
/// asked for them.
pub struct Directory<D> {
    entry: DirEntry<D>,
    /// Slot capacity, including slot 0.
    entry_count: u64,
    /// Live slots, not counting slot 0.
    used_entries: u64,
    /// Attribute word per slot; index 0 is never a child.
    attributes: Vec<u16>,
}

impl<D: ReadOffset + WriteOffset> Directory<D> {
    pub(crate) fn from_entry(entry: DirEntry<D>) -> Result<Self, FsError> {
        if !entry.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut dir = Self {
            entry,
            entry_count: 0,
            used_entries: 0,
            attributes: Vec::new(),
        };
        dir.refresh_cache()?;
        Ok(dir)
    }

    pub fn entry(&self) -> &DirEntry<D> {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut DirEntry<D> {
        &mut self.entry
    }

    pub fn into_entry(self) -> DirEntry<D> {
        self.entry
    }

    pub fn ino(&self) -> u64 {
        self.entry.ino()
    }

    /// Number of live entries, the `..` back-reference included.
    pub fn count_entries(&self) -> u64 {
        self.used_entries
    }

    /// Slot capacity of the table.
    pub fn slot_count(&self) -> u64 {
        self.entry_count
    }

    /// Re-reads every slot's attribute word and recomputes the live count.
    pub fn refresh_cache(&mut self) -> Result<(), FsError> {
        self.entry_count = self.entry.size() / ENTRY_SIZE;

        let mut table = vec![0u8; (self.entry_count * ENTRY_SIZE) as usize];
        self.entry
            .volume()
            .read_exact_at(self.entry.first_sector() * SECTOR_SIZE, &mut table)?;

        self.attributes = table
            .chunks_exact(ENTRY_SIZE as usize)
            .map(|slot| u16::from_le_bytes([slot[0], slot[1]]))
            .collect();
        self.used_entries = self
            .attributes
            .iter()
            .skip(1)
            .filter(|&&word| live_attributes(word))
            .count() as u64;

        Ok(())
    }

    /// Pointer to the `i`-th live entry, counting slots upward from 1.
    pub fn get_entry(&self, i: u64) -> Option<EntryPointer> {
        if i >= self.used_entries {
            return None;
        }

        let mut live = 0;
        for slot in 1..self.entry_count {
            if !live_attributes(self.attributes[slot as usize]) {
                continue;
            }
            if live == i {
                let location = self.slot_location(slot).ok()?;
                return Some(EntryPointer::new(location, Some(self.ino())));
            }
            live += 1;
        }

        None
    }

    /// Pointer identity for the directory's own slot 0 record.
    pub fn self_pointer(&self) -> EntryPointer {
        EntryPointer::new(self.entry.first_sector() * SECTOR_SIZE, None)
    }

    /// Scans the live slots for an exact name match.
    pub fn find(&self, name: &str) -> Result<Option<EntryPointer>, FsError> {
        for slot in 1..self.entry_count {
            if !live_attributes(self.attributes[slot as usize]) {
                continue;
            }

            let location = self.slot_location(slot)?;
            let entry =
                DirEntry::load(self.entry.volume().clone(), location, Some(self.ino()))?;
            if entry.name() == name {
                return Ok(Some(EntryPointer::new(location, Some(self.ino()))));
            }
        }

        Ok(None)
    }

    /// Writes `record` into the lowest free (never-used or tombstoned) slot.
    /// Fails with [`FsError::NoSpace`] when the table is full; callers may
    /// grow first.
    pub fn add_entry(&mut self, record: &RawDirEntry) -> Result<EntryPointer, FsError> {
        let Some(slot) = self.free_slot() else {
            return Err(FsError::NoSpace);
        };
        self.write_slot(slot, record)
    }

    /// Tombstones the slot holding `entry` and flushes it. The payload
    /// sectors stay allocated; releasing them is [`DirEntry::delete`]'s job.
    pub fn remove_entry(&mut self, entry: &mut DirEntry<D>) -> Result<(), FsError> {
        let table_start = self.entry.first_sector() * SECTOR_SIZE;
        let offset = entry
            .location()
            .checked_sub(table_start)
            .ok_or(FsError::NotFound)?;
        let slot = offset / ENTRY_SIZE;
        if slot == 0 || slot >= self.entry_count || offset % ENTRY_SIZE != 0 {
            return Err(FsError::NotFound);
        }

        entry.mark_deleted();
        entry.flush()?;

        if live_attributes(self.attributes[slot as usize]) {
            self.used_entries -= 1;
        }
        self.attributes[slot as usize] |= EntryAttributes::DELETED.bits();
        Ok(())
    }

    /// Creates a file of `size` bytes: allocates its contiguous run, writes
    /// a fresh record into the lowest free slot and grows the table by one
    /// sector when it is full.
    pub fn create_file(&mut self, name: &str, size: u64) -> Result<EntryPointer, FsError> {
        if self.free_slot().is_none() {
            self.grow()?;
        }
        let Some(slot) = self.free_slot() else {
            return Err(FsError::NoSpace);
        };

        let volume = self.entry.volume().clone();
        let first_sector = volume.allocate(sectors_for(size))?;

        let record = RawDirEntry::new(EntryAttributes::CONTIGUOUS, name, first_sector, size);
        self.write_slot(slot, &record)
    }

    /// Creates a `slot_count`-slot subdirectory: zeroed slot table, slot 0
    /// self-record, slot 1 `..` back-reference, and a child record in this
    /// directory. Returns the pointer to the child record.
    pub fn create_directory(
        &mut self,
        name: &str,
        slot_count: u64,
    ) -> Result<EntryPointer, FsError> {
        if self.free_slot().is_none() {
            self.grow()?;
        }
        let Some(slot) = self.free_slot() else {
            return Err(FsError::NoSpace);
        };

        let volume = self.entry.volume().clone();
        let sectors = sectors_for(slot_count * ENTRY_SIZE);
        let first_sector = volume.allocate(sectors)?;
        let byte_len = sectors * SECTOR_SIZE;

        // every slot of the new table must read as never-used
        volume.write_all_at(first_sector * SECTOR_SIZE, &vec![0u8; byte_len as usize])?;

        let attributes = EntryAttributes::DIR | EntryAttributes::CONTIGUOUS;
        let record = RawDirEntry::new(attributes, name, first_sector, byte_len);
        DirEntry::from_record(volume.clone(), record, first_sector * SECTOR_SIZE, None)
            .flush()?;

        let parent_ref = RawDirEntry::new(
            attributes,
            "..",
            self.entry.first_sector(),
            self.entry.size(),
        );
        DirEntry::from_record(
            volume,
            parent_ref,
            first_sector * SECTOR_SIZE + ENTRY_SIZE,
            Some(first_sector),
        )
        .flush()?;

        self.write_slot(slot, &record)
    }

    /// Resizes the slot table. New table space is zeroed so it reads as
    /// never-used, and slot 0 is rewritten to keep re-describing the
    /// directory. Directories only ever extend in place.
    pub(crate) fn resize(&mut self, preferred_size: u64) -> Result<(), FsError> {
        let old_size = self.entry.size();
        self.entry.resize(preferred_size)?;

        if preferred_size > old_size {
            let volume = self.entry.volume().clone();
            volume.write_all_at(
                self.entry.first_sector() * SECTOR_SIZE + old_size,
                &vec![0u8; (preferred_size - old_size) as usize],
            )?;
        }

        self.write_self_record()?;
        self.refresh_cache()
    }

    fn grow(&mut self) -> Result<(), FsError> {
        log::debug!("growing directory '{}' by one sector", self.entry.name());
        self.resize(self.entry.size() + SECTOR_SIZE)?;
        self.entry.flush()
    }

    fn write_self_record(&self) -> Result<(), FsError> {
        let location = self.entry.first_sector() * SECTOR_SIZE;
        if self.entry.location() == location {
            // the entry is the slot 0 record already
            return self.entry.flush();
        }

        DirEntry::from_record(
            self.entry.volume().clone(),
            *self.entry.record(),
            location,
            None,
        )
        .flush()
    }

    /// Lowest never-used or tombstoned slot.
    fn free_slot(&self) -> Option<u64> {
        (1..self.entry_count).find(|&slot| !live_attributes(self.attributes[slot as usize]))
    }

    fn slot_location(&self, slot: u64) -> Result<u64, FsError> {
        (CheckedU64::new(self.entry.first_sector()) * SECTOR_SIZE + slot * ENTRY_SIZE)
            .ok_or(FsError::OffsetPastEnd)
    }

    fn write_slot(&mut self, slot: u64, record: &RawDirEntry) -> Result<EntryPointer, FsError> {
        let location = self.slot_location(slot)?;
        DirEntry::from_record(
            self.entry.volume().clone(),
            *record,
            location,
            Some(self.ino()),
        )
        .flush()?;

        self.attributes[slot as usize] = record.attributes;
        self.used_entries += 1;
        Ok(EntryPointer::new(location, Some(self.ino())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    #[test]
    fn counts_live_entries() {
        let volume = ImageBuilder::new()
            .file("a", b"1")
            .file("b", b"2")
            .build_volume();

        let root = volume.open_dir(volume.root_pointer()).unwrap();
        assert_eq!(root.count_entries(), 3); // "..", "a", "b"
        assert_eq!(root.slot_count(), 16);
    }

    #[test]
    fn get_entry_walks_live_slots_in_order() {
        let volume = ImageBuilder::new()
            .file("a", b"1")
            .file("b", b"2")
            .build_volume();

        let root = volume.open_dir(volume.root_pointer()).unwrap();
        let names: Vec<String> = (0..root.count_entries())
            .map(|i| {
                let pointer = root.get_entry(i).unwrap();
                DirEntry::load(volume.clone(), pointer.location(), pointer.parent())
                    .unwrap()
                    .name()
            })
            .collect();

        assert_eq!(names, ["..", "a", "b"]);
        assert!(root.get_entry(3).is_none());
    }

    #[test]
    fn find_matches_exact_names() {
        let volume = ImageBuilder::new().file("hello", b"1").build_volume();
        let root = volume.open_dir(volume.root_pointer()).unwrap();

        assert!(root.find("hello").unwrap().is_some());
        assert!(root.find("hell").unwrap().is_none());
        assert!(root.find("..").unwrap().is_some());
    }

    #[test]
    fn create_file_fills_the_lowest_free_slot() {
        let volume = ImageBuilder::new().file("a", b"1").build_volume();
        let mut root = volume.open_dir(volume.root_pointer()).unwrap();

        let before = root.count_entries();
        let pointer = root.create_file("fresh", 100).unwrap();
        assert_eq!(root.count_entries(), before + 1);

        let entry = DirEntry::load(volume.clone(), pointer.location(), pointer.parent()).unwrap();
        assert_eq!(entry.name(), "fresh");
        assert_eq!(entry.size(), 100);
        assert!(entry.attributes().contains(EntryAttributes::CONTIGUOUS));
        assert!(!volume.is_free(entry.first_sector()));
    }

    #[test]
    fn tombstoned_slots_are_recycled() {
        let volume = ImageBuilder::new()
            .file("a", b"1")
            .file("b", b"2")
            .build_volume();
        let mut root = volume.open_dir(volume.root_pointer()).unwrap();

        let pointer = root.find("a").unwrap().unwrap();
        let mut entry =
            DirEntry::load(volume.clone(), pointer.location(), pointer.parent()).unwrap();
        entry.delete().unwrap();
        root.remove_entry(&mut entry).unwrap();
        assert_eq!(root.count_entries(), 2);

        // the tombstone is the lowest free slot
        let fresh = root.create_file("c", 10).unwrap();
        assert_eq!(fresh.location(), pointer.location());
    }

    #[test]
    fn a_full_directory_grows_by_one_sector() {
        // 8 slots: self, "..", and room for 6 children. Zero-sized files
        // fill the table without claiming the sector after it.
        let volume = ImageBuilder::new().root_slots(8).build_volume();
        let mut root = volume.open_dir(volume.root_pointer()).unwrap();

        for i in 0..6 {
            root.create_file(&format!("file-{i}"), 0).unwrap();
        }
        assert_eq!(root.slot_count(), 8);

        let grown = root.create_file("file-6", 0).unwrap();

        assert_eq!(root.slot_count(), 16);
        assert_eq!(root.count_entries(), 8); // ".." plus seven files
        assert_eq!(root.entry().size(), 2 * SECTOR_SIZE);

        // the new child landed in the freshly added slot range
        let first_new_slot = root.entry().first_sector() * SECTOR_SIZE + 8 * ENTRY_SIZE;
        assert_eq!(grown.location(), first_new_slot);

        // slot 0 still re-describes the directory
        let self_entry =
            DirEntry::load(volume.clone(), root.self_pointer().location(), None).unwrap();
        assert_eq!(self_entry.size(), 2 * SECTOR_SIZE);
        assert!(self_entry.is_dir());
    }

    #[test]
    fn create_directory_writes_self_and_parent_slots() {
        let volume = ImageBuilder::new().build_volume();
        let mut root = volume.open_dir(volume.root_pointer()).unwrap();

        let pointer = root.create_directory("sub", DEFAULT_DIR_SLOTS).unwrap();
        let sub = volume.open_dir(pointer).unwrap();

        assert_eq!(sub.entry().name(), "sub");
        assert_eq!(sub.slot_count(), DEFAULT_DIR_SLOTS);
        assert_eq!(sub.entry().size(), 1024);
        assert_eq!(sub.count_entries(), 1); // only ".."

        // slot 0 re-describes the subdirectory
        let self_entry =
            DirEntry::load(volume.clone(), sub.self_pointer().location(), None).unwrap();
        assert_eq!(self_entry.name(), "sub");
        assert_eq!(self_entry.ino(), sub.ino());

        // slot 1 points back at the root
        let back_ref = sub.find("..").unwrap().unwrap();
        let back_ref = DirEntry::load(volume.clone(), back_ref.location(), None).unwrap();
        assert_eq!(back_ref.ino(), root.ino());
        assert!(back_ref.is_dir());
    }
}
