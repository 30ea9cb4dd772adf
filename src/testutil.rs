//! Test fixtures: fabricated in-memory volume images.

use std::sync::Arc;

use crate::{
    SECTOR_SIZE,
    bitmap::SectorBitmap,
    dir::entry::{ENTRY_SIZE, EntryAttributes, RawDirEntry},
    disk::MemDisk,
    fs::{MountOptions, Volume},
    sectors_for,
    vfs::RedSeaFs,
};

/// Builds a minimal valid RedSea image: boot record, bitmap, a root
/// directory and optional files laid out contiguously behind it.
pub(crate) struct ImageBuilder {
    base_offset: u64,
    total_sectors: u64,
    bitmap_sectors: u64,
    root_slots: u64,
    files: Vec<(String, Vec<u8>)>,
}

impl ImageBuilder {
    pub(crate) fn new() -> Self {
        Self {
            base_offset: 0,
            total_sectors: 64,
            bitmap_sectors: 1,
            root_slots: 16,
            files: Vec::new(),
        }
    }

    pub(crate) fn base_offset(mut self, sectors: u64) -> Self {
        self.base_offset = sectors;
        self
    }

    pub(crate) fn total_sectors(mut self, sectors: u64) -> Self {
        self.total_sectors = sectors;
        self
    }

    pub(crate) fn root_slots(mut self, slots: u64) -> Self {
        self.root_slots = slots;
        self
    }

    pub(crate) fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.into(), content.to_vec()));
        self
    }

    pub(crate) fn build(self) -> MemDisk {
        let mut image = vec![0u8; (self.total_sectors * SECTOR_SIZE) as usize];
        let mut bitmap = SectorBitmap::empty(self.bitmap_sectors);

        let root_rel = self.bitmap_sectors + 1;
        let root_size = self.root_slots * ENTRY_SIZE;
        assert_eq!(bitmap.allocate(sectors_for(root_size)), Some(root_rel));

        // boot record
        image[..3].copy_from_slice(&[0xEB, 0x3E, 0x90]);
        image[3] = 0x88;
        write_u64(&mut image, 8, self.base_offset);
        write_u64(&mut image, 16, self.total_sectors);
        write_u64(&mut image, 24, self.base_offset + root_rel);
        write_u64(&mut image, 32, self.bitmap_sectors);
        write_u64(&mut image, 40, 0xD15C);
        image[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());

        // root slot 0 re-describes the root; its ".." points at the root too
        let dir_attributes = EntryAttributes::DIR | EntryAttributes::CONTIGUOUS;
        let root_base = (root_rel * SECTOR_SIZE) as usize;
        let self_record =
            RawDirEntry::new(dir_attributes, ".", self.base_offset + root_rel, root_size);
        write_record(&mut image, root_base, &self_record);
        let back_ref =
            RawDirEntry::new(dir_attributes, "..", self.base_offset + root_rel, root_size);
        write_record(&mut image, root_base + ENTRY_SIZE as usize, &back_ref);

        for (slot, (name, content)) in self.files.iter().enumerate() {
            let slot = slot as u64 + 2;
            assert!(slot < self.root_slots, "root slot table too small");

            let sectors = sectors_for(content.len() as u64);
            let first = if sectors > 0 {
                bitmap.allocate(sectors).expect("image too small")
            } else {
                bitmap.first_free(0).expect("image too small")
            };

            let record = RawDirEntry::new(
                EntryAttributes::CONTIGUOUS,
                name,
                self.base_offset + first,
                content.len() as u64,
            );
            write_record(
                &mut image,
                root_base + (slot * ENTRY_SIZE) as usize,
                &record,
            );

            let start = (first * SECTOR_SIZE) as usize;
            image[start..start + content.len()].copy_from_slice(content);
        }

        let disk = MemDisk::from_vec(image);
        bitmap.flush(&disk).unwrap();
        disk
    }

    pub(crate) fn build_volume(self) -> Arc<Volume<MemDisk>> {
        Volume::open(self.build(), &MountOptions::default()).unwrap()
    }

    pub(crate) fn mount(self) -> RedSeaFs<MemDisk> {
        RedSeaFs::mount(self.build(), MountOptions::default()).unwrap()
    }
}

fn write_u64(image: &mut [u8], offset: usize, value: u64) {
    image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_record(image: &mut [u8], offset: usize, record: &RawDirEntry) {
    let on_disk = record.to_le();
    image[offset..offset + ENTRY_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&on_disk));
}
