use bytemuck::{Pod, Zeroable};
use endify::Endify;

use crate::{SECTOR_SIZE, disk::ReadOffset, error::FsError};

/// Signature byte at offset 3 of the boot record.
pub(crate) const BOOT_SIGNATURE: u8 = 0x88;
/// Trailing boot sector signature.
pub(crate) const BOOT_SIGNATURE_TRAILING: u16 = 0xAA55;

/// Buffer used to read the boot record.
#[repr(align(8))]
pub(crate) struct AlignedSector(pub(crate) [u8; SECTOR_SIZE as usize]);

/// The on-disk boot record of a RedSea volume, one instance per volume.
/// All numeric fields are little-endian on disk.
#[derive(Debug, Clone, Copy, Pod, Zeroable, Endify)]
#[repr(C)]
pub(crate) struct RawBootRecord {
    /// Jump-and-nop instruction sequence, unused by the driver.
    jump_and_nop: [u8; 3],

    /// Must be [`BOOT_SIGNATURE`].
    signature: u8,

    _reserved: [u8; 4],

    /// Absolute sector of the filesystem's first sector as seen by the block
    /// device. Volumes may live inside a partition.
    base_offset: u64,

    /// Total sectors in the volume.
    count: u64,

    /// Absolute sector of the root directory's first sector.
    root_sector: u64,

    /// Number of sectors the allocation bitmap occupies, starting at
    /// volume-relative sector 1.
    bitmap_sectors: u64,

    /// Volume identifier, chosen at format time.
    unique_id: u64,

    /// Bootstrapping code, opaque to the driver.
    boot_code: [u8; 462],

    /// Must be [`BOOT_SIGNATURE_TRAILING`].
    signature2: u16,
}

/// Parsed boot record, held immutable for the lifetime of the mount.
#[derive(Debug, Clone, Copy)]
pub struct BootRecord {
    raw: RawBootRecord,
}

impl BootRecord {
    /// Reads sector 0 of the device and evaluates the validity predicate:
    /// both signatures must be present, otherwise the volume is invalid.
    pub(crate) fn load<D: ReadOffset>(device: &D) -> Result<Self, FsError> {
        let mut buffer = AlignedSector([0u8; SECTOR_SIZE as usize]);
        device.read_exact_at(0, &mut buffer.0)?;

        let raw = *bytemuck::from_bytes::<RawBootRecord>(&buffer.0);

        // convert to native endianness
        let raw: RawBootRecord = Endify::from_le(raw);

        if raw.signature != BOOT_SIGNATURE || raw.signature2 != BOOT_SIGNATURE_TRAILING {
            return Err(FsError::InvalidVolume);
        }

        Ok(Self { raw })
    }

    /// Block-device sector at which the volume begins.
    pub fn base_offset(&self) -> u64 {
        self.raw.base_offset
    }

    /// Total sectors in the volume.
    pub fn total_sectors(&self) -> u64 {
        self.raw.count
    }

    /// Absolute sector of the root directory. Subtract [`Self::base_offset`]
    /// for the volume-relative form.
    pub fn root_sector(&self) -> u64 {
        self.raw.root_sector
    }

    /// Sectors occupied by the allocation bitmap.
    pub fn bitmap_sectors(&self) -> u64 {
        self.raw.bitmap_sectors
    }

    pub fn unique_id(&self) -> u64 {
        self.raw.unique_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::testutil::ImageBuilder;

    #[test]
    fn loads_a_valid_boot_record() {
        let disk = ImageBuilder::new().total_sectors(64).build();
        let boot = BootRecord::load(&disk).unwrap();

        assert_eq!(boot.base_offset(), 0);
        assert_eq!(boot.total_sectors(), 64);
        assert_eq!(boot.bitmap_sectors(), 1);
        assert_eq!(boot.root_sector(), 2);
    }

    #[test]
    fn keeps_the_partition_offset() {
        let disk = ImageBuilder::new().base_offset(1024).build();
        let boot = BootRecord::load(&disk).unwrap();

        assert_eq!(boot.base_offset(), 1024);
        assert_eq!(boot.root_sector(), 1024 + 2);
    }

    #[test]
    fn rejects_a_bad_signature_byte() {
        let mut image = ImageBuilder::new().build().snapshot();
        image[3] = 0x00;

        let err = BootRecord::load(&MemDisk::from_vec(image)).unwrap_err();
        assert!(matches!(err, FsError::InvalidVolume));
    }

    #[test]
    fn rejects_a_bad_trailing_signature() {
        let mut image = ImageBuilder::new().build().snapshot();
        image[510] = 0;
        image[511] = 0;

        let err = BootRecord::load(&MemDisk::from_vec(image)).unwrap_err();
        assert!(matches!(err, FsError::InvalidVolume));
    }
}
