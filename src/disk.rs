use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// Positioned reads against an opened device handle.
///
/// Offsets are in bytes; a partial read reports the actual byte count.
pub trait ReadOffset {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize>;

    fn read_exact_at(&self, mut offset: u64, mut buffer: &mut [u8]) -> io::Result<()> {
        while !buffer.is_empty() {
            match self.read_at(offset, buffer) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buffer = &mut buffer[n..];
                    offset = offset
                        .checked_add(n as u64)
                        .ok_or(io::ErrorKind::UnexpectedEof)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Positioned writes against an opened device handle.
pub trait WriteOffset {
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize>;

    fn write_all_at(&self, mut offset: u64, mut buffer: &[u8]) -> io::Result<()> {
        while !buffer.is_empty() {
            match self.write_at(offset, buffer) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buffer = &buffer[n..];
                    offset = offset
                        .checked_add(n as u64)
                        .ok_or(io::ErrorKind::WriteZero)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: ReadOffset> ReadOffset for &T {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        (*self).read_at(offset, buffer)
    }
}

impl<T: WriteOffset> WriteOffset for &T {
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        (*self).write_at(offset, buffer)
    }
}

impl<T: ReadOffset> ReadOffset for Arc<T> {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        self.as_ref().read_at(offset, buffer)
    }
}

impl<T: WriteOffset> WriteOffset for Arc<T> {
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        self.as_ref().write_at(offset, buffer)
    }
}

impl ReadOffset for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buffer, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buffer, offset)
    }
}

impl WriteOffset for std::fs::File {
    #[cfg(unix)]
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buffer, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buffer, offset)
    }
}

/// A fixed-size in-memory block device.
///
/// Behaves like a raw partition: reads past the end return a short count and
/// writes past the end refuse to grow the image.
#[derive(Debug)]
pub struct MemDisk {
    bytes: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadOffset for MemDisk {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let bytes = self.lock();
        let start = usize::min(offset as usize, bytes.len());
        let count = usize::min(buffer.len(), bytes.len() - start);
        buffer[..count].copy_from_slice(&bytes[start..start + count]);
        Ok(count)
    }
}

impl WriteOffset for MemDisk {
    fn write_at(&self, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        let mut bytes = self.lock();
        let start = usize::min(offset as usize, bytes.len());
        let count = usize::min(buffer.len(), bytes.len() - start);
        bytes[start..start + count].copy_from_slice(&buffer[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_round_trip() {
        let disk = MemDisk::new(1024);
        disk.write_all_at(500, b"redsea").unwrap();

        let mut buffer = [0u8; 6];
        disk.read_exact_at(500, &mut buffer).unwrap();
        assert_eq!(&buffer, b"redsea");
    }

    #[test]
    fn short_read_at_end_of_device() {
        let disk = MemDisk::new(512);
        let mut buffer = [0u8; 16];
        assert_eq!(disk.read_at(508, &mut buffer).unwrap(), 4);
        assert_eq!(disk.read_at(512, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn read_exact_past_end_fails() {
        let disk = MemDisk::new(512);
        let mut buffer = [0u8; 16];
        let err = disk.read_exact_at(504, &mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn write_past_end_refuses_to_grow() {
        let disk = MemDisk::new(512);
        let err = disk.write_all_at(512, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(disk.len(), 512);
    }
}
