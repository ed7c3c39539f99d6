//! Memory-Mapped Append-Only Journal
//!
//! The journal file is mapped `MAP_SHARED`, so:
//! - Appends from forked workers land in the same page cache as the parent's
//! - Space is reserved with an atomic fetch-add on the mapped header, two
//!   writers never get overlapping ranges even across processes
//! - The file only grows: reopening resumes after the recorded length and
//!   nothing is ever truncated

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Header at the start of the mapping
#[repr(C, align(64))]
struct JournalHeader {
    magic: u64,          // Identifies a turnstile journal
    version: u32,        // Format version
    _reserved: u32,      // Padding, always zero
    capacity: u64,       // Payload bytes after the header
    write_pos: AtomicU64, // Bytes reserved so far (may overshoot capacity once full)
}

const MAGIC: u64 = 0x5455_524E_4A52_4E4C; // "TURNJRNL"
const VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<JournalHeader>();

/// Smallest payload capacity accepted by [`MmapJournal::open`].
pub const MIN_JOURNAL_CAPACITY: usize = 4096;

/// Refuse to map (and grow) a file that is not one of ours.
fn check_header(file: &File, existing_len: usize) -> io::Result<()> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "existing file is not a turnstile journal",
        )
    };

    if existing_len < HEADER_SIZE {
        return Err(invalid());
    }

    let mut raw = [0u8; 12];
    let mut reader = file;
    reader.read_exact(&mut raw)?;

    let magic = u64::from_ne_bytes(raw[..8].try_into().map_err(|_| invalid())?);
    let version = u32::from_ne_bytes(raw[8..].try_into().map_err(|_| invalid())?);
    if magic != MAGIC || version != VERSION {
        return Err(invalid());
    }
    Ok(())
}

/// Fixed-capacity append-only journal backed by a shared file mapping.
pub struct MmapJournal {
    // Keeps the mapping alive; all access goes through `base`.
    mmap: MmapMut,
    base: *mut u8,
    capacity: usize,
}

// SAFETY: MmapJournal is Send/Sync because:
// - the header is only touched through atomics after initialization
// - each append writes exclusively into the range it reserved
unsafe impl Send for MmapJournal {}
unsafe impl Sync for MmapJournal {}

impl MmapJournal {
    /// Create or reopen a journal.
    ///
    /// # Arguments
    /// * `path` - Journal file path
    /// * `capacity` - Payload capacity in bytes for a new journal (an
    ///   existing journal keeps the capacity it was created with)
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> io::Result<Self> {
        if capacity < MIN_JOURNAL_CAPACITY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("journal capacity must be at least {MIN_JOURNAL_CAPACITY} bytes"),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing_len = file.metadata()?.len() as usize;
        let fresh = existing_len == 0;
        if !fresh {
            check_header(&file, existing_len)?;
        }

        let requested_len = HEADER_SIZE + capacity;
        if existing_len < requested_len {
            // Growing only: set_len never shrinks here.
            file.set_len(requested_len as u64)?;
        }
        let map_len = existing_len.max(requested_len);

        // SAFETY: the file is open read/write and at least `map_len` long.
        let mut mmap = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        // SAFETY: the mapping is page aligned and longer than the header.
        let header = unsafe { &mut *(base as *mut JournalHeader) };

        let capacity = if fresh {
            header.magic = MAGIC;
            header.version = VERSION;
            header._reserved = 0;
            header.capacity = capacity as u64;
            header.write_pos = AtomicU64::new(0);
            capacity
        } else {
            (header.capacity as usize).min(map_len - HEADER_SIZE)
        };

        Ok(Self {
            mmap,
            base,
            capacity,
        })
    }

    #[inline(always)]
    fn header(&self) -> &JournalHeader {
        // SAFETY: header lives at the start of the mapping for its lifetime.
        unsafe { &*(self.base as *const JournalHeader) }
    }

    /// Append `data`, returning the payload offset it was written at.
    ///
    /// Fails with `StorageFull` once the reserved range would pass the
    /// capacity; the journal stays full from then on.
    #[inline]
    pub fn append(&self, data: &[u8]) -> io::Result<usize> {
        let len = data.len() as u64;
        let offset = self.header().write_pos.fetch_add(len, Ordering::AcqRel);

        if offset + len > self.capacity as u64 {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "journal capacity exhausted",
            ));
        }

        // SAFETY: [offset, offset + len) was reserved exclusively above and
        // lies inside the payload area.
        unsafe {
            let dst = self.base.add(HEADER_SIZE + offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(offset as usize)
    }

    /// Bytes appended so far.
    #[inline]
    pub fn len(&self) -> usize {
        (self.header().write_pos.load(Ordering::Acquire) as usize).min(self.capacity)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the payload appended so far.
    pub fn contents(&self) -> Vec<u8> {
        let len = self.len();
        // SAFETY: [0, len) is inside the payload area.
        unsafe { std::slice::from_raw_parts(self.base.add(HEADER_SIZE), len).to_vec() }
    }

    /// Flush dirty pages to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("turnstile-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_journal_append_basic() {
        let path = temp_path("journal_basic.dat");

        {
            let journal = MmapJournal::open(&path, 4096).unwrap();
            assert_eq!(journal.append(b"Hello, ").unwrap(), 0);
            assert_eq!(journal.append(b"journal!").unwrap(), 7);
            assert_eq!(journal.contents(), b"Hello, journal!");
        }

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_journal_persistence_resumes_append() {
        let path = temp_path("journal_persist.dat");

        {
            let journal = MmapJournal::open(&path, 4096).unwrap();
            journal.append(b"first\n").unwrap();
            journal.flush().unwrap();
        }

        {
            let journal = MmapJournal::open(&path, 8192).unwrap();
            // Existing journal keeps its original capacity.
            assert_eq!(journal.capacity(), 4096);
            journal.append(b"second\n").unwrap();
            assert_eq!(journal.contents(), b"first\nsecond\n");
        }

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_journal_full_is_reported() {
        let path = temp_path("journal_full.dat");

        {
            let journal = MmapJournal::open(&path, 4096).unwrap();
            journal.append(&[b'x'; 4000]).unwrap();
            let err = journal.append(&[b'y'; 200]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::StorageFull);
            assert_eq!(journal.len(), 4096);
        }

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_journal_rejects_foreign_file() {
        let path = temp_path("journal_foreign.dat");
        fs::write(&path, vec![7u8; 128]).unwrap();

        let err = MmapJournal::open(&path, 4096).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // Neither grown nor truncated.
        assert_eq!(fs::read(&path).unwrap(), vec![7u8; 128]);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_journal_concurrent_appends_do_not_overlap() {
        let path = temp_path("journal_concurrent.dat");

        {
            let journal = Arc::new(MmapJournal::open(&path, 64 * 1024).unwrap());
            let writers: Vec<_> = (0..4u8)
                .map(|w| {
                    let journal = Arc::clone(&journal);
                    thread::spawn(move || {
                        for _ in 0..100 {
                            journal.append(&[b'a' + w; 16]).unwrap();
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }

            let contents = journal.contents();
            assert_eq!(contents.len(), 4 * 100 * 16);
            for chunk in contents.chunks(16) {
                assert!(chunk.iter().all(|b| *b == chunk[0]));
            }
        }

        fs::remove_file(&path).ok();
    }
}
