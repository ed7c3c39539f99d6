//! Core module: coordination primitives shared by every worker
//!
//! Design principles:
//! - Blocking, never spinning: waits park on condition variables or semaphores
//! - Pre-allocated: buffer slots and journal space are reserved at init
//! - Explicit sharing: only the named semaphore and the journal mapping are
//!   visible across a fork

pub mod admission;
mod bounded_buffer;
mod mmap_journal;

#[cfg(target_os = "linux")]
pub use admission::NamedAdmission;
pub use admission::{Admission, AdmissionError, LocalAdmission, Permit};
pub use bounded_buffer::{BoundedBuffer, PutError};
pub use mmap_journal::{MmapJournal, MIN_JOURNAL_CAPACITY};
