use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// One line destined for the durable log.
///
/// Immutable once built; the bytes always end with exactly one `\n` and
/// contain no other line break.
#[derive(Clone, PartialEq, Eq)]
pub struct LogRecord {
    bytes: Box<[u8]>,
}

impl LogRecord {
    /// Build a record stamped with wall-clock time and the current PID:
    /// `"<secs>.<millis> [pid <pid>] <message>\n"`.
    pub fn new(message: impl AsRef<str>) -> Self {
        let (secs, millis) = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs(), d.subsec_millis()))
            .unwrap_or((0, 0));

        let line = format!(
            "{}.{:03} [pid {}] {}",
            secs,
            millis,
            std::process::id(),
            message.as_ref()
        );
        Self::raw(line)
    }

    /// Build a record from raw text without a prefix.
    pub fn raw(text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        let trimmed = text.strip_suffix('\n').unwrap_or(text);
        let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);

        let mut bytes = Vec::with_capacity(trimmed.len() + 1);
        for ch in trimmed.chars() {
            match ch {
                '\n' => bytes.extend_from_slice(b"\\n"),
                '\r' => bytes.extend_from_slice(b"\\r"),
                _ => {
                    let mut utf8 = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                }
            }
        }
        bytes.push(b'\n');

        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogRecord")
            .field(&String::from_utf8_lossy(&self.bytes))
            .finish()
    }
}
