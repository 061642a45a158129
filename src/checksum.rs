use core::fmt::Display;

use crc32fast::Hasher;

/// Fold `bytes` into a CRC32 state left by earlier chunks.
///
/// Folding chunk after chunk in transmission order yields the CRC32 of their
/// concatenation, which is what chained per-chunk CRC fields carry.
pub fn update(previous: u32, bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(previous);
    hasher.update(bytes);
    hasher.finalize()
}

pub fn crc32(bytes: &[u8]) -> u32 {
    update(0, bytes)
}

/// Running CRC of one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RunningCrc(u32);

impl RunningCrc {
    pub fn new() -> Self {
        Self(0)
    }

    /// Seed the accumulator with bytes that were already exchanged.
    pub fn seeded(prefix: &[u8]) -> Self {
        Self(crc32(prefix))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The value the accumulator would hold after `bytes`, without
    /// committing it.
    pub fn peek(&self, bytes: &[u8]) -> u32 {
        update(self.0, bytes)
    }

    pub fn advance(&mut self, bytes: &[u8]) -> u32 {
        self.0 = update(self.0, bytes);
        log::trace!("running crc advanced to {:#010x}", self.0);
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

impl Display for RunningCrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&b"0123456789"[..], 5)]
    #[case(&b"0123456789"[..], 1)]
    #[case(&b"hello, wearable"[..], 7)]
    fn chained_folds_match_whole_buffer(
        #[case] data: &[u8],
        #[case] split: usize,
    ) {
        let mut running = RunningCrc::new();
        for chunk in data.chunks(split) {
            running.advance(chunk);
        }
        assert_eq!(running.value(), crc32fast::hash(data));
    }

    #[test]
    fn order_matters() {
        let forward = update(update(0, b"01234"), b"56789");
        let reversed = update(update(0, b"56789"), b"01234");
        assert_eq!(forward, crc32(b"0123456789"));
        assert_ne!(forward, reversed);
    }

    #[test]
    fn peek_does_not_commit() {
        let mut running = RunningCrc::new();
        let peeked = running.peek(b"abc");
        assert_eq!(running.value(), 0);
        assert_eq!(running.advance(b"abc"), peeked);
    }

    #[test]
    fn seeded_equals_advanced() {
        let mut running = RunningCrc::new();
        running.advance(b"prefix");
        assert_eq!(RunningCrc::seeded(b"prefix"), running);
    }
}
