//! Per-transfer chunk tracking using a compact bitset.
//!
//! One bit per chunk id, `total` bits in all. Bits are only ever set, never
//! cleared: both received-chunk tracking and acknowledgement merging are
//! monotonic.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    total: u32,
    set_count: u32,
}

impl ChunkBitmap {
    pub fn new(total: u32) -> Self {
        Self {
            words: vec![0u64; (total as usize).div_ceil(64)],
            total,
            set_count: 0,
        }
    }

    /// Mark a chunk. Returns true if it was newly set. Out-of-range ids are
    /// ignored.
    #[inline]
    pub fn set(&mut self, chunk: u32) -> bool {
        if chunk >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(chunk);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.set_count += 1;
        true
    }

    #[inline]
    pub fn get(&self, chunk: u32) -> bool {
        if chunk >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(chunk);
        self.words[word] & mask != 0
    }

    /// OR a peer's 64-bit selective ACK into bits 0..63. Bits beyond `total`
    /// are ignored. Returns how many chunks became newly set.
    pub fn merge_first_word(&mut self, bits: u64) -> u32 {
        if self.words.is_empty() {
            return 0;
        }
        let valid = if self.total >= 64 {
            u64::MAX
        } else {
            (1u64 << self.total) - 1
        };
        let fresh = bits & valid & !self.words[0];
        self.words[0] |= fresh;
        self.set_count += fresh.count_ones();
        fresh.count_ones()
    }

    /// Bits 0..63 as a selective-ACK word.
    pub fn first_word(&self) -> u64 {
        self.words.first().copied().unwrap_or(0)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.set_count == self.total
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.set_count
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[inline]
    pub fn missing_count(&self) -> u32 {
        self.total - self.set_count
    }

    /// Ids of every chunk not yet set, ascending. Skips full words, so a
    /// nearly complete transfer costs one pass over `total / 64` words.
    pub fn missing(&self) -> Vec<u32> {
        let mut missing = Vec::with_capacity(self.missing_count() as usize);
        for (w, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let base = (w * 64) as u32;
            let mut holes = !word;
            while holes != 0 {
                let chunk = base + holes.trailing_zeros();
                if chunk >= self.total {
                    break;
                }
                missing.push(chunk);
                holes &= holes - 1;
            }
        }
        missing
    }

    #[inline]
    fn locate(chunk: u32) -> (usize, u64) {
        ((chunk / 64) as usize, 1u64 << (chunk % 64))
    }
}
