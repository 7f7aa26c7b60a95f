/// Compact per-index tracking for one transfer.
///
/// The sender marks acknowledged packet indices here; `missing()` yields the
/// indices that still need a resend.

/// Bitfield over `0..total` indices, one bit per index.
#[derive(Debug, Clone)]
pub struct IndexBitfield {
    bits: Vec<u64>,
    total: u32,
    set_count: u32,
}

impl IndexBitfield {
    /// Create an empty bitfield for `total` indices.
    pub fn new(total: u32) -> Self {
        let words = (total as usize).div_ceil(64);
        Self {
            bits: vec![0u64; words],
            total,
            set_count: 0,
        }
    }

    /// Mark an index. Returns true if it was newly set (not a duplicate).
    #[inline]
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        let word = index as usize / 64;
        let mask = 1u64 << (index % 64);
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.set_count += 1;
        true
    }

    #[inline]
    pub fn get(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        self.bits[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.set_count >= self.total
    }

    /// Indices not yet set, in ascending order.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total).filter(|&i| !self.get(i)).collect()
    }
}
