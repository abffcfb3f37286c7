use kernel_info::memory::VMAP_BBMAP_BITS_MAX;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = VMAP_BBMAP_BITS_MAX / WORD_BITS;

/// Fixed-capacity bitmap over the page slots of one vmap block.
///
/// Only the first `nbits` bits are in use; `nbits` is passed by the caller
/// since all blocks share the same geometry.
#[derive(Clone)]
pub(crate) struct SlotBitmap {
    words: [u64; WORDS],
}

impl SlotBitmap {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    #[inline]
    pub const fn test(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    #[inline]
    const fn set(&mut self, bit: usize) {
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    fn range_is_clear(&self, start: usize, len: usize) -> bool {
        (start..start + len).all(|bit| !self.test(bit))
    }

    fn set_range(&mut self, start: usize, len: usize) {
        for bit in start..start + len {
            self.set(bit);
        }
    }

    /// Find a clear, `2^order`-aligned run of `2^order` bits below `nbits`,
    /// set it and return its first bit.
    pub fn find_free_region(&mut self, nbits: usize, order: u32) -> Option<usize> {
        let len = 1usize << order;
        let pos = (0..nbits)
            .step_by(len)
            .take_while(|pos| pos + len <= nbits)
            .find(|&pos| self.range_is_clear(pos, len))?;
        self.set_range(pos, len);
        Some(pos)
    }

    /// Set the `2^order` bits starting at `pos`. Returns `false`, leaving
    /// the map untouched, if any of them is already set.
    #[must_use]
    pub fn allocate_region(&mut self, pos: usize, order: u32) -> bool {
        let len = 1usize << order;
        if !self.range_is_clear(pos, len) {
            return false;
        }
        self.set_range(pos, len);
        true
    }

    /// Set the first `nbits` bits.
    pub fn fill(&mut self, nbits: usize) {
        self.set_range(0, nbits);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of bits set in `self` but clear in `other`.
    pub fn count_ones_without(&self, other: &Self) -> usize {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & !b).count_ones() as usize)
            .sum()
    }

    /// First and one-past-last set bit below `nbits`, if any bit is set.
    pub fn span(&self, nbits: usize) -> Option<(usize, usize)> {
        let first = (0..nbits).find(|&bit| self.test(bit))?;
        let last = (first..nbits).rev().find(|&bit| self.test(bit))?;
        Some((first, last + 1))
    }
}

impl core::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SlotBitmap({} set)", self.count_ones())
    }
}
