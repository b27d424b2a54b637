use bitflags::bitflags;

bitflags! {
    /// State bits packed into the two least significant bits of a block's
    /// `next` pointer. Headers are aligned to at least a pointer, so a real
    /// address never has these bits set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: usize {
        /// The usable space is handed out to a consumer
        const USED = 0b01;
        /// There is no header after this block, `next` only marks its end
        const LAST = 0b10;
    }
}

impl BlockFlags {
    /// Split a tagged address into the plain address and its flags.
    pub(crate) fn unpack(tagged: usize) -> (usize, Self) {
        (
            tagged & !Self::all().bits(),
            Self::from_bits_truncate(tagged),
        )
    }

    /// Fold the flags into the low bits of `addr`.
    pub(crate) fn pack(self, addr: usize) -> usize {
        debug_assert!(addr & Self::all().bits() == 0);
        addr | self.bits()
    }
}
