//! Read-only traversal of a block chain, for heap inspection and debugging.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use sptr::Strict;

use crate::block::{unpack_next, Block};
use crate::flags::BlockFlags;

/// A snapshot of one header, taken while walking a chain
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the header
    pub addr: usize,
    /// Size including the header
    pub outer_size: usize,
    /// The block is in use
    pub used: bool,
    /// The block is the last of its chain
    pub last: bool,
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Hex(usize);

        impl fmt::Debug for Hex {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }

        f.debug_struct("Block")
            .field("addr", &Hex(self.addr))
            .field("outer_size", &self.outer_size)
            .field("used", &self.used)
            .field("last", &self.last)
            .finish()
    }
}

/// Iterator over the headers of a chain, see [`walk`]
pub struct Walk<'a> {
    next: Option<NonNull<Block>>,
    _region: PhantomData<&'a [u8]>,
}

/// Walk a chain from `first` up to and including its last block.
///
/// # Safety
///
/// `first` must point to a live header, and the chain must not be split,
/// merged or have its flags changed while the iterator is in use.
pub unsafe fn walk<'a>(first: NonNull<Block>) -> Walk<'a> {
    Walk {
        next: Some(first),
        _region: PhantomData,
    }
}

impl Iterator for Walk<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.next?;
        // SAFETY: `block` is `first` or the successor of a header that is not
        // last, and the chain is left alone while walking
        let (end, flags) = unsafe { unpack_next(block) };
        let info = BlockInfo {
            addr: block.as_ptr().addr(),
            outer_size: end.as_ptr().addr() - block.as_ptr().addr(),
            used: flags.contains(BlockFlags::USED),
            last: flags.contains(BlockFlags::LAST),
        };
        self.next = if info.last { None } else { Some(end) };
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockRef, HEADER_SIZE};
    use test_log::test;

    #[repr(C, align(16))]
    struct Arena([u8; 256]);

    /// Test that walking visits every block in order
    #[test]
    fn walk_lists_every_block() {
        let mut arena = Box::new(Arena([0; 256]));
        let mut a = Block::init(&mut arena.0).unwrap();
        let mut b = a.split(32).unwrap();
        let c = b.split(64).unwrap();
        b.mark_used();

        let infos: Vec<BlockInfo> = unsafe { walk(a.as_ptr()) }.collect();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].addr, a.as_ptr().as_ptr().addr());
        assert_eq!(infos[0].outer_size, HEADER_SIZE + 32);
        assert_eq!(infos[1].outer_size, HEADER_SIZE + 64);
        assert_eq!(infos[2].addr, c.as_ptr().as_ptr().addr());
        assert_eq!(infos.iter().map(|info| info.outer_size).sum::<usize>(), 256);
        assert_eq!(
            infos.iter().map(|info| info.used).collect::<Vec<_>>(),
            [false, true, false]
        );
        assert_eq!(infos.iter().filter(|info| info.last).count(), 1);
        assert!(infos[2].last);
    }

    /// Test that walking sees a merged chain as one block
    #[test]
    fn walk_after_merge() {
        let mut arena = Box::new(Arena([0; 256]));
        let mut a = Block::init(&mut arena.0).unwrap();
        let b = a.split(32).unwrap();
        let ptr = b.as_ptr();
        drop(b);

        // the handle is recovered from the raw address, as a heap would
        let b = unsafe { BlockRef::from_raw(ptr) };
        b.merge_prev(&mut a).unwrap();

        let infos: Vec<BlockInfo> = unsafe { walk(a.as_ptr()) }.collect();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].outer_size, 256);
        assert!(infos[0].last);
    }

    /// Test that block info prints its address in hex
    #[test]
    fn debug_prints_hex_address() {
        let info = BlockInfo {
            addr: 0x1000,
            outer_size: 48,
            used: true,
            last: false,
        };
        let out = format!("{:?}", info);
        assert!(out.contains("addr: 0x1000"));
        assert!(out.contains("used: true"));
    }
}
