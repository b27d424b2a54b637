use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::{fmt, slice};

use log::{debug, trace};
use sptr::Strict;

use crate::error::{BlockError, BlockStatus};
use crate::flags::BlockFlags;

/// The size of a block header
pub const HEADER_SIZE: usize = size_of::<Block>();

/// The alignment of every block header, and the granularity block sizes are
/// rounded to
pub const ALIGNMENT: usize = align_of::<Block>();

// the flag bits must fit below the alignment
const _: () = assert!(ALIGNMENT > BlockFlags::all().bits());

/// The header placed at the start of every block in a chain.
///
/// ```text
///  +------------------+------+-----------------+------+------+-----------
///  | Next             | Prev | usable space    | Next | Prev | usable ...
///  +-------+----+-----+------+-----------------+------+------+-----------
///  | addr  |Last|Used |
///  +-------+----+-----+
/// ```
///
/// A block does not store its size: its end is the address in `next` with
/// the two flag bits masked off. The first block of a chain has a null
/// `prev`, the last one has the [`BlockFlags::LAST`] bit set.
///
/// Headers live inside the memory they describe and are only ever reached
/// through a [`BlockRef`] or a raw pointer, never moved or copied.
#[repr(C)]
pub struct Block {
    next: *mut Block,
    prev: *mut Block,
}

impl Block {
    /// Create the first block of the given region, spanning all of it.
    ///
    /// The start of `region` must be aligned to [`ALIGNMENT`]. The length is
    /// rounded down to a multiple of [`ALIGNMENT`] and must still hold at
    /// least one header; a region of exactly one header gives a block with no
    /// usable space.
    ///
    /// Returns [`BlockError::InvalidArgument`] if the region is misaligned or
    /// too small, nothing is written in that case.
    pub fn init(region: &mut [u8]) -> Result<BlockRef<'_>, BlockError> {
        let start = region.as_mut_ptr();
        if start.addr() % ALIGNMENT != 0 {
            debug!("region at {:p} is not aligned to {}", start, ALIGNMENT);
            return Err(BlockError::InvalidArgument);
        }

        let len = round_down(region.len(), ALIGNMENT);
        if len < HEADER_SIZE {
            debug!("region of {} bytes cannot hold a header", region.len());
            return Err(BlockError::InvalidArgument);
        }

        let block = start.cast::<Block>();
        // SAFETY: `block` is aligned and at least `HEADER_SIZE` bytes of the
        // region follow it, `start + len` is at most one past its end
        unsafe {
            let end = start.add(len).cast::<Block>();
            block.write(Block {
                next: tag(end, BlockFlags::LAST),
                prev: ptr::null_mut(),
            });
            trace!("init block {:p} spanning {} bytes", block, len);
            Ok(BlockRef::new(NonNull::new_unchecked(block)))
        }
    }
}

/// Reads the `next` field of a header, split into the end address and flags.
///
/// # Safety
///
/// `block` must point to a live header.
pub(crate) unsafe fn unpack_next(block: NonNull<Block>) -> (NonNull<Block>, BlockFlags) {
    let tagged = (*block.as_ptr()).next;
    let (_, flags) = BlockFlags::unpack(tagged.addr());
    let end = tagged.map_addr(|addr| BlockFlags::unpack(addr).0);
    // the end of a block lies past its header, so it is never null
    (NonNull::new_unchecked(end), flags)
}

/// A handle to one live block of a chain inside a region borrowed for `'a`.
///
/// The safe API never hands out two handles to the same header: handles come
/// from [`Block::init`], from [`split`](Self::split), or from the `unsafe`
/// constructors. Operations that destroy a header take the handle to that
/// header by value, so a merged-away block cannot be used again.
///
/// Neighbors are only reachable as raw addresses, see
/// [`next_block`](Self::next_block) and [`prev_block`](Self::prev_block).
pub struct BlockRef<'a> {
    ptr: NonNull<Block>,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> BlockRef<'a> {
    fn new(ptr: NonNull<Block>) -> Self {
        Self {
            ptr,
            _region: PhantomData,
        }
    }

    /// Create a handle from a header address.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live header of a chain whose region stays
    /// borrowed for `'a`, and no other `BlockRef` to the same header may be
    /// alive at the same time.
    pub unsafe fn from_raw(ptr: NonNull<Block>) -> Self {
        Self::new(ptr)
    }

    /// Create a handle from a pointer previously returned by
    /// [`usable_ptr`](Self::usable_ptr).
    ///
    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw) for the header right before `ptr`.
    pub unsafe fn from_usable_space(ptr: NonNull<u8>) -> Self {
        let header = ptr.as_ptr().sub(HEADER_SIZE).cast::<Block>();
        Self::new(NonNull::new_unchecked(header))
    }

    /// The address of this header
    pub fn as_ptr(&self) -> NonNull<Block> {
        self.ptr
    }

    fn tagged_next(&self) -> *mut Block {
        // SAFETY: a handle always points to a live header
        unsafe { (*self.ptr.as_ptr()).next }
    }

    fn set_tagged_next(&mut self, next: *mut Block) {
        // SAFETY: a handle always points to a live header
        unsafe { (*self.ptr.as_ptr()).next = next }
    }

    fn update_flags(&mut self, f: impl FnOnce(&mut BlockFlags)) {
        let next = self.tagged_next().map_addr(|tagged| {
            let (addr, mut flags) = BlockFlags::unpack(tagged);
            f(&mut flags);
            flags.pack(addr)
        });
        self.set_tagged_next(next);
    }

    /// The flag bits stored in `next`
    pub fn flags(&self) -> BlockFlags {
        // SAFETY: a handle always points to a live header
        unsafe { unpack_next(self.ptr).1 }
    }

    /// Size of the block including its header
    pub fn outer_size(&self) -> usize {
        self.next_block().as_ptr().addr() - self.ptr.as_ptr().addr()
    }

    /// Usable bytes inside the block
    pub fn inner_size(&self) -> usize {
        self.outer_size() - HEADER_SIZE
    }

    /// Returns true if the block is handed out to a consumer
    pub fn used(&self) -> bool {
        self.flags().contains(BlockFlags::USED)
    }

    /// Returns true if no header follows this block
    pub fn last(&self) -> bool {
        self.flags().contains(BlockFlags::LAST)
    }

    /// Mark this block as in use
    pub fn mark_used(&mut self) {
        self.update_flags(|flags| flags.insert(BlockFlags::USED));
    }

    /// Mark this block as free
    pub fn mark_free(&mut self) {
        self.update_flags(|flags| flags.remove(BlockFlags::USED));
    }

    /// Mark this block as the last one of the chain
    ///
    /// # Safety
    ///
    /// The LAST bit decides whether split, merge and header checks treat the
    /// end of this block as a live header. The caller must keep it in sync:
    /// only set it when no header of this chain follows the block, and make
    /// sure any block cut off this way is never reached through a handle again.
    pub unsafe fn mark_last(&mut self) {
        self.update_flags(|flags| flags.insert(BlockFlags::LAST));
    }

    /// Clear the last bit
    ///
    /// # Safety
    ///
    /// A live, correctly linked header of the same chain must start at
    /// [`next_block`](Self::next_block), inside the borrowed region.
    pub unsafe fn clear_last(&mut self) {
        self.update_flags(|flags| flags.remove(BlockFlags::LAST));
    }

    /// The address right after this block.
    ///
    /// This is always computable, check [`last`](Self::last) before treating
    /// it as a header.
    pub fn next_block(&self) -> NonNull<Block> {
        // SAFETY: a handle always points to a live header
        unsafe { unpack_next(self.ptr).0 }
    }

    /// The block right before this one, `None` for the first block
    pub fn prev_block(&self) -> Option<NonNull<Block>> {
        // SAFETY: a handle always points to a live header
        NonNull::new(unsafe { (*self.ptr.as_ptr()).prev })
    }

    /// Pointer to the first usable byte, right after the header
    pub fn usable_ptr(&self) -> NonNull<u8> {
        // SAFETY: the header is followed by `inner_size` bytes of the region
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// The usable space of this block
    pub fn usable_space(&mut self) -> &mut [u8] {
        // SAFETY: the bytes between this header and the next one belong to
        // this block alone, and `&mut self` keeps it from being split or
        // merged while the slice lives
        unsafe { slice::from_raw_parts_mut(self.usable_ptr().as_ptr(), self.inner_size()) }
    }

    /// Split this block so it keeps `head_inner_size` usable bytes (rounded up
    /// to [`ALIGNMENT`]) and return a new block made of the remainder.
    ///
    /// The new block takes over this block's successor and last flag.
    ///
    /// This may return the following:
    ///   FailedPrecondition: This block is in use.
    ///   OutOfRange: `head_inner_size` is greater than the current inner size.
    ///   ResourceExhausted: The remainder cannot hold a block header.
    ///
    /// Nothing is written when an error is returned.
    pub fn split(&mut self, head_inner_size: usize) -> Result<BlockRef<'a>, BlockError> {
        if self.used() {
            debug!("cannot split {:p}: block is in use", self.ptr);
            return Err(BlockError::FailedPrecondition);
        }

        let inner_size = self.inner_size();
        if head_inner_size > inner_size {
            debug!(
                "cannot split {:p}: {} bytes requested, {} available",
                self.ptr, head_inner_size, inner_size
            );
            return Err(BlockError::OutOfRange);
        }

        let Some(rounded) = round_up(head_inner_size, ALIGNMENT) else {
            debug!("cannot split {:p}: {} bytes overflow", self.ptr, head_inner_size);
            return Err(BlockError::OutOfRange);
        };
        let head_inner_size = match inner_size.checked_sub(rounded) {
            Some(remainder) if remainder >= HEADER_SIZE => rounded,
            _ => {
                debug!(
                    "cannot split {:p}: no room for a header after {} bytes",
                    self.ptr, head_inner_size
                );
                return Err(BlockError::ResourceExhausted);
            }
        };

        // SAFETY: a handle always points to a live header
        let (end, flags) = unsafe { unpack_next(self.ptr) };
        // SAFETY: `HEADER_SIZE + head_inner_size + HEADER_SIZE <= outer_size`,
        // so the new header is aligned and lies entirely inside this block
        let tail = unsafe {
            let tail = self
                .ptr
                .as_ptr()
                .cast::<u8>()
                .add(HEADER_SIZE + head_inner_size)
                .cast::<Block>();
            tail.write(Block {
                next: tag(end.as_ptr(), flags.intersection(BlockFlags::LAST)),
                prev: self.ptr.as_ptr(),
            });
            NonNull::new_unchecked(tail)
        };
        self.set_tagged_next(tag(tail.as_ptr(), flags.difference(BlockFlags::LAST)));

        let tail = BlockRef::new(tail);
        if !tail.last() {
            // SAFETY: `tail` took over this block's successor, which is live
            unsafe { (*tail.next_block().as_ptr()).prev = tail.ptr.as_ptr() }
        }

        trace!(
            "split {:p}: {} + {} bytes",
            self.ptr,
            self.outer_size(),
            tail.outer_size()
        );
        Ok(tail)
    }

    /// Merge this block with the one that comes after it, consuming the
    /// handle to the block that gets absorbed.
    ///
    /// This may return the following:
    ///   OutOfRange: This is the last block.
    ///   InvalidArgument: `next` is not the block right after this one.
    ///   FailedPrecondition: One of the blocks is in use.
    ///
    /// On error `next` is handed back and nothing is written.
    pub fn merge_next(&mut self, next: BlockRef<'a>) -> Result<(), (BlockRef<'a>, BlockError)> {
        if self.last() {
            debug!("cannot merge {:p}: it is the last block", self.ptr);
            return Err((next, BlockError::OutOfRange));
        }
        if self.next_block() != next.ptr {
            debug!("cannot merge {:p}: {:p} does not follow it", self.ptr, next.ptr);
            return Err((next, BlockError::InvalidArgument));
        }
        if self.used() || next.used() {
            debug!("cannot merge {:p} with {:p}: block in use", self.ptr, next.ptr);
            return Err((next, BlockError::FailedPrecondition));
        }

        // SAFETY: a handle always points to a live header
        let (end, next_flags) = unsafe { unpack_next(next.ptr) };
        let flags = self
            .flags()
            .difference(BlockFlags::LAST)
            .union(next_flags.intersection(BlockFlags::LAST));
        self.set_tagged_next(tag(end.as_ptr(), flags));

        if !next_flags.contains(BlockFlags::LAST) {
            // SAFETY: `next` was not last, so its successor is a live header
            unsafe { (*end.as_ptr()).prev = self.ptr.as_ptr() }
        }

        trace!(
            "merged {:p} into {:p}, now {} bytes",
            next.ptr,
            self.ptr,
            self.outer_size()
        );
        Ok(())
    }

    /// Merge this block into the one that comes before it.
    ///
    /// This block's header is the one destroyed, so the handle is consumed and
    /// `prev` covers both blocks afterwards.
    ///
    /// This may return the following:
    ///   OutOfRange: This is the first block.
    ///   InvalidArgument: `prev` is not the block right before this one.
    ///   FailedPrecondition: One of the blocks is in use.
    ///
    /// On error this handle is handed back and nothing is written.
    pub fn merge_prev(self, prev: &mut BlockRef<'a>) -> Result<(), (BlockRef<'a>, BlockError)> {
        match self.prev_block() {
            None => {
                debug!("cannot merge {:p}: it is the first block", self.ptr);
                Err((self, BlockError::OutOfRange))
            }
            Some(addr) if addr != prev.ptr => {
                debug!("cannot merge {:p}: {:p} does not precede it", self.ptr, prev.ptr);
                Err((self, BlockError::InvalidArgument))
            }
            Some(_) => prev.merge_next(self),
        }
    }

    /// Check that this header is aligned and consistently linked with its
    /// neighbors.
    pub fn check_status(&self) -> Result<(), BlockStatus> {
        if self.ptr.as_ptr().addr() % ALIGNMENT != 0 {
            return Err(BlockStatus::Misaligned);
        }

        if !self.last() {
            // SAFETY: a block that is not last is followed by a live header
            let back = unsafe { (*self.next_block().as_ptr()).prev };
            if back != self.ptr.as_ptr() {
                return Err(BlockStatus::NextMismatched);
            }
        }

        if let Some(prev) = self.prev_block() {
            // SAFETY: a non-null prev always points to a live header
            let (forward, _) = unsafe { unpack_next(prev) };
            if forward != self.ptr {
                return Err(BlockStatus::PrevMismatched);
            }
        }

        Ok(())
    }

    /// Returns true if [`check_status`](Self::check_status) finds nothing wrong
    pub fn is_valid(&self) -> bool {
        self.check_status().is_ok()
    }
}

impl fmt::Debug for BlockRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.ptr)
            .field("outer_size", &self.outer_size())
            .field("inner_size", &self.inner_size())
            .field("used", &self.used())
            .field("last", &self.last())
            .finish()
    }
}

/// Fold `flags` into the low bits of a header address
fn tag(ptr: *mut Block, flags: BlockFlags) -> *mut Block {
    ptr.map_addr(|addr| flags.pack(addr))
}

/// Rounds up to a multiple of `align`, a power of two. `None` on overflow
fn round_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
