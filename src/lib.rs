//! Intrusive block headers, the building block of a heap allocator.
//!
//! A region of memory is carved into a chain of blocks. Each block starts
//! with a two-pointer [`Block`] header holding the address of the next header
//! and of the previous one; sizes are never stored, they follow from the
//! distance to the next header. The in-use and last flags live in the low
//! bits of the next pointer.
//!
//! Deciding which block to hand out is left to the allocator built on top.
//! This crate only initializes a region, reports sizes and flags, and splits
//! and merges blocks.
//!
//! ```
//! use block_header::{Block, BlockError};
//!
//! #[repr(align(16))]
//! struct Arena([u8; 256]);
//!
//! let mut arena = Arena([0; 256]);
//! let mut head = Block::init(&mut arena.0)?;
//! let mut tail = head.split(32)?;
//! assert_eq!(head.inner_size(), 32);
//! assert!(tail.last());
//!
//! tail.mark_used();
//! let (mut tail, err) = head.merge_next(tail).unwrap_err();
//! assert_eq!(err, BlockError::FailedPrecondition);
//!
//! tail.mark_free();
//! head.merge_next(tail).map_err(|(_, err)| err)?;
//! assert_eq!(head.outer_size(), 256);
//! # Ok::<(), BlockError>(())
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![allow(unstable_name_collisions)]

/// The block header and its handle
mod block;
mod error;
mod flags;
pub mod walk;

pub use block::{Block, BlockRef, ALIGNMENT, HEADER_SIZE};
pub use error::{BlockError, BlockStatus};
pub use flags::BlockFlags;
