use core::fmt;

/// Reasons a block operation can be rejected.
///
/// Every mutating operation is all-or-nothing: when one of these is returned
/// the chain is exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The region is misaligned or too small, or the neighbor handle handed
    /// to a merge is not the actual neighbor.
    InvalidArgument,
    /// The target lies outside the chain: a split larger than the block, or a
    /// merge past the first or last block.
    OutOfRange,
    /// A participating block is in use.
    FailedPrecondition,
    /// The remainder of a split is too small to hold a header.
    ResourceExhausted,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::OutOfRange => "out of range",
            Self::FailedPrecondition => "block is in use",
            Self::ResourceExhausted => "not enough space for a block header",
        };
        f.write_str(msg)
    }
}

/// An inconsistency found while checking a single header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The header address is not aligned to [`ALIGNMENT`](crate::ALIGNMENT).
    Misaligned,
    /// The successor's prev does not point back at this block.
    NextMismatched,
    /// The predecessor's next does not point at this block.
    PrevMismatched,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Misaligned => "block header is misaligned",
            Self::NextMismatched => "next block does not link back",
            Self::PrevMismatched => "previous block does not link forward",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that errors display a readable message
    #[test]
    fn error_messages() {
        assert_eq!(BlockError::OutOfRange.to_string(), "out of range");
        assert_eq!(
            BlockStatus::PrevMismatched.to_string(),
            "previous block does not link forward"
        );
    }
}
