//! Two-phase defragmentation: compact every used block to the front of the
//! pool in address order, leaving at most one trailing free block.
//!
//! Between [`Pool::defrag_start`] and [`Pool::defrag_commit`] the pool is
//! "defrag-pending": every used block's `prev` field temporarily holds its
//! post-compaction target offset instead of its true address-order
//! predecessor (see the crate-level documentation for why `prev` is the
//! field that is safe to borrow here). No other `Pool` method may be called
//! in that window; debug builds assert against it.

use core::ptr::NonNull;

use super::buffer::Buffer;
use super::header::{Field, RawHeader, HEADER_SIZE};
use super::{Pool, HEAD_OFFSET};

impl<'a> Pool<'a> {
    /// Whether the pool is between a [`Pool::defrag_start`] and its
    /// matching [`Pool::defrag_commit`].
    pub fn defrag_in_progress(&self) -> bool {
        self.buffer.header_at(HEAD_OFFSET).prev.flag()
    }

    /// Compute every used block's post-compaction address and record it
    /// in-place, without moving any bytes yet.
    ///
    /// The target accounts both for free gaps to the left being closed and
    /// for any padding slack in used blocks to the left being reclaimed —
    /// compaction needs neither.
    ///
    /// No `alloc`/`free`/`defrag_start` call is valid until the matching
    /// [`Pool::defrag_commit`]; [`Pool::defrag_address`] is the only other
    /// operation that may run meanwhile.
    pub fn defrag_start(&mut self) {
        debug_assert!(!self.defrag_in_progress(), "defrag already in progress");

        let tail_offset = self.tail_offset();
        let mut offset = self.buffer.header_at(HEAD_OFFSET).next.byte_offset_unchecked();
        let mut target = HEADER_SIZE;

        while offset != tail_offset {
            let hdr = self.buffer.header_at(offset);
            let next = hdr.next.byte_offset_unchecked();
            if !hdr.is_free() {
                self.retarget_prev(offset, target);
                let savings = if hdr.is_padded() { 4 } else { 0 };
                target += next - offset - savings;
            }
            offset = next;
        }

        let mut head = self.buffer.header_at(HEAD_OFFSET);
        head.prev = head.prev.with_flag(true);
        self.buffer.set_header_at(HEAD_OFFSET, head);
    }

    /// Look up the post-compaction address of a used block's payload
    /// pointer, computed by the pending [`Pool::defrag_start`].
    ///
    /// `ptr == None` maps to `None`. Only valid while defrag is pending.
    pub fn defrag_address(&self, ptr: Option<NonNull<u8>>) -> Option<NonNull<u8>> {
        let ptr = ptr?;
        debug_assert!(self.defrag_in_progress(), "no defrag is pending");

        let offset = self.header_offset_of(ptr);
        let hdr = self.buffer.header_at(offset);
        debug_assert!(!hdr.is_free(), "defrag_address on a free block");

        let target = hdr.prev.byte_offset_unchecked();
        Some(self.payload_ptr_of(target))
    }

    /// Perform the compaction computed by [`Pool::defrag_start`]: relocate
    /// every used block's payload to its target address, relink the
    /// address-order list with no gaps between used blocks, clear every
    /// padded flag (compaction removes the need for the slack), and rebuild
    /// the free-list as at most one trailing free block.
    pub fn defrag_commit(&mut self) {
        debug_assert!(self.defrag_in_progress(), "no defrag is pending");

        let tail_offset = self.tail_offset();
        let mut offset = self.buffer.header_at(HEAD_OFFSET).next.byte_offset_unchecked();
        let mut prev_in_chain = HEAD_OFFSET;
        let mut used_end = HEADER_SIZE;

        while offset != tail_offset {
            let hdr = self.buffer.header_at(offset);
            let next = hdr.next.byte_offset_unchecked();

            if !hdr.is_free() {
                let savings = if hdr.is_padded() { 4 } else { 0 };
                let footprint = next - offset - savings;
                let target = used_end;

                if target != offset {
                    move_used_block(&mut self.buffer, offset, target, footprint);
                }
                self.buffer.set_header_at(
                    target,
                    RawHeader {
                        prev: Field::from_byte_offset(prev_in_chain, false),
                        next: Field::nil_with_flag(false),
                    },
                );
                self.retarget_next(prev_in_chain, target);

                prev_in_chain = target;
                used_end = target + footprint;
            }

            offset = next;
        }

        if used_end < tail_offset {
            self.buffer.set_header_at(
                used_end,
                RawHeader {
                    prev: Field::from_byte_offset(prev_in_chain, true),
                    next: Field::from_byte_offset(tail_offset, false),
                },
            );
            self.buffer.set_free_links_at(used_end, Field::NIL, Field::NIL);
            self.retarget_next(prev_in_chain, used_end);
            self.buffer.set_header_at(
                tail_offset,
                RawHeader {
                    prev: Field::from_byte_offset(used_end, false),
                    next: Field::from_byte_offset(used_end, false),
                },
            );
        } else {
            self.retarget_next(prev_in_chain, tail_offset);
            self.buffer.set_header_at(
                tail_offset,
                RawHeader {
                    prev: Field::from_byte_offset(prev_in_chain, false),
                    next: Field::NIL,
                },
            );
        }

        let mut head = self.buffer.header_at(HEAD_OFFSET);
        head.prev = head.prev.with_flag(false);
        self.buffer.set_header_at(HEAD_OFFSET, head);
    }
}

/// Relocate a used block's payload bytes leftward from `old_offset` to
/// `new_offset`. `footprint` includes the 4-byte header.
fn move_used_block(buf: &mut Buffer<'_>, old_offset: usize, new_offset: usize, footprint: usize) {
    buf.move_payload(old_offset + HEADER_SIZE, new_offset + HEADER_SIZE, footprint - HEADER_SIZE);
}
