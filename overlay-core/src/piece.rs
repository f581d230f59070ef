//! Piece arithmetic: where a file sits inside a piece-split object and which pieces cover a byte window of it.

use std::ops::RangeInclusive;

use crate::range::ByteRange;

/// Default piece size for locally served bags.
pub const DEFAULT_PIECE_SIZE: u32 = 128 * 1024; // 128 KiB

/// Upper bound on concurrent piece fetches for one response.
pub const MAX_PIECE_WORKERS: usize = 12;

/// Location of one file inside a piece-split object.
/// `to_piece_offset` is exclusive: the file's last byte is at `to_piece_offset - 1` of `to_piece`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub from_piece: u32,
    pub from_piece_offset: u32,
    pub to_piece: u32,
    pub to_piece_offset: u32,
    pub size: u64,
}

impl FileSpan {
    /// Span of a file of `size` bytes starting at absolute `offset` in the object.
    pub fn locate(offset: u64, size: u64, piece_size: u32) -> Self {
        let ps = piece_size.max(1) as u64;
        let from_piece = (offset / ps) as u32;
        let from_piece_offset = (offset % ps) as u32;
        if size == 0 {
            return Self {
                from_piece,
                from_piece_offset,
                to_piece: from_piece,
                to_piece_offset: from_piece_offset,
                size,
            };
        }
        let last = offset + size - 1;
        Self {
            from_piece,
            from_piece_offset,
            to_piece: (last / ps) as u32,
            to_piece_offset: (last % ps) as u32 + 1,
            size,
        }
    }

    /// Absolute object offset of the file's first byte.
    pub fn start(&self, piece_size: u32) -> u64 {
        self.from_piece as u64 * piece_size as u64 + self.from_piece_offset as u64
    }
}

/// Number of pieces an object of `total` bytes splits into.
pub fn piece_count(total: u64, piece_size: u32) -> u32 {
    let ps = piece_size.max(1) as u64;
    total.div_ceil(ps) as u32
}

/// Fetch concurrency for a window of `pieces` pieces: one worker plus one per fifty pieces, capped.
pub fn worker_count(pieces: u32) -> usize {
    (1 + pieces as usize / 50).min(MAX_PIECE_WORKERS)
}

/// Contiguous pieces covering a byte window of a file, with the bytes to drop at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWindow {
    pub first: u32,
    pub last: u32,
    /// Bytes skipped at the front of `first`.
    head: usize,
    /// Exclusive end inside `last`.
    tail_end: usize,
}

impl PieceWindow {
    /// Minimal window for `range` (file-relative, already validated against `span.size`).
    pub fn new(span: &FileSpan, piece_size: u32, range: ByteRange) -> Self {
        let ps = piece_size.max(1) as u64;
        let base = span.start(piece_size);
        let abs_from = base + range.from;
        let abs_to = base + range.to;
        Self {
            first: (abs_from / ps) as u32,
            last: (abs_to / ps) as u32,
            head: (abs_from % ps) as usize,
            tail_end: (abs_to % ps) as usize + 1,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.last - self.first + 1
    }

    pub fn indices(&self) -> RangeInclusive<u32> {
        self.first..=self.last
    }

    /// The part of piece `index` that belongs to the window.
    pub fn trim<'a>(&self, index: u32, piece: &'a [u8]) -> &'a [u8] {
        let start = if index == self.first { self.head } else { 0 };
        let end = if index == self.last {
            self.tail_end
        } else {
            piece.len()
        };
        let end = end.min(piece.len());
        &piece[start.min(end)..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn locate_file() {
        let span = FileSpan::locate(3072, 3000, 1024);
        assert_eq!(span.from_piece, 3);
        assert_eq!(span.from_piece_offset, 0);
        assert_eq!(span.to_piece, 5);
        assert_eq!(span.to_piece_offset, 6072 - 5120);
        assert_eq!(span.start(1024), 3072);
    }

    #[test]
    fn locate_file_ending_on_boundary() {
        let span = FileSpan::locate(100, 924, 1024);
        assert_eq!(span.to_piece, 0);
        assert_eq!(span.to_piece_offset, 1024);
    }

    #[test]
    fn locate_empty_file() {
        let span = FileSpan::locate(2048, 0, 1024);
        assert_eq!(span.from_piece, 2);
        assert_eq!(span.to_piece, 2);
        assert_eq!(span.size, 0);
    }

    #[test]
    fn window_skips_uncovered_tail_piece() {
        let span = FileSpan::locate(3072, 3000, 1024);
        let w = PieceWindow::new(&span, 1024, ByteRange { from: 1000, to: 1999 });
        assert_eq!(w.indices(), 3..=4);
        let piece = vec![0u8; 1024];
        let total: usize = w.indices().map(|i| w.trim(i, &piece).len()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn window_inside_one_piece() {
        let span = FileSpan::locate(10, 500, 1024);
        let w = PieceWindow::new(&span, 1024, ByteRange { from: 5, to: 9 });
        assert_eq!(w.piece_count(), 1);
        let piece: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        assert_eq!(w.trim(0, &piece), &piece[15..20]);
    }

    #[test]
    fn short_final_piece_is_clamped() {
        let span = FileSpan::locate(0, 1500, 1024);
        let w = PieceWindow::new(&span, 1024, ByteRange { from: 0, to: 1499 });
        assert_eq!(w.trim(1, &[1u8; 476]).len(), 476);
    }

    #[test]
    fn worker_scaling() {
        assert_eq!(worker_count(1), 1);
        assert_eq!(worker_count(49), 1);
        assert_eq!(worker_count(50), 2);
        assert_eq!(worker_count(10_000), MAX_PIECE_WORKERS);
    }

    #[test]
    fn piece_counts() {
        assert_eq!(piece_count(0, 1024), 0);
        assert_eq!(piece_count(1024, 1024), 1);
        assert_eq!(piece_count(1025, 1024), 2);
    }

    proptest! {
        #[test]
        fn prop_window_reassembles_exact_bytes(
            offset in 0u64..5000,
            size in 1u64..6000,
            piece_size in 1u32..2048,
            a in any::<u64>(),
            b in any::<u64>(),
        ) {
            let object: Vec<u8> = (0..offset + size).map(|i| (i * 31 % 251) as u8).collect();
            let span = FileSpan::locate(offset, size, piece_size);
            let (x, y) = (a % size, b % size);
            let range = ByteRange { from: x.min(y), to: x.max(y) };
            let w = PieceWindow::new(&span, piece_size, range);
            prop_assert!(w.first >= span.from_piece && w.last <= span.to_piece);

            let ps = piece_size as usize;
            let mut out = Vec::new();
            for i in w.indices() {
                let start = i as usize * ps;
                let end = (start + ps).min(object.len());
                out.extend_from_slice(w.trim(i, &object[start..end]));
            }
            let expect = &object[(offset + range.from) as usize..=(offset + range.to) as usize];
            prop_assert_eq!(out.as_slice(), expect);
        }
    }
}
