//! Per-task bookkeeping of address ranges still awaiting delivery

use crate::images::VmaEntry;
use crate::pageread::PageRead;

/// Half-open range `[base, base + len)` of virtual addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub base: u64,
    pub len: u64,
}

impl Interval {
    pub fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// Ordered, non-overlapping set of undelivered ranges. At any moment the
/// union of the set equals the still-undelivered subset of the task's
/// lazy pages.
#[derive(Debug, Default)]
pub struct LazyIntervals {
    iovs: Vec<Interval>,
    max_len: u64,
}

impl LazyIntervals {
    /// Build the interval set from the lazy pagemap records. Intervals
    /// generally correspond to lazy pagemap entries, except when a single
    /// entry covers several VMAs: those are split at VMA boundaries
    /// because UFFDIO_COPY may be done only inside a single VMA.
    /// Pagemaps and VMAs are assumed sorted.
    ///
    /// Returns the set and the total number of lazy pages.
    pub fn collect(pr: &mut dyn PageRead, vmas: &[VmaEntry]) -> (Self, u64) {
        let mut iovs = Vec::new();
        let mut max_len = 0u64;
        let mut nr_pages = 0u64;
        let mut n_vma = 0usize;

        pr.reset();
        while let Some(pe) = pr.advance() {
            if !pe.is_lazy() {
                continue;
            }

            let mut start = pe.vaddr;
            let end = pe.end();
            nr_pages += pe.nr_pages as u64;

            while n_vma < vmas.len() {
                let vma = vmas[n_vma];
                if start >= vma.end {
                    n_vma += 1;
                    continue;
                }

                let len = end.min(vma.end) - start;
                iovs.push(Interval { base: start, len });
                max_len = max_len.max(len);

                if end <= vma.end {
                    break;
                }
                start = vma.end;
                n_vma += 1;
            }
        }

        (Self { iovs, max_len }, nr_pages)
    }

    /// Trim `[addr, addr + len)` out of the set after delivery. Bytes
    /// outside any interval are ignored; a range strictly inside an
    /// interval splits it in two; an interval reduced to zero length is
    /// removed.
    pub fn deliver(&mut self, mut addr: u64, mut len: u64) {
        let mut i = 0;
        while i < self.iovs.len() && len > 0 {
            let start = self.iovs[i].base;
            let end = self.iovs[i].end();

            if addr < start || addr >= end {
                i += 1;
                continue;
            }

            if addr + len < end {
                if addr == start {
                    self.iovs[i].base += len;
                    self.iovs[i].len -= len;
                } else {
                    self.iovs[i].len = addr - start;
                    self.iovs.insert(
                        i + 1,
                        Interval {
                            base: addr + len,
                            len: end - (addr + len),
                        },
                    );
                }
                return;
            }

            if addr == start {
                self.iovs.remove(i);
            } else {
                self.iovs[i].len = addr - start;
                i += 1;
            }

            len -= end - addr;
            addr = end;
        }
    }

    /// Longest single interval observed at collection time; sizes the
    /// per-task scratch buffer
    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.iovs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iovs.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<Interval> {
        self.iovs.get(i).copied()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.iovs.iter()
    }

    /// Total undelivered bytes
    pub fn total_len(&self) -> u64 {
        self.iovs.iter().map(|iov| iov.len).sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{page_size, PagemapEntry, PE_LAZY, PE_ZERO};
    use anyhow::Result;

    /// Pagemap-only reader; collect never touches content
    struct StubReader {
        entries: Vec<PagemapEntry>,
        cur: Option<usize>,
    }

    impl StubReader {
        fn new(entries: Vec<PagemapEntry>) -> Self {
            Self { entries, cur: None }
        }
    }

    impl PageRead for StubReader {
        fn advance(&mut self) -> Option<PagemapEntry> {
            let next = self.cur.map_or(0, |i| i + 1);
            if next >= self.entries.len() {
                return None;
            }
            self.cur = Some(next);
            Some(self.entries[next])
        }

        fn reset(&mut self) {
            self.cur = None;
        }

        fn seek_pagemap(&mut self, _addr: u64) -> Option<PagemapEntry> {
            unimplemented!("collect only walks the pagemap")
        }

        fn skip_pages(&mut self, _bytes: u64) {
            unimplemented!("collect only walks the pagemap")
        }

        fn read_pages(
            &mut self,
            _addr: u64,
            _nr: usize,
            _buf: &mut [u8],
            _flags: u32,
        ) -> Result<usize> {
            unimplemented!("collect only walks the pagemap")
        }
    }

    fn lazy(vaddr: u64, nr_pages: u32) -> PagemapEntry {
        PagemapEntry {
            vaddr,
            nr_pages,
            flags: PE_LAZY,
        }
    }

    fn assert_sorted_nonoverlapping(set: &LazyIntervals) {
        let iovs: Vec<_> = set.iter().copied().collect();
        for pair in iovs.windows(2) {
            assert!(pair[0].end() <= pair[1].base, "overlap in {:?}", iovs);
        }
    }

    #[test]
    fn test_collect_single_entry_single_vma() {
        let ps = page_size();
        let vmas = [VmaEntry {
            start: 0x1000,
            end: 0x1000 + 4 * ps,
        }];
        let mut pr = StubReader::new(vec![lazy(0x1000, 1)]);

        let (set, total) = LazyIntervals::collect(&mut pr, &vmas);
        assert_eq!(total, 1);
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get(0).unwrap(),
            Interval {
                base: 0x1000,
                len: ps
            }
        );
        assert_eq!(set.max_len(), ps);
    }

    #[test]
    fn test_collect_splits_at_vma_boundary() {
        // A pagemap entry spanning two adjacent VMAs must be serviced as
        // two independent installs
        let ps = page_size();
        let vmas = [
            VmaEntry {
                start: ps,
                end: 2 * ps,
            },
            VmaEntry {
                start: 2 * ps,
                end: 3 * ps,
            },
        ];
        let mut pr = StubReader::new(vec![lazy(ps, 2)]);

        let (set, total) = LazyIntervals::collect(&mut pr, &vmas);
        assert_eq!(total, 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).unwrap(), Interval { base: ps, len: ps });
        assert_eq!(
            set.get(1).unwrap(),
            Interval {
                base: 2 * ps,
                len: ps
            }
        );
        assert_sorted_nonoverlapping(&set);
    }

    #[test]
    fn test_collect_skips_non_lazy_entries() {
        let ps = page_size();
        let vmas = [VmaEntry {
            start: 0,
            end: 16 * ps,
        }];
        let mut pr = StubReader::new(vec![
            PagemapEntry {
                vaddr: 0,
                nr_pages: 2,
                flags: 0,
            },
            lazy(4 * ps, 1),
            PagemapEntry {
                vaddr: 8 * ps,
                nr_pages: 1,
                flags: PE_LAZY | PE_ZERO,
            },
        ]);

        let (set, total) = LazyIntervals::collect(&mut pr, &vmas);
        // Zero entries are still lazy coverage; plain entries are not
        assert_eq!(total, 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).unwrap().base, 4 * ps);
        assert_eq!(set.get(1).unwrap().base, 8 * ps);
    }

    #[test]
    fn test_collect_tracks_max_interval_len() {
        let ps = page_size();
        let vmas = [VmaEntry {
            start: 0,
            end: 64 * ps,
        }];
        let mut pr = StubReader::new(vec![lazy(0, 1), lazy(4 * ps, 8), lazy(32 * ps, 2)]);

        let (set, total) = LazyIntervals::collect(&mut pr, &vmas);
        assert_eq!(total, 11);
        assert_eq!(set.max_len(), 8 * ps);
    }

    fn set_of(iovs: &[(u64, u64)]) -> LazyIntervals {
        LazyIntervals {
            iovs: iovs
                .iter()
                .map(|&(base, len)| Interval { base, len })
                .collect(),
            max_len: iovs.iter().map(|&(_, len)| len).max().unwrap_or(0),
        }
    }

    #[test]
    fn test_deliver_whole_interval_unlinks_it() {
        let ps = page_size();
        let mut set = set_of(&[(ps, 2 * ps), (8 * ps, ps)]);

        set.deliver(ps, 2 * ps);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).unwrap().base, 8 * ps);
        assert_sorted_nonoverlapping(&set);
    }

    #[test]
    fn test_deliver_head_advances_base() {
        let ps = page_size();
        let mut set = set_of(&[(ps, 3 * ps)]);

        set.deliver(ps, ps);
        assert_eq!(
            set.get(0).unwrap(),
            Interval {
                base: 2 * ps,
                len: 2 * ps
            }
        );
    }

    #[test]
    fn test_deliver_middle_splits() {
        let ps = page_size();
        let mut set = set_of(&[(ps, 3 * ps)]);

        set.deliver(2 * ps, ps);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).unwrap(), Interval { base: ps, len: ps });
        assert_eq!(
            set.get(1).unwrap(),
            Interval {
                base: 3 * ps,
                len: ps
            }
        );
        assert_sorted_nonoverlapping(&set);
    }

    #[test]
    fn test_deliver_tail_trims() {
        let ps = page_size();
        let mut set = set_of(&[(ps, 3 * ps)]);

        set.deliver(3 * ps, ps);
        assert_eq!(
            set.get(0).unwrap(),
            Interval {
                base: ps,
                len: 2 * ps
            }
        );
    }

    #[test]
    fn test_deliver_spans_adjacent_intervals() {
        // Two intervals produced by a VMA split are contiguous; a single
        // delivery crossing the boundary trims both
        let ps = page_size();
        let mut set = set_of(&[(ps, ps), (2 * ps, ps)]);

        set.deliver(ps, 2 * ps);
        assert!(set.is_empty());
    }

    #[test]
    fn test_deliver_outside_any_interval_is_ignored() {
        let ps = page_size();
        let mut set = set_of(&[(4 * ps, ps)]);

        set.deliver(ps, ps);
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_len(), ps);
    }

    #[test]
    fn test_deliver_is_idempotent_per_range() {
        // A raced second delivery of the same page must not trim twice
        let ps = page_size();
        let mut set = set_of(&[(ps, 2 * ps)]);

        set.deliver(ps, ps);
        let after_first = set.total_len();
        set.deliver(ps, ps);
        assert_eq!(set.total_len(), after_first);
    }

    #[test]
    fn test_coverage_is_reduced_exactly_once() {
        let ps = page_size();
        let mut set = set_of(&[(ps, 4 * ps), (16 * ps, 2 * ps)]);
        let initial = set.total_len();

        let deliveries = [(ps, ps), (3 * ps, ps), (16 * ps, 2 * ps), (2 * ps, ps)];
        let mut delivered = 0;
        for &(addr, len) in &deliveries {
            set.deliver(addr, len);
            delivered += len;
            assert_eq!(set.total_len(), initial - delivered);
            assert_sorted_nonoverlapping(&set);
        }

        set.deliver(4 * ps, ps);
        assert!(set.is_empty());
    }
}
