//! 共享缓冲区的区间分配器（首次适配 + 相邻空闲区间合并）

use std::ops::Range;

#[derive(Debug, Default)]
pub(crate) struct RangeAllocator {
    /// 按起点排序、互不相邻的空闲区间
    free: Vec<Range<usize>>,
    end: usize,
}

impl RangeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已使用的最高位置（缓冲区至少需要这么长）
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn allocate(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }

        if let Some(slot) = self.free.iter().position(|r| r.len() >= len) {
            let start = self.free[slot].start;
            if self.free[slot].len() == len {
                self.free.remove(slot);
            } else {
                self.free[slot].start += len;
            }
            return start;
        }

        let start = self.end;
        self.end += len;
        start
    }

    pub fn release(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        debug_assert!(range.end <= self.end, "releasing range {:?} beyond end {}", range, self.end);

        let slot = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(slot, range);

        // 与后一个区间合并
        if slot + 1 < self.free.len() && self.free[slot].end == self.free[slot + 1].start {
            let next = self.free.remove(slot + 1);
            self.free[slot].end = next.end;
        }
        // 与前一个区间合并
        if slot > 0 && self.free[slot - 1].end == self.free[slot].start {
            let current = self.free.remove(slot);
            self.free[slot - 1].end = current.end;
        }

        // 末尾的空闲区间直接归还
        if let Some(last) = self.free.last() {
            if last.end == self.end {
                self.end = last.start;
                self.free.pop();
            }
        }
    }

    pub fn free_len(&self) -> usize {
        self.free.iter().map(|r| r.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut alloc = RangeAllocator::new();
        assert_eq!(alloc.allocate(3), 0);
        assert_eq!(alloc.allocate(5), 3);
        assert_eq!(alloc.end(), 8);
        assert_eq!(alloc.allocate(0), 0);
        assert_eq!(alloc.end(), 8);
    }

    #[test]
    fn test_reuse_first_fit() {
        let mut alloc = RangeAllocator::new();
        let a = alloc.allocate(4);
        let _b = alloc.allocate(4);
        alloc.release(a..a + 4);
        assert_eq!(alloc.free_len(), 4);
        assert_eq!(alloc.allocate(2), 0);
        assert_eq!(alloc.allocate(2), 2);
        assert_eq!(alloc.free_len(), 0);
        assert_eq!(alloc.allocate(1), 8);
    }

    #[test]
    fn test_coalesce_and_shrink_tail() {
        let mut alloc = RangeAllocator::new();
        let a = alloc.allocate(2);
        let b = alloc.allocate(3);
        let c = alloc.allocate(4);
        alloc.release(a..a + 2);
        alloc.release(b..b + 3);
        assert_eq!(alloc.free_len(), 5);
        assert_eq!(alloc.allocate(5), 0);
        alloc.release(0..5);
        alloc.release(c..c + 4);
        assert_eq!(alloc.end(), 0);
        assert_eq!(alloc.free_len(), 0);
    }
}
