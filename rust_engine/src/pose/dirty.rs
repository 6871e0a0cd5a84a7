//! 每骨骼一位的世界姿态脏标记

use smallvec::{smallvec, SmallVec};

const WORD_BITS: usize = 64;

/// 256 个骨骼以内不分配堆内存
#[derive(Clone, Debug)]
pub(crate) struct DirtyFlags {
    words: SmallVec<[u64; 4]>,
    len: usize,
}

impl DirtyFlags {
    pub fn new(len: usize) -> Self {
        Self {
            words: smallvec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn new_all_set(len: usize) -> Self {
        let mut flags = Self::new(len);
        flags.set_all();
        flags
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check_index(&self, index: usize) {
        assert!(index < self.len, "bit index {} out of range (len {})", index, self.len);
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.check_index(index);
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    pub fn set(&mut self, index: usize) {
        self.check_index(index);
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        self.check_index(index);
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    pub fn set_all(&mut self) {
        for word in self.words.iter_mut() {
            *word = u64::MAX;
        }
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
    }

    /// 清除 `[0, end)` 范围内的所有位
    pub fn clear_prefix(&mut self, end: usize) {
        let end = end.min(self.len);
        let full = end / WORD_BITS;
        for word in &mut self.words[..full] {
            *word = 0;
        }
        let tail = end % WORD_BITS;
        if tail != 0 {
            self.words[full] &= !((1u64 << tail) - 1);
        }
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// 按索引递增顺序返回 `[0, end)` 内置位的索引
    pub fn iter_set_before(&self, end: usize) -> impl Iterator<Item = usize> + '_ {
        let end = end.min(self.len);
        self.words
            .iter()
            .enumerate()
            .take(end.div_ceil(WORD_BITS))
            .flat_map(move |(w, &word)| {
                let mut bits = word;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(w * WORD_BITS + bit)
                })
            })
            .take_while(move |&i| i < end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut flags = DirtyFlags::new(70);
        assert!(!flags.any());
        flags.set(3);
        flags.set(65);
        assert!(flags.is_set(3));
        assert!(flags.is_set(65));
        assert!(!flags.is_set(64));
        flags.clear(3);
        assert!(!flags.is_set(3));
        assert_eq!(flags.count(), 1);
    }

    #[test]
    fn test_all_set_respects_length() {
        let flags = DirtyFlags::new_all_set(70);
        assert_eq!(flags.count(), 70);
        assert_eq!(flags.len(), 70);
    }

    #[test]
    #[should_panic]
    fn test_index_past_len_within_word_panics() {
        let flags = DirtyFlags::new(1);
        flags.is_set(10);
    }

    #[test]
    #[should_panic]
    fn test_set_past_len_panics() {
        let mut flags = DirtyFlags::new(3);
        flags.set(3);
    }

    #[test]
    fn test_clear_prefix() {
        let mut flags = DirtyFlags::new_all_set(130);
        flags.clear_prefix(66);
        assert!(!flags.is_set(65));
        assert!(flags.is_set(66));
        assert_eq!(flags.count(), 130 - 66);
        flags.clear_prefix(500);
        assert!(!flags.any());
    }

    #[test]
    fn test_iter_set_is_ordered_and_bounded() {
        let mut flags = DirtyFlags::new(200);
        for i in [150, 2, 64, 63, 199] {
            flags.set(i);
        }
        let below: Vec<usize> = flags.iter_set_before(151).collect();
        assert_eq!(below, vec![2, 63, 64, 150]);
        let all: Vec<usize> = flags.iter_set_before(200).collect();
        assert_eq!(all, vec![2, 63, 64, 150, 199]);
    }
}
