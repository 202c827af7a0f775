/// Fixed-capacity circular buffer.
///
/// One physical slot is always left unused so that `datastart == dataend`
/// unambiguously means empty; a buffer built with `capacity` slots holds at
/// most `capacity - 1` elements. When full, pushing evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    datastart: usize,
    dataend: usize,
}

impl<T> RingBuffer<T> {
    /// `capacity` is clamped to at least two slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            datastart: 0,
            dataend: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn wrap(&self, pos: usize) -> usize {
        pos % self.slots.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        (self.dataend + self.slots.len() - self.datastart) % self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.datastart == self.dataend
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.wrap(self.dataend + 1) == self.datastart
    }

    /// Append `value`, returning the entry evicted to make room.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop() } else { None };
        let end = self.dataend;
        self.slots[end] = Some(value);
        self.dataend = self.wrap(end + 1);
        evicted
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let start = self.datastart;
        self.datastart = self.wrap(start + 1);
        self.slots[start].take()
    }

    /// `i`-th entry counted from the oldest.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.size() {
            return None;
        }
        self.slots[self.wrap(self.datastart + i)].as_ref()
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        if i >= self.size() {
            return None;
        }
        let pos = self.wrap(self.datastart + i);
        self.slots[pos].as_mut()
    }

    /// Swap the `i`-th and `j`-th entries counted from the oldest.
    pub fn swap(&mut self, i: usize, j: usize) {
        let size = self.size();
        if i >= size || j >= size {
            return;
        }
        let (a, b) = (self.wrap(self.datastart + i), self.wrap(self.datastart + j));
        self.slots.swap(a, b);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        (0..self.size()).filter_map(|i| self.get(i))
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.datastart = 0;
        self.dataend = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_capacity_minus_one() {
        let mut buf = RingBuffer::new(4);
        assert!(buf.is_empty());
        for i in 0..3 {
            assert_eq!(buf.push(i), None);
        }
        assert!(buf.is_full());
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn full_buffer_evicts_oldest() {
        let mut buf = RingBuffer::new(4);
        for i in 0..3 {
            buf.push(i);
        }
        assert_eq!(buf.push(3), Some(0));
        assert_eq!(buf.size(), 3);
        assert!(buf.is_full());
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn predicates_agree_across_wraparound() {
        let mut buf = RingBuffer::new(3);
        // walk both cursors around the physical end several times
        for round in 0..7 {
            buf.push(round);
            assert_eq!(buf.size(), 1);
            assert!(!buf.is_empty());
            assert!(!buf.is_full());
            buf.push(round + 100);
            assert!(buf.is_full());
            assert_eq!(buf.pop(), Some(round));
            assert_eq!(buf.pop(), Some(round + 100));
            assert!(buf.is_empty());
            assert_eq!(buf.size(), 0);
        }
    }

    #[test]
    fn eviction_wraps_both_cursors() {
        let mut buf = RingBuffer::new(3);
        for i in 0..10 {
            buf.push(i);
        }
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.get(0), Some(&8));
        assert_eq!(buf.get(1), Some(&9));
        assert_eq!(buf.get(2), None);
        assert_eq!(buf.iter().rev().copied().collect::<Vec<_>>(), vec![9, 8]);
    }

    #[test]
    fn swap_by_logical_position() {
        let mut buf = RingBuffer::new(4);
        for i in 0..5 {
            buf.push(i);
        }
        buf.swap(0, 2);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![4, 3, 2]);
    }
}
