use std::cmp::Ordering;

use crate::{
    ELEMS_PER_SEG, Heap, HeapIdx, NO_NEXT, ObjFlags, ObjType, OutOfMemory,
    SegIdx, compare,
};

impl Heap {
    pub fn darray_new(&mut self) -> Result<HeapIdx, OutOfMemory> {
        let idx = self.alloc(ObjType::Table)?;
        self.set_flag(idx, ObjFlags::FLAG_A, true);
        Ok(idx)
    }

    #[inline]
    pub fn is_darray(&self, idx: HeapIdx) -> bool {
        self.obj_type(idx) == ObjType::Table && self.has_flag(idx, ObjFlags::FLAG_A)
    }

    #[inline]
    pub fn is_cloned(&self, idx: HeapIdx) -> bool {
        self.obj_type(idx) == ObjType::Table && self.has_flag(idx, ObjFlags::FLAG_B)
    }

    /// Number of contiguous elements from position 0.
    pub fn darray_size(&self, array: HeapIdx) -> u16 {
        let mut size = 0;
        let mut seg = self.table_head(array);
        while seg != NO_NEXT {
            for slot in 0..ELEMS_PER_SEG {
                if self.seg_elem(seg, slot).is_none() {
                    return size;
                }
                size += 1;
            }
            seg = self.seg_next(seg);
        }
        size
    }

    /// Segment holding `pos`, together with the segment before it.
    fn darray_locate(&self, array: HeapIdx, pos: u16) -> Option<(SegIdx, SegIdx)> {
        let mut prev = NO_NEXT;
        let mut seg = self.table_head(array);
        for _ in 0..(pos as usize / ELEMS_PER_SEG) {
            if seg == NO_NEXT {
                return None;
            }
            prev = seg;
            seg = self.seg_next(seg);
        }
        (seg != NO_NEXT).then_some((prev, seg))
    }

    pub fn darray_get(&self, array: HeapIdx, pos: u16) -> Option<HeapIdx> {
        if pos >= self.darray_size(array) {
            return None;
        }
        let (_, seg) = self.darray_locate(array, pos)?;
        self.seg_elem(seg, pos as usize % ELEMS_PER_SEG)
    }

    /// Overwrite an existing element. Returns false when `pos` is out of
    /// bounds.
    pub fn darray_set(&mut self, array: HeapIdx, pos: u16, value: HeapIdx) -> bool {
        if pos >= self.darray_size(array) {
            return false;
        }
        match self.darray_locate(array, pos) {
            Some((_, seg)) => {
                self.set_seg_elem(seg, pos as usize % ELEMS_PER_SEG, Some(value));
                true
            }
            None => false,
        }
    }

    pub fn darray_push(&mut self, array: HeapIdx, value: HeapIdx) -> Result<(), OutOfMemory> {
        let size = self.darray_size(array);
        let slot = size as usize % ELEMS_PER_SEG;
        let seg = match self.darray_locate(array, size) {
            Some((_, seg)) => seg,
            None => {
                // the chain is exactly full, so the previous position's
                // segment is the tail
                let Some((_, tail)) = size
                    .checked_sub(1)
                    .and_then(|pos| self.darray_locate(array, pos))
                else {
                    return Err(OutOfMemory);
                };
                let fresh = self.seg_alloc()?;
                self.set_seg_next(tail, fresh);
                fresh
            }
        };
        self.set_seg_elem(seg, slot, Some(value));
        Ok(())
    }

    /// Remove the last element. Returns false on an empty array.
    pub fn darray_pop(&mut self, array: HeapIdx) -> bool {
        let size = self.darray_size(array);
        if size == 0 {
            return false;
        }
        let pos = size - 1;
        let Some((prev, seg)) = self.darray_locate(array, pos) else {
            return false;
        };
        let slot = pos as usize % ELEMS_PER_SEG;
        self.set_seg_elem(seg, slot, None);
        if slot == 0 && prev != NO_NEXT {
            self.set_seg_next(prev, NO_NEXT);
            self.seg_invalidate(seg);
        }
        true
    }

    /// Position of the first element equal to `value` under `cmp`, or the
    /// array size when absent.
    pub fn darray_find_by(
        &self,
        array: HeapIdx,
        value: HeapIdx,
        cmp: impl Fn(&Heap, HeapIdx, HeapIdx) -> Ordering,
    ) -> u16 {
        let mut pos = 0;
        let mut seg = self.table_head(array);
        while seg != NO_NEXT {
            for slot in 0..ELEMS_PER_SEG {
                let Some(elem) = self.seg_elem(seg, slot) else {
                    return pos;
                };
                if cmp(self, elem, value) == Ordering::Equal {
                    return pos;
                }
                pos += 1;
            }
            seg = self.seg_next(seg);
        }
        pos
    }

    pub fn darray_find(&self, array: HeapIdx, value: HeapIdx) -> u16 {
        self.darray_find_by(array, value, compare)
    }

    /// New array holding the same element indices, flagged as cloned.
    pub fn darray_clone(&mut self, array: HeapIdx) -> Result<HeapIdx, OutOfMemory> {
        let elements = self.darray_elements(array);
        let clone = self.darray_new()?;
        for elem in elements {
            if let Err(err) = self.darray_push(clone, elem) {
                self.darray_clear(clone);
                self.invalidate(clone);
                return Err(err);
            }
        }
        self.set_flag(clone, ObjFlags::FLAG_B, true);
        Ok(clone)
    }

    pub fn darray_clear(&mut self, array: HeapIdx) {
        while self.darray_pop(array) {}
        self.set_flag(array, ObjFlags::FLAG_B, false);
    }

    pub fn darray_foreach(&self, array: HeapIdx, mut f: impl FnMut(u16, HeapIdx)) {
        let mut pos = 0;
        let mut seg = self.table_head(array);
        while seg != NO_NEXT {
            for slot in 0..ELEMS_PER_SEG {
                let Some(elem) = self.seg_elem(seg, slot) else {
                    return;
                };
                f(pos, elem);
                pos += 1;
            }
            seg = self.seg_next(seg);
        }
    }

    pub fn darray_elements(&self, array: HeapIdx) -> Vec<HeapIdx> {
        let mut elements = Vec::new();
        self.darray_foreach(array, |_, elem| elements.push(elem));
        elements
    }
}

#[cfg(test)]
mod tests {
    use crate::{HeapSettings, Value};

    use super::*;

    fn create_test_heap() -> Heap {
        Heap::new(&HeapSettings { size: 2048 }).expect("valid settings")
    }

    fn ints(heap: &mut Heap, n: i16) -> Vec<HeapIdx> {
        (0..n).map(|i| heap.alloc_value(Value::Int(i)).unwrap()).collect()
    }

    #[test]
    fn push_then_pop_is_a_noop() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let elems = ints(&mut heap, 3);
        for &e in &elems[..2] {
            heap.darray_push(a, e).unwrap();
        }
        heap.darray_push(a, elems[2]).unwrap();
        assert!(heap.darray_pop(a));
        assert_eq!(heap.darray_size(a), 2);
        assert_eq!(heap.darray_elements(a), elems[..2].to_vec());
    }

    #[test]
    fn push_n_pop_n_empties_and_releases_segments() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let elems = ints(&mut heap, 25);
        for &e in &elems {
            heap.darray_push(a, e).unwrap();
        }
        assert_eq!(heap.darray_size(a), 25);
        assert_eq!(heap.stats().segments, 3);

        for _ in 0..25 {
            assert!(heap.darray_pop(a));
        }
        assert_eq!(heap.darray_size(a), 0);
        assert_eq!(heap.stats().segments, 1);
        assert!(!heap.darray_pop(a));
    }

    #[test]
    fn segment_boundary_positions() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let elems = ints(&mut heap, ELEMS_PER_SEG as i16 + 1);
        for &e in &elems {
            heap.darray_push(a, e).unwrap();
        }
        let last = ELEMS_PER_SEG as u16;
        assert_eq!(heap.darray_get(a, last), Some(elems[ELEMS_PER_SEG]));
        assert_eq!(heap.darray_get(a, last + 1), None);
        assert!(heap.darray_set(a, last, elems[0]));
        assert!(!heap.darray_set(a, last + 1, elems[0]));
        assert_eq!(heap.darray_get(a, last), Some(elems[0]));
    }

    #[test]
    fn find_returns_position_or_size() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let elems = ints(&mut heap, 12);
        for &e in &elems {
            heap.darray_push(a, e).unwrap();
        }
        let probe = heap.alloc_value(Value::Int(11)).unwrap();
        assert_eq!(heap.darray_find(a, probe), 11);
        let missing = heap.alloc_value(Value::Int(40)).unwrap();
        assert_eq!(heap.darray_find(a, missing), 12);
    }

    #[test]
    fn clone_shares_elements_and_clear_resets_flag() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let elems = ints(&mut heap, 4);
        for &e in &elems {
            heap.darray_push(a, e).unwrap();
        }
        let b = heap.darray_clone(a).unwrap();
        assert!(heap.is_cloned(b));
        assert!(!heap.is_cloned(a));
        assert_eq!(heap.darray_elements(b), elems);

        heap.darray_clear(b);
        assert_eq!(heap.darray_size(b), 0);
        assert!(!heap.is_cloned(b));
        assert_eq!(heap.darray_size(a), 4);
    }

    #[test]
    fn darray_flag_is_set() {
        let mut heap = create_test_heap();
        let a = heap.darray_new().unwrap();
        let t = heap.table_new().unwrap();
        assert!(heap.is_darray(a));
        assert!(!heap.is_darray(t));
    }
}
