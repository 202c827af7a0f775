use std::cmp::Ordering;

use crate::{
    ELEMS_PER_TSEG, Heap, HeapIdx, NO_NEXT, ObjType, OutOfMemory, SegIdx,
    compare,
};

/// Position of one key/value pair inside a segment chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct PairSlot {
    seg: SegIdx,
    pair: usize,
}

impl Heap {
    pub fn table_new(&mut self) -> Result<HeapIdx, OutOfMemory> {
        self.alloc(ObjType::Table)
    }

    fn table_key(&self, seg: SegIdx, pair: usize) -> Option<HeapIdx> {
        self.seg_elem(seg, 2 * pair)
    }

    fn table_val(&self, seg: SegIdx, pair: usize) -> Option<HeapIdx> {
        self.seg_elem(seg, 2 * pair + 1)
    }

    fn table_find(&self, table: HeapIdx, key: HeapIdx) -> Option<PairSlot> {
        let mut seg = self.table_head(table);
        while seg != NO_NEXT {
            for pair in 0..ELEMS_PER_TSEG {
                let Some(k) = self.table_key(seg, pair) else {
                    continue;
                };
                if compare(self, k, key) == Ordering::Equal {
                    return Some(PairSlot { seg, pair });
                }
            }
            seg = self.seg_next(seg);
        }
        None
    }

    pub fn table_get(&self, table: HeapIdx, key: HeapIdx) -> Option<HeapIdx> {
        let slot = self.table_find(table, key)?;
        self.table_val(slot.seg, slot.pair)
    }

    /// Insert, overwrite or erase. A nil `value` erases `key`; a nil `key` is
    /// never stored. Writes to an object that is not a table are ignored.
    pub fn table_set(
        &mut self,
        table: HeapIdx,
        key: HeapIdx,
        value: HeapIdx,
    ) -> Result<(), OutOfMemory> {
        let head = self.table_head(table);
        if head == NO_NEXT || self.obj_type(key) == ObjType::Nil {
            return Ok(());
        }
        let erase = self.obj_type(value) == ObjType::Nil;

        let mut prev = NO_NEXT;
        let mut last = head;
        let mut free = None;
        let mut seg = head;
        while seg != NO_NEXT {
            for pair in 0..ELEMS_PER_TSEG {
                match self.table_key(seg, pair) {
                    Some(k) if compare(self, k, key) == Ordering::Equal => {
                        if erase {
                            self.table_erase(table, prev, seg, pair);
                        } else {
                            self.set_seg_elem(seg, 2 * pair + 1, Some(value));
                        }
                        return Ok(());
                    }
                    Some(_) => {}
                    None => {
                        if free.is_none() {
                            free = Some(PairSlot { seg, pair });
                        }
                    }
                }
            }
            prev = seg;
            last = seg;
            seg = self.seg_next(seg);
        }

        if erase {
            return Ok(());
        }
        let slot = match free {
            Some(slot) => slot,
            None => {
                let fresh = self.seg_alloc()?;
                self.set_seg_next(last, fresh);
                PairSlot {
                    seg: fresh,
                    pair: 0,
                }
            }
        };
        self.set_seg_elem(slot.seg, 2 * slot.pair, Some(key));
        self.set_seg_elem(slot.seg, 2 * slot.pair + 1, Some(value));
        Ok(())
    }

    fn table_erase(
        &mut self,
        table: HeapIdx,
        prev: SegIdx,
        seg: SegIdx,
        pair: usize,
    ) {
        self.set_seg_elem(seg, 2 * pair, None);
        self.set_seg_elem(seg, 2 * pair + 1, None);

        let empty =
            (0..ELEMS_PER_TSEG).all(|p| self.table_key(seg, p).is_none());
        if !empty {
            return;
        }
        let next = self.seg_next(seg);
        if prev == NO_NEXT {
            // the head segment stays unless something follows it
            if next == NO_NEXT {
                return;
            }
            self.set_table_head(table, next);
        } else {
            self.set_seg_next(prev, next);
        }
        self.seg_invalidate(seg);
    }

    pub fn table_size(&self, table: HeapIdx) -> usize {
        let mut count = 0;
        self.table_foreach(table, |_, _| count += 1);
        count
    }

    /// Visit every pair in chain order, then slot order within a segment.
    pub fn table_foreach(
        &self,
        table: HeapIdx,
        mut f: impl FnMut(HeapIdx, HeapIdx),
    ) {
        let mut seg = self.table_head(table);
        while seg != NO_NEXT {
            for pair in 0..ELEMS_PER_TSEG {
                if let (Some(k), Some(v)) =
                    (self.table_key(seg, pair), self.table_val(seg, pair))
                {
                    f(k, v);
                }
            }
            seg = self.seg_next(seg);
        }
    }

    /// Snapshot of all pairs, for callers that mutate the heap while
    /// iterating.
    pub fn table_entries(&self, table: HeapIdx) -> Vec<(HeapIdx, HeapIdx)> {
        let mut entries = Vec::new();
        self.table_foreach(table, |k, v| entries.push((k, v)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use crate::{HeapSettings, Value};

    use super::*;

    fn create_test_heap() -> Heap {
        Heap::new(&HeapSettings { size: 2048 }).expect("valid settings")
    }

    fn int(heap: &mut Heap, value: i16) -> HeapIdx {
        heap.alloc_value(Value::Int(value)).unwrap()
    }

    fn string(heap: &mut Heap, id: u16) -> HeapIdx {
        heap.alloc_value(Value::String(id)).unwrap()
    }

    #[test]
    fn set_get_erase_scenario() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let a = string(&mut heap, 100);
        let b = string(&mut heap, 101);
        let one = int(&mut heap, 1);
        let two = int(&mut heap, 2);
        let nil = heap.alloc_value(Value::Nil).unwrap();

        heap.table_set(t, a, one).unwrap();
        heap.table_set(t, b, two).unwrap();
        assert_eq!(heap.table_size(t), 2);

        let lookup = string(&mut heap, 100);
        let found = heap.table_get(t, lookup).unwrap();
        assert_eq!(heap.value(found), Value::Int(1));

        heap.table_set(t, lookup, nil).unwrap();
        assert_eq!(heap.table_size(t), 1);
        assert_eq!(heap.table_get(t, a), None);
        assert!(heap.table_get(t, b).is_some());
    }

    #[test]
    fn overwriting_keeps_size() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let k = int(&mut heap, 5);
        let v1 = int(&mut heap, 1);
        let v2 = int(&mut heap, 2);
        heap.table_set(t, k, v1).unwrap();
        heap.table_set(t, k, v2).unwrap();
        assert_eq!(heap.table_size(t), 1);
        assert_eq!(heap.table_get(t, k), Some(v2));
    }

    #[test]
    fn setting_missing_key_to_nil_is_a_noop() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let k = int(&mut heap, 5);
        let nil = heap.alloc_value(Value::Nil).unwrap();
        heap.table_set(t, k, nil).unwrap();
        assert_eq!(heap.table_size(t), 0);
        assert_eq!(heap.stats().segments, 1);
    }

    #[test]
    fn nil_keys_are_never_stored() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let nil = heap.alloc_value(Value::Nil).unwrap();
        let v = int(&mut heap, 1);
        heap.table_set(t, nil, v).unwrap();
        assert_eq!(heap.table_size(t), 0);
    }

    #[test]
    fn chain_grows_and_shrinks() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let nil = heap.alloc_value(Value::Nil).unwrap();
        let keys: Vec<_> = (0..12).map(|i| int(&mut heap, i)).collect();
        for &k in &keys {
            heap.table_set(t, k, k).unwrap();
        }
        assert_eq!(heap.table_size(t), 12);
        assert_eq!(heap.stats().segments, 3);

        // empty the first segment, the head moves to the second
        for &k in &keys[..ELEMS_PER_TSEG] {
            heap.table_set(t, k, nil).unwrap();
        }
        assert_eq!(heap.stats().segments, 2);
        assert_eq!(heap.table_size(t), 12 - ELEMS_PER_TSEG);
        for &k in &keys[ELEMS_PER_TSEG..] {
            assert_eq!(heap.table_get(t, k), Some(k));
        }
    }

    #[test]
    fn freed_slots_are_reused_before_appending() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let nil = heap.alloc_value(Value::Nil).unwrap();
        let keys: Vec<_> = (0..ELEMS_PER_TSEG as i16).map(|i| int(&mut heap, i)).collect();
        for &k in &keys {
            heap.table_set(t, k, k).unwrap();
        }
        heap.table_set(t, keys[2], nil).unwrap();
        let extra = int(&mut heap, 99);
        heap.table_set(t, extra, extra).unwrap();
        assert_eq!(heap.stats().segments, 1);
        assert_eq!(heap.table_size(t), ELEMS_PER_TSEG);
    }

    #[test]
    fn foreach_visits_in_insertion_order() {
        let mut heap = create_test_heap();
        let t = heap.table_new().unwrap();
        let keys: Vec<_> = (0..7).map(|i| int(&mut heap, i * 10)).collect();
        for &k in &keys {
            heap.table_set(t, k, k).unwrap();
        }
        let visited: Vec<_> =
            heap.table_entries(t).into_iter().map(|(k, _)| k).collect();
        assert_eq!(visited, keys);
    }

    #[test]
    fn non_tables_have_no_pairs() {
        let mut heap = create_test_heap();
        let not_table = int(&mut heap, 3);
        let k = int(&mut heap, 1);
        heap.table_set(not_table, k, k).unwrap();
        assert_eq!(heap.table_get(not_table, k), None);
        assert_eq!(heap.table_size(not_table), 0);
        assert_eq!(heap.value(not_table), Value::Int(3));
        assert_eq!(heap.darray_size(not_table), 0);
        assert!(!heap.darray_pop(not_table));
        assert_eq!(heap.stats().segments, 0);
    }

    #[test]
    fn out_of_memory_surfaces_on_append() {
        let mut heap = Heap::new(&HeapSettings { size: 64 }).unwrap();
        let t = heap.table_new().unwrap();
        let k = int(&mut heap, 0);
        let mut result = Ok(());
        for i in 0..ELEMS_PER_TSEG as i16 + 1 {
            let key = match heap.alloc_value(Value::Int(i + 1)) {
                Ok(key) => key,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            result = heap.table_set(t, key, k);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(OutOfMemory));
    }
}
