//! Fixed-size byte heap.
//!
//! Objects grow from the left edge of the buffer, table segments grow from
//! the right edge. Both are addressed by index, never by address, so that
//! retracting the edge cursors after a collection cannot invalidate a handle
//! held anywhere else.
//!
//! ```text
//! 0                rtobj            ltseg               size
//! | obj0 obj1 obj2 |   free space   | seg2 seg1 seg0 |
//! ```

use std::fmt;

use crate::{Header, ObjFlags, ObjType, Table, Value};

pub type HeapIdx = u16;
pub type SegIdx = u16;

/// Bytes per object slot: metadata byte, value word, aux word.
pub const OBJ_SIZE: usize = 5;
/// Key/value pairs per table segment.
pub const ELEMS_PER_TSEG: usize = 5;
/// Raw element slots per segment (pairs for tables, values for arrays).
pub const ELEMS_PER_SEG: usize = 2 * ELEMS_PER_TSEG;
/// Element slots plus the trailing metadata word.
pub const SEG_SIZE: usize = ELEMS_PER_SEG * 2 + 2;
pub const NO_NEXT: SegIdx = 0x3FFF;

const SEG_VALID: u16 = 1 << 15;
const SEG_MARK: u16 = 1 << 14;
const SEG_NEXT_MASK: u16 = 0x3FFF;

const ELEM_VALID: u16 = 1 << 15;
const ELEM_IDX_MASK: u16 = 0x7FFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap exhausted")
    }
}

impl std::error::Error for OutOfMemory {}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap buffer in bytes.
    pub size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self { size: 4096 }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.size < 64 {
            return Err("heap size must be at least 64 bytes");
        }
        if self.size > u16::MAX as usize {
            return Err("heap size must be addressable with 16 bits");
        }
        if self.size / OBJ_SIZE > ELEM_IDX_MASK as usize {
            return Err("too many object slots for element encoding");
        }
        if self.size / SEG_SIZE >= NO_NEXT as usize {
            return Err("too many segment slots for link encoding");
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub object_slots: usize,
    pub segments: usize,
    pub segment_slots: usize,
    pub free_bytes: usize,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub objects_freed: usize,
    pub segments_freed: usize,
}

#[derive(Debug)]
pub struct Heap {
    data: Box<[u8]>,
    /// Byte offset just past the rightmost object slot.
    rtobj: usize,
    /// Byte offset of the leftmost segment slot.
    ltseg: usize,
    worklist: Vec<HeapIdx>,
}

impl Heap {
    pub fn new(settings: &HeapSettings) -> Result<Self, &'static str> {
        settings.validate()?;
        Ok(Self {
            data: vec![0; settings.size].into_boxed_slice(),
            rtobj: 0,
            ltseg: settings.size,
            worklist: Vec::new(),
        })
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.rtobj = 0;
        self.ltseg = self.data.len();
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn rtobj(&self) -> usize {
        self.rtobj
    }

    #[inline]
    pub fn ltseg(&self) -> usize {
        self.ltseg
    }

    #[inline]
    pub fn object_slots(&self) -> usize {
        self.rtobj / OBJ_SIZE
    }

    #[inline]
    pub fn segment_slots(&self) -> usize {
        (self.data.len() - self.ltseg) / SEG_SIZE
    }

    pub fn stats(&self) -> HeapStats {
        let objects = (0..self.object_slots() as HeapIdx)
            .filter(|&idx| self.is_valid(idx))
            .count();
        let segments = (0..self.segment_slots() as SegIdx)
            .filter(|&seg| self.seg_is_valid(seg))
            .count();
        HeapStats {
            objects,
            object_slots: self.object_slots(),
            segments,
            segment_slots: self.segment_slots(),
            free_bytes: self.ltseg - self.rtobj,
        }
    }

    // ── objects ───────────────────────────────────────────────────────

    #[inline]
    fn obj_offset(idx: HeapIdx) -> usize {
        idx as usize * OBJ_SIZE
    }

    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    #[inline]
    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn header(&self, idx: HeapIdx) -> Header {
        if (idx as usize) < self.object_slots() {
            Header::from_raw(self.data[Self::obj_offset(idx)])
        } else {
            Header::INVALID
        }
    }

    #[inline]
    fn set_header(&mut self, idx: HeapIdx, header: Header) {
        self.data[Self::obj_offset(idx)] = header.raw();
    }

    #[inline]
    pub fn is_valid(&self, idx: HeapIdx) -> bool {
        self.header(idx).is_valid()
    }

    pub fn obj_type(&self, idx: HeapIdx) -> ObjType {
        self.header(idx).object_type().unwrap_or(ObjType::Nil)
    }

    /// Decoded copy of the object at `idx`; invalid slots read as nil.
    pub fn value(&self, idx: HeapIdx) -> Value {
        let header = self.header(idx);
        if !header.is_valid() {
            return Value::Nil;
        }
        let offset = Self::obj_offset(idx);
        Value::decode(
            header,
            self.read_u16(offset + 1),
            self.read_u16(offset + 3),
        )
    }

    /// Overwrite the payload and type of a valid object. Permanent and mark
    /// bits are kept.
    pub fn set_value(&mut self, idx: HeapIdx, value: Value) {
        let keep = self.header(idx).flags()
            & (ObjFlags::VALID | ObjFlags::PERMANENT | ObjFlags::MARK);
        let (tag, word, aux) = value.encode();
        let offset = Self::obj_offset(idx);
        self.data[offset] = tag | keep.bits();
        self.write_u16(offset + 1, word);
        self.write_u16(offset + 3, aux);
    }

    #[inline]
    pub(crate) fn raw_value(&self, idx: HeapIdx) -> u16 {
        self.read_u16(Self::obj_offset(idx) + 1)
    }

    #[inline]
    pub(crate) fn set_raw_value(&mut self, idx: HeapIdx, word: u16) {
        self.write_u16(Self::obj_offset(idx) + 1, word);
    }

    #[inline]
    pub fn has_flag(&self, idx: HeapIdx, flag: ObjFlags) -> bool {
        self.header(idx).has(flag)
    }

    #[inline]
    pub(crate) fn set_flag(&mut self, idx: HeapIdx, flag: ObjFlags, on: bool) {
        let header = self.header(idx).with(flag, on);
        self.set_header(idx, header);
    }

    /// Find a free object slot, reusing invalid slots left to right before
    /// growing the object region.
    fn alloc_slot(&mut self) -> Result<HeapIdx, OutOfMemory> {
        let slots = self.object_slots() as HeapIdx;
        let reusable = (0..slots).find(|&idx| !self.is_valid(idx));
        let idx = match reusable {
            Some(idx) => idx,
            None => {
                if self.rtobj + OBJ_SIZE > self.ltseg {
                    return Err(OutOfMemory);
                }
                self.rtobj += OBJ_SIZE;
                slots
            }
        };
        let offset = Self::obj_offset(idx);
        self.data[offset..offset + OBJ_SIZE].fill(0);
        self.set_header(idx, Header::encode(ObjType::Nil, ObjFlags::VALID));
        Ok(idx)
    }

    /// Allocate a default-initialized object of `ty`. Tables receive their
    /// head segment here.
    pub fn alloc(&mut self, ty: ObjType) -> Result<HeapIdx, OutOfMemory> {
        let idx = self.alloc_slot()?;
        if ty == ObjType::Table {
            let head = match self.seg_alloc() {
                Ok(seg) => seg,
                Err(err) => {
                    self.invalidate(idx);
                    return Err(err);
                }
            };
            self.set_value(
                idx,
                Value::Table(Table {
                    head,
                    darray: false,
                    cloned: false,
                }),
            );
            return Ok(idx);
        }
        let value = match ty {
            ObjType::Nil => Value::Nil,
            ObjType::Int => Value::Int(0),
            ObjType::Float => Value::Float(Default::default()),
            ObjType::String => Value::String(0),
            ObjType::Userdata => Value::Userdata(0),
            ObjType::Closure => Value::Closure(crate::Closure {
                target: crate::ClosureTarget::Bytecode(0),
                actrec: None,
            }),
            ObjType::Table => unreachable!("handled above"),
        };
        self.set_value(idx, value);
        Ok(idx)
    }

    /// Allocate an object holding `value`. Table values are refused, use
    /// [`Heap::alloc`] or the array constructors for those.
    pub fn alloc_value(&mut self, value: Value) -> Result<HeapIdx, OutOfMemory> {
        debug_assert!(
            !matches!(value, Value::Table(_)),
            "tables must own a fresh segment chain"
        );
        let idx = self.alloc_slot()?;
        self.set_value(idx, value);
        Ok(idx)
    }

    /// Shallow copy of a scalar or closure object. Tables are shared, not
    /// copied, and the same index is returned.
    pub fn copy(&mut self, idx: HeapIdx) -> Result<HeapIdx, OutOfMemory> {
        match self.value(idx) {
            Value::Table(_) => Ok(idx),
            value => self.alloc_value(value),
        }
    }

    pub fn invalidate(&mut self, idx: HeapIdx) {
        if (idx as usize) < self.object_slots() {
            self.set_header(idx, Header::INVALID);
        }
    }

    pub fn make_permanent(&mut self, idx: HeapIdx) {
        if self.is_valid(idx) {
            self.set_flag(idx, ObjFlags::PERMANENT, true);
        }
    }

    pub fn clear_permanent(&mut self, idx: HeapIdx) {
        if self.is_valid(idx) {
            self.set_flag(idx, ObjFlags::PERMANENT, false);
        }
    }

    // ── segments ──────────────────────────────────────────────────────

    #[inline]
    fn seg_offset(&self, seg: SegIdx) -> usize {
        self.data.len() - (seg as usize + 1) * SEG_SIZE
    }

    #[inline]
    fn seg_mdata(&self, seg: SegIdx) -> u16 {
        if (seg as usize) < self.segment_slots() {
            self.read_u16(self.seg_offset(seg) + ELEMS_PER_SEG * 2)
        } else {
            0
        }
    }

    #[inline]
    fn set_seg_mdata(&mut self, seg: SegIdx, mdata: u16) {
        let offset = self.seg_offset(seg) + ELEMS_PER_SEG * 2;
        self.write_u16(offset, mdata);
    }

    #[inline]
    pub fn seg_is_valid(&self, seg: SegIdx) -> bool {
        self.seg_mdata(seg) & SEG_VALID != 0
    }

    #[inline]
    pub(crate) fn seg_next(&self, seg: SegIdx) -> SegIdx {
        self.seg_mdata(seg) & SEG_NEXT_MASK
    }

    pub(crate) fn set_seg_next(&mut self, seg: SegIdx, next: SegIdx) {
        let mdata = self.seg_mdata(seg) & !SEG_NEXT_MASK;
        self.set_seg_mdata(seg, mdata | (next & SEG_NEXT_MASK));
    }

    /// Element slot `slot` of a segment, `None` when the slot is empty.
    #[inline]
    pub(crate) fn seg_elem(&self, seg: SegIdx, slot: usize) -> Option<HeapIdx> {
        debug_assert!(slot < ELEMS_PER_SEG);
        let raw = self.read_u16(self.seg_offset(seg) + slot * 2);
        (raw & ELEM_VALID != 0).then_some(raw & ELEM_IDX_MASK)
    }

    #[inline]
    pub(crate) fn set_seg_elem(&mut self, seg: SegIdx, slot: usize, elem: Option<HeapIdx>) {
        debug_assert!(slot < ELEMS_PER_SEG);
        let raw = match elem {
            Some(idx) => (idx & ELEM_IDX_MASK) | ELEM_VALID,
            None => 0,
        };
        let offset = self.seg_offset(seg) + slot * 2;
        self.write_u16(offset, raw);
    }

    /// Find a free segment slot, reusing invalid slots from the right edge
    /// inward before growing the segment region.
    pub(crate) fn seg_alloc(&mut self) -> Result<SegIdx, OutOfMemory> {
        let slots = self.segment_slots() as SegIdx;
        let reusable = (0..slots).find(|&seg| !self.seg_is_valid(seg));
        let seg = match reusable {
            Some(seg) => seg,
            None => {
                if self.ltseg < self.rtobj + SEG_SIZE {
                    return Err(OutOfMemory);
                }
                self.ltseg -= SEG_SIZE;
                slots
            }
        };
        for slot in 0..ELEMS_PER_SEG {
            self.set_seg_elem(seg, slot, None);
        }
        self.set_seg_mdata(seg, SEG_VALID | NO_NEXT);
        Ok(seg)
    }

    pub(crate) fn seg_invalidate(&mut self, seg: SegIdx) {
        if (seg as usize) < self.segment_slots() {
            self.set_seg_mdata(seg, 0);
        }
    }

    /// Head segment of a table or array, `NO_NEXT` for any other object.
    pub(crate) fn table_head(&self, table: HeapIdx) -> SegIdx {
        if self.obj_type(table) != ObjType::Table {
            return NO_NEXT;
        }
        self.raw_value(table)
    }

    pub(crate) fn set_table_head(&mut self, table: HeapIdx, head: SegIdx) {
        self.set_raw_value(table, head);
    }

    // ── garbage collection ────────────────────────────────────────────

    /// Mark from `roots` and from every permanent object, then invalidate
    /// everything left unmarked and pull both edge cursors inward over
    /// trailing free slots.
    pub fn gc(&mut self, roots: &[HeapIdx]) -> GarbageCollectionStats {
        let objects = self.object_slots() as HeapIdx;
        let segments = self.segment_slots() as SegIdx;

        for idx in 0..objects {
            if self.is_valid(idx) {
                self.set_flag(idx, ObjFlags::MARK, false);
            }
        }
        for seg in 0..segments {
            let mdata = self.seg_mdata(seg);
            if mdata & SEG_VALID != 0 {
                self.set_seg_mdata(seg, mdata & !SEG_MARK);
            }
        }

        let mut worklist = std::mem::take(&mut self.worklist);
        worklist.clear();
        worklist.extend_from_slice(roots);
        worklist.extend(
            (0..objects).filter(|&idx| self.has_flag(idx, ObjFlags::PERMANENT)),
        );

        while let Some(idx) = worklist.pop() {
            let header = self.header(idx);
            if !header.is_valid() || header.has(ObjFlags::MARK) {
                continue;
            }
            self.set_flag(idx, ObjFlags::MARK, true);
            match self.value(idx) {
                Value::Table(table) => {
                    let mut seg = table.head;
                    while seg != NO_NEXT {
                        let mdata = self.seg_mdata(seg);
                        if mdata & SEG_VALID == 0 || mdata & SEG_MARK != 0 {
                            break;
                        }
                        self.set_seg_mdata(seg, mdata | SEG_MARK);
                        for slot in 0..ELEMS_PER_SEG {
                            if let Some(elem) = self.seg_elem(seg, slot) {
                                worklist.push(elem);
                            }
                        }
                        seg = mdata & SEG_NEXT_MASK;
                    }
                }
                Value::Closure(closure) => {
                    if let Some(actrec) = closure.actrec {
                        worklist.push(actrec);
                    }
                }
                _ => {}
            }
        }
        self.worklist = worklist;

        let mut stats = GarbageCollectionStats::default();
        for seg in 0..segments {
            let mdata = self.seg_mdata(seg);
            if mdata & SEG_VALID != 0 && mdata & SEG_MARK == 0 {
                self.seg_invalidate(seg);
                stats.segments_freed += 1;
            }
        }
        for idx in 0..objects {
            let header = self.header(idx);
            if header.is_valid() && !header.has(ObjFlags::MARK) {
                self.invalidate(idx);
                stats.objects_freed += 1;
            }
        }

        while self.rtobj >= OBJ_SIZE
            && !self.is_valid((self.rtobj / OBJ_SIZE - 1) as HeapIdx)
        {
            self.rtobj -= OBJ_SIZE;
        }
        while self.ltseg < self.data.len()
            && !self.seg_is_valid((self.segment_slots() - 1) as SegIdx)
        {
            self.ltseg += SEG_SIZE;
        }

        log::trace!(
            "gc: freed {} objects, {} segments, {} bytes free",
            stats.objects_freed,
            stats.segments_freed,
            self.ltseg - self.rtobj
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_heap(size: usize) -> Heap {
        Heap::new(&HeapSettings { size }).expect("valid settings")
    }

    #[test]
    fn settings_reject_degenerate_sizes() {
        assert!(HeapSettings { size: 8 }.validate().is_err());
        assert!(HeapSettings { size: 70_000 }.validate().is_err());
        assert!(HeapSettings::default().validate().is_ok());
    }

    #[test]
    fn objects_grow_from_the_left() {
        let mut heap = create_test_heap(256);
        let a = heap.alloc_value(Value::Int(1)).unwrap();
        let b = heap.alloc_value(Value::Int(2)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(heap.rtobj(), 2 * OBJ_SIZE);
        assert_eq!(heap.value(b), Value::Int(2));
    }

    #[test]
    fn tables_take_a_segment_from_the_right() {
        let mut heap = create_test_heap(256);
        let t = heap.alloc(ObjType::Table).unwrap();
        assert_eq!(heap.ltseg(), 256 - SEG_SIZE);
        assert_eq!(heap.table_head(t), 0);
        assert!(heap.seg_is_valid(0));
        assert_eq!(heap.seg_next(0), NO_NEXT);
        for slot in 0..ELEMS_PER_SEG {
            assert_eq!(heap.seg_elem(0, slot), None);
        }
    }

    #[test]
    fn allocation_fails_when_cursors_would_cross() {
        let mut heap = create_test_heap(64);
        heap.alloc(ObjType::Table).unwrap();
        let mut allocated = 1;
        while heap.alloc_value(Value::Int(0)).is_ok() {
            allocated += 1;
        }
        assert_eq!(allocated, (64 - SEG_SIZE) / OBJ_SIZE);
        assert_eq!(heap.seg_alloc(), Err(OutOfMemory));
        assert!(heap.rtobj() <= heap.ltseg());
    }

    #[test]
    fn failed_table_allocation_releases_its_object() {
        let mut heap = create_test_heap(64);
        heap.seg_alloc().unwrap();
        heap.seg_alloc().unwrap();
        assert_eq!(heap.alloc(ObjType::Table), Err(OutOfMemory));
        assert_eq!(heap.stats().objects, 0);
    }

    #[test]
    fn invalid_slots_are_reused_first() {
        let mut heap = create_test_heap(256);
        let a = heap.alloc_value(Value::Int(1)).unwrap();
        let _b = heap.alloc_value(Value::Int(2)).unwrap();
        heap.invalidate(a);
        let c = heap.alloc_value(Value::Int(3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.object_slots(), 2);
    }

    #[test]
    fn gc_keeps_roots_and_table_contents() {
        let mut heap = create_test_heap(512);
        let t = heap.alloc(ObjType::Table).unwrap();
        let k = heap.alloc_value(Value::Int(1)).unwrap();
        let v = heap.alloc_value(Value::Int(2)).unwrap();
        let garbage = heap.alloc_value(Value::Int(3)).unwrap();
        heap.table_set(t, k, v).unwrap();

        let stats = heap.gc(&[t]);
        assert_eq!(stats.objects_freed, 1);
        assert!(heap.is_valid(t));
        assert!(heap.is_valid(k));
        assert!(heap.is_valid(v));
        assert!(!heap.is_valid(garbage));
    }

    #[test]
    fn gc_is_idempotent() {
        let mut heap = create_test_heap(512);
        let t = heap.alloc(ObjType::Table).unwrap();
        let k = heap.alloc_value(Value::Int(1)).unwrap();
        let v = heap.alloc_value(Value::Int(2)).unwrap();
        heap.table_set(t, k, v).unwrap();
        heap.alloc_value(Value::Int(9)).unwrap();

        heap.gc(&[t]);
        let before = heap.stats();
        let stats = heap.gc(&[t]);
        assert_eq!(stats, GarbageCollectionStats::default());
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn gc_reclaims_dead_tables_and_their_chains() {
        let mut heap = create_test_heap(1024);
        let t = heap.alloc(ObjType::Table).unwrap();
        for i in 0..(ELEMS_PER_TSEG as i16 + 2) {
            let k = heap.alloc_value(Value::Int(i)).unwrap();
            heap.table_set(t, k, k).unwrap();
        }
        assert_eq!(heap.stats().segments, 2);

        heap.gc(&[]);
        let stats = heap.stats();
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.segments, 0);
        assert_eq!(heap.rtobj(), 0);
        assert_eq!(heap.ltseg(), heap.size());
    }

    #[test]
    fn gc_retracts_only_trailing_garbage() {
        let mut heap = create_test_heap(256);
        let a = heap.alloc_value(Value::Int(1)).unwrap();
        let b = heap.alloc_value(Value::Int(2)).unwrap();
        let _c = heap.alloc_value(Value::Int(3)).unwrap();

        heap.gc(&[b]);
        assert!(!heap.is_valid(a));
        assert_eq!(heap.rtobj(), 2 * OBJ_SIZE);
    }

    #[test]
    fn permanent_objects_survive_without_roots() {
        let mut heap = create_test_heap(256);
        let pinned = heap.alloc_value(Value::Int(7)).unwrap();
        heap.make_permanent(pinned);
        heap.gc(&[]);
        assert_eq!(heap.value(pinned), Value::Int(7));

        heap.clear_permanent(pinned);
        heap.gc(&[]);
        assert!(!heap.is_valid(pinned));
    }

    #[test]
    fn nested_tables_are_traced_past_the_first_level() {
        let mut heap = create_test_heap(1024);
        let outer = heap.alloc(ObjType::Table).unwrap();
        let inner = heap.alloc(ObjType::Table).unwrap();
        let key = heap.alloc_value(Value::String(1)).unwrap();
        let deep = heap.alloc_value(Value::Int(42)).unwrap();
        heap.table_set(inner, key, deep).unwrap();
        heap.table_set(outer, key, inner).unwrap();

        heap.gc(&[outer]);
        assert!(heap.is_valid(inner));
        assert_eq!(heap.value(deep), Value::Int(42));
        assert_eq!(heap.table_get(inner, key), Some(deep));
    }

    #[test]
    fn lambda_activation_records_are_traced() {
        let mut heap = create_test_heap(512);
        let actrec = heap.darray_new().unwrap();
        let local = heap.alloc_value(Value::Int(5)).unwrap();
        heap.darray_push(actrec, local).unwrap();
        let closure = heap
            .alloc_value(Value::Closure(crate::Closure {
                target: crate::ClosureTarget::Bytecode(10),
                actrec: Some(actrec),
            }))
            .unwrap();

        heap.gc(&[closure]);
        assert!(heap.is_valid(actrec));
        assert!(heap.is_valid(local));
    }

    #[test]
    fn copy_duplicates_scalars_but_shares_tables() {
        let mut heap = create_test_heap(256);
        let int = heap.alloc_value(Value::Int(3)).unwrap();
        let copy = heap.copy(int).unwrap();
        assert_ne!(int, copy);
        assert_eq!(heap.value(copy), Value::Int(3));

        let table = heap.alloc(ObjType::Table).unwrap();
        assert_eq!(heap.copy(table).unwrap(), table);
    }
}
