use crate::{HeapIdx, VmError};

#[derive(Debug, Clone)]
pub struct StackSettings {
    pub capacity: usize,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self { capacity: 96 }
    }
}

/// Fixed-capacity operand stack of heap indices.
///
/// The live part of the stack doubles as the garbage collector's root set.
/// Pops and peeks never reach below `base`, the bottom of the current call
/// frame.
#[derive(Debug, Clone)]
pub struct OperandStack {
    slots: Box<[HeapIdx]>,
    depth: usize,
    base: usize,
}

impl OperandStack {
    #[must_use]
    pub fn new(settings: &StackSettings) -> Self {
        Self {
            slots: vec![0; settings.capacity].into_boxed_slice(),
            depth: 0,
            base: 0,
        }
    }

    /// Returns the active portion of the stack
    #[must_use]
    #[inline]
    pub fn as_slice(&self) -> &[HeapIdx] {
        &self.slots[..self.depth]
    }

    #[must_use]
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Move the frame floor. Clamped to the current depth.
    #[inline]
    pub fn set_base(&mut self, base: usize) {
        self.base = base.min(self.depth);
    }

    /// Values above the frame floor.
    #[must_use]
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.depth - self.base
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    #[inline]
    pub fn has_room(&self, count: usize) -> bool {
        self.depth + count <= self.slots.len()
    }

    #[inline]
    pub fn push(&mut self, idx: HeapIdx) -> Result<(), VmError> {
        if self.depth == self.slots.len() {
            return Err(VmError::Stack);
        }
        self.slots[self.depth] = idx;
        self.depth += 1;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<HeapIdx, VmError> {
        if self.depth == self.base {
            return Err(VmError::Stack);
        }
        self.depth -= 1;
        Ok(self.slots[self.depth])
    }

    /// Gets the nth value from the top of the stack (0-indexed)
    #[inline]
    pub fn peek(&self, n: usize) -> Result<HeapIdx, VmError> {
        if n >= self.frame_len() {
            return Err(VmError::Stack);
        }
        Ok(self.slots[self.depth - 1 - n])
    }

    /// Sets the nth value from the top of the stack
    #[inline]
    pub fn set_peek(&mut self, n: usize, idx: HeapIdx) -> Result<(), VmError> {
        if n >= self.frame_len() {
            return Err(VmError::Stack);
        }
        self.slots[self.depth - 1 - n] = idx;
        Ok(())
    }

    /// Cut the stack back to `depth`. Does nothing if already shallower.
    /// The frame floor follows if it was above the new depth.
    #[inline]
    pub fn truncate(&mut self, depth: usize) {
        self.depth = self.depth.min(depth);
        self.base = self.base.min(self.depth);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.depth = 0;
        self.base = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_stack(capacity: usize) -> OperandStack {
        OperandStack::new(&StackSettings { capacity })
    }

    #[test]
    fn push_pop_order() {
        let mut stack = create_test_stack(4);
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert_eq!(stack.peek(0), Ok(2));
        assert_eq!(stack.peek(1), Ok(1));
        assert_eq!(stack.pop(), Ok(2));
        assert_eq!(stack.as_slice(), &[1]);
    }

    #[test]
    fn overflow_and_underflow_are_stack_errors() {
        let mut stack = create_test_stack(1);
        assert_eq!(stack.pop(), Err(VmError::Stack));
        stack.push(0).unwrap();
        assert!(!stack.has_room(1));
        assert_eq!(stack.push(0), Err(VmError::Stack));
        assert_eq!(stack.peek(1), Err(VmError::Stack));
    }

    #[test]
    fn set_peek_and_truncate() {
        let mut stack = create_test_stack(8);
        for i in 0..5 {
            stack.push(i).unwrap();
        }
        stack.set_peek(1, 42).unwrap();
        assert_eq!(stack.as_slice()[3], 42);
        stack.truncate(2);
        assert_eq!(stack.depth(), 2);
        stack.truncate(10);
        assert_eq!(stack.depth(), 2);
    }

    #[test]
    fn frame_base_stops_pops_and_peeks() {
        let mut stack = create_test_stack(8);
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        stack.set_base(2);
        assert_eq!(stack.frame_len(), 0);
        assert_eq!(stack.pop(), Err(VmError::Stack));
        assert_eq!(stack.peek(0), Err(VmError::Stack));
        stack.push(3).unwrap();
        assert_eq!(stack.peek(0), Ok(3));
        assert_eq!(stack.peek(1), Err(VmError::Stack));
        assert_eq!(stack.set_peek(1, 9), Err(VmError::Stack));
        assert_eq!(stack.pop(), Ok(3));

        stack.truncate(1);
        assert_eq!(stack.base(), 1);
        stack.set_base(0);
        assert_eq!(stack.pop(), Ok(1));
        stack.set_base(5);
        assert_eq!(stack.base(), 0);
    }
}
