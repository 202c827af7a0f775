use std::fmt;

use crate::{
    BytecodeError, BytecodeFetch, Closure, ClosureTarget, Float16, Heap, HeapIdx,
    HeapSettings, HostFunction, InMsgQueue, NeighborData, Neighbors, ObjFlags, ObjType,
    Opcode, OperandStack, OutMsgQueue, PRIMITIVES, PrimitiveId, StackSettings,
    StringId, StringTable, Swarm, Value, VirtualStigmergy, VmCreateError, VmError,
    VmState,
    primitives::primitive_name,
    bytecode::{fetch_u8, fetch_u16, parse_header},
    strings::Builtin,
};

/// Ambient roots pushed on the stack around every collection.
const AMBIENT_ROOTS: usize = 7;

/// Interpreter registers saved around a host-initiated call.
struct CallSite {
    state: VmState,
    pc: u16,
    depth: usize,
    base: usize,
    frame_depth: usize,
    lsyms: HeapIdx,
}

#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub robot: u16,
    pub heap: HeapSettings,
    pub stack_size: usize,
    pub inmsg_capacity: usize,
    pub outmsg_capacity: usize,
    pub vstig_capacity: usize,
    pub neighbors_capacity: usize,
    pub swarmlist_capacity: usize,
    pub function_capacity: usize,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            robot: 0,
            heap: HeapSettings::default(),
            stack_size: StackSettings::default().capacity,
            inmsg_capacity: 16,
            outmsg_capacity: 16,
            vstig_capacity: 16,
            neighbors_capacity: 16,
            swarmlist_capacity: 16,
            function_capacity: 32,
        }
    }
}

impl VmCreateInfo {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.heap.validate()?;
        if self.stack_size < AMBIENT_ROOTS + 8 {
            return Err("stack too small to hold the garbage collector roots");
        }
        if self.inmsg_capacity < 2 || self.outmsg_capacity < 2 {
            return Err("message queues need at least two slots");
        }
        if self.vstig_capacity == 0 {
            return Err("virtual stigmergy needs at least one entry");
        }
        if self.neighbors_capacity == 0 || self.swarmlist_capacity == 0 {
            return Err("neighbor and swarm tables need at least one entry");
        }
        if PRIMITIVES.len() + self.function_capacity > u16::MAX as usize {
            return Err("function list ids must fit in 16 bits");
        }
        Ok(())
    }
}

pub type ErrorReceiver = Box<dyn FnMut(VmError)>;

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: OperandStack,
    bytecode: Option<Box<dyn BytecodeFetch>>,
    code_start: usize,
    code_size: usize,
    pub(crate) pc: u16,
    pub(crate) state: VmState,
    error: Option<VmError>,
    error_receiver: ErrorReceiver,
    pub(crate) frame_depth: usize,
    /// Current activation record.
    pub(crate) lsyms: HeapIdx,
    pub(crate) gsyms: HeapIdx,
    pub(crate) nil: HeapIdx,
    pub(crate) dflt_actrec: HeapIdx,
    flist: Vec<HostFunction>,
    function_capacity: usize,
    pub(crate) strings: StringTable,
    pub(crate) robot: u16,
    pub(crate) inmsgs: InMsgQueue,
    pub(crate) outmsgs: OutMsgQueue,
    pub(crate) neighbors: Neighbors,
    pub(crate) vstig: VirtualStigmergy,
    pub(crate) swarm: Swarm,
    pinned: Vec<HeapIdx>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("robot", &self.robot)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("pc", &self.pc)
            .field("stack", &self.stack.as_slice())
            .field("frame_depth", &self.frame_depth)
            .field("heap", &self.heap.stats())
            .finish_non_exhaustive()
    }
}

fn default_error_receiver(err: VmError) {
    log::warn!("vm entered error state: {err}");
}

impl Vm {
    pub fn new(info: &VmCreateInfo) -> Result<Self, VmCreateError> {
        info.validate()?;
        let mut heap = Heap::new(&info.heap)?;

        let nil = heap.alloc_value(Value::Nil)?;
        heap.make_permanent(nil);
        let dflt_actrec = heap.darray_new()?;
        heap.darray_push(dflt_actrec, nil)?;
        heap.make_permanent(dflt_actrec);
        let gsyms = heap.table_new()?;
        heap.make_permanent(gsyms);
        let listeners = heap.table_new()?;
        heap.make_permanent(listeners);

        let mut vm = Self {
            heap,
            stack: OperandStack::new(&StackSettings {
                capacity: info.stack_size,
            }),
            bytecode: None,
            code_start: 0,
            code_size: 0,
            pc: 0,
            state: VmState::NoCode,
            error: None,
            error_receiver: Box::new(default_error_receiver),
            frame_depth: 0,
            lsyms: dflt_actrec,
            gsyms,
            nil,
            dflt_actrec,
            flist: PRIMITIVES.iter().map(|p| p.ptr).collect(),
            function_capacity: info.function_capacity,
            strings: StringTable::new(),
            robot: info.robot,
            inmsgs: InMsgQueue::new(info.inmsg_capacity),
            outmsgs: OutMsgQueue::new(info.outmsg_capacity),
            neighbors: Neighbors::new(info.neighbors_capacity, listeners),
            vstig: VirtualStigmergy::new(info.vstig_capacity),
            swarm: Swarm::new(info.swarmlist_capacity),
            pinned: Vec::new(),
        };
        vm.register_globals()?;
        Ok(vm)
    }

    fn register_globals(&mut self) -> Result<(), VmError> {
        let id = self.alloc_value(Value::Int(self.robot as i16))?;
        self.set_global(Builtin::Id.id(), id)?;
        let log = self.alloc_native(PrimitiveId::Log)?;
        self.set_global(Builtin::Log.id(), log)?;
        let neighbors = self.new_neighbors_table()?;
        self.set_global(Builtin::Neighbors.id(), neighbors)?;
        let stigmergy = self.method_table(&[(Builtin::Create, PrimitiveId::StigmergyCreate)])?;
        self.set_global(Builtin::Stigmergy.id(), stigmergy)?;
        let swarm = self.method_table(&[(Builtin::Create, PrimitiveId::SwarmCreate)])?;
        self.set_global(Builtin::Swarm.id(), swarm)?;
        Ok(())
    }

    // ── accessors ─────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> VmState {
        self.state
    }

    #[inline]
    pub fn error(&self) -> Option<VmError> {
        self.error
    }

    /// Code address of the next instruction.
    #[inline]
    pub fn pc(&self) -> u16 {
        self.pc
    }

    #[inline]
    pub fn robot(&self) -> u16 {
        self.robot
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    #[inline]
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    #[inline]
    pub fn nil(&self) -> HeapIdx {
        self.nil
    }

    #[inline]
    pub fn outmsgs(&self) -> &OutMsgQueue {
        &self.outmsgs
    }

    #[inline]
    pub fn outmsgs_mut(&mut self) -> &mut OutMsgQueue {
        &mut self.outmsgs
    }

    #[inline]
    pub fn inmsgs(&self) -> &InMsgQueue {
        &self.inmsgs
    }

    #[inline]
    pub fn neighbors(&self) -> &Neighbors {
        &self.neighbors
    }

    #[inline]
    pub fn vstig(&self) -> &VirtualStigmergy {
        &self.vstig
    }

    #[inline]
    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn neighbors_reset(&mut self) {
        self.neighbors.reset();
    }

    /// Returns false when the neighbor table is full.
    pub fn neighbors_add(&mut self, data: NeighborData) -> bool {
        self.neighbors.add(data)
    }

    // ── errors ────────────────────────────────────────────────────────

    pub fn set_error_receiver(&mut self, receiver: ErrorReceiver) {
        self.error_receiver = receiver;
    }

    pub(crate) fn set_error(&mut self, err: VmError) {
        self.state = VmState::Error;
        self.error = Some(err);
        (self.error_receiver)(err);
    }

    /// Leave the error state. Execution resumes at the faulting instruction.
    pub fn clear_error(&mut self) {
        if self.state == VmState::Error {
            self.state = VmState::Ready;
            self.error = None;
        }
    }

    // ── bytecode ──────────────────────────────────────────────────────

    /// Attach an image and run its prologue, everything up to and including
    /// the first `nop`.
    pub fn set_bytecode(
        &mut self,
        image: impl BytecodeFetch + 'static,
    ) -> Result<(), BytecodeError> {
        let header = parse_header(&image)?;
        let string_count = header.strings.len();
        self.strings.load_image_strings(header.strings);
        self.code_start = header.code_start;
        self.code_size = image.size() - header.code_start;
        self.bytecode = Some(Box::new(image));
        log::debug!(
            "attached bytecode: {} code bytes, {} strings",
            self.code_size,
            string_count
        );

        self.pc = 0;
        self.stack.clear();
        self.frame_depth = 0;
        self.error = None;
        self.lsyms = self
            .heap
            .darray_clone(self.dflt_actrec)
            .map_err(|err| BytecodeError::Prologue(err.into()))?;
        self.state = VmState::Ready;

        loop {
            if let Ok((Opcode::Nop, _)) = self.fetch_instruction() {
                self.pc += 1;
                return Ok(());
            }
            self.step();
            match self.state {
                VmState::Error => {
                    return Err(BytecodeError::Prologue(
                        self.error.unwrap_or(VmError::Instruction),
                    ));
                }
                VmState::Done => return Ok(()),
                VmState::Ready | VmState::NoCode => {}
            }
        }
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub(crate) fn fetch_instruction(&self) -> Result<(Opcode, Option<u16>), VmError> {
        let image = self.bytecode.as_deref().ok_or(VmError::ProgramCounter)?;
        let pc = self.pc as usize;
        if pc >= self.code_size {
            return Err(VmError::ProgramCounter);
        }
        let byte = fetch_u8(image, self.code_start + pc).ok_or(VmError::ProgramCounter)?;
        let op = Opcode::from_u8(byte).ok_or(VmError::Instruction)?;
        if !op.has_operand() {
            return Ok((op, None));
        }
        if pc + op.width() > self.code_size {
            return Err(VmError::ProgramCounter);
        }
        let operand =
            fetch_u16(image, self.code_start + pc + 1).ok_or(VmError::ProgramCounter)?;
        Ok((op, Some(operand)))
    }

    // ── execution ─────────────────────────────────────────────────────

    /// Collect garbage, then execute one instruction. Does nothing unless
    /// the VM is ready. On failure the program counter is left on the
    /// faulting instruction.
    pub fn step(&mut self) {
        if self.state != VmState::Ready {
            return;
        }
        let pc = self.pc;
        let result = self.collect_garbage().and_then(|()| self.exec());
        if let Err(err) = result {
            self.pc = pc;
            self.set_error(err);
        }
    }

    /// Step until the VM stops being ready.
    pub fn execute_script(&mut self) -> VmState {
        while self.state == VmState::Ready {
            self.step();
        }
        self.state
    }

    pub(crate) fn collect_garbage(&mut self) -> Result<(), VmError> {
        let ambient: [HeapIdx; AMBIENT_ROOTS] = [
            self.nil,
            self.dflt_actrec,
            self.gsyms,
            self.lsyms,
            self.neighbors.listeners,
            self.vstig.onconflict.unwrap_or(self.nil),
            self.vstig.onconflictlost.unwrap_or(self.nil),
        ];
        if !self.stack.has_room(ambient.len() + self.pinned.len()) {
            return Err(VmError::Stack);
        }
        let depth = self.stack.depth();
        for idx in ambient.into_iter().chain(self.pinned.iter().copied()) {
            self.stack.push(idx)?;
        }
        self.heap.gc(self.stack.as_slice());
        self.stack.truncate(depth);
        Ok(())
    }

    /// Keep `idx` alive across collections until [`Vm::unpin`].
    pub fn pin(&mut self, idx: HeapIdx) {
        self.pinned.push(idx);
    }

    pub fn unpin(&mut self, idx: HeapIdx) {
        if let Some(pos) = self.pinned.iter().rposition(|&p| p == idx) {
            self.pinned.swap_remove(pos);
        }
    }

    // ── call protocol ─────────────────────────────────────────────────

    /// Pops `[argN .. arg1, argc, closure]` and enters the closure. Host
    /// closures run to completion before this returns. The call is checked
    /// and its objects allocated before the stack is touched, so a failed
    /// call leaves the caller's frame intact.
    pub(crate) fn callc(&mut self) -> Result<(), VmError> {
        let closure_idx = self.stack.peek(0)?;
        let argc_idx = self.stack.peek(1)?;
        let Value::Closure(closure) = self.heap.value(closure_idx) else {
            return Err(VmError::Type);
        };
        let argc = self.heap.value(argc_idx).as_int().ok_or(VmError::Type)?;
        if argc < 0 {
            return Err(VmError::LocalCount);
        }
        let argc = argc as usize;
        if argc + 2 > self.stack.frame_len() {
            return Err(VmError::Stack);
        }
        match closure.target {
            ClosureTarget::Bytecode(addr) if addr as usize >= self.code_size => {
                return Err(VmError::ProgramCounter);
            }
            ClosureTarget::Native(id) if id as usize >= self.flist.len() => {
                return Err(VmError::FunctionList);
            }
            _ => {}
        }
        // argc + 2 slots are released before the 3 bookkeeping slots go on
        if argc == 0 && !self.stack.has_room(1) {
            return Err(VmError::Stack);
        }

        let actrec = self
            .heap
            .darray_clone(closure.actrec.unwrap_or(self.dflt_actrec))?;
        for i in 0..argc {
            let arg = self.stack.peek(2 + i)?;
            self.heap.darray_push(actrec, arg)?;
        }
        let blockptr = self.alloc_value(Value::Int(self.stack.base() as i16))?;
        let ret = self.alloc_value(Value::Int(self.pc as i16))?;

        self.stack.truncate(self.stack.depth() - argc - 2);
        self.stack.push(blockptr)?;
        self.stack.push(self.lsyms)?;
        self.stack.push(ret)?;
        self.stack.set_base(self.stack.depth());
        self.lsyms = actrec;
        self.frame_depth += 1;

        match closure.target {
            ClosureTarget::Bytecode(addr) => self.pc = addr,
            ClosureTarget::Native(id) => {
                let depth = self.frame_depth;
                let function = self.flist[id as usize];
                function(self)?;
                if self.frame_depth + 1 != depth {
                    return Err(VmError::Return);
                }
            }
        }
        Ok(())
    }

    /// Leave the current frame, pushing nil as the result.
    pub fn ret0(&mut self) -> Result<(), VmError> {
        self.leave_frame(None)
    }

    /// Leave the current frame, carrying the value on top of the stack.
    pub fn ret1(&mut self) -> Result<(), VmError> {
        if self.stack.frame_len() == 0 {
            return Err(VmError::Return);
        }
        let value = self.stack.pop()?;
        self.leave_frame(Some(value))
    }

    fn leave_frame(&mut self, value: Option<HeapIdx>) -> Result<(), VmError> {
        if self.frame_depth == 0 {
            return Err(VmError::Return);
        }
        let base = self.stack.base();
        if base < 3 {
            return Err(VmError::Stack);
        }
        self.stack.truncate(base);
        self.stack.set_base(base - 3);
        let ret = self.pop_int()?;
        let caller_lsyms = self.stack.pop()?;
        let blockptr = self.pop_int()?;

        self.heap.darray_clear(self.lsyms);
        self.lsyms = caller_lsyms;
        self.stack.set_base(blockptr as u16 as usize);
        self.pc = ret as u16;
        self.frame_depth -= 1;
        self.stack.push(value.unwrap_or(self.nil))
    }

    /// Call `closure` from host code and run it to completion. Returns the
    /// result, which stays valid until the next collection.
    ///
    /// Errors are returned, not reported; the caller decides whether they
    /// reach [`Vm::set_error`]. On error the stack, frame, program counter
    /// and state are put back as they were on entry.
    pub fn call_closure(
        &mut self,
        closure: HeapIdx,
        args: &[HeapIdx],
    ) -> Result<HeapIdx, VmError> {
        let entry = CallSite {
            state: self.state,
            pc: self.pc,
            depth: self.stack.depth(),
            base: self.stack.base(),
            frame_depth: self.frame_depth,
            lsyms: self.lsyms,
        };
        self.state = VmState::Ready;
        let result = self.run_closure(closure, args, entry.frame_depth);
        if result.is_err() {
            self.stack.truncate(entry.depth);
            self.stack.set_base(entry.base);
            self.pc = entry.pc;
            self.frame_depth = entry.frame_depth;
            self.lsyms = entry.lsyms;
        }
        self.state = entry.state;
        result
    }

    fn run_closure(
        &mut self,
        closure: HeapIdx,
        args: &[HeapIdx],
        target: usize,
    ) -> Result<HeapIdx, VmError> {
        if !self.stack.has_room(args.len() + 2) {
            return Err(VmError::Stack);
        }
        for &arg in args.iter().rev() {
            self.stack.push(arg)?;
        }
        let argc = self.alloc_value(Value::Int(args.len() as i16))?;
        self.stack.push(argc)?;
        self.stack.push(closure)?;

        self.callc()?;
        while self.frame_depth > target {
            self.collect_garbage()?;
            self.exec()?;
            if self.state != VmState::Ready {
                // `done` inside a function body
                return Err(VmError::Return);
            }
        }
        self.stack.pop()
    }

    /// Call the global function `name`, e.g. the script's `init` or `step`.
    /// Allowed once the script is ready or done. Failures are reported
    /// through the error receiver as well as returned.
    pub fn function_call(
        &mut self,
        name: StringId,
        args: &[HeapIdx],
    ) -> Result<HeapIdx, VmError> {
        match self.state {
            VmState::Ready | VmState::Done => {}
            VmState::Error => return Err(self.error.unwrap_or(VmError::Instruction)),
            VmState::NoCode => return Err(VmError::ProgramCounter),
        }
        let pc = self.pc;
        let result = self.global(name).and_then(|function| {
            if self.heap.obj_type(function) != ObjType::Closure {
                return Err(VmError::Type);
            }
            self.call_closure(function, args)
        });
        if let Err(err) = result {
            self.pc = pc;
            self.set_error(err);
        }
        result
    }

    /// Add a host function and bind it to the global `name`. Returns its
    /// function list id. Only registered functions count against
    /// `function_capacity`; the standard ones come on top.
    pub fn register_function(
        &mut self,
        name: StringId,
        function: HostFunction,
    ) -> Result<u16, VmError> {
        if self.flist.len() - PRIMITIVES.len() >= self.function_capacity {
            return Err(VmError::FunctionList);
        }
        let id = self.flist.len() as u16;
        self.flist.push(function);
        let closure = self.alloc_value(Value::Closure(Closure {
            target: ClosureTarget::Native(id),
            actrec: None,
        }))?;
        self.set_global(name, closure)?;
        Ok(id)
    }

    #[inline]
    pub(crate) fn function_count(&self) -> usize {
        self.flist.len()
    }

    // ── host ABI ──────────────────────────────────────────────────────

    pub fn alloc_value(&mut self, value: Value) -> Result<HeapIdx, VmError> {
        match value {
            Value::Nil => Ok(self.nil),
            Value::Table(_) => Err(VmError::Type),
            value => Ok(self.heap.alloc_value(value)?),
        }
    }

    #[inline]
    pub fn value(&self, idx: HeapIdx) -> Value {
        self.heap.value(idx)
    }

    /// Local `i` of the current activation record; 0 is `self`.
    pub fn local(&self, i: u16) -> Result<HeapIdx, VmError> {
        self.heap.darray_get(self.lsyms, i).ok_or(VmError::LocalCount)
    }

    /// Number of arguments in the current activation record, `self` excluded.
    pub fn argc(&self) -> u16 {
        self.heap.darray_size(self.lsyms).saturating_sub(1)
    }

    /// Fail unless the current call received exactly `count` arguments.
    pub fn lnum_assert(&self, count: u16) -> Result<(), VmError> {
        if self.argc() != count {
            return Err(VmError::LocalCount);
        }
        Ok(())
    }

    pub fn int_arg(&self, i: u16) -> Result<i16, VmError> {
        self.value(self.local(i)?).as_int().ok_or(VmError::Type)
    }

    pub fn string_arg(&self, i: u16) -> Result<StringId, VmError> {
        self.value(self.local(i)?).as_string().ok_or(VmError::Type)
    }

    pub fn closure_arg(&self, i: u16) -> Result<HeapIdx, VmError> {
        let idx = self.local(i)?;
        if self.heap.obj_type(idx) != ObjType::Closure {
            return Err(VmError::Type);
        }
        Ok(idx)
    }

    pub fn table_arg(&self, i: u16) -> Result<HeapIdx, VmError> {
        let idx = self.local(i)?;
        self.expect_table(idx)
    }

    pub(crate) fn expect_table(&self, idx: HeapIdx) -> Result<HeapIdx, VmError> {
        if self.heap.obj_type(idx) != ObjType::Table || self.heap.is_darray(idx) {
            return Err(VmError::Type);
        }
        Ok(idx)
    }

    #[inline]
    pub fn push(&mut self, idx: HeapIdx) -> Result<(), VmError> {
        self.stack.push(idx)
    }

    #[inline]
    pub fn pop(&mut self) -> Result<HeapIdx, VmError> {
        self.stack.pop()
    }

    pub(crate) fn pop_int(&mut self) -> Result<i16, VmError> {
        let idx = self.stack.pop()?;
        self.value(idx).as_int().ok_or(VmError::Type)
    }

    pub fn push_nil(&mut self) -> Result<(), VmError> {
        self.stack.push(self.nil)
    }

    pub fn push_int(&mut self, value: i16) -> Result<(), VmError> {
        let idx = self.alloc_value(Value::Int(value))?;
        self.stack.push(idx)
    }

    pub fn push_float(&mut self, value: f32) -> Result<(), VmError> {
        let idx = self.alloc_value(Value::Float(Float16::from_f32(value)))?;
        self.stack.push(idx)
    }

    pub fn push_string(&mut self, id: StringId) -> Result<(), VmError> {
        if !self.strings.contains(id) {
            return Err(VmError::String);
        }
        let idx = self.alloc_value(Value::String(id))?;
        self.stack.push(idx)
    }

    pub fn push_table(&mut self) -> Result<HeapIdx, VmError> {
        let idx = self.heap.table_new()?;
        self.stack.push(idx)?;
        Ok(idx)
    }

    // ── tables and globals ────────────────────────────────────────────

    pub fn global(&mut self, name: StringId) -> Result<HeapIdx, VmError> {
        let key = self.alloc_value(Value::String(name))?;
        Ok(self.heap.table_get(self.gsyms, key).unwrap_or(self.nil))
    }

    pub fn set_global(&mut self, name: StringId, value: HeapIdx) -> Result<(), VmError> {
        let key = self.alloc_value(Value::String(name))?;
        self.heap.table_set(self.gsyms, key, value)?;
        Ok(())
    }

    /// `table[name]`, nil when absent.
    pub fn field(&mut self, table: HeapIdx, name: StringId) -> Result<HeapIdx, VmError> {
        let key = self.alloc_value(Value::String(name))?;
        Ok(self.heap.table_get(table, key).unwrap_or(self.nil))
    }

    pub fn set_field(
        &mut self,
        table: HeapIdx,
        name: StringId,
        value: HeapIdx,
    ) -> Result<(), VmError> {
        let key = self.alloc_value(Value::String(name))?;
        self.heap.table_set(table, key, value)?;
        Ok(())
    }

    pub(crate) fn alloc_native(&mut self, id: PrimitiveId) -> Result<HeapIdx, VmError> {
        self.alloc_value(Value::Closure(Closure {
            target: ClosureTarget::Native(id.id()),
            actrec: None,
        }))
    }

    /// Copy of `closure` bound to `table` as its `self`.
    pub(crate) fn bind_closure(
        &mut self,
        table: HeapIdx,
        closure: HeapIdx,
    ) -> Result<HeapIdx, VmError> {
        let Value::Closure(mut bound) = self.value(closure) else {
            return Ok(closure);
        };
        let actrec = match bound.actrec {
            Some(captured) => {
                let actrec = self.heap.darray_clone(captured)?;
                self.heap.set_flag(actrec, ObjFlags::FLAG_B, false);
                if !self.heap.darray_set(actrec, 0, table) {
                    self.heap.darray_push(actrec, table)?;
                }
                actrec
            }
            None => {
                let actrec = self.heap.darray_new()?;
                self.heap.darray_push(actrec, table)?;
                actrec
            }
        };
        bound.actrec = Some(actrec);
        self.alloc_value(Value::Closure(bound))
    }

    /// New table holding host methods bound to it.
    pub(crate) fn method_table(
        &mut self,
        methods: &[(Builtin, PrimitiveId)],
    ) -> Result<HeapIdx, VmError> {
        let table = self.heap.table_new()?;
        for &(name, id) in methods {
            let native = self.alloc_native(id)?;
            let method = self.bind_closure(table, native)?;
            self.set_field(table, name.id(), method)?;
        }
        Ok(table)
    }

    /// Printable form of an object, used by `log` and diagnostics.
    pub fn describe(&self, idx: HeapIdx) -> String {
        match self.value(idx) {
            Value::Nil => "nil".to_owned(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(id) => match self.strings.get(id) {
                Some(s) => s.to_owned(),
                None => format!("<string {id}>"),
            },
            Value::Table(_) => format!("[table @{idx}]"),
            Value::Closure(closure) => match closure.target {
                ClosureTarget::Bytecode(addr) => format!("[closure @{addr:04x}]"),
                ClosureTarget::Native(id) => match primitive_name(id) {
                    Some(name) => format!("[host closure {name}]"),
                    None => format!("[host closure #{id}]"),
                },
            },
            Value::Userdata(data) => format!("[userdata {data:#x}]"),
        }
    }
}
