use crate::{
    HeapIdx, Lamport, Message, ObjType, PrimitiveId, StringId, Value, Vm, VmError, VstigOp,
    lamport::is_newer, strings::Builtin,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VstigEntry {
    pub key: StringId,
    /// Permanent copy owned by the entry.
    pub value: HeapIdx,
    pub timestamp: Lamport,
    /// Robot that wrote the current value.
    pub robot: u16,
}

/// The robot's replica of the shared key/value store.
#[derive(Debug, Clone)]
pub struct VirtualStigmergy {
    entries: Vec<VstigEntry>,
    capacity: usize,
    pub(crate) onconflict: Option<HeapIdx>,
    pub(crate) onconflictlost: Option<HeapIdx>,
}

impl VirtualStigmergy {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            onconflict: None,
            onconflictlost: None,
        }
    }

    pub fn get(&self, key: StringId) -> Option<&VstigEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    fn position(&self, key: StringId) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VstigEntry> {
        self.entries.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

/// One side of a conflict as seen by the script.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) robot: u16,
    pub(crate) value: HeapIdx,
    pub(crate) timestamp: Lamport,
}

impl From<&VstigEntry> for Record {
    fn from(entry: &VstigEntry) -> Self {
        Self {
            robot: entry.robot,
            value: entry.value,
            timestamp: entry.timestamp,
        }
    }
}

const STIGMERGY_METHODS: &[(Builtin, PrimitiveId)] = &[
    (Builtin::Put, PrimitiveId::StigmergyPut),
    (Builtin::Get, PrimitiveId::StigmergyGet),
    (Builtin::Size, PrimitiveId::StigmergySize),
    (Builtin::Onconflict, PrimitiveId::StigmergyOnconflict),
    (Builtin::Onconflictlost, PrimitiveId::StigmergyOnconflictlost),
];

impl Vm {
    fn vstig_reset(&mut self) {
        for entry in self.vstig.entries.drain(..) {
            self.heap.clear_permanent(entry.value);
        }
        self.vstig.onconflict = None;
        self.vstig.onconflictlost = None;
    }

    fn owned_copy(&mut self, value: HeapIdx) -> Result<HeapIdx, VmError> {
        let copy = self.heap.copy(value)?;
        self.heap.make_permanent(copy);
        Ok(copy)
    }

    /// Replace the value of entry `pos`, releasing the old copy.
    fn vstig_store(&mut self, pos: usize, record: Record) -> Result<(), VmError> {
        let old = self.vstig.entries[pos].value;
        let value = if record.value == old {
            old
        } else {
            let copy = self.owned_copy(record.value)?;
            self.heap.clear_permanent(old);
            copy
        };
        let entry = &mut self.vstig.entries[pos];
        entry.value = value;
        entry.robot = record.robot;
        entry.timestamp = record.timestamp;
        Ok(())
    }

    fn vstig_insert(&mut self, key: StringId, record: Record) -> Result<(), VmError> {
        let value = self.owned_copy(record.value)?;
        self.vstig.entries.push(VstigEntry {
            key,
            value,
            timestamp: record.timestamp,
            robot: record.robot,
        });
        Ok(())
    }

    fn queue_vstig(&mut self, op: VstigOp, key: StringId, pos: usize) {
        let entry = self.vstig.entries[pos];
        let value = self.value(entry.value);
        self.queue_outmsg(Message::Vstig {
            op,
            robot: entry.robot,
            key,
            value,
            lamport: entry.timestamp,
        });
    }

    /// Apply a PUT or QUERY received from another robot.
    pub(crate) fn vstig_receive(
        &mut self,
        op: VstigOp,
        key: StringId,
        remote: Record,
    ) -> Result<(), VmError> {
        let Some(pos) = self.vstig.position(key) else {
            if op == VstigOp::Query && self.heap.obj_type(remote.value) == ObjType::Nil {
                return Ok(());
            }
            if self.vstig.is_full() {
                log::trace!("stigmergy full, dropping key {key}");
                return Ok(());
            }
            self.vstig_insert(key, remote)?;
            self.queue_vstig(op, key, self.vstig.len() - 1);
            return Ok(());
        };

        let local = Record::from(&self.vstig.entries[pos]);
        if is_newer(remote.timestamp, local.timestamp) {
            self.vstig_store(pos, remote)?;
            self.queue_vstig(VstigOp::Put, key, pos);
        } else if remote.timestamp == local.timestamp && remote.robot != local.robot {
            self.vstig_conflict(key, pos, local, remote)?;
        } else if op == VstigOp::Query && is_newer(local.timestamp, remote.timestamp) {
            self.queue_vstig(VstigOp::Put, key, pos);
        }
        Ok(())
    }

    fn record_table(&mut self, record: Record) -> Result<HeapIdx, VmError> {
        let table = self.heap.table_new()?;
        let robot = self.alloc_value(Value::Int(record.robot as i16))?;
        self.set_field(table, Builtin::Robot.id(), robot)?;
        self.set_field(table, Builtin::Data.id(), record.value)?;
        let timestamp = self.alloc_value(Value::Int(record.timestamp as i16))?;
        self.set_field(table, Builtin::Timestamp.id(), timestamp)?;
        Ok(table)
    }

    /// Read back a record table. Robot ids must be non-negative and
    /// timestamps must fit a Lamport clock.
    fn parse_record(&mut self, table: HeapIdx) -> Result<Record, VmError> {
        self.expect_table(table)?;
        let robot = self.field(table, Builtin::Robot.id())?;
        let robot = self.value(robot).as_int().ok_or(VmError::Type)?;
        let timestamp = self.field(table, Builtin::Timestamp.id())?;
        let timestamp = self.value(timestamp).as_int().ok_or(VmError::Type)?;
        let value = self.field(table, Builtin::Data.id())?;
        Ok(Record {
            robot: u16::try_from(robot).map_err(|_| VmError::Type)?,
            value,
            timestamp: Lamport::try_from(timestamp).map_err(|_| VmError::Type)?,
        })
    }

    fn vstig_conflict(
        &mut self,
        key: StringId,
        pos: usize,
        local: Record,
        remote: Record,
    ) -> Result<(), VmError> {
        let key_idx = self.alloc_value(Value::String(key))?;
        let winner = match self.vstig.onconflict {
            Some(callback) => {
                let local_table = self.record_table(local)?;
                let remote_table = self.record_table(remote)?;
                let result =
                    self.call_closure(callback, &[key_idx, local_table, remote_table])?;
                self.parse_record(result)?
            }
            None if remote.robot > local.robot => remote,
            None => local,
        };
        log::debug!(
            "stigmergy conflict on key {key}: robot {} vs robot {}, robot {} wins",
            local.robot,
            remote.robot,
            winner.robot
        );

        let lost = match self.vstig.onconflictlost {
            Some(callback) if local.robot == self.robot && winner.robot != self.robot => {
                Some((callback, self.record_table(local)?))
            }
            _ => None,
        };
        self.vstig_store(pos, winner)?;
        self.queue_vstig(VstigOp::Put, key, pos);
        if let Some((callback, record)) = lost {
            self.call_closure(callback, &[key_idx, record])?;
        }
        Ok(())
    }
}

/// `stigmergy.create(id)`: (re)initialize the store and return its table.
pub(crate) fn create(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let id = vm.local(1)?;
    vm.value(id).as_int().ok_or(VmError::Type)?;
    vm.vstig_reset();
    let table = vm.method_table(STIGMERGY_METHODS)?;
    vm.set_field(table, Builtin::Id.id(), id)?;
    vm.push(table)?;
    vm.ret1()
}

pub(crate) fn put(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(2)?;
    let key = vm.string_arg(1)?;
    let value = vm.local(2)?;
    let pos = match vm.vstig.position(key) {
        Some(pos) => {
            let timestamp = vm.vstig.entries[pos].timestamp.wrapping_add(1);
            let robot = vm.robot;
            vm.vstig_store(
                pos,
                Record {
                    robot,
                    value,
                    timestamp,
                },
            )?;
            pos
        }
        None if vm.vstig.is_full() => return Err(VmError::VstigFull),
        None => {
            let robot = vm.robot;
            vm.vstig_insert(
                key,
                Record {
                    robot,
                    value,
                    timestamp: 1,
                },
            )?;
            vm.vstig.len() - 1
        }
    };
    vm.queue_vstig(VstigOp::Put, key, pos);
    vm.ret0()
}

pub(crate) fn get(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let key = vm.string_arg(1)?;
    match vm.vstig.position(key) {
        Some(pos) => {
            vm.queue_vstig(VstigOp::Query, key, pos);
            let value = vm.vstig.entries[pos].value;
            vm.push(value)?;
        }
        None => {
            vm.queue_outmsg(Message::Vstig {
                op: VstigOp::Query,
                robot: vm.robot,
                key,
                value: Value::Nil,
                lamport: 0,
            });
            vm.push_nil()?;
        }
    }
    vm.ret1()
}

pub(crate) fn size(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(0)?;
    let size = vm.vstig.len();
    vm.push_int(size as i16)?;
    vm.ret1()
}

pub(crate) fn onconflict(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    vm.vstig.onconflict = Some(vm.closure_arg(1)?);
    vm.ret0()
}

pub(crate) fn onconflictlost(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    vm.vstig.onconflictlost = Some(vm.closure_arg(1)?);
    vm.ret0()
}
