use crate::{
    HeapIdx, Message, ObjType, PrimitiveId, Value, Vm, VmError, strings::Builtin,
};

/// One neighbor as reported by the robot's sensors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NeighborData {
    pub robot: u16,
    pub distance: u8,
    pub azimuth: u8,
    pub elevation: u8,
}

/// Neighbors seen during the current control cycle. The embedder resets
/// and refills it every tick.
#[derive(Debug, Clone)]
pub struct Neighbors {
    entries: Vec<NeighborData>,
    capacity: usize,
    /// Topic string -> listener closure.
    pub(crate) listeners: HeapIdx,
}

impl Neighbors {
    pub fn new(capacity: usize, listeners: HeapIdx) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            listeners,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Add or refresh a neighbor. Returns false when the table is full.
    pub fn add(&mut self, data: NeighborData) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.robot == data.robot) {
            *entry = data;
            return true;
        }
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push(data);
        true
    }

    pub fn get(&self, robot: u16) -> Option<&NeighborData> {
        self.entries.iter().find(|e| e.robot == robot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborData> {
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
}

/// Where a neighbor operation takes its entries from. The global `neighbors`
/// table reads the sensor array directly; tables produced by `map`,
/// `filter`, `kin` and `nonkin` are walked as ordinary tables keyed by
/// robot id.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NeighborView {
    Canonical,
    Derived(HeapIdx),
}

const NEIGHBORS_METHODS: &[(Builtin, PrimitiveId)] = &[
    (Builtin::Broadcast, PrimitiveId::NeighborsBroadcast),
    (Builtin::Listen, PrimitiveId::NeighborsListen),
    (Builtin::Ignore, PrimitiveId::NeighborsIgnore),
    (Builtin::Get, PrimitiveId::NeighborsGet),
    (Builtin::Foreach, PrimitiveId::NeighborsForeach),
    (Builtin::Map, PrimitiveId::NeighborsMap),
    (Builtin::Reduce, PrimitiveId::NeighborsReduce),
    (Builtin::Filter, PrimitiveId::NeighborsFilter),
    (Builtin::Count, PrimitiveId::NeighborsCount),
    (Builtin::Kin, PrimitiveId::NeighborsKin),
    (Builtin::Nonkin, PrimitiveId::NeighborsNonkin),
];

const DERIVED_METHODS: &[(Builtin, PrimitiveId)] = &[
    (Builtin::Get, PrimitiveId::DerivedGet),
    (Builtin::Foreach, PrimitiveId::DerivedForeach),
    (Builtin::Map, PrimitiveId::DerivedMap),
    (Builtin::Reduce, PrimitiveId::DerivedReduce),
    (Builtin::Filter, PrimitiveId::DerivedFilter),
    (Builtin::Count, PrimitiveId::DerivedCount),
    (Builtin::Kin, PrimitiveId::DerivedKin),
    (Builtin::Nonkin, PrimitiveId::DerivedNonkin),
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kinship {
    Kin,
    Nonkin,
}

impl Vm {
    /// The global `neighbors` table.
    pub(crate) fn new_neighbors_table(&mut self) -> Result<HeapIdx, VmError> {
        self.method_table(NEIGHBORS_METHODS)
    }

    fn neighbor_record(&mut self, data: NeighborData) -> Result<HeapIdx, VmError> {
        let record = self.heap.table_new()?;
        for (name, field) in [
            (Builtin::Distance, data.distance),
            (Builtin::Azimuth, data.azimuth),
            (Builtin::Elevation, data.elevation),
        ] {
            let value = self.alloc_value(Value::Int(field as i16))?;
            self.set_field(record, name.id(), value)?;
        }
        Ok(record)
    }

    /// Robot ids visible through `view`, with the stored value for derived
    /// tables. Non-integer keys (the methods) are skipped.
    fn view_entries(&self, view: NeighborView) -> Vec<(u16, Option<HeapIdx>)> {
        match view {
            NeighborView::Canonical => self.neighbors.iter().map(|n| (n.robot, None)).collect(),
            NeighborView::Derived(table) => self
                .heap
                .table_entries(table)
                .into_iter()
                .filter_map(|(k, v)| Some((self.value(k).as_int()? as u16, Some(v))))
                .collect(),
        }
    }

    /// Value handed to callbacks for one entry. Canonical entries get a fresh
    /// `{distance, azimuth, elevation}` table.
    fn view_value(&mut self, robot: u16, stored: Option<HeapIdx>) -> Result<HeapIdx, VmError> {
        if let Some(value) = stored {
            return Ok(value);
        }
        match self.neighbors.get(robot).copied() {
            Some(data) => self.neighbor_record(data),
            None => Ok(self.nil),
        }
    }

    /// Push a new derived table; it stays on the stack while it is filled.
    fn push_derived(&mut self) -> Result<HeapIdx, VmError> {
        let table = self.method_table(DERIVED_METHODS)?;
        self.push(table)?;
        Ok(table)
    }

    fn set_robot_entry(
        &mut self,
        table: HeapIdx,
        robot: u16,
        value: HeapIdx,
    ) -> Result<(), VmError> {
        let key = self.alloc_value(Value::Int(robot as i16))?;
        self.heap.table_set(table, key, value)?;
        Ok(())
    }

    fn neighbors_get(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(1)?;
        let robot = self.int_arg(1)? as u16;
        let value = match view {
            NeighborView::Canonical => match self.neighbors.get(robot).copied() {
                Some(data) => self.neighbor_record(data)?,
                None => self.nil,
            },
            NeighborView::Derived(table) => {
                let key = self.local(1)?;
                self.heap.table_get(table, key).unwrap_or(self.nil)
            }
        };
        self.push(value)?;
        self.ret1()
    }

    fn neighbors_foreach(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(1)?;
        let callback = self.closure_arg(1)?;
        for (robot, stored) in self.view_entries(view) {
            let value = self.view_value(robot, stored)?;
            let id = self.alloc_value(Value::Int(robot as i16))?;
            self.call_closure(callback, &[id, value])?;
        }
        self.ret0()
    }

    fn neighbors_map(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(1)?;
        let callback = self.closure_arg(1)?;
        let result = self.push_derived()?;
        for (robot, stored) in self.view_entries(view) {
            let value = self.view_value(robot, stored)?;
            let id = self.alloc_value(Value::Int(robot as i16))?;
            let mapped = self.call_closure(callback, &[id, value])?;
            self.set_robot_entry(result, robot, mapped)?;
        }
        self.ret1()
    }

    fn neighbors_filter(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(1)?;
        let callback = self.closure_arg(1)?;
        let result = self.push_derived()?;
        for (robot, stored) in self.view_entries(view) {
            let value = self.view_value(robot, stored)?;
            let id = self.alloc_value(Value::Int(robot as i16))?;
            // `value` is only referenced from the callee's record, keep it
            // reachable until it is stored
            self.push(value)?;
            let keep = self.call_closure(callback, &[id, value])?;
            let value = self.pop()?;
            if self.value(keep).is_truthy() {
                self.set_robot_entry(result, robot, value)?;
            }
        }
        self.ret1()
    }

    fn neighbors_reduce(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(2)?;
        let callback = self.closure_arg(1)?;
        let accumulator = self.local(2)?;
        self.push(accumulator)?;
        for (robot, stored) in self.view_entries(view) {
            let value = self.view_value(robot, stored)?;
            let id = self.alloc_value(Value::Int(robot as i16))?;
            let accumulator = self.stack.peek(0)?;
            let next = self.call_closure(callback, &[id, value, accumulator])?;
            self.stack.set_peek(0, next)?;
        }
        self.ret1()
    }

    fn neighbors_count(&mut self, view: NeighborView) -> Result<(), VmError> {
        self.lnum_assert(0)?;
        let count = self.view_entries(view).len();
        self.push_int(count as i16)?;
        self.ret1()
    }

    fn neighbors_kinship(&mut self, view: NeighborView, kinship: Kinship) -> Result<(), VmError> {
        self.lnum_assert(0)?;
        let result = self.push_derived()?;
        for (robot, stored) in self.view_entries(view) {
            if self.swarm.is_kin(robot) != (kinship == Kinship::Kin) {
                continue;
            }
            let value = self.view_value(robot, stored)?;
            self.set_robot_entry(result, robot, value)?;
        }
        self.ret1()
    }

    fn derived_view(&self) -> Result<NeighborView, VmError> {
        let table = self.local(0)?;
        if self.heap.obj_type(table) != ObjType::Table {
            return Err(VmError::Type);
        }
        Ok(NeighborView::Derived(table))
    }

    /// Deliver an incoming broadcast to the listener registered for `topic`.
    pub(crate) fn deliver_broadcast(
        &mut self,
        robot: u16,
        topic: HeapIdx,
        value: HeapIdx,
    ) -> Result<(), VmError> {
        let Some(listener) = self.heap.table_get(self.neighbors.listeners, topic) else {
            return Ok(());
        };
        if self.heap.obj_type(listener) != ObjType::Closure {
            return Ok(());
        }
        let sender = self.alloc_value(Value::Int(robot as i16))?;
        self.call_closure(listener, &[topic, value, sender])?;
        Ok(())
    }
}

pub(crate) fn broadcast(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(2)?;
    let topic = vm.string_arg(1)?;
    let value = vm.value(vm.local(2)?);
    vm.queue_outmsg(Message::Broadcast {
        robot: vm.robot(),
        topic,
        value,
    });
    vm.ret0()
}

pub(crate) fn listen(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(2)?;
    vm.string_arg(1)?;
    let topic = vm.local(1)?;
    let listener = vm.closure_arg(2)?;
    vm.heap.table_set(vm.neighbors.listeners, topic, listener)?;
    vm.ret0()
}

pub(crate) fn ignore(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    vm.string_arg(1)?;
    let topic = vm.local(1)?;
    vm.heap.table_set(vm.neighbors.listeners, topic, vm.nil)?;
    vm.ret0()
}

pub(crate) fn get(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_get(NeighborView::Canonical)
}

pub(crate) fn foreach(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_foreach(NeighborView::Canonical)
}

pub(crate) fn map(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_map(NeighborView::Canonical)
}

pub(crate) fn reduce(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_reduce(NeighborView::Canonical)
}

pub(crate) fn filter(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_filter(NeighborView::Canonical)
}

pub(crate) fn count(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_count(NeighborView::Canonical)
}

pub(crate) fn kin(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_kinship(NeighborView::Canonical, Kinship::Kin)
}

pub(crate) fn nonkin(vm: &mut Vm) -> Result<(), VmError> {
    vm.neighbors_kinship(NeighborView::Canonical, Kinship::Nonkin)
}

pub(crate) fn derived_get(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_get(view)
}

pub(crate) fn derived_foreach(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_foreach(view)
}

pub(crate) fn derived_map(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_map(view)
}

pub(crate) fn derived_reduce(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_reduce(view)
}

pub(crate) fn derived_filter(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_filter(view)
}

pub(crate) fn derived_count(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_count(view)
}

pub(crate) fn derived_kin(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_kinship(view, Kinship::Kin)
}

pub(crate) fn derived_nonkin(vm: &mut Vm) -> Result<(), VmError> {
    let view = vm.derived_view()?;
    vm.neighbors_kinship(view, Kinship::Nonkin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(robot: u16, distance: u8) -> NeighborData {
        NeighborData {
            robot,
            distance,
            azimuth: 0,
            elevation: 0,
        }
    }

    #[test]
    fn add_refreshes_existing_robot() {
        let mut neighbors = Neighbors::new(2, 0);
        assert!(neighbors.add(neighbor(3, 10)));
        assert!(neighbors.add(neighbor(3, 20)));
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors.get(3).map(|n| n.distance), Some(20));
    }

    #[test]
    fn add_fails_when_full() {
        let mut neighbors = Neighbors::new(2, 0);
        assert!(neighbors.add(neighbor(1, 1)));
        assert!(neighbors.add(neighbor(2, 1)));
        assert!(!neighbors.add(neighbor(3, 1)));
        neighbors.reset();
        assert!(neighbors.is_empty());
        assert!(neighbors.add(neighbor(3, 1)));
    }
}
