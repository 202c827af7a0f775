use crate::{HeapIdx, Message, PrimitiveId, SwarmOp, Value, Vm, VmError, strings::Builtin};

/// Ticks between two SWARM_LIST announcements.
pub const SWARMLIST_BROADCAST_PERIOD: u16 = 10;
/// Ticks a swarm-list entry survives without being refreshed.
pub const SWARMLIST_TTL: u8 = 50;
/// Swarm ids are bit positions of the membership mask.
pub const MAX_SWARMS: i16 = 8;

/// Membership of another robot, as last announced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwarmEntry {
    pub robot: u16,
    pub swarms: u8,
    pub lamport: u16,
    ttl: u8,
}

/// Local swarm membership and the swarm list of known robots.
#[derive(Debug, Clone)]
pub struct Swarm {
    mask: u8,
    lamport: u16,
    list: Vec<SwarmEntry>,
    capacity: usize,
    ticks: u16,
}

/// `a` is the same as or after `b` on a wrapping 16-bit clock.
fn not_older(a: u16, b: u16) -> bool {
    a.wrapping_sub(b) as i16 >= 0
}

impl Swarm {
    pub fn new(capacity: usize) -> Self {
        Self {
            mask: 0,
            lamport: 0,
            list: Vec::with_capacity(capacity),
            capacity,
            ticks: 0,
        }
    }

    /// Local membership mask, one bit per swarm id.
    #[inline]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    #[inline]
    pub fn is_member(&self, swarm: u8) -> bool {
        self.mask & (1 << swarm) != 0
    }

    pub fn entries(&self) -> impl Iterator<Item = &SwarmEntry> {
        self.list.iter()
    }

    /// Last announced membership of `robot`.
    pub fn robot_swarms(&self, robot: u16) -> Option<u8> {
        self.list.iter().find(|e| e.robot == robot).map(|e| e.swarms)
    }

    /// `robot` shares at least one swarm with the local robot.
    pub fn is_kin(&self, robot: u16) -> bool {
        self.robot_swarms(robot)
            .is_some_and(|swarms| swarms & self.mask != 0)
    }

    /// Change local membership of `swarm`, returning the message announcing
    /// it. No message is produced when nothing changes.
    fn set_member(&mut self, robot: u16, swarm: u8, member: bool) -> Option<Message<Value>> {
        if self.is_member(swarm) == member {
            return None;
        }
        let bit = 1 << swarm;
        if member {
            self.mask |= bit;
        } else {
            self.mask &= !bit;
        }
        self.lamport = self.lamport.wrapping_add(1);
        Some(Message::Swarm {
            op: if member { SwarmOp::Join } else { SwarmOp::Leave },
            robot,
            lamport: self.lamport,
            swarms: bit,
        })
    }

    /// Apply a swarm message received from `robot`.
    pub fn apply(&mut self, op: SwarmOp, robot: u16, lamport: u16, swarms: u8) {
        let pos = match self.list.iter().position(|e| e.robot == robot) {
            Some(pos) => pos,
            None => {
                if self.list.len() >= self.capacity {
                    log::trace!("swarm list full, dropping robot {robot}");
                    return;
                }
                self.list.push(SwarmEntry {
                    robot,
                    swarms: 0,
                    lamport: lamport.wrapping_sub(1),
                    ttl: SWARMLIST_TTL,
                });
                self.list.len() - 1
            }
        };
        let entry = &mut self.list[pos];
        entry.ttl = SWARMLIST_TTL;
        let before = entry.swarms;
        match op {
            SwarmOp::List if not_older(lamport, entry.lamport) => entry.swarms = swarms,
            SwarmOp::Join if lamport != entry.lamport && not_older(lamport, entry.lamport) => {
                entry.swarms |= swarms
            }
            SwarmOp::Leave if lamport != entry.lamport && not_older(lamport, entry.lamport) => {
                entry.swarms &= !swarms
            }
            _ => return,
        }
        entry.lamport = lamport;
        if entry.swarms != before {
            log::debug!(
                "robot {robot} swarms changed: {before:#010b} -> {:#010b}",
                entry.swarms
            );
        }
    }

    /// Advance one control cycle. Ages the swarm list and returns a
    /// SWARM_LIST announcement every [`SWARMLIST_BROADCAST_PERIOD`] ticks.
    pub fn tick(&mut self, robot: u16) -> Option<Message<Value>> {
        self.list.retain_mut(|entry| {
            entry.ttl = entry.ttl.saturating_sub(1);
            entry.ttl > 0
        });
        self.ticks = self.ticks.wrapping_add(1);
        (self.ticks % SWARMLIST_BROADCAST_PERIOD == 0).then_some(Message::Swarm {
            op: SwarmOp::List,
            robot,
            lamport: self.lamport,
            swarms: self.mask,
        })
    }
}

const SWARM_METHODS: &[(Builtin, PrimitiveId)] = &[
    (Builtin::Join, PrimitiveId::SwarmJoin),
    (Builtin::Leave, PrimitiveId::SwarmLeave),
    (Builtin::In, PrimitiveId::SwarmIn),
    (Builtin::Select, PrimitiveId::SwarmSelect),
    (Builtin::Exec, PrimitiveId::SwarmExec),
];

impl Vm {
    /// Swarm id stored in the swarm table `self`.
    fn swarm_self_id(&mut self) -> Result<u8, VmError> {
        let table = self.local(0)?;
        self.expect_table(table)?;
        let id = self.field(table, Builtin::Id.id())?;
        let id = self.value(id).as_int().ok_or(VmError::Type)?;
        if !(0..MAX_SWARMS).contains(&id) {
            return Err(VmError::Swarm);
        }
        Ok(id as u8)
    }

    fn swarm_select(&mut self, member: bool) -> Result<(), VmError> {
        let swarm = self.swarm_self_id()?;
        if let Some(msg) = self.swarm.set_member(self.robot, swarm, member) {
            self.queue_outmsg(msg);
        }
        Ok(())
    }
}

/// `swarm.create(id)`
pub(crate) fn create(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let id = vm.int_arg(1)?;
    if !(0..MAX_SWARMS).contains(&id) {
        return Err(VmError::Swarm);
    }
    let id: HeapIdx = vm.local(1)?;
    let table = vm.method_table(SWARM_METHODS)?;
    vm.set_field(table, Builtin::Id.id(), id)?;
    vm.push(table)?;
    vm.ret1()
}

pub(crate) fn join(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(0)?;
    vm.swarm_select(true)?;
    vm.ret0()
}

pub(crate) fn leave(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(0)?;
    vm.swarm_select(false)?;
    vm.ret0()
}

/// `swarm.in()`
pub(crate) fn is_member(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(0)?;
    let swarm = vm.swarm_self_id()?;
    let member = vm.swarm.is_member(swarm);
    vm.push_int(member as i16)?;
    vm.ret1()
}

/// `swarm.select(cond)`: join when `cond` is true, leave otherwise.
pub(crate) fn select(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let cond = vm.local(1)?;
    let member = vm.value(cond).is_truthy();
    vm.swarm_select(member)?;
    vm.ret0()
}

/// `swarm.exec(fn)`: call `fn` when the robot is a member.
pub(crate) fn exec(vm: &mut Vm) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let function = vm.closure_arg(1)?;
    let swarm = vm.swarm_self_id()?;
    if vm.swarm.is_member(swarm) {
        vm.call_closure(function, &[])?;
    }
    vm.ret0()
}
