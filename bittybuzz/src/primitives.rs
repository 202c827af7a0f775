use crate::{Vm, VmError, neighbors, swarm, vstig};

/// A host function. It reads its arguments through [`Vm::local`] and must
/// finish with exactly one of [`Vm::ret0`] or [`Vm::ret1`].
pub type HostFunction = fn(&mut Vm) -> Result<(), VmError>;

#[derive(Debug, Copy, Clone)]
pub struct Primitive {
    pub name: &'static str,
    pub ptr: HostFunction,
}

impl Primitive {
    pub const fn new(name: &'static str, ptr: HostFunction) -> Self {
        Self { name, ptr }
    }
}

/// Function list ids of the standard host functions. Registered functions
/// are numbered after them.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrimitiveId {
    Log = 0,
    NeighborsBroadcast,
    NeighborsListen,
    NeighborsIgnore,
    NeighborsGet,
    NeighborsForeach,
    NeighborsMap,
    NeighborsReduce,
    NeighborsFilter,
    NeighborsCount,
    NeighborsKin,
    NeighborsNonkin,
    DerivedGet,
    DerivedForeach,
    DerivedMap,
    DerivedReduce,
    DerivedFilter,
    DerivedCount,
    DerivedKin,
    DerivedNonkin,
    StigmergyCreate,
    StigmergyPut,
    StigmergyGet,
    StigmergySize,
    StigmergyOnconflict,
    StigmergyOnconflictlost,
    SwarmCreate,
    SwarmJoin,
    SwarmLeave,
    SwarmIn,
    SwarmSelect,
    SwarmExec,
}

impl PrimitiveId {
    #[inline]
    pub const fn id(self) -> u16 {
        self as u16
    }
}

pub const PRIMITIVES: &[Primitive] = &[
    Primitive::new("log", log),
    Primitive::new("neighbors.broadcast", neighbors::broadcast),
    Primitive::new("neighbors.listen", neighbors::listen),
    Primitive::new("neighbors.ignore", neighbors::ignore),
    Primitive::new("neighbors.get", neighbors::get),
    Primitive::new("neighbors.foreach", neighbors::foreach),
    Primitive::new("neighbors.map", neighbors::map),
    Primitive::new("neighbors.reduce", neighbors::reduce),
    Primitive::new("neighbors.filter", neighbors::filter),
    Primitive::new("neighbors.count", neighbors::count),
    Primitive::new("neighbors.kin", neighbors::kin),
    Primitive::new("neighbors.nonkin", neighbors::nonkin),
    Primitive::new("derived.get", neighbors::derived_get),
    Primitive::new("derived.foreach", neighbors::derived_foreach),
    Primitive::new("derived.map", neighbors::derived_map),
    Primitive::new("derived.reduce", neighbors::derived_reduce),
    Primitive::new("derived.filter", neighbors::derived_filter),
    Primitive::new("derived.count", neighbors::derived_count),
    Primitive::new("derived.kin", neighbors::derived_kin),
    Primitive::new("derived.nonkin", neighbors::derived_nonkin),
    Primitive::new("stigmergy.create", vstig::create),
    Primitive::new("stigmergy.put", vstig::put),
    Primitive::new("stigmergy.get", vstig::get),
    Primitive::new("stigmergy.size", vstig::size),
    Primitive::new("stigmergy.onconflict", vstig::onconflict),
    Primitive::new("stigmergy.onconflictlost", vstig::onconflictlost),
    Primitive::new("swarm.create", swarm::create),
    Primitive::new("swarm.join", swarm::join),
    Primitive::new("swarm.leave", swarm::leave),
    Primitive::new("swarm.in", swarm::is_member),
    Primitive::new("swarm.select", swarm::select),
    Primitive::new("swarm.exec", swarm::exec),
];

/// Name of a standard host function, for diagnostics.
pub fn primitive_name(id: u16) -> Option<&'static str> {
    PRIMITIVES.get(id as usize).map(|p| p.name)
}

/// `log(...)`: writes every argument, space separated.
fn log(vm: &mut Vm) -> Result<(), VmError> {
    let line = (1..=vm.argc())
        .map(|i| vm.local(i).map(|arg| vm.describe(arg)))
        .collect::<Result<Vec<_>, _>>()?
        .join(" ");
    log::info!("[robot {}] {}", vm.robot(), line);
    vm.ret0()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_index_the_table() {
        assert_eq!(PRIMITIVES.len(), PrimitiveId::SwarmExec as usize + 1);
        assert_eq!(primitive_name(PrimitiveId::Log.id()), Some("log"));
        assert_eq!(
            primitive_name(PrimitiveId::DerivedMap.id()),
            Some("derived.map")
        );
        assert_eq!(
            primitive_name(PrimitiveId::StigmergyOnconflictlost.id()),
            Some("stigmergy.onconflictlost")
        );
        assert_eq!(primitive_name(PrimitiveId::SwarmExec.id()), Some("swarm.exec"));
        assert_eq!(primitive_name(PRIMITIVES.len() as u16), None);
    }
}
