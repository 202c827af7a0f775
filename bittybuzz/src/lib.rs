mod barrier;
pub mod bytecode;
mod darray;
mod error;
pub mod float;
mod heap;
mod inmsg;
mod interpreter;
pub mod lamport;
pub mod message;
mod neighbors;
mod object;
mod outmsg;
mod primitives;
mod ringbuf;
mod stack;
pub mod strings;
mod swarm;
mod table;
mod vm;
mod vstig;

pub use barrier::SenseBarrier;
pub use bytecode::{BytecodeBuilder, BytecodeFetch, ImageHeader, Instruction, Opcode, disassemble};
pub use error::*;
pub use float::Float16;
pub use heap::{
    ELEMS_PER_SEG, ELEMS_PER_TSEG, GarbageCollectionStats, Heap, HeapIdx, HeapSettings,
    HeapStats, NO_NEXT, OBJ_SIZE, OutOfMemory, SEG_SIZE, SegIdx,
};
pub use inmsg::InMsgQueue;
pub use lamport::{LAMPORT_THRESHOLD, Lamport};
pub use message::{MESSAGE_SIZE, Message, MsgKind, SwarmOp, VstigOp};
pub use neighbors::{NeighborData, Neighbors};
pub use object::*;
pub use outmsg::OutMsgQueue;
pub use primitives::{HostFunction, PRIMITIVES, Primitive, PrimitiveId, primitive_name};
pub use ringbuf::RingBuffer;
pub use stack::{OperandStack, StackSettings};
pub use strings::{BUILTIN_NAMES, Builtin, StringId, StringTable};
pub use swarm::{MAX_SWARMS, SWARMLIST_BROADCAST_PERIOD, SWARMLIST_TTL, Swarm, SwarmEntry};
pub use vm::*;
pub use vstig::{VirtualStigmergy, VstigEntry};
