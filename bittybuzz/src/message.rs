use crate::{
    ClosureTarget, Float16, Lamport, ObjFlags, ObjType, StringId, Value,
};

/// Size of the largest wire message.
pub const MESSAGE_SIZE: usize = 9;

/// Wire tags. Lower values are sent first.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgKind {
    Broadcast = 0,
    SwarmList,
    VstigPut,
    VstigQuery,
    SwarmJoin,
    SwarmLeave,
}

impl MsgKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let kind = match byte {
            0 => MsgKind::Broadcast,
            1 => MsgKind::SwarmList,
            2 => MsgKind::VstigPut,
            3 => MsgKind::VstigQuery,
            4 => MsgKind::SwarmJoin,
            5 => MsgKind::SwarmLeave,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VstigOp {
    Put,
    Query,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwarmOp {
    /// Full membership mask.
    List,
    /// Bits joined.
    Join,
    /// Bits left.
    Leave,
}

/// A decoded message. Outgoing messages carry heap-independent [`Value`]
/// snapshots; incoming ones carry heap indices of their payload objects.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Message<V> {
    Broadcast {
        robot: u16,
        topic: StringId,
        value: V,
    },
    Vstig {
        op: VstigOp,
        /// Owner of the entry, not necessarily the sender.
        robot: u16,
        key: StringId,
        value: V,
        lamport: Lamport,
    },
    Swarm {
        op: SwarmOp,
        robot: u16,
        lamport: u16,
        swarms: u8,
    },
}

impl<V> Message<V> {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Broadcast { .. } => MsgKind::Broadcast,
            Message::Vstig { op: VstigOp::Put, .. } => MsgKind::VstigPut,
            Message::Vstig { op: VstigOp::Query, .. } => MsgKind::VstigQuery,
            Message::Swarm { op: SwarmOp::List, .. } => MsgKind::SwarmList,
            Message::Swarm { op: SwarmOp::Join, .. } => MsgKind::SwarmJoin,
            Message::Swarm { op: SwarmOp::Leave, .. } => MsgKind::SwarmLeave,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Message::Broadcast { value, .. } | Message::Vstig { value, .. } => Some(value),
            Message::Swarm { .. } => None,
        }
    }

    /// Same message with its payload transformed.
    pub fn map_value<W>(self, f: impl FnOnce(V) -> W) -> Message<W> {
        match self {
            Message::Broadcast {
                robot,
                topic,
                value,
            } => Message::Broadcast {
                robot,
                topic,
                value: f(value),
            },
            Message::Vstig {
                op,
                robot,
                key,
                value,
                lamport,
            } => Message::Vstig {
                op,
                robot,
                key,
                value: f(value),
                lamport,
            },
            Message::Swarm {
                op,
                robot,
                lamport,
                swarms,
            } => Message::Swarm {
                op,
                robot,
                lamport,
                swarms,
            },
        }
    }
}

/// Flatten a value into `[type | flags][value hi][value lo]`. Tables and
/// user data have no flat form.
pub fn serialize_value(value: &Value) -> Option<[u8; 3]> {
    let (tag, word) = match *value {
        Value::Nil => (ObjType::Nil as u8, 0),
        Value::Int(i) => (ObjType::Int as u8, i as u16),
        Value::Float(f) => (ObjType::Float as u8, f.to_bits()),
        Value::String(id) => (ObjType::String as u8, id),
        Value::Closure(closure) => match closure.target {
            ClosureTarget::Bytecode(addr) => (ObjType::Closure as u8, addr),
            ClosureTarget::Native(id) => (ObjType::Closure as u8 | ObjFlags::FLAG_A.bits(), id),
        },
        Value::Table(_) | Value::Userdata(_) => return None,
    };
    let [hi, lo] = word.to_be_bytes();
    Some([tag, hi, lo])
}

pub fn deserialize_value(bytes: &[u8]) -> Option<Value> {
    let &[tag, hi, lo] = bytes.get(..3)? else {
        return None;
    };
    let word = u16::from_be_bytes([hi, lo]);
    let value = match ObjType::from_bits(tag)? {
        ObjType::Nil => Value::Nil,
        ObjType::Int => Value::Int(word as i16),
        ObjType::Float => Value::Float(Float16::from_bits(word)),
        ObjType::String => Value::String(word),
        ObjType::Closure => Value::Closure(crate::Closure {
            target: if tag & ObjFlags::FLAG_A.bits() != 0 {
                ClosureTarget::Native(word)
            } else {
                ClosureTarget::Bytecode(word)
            },
            actrec: None,
        }),
        ObjType::Table | ObjType::Userdata => return None,
    };
    Some(value)
}

fn put_u16(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
}

fn get_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Write `msg` into `buf`, returning the number of bytes written. `None`
/// means the payload cannot be flattened or `buf` is too small; nothing is
/// written in that case.
pub fn serialize(msg: &Message<Value>, buf: &mut [u8]) -> Option<usize> {
    let (len, flat) = match msg {
        Message::Broadcast { value, .. } => (8, Some(serialize_value(value)?)),
        Message::Vstig { value, .. } => (9, Some(serialize_value(value)?)),
        Message::Swarm { .. } => (6, None),
    };
    if buf.len() < len {
        return None;
    }
    buf[0] = msg.kind() as u8;
    match *msg {
        Message::Broadcast { robot, topic, .. } => {
            put_u16(buf, 1, robot);
            put_u16(buf, 3, topic);
        }
        Message::Vstig {
            robot, key, lamport, ..
        } => {
            put_u16(buf, 1, robot);
            put_u16(buf, 3, key);
            buf[8] = lamport;
        }
        Message::Swarm {
            robot,
            lamport,
            swarms,
            ..
        } => {
            put_u16(buf, 1, robot);
            put_u16(buf, 3, lamport);
            buf[5] = swarms;
        }
    }
    if let Some(flat) = flat {
        buf[5..8].copy_from_slice(&flat);
    }
    Some(len)
}

/// Decode a wire payload. Short or malformed payloads yield `None`.
pub fn deserialize(buf: &[u8]) -> Option<Message<Value>> {
    let kind = MsgKind::from_u8(*buf.first()?)?;
    let robot = get_u16(buf, 1)?;
    let msg = match kind {
        MsgKind::Broadcast => Message::Broadcast {
            robot,
            topic: get_u16(buf, 3)?,
            value: deserialize_value(buf.get(5..)?)?,
        },
        MsgKind::VstigPut | MsgKind::VstigQuery => Message::Vstig {
            op: if kind == MsgKind::VstigPut {
                VstigOp::Put
            } else {
                VstigOp::Query
            },
            robot,
            key: get_u16(buf, 3)?,
            value: deserialize_value(buf.get(5..)?)?,
            lamport: *buf.get(8)?,
        },
        MsgKind::SwarmList | MsgKind::SwarmJoin | MsgKind::SwarmLeave => Message::Swarm {
            op: match kind {
                MsgKind::SwarmList => SwarmOp::List,
                MsgKind::SwarmJoin => SwarmOp::Join,
                _ => SwarmOp::Leave,
            },
            robot,
            lamport: get_u16(buf, 3)?,
            swarms: *buf.get(5)?,
        },
    };
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vstig_put_layout_is_big_endian() {
        let msg = Message::Vstig {
            op: VstigOp::Put,
            robot: 0x0102,
            key: 0x0304,
            value: Value::Int(0x0506),
            lamport: 7,
        };
        let mut buf = [0u8; MESSAGE_SIZE];
        assert_eq!(serialize(&msg, &mut buf), Some(9));
        assert_eq!(
            buf,
            [MsgKind::VstigPut as u8, 1, 2, 3, 4, ObjType::Int as u8, 5, 6, 7]
        );
        assert_eq!(deserialize(&buf), Some(msg));
    }

    #[test]
    fn tables_are_refused_without_writing() {
        let msg = Message::Broadcast {
            robot: 1,
            topic: 2,
            value: Value::Table(crate::Table {
                head: 0,
                darray: false,
                cloned: false,
            }),
        };
        let mut buf = [0xAAu8; MESSAGE_SIZE];
        assert_eq!(serialize(&msg, &mut buf), None);
        assert_eq!(buf, [0xAA; MESSAGE_SIZE]);
    }

    #[test]
    fn short_reads_are_rejected() {
        let msg = Message::Broadcast {
            robot: 1,
            topic: 2,
            value: Value::Float(Float16::from_f32(1.5)),
        };
        let mut buf = [0u8; MESSAGE_SIZE];
        let len = serialize(&msg, &mut buf).unwrap();
        assert_eq!(deserialize(&buf[..len]), Some(msg));
        for cut in 0..len {
            assert_eq!(deserialize(&buf[..cut]), None);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(deserialize(&[42, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn native_closures_keep_their_flag() {
        let value = Value::Closure(crate::Closure {
            target: ClosureTarget::Native(3),
            actrec: Some(9),
        });
        let flat = serialize_value(&value).unwrap();
        assert_eq!(
            deserialize_value(&flat),
            Some(Value::Closure(crate::Closure {
                target: ClosureTarget::Native(3),
                actrec: None,
            }))
        );
    }

    #[test]
    fn kinds_order_by_priority() {
        assert!(MsgKind::Broadcast < MsgKind::SwarmList);
        assert!(MsgKind::VstigQuery < MsgKind::SwarmLeave);
    }
}
