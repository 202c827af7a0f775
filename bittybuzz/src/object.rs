use std::cmp::Ordering;

use bitflags::bitflags;

use crate::{Float16, Heap, HeapIdx, SegIdx, StringId};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjType {
    Nil = 0,
    Int = 1,
    Float = 2,
    String = 3,
    Table = 4,
    Closure = 5,
    Userdata = 6,
}

impl ObjType {
    pub const MASK: u8 = 0b111;

    pub fn from_bits(bits: u8) -> Option<Self> {
        let ty = match bits & Self::MASK {
            0 => ObjType::Nil,
            1 => ObjType::Int,
            2 => ObjType::Float,
            3 => ObjType::String,
            4 => ObjType::Table,
            5 => ObjType::Closure,
            6 => ObjType::Userdata,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjType::Nil => "nil",
            ObjType::Int => "int",
            ObjType::Float => "float",
            ObjType::String => "string",
            ObjType::Table => "table",
            ObjType::Closure => "closure",
            ObjType::Userdata => "userdata",
        }
    }
}

bitflags! {
    /// Metadata bits sharing the byte with the 3-bit type tag.
    ///
    /// `FLAG_A` / `FLAG_B` are type dependent: dynamic array / cloned for
    /// tables, native / lambda for closures.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        const VALID = 1 << 3;
        const PERMANENT = 1 << 4;
        const MARK = 1 << 5;
        const FLAG_A = 1 << 6;
        const FLAG_B = 1 << 7;
    }
}

// [0..<3 type]
// [3 valid] [4 permanent] [5 mark]
// [6 flag a] [7 flag b]
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header(u8);

impl Header {
    pub const INVALID: Header = Header(0);

    #[inline]
    pub fn encode(ty: ObjType, flags: ObjFlags) -> Self {
        Self(ty as u8 | flags.bits())
    }

    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn object_type(self) -> Option<ObjType> {
        ObjType::from_bits(self.0)
    }

    #[inline]
    pub fn flags(self) -> ObjFlags {
        ObjFlags::from_bits_truncate(self.0 & !ObjType::MASK)
    }

    #[inline]
    pub fn has(self, flag: ObjFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.has(ObjFlags::VALID)
    }

    #[inline]
    pub fn with(self, flag: ObjFlags, on: bool) -> Self {
        let mut flags = self.flags();
        flags.set(flag, on);
        Self((self.0 & ObjType::MASK) | flags.bits())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Table {
    pub head: SegIdx,
    pub darray: bool,
    pub cloned: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClosureTarget {
    /// Address into the bytecode.
    Bytecode(u16),
    /// Index into the host function list.
    Native(u16),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Closure {
    pub target: ClosureTarget,
    /// Captured activation record, present on lambda closures only.
    pub actrec: Option<HeapIdx>,
}

impl Closure {
    pub fn is_native(&self) -> bool {
        matches!(self.target, ClosureTarget::Native(_))
    }

    pub fn is_lambda(&self) -> bool {
        self.actrec.is_some()
    }
}

/// Decoded view of one heap object.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i16),
    Float(Float16),
    String(StringId),
    Table(Table),
    Closure(Closure),
    Userdata(u32),
}

impl Value {
    pub fn object_type(&self) -> ObjType {
        match self {
            Value::Nil => ObjType::Nil,
            Value::Int(_) => ObjType::Int,
            Value::Float(_) => ObjType::Float,
            Value::String(_) => ObjType::String,
            Value::Table(_) => ObjType::Table,
            Value::Closure(_) => ObjType::Closure,
            Value::Userdata(_) => ObjType::Userdata,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(value) => *value != 0,
            Value::Float(value) => !value.is_zero(),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i16> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Int(value) => Some(*value as f32),
            Value::Float(value) => Some(value.to_f32()),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<StringId> {
        match self {
            Value::String(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<Table> {
        match self {
            Value::Table(table) => Some(*table),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<Closure> {
        match self {
            Value::Closure(closure) => Some(*closure),
            _ => None,
        }
    }

    /// Pack into `(type tag | flag a | flag b, value, aux)`.
    pub(crate) fn encode(&self) -> (u8, u16, u16) {
        let a = ObjFlags::FLAG_A.bits();
        let b = ObjFlags::FLAG_B.bits();
        match *self {
            Value::Nil => (ObjType::Nil as u8, 0, 0),
            Value::Int(value) => (ObjType::Int as u8, value as u16, 0),
            Value::Float(value) => (ObjType::Float as u8, value.to_bits(), 0),
            Value::String(id) => (ObjType::String as u8, id, 0),
            Value::Table(table) => {
                let mut tag = ObjType::Table as u8;
                if table.darray {
                    tag |= a;
                }
                if table.cloned {
                    tag |= b;
                }
                (tag, table.head, 0)
            }
            Value::Closure(closure) => {
                let mut tag = ObjType::Closure as u8;
                let value = match closure.target {
                    ClosureTarget::Bytecode(addr) => addr,
                    ClosureTarget::Native(id) => {
                        tag |= a;
                        id
                    }
                };
                let aux = match closure.actrec {
                    Some(actrec) => {
                        tag |= b;
                        actrec
                    }
                    None => 0,
                };
                (tag, value, aux)
            }
            Value::Userdata(word) => {
                (ObjType::Userdata as u8, word as u16, (word >> 16) as u16)
            }
        }
    }

    pub(crate) fn decode(header: Header, value: u16, aux: u16) -> Value {
        let a = header.has(ObjFlags::FLAG_A);
        let b = header.has(ObjFlags::FLAG_B);
        match header.object_type() {
            Some(ObjType::Int) => Value::Int(value as i16),
            Some(ObjType::Float) => Value::Float(Float16::from_bits(value)),
            Some(ObjType::String) => Value::String(value),
            Some(ObjType::Table) => Value::Table(Table {
                head: value,
                darray: a,
                cloned: b,
            }),
            Some(ObjType::Closure) => Value::Closure(Closure {
                target: if a {
                    ClosureTarget::Native(value)
                } else {
                    ClosureTarget::Bytecode(value)
                },
                actrec: b.then_some(aux),
            }),
            Some(ObjType::Userdata) => {
                Value::Userdata(value as u32 | ((aux as u32) << 16))
            }
            Some(ObjType::Nil) | None => Value::Nil,
        }
    }
}

/// Total order used by table key lookup and array search.
///
/// Two indices naming the same object are equal, whatever their type.
pub fn compare(heap: &Heap, a: HeapIdx, b: HeapIdx) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    compare_values(&heap.value(a), &heap.value(b))
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Nil, Value::Nil) => Ordering::Equal,
        (Value::Nil, _) => Ordering::Less,
        (_, Value::Nil) => Ordering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => {
            // both sides are numeric here
            let (x, y) = (a.as_f32().unwrap_or(0.0), b.as_f32().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Less)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Userdata(x), Value::Userdata(y)) => x.cmp(y),
        // no meaningful order across other types
        _ => Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_type_and_flags() {
        let header =
            Header::encode(ObjType::Table, ObjFlags::VALID | ObjFlags::FLAG_A);
        assert_eq!(header.object_type(), Some(ObjType::Table));
        assert!(header.is_valid());
        assert!(header.has(ObjFlags::FLAG_A));
        assert!(!header.has(ObjFlags::MARK));

        let marked = header.with(ObjFlags::MARK, true);
        assert!(marked.has(ObjFlags::MARK));
        assert_eq!(marked.object_type(), Some(ObjType::Table));
        assert!(!marked.with(ObjFlags::MARK, false).has(ObjFlags::MARK));
    }

    #[test]
    fn closure_encoding_keeps_target_and_actrec() {
        let lambda = Value::Closure(Closure {
            target: ClosureTarget::Native(7),
            actrec: Some(42),
        });
        let (tag, value, aux) = lambda.encode();
        let header = Header::from_raw(tag | ObjFlags::VALID.bits());
        assert_eq!(Value::decode(header, value, aux), lambda);

        let plain = Value::Closure(Closure {
            target: ClosureTarget::Bytecode(300),
            actrec: None,
        });
        let (tag, value, aux) = plain.encode();
        let header = Header::from_raw(tag | ObjFlags::VALID.bits());
        assert_eq!(Value::decode(header, value, aux), plain);
    }

    #[test]
    fn userdata_keeps_all_32_bits() {
        let data = Value::Userdata(0xDEAD_BEEF);
        let (tag, value, aux) = data.encode();
        assert_eq!(Value::decode(Header::from_raw(tag), value, aux), data);
    }

    #[test]
    fn nil_sorts_before_everything() {
        assert_eq!(compare_values(&Value::Nil, &Value::Nil), Ordering::Equal);
        assert_eq!(
            compare_values(&Value::Nil, &Value::Int(-5)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::String(0), &Value::Nil),
            Ordering::Greater
        );
    }

    #[test]
    fn mixed_numbers_compare_as_floats() {
        let two = Value::Int(2);
        let two_and_half = Value::Float(Float16::from_f32(2.5));
        let two_float = Value::Float(Float16::from_f32(2.0));
        assert_eq!(compare_values(&two, &two_and_half), Ordering::Less);
        assert_eq!(compare_values(&two_and_half, &two), Ordering::Greater);
        assert_eq!(compare_values(&two, &two_float), Ordering::Equal);
    }

    #[test]
    fn unrelated_types_answer_less() {
        let table = Value::Table(Table {
            head: 0,
            darray: false,
            cloned: false,
        });
        assert_eq!(compare_values(&table, &Value::Int(1)), Ordering::Less);
        assert_eq!(compare_values(&Value::Int(1), &table), Ordering::Less);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(Float16::ZERO).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::String(0).is_truthy());
    }
}
