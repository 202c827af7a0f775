use std::fmt::Write as _;

use crate::{BUILTIN_NAMES, BytecodeError, StringId, float::fromfloat};

/// Instruction opcodes.
///
/// Opcodes from [`Opcode::PushF`] onward carry one 2-byte little-endian
/// operand. Addresses in operands are offsets from the start of the code
/// section, right after the string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Done,
    PushNil,
    Dup,
    Pop,
    Ret0,
    Ret1,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    LAnd,
    LOr,
    LNot,
    BAnd,
    BOr,
    BNot,
    LShift,
    RShift,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    GLoad,
    GStore,
    PushT,
    TPut,
    TGet,
    CallC,

    /// Push a float. Operand: float16 bits
    PushF,
    /// Push an int. Operand: `i16`
    PushI,
    /// Push a string. Operand: string id
    PushS,
    /// Push a bytecode closure. Operand: code address
    PushCN,
    /// Push a host closure. Operand: function list id
    PushCC,
    /// Push a lambda capturing the current locals. Operand: code address
    PushL,
    LLoad,
    LStore,
    Jump,
    /// Jump if the popped value is falsy.
    JumpZ,
    /// Jump if the popped value is truthy.
    JumpNZ,
}

const OPCODES: [Opcode; 45] = [
    Opcode::Nop,
    Opcode::Done,
    Opcode::PushNil,
    Opcode::Dup,
    Opcode::Pop,
    Opcode::Ret0,
    Opcode::Ret1,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Mod,
    Opcode::Pow,
    Opcode::Unm,
    Opcode::LAnd,
    Opcode::LOr,
    Opcode::LNot,
    Opcode::BAnd,
    Opcode::BOr,
    Opcode::BNot,
    Opcode::LShift,
    Opcode::RShift,
    Opcode::Eq,
    Opcode::Neq,
    Opcode::Gt,
    Opcode::Gte,
    Opcode::Lt,
    Opcode::Lte,
    Opcode::GLoad,
    Opcode::GStore,
    Opcode::PushT,
    Opcode::TPut,
    Opcode::TGet,
    Opcode::CallC,
    Opcode::PushF,
    Opcode::PushI,
    Opcode::PushS,
    Opcode::PushCN,
    Opcode::PushCC,
    Opcode::PushL,
    Opcode::LLoad,
    Opcode::LStore,
    Opcode::Jump,
    Opcode::JumpZ,
    Opcode::JumpNZ,
];

impl Opcode {
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        OPCODES.get(byte as usize).copied()
    }

    #[inline]
    pub fn has_operand(self) -> bool {
        self as u8 >= Opcode::PushF as u8
    }

    /// Encoded length including the operand.
    #[inline]
    pub fn width(self) -> usize {
        if self.has_operand() { 3 } else { 1 }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Done => "done",
            Opcode::PushNil => "pushnil",
            Opcode::Dup => "dup",
            Opcode::Pop => "pop",
            Opcode::Ret0 => "ret0",
            Opcode::Ret1 => "ret1",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Pow => "pow",
            Opcode::Unm => "unm",
            Opcode::LAnd => "and",
            Opcode::LOr => "or",
            Opcode::LNot => "not",
            Opcode::BAnd => "band",
            Opcode::BOr => "bor",
            Opcode::BNot => "bnot",
            Opcode::LShift => "lshift",
            Opcode::RShift => "rshift",
            Opcode::Eq => "eq",
            Opcode::Neq => "neq",
            Opcode::Gt => "gt",
            Opcode::Gte => "gte",
            Opcode::Lt => "lt",
            Opcode::Lte => "lte",
            Opcode::GLoad => "gload",
            Opcode::GStore => "gstore",
            Opcode::PushT => "pusht",
            Opcode::TPut => "tput",
            Opcode::TGet => "tget",
            Opcode::CallC => "callc",
            Opcode::PushF => "pushf",
            Opcode::PushI => "pushi",
            Opcode::PushS => "pushs",
            Opcode::PushCN => "pushcn",
            Opcode::PushCC => "pushcc",
            Opcode::PushL => "pushl",
            Opcode::LLoad => "lload",
            Opcode::LStore => "lstore",
            Opcode::Jump => "jump",
            Opcode::JumpZ => "jumpz",
            Opcode::JumpNZ => "jumpnz",
        }
    }
}

/// Random access to a bytecode image. Images may live in flash or be
/// streamed, so the VM never assumes the whole image is one slice.
pub trait BytecodeFetch {
    fn size(&self) -> usize;

    /// `len` bytes at `offset`, or `None` past the end of the image.
    fn fetch(&self, offset: usize, len: usize) -> Option<&[u8]>;
}

impl<T: AsRef<[u8]>> BytecodeFetch for T {
    fn size(&self) -> usize {
        self.as_ref().len()
    }

    fn fetch(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.as_ref().get(offset..offset.checked_add(len)?)
    }
}

pub(crate) fn fetch_u8(image: &dyn BytecodeFetch, offset: usize) -> Option<u8> {
    image.fetch(offset, 1).map(|b| b[0])
}

pub(crate) fn fetch_u16(image: &dyn BytecodeFetch, offset: usize) -> Option<u16> {
    image
        .fetch(offset, 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub strings: Vec<String>,
    /// Image offset of the first instruction.
    pub code_start: usize,
}

pub fn parse_header(image: &dyn BytecodeFetch) -> Result<ImageHeader, BytecodeError> {
    let count = fetch_u16(image, 0).ok_or(BytecodeError::Truncated)?;
    let mut offset = 2;
    let mut strings = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut bytes = Vec::new();
        loop {
            let byte = fetch_u8(image, offset).ok_or(BytecodeError::Truncated)?;
            offset += 1;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        strings.push(String::from_utf8(bytes).map_err(|_| BytecodeError::InvalidString)?);
    }
    Ok(ImageHeader {
        strings,
        code_start: offset,
    })
}

/// A forward reference whose address has not been resolved yet.
///
/// Created by the jump and closure emitters. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use]
pub struct Label {
    operand_pos: usize,
}

/// Assembles a bytecode image: string table followed by code.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    strings: Vec<String>,
    code: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code address.
    pub fn current_offset(&self) -> u16 {
        self.code.len() as u16
    }

    /// Id for `value`, adding it to the image string table if it is not a
    /// builtin name.
    pub fn string(&mut self, value: &str) -> StringId {
        if let Some(pos) = BUILTIN_NAMES.iter().position(|&name| name == value) {
            return pos as StringId;
        }
        let pos = match self.strings.iter().position(|s| s == value) {
            Some(pos) => pos,
            None => {
                self.strings.push(value.to_owned());
                self.strings.len() - 1
            }
        };
        (BUILTIN_NAMES.len() + pos) as StringId
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut image = Vec::with_capacity(2 + self.code.len());
        image.extend_from_slice(&(self.strings.len() as u16).to_le_bytes());
        for s in &self.strings {
            image.extend_from_slice(s.as_bytes());
            image.push(0);
        }
        image.extend_from_slice(&self.code);
        image
    }

    // ── emit helpers ───────────────────────────────────────────────

    /// Emit any operand-less instruction.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        debug_assert!(!op.has_operand(), "{op:?} needs an operand");
        self.code.push(op as u8);
        self
    }

    /// Emit any operand-carrying instruction.
    pub fn op_arg(&mut self, op: Opcode, operand: u16) -> &mut Self {
        debug_assert!(op.has_operand(), "{op:?} takes no operand");
        self.code.push(op as u8);
        self.code.extend_from_slice(&operand.to_le_bytes());
        self
    }

    /// `nop`, which also ends the prologue.
    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop)
    }

    pub fn done(&mut self) -> &mut Self {
        self.op(Opcode::Done)
    }

    pub fn push_nil(&mut self) -> &mut Self {
        self.op(Opcode::PushNil)
    }

    pub fn push_int(&mut self, value: i16) -> &mut Self {
        self.op_arg(Opcode::PushI, value as u16)
    }

    pub fn push_float(&mut self, value: f32) -> &mut Self {
        self.op_arg(Opcode::PushF, fromfloat(value))
    }

    pub fn push_string(&mut self, value: &str) -> &mut Self {
        let id = self.string(value);
        self.op_arg(Opcode::PushS, id)
    }

    pub fn push_host_closure(&mut self, function: u16) -> &mut Self {
        self.op_arg(Opcode::PushCC, function)
    }

    pub fn lload(&mut self, index: u16) -> &mut Self {
        self.op_arg(Opcode::LLoad, index)
    }

    pub fn lstore(&mut self, index: u16) -> &mut Self {
        self.op_arg(Opcode::LStore, index)
    }

    /// `pushs name; <value code>; gstore`
    pub fn store_global(&mut self, name: &str, value: impl FnOnce(&mut Self)) -> &mut Self {
        self.push_string(name);
        value(self);
        self.op(Opcode::GStore)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        self.push_string(name);
        self.op(Opcode::GLoad)
    }

    /// `pushi argc; <closure code>; callc`. Arguments must already be on the
    /// stack, last argument first.
    pub fn call(&mut self, argc: i16, closure: impl FnOnce(&mut Self)) -> &mut Self {
        self.push_int(argc);
        closure(self);
        self.op(Opcode::CallC)
    }

    /// Emit `op` with a placeholder address operand.
    pub fn forward(&mut self, op: Opcode) -> Label {
        debug_assert!(op.has_operand());
        self.code.push(op as u8);
        let operand_pos = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        Label { operand_pos }
    }

    /// Resolve `label` to the current address.
    pub fn bind(&mut self, label: Label) -> u16 {
        let target = self.current_offset();
        self.code[label.operand_pos..label.operand_pos + 2]
            .copy_from_slice(&target.to_le_bytes());
        target
    }
}

/// One decoded instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u16,
    pub op: Opcode,
    pub operand: Option<u16>,
}

/// Decode the instruction at code address `offset`.
pub fn decode(code: &[u8], offset: usize) -> Option<Instruction> {
    let op = Opcode::from_u8(*code.get(offset)?)?;
    let operand = if op.has_operand() {
        let bytes = code.get(offset + 1..offset + 3)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    } else {
        None
    };
    Some(Instruction {
        offset: offset as u16,
        op,
        operand,
    })
}

/// Human-readable listing of an image.
pub fn disassemble(image: &[u8]) -> Result<String, BytecodeError> {
    let header = parse_header(&image)?;
    let mut out = String::new();
    let first = BUILTIN_NAMES.len();
    for (i, s) in header.strings.iter().enumerate() {
        let _ = writeln!(out, "; string {:>4} {:?}", first + i, s);
    }
    let code = &image[header.code_start..];
    let string_name = |id: u16| -> Option<&str> {
        let id = id as usize;
        if id < first {
            Some(BUILTIN_NAMES[id])
        } else {
            header.strings.get(id - first).map(String::as_str)
        }
    };

    let mut offset = 0;
    while offset < code.len() {
        let Some(instr) = decode(code, offset) else {
            let _ = writeln!(out, "{offset:04x}  .byte {:#04x}", code[offset]);
            offset += 1;
            continue;
        };
        let _ = write!(out, "{:04x}  {}", instr.offset, instr.op.mnemonic());
        if let Some(operand) = instr.operand {
            match instr.op {
                Opcode::PushI => {
                    let _ = write!(out, " {}", operand as i16);
                }
                Opcode::PushF => {
                    let _ = write!(out, " {}", crate::float::tofloat(operand));
                }
                Opcode::PushS => match string_name(operand) {
                    Some(name) => {
                        let _ = write!(out, " {operand} ; {name:?}");
                    }
                    None => {
                        let _ = write!(out, " {operand} ; <unknown>");
                    }
                },
                Opcode::PushCN | Opcode::PushL | Opcode::Jump | Opcode::JumpZ | Opcode::JumpNZ => {
                    let _ = write!(out, " {operand:04x}");
                }
                _ => {
                    let _ = write!(out, " {operand}");
                }
            }
        }
        out.push('\n');
        offset += instr.op.width();
    }
    Ok(out)
}
