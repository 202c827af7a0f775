use std::fmt;

use crate::OutOfMemory;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VmError {
    /// Unknown opcode.
    Instruction = 1,
    /// Operand stack underflow or overflow.
    Stack,
    /// Local access outside the activation record.
    LocalCount,
    /// Program counter outside the bytecode.
    ProgramCounter,
    /// Unknown host function id.
    FunctionList,
    Type,
    /// Function returned in the wrong way.
    Return,
    /// Unknown string id.
    String,
    /// Unknown swarm id.
    Swarm,
    VstigFull,
    OutOfMemory,
    Math,
}

impl VmError {
    pub fn name(self) -> &'static str {
        match self {
            VmError::Instruction => "INSTR",
            VmError::Stack => "STACK",
            VmError::LocalCount => "LNUM",
            VmError::ProgramCounter => "PC",
            VmError::FunctionList => "FLIST",
            VmError::Type => "TYPE",
            VmError::Return => "RET",
            VmError::String => "STRING",
            VmError::Swarm => "SWARM",
            VmError::VstigFull => "VSTIG_FULL",
            VmError::OutOfMemory => "MEM",
            VmError::Math => "MATH",
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            VmError::Instruction => "unknown instruction",
            VmError::Stack => "stack underflow or overflow",
            VmError::LocalCount => "wrong number of locals",
            VmError::ProgramCounter => "program counter out of range",
            VmError::FunctionList => "unknown function id",
            VmError::Type => "type mismatch",
            VmError::Return => "return value mismatch",
            VmError::String => "unknown string id",
            VmError::Swarm => "unknown swarm id",
            VmError::VstigFull => "virtual stigmergy is full",
            VmError::OutOfMemory => "out of memory",
            VmError::Math => "arithmetic error",
        };
        write!(f, "{} ({})", message, self.name())
    }
}

impl std::error::Error for VmError {}

impl From<OutOfMemory> for VmError {
    fn from(_: OutOfMemory) -> Self {
        VmError::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmState {
    NoCode,
    Ready,
    Error,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmCreateError {
    Settings(&'static str),
    OutOfMemory,
}

impl fmt::Display for VmCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmCreateError::Settings(reason) => {
                write!(f, "invalid vm settings: {reason}")
            }
            VmCreateError::OutOfMemory => {
                f.write_str("heap too small for the vm's own objects")
            }
        }
    }
}

impl std::error::Error for VmCreateError {}

impl From<&'static str> for VmCreateError {
    fn from(reason: &'static str) -> Self {
        VmCreateError::Settings(reason)
    }
}

impl From<VmError> for VmCreateError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfMemory => VmCreateError::OutOfMemory,
            _ => VmCreateError::Settings("standard globals could not be registered"),
        }
    }
}

impl From<OutOfMemory> for VmCreateError {
    fn from(_: OutOfMemory) -> Self {
        VmCreateError::OutOfMemory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    Truncated,
    InvalidString,
    /// The prologue stopped in an error state.
    Prologue(VmError),
}

impl fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BytecodeError::Truncated => f.write_str("bytecode image is truncated"),
            BytecodeError::InvalidString => {
                f.write_str("string table entry is not valid utf-8")
            }
            BytecodeError::Prologue(err) => write!(f, "prologue failed: {err}"),
        }
    }
}

impl std::error::Error for BytecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_converts() {
        let err: VmError = OutOfMemory.into();
        assert_eq!(err, VmError::OutOfMemory);
        assert_eq!(err.to_string(), "out of memory (MEM)");
    }

    #[test]
    fn settings_reason_is_kept() {
        let err: VmCreateError = "bad".into();
        assert_eq!(err.to_string(), "invalid vm settings: bad");
    }
}
