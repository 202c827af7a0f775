use std::cmp::Ordering;

use crate::{
    Closure, ClosureTarget, Float16, HeapIdx, Opcode, StringId, Value, Vm, VmError, VmState,
    compare,
};

#[derive(Debug, Copy, Clone, PartialEq)]
enum Number {
    Int(i16),
    Float(f32),
}

impl Number {
    fn as_f32(self) -> f32 {
        match self {
            Number::Int(i) => i as f32,
            Number::Float(f) => f,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

fn arith(op: Arith, a: Number, b: Number) -> Result<Value, VmError> {
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        let result = match op {
            Arith::Add => x.wrapping_add(y),
            Arith::Sub => x.wrapping_sub(y),
            Arith::Mul => x.wrapping_mul(y),
            Arith::Div if y == 0 => return Err(VmError::Math),
            Arith::Div => x.wrapping_div(y),
            Arith::Mod if y == 0 => return Err(VmError::Math),
            Arith::Mod => x.wrapping_rem(y),
            Arith::Pow if y >= 0 => x.wrapping_pow(y as u32),
            Arith::Pow => return float_result((x as f32).powf(y as f32)),
        };
        return Ok(Value::Int(result));
    }
    let (x, y) = (a.as_f32(), b.as_f32());
    let result = match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div | Arith::Mod if y == 0.0 => return Err(VmError::Math),
        Arith::Div => x / y,
        Arith::Mod => x % y,
        Arith::Pow => x.powf(y),
    };
    float_result(result)
}

fn float_result(value: f32) -> Result<Value, VmError> {
    Ok(Value::Float(Float16::from_f32(value)))
}

fn bitwise(op: Opcode, a: i16, b: i16) -> i16 {
    match op {
        Opcode::BAnd => a & b,
        Opcode::BOr => a | b,
        Opcode::LShift => a.wrapping_shl(b as u32),
        Opcode::RShift => a.wrapping_shr(b as u32),
        _ => unreachable!("not a binary bitwise opcode"),
    }
}

impl Vm {
    fn number(&self, idx: HeapIdx) -> Result<Number, VmError> {
        match self.value(idx) {
            Value::Int(i) => Ok(Number::Int(i)),
            Value::Float(f) => Ok(Number::Float(f.to_f32())),
            _ => Err(VmError::Type),
        }
    }

    fn pop_pair(&mut self) -> Result<(HeapIdx, HeapIdx), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        Ok((a, b))
    }

    fn push_value(&mut self, value: Value) -> Result<(), VmError> {
        let idx = self.alloc_value(value)?;
        self.stack.push(idx)
    }

    fn push_bool(&mut self, value: bool) -> Result<(), VmError> {
        self.push_value(Value::Int(value as i16))
    }

    fn jump_to(&mut self, addr: u16) -> Result<(), VmError> {
        if addr as usize >= self.code_size() {
            return Err(VmError::ProgramCounter);
        }
        self.pc = addr;
        Ok(())
    }

    fn expect_string(&self, idx: HeapIdx) -> Result<StringId, VmError> {
        self.value(idx).as_string().ok_or(VmError::Type)
    }

    /// Execute the instruction at the program counter.
    pub(crate) fn exec(&mut self) -> Result<(), VmError> {
        let (op, operand) = self.fetch_instruction()?;
        log::trace!("{:04x} {}", self.pc, op.mnemonic());
        if op == Opcode::Done {
            self.state = VmState::Done;
            return Ok(());
        }
        self.pc += op.width() as u16;
        let operand = operand.unwrap_or(0);

        match op {
            Opcode::Nop | Opcode::Done => {}
            Opcode::PushNil => self.push_nil()?,
            Opcode::Dup => {
                let top = self.stack.peek(0)?;
                self.stack.push(top)?;
            }
            Opcode::Pop => {
                self.stack.pop()?;
            }
            Opcode::Ret0 => self.ret0()?,
            Opcode::Ret1 => self.ret1()?,

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let kind = match op {
                    Opcode::Add => Arith::Add,
                    Opcode::Sub => Arith::Sub,
                    Opcode::Mul => Arith::Mul,
                    Opcode::Div => Arith::Div,
                    Opcode::Mod => Arith::Mod,
                    _ => Arith::Pow,
                };
                let (a, b) = self.pop_pair()?;
                let result = arith(kind, self.number(a)?, self.number(b)?)?;
                self.push_value(result)?;
            }
            Opcode::Unm => {
                let a = self.stack.pop()?;
                let result = match self.number(a)? {
                    Number::Int(i) => Value::Int(i.wrapping_neg()),
                    Number::Float(f) => Value::Float(Float16::from_f32(-f)),
                };
                self.push_value(result)?;
            }

            Opcode::LAnd | Opcode::LOr => {
                let (a, b) = self.pop_pair()?;
                let (a, b) = (self.value(a).is_truthy(), self.value(b).is_truthy());
                let result = if op == Opcode::LAnd { a && b } else { a || b };
                self.push_bool(result)?;
            }
            Opcode::LNot => {
                let a = self.stack.pop()?;
                let result = !self.value(a).is_truthy();
                self.push_bool(result)?;
            }

            Opcode::BAnd | Opcode::BOr | Opcode::LShift | Opcode::RShift => {
                let (a, b) = self.pop_pair()?;
                let a = self.value(a).as_int().ok_or(VmError::Type)?;
                let b = self.value(b).as_int().ok_or(VmError::Type)?;
                self.push_value(Value::Int(bitwise(op, a, b)))?;
            }
            Opcode::BNot => {
                let a = self.stack.pop()?;
                let a = self.value(a).as_int().ok_or(VmError::Type)?;
                self.push_value(Value::Int(!a))?;
            }

            Opcode::Eq | Opcode::Neq | Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => {
                let (a, b) = self.pop_pair()?;
                let ordering = compare(&self.heap, a, b);
                let result = match op {
                    Opcode::Eq => ordering == Ordering::Equal,
                    Opcode::Neq => ordering != Ordering::Equal,
                    Opcode::Gt => ordering == Ordering::Greater,
                    Opcode::Gte => ordering != Ordering::Less,
                    Opcode::Lt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                };
                self.push_bool(result)?;
            }

            Opcode::GLoad => {
                let key = self.stack.pop()?;
                self.expect_string(key)?;
                let value = self.heap.table_get(self.gsyms, key).unwrap_or(self.nil);
                self.stack.push(value)?;
            }
            Opcode::GStore => {
                let (key, value) = self.pop_pair()?;
                self.expect_string(key)?;
                self.heap.table_set(self.gsyms, key, value)?;
            }

            Opcode::PushT => {
                self.push_table()?;
            }
            Opcode::TPut => {
                let value = self.stack.pop()?;
                let (table, key) = self.pop_pair()?;
                self.expect_table(table)?;
                let value = self.bind_closure(table, value)?;
                self.heap.table_set(table, key, value)?;
            }
            Opcode::TGet => {
                let (table, key) = self.pop_pair()?;
                self.expect_table(table)?;
                let value = self.heap.table_get(table, key).unwrap_or(self.nil);
                self.stack.push(value)?;
            }
            Opcode::CallC => self.callc()?,

            Opcode::PushF => self.push_value(Value::Float(Float16::from_bits(operand)))?,
            Opcode::PushI => self.push_value(Value::Int(operand as i16))?,
            Opcode::PushS => self.push_string(operand)?,
            Opcode::PushCN => self.push_value(Value::Closure(Closure {
                target: ClosureTarget::Bytecode(operand),
                actrec: None,
            }))?,
            Opcode::PushCC => {
                if operand as usize >= self.function_count() {
                    return Err(VmError::FunctionList);
                }
                self.push_value(Value::Closure(Closure {
                    target: ClosureTarget::Native(operand),
                    actrec: None,
                }))?;
            }
            Opcode::PushL => {
                let captured = self.heap.darray_clone(self.lsyms)?;
                self.push_value(Value::Closure(Closure {
                    target: ClosureTarget::Bytecode(operand),
                    actrec: Some(captured),
                }))?;
            }
            Opcode::LLoad => {
                let value = self.local(operand)?;
                self.stack.push(value)?;
            }
            Opcode::LStore => {
                let value = self.stack.pop()?;
                let size = self.heap.darray_size(self.lsyms);
                if operand < size {
                    self.heap.darray_set(self.lsyms, operand, value);
                } else if operand == size {
                    self.heap.darray_push(self.lsyms, value)?;
                } else {
                    return Err(VmError::LocalCount);
                }
            }
            Opcode::Jump => self.jump_to(operand)?,
            Opcode::JumpZ | Opcode::JumpNZ => {
                let cond = self.stack.pop()?;
                let truthy = self.value(cond).is_truthy();
                if truthy == (op == Opcode::JumpNZ) {
                    self.jump_to(operand)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(
            arith(Arith::Add, Number::Int(i16::MAX), Number::Int(1)),
            Ok(Value::Int(i16::MIN))
        );
        assert_eq!(
            arith(Arith::Div, Number::Int(i16::MIN), Number::Int(-1)),
            Ok(Value::Int(i16::MIN))
        );
        assert_eq!(
            arith(Arith::Mod, Number::Int(-7), Number::Int(3)),
            Ok(Value::Int(-1))
        );
    }

    #[test]
    fn division_by_zero_is_a_math_error() {
        assert_eq!(
            arith(Arith::Div, Number::Int(1), Number::Int(0)),
            Err(VmError::Math)
        );
        assert_eq!(
            arith(Arith::Mod, Number::Float(1.0), Number::Int(0)),
            Err(VmError::Math)
        );
    }

    #[test]
    fn mixed_operands_compute_in_float() {
        assert_eq!(
            arith(Arith::Mul, Number::Int(3), Number::Float(0.5)),
            Ok(Value::Float(Float16::from_f32(1.5)))
        );
    }

    #[test]
    fn pow_rules() {
        assert_eq!(
            arith(Arith::Pow, Number::Int(2), Number::Int(10)),
            Ok(Value::Int(1024))
        );
        assert_eq!(
            arith(Arith::Pow, Number::Int(2), Number::Int(-1)),
            Ok(Value::Float(Float16::from_f32(0.5)))
        );
    }

    #[test]
    fn shifts_and_masks() {
        assert_eq!(bitwise(Opcode::LShift, 1, 4), 16);
        assert_eq!(bitwise(Opcode::RShift, -16, 2), -4);
        assert_eq!(bitwise(Opcode::BAnd, 0b1100, 0b1010), 0b1000);
        assert_eq!(bitwise(Opcode::BOr, 0b1100, 0b1010), 0b1110);
    }
}
