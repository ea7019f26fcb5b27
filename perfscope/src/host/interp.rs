//! Stack interpreter for instruction bodies
//!
//! A small evaluation-stack machine. Locals are shared cells so `LdLocA`
//! can hand out a managed pointer that callees write through, which is how
//! value-type receivers are passed to instance methods.

use std::sync::Arc;

use parking_lot::Mutex;
use perfscope_common::{Instruction, MethodId, MethodRef};

use super::program::{IlBody, Program};
use super::value::Value;
use crate::domain::HostError;

struct Frame<'a> {
    method: &'a MethodRef,
    stack: Vec<Value>,
    locals: Vec<Arc<Mutex<Value>>>,
}

impl Frame<'_> {
    fn pop(&mut self) -> Result<Value, HostError> {
        self.stack.pop().ok_or_else(|| HostError::StackUnderflow(self.method.to_string()))
    }

    /// Pop `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, HostError> {
        if self.stack.len() < n {
            return Err(HostError::StackUnderflow(self.method.to_string()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn local(&self, index: u16) -> Result<&Arc<Mutex<Value>>, HostError> {
        self.locals
            .get(usize::from(index))
            .ok_or_else(|| HostError::InvalidSlot { method: self.method.to_string(), slot: index })
    }
}

pub(crate) fn execute(
    program: &Program,
    method: &MethodRef,
    body: &IlBody,
    args: &mut [Value],
) -> Result<Value, HostError> {
    let mut frame = Frame {
        method,
        stack: Vec::new(),
        locals: (0..body.locals).map(|_| Arc::new(Mutex::new(Value::Unit))).collect(),
    };
    let mut pc = 0usize;
    let mut constrained = false;

    while let Some(instruction) = body.code.get(pc) {
        pc += 1;
        let prefixed = std::mem::take(&mut constrained);
        match instruction {
            Instruction::Nop => {}
            Instruction::LdcI8(v) => frame.stack.push(Value::Int(*v)),
            Instruction::LdcR8(v) => frame.stack.push(Value::Float(*v)),
            Instruction::LdStr(s) => frame.stack.push(Value::str(s)),
            Instruction::LdNull => frame.stack.push(Value::Null),
            Instruction::LdArg(n) => {
                let value = args
                    .get(usize::from(*n))
                    .cloned()
                    .ok_or_else(|| HostError::InvalidSlot { method: method.to_string(), slot: *n })?;
                frame.stack.push(value);
            }
            Instruction::StArg(n) => {
                let value = frame.pop()?;
                let slot = args
                    .get_mut(usize::from(*n))
                    .ok_or_else(|| HostError::InvalidSlot { method: method.to_string(), slot: *n })?;
                *slot = value;
            }
            Instruction::LdLoc(n) => {
                let value = frame.local(*n)?.lock().clone();
                frame.stack.push(value);
            }
            Instruction::StLoc(n) => {
                let value = frame.pop()?;
                *frame.local(*n)?.lock() = value;
            }
            Instruction::LdLocA(n) => {
                let cell = Arc::clone(frame.local(*n)?);
                frame.stack.push(Value::ByRef(cell));
            }
            Instruction::NewStruct { type_name, fields } => {
                frame.stack.push(Value::new_struct(type_name, vec![Value::Int(0); usize::from(*fields)]));
            }
            Instruction::LdFld(n) => {
                let target = frame.pop()?;
                frame.stack.push(target.field(*n)?);
            }
            Instruction::StFld(n) => {
                let value = frame.pop()?;
                let target = frame.pop()?;
                target.set_field(*n, value)?;
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.stack.push(arithmetic(instruction, &a, &b)?);
            }
            Instruction::Clt => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.stack.push(Value::Bool(a.as_float()? < b.as_float()?));
            }
            Instruction::Ceq => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.stack.push(Value::Bool(a == b));
            }
            Instruction::Dup => {
                let top = frame.stack.last().cloned().ok_or_else(|| HostError::StackUnderflow(method.to_string()))?;
                frame.stack.push(top);
            }
            Instruction::Pop => {
                frame.pop()?;
            }
            Instruction::Br(target) => pc = *target as usize,
            Instruction::BrTrue(target) => {
                if frame.pop()?.is_truthy() {
                    pc = *target as usize;
                }
            }
            Instruction::BrFalse(target) => {
                if !frame.pop()?.is_truthy() {
                    pc = *target as usize;
                }
            }
            Instruction::Call(id) => {
                let callee = program.method(*id).ok_or(HostError::UnknownMethod(*id))?;
                let mut call_args = frame.pop_n(callee.arity())?;
                let result = program.invoke(*id, &mut call_args)?;
                if callee.returns_value {
                    frame.stack.push(result);
                }
            }
            Instruction::CallVirt(id) => {
                let callee = program.method(*id).ok_or(HostError::UnknownMethod(*id))?;
                let mut call_args = frame.pop_n(callee.arity())?;
                let result = if prefixed {
                    constrained_call(program, *id, &mut call_args)?
                } else {
                    program.invoke_virtual(*id, &mut call_args)?
                };
                if callee.returns_value {
                    frame.stack.push(result);
                }
            }
            Instruction::Constrained(_) => constrained = true,
            Instruction::Ret => return finish(&mut frame),
        }
    }
    finish(&mut frame)
}

/// Virtual call through a managed-pointer receiver.
///
/// A pointer to a struct reaches the override with the pointer itself, so
/// the callee mutates the caller's storage. A pointer to an object is
/// dereferenced and dispatched as an ordinary virtual call.
fn constrained_call(program: &Program, id: MethodId, args: &mut [Value]) -> Result<Value, HostError> {
    let pointee = match args.first() {
        Some(Value::ByRef(cell)) => Some(cell.lock().clone()),
        _ => None,
    };
    match pointee {
        Some(Value::Struct(s)) => program.invoke(program.resolve_virtual(id, &s.type_name), args),
        Some(value) => {
            if let Some(receiver) = args.first_mut() {
                *receiver = value;
            }
            program.invoke_virtual(id, args)
        }
        None => program.invoke_virtual(id, args),
    }
}

fn arithmetic(op: &Instruction, a: &Value, b: &Value) -> Result<Value, HostError> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        let v = match op {
            Instruction::Add => x.wrapping_add(*y),
            Instruction::Sub => x.wrapping_sub(*y),
            _ => x.wrapping_mul(*y),
        };
        return Ok(Value::Int(v));
    }
    let (x, y) = (a.as_float()?, b.as_float()?);
    let v = match op {
        Instruction::Add => x + y,
        Instruction::Sub => x - y,
        _ => x * y,
    };
    Ok(Value::Float(v))
}

fn finish(frame: &mut Frame<'_>) -> Result<Value, HostError> {
    if frame.method.returns_value {
        frame.pop()
    } else {
        Ok(Value::Unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MethodBody;
    use perfscope_common::ReceiverKind;

    #[test]
    fn test_loop_sums_to_ten() {
        // sum = 0; i = 0; while i < 5 { sum += i; i += 1 } return sum
        let program = Program::new();
        let id = program.define(
            MethodRef::new_static("Loop", "Sum").returning(),
            MethodBody::il(
                2,
                vec![
                    Instruction::LdcI8(0),
                    Instruction::StLoc(0),
                    Instruction::LdcI8(0),
                    Instruction::StLoc(1),
                    Instruction::LdLoc(1),
                    Instruction::LdcI8(5),
                    Instruction::Clt,
                    Instruction::BrFalse(17),
                    Instruction::LdLoc(0),
                    Instruction::LdLoc(1),
                    Instruction::Add,
                    Instruction::StLoc(0),
                    Instruction::LdLoc(1),
                    Instruction::LdcI8(1),
                    Instruction::Add,
                    Instruction::StLoc(1),
                    Instruction::Br(4),
                    Instruction::LdLoc(0),
                    Instruction::Ret,
                ],
            ),
        );
        assert_eq!(program.invoke(id, &mut []).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_value_receiver_mutates_local() {
        let program = Program::new();
        let bump = program.define(
            MethodRef::new_instance("Counter", "Bump", ReceiverKind::Value).param("Int"),
            MethodBody::native(|_, args| {
                let current = args[0].field(0)?.as_int()?;
                args[0].set_field(0, Value::Int(current + args[1].as_int()?))?;
                Ok(Value::Unit)
            }),
        );
        let run = program.define(
            MethodRef::new_static("Test", "Run").returning(),
            MethodBody::il(
                1,
                vec![
                    Instruction::NewStruct { type_name: "Counter".into(), fields: 1 },
                    Instruction::StLoc(0),
                    Instruction::LdLocA(0),
                    Instruction::LdcI8(3),
                    Instruction::Call(bump),
                    Instruction::LdLocA(0),
                    Instruction::LdcI8(4),
                    Instruction::Call(bump),
                    Instruction::LdLoc(0),
                    Instruction::LdFld(0),
                    Instruction::Ret,
                ],
            ),
        );
        assert_eq!(program.invoke(run, &mut []).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_constrained_call_on_struct_pointer() {
        let program = Program::new();
        let describe = program.define(
            MethodRef::new_instance("Object", "Describe", ReceiverKind::Reference).returning(),
            MethodBody::native(|_, _| Ok(Value::str("object"))),
        );
        let counter_describe = program.define(
            MethodRef::new_instance("Counter", "Describe", ReceiverKind::Value).returning(),
            MethodBody::native(|_, args| {
                assert!(matches!(args[0], Value::ByRef(_)));
                Ok(Value::str("counter"))
            }),
        );
        program.define_override("Counter", describe, counter_describe);
        let run = program.define(
            MethodRef::new_static("Test", "Describe").returning(),
            MethodBody::il(
                1,
                vec![
                    Instruction::NewStruct { type_name: "Counter".into(), fields: 1 },
                    Instruction::StLoc(0),
                    Instruction::LdLocA(0),
                    Instruction::Constrained("Counter".into()),
                    Instruction::CallVirt(describe),
                    Instruction::Ret,
                ],
            ),
        );
        assert_eq!(program.invoke(run, &mut []).unwrap(), Value::str("counter"));
    }

    #[test]
    fn test_stack_underflow_reported() {
        let program = Program::new();
        let id = program.define(
            MethodRef::new_static("Bad", "Pop"),
            MethodBody::il(0, vec![Instruction::Pop]),
        );
        assert!(matches!(program.invoke(id, &mut []), Err(HostError::StackUnderflow(_))));
    }
}
