//! Runtime module responsible for executing loaded programs.
use std::fmt;

use log::{debug, trace};

use crate::bytecode::{
    OPCode, OFFSET_ALOAD, OFFSET_ASTORE, OFFSET_ICONST, OFFSET_ILOAD,
    OFFSET_ISTORE,
};
use crate::heap::Heap;
use crate::jvm::{CPInfo, ClassError};
use crate::program::{self, Method, Program};

/// `newarray` element type tag for `int`; the only kind this VM builds.
const T_INT: u8 = 10;

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during execution.
#[derive(Debug)]
pub enum RuntimeErrorKind {
    MissingEntryPoint,
    EntryPointReturnedValue(i32),
    UnknownOpcode(u8),
    TruncatedCode(OPCode),
    StackUnderflow(OPCode),
    LocalOutOfRange(usize),
    DivisionByZero(OPCode),
    UnsupportedConstant(u16),
    UnresolvedMethod(u16),
    InvalidReference(i32),
    IndexOutOfBounds { reference: i32, index: i32 },
    BranchOutOfRange { pc: usize, offset: i16 },
    Class(ClassError),
}

/// `RuntimeError` is a custom type used to handle and represent possible
/// execution failures.
#[derive(Debug)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
}

impl RuntimeError {
    fn new(kind: RuntimeErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the fault behind this error.
    #[must_use]
    pub fn kind(&self) -> &RuntimeErrorKind {
        &self.kind
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            RuntimeErrorKind::MissingEntryPoint => {
                write!(
                    f,
                    "missing {}{} method",
                    program::MAIN_METHOD,
                    program::MAIN_DESCRIPTOR
                )
            }
            RuntimeErrorKind::EntryPointReturnedValue(value) => {
                write!(f, "main() should return void, returned {value}")
            }
            RuntimeErrorKind::UnknownOpcode(byte) => {
                write!(f, "unknown opcode {byte:#04x}")
            }
            RuntimeErrorKind::TruncatedCode(opcode) => {
                write!(f, "instruction {opcode} is missing its operands")
            }
            RuntimeErrorKind::StackUnderflow(opcode) => {
                write!(f, "operand stack underflow on {opcode}")
            }
            RuntimeErrorKind::LocalOutOfRange(index) => {
                write!(f, "local variable index {index} is out of range")
            }
            RuntimeErrorKind::DivisionByZero(opcode) => {
                write!(f, "division by zero on {opcode}")
            }
            RuntimeErrorKind::UnsupportedConstant(index) => {
                write!(f, "constant pool entry {index} cannot be loaded by ldc")
            }
            RuntimeErrorKind::UnresolvedMethod(index) => {
                write!(f, "method reference {index} names no known method")
            }
            RuntimeErrorKind::InvalidReference(reference) => {
                write!(f, "invalid array reference {reference}")
            }
            RuntimeErrorKind::IndexOutOfBounds { reference, index } => {
                write!(
                    f,
                    "index {index} is out of bounds for array reference {reference}"
                )
            }
            RuntimeErrorKind::BranchOutOfRange { pc, offset } => {
                write!(f, "branch from {pc} with offset {offset} leaves the method")
            }
            RuntimeErrorKind::Class(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RuntimeErrorKind::Class(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ClassError> for RuntimeError {
    fn from(err: ClassError) -> Self {
        Self::new(RuntimeErrorKind::Class(err))
    }
}

/// `Runtime` represents an execution context for a loaded program. Frames
/// are not first-class: each `invokestatic` recurses through the host
/// stack with its own operand stack, locals and program counter, and
/// return values flow back through the host call stack.
pub struct Runtime<'a> {
    // Program to run.
    program: &'a Program,
    // Arrays allocated by the program, live until teardown.
    heap: Heap,
    // Journal of everything the program printed.
    // Used for testing only.
    printed: Vec<i32>,
}

impl<'a> Runtime<'a> {
    #[must_use]
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            heap: Heap::new(),
            printed: Vec::new(),
        }
    }

    /// Execute the program's entry method until it returns.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let main = self
            .program
            .entry_point()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::MissingEntryPoint))?;
        // In a real JVM, locals[0] would hold a reference to String[]
        // args; without objects it stays zero like every other local.
        let locals = vec![0; usize::from(main.max_locals())];
        match self.execute(main, locals)? {
            None => Ok(()),
            Some(value) => Err(RuntimeError::new(
                RuntimeErrorKind::EntryPointReturnedValue(value),
            )),
        }
    }

    /// Returns the values printed so far, in program order.
    /// Used for testing only.
    #[must_use]
    pub fn printed(&self) -> &[i32] {
        &self.printed
    }

    /// Run one method activation until it returns.
    ///
    /// `locals` carries the caller-supplied parameter prefix; the
    /// remaining slots are zero. Falling off the end of the code returns
    /// void.
    fn execute(
        &mut self,
        method: &'a Method,
        mut locals: Vec<i32>,
    ) -> Result<Option<i32>, RuntimeError> {
        trace!("enter {}{}", method.name(), method.descriptor());
        let code = method.code();
        let mut stack: Vec<i32> =
            Vec::with_capacity(usize::from(method.max_stack()));
        let mut pc: usize = 0;

        while pc < code.len() {
            let byte = code[pc];
            let opcode = OPCode::from(byte);
            match opcode {
                OPCode::NOP => pc += 1,
                OPCode::IconstM1
                | OPCode::Iconst0
                | OPCode::Iconst1
                | OPCode::Iconst2
                | OPCode::Iconst3
                | OPCode::Iconst4
                | OPCode::Iconst5 => {
                    stack.push(i32::from(byte) - i32::from(OFFSET_ICONST));
                    pc += 1;
                }
                OPCode::BiPush => {
                    let value = operand_u8(code, pc, opcode)? as i8;
                    stack.push(i32::from(value));
                    pc += 2;
                }
                OPCode::SiPush => {
                    stack.push(i32::from(operand_i16(code, pc, opcode)?));
                    pc += 3;
                }
                OPCode::Ldc => {
                    let index = u16::from(operand_u8(code, pc, opcode)?);
                    match self.program.constant_pool().get(index)? {
                        CPInfo::ConstantInteger { value } => stack.push(*value),
                        _ => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::UnsupportedConstant(index),
                            ))
                        }
                    }
                    pc += 2;
                }
                OPCode::ILoad | OPCode::ALoad => {
                    let index = usize::from(operand_u8(code, pc, opcode)?);
                    stack.push(load(&locals, index)?);
                    pc += 2;
                }
                OPCode::ILoad0
                | OPCode::ILoad1
                | OPCode::ILoad2
                | OPCode::ILoad3 => {
                    stack.push(load(&locals, usize::from(byte - OFFSET_ILOAD))?);
                    pc += 1;
                }
                OPCode::ALoad0
                | OPCode::ALoad1
                | OPCode::ALoad2
                | OPCode::ALoad3 => {
                    stack.push(load(&locals, usize::from(byte - OFFSET_ALOAD))?);
                    pc += 1;
                }
                OPCode::IStore | OPCode::AStore => {
                    let index = usize::from(operand_u8(code, pc, opcode)?);
                    let value = pop(&mut stack, opcode)?;
                    store(&mut locals, index, value)?;
                    pc += 2;
                }
                OPCode::IStore0
                | OPCode::IStore1
                | OPCode::IStore2
                | OPCode::IStore3 => {
                    let value = pop(&mut stack, opcode)?;
                    store(&mut locals, usize::from(byte - OFFSET_ISTORE), value)?;
                    pc += 1;
                }
                OPCode::AStore0
                | OPCode::AStore1
                | OPCode::AStore2
                | OPCode::AStore3 => {
                    let value = pop(&mut stack, opcode)?;
                    store(&mut locals, usize::from(byte - OFFSET_ASTORE), value)?;
                    pc += 1;
                }
                OPCode::IInc => {
                    let index = usize::from(operand_u8(code, pc, opcode)?);
                    // The increment operand is a signed byte.
                    let constant = operand_at(code, pc + 2, opcode)? as i8;
                    let slot = locals.get_mut(index).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::LocalOutOfRange(index))
                    })?;
                    *slot = slot.wrapping_add(i32::from(constant));
                    pc += 3;
                }
                OPCode::IAdd
                | OPCode::ISub
                | OPCode::IMul
                | OPCode::IDiv
                | OPCode::IRem
                | OPCode::IAnd
                | OPCode::IOr
                | OPCode::IXor => {
                    let value2 = pop(&mut stack, opcode)?;
                    let value1 = pop(&mut stack, opcode)?;
                    stack.push(binary_operation(value1, value2, opcode)?);
                    pc += 1;
                }
                OPCode::INeg => {
                    let value = pop(&mut stack, opcode)?;
                    stack.push(value.wrapping_neg());
                    pc += 1;
                }
                OPCode::IShl => {
                    let shift_amount = pop(&mut stack, opcode)?;
                    let value = pop(&mut stack, opcode)?;
                    // wrapping_shl masks the amount to the low five bits.
                    stack.push(value.wrapping_shl(shift_amount as u32));
                    pc += 1;
                }
                OPCode::IShr => {
                    let shift_amount = pop(&mut stack, opcode)?;
                    let value = pop(&mut stack, opcode)?;
                    stack.push(value.wrapping_shr(shift_amount as u32));
                    pc += 1;
                }
                OPCode::IUShr => {
                    let shift_amount = pop(&mut stack, opcode)?;
                    let value = pop(&mut stack, opcode)?;
                    let result =
                        (value as u32).wrapping_shr(shift_amount as u32);
                    stack.push(result as i32);
                    pc += 1;
                }
                OPCode::Dup => {
                    let value = *stack.last().ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::StackUnderflow(opcode))
                    })?;
                    stack.push(value);
                    pc += 1;
                }
                OPCode::IfEq
                | OPCode::IfNe
                | OPCode::IfLt
                | OPCode::IfGe
                | OPCode::IfGt
                | OPCode::IfLe
                | OPCode::IfICmpEq
                | OPCode::IfICmpNe
                | OPCode::IfICmpLt
                | OPCode::IfICmpGe
                | OPCode::IfICmpGt
                | OPCode::IfICmpLe => {
                    let offset = operand_i16(code, pc, opcode)?;
                    pc = if branch_taken(opcode, &mut stack)? {
                        branch_target(pc, offset)?
                    } else {
                        pc + 3
                    };
                }
                OPCode::Goto => {
                    let offset = operand_i16(code, pc, opcode)?;
                    pc = branch_target(pc, offset)?;
                }
                OPCode::IReturn | OPCode::AReturn => {
                    // References share the integer representation.
                    return Ok(Some(pop(&mut stack, opcode)?));
                }
                OPCode::Return => return Ok(None),
                // Models accessing the print sink; no observable effect.
                OPCode::GetStatic => pc += 3,
                // Models only a single pseudo-call: printing an integer.
                OPCode::InvokeVirtual => {
                    let value = pop(&mut stack, opcode)?;
                    println!("{value}");
                    self.printed.push(value);
                    pc += 3;
                }
                OPCode::InvokeStatic => {
                    let index = operand_u16(code, pc, opcode)?;
                    let program = self.program;
                    let callee = program.method_by_ref(index)?.ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::UnresolvedMethod(
                            index,
                        ))
                    })?;
                    let num_params = program::num_parameters(callee.descriptor())?;
                    let mut callee_locals =
                        vec![0; usize::from(callee.max_locals())];
                    // Arguments pop in reverse so the first parameter
                    // lands in the callee's locals[0].
                    for ii in (0..num_params).rev() {
                        let value = pop(&mut stack, opcode)?;
                        *callee_locals.get_mut(ii).ok_or_else(|| {
                            RuntimeError::new(RuntimeErrorKind::LocalOutOfRange(
                                ii,
                            ))
                        })? = value;
                    }
                    if let Some(value) = self.execute(callee, callee_locals)? {
                        stack.push(value);
                    }
                    pc += 3;
                }
                OPCode::NewArray => {
                    // Only integer arrays are ever constructed; the
                    // element type operand is consumed and ignored.
                    let element_type = operand_u8(code, pc, opcode)?;
                    if element_type != T_INT {
                        debug!(
                            "newarray with element type {element_type}, building an int array"
                        );
                    }
                    let count = pop(&mut stack, opcode)?;
                    stack.push(self.heap.alloc(count));
                    pc += 2;
                }
                OPCode::ArrayLength => {
                    let reference = pop(&mut stack, opcode)?;
                    let array = self.heap.get(reference).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::InvalidReference(
                            reference,
                        ))
                    })?;
                    stack.push(array[0]);
                    pc += 1;
                }
                OPCode::IALoad => {
                    let index = pop(&mut stack, opcode)?;
                    let reference = pop(&mut stack, opcode)?;
                    let array = self.heap.get(reference).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::InvalidReference(
                            reference,
                        ))
                    })?;
                    stack.push(element(array, reference, index)?);
                    pc += 1;
                }
                OPCode::IAStore => {
                    let value = pop(&mut stack, opcode)?;
                    let index = pop(&mut stack, opcode)?;
                    let reference = pop(&mut stack, opcode)?;
                    let array = self.heap.get_mut(reference).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::InvalidReference(
                            reference,
                        ))
                    })?;
                    let slot = element_slot(array, reference, index)?;
                    array[slot] = value;
                    pc += 1;
                }
                OPCode::Unspecified => {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::UnknownOpcode(byte),
                    ))
                }
            }
        }

        trace!("fell off the end of {}, returning void", method.name());
        Ok(None)
    }
}

/// Pop a value from the operand stack.
fn pop(stack: &mut Vec<i32>, opcode: OPCode) -> Result<i32, RuntimeError> {
    stack
        .pop()
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::StackUnderflow(opcode)))
}

/// Load a local variable.
fn load(locals: &[i32], index: usize) -> Result<i32, RuntimeError> {
    locals
        .get(index)
        .copied()
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::LocalOutOfRange(index)))
}

/// Store a local variable.
fn store(
    locals: &mut [i32],
    index: usize,
    value: i32,
) -> Result<(), RuntimeError> {
    let slot = locals
        .get_mut(index)
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::LocalOutOfRange(index)))?;
    *slot = value;
    Ok(())
}

/// Returns the single-byte operand following the opcode at `pc`.
fn operand_u8(code: &[u8], pc: usize, opcode: OPCode) -> Result<u8, RuntimeError> {
    operand_at(code, pc + 1, opcode)
}

/// Returns the bytecode byte at `at`.
fn operand_at(code: &[u8], at: usize, opcode: OPCode) -> Result<u8, RuntimeError> {
    code.get(at)
        .copied()
        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::TruncatedCode(opcode)))
}

/// Returns the two-byte operand following the opcode at `pc`, combined
/// big-endian and interpreted as a signed 16-bit value.
fn operand_i16(
    code: &[u8],
    pc: usize,
    opcode: OPCode,
) -> Result<i16, RuntimeError> {
    let hi = operand_at(code, pc + 1, opcode)?;
    let lo = operand_at(code, pc + 2, opcode)?;
    Ok(i16::from_be_bytes([hi, lo]))
}

/// Returns the two-byte operand following the opcode at `pc` as an
/// unsigned constant pool index.
fn operand_u16(
    code: &[u8],
    pc: usize,
    opcode: OPCode,
) -> Result<u16, RuntimeError> {
    let hi = operand_at(code, pc + 1, opcode)?;
    let lo = operand_at(code, pc + 2, opcode)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

/// Branch targets are relative to the address of the branch opcode itself.
fn branch_target(pc: usize, offset: i16) -> Result<usize, RuntimeError> {
    let target = pc as i64 + i64::from(offset);
    usize::try_from(target).map_err(|_| {
        RuntimeError::new(RuntimeErrorKind::BranchOutOfRange { pc, offset })
    })
}

/// Compute a two-operand arithmetic instruction with wrapping 32-bit
/// semantics.
fn binary_operation(
    value1: i32,
    value2: i32,
    opcode: OPCode,
) -> Result<i32, RuntimeError> {
    match opcode {
        OPCode::IAdd => Ok(value1.wrapping_add(value2)),
        OPCode::ISub => Ok(value1.wrapping_sub(value2)),
        OPCode::IMul => Ok(value1.wrapping_mul(value2)),
        OPCode::IDiv | OPCode::IRem if value2 == 0 => {
            Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero(opcode)))
        }
        OPCode::IDiv => Ok(value1.wrapping_div(value2)),
        OPCode::IRem => Ok(value1.wrapping_rem(value2)),
        OPCode::IAnd => Ok(value1 & value2),
        OPCode::IOr => Ok(value1 | value2),
        OPCode::IXor => Ok(value1 ^ value2),
        _ => Err(RuntimeError::new(RuntimeErrorKind::UnknownOpcode(
            opcode as u8,
        ))),
    }
}

/// Decide whether a conditional branch is taken, popping its operands.
/// The top of the stack is the right-hand side of two-operand compares.
fn branch_taken(
    opcode: OPCode,
    stack: &mut Vec<i32>,
) -> Result<bool, RuntimeError> {
    match opcode {
        OPCode::IfEq => Ok(pop(stack, opcode)? == 0),
        OPCode::IfNe => Ok(pop(stack, opcode)? != 0),
        OPCode::IfLt => Ok(pop(stack, opcode)? < 0),
        OPCode::IfGe => Ok(pop(stack, opcode)? >= 0),
        OPCode::IfGt => Ok(pop(stack, opcode)? > 0),
        OPCode::IfLe => Ok(pop(stack, opcode)? <= 0),
        OPCode::IfICmpEq
        | OPCode::IfICmpNe
        | OPCode::IfICmpLt
        | OPCode::IfICmpGe
        | OPCode::IfICmpGt
        | OPCode::IfICmpLe => {
            let value2 = pop(stack, opcode)?;
            let value1 = pop(stack, opcode)?;
            Ok(match opcode {
                OPCode::IfICmpEq => value1 == value2,
                OPCode::IfICmpNe => value1 != value2,
                OPCode::IfICmpLt => value1 < value2,
                OPCode::IfICmpGe => value1 >= value2,
                OPCode::IfICmpGt => value1 > value2,
                _ => value1 <= value2,
            })
        }
        _ => Err(RuntimeError::new(RuntimeErrorKind::UnknownOpcode(
            opcode as u8,
        ))),
    }
}

/// Read an array element; on-heap arrays keep their count in slot 0, so
/// element `index` lives at slot `index + 1`.
fn element(
    array: &[i32],
    reference: i32,
    index: i32,
) -> Result<i32, RuntimeError> {
    let slot = element_slot(array, reference, index)?;
    Ok(array[slot])
}

/// Map an element index to its slot, checking it against the array.
fn element_slot(
    array: &[i32],
    reference: i32,
    index: i32,
) -> Result<usize, RuntimeError> {
    let slot = i64::from(index) + 1;
    if slot < 1 || slot >= array.len() as i64 {
        return Err(RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
            reference,
            index,
        }));
    }
    Ok(slot as usize)
}
