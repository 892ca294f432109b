use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::common::heap::Heap;
use crate::common::object::{Closure, Function, Native, NativeCtx, Upvalue};
use crate::common::opcode::Opcode;
use crate::common::table::Table;
use crate::common::value::Value;
use crate::compiler;
use crate::compiler::syntax::Diagnostics;
use crate::vm::natives;
use crate::vm::trace::Trace;
use crate::Error;

/// How deep calls can nest.
pub const FRAMES_MAX: usize = 64;
/// Operand-stack capacity: every frame gets up to a full
/// complement of locals.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One active call: the closure being run, the instruction
/// pointer into its chunk, and where its slots start on the
/// operand stack. Slot zero is the closure itself.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

/// The virtual machine. Owns the operand stack, the call frames,
/// the globals, and the heap every allocation lives in. One VM
/// can run any number of sources in sequence (that's a REPL
/// session); globals and interned strings carry over, and a
/// runtime error leaves it ready for the next line.
pub struct VM {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    heap: Heap,
    /// Open upvalues, sorted by target slot; the innermost (and
    /// highest) slot sits at the end for cheap closing.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    out: Box<dyn Write>,
}

impl VM {
    /// A VM printing to stdout.
    pub fn new() -> VM {
        VM::with_output(Box::new(io::stdout()))
    }

    /// A VM printing somewhere else; tests hand in a shared
    /// buffer here.
    pub fn with_output(out: Box<dyn Write>) -> VM {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        natives::install(&mut globals, &mut heap);

        VM {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(256),
            globals,
            heap,
            open_upvalues: Vec::new(),
            out,
        }
    }

    /// Compiles and runs one source string.
    pub fn interpret(&mut self, source: &str) -> Result<(), Error> {
        let function = self.compile(source).map_err(Error::Compile)?;
        self.execute(function).map_err(Error::Runtime)
    }

    /// Just the compile half; strings intern into this VM's heap.
    pub fn compile(&mut self, source: &str) -> Result<Rc<Function>, Diagnostics> {
        compiler::compile(source, &mut self.heap)
    }

    /// Runs a compiled script function to completion.
    pub fn execute(&mut self, function: Rc<Function>) -> Result<(), Trace> {
        let closure = self.heap.new_closure(function, Vec::new());
        self.push(Value::Closure(closure.clone()))?;
        self.call_closure(closure, 0)?;
        self.dispatch()?;

        debug_assert!(self.stack.is_empty(), "operand stack should be empty");
        debug_assert!(self.frames.is_empty(), "all frames should have returned");
        Ok(())
    }

    // ------------------------------------------------ frame access

    fn frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("dispatch requires an active frame"),
        }
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("dispatch requires an active frame"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.closure.function.chunk.read(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u32(&mut self) -> u32 {
        let frame = self.frame_mut();
        let value = frame.closure.function.chunk.read_u32(frame.ip);
        frame.ip += 4;
        value
    }

    fn read_i16(&mut self) -> i16 {
        let frame = self.frame_mut();
        let value = frame.closure.function.chunk.read_i16(frame.ip);
        frame.ip += 2;
        value
    }

    /// Reads a constant-pool operand in short or long form.
    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u32() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frame();
        frame.closure.function.chunk.constants[index].clone()
    }

    // ------------------------------------------------------- stack

    fn push(&mut self, value: Value) -> Result<(), Trace> {
        if self.stack.len() == STACK_MAX {
            return Err(self.error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("operand stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    // ------------------------------------------------- error paths

    /// Builds the runtime error and traceback for the current
    /// frame stack, then resets the VM so the session can go on.
    fn error(&mut self, message: impl Into<String>) -> Trace {
        let mut trace = Trace::new(message);
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            // ip already advanced past the current instruction;
            // the line table covers its operand bytes too
            let line = function.chunk.line_for(frame.ip.saturating_sub(1));
            let name = function.name.as_ref().map(|n| n.text.to_string());
            trace.push_frame(line, name);
        }
        debug!(error = %trace.message, frames = trace.frames.len(), "runtime error");
        self.reset();
        trace
    }

    fn undefined(&mut self, name: &Value) -> Trace {
        self.error(format!("Undefined variable '{}'.", name))
    }

    /// Drops all execution state. Anything still captured by a
    /// surviving closure is closed first so later runs never see
    /// a stale stack slot.
    fn reset(&mut self) {
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
    }

    // ---------------------------------------------------- dispatch

    fn dispatch(&mut self) -> Result<(), Trace> {
        loop {
            let op = Opcode::from_byte(self.read_byte());
            match op {
                Opcode::Const | Opcode::ConstLong => {
                    let value = self.read_constant(op == Opcode::ConstLong);
                    self.push(value)?;
                }
                Opcode::Nil => self.push(Value::Nil)?,
                Opcode::True => self.push(Value::Bool(true))?,
                Opcode::False => self.push(Value::Bool(false))?,
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::GetLocal => {
                    let index = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + index].clone();
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let index = self.read_byte() as usize;
                    let slot = self.frame().base + index;
                    self.stack[slot] = self.peek(0).clone();
                }

                Opcode::GetGlobal | Opcode::GetGlobalLong => {
                    let name = self.read_constant(op == Opcode::GetGlobalLong);
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value)?;
                        }
                        None => return Err(self.undefined(&name)),
                    }
                }
                Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
                    let name = self.read_constant(op == Opcode::DefineGlobalLong);
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                    self.pop();
                }
                Opcode::SetGlobal | Opcode::SetGlobalLong => {
                    let name = self.read_constant(op == Opcode::SetGlobalLong);
                    let value = self.peek(0).clone();
                    // assignment can't create a global
                    if self.globals.set(name.clone(), value) {
                        self.globals.delete(&name);
                        return Err(self.undefined(&name));
                    }
                }

                Opcode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value)?;
                }
                Opcode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    match &mut *upvalue.borrow_mut() {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(closed) => *closed = value,
                    };
                }

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                Opcode::Greater | Opcode::Less => self.binary_number(op)?,
                Opcode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.push(Value::Number(a + b))?;
                        }
                        (Value::Str(a), Value::Str(b)) => {
                            let text = format!("{}{}", a.text, b.text);
                            let result = self.heap.intern(&text);
                            self.push(Value::Str(result))?;
                        }
                        _ => {
                            return Err(
                                self.error("Operands must be two numbers or two strings.")
                            );
                        }
                    }
                }
                Opcode::Subtract | Opcode::Multiply | Opcode::Divide => {
                    self.binary_number(op)?;
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                Opcode::Negate => match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n))?,
                    _ => return Err(self.error("Operand must be a number.")),
                },

                Opcode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{}", value);
                }

                Opcode::Jump => {
                    let offset = self.read_i16();
                    self.jump(offset);
                }
                Opcode::JumpIfTrue => {
                    let offset = self.read_i16();
                    if !self.peek(0).is_falsey() {
                        self.jump(offset);
                    }
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_i16();
                    if self.peek(0).is_falsey() {
                        self.jump(offset);
                    }
                }

                Opcode::Call => {
                    let arg_count = self.read_byte();
                    self.call_value(arg_count)?;
                }
                Opcode::Closure | Opcode::ClosureLong => {
                    self.make_closure(op == Opcode::ClosureLong)?;
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Opcode::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("return without a frame"),
                    };
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // the script closure itself is still in slot 0
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result)?;
                }
            }
        }
    }

    /// The arithmetic and comparison opcodes that insist on two
    /// numbers.
    fn binary_number(&mut self, op: Opcode) -> Result<(), Trace> {
        let b = self.pop();
        let a = self.pop();
        let (Value::Number(a), Value::Number(b)) = (a, b) else {
            return Err(self.error("Operands must be numbers."));
        };
        let result = match op {
            Opcode::Subtract => Value::Number(a - b),
            Opcode::Multiply => Value::Number(a * b),
            Opcode::Divide => Value::Number(a / b),
            Opcode::Greater => Value::Bool(a > b),
            Opcode::Less => Value::Bool(a < b),
            _ => unreachable!("not a numeric binary opcode"),
        };
        self.push(result)
    }

    fn jump(&mut self, offset: i16) {
        let frame = self.frame_mut();
        frame.ip = (frame.ip as isize + offset as isize) as usize;
    }

    // ------------------------------------------------------- calls

    /// The callee sits `arg_count` slots below the top of the
    /// stack, with its arguments above it.
    fn call_value(&mut self, arg_count: u8) -> Result<(), Trace> {
        let callee = self.peek(arg_count as usize).clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, arg_count),
            Value::Native(native) => self.call_native(native, arg_count),
            _ => Err(self.error("Can only call functions and classes.")),
        }
    }

    /// Pushes a frame whose base is the callee slot, so the
    /// callee's slot zero is the closure itself and the arguments
    /// land in slots 1..=arity exactly where the compiler put its
    /// parameters.
    fn call_closure(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), Trace> {
        let arity = closure.function.arity;
        if arg_count != arity {
            return Err(self.error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error("Call stack overflow."));
        }

        let callee = Value::Closure(closure.clone());
        trace!(depth = self.frames.len(), "call {}", callee);
        self.frames.push(CallFrame {
            base: self.stack.len() - arg_count as usize - 1,
            ip: 0,
            closure,
        });
        Ok(())
    }

    /// Natives run in place: no frame, arguments handed over as a
    /// slice, callee and arguments replaced by the result.
    fn call_native(&mut self, native: Rc<Native>, arg_count: u8) -> Result<(), Trace> {
        if let Some(arity) = native.arity {
            if arg_count != arity {
                return Err(self.error(format!(
                    "Expected {} arguments but got {}.",
                    arity, arg_count
                )));
            }
        }

        let first = self.stack.len() - arg_count as usize;
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                out: &mut *self.out,
            };
            (native.function)(&mut ctx, &self.stack[first..])
        };

        match result {
            Ok(value) => {
                self.stack.truncate(first - 1);
                self.push(value)
            }
            Err(Some(message)) => Err(self.error(message)),
            Err(None) => {
                Err(self.error(format!("Call to native '{}' failed.", native.name)))
            }
        }
    }

    // ---------------------------------------------------- upvalues

    /// Builds a closure from a function constant, capturing each
    /// upvalue either fresh off this frame's stack slots or shared
    /// from the enclosing closure.
    fn make_closure(&mut self, long: bool) -> Result<(), Trace> {
        let function = match self.read_constant(long) {
            Value::Function(function) => function,
            _ => unreachable!("closure operand must be a function constant"),
        };

        let mut upvalues = Vec::with_capacity(function.upvalue_count);
        for _ in 0..function.upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let slot = self.frame().base + index;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                upvalues.push(self.frame().closure.upvalues[index].clone());
            }
        }

        let closure = self.heap.new_closure(function, upvalues);
        self.push(Value::Closure(closure))
    }

    /// At most one open upvalue exists per stack slot: capturing a
    /// slot twice hands back the same upvalue, so every closure
    /// sees every write. The list stays sorted by slot.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let mut index = self.open_upvalues.len();
        while index > 0 {
            let existing = self.open_upvalues[index - 1].borrow().open_slot();
            match existing {
                Some(s) if s == slot => return self.open_upvalues[index - 1].clone(),
                Some(s) if s < slot => break,
                Some(_) => index -= 1,
                None => unreachable!("closed upvalue on the open list"),
            }
        }

        let created = self.heap.new_upvalue(slot);
        self.open_upvalues.insert(index, created.clone());
        created
    }

    /// Closes every open upvalue whose slot is at or above `from`:
    /// the value moves off the stack into the upvalue itself.
    /// Because the list is sorted, this is a suffix truncation.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(upvalue) = self.open_upvalues.last().cloned() {
            let slot = match upvalue.borrow().open_slot() {
                Some(slot) => slot,
                None => unreachable!("closed upvalue on the open list"),
            };
            if slot < from {
                break;
            }
            *upvalue.borrow_mut() = Upvalue::Closed(self.stack[slot].clone());
            self.open_upvalues.pop();
        }
    }
}

impl Default for VM {
    fn default() -> VM {
        VM::new()
    }
}
