use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::common::chunk::Chunk;
use crate::common::heap::Heap;
use crate::common::table::fnv1a;
use crate::common::value::Value;

/// An immutable heap-allocated string with its hash cached.
/// All strings reachable by running code are interned through the
/// [`Heap`], so two strings with equal content are always the same
/// allocation and can be compared by pointer.
#[derive(Debug)]
pub struct Str {
    pub text: Box<str>,
    pub hash: u32,
}

impl Str {
    pub fn new(text: &str) -> Str {
        Str {
            text: text.into(),
            hash: fnv1a(text.as_bytes()),
        }
    }
}

/// A compiled function: its bytecode plus the shape information
/// the runtime needs to call it. The top-level script is an
/// anonymous zero-arity function.
#[derive(Debug)]
pub struct Function {
    pub name: Option<Rc<Str>>,
    pub arity: u8,
    /// How many variables the function captures from enclosing
    /// scopes; sizes the upvalue array of every closure over it.
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Option<Rc<Str>>) -> Function {
        Function {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::empty(),
        }
    }
}

/// What a native function gets to touch: the heap (to intern
/// result strings) and the VM's output stream.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn Write,
}

/// `Err(Some(message))` reports a runtime error with that message;
/// `Err(None)` falls back to the generic "Call to native ... failed.".
pub type NativeResult = Result<Value, Option<String>>;

pub type NativeFn = fn(&mut NativeCtx, &[Value]) -> NativeResult;

/// A built-in function implemented in Rust.
/// `arity` of `None` marks the native as variadic.
pub struct Native {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub function: NativeFn,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Wraps a [`Function`] with the captured variables it closes
/// over. Every callable function value at runtime is a closure,
/// even when it captures nothing.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

/// A captured variable. An upvalue starts out open, pointing at a
/// live operand-stack slot, and is closed exactly once when that
/// slot is about to leave scope: the value moves inline and the
/// upvalue owns it from then on.
#[derive(Debug)]
pub enum Upvalue {
    /// Absolute index of the operand-stack slot being shared.
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    /// The target slot, while still open.
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_hash_is_cached_fnv1a() {
        let s = Str::new("clock");
        assert_eq!(s.hash, fnv1a(b"clock"));
    }

    #[test]
    fn upvalue_slot() {
        assert_eq!(Upvalue::Open(3).open_slot(), Some(3));
        assert_eq!(Upvalue::Closed(Value::Nil).open_slot(), None);
    }
}
