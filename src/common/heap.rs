use std::cell::RefCell;
use std::rc::Rc;

use crate::common::object::{Closure, Function, Native, Str, Upvalue};
use crate::common::table::{fnv1a, Table};
use crate::common::value::Value;

/// A heap-allocated object, one variant per kind. The heap keeps
/// one of these per allocation so the whole object graph can be
/// walked in insertion order.
#[derive(Debug)]
pub enum Object {
    Str(Rc<Str>),
    Function(Rc<Function>),
    Native(Rc<Native>),
    Closure(Rc<Closure>),
    Upvalue(Rc<RefCell<Upvalue>>),
}

/// Owns every object the compiler and VM allocate, and the
/// string-intern set. Values hold cheap `Rc` handles; the heap's
/// registry is the root that keeps the graph alive until teardown.
pub struct Heap {
    /// Interned strings: key is the string, value unused.
    strings: Table,
    /// Every allocation, in insertion order.
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            strings: Table::new(),
            objects: Vec::new(),
        }
    }

    /// Returns the one true allocation for this string content,
    /// allocating it on first sight. Equal content always comes
    /// back as the same pointer, which is what lets values compare
    /// strings by identity.
    pub fn intern(&mut self, text: &str) -> Rc<Str> {
        let hash = fnv1a(text.as_bytes());
        if let Some(existing) = self.strings.find_str(text, hash) {
            return existing;
        }

        let string = Rc::new(Str {
            text: text.into(),
            hash,
        });
        self.strings.set(Value::Str(string.clone()), Value::Nil);
        self.objects.push(Object::Str(string.clone()));
        string
    }

    /// Takes ownership of a freshly compiled function.
    pub fn register_function(&mut self, function: Function) -> Rc<Function> {
        let function = Rc::new(function);
        self.objects.push(Object::Function(function.clone()));
        function
    }

    pub fn register_native(&mut self, native: Native) -> Rc<Native> {
        let native = Rc::new(native);
        self.objects.push(Object::Native(native.clone()));
        native
    }

    pub fn new_closure(
        &mut self,
        function: Rc<Function>,
        upvalues: Vec<Rc<RefCell<Upvalue>>>,
    ) -> Rc<Closure> {
        let closure = Rc::new(Closure { function, upvalues });
        self.objects.push(Object::Closure(closure.clone()));
        closure
    }

    /// Allocates an open upvalue over an operand-stack slot.
    pub fn new_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.objects.push(Object::Upvalue(upvalue.clone()));
        upvalue
    }

    /// How many objects have ever been allocated.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // A closure that captures itself (any recursive local
        // function does) forms an Rc cycle through its upvalue.
        // Emptying every closed upvalue severs those cycles so the
        // graph frees completely.
        for object in &self.objects {
            if let Object::Upvalue(upvalue) = object {
                *upvalue.borrow_mut() = Upvalue::Closed(Value::Nil);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn registry_keeps_insertion_order() {
        let mut heap = Heap::new();
        heap.intern("first");
        let function = heap.register_function(Function::new(None));
        heap.new_closure(function, Vec::new());

        let kinds: Vec<_> = heap
            .objects
            .iter()
            .map(|object| match object {
                Object::Str(_) => "str",
                Object::Function(_) => "function",
                Object::Native(_) => "native",
                Object::Closure(_) => "closure",
                Object::Upvalue(_) => "upvalue",
            })
            .collect();
        assert_eq!(kinds, vec!["str", "function", "closure"]);
    }

    #[test]
    fn teardown_breaks_upvalue_cycles() {
        let mut heap = Heap::new();
        let function = heap.register_function(Function::new(None));
        let upvalue = heap.new_upvalue(0);
        let closure = heap.new_closure(function, vec![upvalue.clone()]);
        // tie the knot: the upvalue closes over its own closure
        *upvalue.borrow_mut() = Upvalue::Closed(Value::Closure(closure.clone()));

        let weak = Rc::downgrade(&closure);
        drop(closure);
        drop(heap);
        assert!(weak.upgrade().is_none());
    }
}
