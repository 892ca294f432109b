//! # Waxwing
//!
//! Waxwing is a small dynamically-typed scripting language:
//! C-like syntax, numbers/strings/booleans/nil, first-class
//! functions with real lexical closures, block scoping, `const`,
//! `switch`, and labelled `break`/`continue`.
//!
//! The implementation is deliberately classic: a **single-pass
//! compiler** lowers source text straight to stack-machine
//! bytecode — there is no syntax tree, expression parsing is a
//! Pratt parser, and every grammar rule emits code the moment it
//! is parsed — and a **stack-based VM** runs the result with call
//! frames, a globals table, and upvalues for captured variables.
//!
//! ## Running a program
//!
//! ```
//! use waxwing::VM;
//!
//! let mut vm = VM::new();
//! vm.interpret("print 1 + 2 * 3;").unwrap();
//! ```
//!
//! One `VM` can run any number of sources in sequence; globals
//! and interned strings carry over between runs, which is exactly
//! what the REPL does with it.
//!
//! ## Pipeline
//!
//! - [`compiler::lex::Scanner`] turns the source into tokens, on
//!   demand, with line numbers for diagnostics.
//! - [`compiler::compile()`] drives the scanner once, front to
//!   back, building a [`common::object::Function`] whose chunk
//!   embeds every nested function as a constant.
//! - [`vm::vm::VM`] wraps the script function in a closure and
//!   runs the dispatch loop until it returns or a runtime error
//!   unwinds it.
//!
//! Compile-time problems come back as [`Diagnostics`] (several
//! per run, thanks to panic-mode recovery); runtime problems come
//! back as a [`Trace`] with a stack trace. Both render themselves
//! the way the CLI prints them.

use thiserror::Error as ThisError;

pub mod common;
pub mod compiler;
pub mod vm;

pub use common::chunk::Chunk;
pub use common::object::Function;
pub use common::value::Value;
pub use compiler::syntax::{Diagnostics, Syntax};
pub use vm::trace::Trace;
pub use vm::vm::VM;

/// Everything that can go wrong running a source string.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The compiler rejected the source; nothing was run.
    #[error(transparent)]
    Compile(#[from] Diagnostics),
    /// The program failed mid-run; the VM has reset its stack and
    /// remains usable.
    #[error(transparent)]
    Runtime(#[from] Trace),
}
