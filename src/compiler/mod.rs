//! The single-pass compiler: source text goes in, a ready-to-run
//! top-level function comes out, with no syntax tree in between.
//! Loosely:
//!
//! ```plain
//! ~> Source (string)
//! -> Tokens            : lex.rs
//! -> Bytecode chunks   : compile.rs
//! ~> Run (result)      : vm
//! ```

pub mod compile;
pub mod lex;
pub mod syntax;
pub mod token;

pub use compile::compile;
