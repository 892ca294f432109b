use std::mem;
use std::rc::Rc;

use tracing::debug;

use crate::common::heap::Heap;
use crate::common::object::Function;
use crate::common::opcode::Opcode;
use crate::common::value::Value;
use crate::compiler::lex::Scanner;
use crate::compiler::syntax::{At, Diagnostics, Syntax};
use crate::compiler::token::{Token, TokenKind};

/// Locals and upvalues are indexed by a single operand byte, so a
/// function can have at most this many of each (slot zero counts).
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
/// A `switch` may have at most this many `case` arms.
const MAX_CASES: usize = 128;

/// Compiles a source string down to the bytecode of its top-level
/// script function. There is no syntax tree: each grammar rule
/// emits code the moment it is parsed, so emission order is
/// evaluation order. On failure, every diagnostic found before
/// the end of input is returned together.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Rc<Function>, Diagnostics> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token::empty(),
        current: Token::empty(),
        errors: Vec::new(),
        panicking: false,
        frame: Frame::new(Function::new(None), FunctionKind::Script),
        heap,
        const_globals: Vec::new(),
    };

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// Expression precedence levels, lowest to highest.
/// The Pratt driver parses at a requested level and consumes
/// operators whose level is at least as high.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None = 0,
    /// `=`
    Assignment,
    /// `?:`
    Ternary,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==`, `!=`
    Equality,
    /// `<`, `>`, `<=`, `>=`
    Comparison,
    /// `+`, `-`
    Term,
    /// `*`, `/`
    Factor,
    /// `!`, unary `-`
    Unary,
    /// `f(...)`
    Call,
    Primary,
}

impl Prec {
    /// One level higher; parsing a binary operator's right side at
    /// this level is what makes the operator left-associative.
    fn next(self) -> Prec {
        if let Prec::Primary = self {
            panic!("no precedence above Primary");
        }
        unsafe { mem::transmute(self as u8 + 1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// A local variable slot in the function being compiled. The slot
/// index in this array is exactly the operand-stack offset the
/// variable will occupy at runtime, relative to the frame base.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still running.
    depth: i32,
    constant: bool,
    /// Set when a nested function closes over this slot, so scope
    /// exit knows to close the upvalue instead of popping.
    captured: bool,
}

/// A variable captured from an enclosing function: either one of
/// the enclosing function's own locals, or something it captured
/// in turn. Only `is_local` and `index` reach the bytecode; the
/// const flag rides along so reassignment through a capture is
/// still rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Captured {
    index: u8,
    is_local: bool,
    constant: bool,
}

/// Per-loop bookkeeping. `break` jumps are collected here and
/// patched when the loop ends; `continue` jumps straight to
/// `start`, which a `for` loop retargets at its increment clause.
#[derive(Debug)]
struct Loop {
    start: usize,
    /// Scope depth at loop entry; locals deeper than this are
    /// popped when breaking or continuing out of the loop body.
    depth: i32,
    breaks: Vec<usize>,
}

/// State for one function being compiled. Compiling a nested
/// function swaps a fresh frame in and suspends the enclosing one
/// behind `enclosing`, forming a chain that upvalue resolution
/// walks outward.
struct Frame<'src> {
    enclosing: Option<Box<Frame<'src>>>,
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Captured>,
    scope_depth: i32,
    loops: Vec<Loop>,
}

impl<'src> Frame<'src> {
    fn new(function: Function, kind: FunctionKind) -> Frame<'src> {
        Frame {
            enclosing: None,
            function,
            kind,
            // slot zero holds the closure being run; the empty
            // name keeps user code from resolving to it
            locals: vec![Local {
                name: "",
                depth: 0,
                constant: false,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }

    /// Finds `name` among this function's locals, innermost
    /// first. Reading a local whose initializer is still being
    /// compiled is an error.
    fn resolve_local(&self, name: &str) -> Result<Option<usize>, &'static str> {
        for (index, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Resolves `name` as a capture from some enclosing function:
    /// either a local one level up (which gets marked captured),
    /// or transitively an upvalue of the enclosing function.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<usize>, &'static str> {
        let captured = match self.enclosing.as_mut() {
            None => return Ok(None),
            Some(enclosing) => {
                if let Some(index) = enclosing.resolve_local(name)? {
                    enclosing.locals[index].captured = true;
                    Captured {
                        index: index as u8,
                        is_local: true,
                        constant: enclosing.locals[index].constant,
                    }
                } else if let Some(index) = enclosing.resolve_upvalue(name)? {
                    Captured {
                        index: index as u8,
                        is_local: false,
                        constant: enclosing.upvalues[index].constant,
                    }
                } else {
                    return Ok(None);
                }
            }
        };
        Ok(Some(self.add_upvalue(captured)?))
    }

    /// Adds an upvalue entry, reusing an existing one for the
    /// same target.
    fn add_upvalue(&mut self, captured: Captured) -> Result<usize, &'static str> {
        let existing = self
            .upvalues
            .iter()
            .position(|u| u.index == captured.index && u.is_local == captured.is_local);
        if let Some(index) = existing {
            return Ok(index);
        }

        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many captured variables in function.");
        }
        self.upvalues.push(captured);
        self.function.upvalue_count = self.upvalues.len();
        Ok(self.upvalues.len() - 1)
    }
}

/// How a variable reference resolved, and whether the binding is
/// const.
enum Resolved {
    Local(usize, bool),
    Upvalue(usize, bool),
    Global,
}

struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    errors: Vec<Syntax>,
    /// Set on the first error; suppresses the rest until the
    /// parser synchronizes on a statement boundary.
    panicking: bool,
    frame: Frame<'src>,
    heap: &'heap mut Heap,
    /// Names declared `const` at global scope in this compilation.
    const_globals: Vec<&'src str>,
}

impl<'src> Compiler<'src, '_> {
    // ------------------------------------------------------ driver

    /// Steps to the next token, reporting (and skipping) any scan
    /// errors along the way.
    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    /// Reports an error at the just-consumed token.
    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panicking {
            return;
        }
        self.panicking = true;

        let at = match token.kind {
            TokenKind::Eof => At::End,
            TokenKind::Error => At::Scan,
            _ => At::Token(token.lexeme.to_string()),
        };
        self.errors.push(Syntax {
            line: token.line,
            at,
            message: message.to_string(),
        });
    }

    /// Skips forward to a likely statement boundary so one error
    /// doesn't cascade into dozens.
    fn synchronize(&mut self) {
        self.panicking = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn finish(mut self) -> Result<Rc<Function>, Diagnostics> {
        self.emit(Opcode::Nil);
        self.emit(Opcode::Return);

        if !self.errors.is_empty() {
            return Err(Diagnostics(self.errors));
        }
        debug!(
            bytes = self.frame.function.chunk.code.len(),
            constants = self.frame.function.chunk.constants.len(),
            "compiled script"
        );
        Ok(self.heap.register_function(self.frame.function))
    }

    // ---------------------------------------------------- emission

    fn emit(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.frame.function.chunk.emit(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.frame.function.chunk.write(byte, line);
    }

    /// Emits an index operand in short (one byte) or long
    /// (four byte) form depending on its size.
    fn emit_index(&mut self, short: Opcode, long: Opcode, index: usize) {
        if index < 256 {
            self.emit(short);
            self.emit_byte(index as u8);
        } else {
            self.emit(long);
            let line = self.previous.line;
            self.frame.function.chunk.write_u32(index as u32, line);
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.frame.function.chunk.add_constant(value);
        self.emit_index(Opcode::Const, Opcode::ConstLong, index);
    }

    /// Emits a jump with a two-byte hole and returns the offset of
    /// the jump opcode for later patching.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        let from = self.frame.function.chunk.code.len();
        self.emit(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        from
    }

    /// Points the jump at `from` to the current end of the chunk.
    fn patch_jump(&mut self, from: usize) {
        let target = self.frame.function.chunk.code.len();
        if self.frame.function.chunk.patch_jump(from, target).is_err() {
            self.error("Can't jump this far.");
        }
    }

    /// Emits a jump to an already-known (usually backward) target.
    fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        let from = self.emit_jump(op);
        if self.frame.function.chunk.patch_jump(from, target).is_err() {
            self.error("Can't jump this far.");
        }
    }

    // ------------------------------------------------ declarations

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Const) {
            self.var_declaration(true);
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }

        if self.panicking {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, constant: bool) {
        let global = self.parse_variable("Expect variable name.", constant);

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        let name = self.previous.lexeme;
        // a local function can call itself, so the name binding
        // becomes visible before the body compiles
        self.mark_initialized();
        self.function(name);
        self.define_variable(global);
    }

    /// Consumes a variable name and declares it. Returns the
    /// constant-pool index of the name for globals, or `None` for
    /// locals.
    fn parse_variable(&mut self, message: &str, constant: bool) -> Option<usize> {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(constant);
        if self.frame.scope_depth > 0 {
            return None;
        }
        if constant {
            self.const_globals.push(self.previous.lexeme);
        }
        Some(self.identifier_constant(self.previous.lexeme))
    }

    /// Interns a name and parks it in the constant pool so the
    /// runtime can look the global up by value.
    fn identifier_constant(&mut self, name: &str) -> usize {
        let name = self.heap.intern(name);
        self.frame.function.chunk.add_constant(Value::Str(name))
    }

    fn declare_variable(&mut self, constant: bool) {
        if self.frame.scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut clash = false;
        for local in self.frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.frame.scope_depth {
                break;
            }
            if local.name == name {
                clash = true;
                break;
            }
        }
        if clash {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name, constant);
    }

    fn add_local(&mut self, name: &'src str, constant: bool) {
        if self.frame.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame.locals.push(Local {
            name,
            depth: -1,
            constant,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.frame.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.frame.locals.last_mut() {
            local.depth = self.frame.scope_depth;
        }
    }

    fn define_variable(&mut self, global: Option<usize>) {
        match global {
            None => self.mark_initialized(),
            Some(index) => {
                self.emit_index(Opcode::DefineGlobal, Opcode::DefineGlobalLong, index);
            }
        }
    }

    /// Compiles a function's parameter list and body in a fresh
    /// nested frame, then emits the closure that wraps it.
    fn function(&mut self, name: &'src str) {
        let name = self.heap.intern(name);
        let nested = Frame::new(Function::new(Some(name)), FunctionKind::Function);
        let enclosing = mem::replace(&mut self.frame, nested);
        self.frame.enclosing = Some(Box::new(enclosing));

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.frame.function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.frame.function.arity += 1;
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                // parameters are const: the argument slot is the
                // caller's value, not a scratch variable
                self.declare_variable(true);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.emit(Opcode::Nil);
        self.emit(Opcode::Return);

        // surface back into the enclosing function
        let enclosing = match self.frame.enclosing.take() {
            Some(enclosing) => enclosing,
            None => unreachable!("can't surface past the top-level script"),
        };
        let nested = mem::replace(&mut self.frame, *enclosing);
        let upvalues = nested.upvalues;
        let function = self.heap.register_function(nested.function);

        let index = self
            .frame
            .function
            .chunk
            .add_constant(Value::Function(function));
        self.emit_index(Opcode::Closure, Opcode::ClosureLong, index);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    // -------------------------------------------------- statements

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Opcode::Pop);
    }

    /// Declarations until the closing brace.
    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.frame.scope_depth += 1;
    }

    /// Pops the scope's locals off both the compiler's array and
    /// the runtime stack. Captured slots are closed instead of
    /// popped, so live closures keep seeing them.
    fn end_scope(&mut self) {
        self.frame.scope_depth -= 1;
        loop {
            match self.frame.locals.last() {
                Some(local) if local.depth > self.frame.scope_depth => {
                    let op = if local.captured {
                        Opcode::CloseUpvalue
                    } else {
                        Opcode::Pop
                    };
                    self.frame.locals.pop();
                    self.emit(op);
                }
                _ => break,
            }
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        let otherwise = self.emit_jump(Opcode::Jump);

        self.patch_jump(then);
        self.emit(Opcode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(otherwise);
    }

    fn while_statement(&mut self) {
        let start = self.frame.function.chunk.code.len();
        self.frame.loops.push(Loop {
            start,
            depth: self.frame.scope_depth,
            breaks: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        self.emit_jump_to(Opcode::Jump, start);

        self.patch_jump(exit);
        self.emit(Opcode::Pop);
        self.finish_loop();
    }

    /// `for` desugars in place: initializer, condition with exit
    /// jump, a jump over the increment into the body, and a back
    /// edge from the body through the increment to the condition.
    /// `continue` targets the increment so it runs on every
    /// iteration.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Const) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut start = self.frame.function.chunk.code.len();
        self.frame.loops.push(Loop {
            start,
            depth: self.frame.scope_depth,
            breaks: Vec::new(),
        });

        let mut exit = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit(Opcode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body = self.emit_jump(Opcode::Jump);
            let increment = self.frame.function.chunk.code.len();
            self.expression();
            self.emit(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_jump_to(Opcode::Jump, start);
            start = increment;
            if let Some(active) = self.frame.loops.last_mut() {
                active.start = increment;
            }
            self.patch_jump(body);
        }

        self.statement();
        self.emit_jump_to(Opcode::Jump, start);

        if let Some(exit) = exit {
            self.patch_jump(exit);
            self.emit(Opcode::Pop);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// Pops the innermost loop record and lands its breaks here.
    fn finish_loop(&mut self) {
        let breaks = match self.frame.loops.pop() {
            Some(finished) => finished.breaks,
            None => unreachable!("loop stack underflow"),
        };
        for from in breaks {
            self.patch_jump(from);
        }
    }

    /// The switch value is parked in a nameless local so every
    /// case test can re-read it. First matching case wins, there
    /// is no fallthrough, and `default` must come last.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.begin_scope();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let slot = self.frame.locals.len();
        self.add_local("", false);
        if let Some(local) = self.frame.locals.last_mut() {
            local.depth = self.frame.scope_depth;
        }

        let mut case_ends = Vec::new();
        let mut pending: Option<usize> = None;
        let mut cases = 0;
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) {
                if seen_default {
                    self.error("Can't have a case after the default case.");
                }
                if cases == MAX_CASES {
                    self.error("Too many cases in switch statement.");
                }
                cases += 1;

                if let Some(from) = pending.take() {
                    self.patch_jump(from);
                    self.emit(Opcode::Pop);
                }

                self.emit(Opcode::GetLocal);
                self.emit_byte(slot as u8);
                self.case_literal();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit(Opcode::Equal);
                pending = Some(self.emit_jump(Opcode::JumpIfFalse));
                self.emit(Opcode::Pop);

                self.case_body();
                case_ends.push(self.emit_jump(Opcode::Jump));
            } else if self.matches(TokenKind::Default) {
                if seen_default {
                    self.error("Can't have more than one default case.");
                }
                seen_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");

                if let Some(from) = pending.take() {
                    self.patch_jump(from);
                    self.emit(Opcode::Pop);
                }
                self.case_body();
                case_ends.push(self.emit_jump(Opcode::Jump));
            } else {
                self.error_at_current("Expect 'case' or 'default'.");
                self.advance();
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");

        // an unmatched final case falls out here
        if let Some(from) = pending.take() {
            self.patch_jump(from);
            self.emit(Opcode::Pop);
        }
        for from in case_ends {
            self.patch_jump(from);
        }
        self.end_scope();
    }

    /// Case labels are single literals, compiled straight onto the
    /// stack for the equality test.
    fn case_literal(&mut self) {
        if self.matches(TokenKind::Number) {
            self.number();
        } else if self.matches(TokenKind::String) {
            self.string();
        } else if self.matches(TokenKind::True) {
            self.emit(Opcode::True);
        } else if self.matches(TokenKind::False) {
            self.emit(Opcode::False);
        } else if self.matches(TokenKind::Nil) {
            self.emit(Opcode::Nil);
        } else {
            self.error_at_current("Expect a literal case value.");
        }
    }

    /// Statements until the next case boundary.
    fn case_body(&mut self) {
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
        {
            self.statement();
        }
    }

    fn break_statement(&mut self) {
        let target = self.loop_label("break");
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(target) = target else { return };

        self.emit_scope_exit(target);
        let from = self.emit_jump(Opcode::Jump);
        self.frame.loops[target].breaks.push(from);
    }

    fn continue_statement(&mut self) {
        let target = self.loop_label("continue");
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(target) = target else { return };

        self.emit_scope_exit(target);
        let start = self.frame.loops[target].start;
        self.emit_jump_to(Opcode::Jump, start);
    }

    /// Parses the optional integer label after `break`/`continue`
    /// and resolves it to a loop-stack index. A bare statement
    /// targets the innermost loop.
    fn loop_label(&mut self, keyword: &str) -> Option<usize> {
        let mut label = 1;
        if self.matches(TokenKind::Number) {
            match self.previous.lexeme.parse::<f64>() {
                Ok(n) if n >= 1.0 && n.fract() == 0.0 => label = n as usize,
                _ => {
                    self.error("Loop label must be a positive integer.");
                    return None;
                }
            }
        }

        if self.frame.loops.is_empty() {
            self.error(&format!("Can't use '{}' outside of a loop.", keyword));
            return None;
        }
        if label > self.frame.loops.len() {
            self.error("Loop label exceeds enclosing loop depth.");
            return None;
        }
        Some(self.frame.loops.len() - label)
    }

    /// Emits the pops (or upvalue closes) that leaving every scope
    /// down to the target loop's depth requires, without touching
    /// the compiler's own idea of the scopes: the statements after
    /// the jump still compile against the unchanged locals.
    fn emit_scope_exit(&mut self, target: usize) {
        let depth = self.frame.loops[target].depth;
        let ops: Vec<Opcode> = self
            .frame
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| {
                if local.captured {
                    Opcode::CloseUpvalue
                } else {
                    Opcode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit(op);
        }
    }

    fn return_statement(&mut self) {
        if self.frame.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit(Opcode::Nil);
            self.emit(Opcode::Return);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(Opcode::Return);
        }
    }

    // ------------------------------------------------- expressions

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    /// The Pratt driver: parse one prefix expression, then keep
    /// folding in infix operators while they bind at least as
    /// tightly as `prec`. Assignability threads through so only
    /// targets parsed at assignment level accept an `=`.
    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while Self::infix_prec(self.current.kind) >= prec {
            self.advance();
            self.infix(self.previous.kind);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatches the prefix rule for a token. Returns false when
    /// the token cannot begin an expression.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(kind),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::Nil => self.emit(Opcode::Nil),
            TokenKind::True => self.emit(Opcode::True),
            TokenKind::False => self.emit(Opcode::False),
            TokenKind::Identifier => self.variable(can_assign),
            _ => return false,
        }
        true
    }

    /// The precedence an infix (or postfix-call) token binds at.
    fn infix_prec(kind: TokenKind) -> Prec {
        match kind {
            TokenKind::Question => Prec::Ternary,
            TokenKind::Or => Prec::Or,
            TokenKind::And => Prec::And,
            TokenKind::BangEqual | TokenKind::EqualEqual => Prec::Equality,
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => Prec::Comparison,
            TokenKind::Minus | TokenKind::Plus => Prec::Term,
            TokenKind::Slash | TokenKind::Star => Prec::Factor,
            TokenKind::LeftParen => Prec::Call,
            _ => Prec::None,
        }
    }

    fn infix(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::Question => self.ternary(),
            TokenKind::Or => self.or(),
            TokenKind::And => self.and(),
            TokenKind::LeftParen => self.call(),
            _ => self.binary(kind),
        }
    }

    fn number(&mut self) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        // the token includes the quotes
        let text = &lexeme[1..lexeme.len() - 1];
        let string = self.heap.intern(text);
        self.emit_constant(Value::Str(string));
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, op: TokenKind) {
        self.parse_precedence(Prec::Unary);
        match op {
            TokenKind::Minus => self.emit(Opcode::Negate),
            TokenKind::Bang => self.emit(Opcode::Not),
            _ => unreachable!("not a unary operator"),
        }
    }

    /// `!=`, `<=` and `>=` have no opcode of their own; they lower
    /// to the complementary comparison plus `Not`.
    fn binary(&mut self, op: TokenKind) {
        self.parse_precedence(Self::infix_prec(op).next());
        match op {
            TokenKind::Plus => self.emit(Opcode::Add),
            TokenKind::Minus => self.emit(Opcode::Subtract),
            TokenKind::Star => self.emit(Opcode::Multiply),
            TokenKind::Slash => self.emit(Opcode::Divide),
            TokenKind::EqualEqual => self.emit(Opcode::Equal),
            TokenKind::BangEqual => {
                self.emit(Opcode::Equal);
                self.emit(Opcode::Not);
            }
            TokenKind::Greater => self.emit(Opcode::Greater),
            TokenKind::GreaterEqual => {
                self.emit(Opcode::Less);
                self.emit(Opcode::Not);
            }
            TokenKind::Less => self.emit(Opcode::Less),
            TokenKind::LessEqual => {
                self.emit(Opcode::Greater);
                self.emit(Opcode::Not);
            }
            _ => unreachable!("not a binary operator"),
        }
    }

    /// Short-circuit `and`: when the left side is falsey it stays
    /// on the stack as the result; otherwise it is discarded and
    /// the right side takes its place.
    fn and(&mut self) {
        let end = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end);
    }

    fn or(&mut self) {
        let end = self.emit_jump(Opcode::JumpIfTrue);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::Or);
        self.patch_jump(end);
    }

    /// `a ? b : c`. The then-branch parses at ternary level and
    /// the else-branch at assignment level, which is what makes
    /// the operator right-associative.
    fn ternary(&mut self) {
        let otherwise = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::Ternary);
        self.consume(TokenKind::Colon, "Expect ':' in conditional expression.");

        let end = self.emit_jump(Opcode::Jump);
        self.patch_jump(otherwise);
        self.emit(Opcode::Pop);
        self.parse_precedence(Prec::Assignment);
        self.patch_jump(end);
    }

    fn call(&mut self) {
        let mut args: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if args == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    args += 1;
                }
                self.expression();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        self.emit(Opcode::Call);
        self.emit_byte(args);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    /// Resolution order: the current function's locals, then
    /// upvalues captured from enclosing functions, then a global
    /// looked up by name at runtime.
    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let resolved = match self.frame.resolve_local(name) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(index)) => Resolved::Local(index, self.frame.locals[index].constant),
            Ok(None) => match self.frame.resolve_upvalue(name) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some(index)) => Resolved::Upvalue(index, self.frame.upvalues[index].constant),
                Ok(None) => Resolved::Global,
            },
        };

        if can_assign && self.matches(TokenKind::Equal) {
            match resolved {
                Resolved::Local(index, constant) => {
                    if constant {
                        self.error(&format!("Can't assign to constant '{}'.", name));
                    }
                    self.expression();
                    self.emit(Opcode::SetLocal);
                    self.emit_byte(index as u8);
                }
                Resolved::Upvalue(index, constant) => {
                    if constant {
                        self.error(&format!("Can't assign to constant '{}'.", name));
                    }
                    self.expression();
                    self.emit(Opcode::SetUpvalue);
                    self.emit_byte(index as u8);
                }
                Resolved::Global => {
                    if self.const_globals.contains(&name) {
                        self.error(&format!("Can't assign to constant '{}'.", name));
                    }
                    let index = self.identifier_constant(name);
                    self.expression();
                    self.emit_index(Opcode::SetGlobal, Opcode::SetGlobalLong, index);
                }
            }
        } else {
            match resolved {
                Resolved::Local(index, _) => {
                    self.emit(Opcode::GetLocal);
                    self.emit_byte(index as u8);
                }
                Resolved::Upvalue(index, _) => {
                    self.emit(Opcode::GetUpvalue);
                    self.emit_byte(index as u8);
                }
                Resolved::Global => {
                    let index = self.identifier_constant(name);
                    self.emit_index(Opcode::GetGlobal, Opcode::GetGlobalLong, index);
                }
            }
        }
    }
}
