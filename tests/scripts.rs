//! End-to-end snippet tests: each case runs a source string
//! through a fresh VM and checks what lands on (an in-memory)
//! stdout, or which error unwinds.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use indoc::indoc;
use pretty_assertions::assert_eq;

use waxwing::{Error, Trace, VM};

/// A writer the test keeps a handle to while the VM owns a clone.
#[derive(Clone, Default)]
struct Buffer(Rc<RefCell<Vec<u8>>>);

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (String, Result<(), Error>) {
    let buffer = Buffer::default();
    let mut vm = VM::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.0.borrow().clone()).unwrap();
    (output, result)
}

/// Runs a snippet that must succeed and returns its stdout.
fn output_of(source: &str) -> String {
    let (output, result) = run(source);
    match result {
        Ok(()) => output,
        Err(err) => panic!("unexpected error:\n{}", err),
    }
}

/// Runs a snippet that must hit a runtime error; returns stdout
/// so far and the trace.
fn runtime_error_of(source: &str) -> (String, Trace) {
    let (output, result) = run(source);
    match result {
        Err(Error::Runtime(trace)) => (output, trace),
        Err(Error::Compile(diagnostics)) => {
            panic!("expected runtime error, compile failed:\n{}", diagnostics)
        }
        Ok(()) => panic!("expected a runtime error, ran fine"),
    }
}

fn compile_error_of(source: &str) -> String {
    let (_, result) = run(source);
    match result {
        Err(Error::Compile(diagnostics)) => diagnostics.to_string(),
        other => panic!("expected a compile error, got {:?}", other.err()),
    }
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(output_of("print 1 + 2 * 3;"), "7\n");
    assert_eq!(output_of("print (1 + 2) * 3;"), "9\n");
    assert_eq!(output_of("print 1 - 2 - 3;"), "-4\n");
    assert_eq!(output_of("print 8 / 2 / 2;"), "2\n");
    assert_eq!(output_of("print !true == false;"), "true\n");
}

#[test]
fn closures_capture_by_reference() {
    let source = indoc! {r#"
        fun makeCounter() {
          var i = 0;
          fun count() { i = i + 1; return i; }
          return count;
        }
        var c = makeCounter();
        print c(); print c(); print c();
    "#};
    assert_eq!(output_of(source), "1\n2\n3\n");
}

#[test]
fn counters_are_independent() {
    let source = indoc! {r#"
        fun makeCounter() {
          var i = 0;
          fun count() { i = i + 1; return i; }
          return count;
        }
        var a = makeCounter();
        var b = makeCounter();
        a(); a();
        print a(); print b();
    "#};
    assert_eq!(output_of(source), "3\n1\n");
}

#[test]
fn captured_locals_see_later_writes() {
    let source = indoc! {r#"
        fun box() {
          var v = "before";
          fun get() { return v; }
          v = "after";
          return get;
        }
        print box()();
    "#};
    assert_eq!(output_of(source), "after\n");
}

#[test]
fn break_with_label_leaves_outer_loop() {
    let source = indoc! {r#"
        var i = 0;
        while (i < 10) {
          var j = 0;
          while (j < 10) {
            if (j == 3) break 2;
            j = j + 1;
          }
          i = i + 1;
        }
        print i;
        print j;
    "#};
    let (output, trace) = runtime_error_of(source);
    // the outer loop body never finished its first pass
    assert_eq!(output, "0\n");
    // j was scoped to the loop body and is gone afterwards
    assert_eq!(trace.message, "Undefined variable 'j'.");
    assert_eq!(trace.frames[0].function, None);
}

#[test]
fn continue_in_for_still_runs_the_increment() {
    let source = indoc! {r#"
        for (var i = 0; i < 5; i = i + 1) {
          if (i == 2) continue;
          print i;
        }
    "#};
    assert_eq!(output_of(source), "0\n1\n3\n4\n");
}

#[test]
fn continue_with_label_restarts_the_outer_loop() {
    let source = indoc! {r#"
        for (var i = 0; i < 3; i = i + 1) {
          for (var j = 0; j < 3; j = j + 1) {
            if (j == 1) continue 2;
            printf(i, j);
          }
        }
    "#};
    assert_eq!(output_of(source), "00\n10\n20\n");
}

#[test]
fn break_leaves_a_plain_while() {
    let source = indoc! {r#"
        var n = 0;
        while (true) {
          n = n + 1;
          if (n == 3) break;
        }
        print n;
    "#};
    assert_eq!(output_of(source), "3\n");
}

#[test]
fn string_interning_makes_concatenation_comparable() {
    assert_eq!(output_of(r#"print "foo" + "bar" == "foobar";"#), "true\n");
    assert_eq!(output_of(r#"print "foo" == "oof";"#), "false\n");
}

#[test]
fn undefined_global_formats_a_trace() {
    let (_, trace) = runtime_error_of("print zzz;");
    assert_eq!(
        trace.to_string(),
        "RuntimeError: Undefined variable 'zzz'.\n[line 1] in script"
    );
}

#[test]
fn if_else_and_truthiness() {
    assert_eq!(output_of(r#"if (nil) print "t"; else print "f";"#), "f\n");
    assert_eq!(output_of(r#"if (0) print "t"; else print "f";"#), "t\n");
    assert_eq!(output_of(r#"if ("") print "t"; else print "f";"#), "t\n");
}

#[test]
fn logic_operators_return_operands() {
    assert_eq!(output_of("print nil and 1;"), "nil\n");
    assert_eq!(output_of("print 1 and 2;"), "2\n");
    assert_eq!(output_of("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(output_of("print 1 or 2;"), "1\n");
}

#[test]
fn short_circuit_skips_side_effects() {
    let source = indoc! {r#"
        var touched = false;
        fun touch() { touched = true; return true; }
        false and touch();
        true or touch();
        print touched;
    "#};
    assert_eq!(output_of(source), "false\n");
}

#[test]
fn ternary_selects_and_nests() {
    assert_eq!(output_of("print true ? 1 : 2;"), "1\n");
    assert_eq!(output_of("print false ? 1 : 2;"), "2\n");
    assert_eq!(
        output_of("print false ? 1 : true ? 2 : 3;"),
        "2\n"
    );
}

#[test]
fn switch_runs_the_first_matching_case_only() {
    let source = indoc! {r#"
        switch (1 + 1) {
          case 1: print "one";
          case 2: print "two";
          case 3: print "three";
          default: print "many";
        }
    "#};
    assert_eq!(output_of(source), "two\n");
}

#[test]
fn switch_falls_back_to_default() {
    let source = indoc! {r#"
        switch ("kiwi") {
          case "apple": print 1;
          case "pear": print 2;
          default: print "no such fruit";
        }
    "#};
    assert_eq!(output_of(source), "no such fruit\n");
}

#[test]
fn switch_without_a_match_does_nothing() {
    let source = indoc! {r#"
        switch (9) {
          case 1: print "one";
        }
        print "after";
    "#};
    assert_eq!(output_of(source), "after\n");
}

#[test]
fn recursion_works_through_the_name_binding() {
    let source = indoc! {r#"
        fun fib(n) {
          if (n < 2) return n;
          return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#};
    assert_eq!(output_of(source), "55\n");
}

#[test]
fn local_functions_recurse_too() {
    let source = indoc! {r#"
        {
          fun countdown(n) {
            if (n == 0) return "done";
            return countdown(n - 1);
          }
          print countdown(5);
        }
    "#};
    assert_eq!(output_of(source), "done\n");
}

#[test]
fn block_scoping_shadows_and_restores() {
    let source = indoc! {r#"
        var a = "outer";
        {
          var a = "inner";
          print a;
        }
        print a;
    "#};
    assert_eq!(output_of(source), "inner\nouter\n");
}

#[test]
fn returns_default_to_nil() {
    assert_eq!(output_of("fun f() { return; } print f();"), "nil\n");
    assert_eq!(output_of("fun g() {} print g();"), "nil\n");
}

#[test]
fn natives_printf_assert_tostring() {
    assert_eq!(output_of(r#"printf("x = ", 1 + 1, "!");"#), "x = 2!\n");
    assert_eq!(output_of("print tostring(true) + tostring(2.5);"), "true2.5\n");
    assert_eq!(output_of("print assert(42);"), "42\n");
    let (_, trace) = runtime_error_of("assert(nil);");
    assert_eq!(trace.message, "Call to native 'assert' failed.");
}

#[test]
fn dump_labels_its_arguments() {
    let (output, result) = run(r#"dump(1, "two");"#);
    result.unwrap();
    assert_eq!(output, "[0] 1\n[1] \"two\"\n");
}

#[test]
fn dump_disassembles_functions() {
    let output = output_of("fun f() { return 1; } dump(f);");
    assert!(output.contains("[0] <fn f>"));
    assert!(output.contains("== <fn f> =="));
    assert!(output.contains("Return"));
}

#[test]
fn compile_errors_render_with_line_and_lexeme() {
    assert_eq!(
        compile_error_of("print 1 +;"),
        "[1] Error at ';': Expect expression."
    );
    assert_eq!(
        compile_error_of("print 1"),
        "[1] Error at end: Expect ';' after value."
    );
    assert_eq!(
        compile_error_of("\"unterminated"),
        "[1] Error: Unterminated string."
    );
}

#[test]
fn several_compile_errors_come_back_together() {
    let report = compile_error_of("var = 1;\nprint 2 +;\n");
    assert_eq!(
        report,
        "[1] Error at '=': Expect variable name.\n[2] Error at ';': Expect expression."
    );
}

#[test]
fn runtime_errors_dont_poison_the_session() {
    let buffer = Buffer::default();
    let mut vm = VM::with_output(Box::new(buffer.clone()));
    vm.interpret("var hits = 0;").unwrap();
    assert!(vm.interpret("hits = hits + nil;").is_err());
    vm.interpret("hits = hits + 1; print hits;").unwrap();
    assert_eq!(String::from_utf8(buffer.0.borrow().clone()).unwrap(), "1\n");
}

#[test]
fn deep_call_chains_are_cut_off() {
    let (_, trace) = runtime_error_of("fun f() { f(); } f();");
    assert_eq!(trace.message, "Call stack overflow.");
}

#[test]
fn loops_mixed_with_closures_capture_per_iteration() {
    let source = indoc! {r#"
        var first;
        var second;
        for (var i = 0; i < 2; i = i + 1) {
          var here = i;
          fun show() { return here; }
          if (i == 0) first = show;
          else second = show;
        }
        print first();
        print second();
    "#};
    assert_eq!(output_of(source), "0\n1\n");
}

#[test]
fn numbers_print_their_shortest_form() {
    assert_eq!(output_of("print 1.0;"), "1\n");
    assert_eq!(output_of("print 0.1 + 0.2;"), "0.30000000000000004\n");
    assert_eq!(output_of("print 1 / 0;"), "inf\n");
}
