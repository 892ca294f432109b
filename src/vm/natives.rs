use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::heap::Heap;
use crate::common::object::{Native, NativeCtx, NativeResult};
use crate::common::table::Table;
use crate::common::value::Value;

/// Registers the built-in natives as globals. Called once at VM
/// startup; the names are ordinary globals afterwards and can be
/// shadowed (or clobbered) by user code.
pub fn install(globals: &mut Table, heap: &mut Heap) {
    let natives = [
        Native {
            name: "clock",
            arity: Some(0),
            function: clock,
        },
        Native {
            name: "tostring",
            arity: Some(1),
            function: tostring,
        },
        Native {
            name: "assert",
            arity: Some(1),
            function: assert,
        },
        Native {
            name: "printf",
            arity: None,
            function: printf,
        },
        Native {
            name: "dump",
            arity: None,
            function: dump,
        },
    ];

    for native in natives {
        let name = heap.intern(native.name);
        let native = heap.register_native(native);
        globals.set(Value::Str(name), Value::Native(native));
    }
}

/// Seconds since the Unix epoch, as a number. Good enough for
/// timing scripts; not a high-resolution clock.
fn clock(_ctx: &mut NativeCtx, _args: &[Value]) -> NativeResult {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| None)?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// The display form of any value, as an interned string.
fn tostring(ctx: &mut NativeCtx, args: &[Value]) -> NativeResult {
    let text = args[0].to_string();
    Ok(Value::Str(ctx.heap.intern(&text)))
}

/// Errors out on a falsey argument; passes truthy values through.
fn assert(_ctx: &mut NativeCtx, args: &[Value]) -> NativeResult {
    if args[0].is_falsey() {
        return Err(None);
    }
    Ok(args[0].clone())
}

/// Prints every argument back to back, then a newline.
fn printf(ctx: &mut NativeCtx, args: &[Value]) -> NativeResult {
    for arg in args {
        let _ = write!(ctx.out, "{}", arg);
    }
    let _ = writeln!(ctx.out);
    Ok(Value::Nil)
}

/// Diagnostic printer: one labelled line per argument in debug
/// form, and a full disassembly for functions and closures.
fn dump(ctx: &mut NativeCtx, args: &[Value]) -> NativeResult {
    for (index, arg) in args.iter().enumerate() {
        let _ = writeln!(ctx.out, "[{}] {:?}", index, arg);
        let function = match arg {
            Value::Function(function) => Some(function),
            Value::Closure(closure) => Some(&closure.function),
            _ => None,
        };
        if let Some(function) = function {
            let name = arg.to_string();
            let _ = write!(ctx.out, "{}", function.chunk.disassemble(&name));
        }
    }
    Ok(Value::Nil)
}
