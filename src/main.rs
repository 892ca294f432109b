use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, io};

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use waxwing::{Error, Function, Value, VM};

/// Exit codes follow the sysexits convention the test harnesses
/// expect: 65 for bad source, 70 for a runtime failure.
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(
    name = "waxwing",
    version,
    about = "A little scripting language on a bytecode VM"
)]
struct Args {
    /// Script to run; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Print a disassembly of every compiled function before
    /// running
    #[arg(long)]
    dump: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match &args.script {
        Some(path) => run_file(path, args.dump),
        None => repl(args.dump),
    }
}

fn run_file(path: &Path, dump: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: could not read {}: {}", path.display(), err);
            return ExitCode::from(EX_IOERR);
        }
    };

    run_source(&mut VM::new(), &source, dump)
}

/// Compiles and runs one source, reporting errors on stderr and
/// mapping the outcome to an exit code.
fn run_source(vm: &mut VM, source: &str, dump: bool) -> ExitCode {
    let result = if dump {
        match vm.compile(source) {
            Ok(function) => {
                dump_functions(&function);
                vm.execute(function).map_err(Error::Runtime)
            }
            Err(diagnostics) => Err(Error::Compile(diagnostics)),
        }
    } else {
        vm.interpret(source)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Compile(diagnostics)) => {
            eprintln!("{}", diagnostics);
            ExitCode::from(EX_DATAERR)
        }
        Err(Error::Runtime(trace)) => {
            eprintln!("{}", trace);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

/// Disassembles a function and, recursively, every function
/// embedded in its constant pool.
fn dump_functions(function: &Function) {
    let name = match &function.name {
        Some(name) => name.text.to_string(),
        None => "script".to_string(),
    };
    print!("{}", function.chunk.disassemble(&name));

    for constant in &function.chunk.constants {
        if let Value::Function(nested) = constant {
            dump_functions(nested);
        }
    }
}

/// Reads lines into one persistent VM, so definitions from
/// earlier lines stay visible. Errors print and the session
/// carries on.
fn repl(dump: bool) -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Error: could not start line editor: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut vm = VM::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                run_source(&mut vm, &line, dump);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {}", err);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
