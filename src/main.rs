mod chunk;
mod compiler;
mod heap;
mod natives;
mod reporter;
mod scanner;
mod table;
mod token;
mod value;
mod vm;

use reporter::CliReporter;
use rustyline::Editor;
use std::{env, fs, process::exit};
use vm::{InterpretError, Vm};

fn main() {
    let mut args = env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => run_repl(),
        (Some(path), None) => run_file(&path),
        _ => {
            eprintln!("Usage: lox [path]");
            exit(exitcode::USAGE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter;
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                // Both error kinds leave the session alive.
                vm.interpret(&line, &mut reporter).ok();
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read \"{}\": {}.", path, err);
        exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    match vm.interpret(&source, &mut CliReporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => exit(exitcode::SOFTWARE),
    }
}
