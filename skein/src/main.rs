use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

use skein::repl;
use skein::vm::{Dispatcher, InterpretResult, Vm};

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "The Skein scripting language")]
#[command(version)]
struct Cli {
    /// Script to run; starts the REPL when omitted.
    script: Option<PathBuf>,

    /// Dump the compiled top-level bytecode before running.
    #[arg(long)]
    disassemble: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                // Anything else is command-line misuse.
                _ => 64,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let code = match cli.script {
        Some(path) => run_file(&path, cli.disassemble),
        None => repl::run(),
    };
    ExitCode::from(code as u8)
}

fn run_file(path: &PathBuf, disassemble: bool) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read \"{}\": {e}", path.display());
            return 74;
        }
    };

    let dispatcher = Dispatcher::new();
    let mut vm = Vm::new(&dispatcher);
    vm.set_disassemble(disassemble);
    match vm.interpret(&source) {
        InterpretResult::Ok => 0,
        InterpretResult::CompileError => 65,
        InterpretResult::RuntimeError => 70,
    }
}
