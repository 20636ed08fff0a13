use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{Dispatcher, Vm};

// ---------------------------------------------------------------------------
// REPL
// ---------------------------------------------------------------------------

/// Interactive session. One VM lives for the whole session, so globals,
/// classes, and functions defined on earlier lines stay usable. Returns
/// the process exit code.
pub fn run() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Failed to start the REPL: {e}");
            return 74;
        }
    };

    let dispatcher = Dispatcher::new();
    let mut vm = Vm::new(&dispatcher);

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Errors were already rendered to stderr; the session
                // carries on either way.
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return 0,
            Err(e) => {
                eprintln!("{e}");
                return 74;
            }
        }
    }
}
