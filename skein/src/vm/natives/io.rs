use std::io::BufRead;

use super::NativeError;
use crate::vm::heap::Heap;
use crate::vm::value::Value;

fn read_line() -> Result<String, NativeError> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| NativeError::new(format!("Failed to read input: {e}.")))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// string_input() -> string; one line from stdin without the newline.
pub(super) fn string_input(heap: &mut Heap, _args: &[Value]) -> Result<Value, NativeError> {
    let line = read_line()?;
    Ok(Value::Obj(heap.intern(&line)))
}

/// number_input() -> number; one line from stdin parsed as a number.
pub(super) fn number_input(_heap: &mut Heap, _args: &[Value]) -> Result<Value, NativeError> {
    let line = read_line()?;
    line.trim()
        .parse::<f64>()
        .map(Value::Number)
        .map_err(|_| NativeError::new("Input is not a number."))
}
