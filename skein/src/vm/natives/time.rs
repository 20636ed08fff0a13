use std::time::{SystemTime, UNIX_EPOCH};

use super::NativeError;
use crate::vm::heap::Heap;
use crate::vm::value::Value;

/// Seconds since the Unix epoch, fractional part included.
pub(super) fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, NativeError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}
