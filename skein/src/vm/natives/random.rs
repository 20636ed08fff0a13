use super::NativeError;
use crate::vm::heap::Heap;
use crate::vm::value::Value;

/// Uniform number in [0, 1).
pub(super) fn rand(_heap: &mut Heap, _args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Number(rand::random::<f64>()))
}
