use super::NativeError;
use crate::vm::heap::Heap;
use crate::vm::object::ObjBody;
use crate::vm::value::Value;

/// append(list, value) -> nil
pub(super) fn append(heap: &mut Heap, args: &[Value]) -> Result<Value, NativeError> {
    let list = match args[0].as_obj() {
        Some(r) if matches!(heap.get(r).body, ObjBody::List(_)) => r,
        _ => return Err(NativeError::new("append: first argument must be a list.")),
    };
    heap.list_mut(list).items.push(args[1]);
    Ok(Value::Nil)
}

/// delete(list, index) -> nil; shifts the tail left.
pub(super) fn delete(heap: &mut Heap, args: &[Value]) -> Result<Value, NativeError> {
    let list = match args[0].as_obj() {
        Some(r) if matches!(heap.get(r).body, ObjBody::List(_)) => r,
        _ => return Err(NativeError::new("delete: first argument must be a list.")),
    };
    let index = match args[1] {
        Value::Number(n) if n.fract() == 0.0 => n,
        _ => return Err(NativeError::new("delete: index must be an integer.")),
    };
    let len = heap.list(list).items.len();
    if index < 0.0 || index >= len as f64 {
        return Err(NativeError::new("delete: index out of range."));
    }
    heap.list_mut(list).items.remove(index as usize);
    Ok(Value::Nil)
}

/// len(list | string) -> number
pub(super) fn len(heap: &mut Heap, args: &[Value]) -> Result<Value, NativeError> {
    let r = match args[0].as_obj() {
        Some(r) => r,
        None => return Err(NativeError::new("len: argument must be a list or a string.")),
    };
    let length = match &heap.get(r).body {
        ObjBody::List(list) => list.items.len(),
        ObjBody::String(string) => string.bytes.len(),
        _ => return Err(NativeError::new("len: argument must be a list or a string.")),
    };
    Ok(Value::Number(length as f64))
}
