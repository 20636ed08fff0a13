use super::{Exec, Signal, Vm};
use crate::vm::value::Value;

// ---------------------------------------------------------------------------
// Arithmetic, comparison, printing
// ---------------------------------------------------------------------------

impl Vm {
    pub(crate) fn op_add(&mut self) -> Exec {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.drop_top(2);
                self.push(Value::Number(x + y))?;
            }
            (Value::Obj(x), Value::Obj(y))
                if self.heap.is_string(x) && self.heap.is_string(y) =>
            {
                let mut bytes = self.heap.string(x).bytes.clone();
                bytes.extend_from_slice(&self.heap.string(y).bytes);
                // Intern while both operands are still rooted on the stack.
                let result = self.intern(&bytes);
                self.drop_top(2);
                self.push(Value::Obj(result))?;
            }
            _ => return Err(self.report("Operands must be two numbers or two strings.")),
        }
        Ok(Signal::Continue)
    }

    pub(crate) fn op_subtract(&mut self) -> Exec {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
            // Legacy behavior: two single-character strings subtract as
            // their byte difference.
            if self.heap.is_string(x)
                && self.heap.is_string(y)
                && self.heap.string(x).bytes.len() == 1
                && self.heap.string(y).bytes.len() == 1
            {
                let diff = self.heap.string(x).bytes[0] as f64 - self.heap.string(y).bytes[0] as f64;
                self.drop_top(2);
                self.push(Value::Number(diff))?;
                return Ok(Signal::Continue);
            }
        }
        self.binary_number(|x, y| Value::Number(x - y))
    }

    pub(crate) fn op_multiply(&mut self) -> Exec {
        self.binary_number(|x, y| Value::Number(x * y))
    }

    pub(crate) fn op_divide(&mut self) -> Exec {
        self.binary_number(|x, y| Value::Number(x / y))
    }

    pub(crate) fn op_modulus(&mut self) -> Exec {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                // Both operands truncate to integers before the remainder.
                let y = y.trunc() as i64;
                if y == 0 {
                    return Err(self.report("Modulo by zero."));
                }
                let x = x.trunc() as i64;
                self.drop_top(2);
                self.push(Value::Number((x % y) as f64))?;
                Ok(Signal::Continue)
            }
            _ => Err(self.report("Operands must be numbers.")),
        }
    }

    pub(crate) fn op_greater(&mut self) -> Exec {
        self.binary_number(|x, y| Value::Bool(x > y))
    }

    pub(crate) fn op_less(&mut self) -> Exec {
        self.binary_number(|x, y| Value::Bool(x < y))
    }

    pub(crate) fn op_equal(&mut self) -> Exec {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(Value::Bool(a == b))?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_not(&mut self) -> Exec {
        let value = self.pop()?;
        self.push(Value::Bool(value.is_falsey()))?;
        Ok(Signal::Continue)
    }

    pub(crate) fn op_negate(&mut self) -> Exec {
        match self.peek(0) {
            Value::Number(n) => {
                self.drop_top(1);
                self.push(Value::Number(-n))?;
                Ok(Signal::Continue)
            }
            _ => Err(self.report("Operand must be a number.")),
        }
    }

    pub(crate) fn op_print(&mut self) -> Exec {
        let value = self.pop()?;
        let line = self.heap.value_to_string(value);
        self.write_line(&line);
        Ok(Signal::Continue)
    }

    fn binary_number(&mut self, f: impl Fn(f64, f64) -> Value) -> Exec {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.drop_top(2);
                self.push(f(x, y))?;
                Ok(Signal::Continue)
            }
            _ => Err(self.report("Operands must be numbers.")),
        }
    }
}
