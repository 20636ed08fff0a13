//! Property tests:
//! 1. Scanning is deterministic and total — any input yields the same
//!    token stream twice and always terminates at Eof.
//! 2. The hash table behaves like a reference map under arbitrary
//!    insert/overwrite/delete sequences.
//! 3. Compiling a source is deterministic, and pure arithmetic evaluates
//!    to the same output on every run.

use proptest::prelude::*;

use skein::vm::exec::Output;
use skein::vm::heap::Heap;
use skein::vm::scanner::{Scanner, TokenKind};
use skein::vm::table::{hash_bytes, Table};
use skein::vm::value::Value;
use skein::vm::{Dispatcher, InterpretResult, Vm};

fn scan_all(source: &str) -> Vec<(TokenKind, String, i32)> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = scanner.scan_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push((token.kind, token.lexeme.to_string(), token.line));
        if done {
            return tokens;
        }
    }
}

proptest! {
    #[test]
    fn scanning_is_deterministic(source in "\\PC{0,200}") {
        prop_assert_eq!(scan_all(&source), scan_all(&source));
    }

    #[test]
    fn scanning_terminates_on_ascii_soup(source in "[-+*/%!=<>(){};,.a-z0-9\"\n]{0,200}") {
        let tokens = scan_all(&source);
        prop_assert_eq!(tokens.last().map(|t| t.0), Some(TokenKind::Eof));
    }
}

// -- Table model check --

#[derive(Debug, Clone)]
enum TableOp {
    Set(u8, f64),
    Delete(u8),
    Get(u8),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        (any::<u8>(), any::<f64>()).prop_map(|(k, v)| TableOp::Set(k, v)),
        any::<u8>().prop_map(TableOp::Delete),
        any::<u8>().prop_map(TableOp::Get),
    ]
}

proptest! {
    #[test]
    fn table_matches_reference_map(ops in proptest::collection::vec(table_op(), 0..200)) {
        let mut heap = Heap::new();
        // Interned keys: identity equality makes the handle the key.
        let keys: Vec<_> = (0u16..256)
            .map(|n| heap.intern(&format!("key{n}")))
            .collect();
        let hashes: Vec<u32> = (0u16..256)
            .map(|n| hash_bytes(format!("key{n}").as_bytes()))
            .collect();

        let mut table = Table::new();
        let mut reference = std::collections::HashMap::new();

        for op in ops {
            match op {
                TableOp::Set(k, v) => {
                    let value = Value::Number(if v.is_nan() { 0.0 } else { v });
                    let was_new = table.set(keys[k as usize], hashes[k as usize], value);
                    let ref_new = reference.insert(k, value).is_none();
                    prop_assert_eq!(was_new, ref_new);
                }
                TableOp::Delete(k) => {
                    let deleted = table.delete(keys[k as usize], hashes[k as usize]);
                    let ref_deleted = reference.remove(&k).is_some();
                    prop_assert_eq!(deleted, ref_deleted);
                }
                TableOp::Get(k) => {
                    let got = table.get(keys[k as usize], hashes[k as usize]);
                    prop_assert_eq!(got, reference.get(&k).copied());
                }
            }
        }

        // Full sweep at the end.
        for k in 0u16..256 {
            let got = table.get(keys[k as usize], hashes[k as usize]);
            prop_assert_eq!(got, reference.get(&(k as u8)).copied());
        }
    }
}

// -- Determinism of compilation and pure evaluation --

/// Small arithmetic expression trees over integer literals.
fn arith_expr() -> impl Strategy<Value = String> {
    let leaf = (0u32..100).prop_map(|n| n.to_string());
    leaf.prop_recursive(4, 32, 2, |inner| {
        (
            inner.clone(),
            prop_oneof![Just("+"), Just("*"), Just("-")],
            inner,
        )
            .prop_map(|(a, op, b)| format!("({a} {op} {b})"))
    })
}

fn run_print(expr: &str) -> (InterpretResult, String) {
    let dispatcher = Dispatcher::new();
    let (out, buffer) = Output::buffer();
    let mut vm = Vm::with_output(&dispatcher, out);
    let result = vm.interpret(&format!("print {expr};"));
    let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
    (result, String::from_utf8_lossy(&bytes).into_owned())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pure_arithmetic_is_referentially_transparent(expr in arith_expr()) {
        let (r1, out1) = run_print(&expr);
        let (r2, out2) = run_print(&expr);
        prop_assert_eq!(r1, InterpretResult::Ok);
        prop_assert_eq!(r2, InterpretResult::Ok);
        prop_assert_eq!(out1, out2);
    }

    #[test]
    fn compilation_is_deterministic(expr in arith_expr()) {
        use skein::vm::compiler::compile;
        let source = format!("print {expr};");
        let mut heap1 = Heap::new();
        let f1 = compile(&source, &mut heap1).expect("compiles");
        let mut heap2 = Heap::new();
        let f2 = compile(&source, &mut heap2).expect("compiles");
        prop_assert_eq!(
            &heap1.function(f1).chunk.code,
            &heap2.function(f2).chunk.code
        );
    }
}
