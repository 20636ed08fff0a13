//! The Skein scripting language: a bytecode compiler and stack-based VM
//! with lists, classes, closures, a mark–sweep collector, and structured
//! concurrency (`finish` / `async`).

pub mod repl;
pub mod vm;
