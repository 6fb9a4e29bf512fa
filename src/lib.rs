//! A pocket-sized JVM: parses a single Java class file and interprets the
//! integer subset of its bytecode.
pub mod bytecode;
pub mod heap;
pub mod jvm;
pub mod program;
pub mod runtime;
