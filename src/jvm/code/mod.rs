//! Method bodies: decoding, building, and editing instructions

mod bytecode;
mod code;
mod exception_table;
mod iterator;
pub mod opcodes;

pub use bytecode::*;
pub use code::*;
pub use exception_table::*;
pub use iterator::*;
pub use opcodes::instruction_length;
