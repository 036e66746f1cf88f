//! Compiling snippets of code in the scope of an existing method
//!
//! The patching engine never looks inside snippet source: it hands the text to a
//! [`SnippetCompiler`] along with the variables in scope and a scratch [`Bytecode`] buffer to
//! fill. The crate's own compiler is [`Assembler`], which reads a textual bytecode listing.

mod assembler;
mod scope;

pub use assembler::*;
pub use scope::*;

use crate::jvm;
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::Bytecode;
use std::fmt;

/// Turns snippet source into instructions
pub trait SnippetCompiler {
    /// Compile `source`, appending the instructions to `bytecode`
    ///
    /// Variables the snippet may refer to (parameters, `$_`, ...) are already recorded in
    /// `scope`, and the snippet may declare more. Constants get registered into `constants`.
    /// On failure, the buffer contents are unspecified and the caller is expected to discard it.
    fn compile(
        &self,
        source: &str,
        scope: &mut Scope,
        bytecode: &mut Bytecode,
        constants: &mut ConstantPool,
    ) -> Result<(), CompileError>;
}

/// Reasons a snippet fails to compile
///
/// Line numbers are 1-based and relative to the start of the snippet.
#[derive(Debug)]
pub enum CompileError {
    Syntax { line: usize, message: String },
    UnknownInstruction { line: usize, mnemonic: String },
    UnknownVariable { line: usize, name: String },
    UndefinedLabel { line: usize, label: String },
    DuplicateLabel { line: usize, label: String },
    BadDescriptor { line: usize, descriptor: String },
    StackUnderflow { line: usize },

    /// Instructions could not be encoded (constant pool full, too many locals, ...)
    Bytecode { line: usize, error: jvm::Error },
}

impl CompileError {
    pub fn line(&self) -> usize {
        match self {
            CompileError::Syntax { line, .. }
            | CompileError::UnknownInstruction { line, .. }
            | CompileError::UnknownVariable { line, .. }
            | CompileError::UndefinedLabel { line, .. }
            | CompileError::DuplicateLabel { line, .. }
            | CompileError::BadDescriptor { line, .. }
            | CompileError::StackUnderflow { line }
            | CompileError::Bytecode { line, .. } => *line,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax { line, message } => write!(f, "line {}: {}", line, message),
            CompileError::UnknownInstruction { line, mnemonic } => {
                write!(f, "line {}: unknown instruction '{}'", line, mnemonic)
            }
            CompileError::UnknownVariable { line, name } => {
                write!(f, "line {}: unknown variable '{}'", line, name)
            }
            CompileError::UndefinedLabel { line, label } => {
                write!(f, "line {}: label '{}' is never defined", line, label)
            }
            CompileError::DuplicateLabel { line, label } => {
                write!(f, "line {}: label '{}' is already defined", line, label)
            }
            CompileError::BadDescriptor { line, descriptor } => {
                write!(f, "line {}: malformed type '{}'", line, descriptor)
            }
            CompileError::StackUnderflow { line } => {
                write!(f, "line {}: operand stack underflow", line)
            }
            CompileError::Bytecode { line, error } => write!(f, "line {}: {}", line, error),
        }
    }
}

impl std::error::Error for CompileError {}
