use crate::jvm::class_file::{Constant, ConstantIndex, ConstantPoolOverflow};
use std::fmt;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    ConstantPoolOverflow {
        constant: Constant,
        offset: u16,
    },

    /// File does not start with `0xCAFEBABE`
    NotAClassFile([u8; 4]),
    UnknownConstantTag {
        index: u16,
        tag: u8,
    },

    /// Index is out of the constant pool or points into the second half of a `long`/`double`
    MissingConstant(ConstantIndex),

    /// Constant exists but has the wrong kind
    UnexpectedConstant {
        index: ConstantIndex,
        expected: &'static str,
    },
    BadDescriptor(String),

    /// A known attribute has contents that don't match its layout
    MalformedAttribute(&'static str),

    UnknownOpcode {
        offset: usize,
        opcode: u8,
    },
    TruncatedInstruction(usize),
    MalformedSwitch(usize),

    /// Offset which should be the start of an instruction (or the end of the code) isn't
    InvalidInstructionBoundary(usize),

    /// Method code would exceed 65535 bytes
    MethodCodeOverflow(usize),
    MethodCodeMaxStackOverflow(usize),
    MethodCodeMaxLocalsOverflow(usize),

    MalformedExceptionTable(String),
}

impl From<ConstantPoolOverflow> for Error {
    fn from(overflow: ConstantPoolOverflow) -> Error {
        Error::ConstantPoolOverflow {
            constant: overflow.constant,
            offset: overflow.offset,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ConstantPoolOverflow { constant, offset } => {
                write!(f, "constant pool is full at #{} (adding {:?})", offset, constant)
            }
            Error::NotAClassFile(magic) => write!(f, "bad class file magic {:02x?}", magic),
            Error::UnknownConstantTag { index, tag } => {
                write!(f, "unknown constant tag {} at #{}", tag, index)
            }
            Error::MissingConstant(index) => write!(f, "no constant at #{}", index.0),
            Error::UnexpectedConstant { index, expected } => {
                write!(f, "constant #{} is not a {}", index.0, expected)
            }
            Error::BadDescriptor(desc) => write!(f, "malformed descriptor '{}'", desc),
            Error::MalformedAttribute(name) => write!(f, "malformed {} attribute", name),
            Error::UnknownOpcode { offset, opcode } => {
                write!(f, "unknown opcode 0x{:02x} at {}", opcode, offset)
            }
            Error::TruncatedInstruction(offset) => {
                write!(f, "instruction at {} runs past the end of the code", offset)
            }
            Error::MalformedSwitch(offset) => write!(f, "malformed switch at {}", offset),
            Error::InvalidInstructionBoundary(offset) => {
                write!(f, "{} is not an instruction boundary", offset)
            }
            Error::MethodCodeOverflow(len) => {
                write!(f, "method code of {} bytes exceeds 65535 bytes", len)
            }
            Error::MethodCodeMaxStackOverflow(depth) => {
                write!(f, "operand stack depth {} exceeds 65535", depth)
            }
            Error::MethodCodeMaxLocalsOverflow(locals) => {
                write!(f, "{} local variable slots exceeds 65535", locals)
            }
            Error::MalformedExceptionTable(reason) => {
                write!(f, "malformed exception table: {}", reason)
            }
        }
    }
}

impl std::error::Error for Error {}
