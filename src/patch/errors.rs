use crate::jvm;
use crate::jvm::class_file::{ConstantPoolOverflow, Version};
use crate::snippet::CompileError;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Snippet did not compile in the scope of the method
    Compilation(CompileError),

    /// Method body could not be kept consistent (or was not well-formed to begin with)
    BadBytecode(jvm::Error),

    /// Class was already written out and must be defrosted before more edits
    Frozen(String),

    /// Method has no `Code` attribute (`abstract` or `native`)
    MissingCode(String),

    MethodNotFound {
        name: String,
        descriptor: Option<String>,
    },

    /// Edited code would need `StackMapTable` frames, which aren't generated
    UnsupportedVersion(Version),

    BadTypeName(String),

    /// Constructor never calls `super()` or `this()`
    MissingSuperCall,
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Error {
        Error::Compilation(err)
    }
}

impl From<jvm::Error> for Error {
    fn from(err: jvm::Error) -> Error {
        Error::BadBytecode(err)
    }
}

impl From<ConstantPoolOverflow> for Error {
    fn from(err: ConstantPoolOverflow) -> Error {
        Error::BadBytecode(jvm::Error::from(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compilation(err) => write!(f, "cannot compile snippet: {}", err),
            Error::BadBytecode(err) => write!(f, "bad bytecode: {}", err),
            Error::Frozen(class) => write!(f, "class '{}' is frozen", class),
            Error::MissingCode(method) => write!(f, "method '{}' has no body", method),
            Error::MethodNotFound {
                name,
                descriptor: Some(descriptor),
            } => write!(f, "no method '{}{}'", name, descriptor),
            Error::MethodNotFound {
                name,
                descriptor: None,
            } => write!(f, "no unique method named '{}'", name),
            Error::UnsupportedVersion(version) => write!(
                f,
                "class file version {}.{} requires stack map frames for branching code",
                version.major_version, version.minor_version
            ),
            Error::BadTypeName(name) => write!(f, "'{}' is not a valid class name", name),
            Error::MissingSuperCall => write!(f, "constructor does not call super() or this()"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Compilation(err) => Some(err),
            Error::BadBytecode(err) => Some(err),
            _ => None,
        }
    }
}
