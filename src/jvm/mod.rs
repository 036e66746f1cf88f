//! Read, edit, and write JVM class files
//!
//! Parsing keeps everything that isn't needed for editing method bodies in its raw form, so a
//! class which is loaded and then written back without modifications comes out byte-identical.
//!
//! ```
//! use classpatch::jvm::class_file::{ClassFile, Serialize};
//! # fn reload(bytes: &[u8]) -> Result<Vec<u8>, classpatch::jvm::Error> {
//! let class = ClassFile::parse(bytes)?;
//! let mut out = vec![];
//! class.serialize(&mut out).map_err(classpatch::jvm::Error::IoError)?;
//! # Ok(out)
//! # }
//! ```

mod access_flags;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;

pub use access_flags::*;
pub use descriptors::*;
pub use errors::*;
