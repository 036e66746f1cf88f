use crate::jvm::class_file::{ClassConstantIndex, Deserialize, Serialize};
use crate::jvm::Error;
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Entry in the exception table of a method body
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of exception handler range (inclusive)
    pub start_pc: u16,

    /// End of exception handler range (exclusive)
    pub end_pc: u16,

    /// Start of the exception handler
    pub handler_pc: u16,

    /// Class of exceptions caught, or `ClassConstantIndex::NONE` to catch everything
    pub catch_type: ClassConstantIndex,
}

impl ExceptionHandler {
    pub fn is_catch_all(&self) -> bool {
        self.catch_type == ClassConstantIndex::NONE
    }

    /// Does the protected range cover this code offset?
    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize) <= pc && pc < (self.end_pc as usize)
    }
}

impl Serialize for ExceptionHandler {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        self.catch_type.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for ExceptionHandler {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(ExceptionHandler {
            start_pc: u16::deserialize(reader)?,
            end_pc: u16::deserialize(reader)?,
            handler_pc: u16::deserialize(reader)?,
            catch_type: ClassConstantIndex::deserialize(reader)?,
        })
    }
}

/// Ordered exception table
///
/// Order matters: when an exception is thrown, the JVM picks the first entry whose range covers
/// the throwing instruction and whose catch type matches. Inner handlers must therefore come
/// before the handlers enclosing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionTable(pub Vec<ExceptionHandler>);

impl ExceptionTable {
    pub fn new() -> ExceptionTable {
        ExceptionTable(vec![])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExceptionHandler> {
        self.0.iter()
    }

    /// Build an entry, checking that the range is non-empty and all offsets fit in `u16`
    fn entry(
        start: usize,
        end: usize,
        handler: usize,
        catch_type: ClassConstantIndex,
    ) -> Result<ExceptionHandler, Error> {
        if start >= end {
            let msg = format!("empty protected range {}..{}", start, end);
            return Err(Error::MalformedExceptionTable(msg));
        }
        let narrow = |pc: usize| {
            u16::try_from(pc).map_err(|_| {
                Error::MalformedExceptionTable(format!("offset {} exceeds 65535", pc))
            })
        };
        Ok(ExceptionHandler {
            start_pc: narrow(start)?,
            end_pc: narrow(end)?,
            handler_pc: narrow(handler)?,
            catch_type,
        })
    }

    /// Append an entry (it has lower priority than every existing entry)
    pub fn add(
        &mut self,
        start: usize,
        end: usize,
        handler: usize,
        catch_type: ClassConstantIndex,
    ) -> Result<(), Error> {
        self.0.push(Self::entry(start, end, handler, catch_type)?);
        Ok(())
    }

    /// Insert an entry at a given priority
    pub fn add_at(
        &mut self,
        index: usize,
        start: usize,
        end: usize,
        handler: usize,
        catch_type: ClassConstantIndex,
    ) -> Result<(), Error> {
        self.0.insert(index, Self::entry(start, end, handler, catch_type)?);
        Ok(())
    }

    /// Entries of `fragment` shifted by `offset`, in order
    fn shifted(fragment: &ExceptionTable, offset: usize) -> Result<Vec<ExceptionHandler>, Error> {
        fragment
            .iter()
            .map(|handler| {
                Self::entry(
                    handler.start_pc as usize + offset,
                    handler.end_pc as usize + offset,
                    handler.handler_pc as usize + offset,
                    handler.catch_type,
                )
            })
            .collect()
    }

    /// Append a fragment whose offsets are relative to `offset`
    pub fn append(&mut self, fragment: &ExceptionTable, offset: usize) -> Result<(), Error> {
        let entries = Self::shifted(fragment, offset)?;
        self.0.extend(entries);
        Ok(())
    }

    /// Prepend a fragment whose offsets are relative to `offset`
    ///
    /// Used for code spliced in front of existing code: handlers inside the new code take
    /// precedence over everything already present.
    pub fn prepend(&mut self, fragment: &ExceptionTable, offset: usize) -> Result<(), Error> {
        let entries = Self::shifted(fragment, offset)?;
        self.0.splice(0..0, entries);
        Ok(())
    }

    /// Move every offset through `relocate`
    ///
    /// On failure the table is left untouched.
    pub fn relocate(
        &mut self,
        relocate: impl Fn(usize) -> Result<usize, Error>,
    ) -> Result<(), Error> {
        let relocated = self
            .iter()
            .map(|handler| {
                Self::entry(
                    relocate(handler.start_pc as usize)?,
                    relocate(handler.end_pc as usize)?,
                    relocate(handler.handler_pc as usize)?,
                    handler.catch_type,
                )
            })
            .collect::<Result<Vec<_>, Error>>()?;
        self.0 = relocated;
        Ok(())
    }

    /// Check every offset lies inside code of length `code_len` on an instruction boundary
    pub fn validate(
        &self,
        code_len: usize,
        is_boundary: impl Fn(usize) -> bool,
    ) -> Result<(), Error> {
        for handler in self.iter() {
            let (start, end, target) = (
                handler.start_pc as usize,
                handler.end_pc as usize,
                handler.handler_pc as usize,
            );
            let end_ok = end == code_len || (end < code_len && is_boundary(end));
            if start >= end
                || !is_boundary(start)
                || !end_ok
                || target >= code_len
                || !is_boundary(target)
            {
                let msg = format!("entry {:?} does not fit code of length {}", handler, code_len);
                return Err(Error::MalformedExceptionTable(msg));
            }
        }
        Ok(())
    }
}

impl Serialize for ExceptionTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for ExceptionTable {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Vec::deserialize(reader).map(ExceptionTable)
    }
}
