use crate::jvm::class_file::{
    read_bytes, Attribute, AttributeLike, ConstantPool, Deserialize, LineNumberTable,
    LocalVariableTable, Serialize, StackMapTable, Utf8ConstantIndex,
};
use crate::jvm::code::{instruction_length, CodeIterator, ExceptionTable};
use crate::jvm::Error;
use byteorder::WriteBytesExt;
use std::io::Cursor;

/// Method body, as stored in the `Code` attribute
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    pub exception_table: ExceptionTable,
    pub attributes: Vec<CodeAttribute>,
}

/// Attributes nested in `Code`
///
/// The ones mentioning code offsets are decoded so that they can be moved along when code is
/// inserted. Their name index is kept so that they are written back exactly as they were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    LineNumbers(Utf8ConstantIndex, LineNumberTable),
    LocalVariables(Utf8ConstantIndex, LocalVariableTable),
    LocalVariableTypes(Utf8ConstantIndex, LocalVariableTable),
    Other(Attribute),
}

const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";

impl Code {
    pub fn new(max_stack: u16, max_locals: u16, bytes: Vec<u8>) -> Code {
        Code {
            max_stack,
            max_locals,
            bytes,
            exception_table: ExceptionTable::new(),
            attributes: vec![],
        }
    }

    /// Decode the info bytes of a `Code` attribute
    pub fn parse(info: &[u8], constants: &ConstantPool) -> Result<Code, Error> {
        let mut reader = Cursor::new(info);
        let code = Code::read(&mut reader, constants)?;
        if reader.position() as usize != info.len() {
            return Err(Error::MalformedAttribute(Code::NAME));
        }
        Ok(code)
    }

    fn read(reader: &mut Cursor<&[u8]>, constants: &ConstantPool) -> Result<Code, Error> {
        let malformed = |_| Error::MalformedAttribute(Code::NAME);
        let max_stack = u16::deserialize(reader).map_err(malformed)?;
        let max_locals = u16::deserialize(reader).map_err(malformed)?;
        let code_length = u32::deserialize(reader).map_err(malformed)?;
        if code_length == 0 || code_length > u16::MAX as u32 {
            return Err(Error::MethodCodeOverflow(code_length as usize));
        }
        let bytes = read_bytes(reader, code_length as usize).map_err(malformed)?;
        let exception_table = ExceptionTable::deserialize(reader).map_err(malformed)?;
        let raw_attributes = Vec::<Attribute>::deserialize(reader).map_err(malformed)?;

        let attributes = raw_attributes
            .into_iter()
            .map(|attribute| CodeAttribute::resolve(attribute, constants))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Code {
            max_stack,
            max_locals,
            bytes,
            exception_table,
            attributes,
        })
    }

    /// Cursor over the instructions, starting at the first one
    pub fn iterator(&mut self) -> CodeIterator<'_> {
        CodeIterator::new(self)
    }

    /// Offsets at which each instruction starts
    pub fn instruction_starts(&self) -> Result<Vec<usize>, Error> {
        let mut starts = vec![];
        let mut pos = 0;
        while pos < self.bytes.len() {
            starts.push(pos);
            pos += instruction_length(&self.bytes, pos)?;
        }
        Ok(starts)
    }

    /// Drop `StackMapTable`, returning whether there was one
    pub fn remove_stack_map(&mut self, constants: &ConstantPool) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|attribute| match attribute {
            CodeAttribute::Other(attr) => !attr.is::<StackMapTable>(constants),
            _ => true,
        });
        before != self.attributes.len()
    }

    /// Move the offsets in the debug attributes through `relocate`
    pub fn relocate_debug_info(
        &mut self,
        relocate: impl Fn(usize) -> Result<usize, Error>,
    ) -> Result<(), Error> {
        let narrow = |pc: usize| u16::try_from(pc).map_err(|_| Error::MethodCodeOverflow(pc));
        for attribute in &mut self.attributes {
            match attribute {
                CodeAttribute::LineNumbers(_, table) => {
                    for line in &mut table.0 {
                        line.start_pc = narrow(relocate(line.start_pc as usize)?)?;
                    }
                }
                CodeAttribute::LocalVariables(_, table)
                | CodeAttribute::LocalVariableTypes(_, table) => {
                    for local in &mut table.0 {
                        let start = local.start_pc as usize;
                        let end = start + local.length as usize;
                        let new_start = relocate(start)?;
                        let new_end = relocate(end)?;
                        local.start_pc = narrow(new_start)?;
                        local.length = narrow(new_end - new_start)?;
                    }
                }
                CodeAttribute::Other(_) => (),
            }
        }
        Ok(())
    }
}

impl CodeAttribute {
    fn resolve(attribute: Attribute, constants: &ConstantPool) -> Result<CodeAttribute, Error> {
        let name_index = attribute.name_index;
        let resolved = match attribute.name(constants)? {
            LineNumberTable::NAME => CodeAttribute::LineNumbers(name_index, attribute.decode()?),
            LocalVariableTable::NAME => {
                CodeAttribute::LocalVariables(name_index, attribute.decode()?)
            }
            LOCAL_VARIABLE_TYPE_TABLE => {
                let table = attribute
                    .decode::<LocalVariableTable>()
                    .map_err(|_| Error::MalformedAttribute(LOCAL_VARIABLE_TYPE_TABLE))?;
                CodeAttribute::LocalVariableTypes(name_index, table)
            }
            _ => CodeAttribute::Other(attribute),
        };
        Ok(resolved)
    }

    fn encode(&self) -> std::io::Result<Attribute> {
        let (name_index, info) = match self {
            CodeAttribute::LineNumbers(name_index, table) => {
                let mut info = vec![];
                table.serialize(&mut info)?;
                (*name_index, info)
            }
            CodeAttribute::LocalVariables(name_index, table)
            | CodeAttribute::LocalVariableTypes(name_index, table) => {
                let mut info = vec![];
                table.serialize(&mut info)?;
                (*name_index, info)
            }
            CodeAttribute::Other(attribute) => return Ok(attribute.clone()),
        };
        Ok(Attribute { name_index, info })
    }
}

impl Serialize for CodeAttribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.encode()?.serialize(writer)
    }
}

impl Serialize for Code {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;
        (self.bytes.len() as u32).serialize(writer)?;
        writer.write_all(&self.bytes)?;
        self.exception_table.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl AttributeLike for Code {
    const NAME: &'static str = "Code";
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::LineNumber;
    use crate::jvm::code::opcodes::*;

    #[test]
    fn parse_resolves_debug_attributes() {
        let mut constants = ConstantPool::new();
        let lines = LineNumberTable(vec![LineNumber {
            start_pc: 1,
            line_number: 3,
        }]);
        let mut code = Code::new(1, 1, vec![ICONST_1, IRETURN]);
        code.attributes.push(CodeAttribute::Other(
            constants.get_attribute(&lines).unwrap(),
        ));

        let mut info = vec![];
        code.serialize(&mut info).unwrap();
        let parsed = Code::parse(&info, &constants).unwrap();
        assert!(matches!(
            &parsed.attributes[0],
            CodeAttribute::LineNumbers(_, table) if *table == lines
        ));

        let mut reencoded = vec![];
        parsed.serialize(&mut reencoded).unwrap();
        assert_eq!(info, reencoded);
    }

    #[test]
    fn parse_rejects_trailing_bytes() {
        let constants = ConstantPool::new();
        let mut info = vec![];
        Code::new(0, 0, vec![RETURN]).serialize(&mut info).unwrap();
        info.push(0);
        assert!(Code::parse(&info, &constants).is_err());
    }

    #[test]
    fn debug_info_relocation() {
        let mut constants = ConstantPool::new();
        let name = constants.get_utf8("LocalVariableTable").unwrap();
        let local_name = constants.get_utf8("x").unwrap();
        let local_desc = constants.get_utf8("I").unwrap();
        let mut code = Code::new(1, 1, vec![ICONST_0, ISTORE_0, RETURN]);
        code.attributes.push(CodeAttribute::LocalVariables(
            name,
            LocalVariableTable(vec![crate::jvm::class_file::LocalVariable {
                start_pc: 2,
                length: 1,
                name_index: local_name,
                descriptor_index: local_desc,
                index: 0,
            }]),
        ));
        code.relocate_debug_info(|pc| Ok(if pc >= 1 { pc + 4 } else { pc }))
            .unwrap();
        match &code.attributes[0] {
            CodeAttribute::LocalVariables(_, table) => {
                assert_eq!(table.0[0].start_pc, 6);
                assert_eq!(table.0[0].length, 1);
            }
            other => panic!("unexpected attribute {:?}", other),
        }
        assert_eq!(code.instruction_starts().unwrap(), vec![0, 1, 2]);
    }
}
