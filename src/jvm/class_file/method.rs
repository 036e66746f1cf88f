use crate::jvm::class_file::{
    find_attribute, Attribute, AttributeLike, ConstantPool, Deserialize, Serialize,
    Utf8ConstantIndex,
};
use crate::jvm::code::Code;
use crate::jvm::{Error, MethodAccessFlags, MethodDescriptor, ParseDescriptor};
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Method declared by a class or interface
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.6
#[derive(Debug, Clone)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name_index: Utf8ConstantIndex,
    pub descriptor_index: Utf8ConstantIndex,
    pub attributes: Vec<Attribute>,
}

impl Method {
    pub fn name<'a>(&self, constants: &'a ConstantPool) -> Result<&'a str, Error> {
        constants.utf8(self.name_index)
    }

    /// Raw method descriptor (eg. `(I)V`)
    pub fn descriptor_str<'a>(&self, constants: &'a ConstantPool) -> Result<&'a str, Error> {
        constants.utf8(self.descriptor_index)
    }

    pub fn descriptor(&self, constants: &ConstantPool) -> Result<MethodDescriptor, Error> {
        let descriptor = self.descriptor_str(constants)?;
        MethodDescriptor::parse(descriptor).map_err(|_| Error::BadDescriptor(descriptor.to_owned()))
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    /// Decode the `Code` attribute, if the method has one
    pub fn code(&self, constants: &ConstantPool) -> Result<Option<Code>, Error> {
        match find_attribute::<Code>(&self.attributes, constants) {
            None => Ok(None),
            Some(idx) => Code::parse(&self.attributes[idx].info, constants).map(Some),
        }
    }

    /// Replace (or add) the `Code` attribute
    pub fn set_code(&mut self, code: &Code, constants: &mut ConstantPool) -> Result<(), Error> {
        let attribute = constants.get_attribute(code)?;
        self.set_attribute::<Code>(attribute, constants);
        Ok(())
    }

    /// Replace the first attribute named `A::NAME`, or append if there is none
    pub fn set_attribute<A: AttributeLike>(
        &mut self,
        attribute: Attribute,
        constants: &ConstantPool,
    ) {
        match find_attribute::<A>(&self.attributes, constants) {
            Some(idx) => self.attributes[idx] = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Drop every attribute named `A::NAME`
    pub fn remove_attribute<A: AttributeLike>(&mut self, constants: &ConstantPool) {
        self.attributes.retain(|attr| !attr.is::<A>(constants));
    }
}

impl Serialize for Method {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.access_flags.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for Method {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Method {
            access_flags: MethodAccessFlags::deserialize(reader)?,
            name_index: Utf8ConstantIndex::deserialize(reader)?,
            descriptor_index: Utf8ConstantIndex::deserialize(reader)?,
            attributes: Vec::deserialize(reader)?,
        })
    }
}
