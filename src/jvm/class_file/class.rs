use crate::jvm::class_file::{
    Attribute, ClassConstantIndex, ConstantPool, Deserialize, Field, Method, Serialize, Version,
};
use crate::jvm::{ClassAccessFlags, Error};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// Representation of the [`class` file format of the JVM][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,
    pub super_class: ClassConstantIndex,
    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Parse a class file from its bytes
    pub fn parse(bytes: &[u8]) -> Result<ClassFile, Error> {
        let mut reader = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut magic).map_err(Error::IoError)?;
        if magic != ClassFile::MAGIC {
            return Err(Error::NotAClassFile(magic));
        }

        let class = ClassFile::deserialize_body(&mut reader).map_err(Error::IoError)?;
        if reader.position() as usize != bytes.len() {
            let msg = "trailing bytes after the class file";
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                msg,
            )));
        }

        // Catch dangling class references early, rather than when first editing
        class.constants.class_name(class.this_class)?;
        log::debug!(
            "Parsed class '{}' ({} methods, {} constants)",
            class.name()?,
            class.methods.len(),
            class.constants.offset_len()
        );
        Ok(class)
    }

    /// Read and parse a class file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClassFile, Error> {
        let bytes = fs::read(path).map_err(Error::IoError)?;
        ClassFile::parse(&bytes)
    }

    fn deserialize_body<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<ClassFile> {
        Ok(ClassFile {
            version: Version::deserialize(reader)?,
            constants: ConstantPool::deserialize(reader)?,
            access_flags: ClassAccessFlags::deserialize(reader)?,
            this_class: ClassConstantIndex::deserialize(reader)?,
            super_class: ClassConstantIndex::deserialize(reader)?,
            interfaces: Vec::deserialize(reader)?,
            fields: Vec::deserialize(reader)?,
            methods: Vec::deserialize(reader)?,
            attributes: Vec::deserialize(reader)?,
        })
    }

    /// Internal name of the class (eg. `java/lang/String`)
    pub fn name(&self) -> Result<&str, Error> {
        self.constants.class_name(self.this_class)
    }

    /// Find a method by name and (optionally) descriptor
    ///
    /// When the descriptor is omitted, the name must be unambiguous.
    pub fn find_method(&self, name: &str, descriptor: Option<&str>) -> Option<usize> {
        let mut candidates = self.methods.iter().enumerate().filter(|(_, method)| {
            method.name(&self.constants).ok() == Some(name)
                && descriptor.map_or(true, |desc| {
                    method.descriptor_str(&self.constants).ok() == Some(desc)
                })
        });
        match (candidates.next(), candidates.next()) {
            (Some((idx, _)), None) => Some(idx),
            _ => None,
        }
    }

    /// Encode the class file into bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        self.serialize(&mut bytes).map_err(Error::IoError)?;
        Ok(bytes)
    }

    /// Save the class file to disk
    pub fn save_to_path<P: AsRef<Path>>(
        &self,
        path: P,
        create_missing_directories: bool,
    ) -> std::io::Result<()> {
        let path = path.as_ref();
        if create_missing_directories {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut class_file = fs::File::create(path)?;
        self.serialize(&mut class_file)
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class.serialize(writer)?;
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}
