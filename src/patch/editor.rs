use crate::jvm::class_file::ClassFile;
use crate::patch::{Behavior, Error};
use crate::snippet::{Assembler, SnippetCompiler};
use std::path::Path;

/// Editing session over one class file
///
/// Writing the class out (with [`ClassEditor::to_bytes`] or [`ClassEditor::save_to_path`])
/// freezes it: from then on every edit fails with [`Error::Frozen`] until the class is
/// explicitly defrosted.
pub struct ClassEditor<C = Assembler> {
    pub(super) class: ClassFile,
    pub(super) compiler: C,
    frozen: bool,
}

impl ClassEditor<Assembler> {
    /// Parse a class file, using the bundled assembler for snippets
    pub fn parse(bytes: &[u8]) -> Result<ClassEditor, Error> {
        Ok(ClassEditor::from_class_file(ClassFile::parse(bytes)?))
    }

    /// Read and parse a class file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClassEditor, Error> {
        Ok(ClassEditor::from_class_file(ClassFile::load(path)?))
    }

    pub fn from_class_file(class: ClassFile) -> ClassEditor {
        ClassEditor {
            class,
            compiler: Assembler,
            frozen: false,
        }
    }
}

impl<C: SnippetCompiler> ClassEditor<C> {
    /// Switch to a different snippet compiler
    pub fn with_compiler<D: SnippetCompiler>(self, compiler: D) -> ClassEditor<D> {
        ClassEditor {
            class: self.class,
            compiler,
            frozen: self.frozen,
        }
    }

    pub fn class_file(&self) -> &ClassFile {
        &self.class
    }

    pub fn into_class_file(self) -> ClassFile {
        self.class
    }

    pub fn class_name(&self) -> Result<&str, Error> {
        Ok(self.class.name()?)
    }

    /// Names and descriptors of all methods and constructors, in declaration order
    pub fn methods(&self) -> Result<Vec<(String, String)>, Error> {
        self.class
            .methods
            .iter()
            .map(|method| {
                let name = method.name(&self.class.constants)?;
                let descriptor = method.descriptor_str(&self.class.constants)?;
                Ok((name.to_owned(), descriptor.to_owned()))
            })
            .collect()
    }

    /// Look up a method by name
    ///
    /// Without a descriptor, the name has to identify a single method.
    pub fn method(
        &mut self,
        name: &str,
        descriptor: Option<&str>,
    ) -> Result<Behavior<'_, C>, Error> {
        match self.class.find_method(name, descriptor) {
            Some(index) => Ok(Behavior::new(self, index)),
            None => Err(Error::MethodNotFound {
                name: name.to_owned(),
                descriptor: descriptor.map(str::to_owned),
            }),
        }
    }

    /// Look up a constructor
    pub fn constructor(&mut self, descriptor: Option<&str>) -> Result<Behavior<'_, C>, Error> {
        self.method("<init>", descriptor)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Allow edits again after the class has been written out
    pub fn defrost(&mut self) {
        self.frozen = false;
    }

    /// Fail if the class can no longer be edited
    pub(super) fn check_modify(&self) -> Result<(), Error> {
        if self.frozen {
            let name = self.class.name().unwrap_or("<unnamed>");
            return Err(Error::Frozen(name.to_owned()));
        }
        Ok(())
    }

    /// Serialize the class, freezing it
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, Error> {
        self.freeze();
        Ok(self.class.to_bytes()?)
    }

    /// Write the class to disk (creating missing directories), freezing it
    pub fn save_to_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.freeze();
        log::info!("Writing '{}' to {}", self.class.name()?, path.as_ref().display());
        self.class
            .save_to_path(path, true)
            .map_err(crate::jvm::Error::IoError)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ConstantPool, Version};
    use crate::jvm::ClassAccessFlags;

    fn empty_class() -> ClassFile {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class("Empty").unwrap();
        let super_class = constants.get_class("java/lang/Object").unwrap();
        ClassFile {
            version: Version::JAVA6,
            constants,
            access_flags: ClassAccessFlags::PUBLIC,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn writing_out_freezes() {
        let mut editor = ClassEditor::from_class_file(empty_class());
        assert!(!editor.is_frozen());

        let bytes = editor.to_bytes().unwrap();
        assert!(editor.is_frozen());
        assert!(matches!(editor.check_modify(), Err(Error::Frozen(name)) if name == "Empty"));

        editor.defrost();
        assert!(editor.check_modify().is_ok());
        assert_eq!(ClassEditor::parse(&bytes).unwrap().class_name().unwrap(), "Empty");
    }

    #[test]
    fn missing_methods() {
        let mut editor = ClassEditor::from_class_file(empty_class());
        assert!(editor.methods().unwrap().is_empty());
        assert!(matches!(
            editor.constructor(None),
            Err(Error::MethodNotFound { name, descriptor: None }) if name == "<init>"
        ));
    }
}
