use crate::jvm::code::opcodes::*;
use crate::util::Width;
use std::io::{Error, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Utility trait for converting descriptors to and from string representations
pub trait RenderDescriptor {
    /// Turn the descriptor into a string
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    /// Write the descriptor to a string
    fn render_to(&self, write_to: &mut String);
}

pub trait ParseDescriptor: Sized {
    /// Parse a descriptor from a string
    fn parse(source: &str) -> Result<Self> {
        let mut chars = source.chars().peekable();
        let ret = Self::parse_from(&mut chars)?;
        match chars.next() {
            None => Ok(ret),
            Some(c) => {
                let msg = format!("Unexpected leftover input '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
        }
    }

    /// Read the descriptor from a character buffer
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        let c = match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        };
        write_to.push(c);
    }
}

impl ParseDescriptor for BaseType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        let typ = match source.next() {
            Some('B') => BaseType::Byte,
            Some('C') => BaseType::Char,
            Some('D') => BaseType::Double,
            Some('F') => BaseType::Float,
            Some('I') => BaseType::Int,
            Some('J') => BaseType::Long,
            Some('S') => BaseType::Short,
            Some('Z') => BaseType::Boolean,
            Some(c) => {
                let msg = format!("Invalid base type character '{}'", c);
                return Err(Error::new(ErrorKind::InvalidInput, msg));
            }
            None => {
                let msg = "Missing base type character";
                return Err(Error::new(ErrorKind::UnexpectedEof, msg));
            }
        };
        Ok(typ)
    }
}

/// Reference type
///
/// Class names are kept in internal form (`java/lang/String`).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RefType {
    Object(String),
    Array(Box<FieldType>),
}

impl RefType {
    /// Name usable in a `CONSTANT_Class_info`: the internal name for objects and the descriptor
    /// for arrays
    pub fn class_name(&self) -> String {
        match self {
            RefType::Object(name) => name.clone(),
            RefType::Array(_) => self.render(),
        }
    }
}

impl RenderDescriptor for RefType {
    fn render_to(&self, write_to: &mut String) {
        match self {
            RefType::Object(name) => {
                write_to.push('L');
                write_to.push_str(name);
                write_to.push(';');
            }
            RefType::Array(element) => {
                write_to.push('[');
                element.render_to(write_to);
            }
        }
    }
}

impl ParseDescriptor for RefType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.next() {
            Some('L') => {
                let mut class_name = String::new();
                loop {
                    match source.next() {
                        Some(';') if !class_name.is_empty() => {
                            return Ok(RefType::Object(class_name));
                        }
                        Some(';' | '.' | '[') | None => {
                            let msg = format!("Malformed class name in 'L{}'", class_name);
                            return Err(Error::new(ErrorKind::InvalidInput, msg));
                        }
                        Some(c) => class_name.push(c),
                    }
                }
            }
            Some('[') => Ok(RefType::Array(Box::new(FieldType::parse_from(source)?))),
            Some(c) => {
                let msg = format!("Invalid reference type character '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
            None => {
                let msg = "Missing reference type";
                Err(Error::new(ErrorKind::UnexpectedEof, msg))
            }
        }
    }
}

/// Type of a class, instance, or local variable
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType {
    Base(BaseType),
    Ref(RefType),
}

impl Width for FieldType {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.width(),
            FieldType::Ref(_) => 1,
        }
    }
}

impl FieldType {
    pub fn object(class_name: impl Into<String>) -> FieldType {
        FieldType::Ref(RefType::Object(class_name.into()))
    }

    pub const fn int() -> FieldType {
        FieldType::Base(BaseType::Int)
    }

    pub const fn long() -> FieldType {
        FieldType::Base(BaseType::Long)
    }

    pub const fn float() -> FieldType {
        FieldType::Base(BaseType::Float)
    }

    pub const fn double() -> FieldType {
        FieldType::Base(BaseType::Double)
    }

    /// How values of this type are moved between locals and the operand stack
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldType::Base(BaseType::Long) => ValueKind::Long,
            FieldType::Base(BaseType::Float) => ValueKind::Float,
            FieldType::Base(BaseType::Double) => ValueKind::Double,
            FieldType::Base(_) => ValueKind::Int,
            FieldType::Ref(_) => ValueKind::Reference,
        }
    }
}

impl RenderDescriptor for FieldType {
    fn render_to(&self, write_to: &mut String) {
        match self {
            FieldType::Base(base_type) => base_type.render_to(write_to),
            FieldType::Ref(reference_type) => reference_type.render_to(write_to),
        }
    }
}

impl ParseDescriptor for FieldType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.peek().copied() {
            None => Err(Error::new(ErrorKind::UnexpectedEof, "Missing field type")),
            Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => {
                BaseType::parse_from(source).map(FieldType::Base)
            }
            Some('L' | '[') => RefType::parse_from(source).map(FieldType::Ref),
            Some(c) => {
                let msg = format!("Invalid field type character '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
        }
    }
}

/// Computational category of a value, which decides the typed opcode family used for it
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ValueKind {
    /// Number of local variable slots (and operand stack entries) a value occupies
    pub fn slots(self) -> u16 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }

    /// Base of the `xload` family (`iload` through `aload`)
    pub fn load_opcode(self) -> u8 {
        ILOAD + self.family_offset()
    }

    /// Base of the `xstore` family (`istore` through `astore`)
    pub fn store_opcode(self) -> u8 {
        ISTORE + self.family_offset()
    }

    /// Matching `xreturn`
    pub fn return_opcode(self) -> u8 {
        IRETURN + self.family_offset()
    }

    /// Opcode pushing the zero value of this kind (`null` for references)
    pub fn zero_opcode(self) -> u8 {
        match self {
            ValueKind::Int => ICONST_0,
            ValueKind::Long => LCONST_0,
            ValueKind::Float => FCONST_0,
            ValueKind::Double => DCONST_0,
            ValueKind::Reference => ACONST_NULL,
        }
    }

    fn family_offset(self) -> u8 {
        match self {
            ValueKind::Int => 0,
            ValueKind::Long => 1,
            ValueKind::Float => 2,
            ValueKind::Double => 3,
            ValueKind::Reference => 4,
        }
    }
}

/// Signature of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: Option<FieldType>, // `None` is for `void` (ie. no return)
}

impl MethodDescriptor {
    /// Total length of parameters (not the same as the length of the vector),
    /// which must be 255 or less for it to be valid
    pub fn parameter_length(&self, has_this_param: bool) -> usize {
        let this_len = if has_this_param { 1 } else { 0 };
        this_len + self.parameters.iter().map(Width::width).sum::<usize>()
    }

    /// Net effect on the operand stack of invoking a method with this descriptor
    ///
    /// `has_receiver` should be set for all invocations except `invokestatic` and
    /// `invokedynamic`.
    pub fn stack_effect(&self, has_receiver: bool) -> i32 {
        let popped = self.parameter_length(has_receiver) as i32;
        let pushed = self.return_type.as_ref().map_or(0, |typ| typ.width() as i32);
        pushed - popped
    }
}

impl RenderDescriptor for MethodDescriptor {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        match &self.return_type {
            None => write_to.push('V'),
            Some(typ) => typ.render_to(write_to),
        };
    }
}

impl ParseDescriptor for MethodDescriptor {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        if source.next() != Some('(') {
            let msg = "Expected '(' for method";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }

        let mut parameters = vec![];
        loop {
            match source.peek().copied() {
                Some(')') => break,
                None => {
                    let msg = "Missing ')' for method";
                    return Err(Error::new(ErrorKind::UnexpectedEof, msg));
                }
                Some(_) => parameters.push(FieldType::parse_from(source)?),
            }
        }
        source.next();

        let return_type = if source.next_if_eq(&'V').is_some() {
            None
        } else {
            Some(FieldType::parse_from(source)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

/// Convert a user-facing type name into a field type
///
/// Accepts primitive keywords (`int`, `long`, ...), dotted or slashed class names
/// (`java.lang.String`, `java/lang/String`), trailing `[]` for arrays, and raw descriptors as long
/// as they end in `;` or start with `[`.
pub fn parse_type_name(name: &str) -> Result<FieldType> {
    let name = name.trim();
    if name.starts_with('[') || (name.starts_with('L') && name.ends_with(';')) {
        return FieldType::parse(name);
    }
    if let Some(element) = name.strip_suffix("[]") {
        let element = parse_type_name(element)?;
        return Ok(FieldType::Ref(RefType::Array(Box::new(element))));
    }
    let typ = match name {
        "boolean" => FieldType::Base(BaseType::Boolean),
        "byte" => FieldType::Base(BaseType::Byte),
        "char" => FieldType::Base(BaseType::Char),
        "short" => FieldType::Base(BaseType::Short),
        "int" => FieldType::int(),
        "long" => FieldType::long(),
        "float" => FieldType::float(),
        "double" => FieldType::double(),
        "" => {
            return Err(Error::new(ErrorKind::InvalidInput, "Empty type name"));
        }
        class_name => {
            if class_name.contains(|c: char| c == ';' || c == '[' || c.is_whitespace()) {
                let msg = format!("Invalid class name '{}'", class_name);
                return Err(Error::new(ErrorKind::InvalidInput, msg));
            }
            FieldType::object(class_name.replace('.', "/"))
        }
    };
    Ok(typ)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_descriptors() {
        let desc = MethodDescriptor::parse("(IJ[Ljava/lang/String;)D").unwrap();
        assert_eq!(
            desc.parameters,
            vec![
                FieldType::int(),
                FieldType::long(),
                FieldType::Ref(RefType::Array(Box::new(FieldType::object(
                    "java/lang/String"
                )))),
            ]
        );
        assert_eq!(desc.return_type, Some(FieldType::double()));
        assert_eq!(desc.parameter_length(true), 5);
        assert_eq!(desc.stack_effect(true), -3);
        assert_eq!(desc.render(), "(IJ[Ljava/lang/String;)D");

        let void = MethodDescriptor::parse("()V").unwrap();
        assert_eq!(void.return_type, None);
        assert_eq!(void.stack_effect(false), 0);
    }

    #[test]
    fn malformed_descriptors() {
        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("Q").is_err());
    }

    #[test]
    fn user_facing_type_names() {
        assert_eq!(
            parse_type_name("java.lang.ArithmeticException").unwrap(),
            FieldType::object("java/lang/ArithmeticException")
        );
        assert_eq!(parse_type_name("long").unwrap(), FieldType::long());
        assert_eq!(
            parse_type_name("int[]").unwrap().render(),
            String::from("[I")
        );
        assert_eq!(
            parse_type_name("Ljava/lang/Object;").unwrap(),
            FieldType::object("java/lang/Object")
        );
        assert!(parse_type_name("").is_err());
    }

    #[test]
    fn typed_opcodes() {
        assert_eq!(FieldType::int().kind().load_opcode(), ILOAD);
        assert_eq!(FieldType::double().kind().store_opcode(), DSTORE);
        assert_eq!(FieldType::object("A").kind().return_opcode(), ARETURN);
        assert_eq!(FieldType::long().kind().zero_opcode(), LCONST_0);
        assert_eq!(FieldType::long().kind().slots(), 2);
    }
}
