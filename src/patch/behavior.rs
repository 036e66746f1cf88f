//! Editing the body of one method or constructor
//!
//! ### Inserting after the body
//!
//! Code that has to run before every `return` is compiled once into a subroutine appended to the
//! method, and every return is preceded by a `jsr` to it:
//!
//! ```text,ignore,no_run
//!        ...                        ; original body, with each `xreturn` turned into
//!        jsr SUB                    ;
//!        xreturn                    ;
//!
//!     H: astore exc                 ; only when running as `finally`: the handler catches
//!        <zero of return type>      ; everything thrown in the original body, runs the
//!        jsr SUB                    ; subroutine, then rethrows
//!        aload exc
//!        athrow
//!
//!   SUB: astore retaddr             ; return address goes just above the method's locals
//!        <store result into $_>     ; `aconst_null` for `void` methods
//!        <snippet>
//!        <load $_>                  ; left on the stack for the `xreturn`
//!        ret retaddr
//! ```
//!
//! In constructors, the `finally` handler only covers the code after the `super()` or `this()`
//! call.
//!
//! Returns are rewritten one at a time with a fresh scan, since each rewrite shifts the
//! subroutine. Only returns before the subroutine are rewritten, so returns in the snippet
//! itself are left alone. A `jsr_w` is used when the subroutine is too far for `jsr`.
//!
//! ### Atomicity
//!
//! Every edit works on a copy of the method body, which replaces the original only if the whole
//! edit succeeded. Constants registered while compiling a failed snippet stay in the pool.
//!
//! ### Stack maps
//!
//! `StackMapTable` frames are not recomputed. They are dropped from edited methods, which is fine
//! up to class file version 50. For later versions, edits producing code that would need frames
//! (any branch, `jsr`, or exception handler) are rejected.

use crate::jvm;
use crate::jvm::class_file::{
    find_attribute, Attribute, ClassConstantIndex, Constant, ConstantIndex, ConstantPool,
    Exceptions, Method, Version,
};
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{instruction_length, Bytecode, Code};
use crate::jvm::{
    parse_type_name, FieldType, MethodAccessFlags, MethodDescriptor, RefType, ValueKind,
};
use crate::patch::{ClassEditor, Error};
use crate::snippet::{Scope, SnippetCompiler};

/// Handle on one method or constructor of a class being edited
pub struct Behavior<'e, C> {
    editor: &'e mut ClassEditor<C>,
    index: usize,
}

impl<'e, C: SnippetCompiler> Behavior<'e, C> {
    pub(super) fn new(editor: &'e mut ClassEditor<C>, index: usize) -> Behavior<'e, C> {
        Behavior { editor, index }
    }

    fn method(&self) -> &Method {
        &self.editor.class.methods[self.index]
    }

    fn constants(&self) -> &ConstantPool {
        &self.editor.class.constants
    }

    pub fn name(&self) -> Result<&str, Error> {
        Ok(self.method().name(self.constants())?)
    }

    /// Method descriptor (eg. `(ILjava/lang/String;)V`)
    pub fn signature(&self) -> Result<&str, Error> {
        Ok(self.method().descriptor_str(self.constants())?)
    }

    pub fn descriptor(&self) -> Result<MethodDescriptor, Error> {
        Ok(self.method().descriptor(self.constants())?)
    }

    pub fn parameter_types(&self) -> Result<Vec<FieldType>, Error> {
        Ok(self.descriptor()?.parameters)
    }

    /// Return type (`None` for `void`)
    pub fn return_type(&self) -> Result<Option<FieldType>, Error> {
        Ok(self.descriptor()?.return_type)
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self.name(), Ok("<init>"))
    }

    pub fn is_static(&self) -> bool {
        self.method().is_static()
    }

    pub fn modifiers(&self) -> MethodAccessFlags {
        self.method().access_flags
    }

    pub fn set_modifiers(&mut self, modifiers: MethodAccessFlags) -> Result<(), Error> {
        self.editor.check_modify()?;
        self.editor.class.methods[self.index].access_flags = modifiers;
        Ok(())
    }

    /// Checked exceptions declared by the method (`None` if there is no `Exceptions` attribute)
    pub fn exception_types(&self) -> Result<Option<Vec<String>>, Error> {
        let constants = self.constants();
        let attribute = match find_attribute::<Exceptions>(&self.method().attributes, constants) {
            None => return Ok(None),
            Some(idx) => &self.method().attributes[idx],
        };
        let exceptions = attribute.decode::<Exceptions>()?;
        let names = exceptions
            .0
            .iter()
            .map(|class| Ok(constants.class_name(*class)?.to_owned()))
            .collect::<Result<Vec<String>, Error>>()?;
        Ok(Some(names))
    }

    /// Replace the declared checked exceptions, or drop the declaration with `None`
    pub fn set_exception_types(&mut self, exceptions: Option<&[&str]>) -> Result<(), Error> {
        self.editor.check_modify()?;
        let class = &mut self.editor.class;
        let method = &mut class.methods[self.index];
        match exceptions {
            None => method.remove_attribute::<Exceptions>(&class.constants),
            Some(names) => {
                let classes = names
                    .iter()
                    .map(|name| Ok(class.constants.get_class(class_name(name)?)?))
                    .collect::<Result<Vec<ClassConstantIndex>, Error>>()?;
                let attribute = class.constants.get_attribute(&Exceptions(classes))?;
                method.set_attribute::<Exceptions>(attribute, &class.constants);
            }
        }
        Ok(())
    }

    /// Contents of the first method attribute with this name
    pub fn attribute(&self, name: &str) -> Option<&[u8]> {
        let constants = self.constants();
        self.method()
            .attributes
            .iter()
            .find(|attribute| attribute.name(constants).ok() == Some(name))
            .map(|attribute| attribute.info.as_slice())
    }

    /// Add a method attribute, replacing any existing one with the same name
    pub fn set_attribute(&mut self, name: &str, data: Vec<u8>) -> Result<(), Error> {
        self.editor.check_modify()?;
        let class = &mut self.editor.class;
        let name_index = class.constants.get_utf8(name)?;
        let method = &mut class.methods[self.index];
        let attribute = Attribute {
            name_index,
            info: data,
        };
        match method
            .attributes
            .iter()
            .position(|attr| attr.name_index == name_index)
        {
            Some(idx) => method.attributes[idx] = attribute,
            None => method.attributes.push(attribute),
        }
        Ok(())
    }

    /// Decoded method body, if there is one
    pub fn code(&self) -> Result<Option<Code>, Error> {
        Ok(self.method().code(self.constants())?)
    }

    /// Insert a snippet at the start of the body
    ///
    /// Jumps back to the first instruction (eg. loops) skip the inserted code, so it runs once.
    /// Existing exception handlers do not cover it. In a constructor it runs before the `super()`
    /// call, while `$0` is still uninitialized.
    pub fn insert_before(&mut self, src: &str) -> Result<(), Error> {
        let descriptor = self.descriptor()?;
        let is_static = self.is_static();
        let this_class = self.editor.class_name()?.to_owned();
        self.patch_code(|code, constants, compiler| {
            let mut bytecode = Bytecode::new(0, 0);
            let mut scope = Scope::new();
            scope.record_params(&this_class, &descriptor.parameters, is_static, &mut bytecode);
            compiler.compile(src, &mut scope, &mut bytecode, constants)?;

            let (max_stack, max_locals) = bytecode.limits()?;
            code.max_stack = code.max_stack.max(max_stack);
            code.max_locals = code.max_locals.max(max_locals);

            let mut iterator = code.iterator();
            let pos = iterator.insert_ex(0, bytecode.bytes())?;
            iterator.insert_exception_table(bytecode.exception_table(), pos)?;
            Ok(())
        })
    }

    /// Insert a snippet to run before every `return`
    ///
    /// With `as_finally`, the snippet also runs when the body throws, before the exception
    /// propagates. The snippet can read and assign the value being returned through `$_`.
    pub fn insert_after(&mut self, src: &str, as_finally: bool) -> Result<(), Error> {
        let descriptor = self.descriptor()?;
        let is_static = self.is_static();
        let is_constructor = self.is_constructor();
        let this_class = self.editor.class_name()?.to_owned();
        let name = self.name()?.to_owned();
        self.patch_code(|code, constants, compiler| {
            let start = body_start(code, constants, is_constructor)?;
            let return_address = code.max_locals as usize;
            let mut bytecode = Bytecode::new(0, code.max_locals);
            bytecode.reserve_locals(return_address + 1);

            let mut scope = Scope::new();
            scope.record_params(&this_class, &descriptor.parameters, is_static, &mut bytecode);
            let return_type = descriptor.return_type.as_ref();
            let result = scope.record_return_type(return_type, &mut bytecode);

            let handler_len = if as_finally {
                finally_handler(&mut bytecode, return_type)?
            } else {
                0
            };

            // Entered with the return value and the return address on the stack
            bytecode.set_stack_depth(code.max_stack as i32 + 1);
            bytecode.add_store(return_address, ValueKind::Reference)?;
            match return_type {
                None => {
                    bytecode.add_opcode(ACONST_NULL);
                    bytecode.add_store(result, ValueKind::Reference)?;
                    compiler.compile(src, &mut scope, &mut bytecode, constants)?;
                }
                Some(typ) => {
                    bytecode.add_store(result, typ.kind())?;
                    compiler.compile(src, &mut scope, &mut bytecode, constants)?;
                    bytecode.add_load(result, typ.kind())?;
                }
            }
            bytecode.add_ret(return_address)?;

            let (max_stack, max_locals) = bytecode.limits()?;
            code.max_stack = code.max_stack.max(max_stack);
            code.max_locals = code.max_locals.max(max_locals);

            let mut iterator = code.iterator();
            let block = iterator.append(bytecode.bytes())?;
            iterator.append_exception_table(bytecode.exception_table(), block)?;
            if as_finally {
                code.exception_table
                    .add(start, block, block, ClassConstantIndex::NONE)?;
            }

            let subroutine_len = code.bytes.len() - block - handler_len;
            let rewritten = call_subroutine_before_returns(code, subroutine_len)?;
            log::debug!(
                "Inserted a {} byte subroutine after '{}' ({} returns rewritten{})",
                subroutine_len,
                name,
                rewritten,
                if as_finally { ", as finally" } else { "" }
            );
            Ok(())
        })
    }

    /// Add a catch clause covering the whole body
    ///
    /// The caught exception is bound to `name` in the snippet. The snippet must end by returning
    /// or throwing: falling off its end runs past the end of the method. In a constructor the
    /// clause starts after the `super()` or `this()` call.
    pub fn add_catch(&mut self, src: &str, exception_type: &str, name: &str) -> Result<(), Error> {
        let descriptor = self.descriptor()?;
        let is_static = self.is_static();
        let is_constructor = self.is_constructor();
        let this_class = self.editor.class_name()?.to_owned();
        let exception_class = class_name(exception_type)?;
        let exception = FieldType::object(exception_class.clone());
        self.patch_code(|code, constants, compiler| {
            let start = body_start(code, constants, is_constructor)?;
            let mut bytecode = Bytecode::new(code.max_stack, code.max_locals);
            bytecode.set_stack_depth(1);
            let mut scope = Scope::new();
            scope.record_params(&this_class, &descriptor.parameters, is_static, &mut bytecode);
            let var = scope.record_variable(&exception, name, &mut bytecode);
            bytecode.add_store(var, ValueKind::Reference)?;
            compiler.compile(src, &mut scope, &mut bytecode, constants)?;

            let (max_stack, max_locals) = bytecode.limits()?;
            code.max_stack = code.max_stack.max(max_stack);
            code.max_locals = code.max_locals.max(max_locals);

            let catch_type = constants.get_class(exception_class)?;
            let len = code.bytes.len();
            let pos = code.iterator().append(bytecode.bytes())?;
            code.exception_table.add(start, len, pos, catch_type)?;
            code.exception_table.append(bytecode.exception_table(), pos)?;
            Ok(())
        })
    }

    /// Replace the body with a compiled snippet
    ///
    /// This also works on `abstract` and `native` methods, which stop being either. A `void`
    /// body that can fall off its end gets a `return` appended.
    pub fn set_body(&mut self, src: &str) -> Result<(), Error> {
        self.editor.check_modify()?;
        let descriptor = self.descriptor()?;
        let is_static = self.is_static();
        let this_class = self.editor.class_name()?.to_owned();

        let editor = &mut *self.editor;
        let class = &mut editor.class;
        let mut bytecode = Bytecode::new(0, 0);
        let mut scope = Scope::new();
        scope.record_params(&this_class, &descriptor.parameters, is_static, &mut bytecode);
        editor
            .compiler
            .compile(src, &mut scope, &mut bytecode, &mut class.constants)?;
        if descriptor.return_type.is_none() && falls_through(bytecode.bytes())? {
            bytecode.add_opcode(RETURN);
        }

        let (max_stack, max_locals) = bytecode.limits()?;
        let mut code = Code::new(max_stack, max_locals, bytecode.bytes().to_vec());
        code.exception_table = bytecode.exception_table().clone();
        check_body(&code, class.version)?;

        let method = &mut class.methods[self.index];
        method.set_code(&code, &mut class.constants)?;
        method
            .access_flags
            .remove(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE);
        log::debug!("Replaced a body with {} bytes of code", code.bytes.len());
        Ok(())
    }

    /// Run an edit on a copy of the body, committing the copy if the edit succeeds
    fn patch_code<T>(
        &mut self,
        edit: impl FnOnce(&mut Code, &mut ConstantPool, &C) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.editor.check_modify()?;
        let name = self.name()?.to_owned();

        let editor = &mut *self.editor;
        let class = &mut editor.class;
        let method = &mut class.methods[self.index];
        let mut code = match method.code(&class.constants)? {
            Some(code) => code,
            None => return Err(Error::MissingCode(name)),
        };

        let result = edit(&mut code, &mut class.constants, &editor.compiler)?;
        check_body(&code, class.version)?;
        if code.remove_stack_map(&class.constants) {
            log::debug!("Dropped the stack map frames of '{}'", name);
        }
        method.set_code(&code, &mut class.constants)?;
        Ok(result)
    }
}

/// Internal name of a class, from a dotted or slashed name
fn class_name(name: &str) -> Result<String, Error> {
    match parse_type_name(name) {
        Ok(FieldType::Ref(RefType::Object(class))) => Ok(class),
        _ => Err(Error::BadTypeName(name.to_owned())),
    }
}

/// First offset that handlers added around the body may cover
///
/// That is 0, except in constructors where `this` is uninitialized until the `super()` or
/// `this()` call returns: then it is the instruction after that call.
fn body_start(code: &Code, constants: &ConstantPool, is_constructor: bool) -> Result<usize, Error> {
    if !is_constructor {
        return Ok(0);
    }

    // Objects created by `new` before that call get their own `<init>` calls first
    let mut pending = 0;
    for pos in code.instruction_starts()? {
        match code.bytes[pos] {
            NEW => pending += 1,
            INVOKESPECIAL => {
                let index = u16::from_be_bytes([code.bytes[pos + 1], code.bytes[pos + 2]]);
                if method_name(constants, ConstantIndex(index))? != "<init>" {
                    continue;
                }
                if pending == 0 {
                    return Ok(pos + 3);
                }
                pending -= 1;
            }
            _ => (),
        }
    }
    Err(Error::MissingSuperCall)
}

/// Name of the method referenced by a constant
fn method_name(constants: &ConstantPool, index: ConstantIndex) -> Result<&str, Error> {
    let name_and_type = match constants.get(index)? {
        Constant::MethodRef { name_and_type, .. } => *name_and_type,
        _ => {
            let expected = "method reference";
            return Err(jvm::Error::UnexpectedConstant { index, expected }.into());
        }
    };
    match constants.get(name_and_type.0)? {
        Constant::NameAndType { name, .. } => Ok(constants.utf8(*name)?),
        _ => {
            let (index, expected) = (name_and_type.0, "name and type");
            Err(jvm::Error::UnexpectedConstant { index, expected }.into())
        }
    }
}

/// Emit the catch-all handler used for `finally` semantics, returning its length
///
/// The handler stashes the exception, calls the subroutine (which starts right after the
/// handler) with a dummy return value, and rethrows.
fn finally_handler(bytecode: &mut Bytecode, return_type: Option<&FieldType>) -> Result<usize, Error> {
    let exception = bytecode.allocate_local(1);
    let start = bytecode.current_pc();
    bytecode.set_stack_depth(1);
    bytecode.add_store(exception, ValueKind::Reference)?;
    if let Some(typ) = return_type {
        bytecode.add_zero(typ.kind());
    }
    let jsr = bytecode.current_pc();
    bytecode.add_opcode(JSR);
    bytecode.add_u16(0);
    // Return address is popped by the subroutine
    bytecode.grow_stack(-1);
    bytecode.add_load(exception, ValueKind::Reference)?;
    bytecode.add_opcode(ATHROW);

    let subroutine = bytecode.current_pc();
    bytecode.write_u16(jsr + 1, (subroutine - jsr) as u16);
    Ok(subroutine - start)
}

/// Put a call to the subroutine (the last `subroutine_len` bytes) in front of every return that
/// precedes it, returning how many returns were found
fn call_subroutine_before_returns(code: &mut Code, subroutine_len: usize) -> Result<usize, Error> {
    let mut iterator = code.iterator();
    let mut subroutine = iterator.code_length() - subroutine_len;
    let mut rewritten = 0;

    while let Some(pos) = iterator.next() {
        let pos = pos?;
        if pos >= subroutine {
            break;
        }
        if !is_return(iterator.byte_at(pos)?) {
            continue;
        }

        let mut wide = subroutine - pos > (i16::MAX - 5) as usize;
        let mut call = iterator.insert_gap(pos, if wide { 5 } else { 3 }, false)?;
        subroutine = iterator.code_length() - subroutine_len;
        if !wide && i16::try_from(subroutine - call).is_err() {
            // Widening elsewhere pushed the subroutine out of reach
            call = iterator.insert_gap(call, 2, false)?;
            subroutine = iterator.code_length() - subroutine_len;
            wide = true;
        }

        let offset = subroutine - call;
        if wide {
            iterator.write_byte(call, JSR_W)?;
            iterator.write_i32(call + 1, offset as i32)?;
        } else {
            iterator.write_byte(call, JSR)?;
            iterator.write_i16(call + 1, offset as i16)?;
        }
        rewritten += 1;
    }
    Ok(rewritten)
}

/// Can execution fall off the end of this code?
fn falls_through(code: &[u8]) -> Result<bool, Error> {
    let mut last = None;
    let mut pos = 0;
    while pos < code.len() {
        last = Some(code[pos]);
        pos += instruction_length(code, pos)?;
    }
    Ok(match last {
        None => true,
        Some(opcode) => !matches!(
            opcode,
            GOTO | GOTO_W | ATHROW | RET | TABLESWITCH | LOOKUPSWITCH | IRETURN..=RETURN
        ),
    })
}

/// Sanity checks on an edited body before it replaces the original
fn check_body(code: &Code, version: Version) -> Result<(), Error> {
    let starts = code.instruction_starts()?;
    if starts.is_empty() {
        return Err(Error::BadBytecode(jvm::Error::MalformedAttribute("Code")));
    }
    code.exception_table.validate(code.bytes.len(), |pc| {
        starts.binary_search(&pc).is_ok()
    })?;

    if !version.allows_missing_stack_maps() {
        let branches = starts.iter().any(|&pos| {
            let opcode = code.bytes[pos];
            is_short_branch(opcode) || matches!(opcode, GOTO_W | JSR_W | TABLESWITCH | LOOKUPSWITCH)
        });
        if branches || !code.exception_table.is_empty() {
            return Err(Error::UnsupportedVersion(version));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finally_handler_calls_the_following_subroutine() {
        let mut bytecode = Bytecode::new(0, 3);
        let len = finally_handler(&mut bytecode, Some(&FieldType::long())).unwrap();
        assert_eq!(
            bytecode.bytes(),
            &[ASTORE_3, LCONST_0, JSR, 0, 5, ALOAD_3, ATHROW]
        );
        assert_eq!(len, 7);
        assert_eq!(bytecode.max_locals(), 4);
        assert_eq!(bytecode.max_stack(), 3);
    }

    #[test]
    fn fall_through_detection() {
        assert!(falls_through(&[]).unwrap());
        assert!(falls_through(&[ICONST_0, POP]).unwrap());
        assert!(!falls_through(&[ICONST_0, IRETURN]).unwrap());
        assert!(!falls_through(&[GOTO, 0, 0]).unwrap());
    }

    #[test]
    fn subroutine_calls_before_returns() {
        // if ($0 == 0) return 1; return 2; followed by a 3 byte "subroutine"
        let mut code = Code::new(1, 2, vec![
            ILOAD_0, IFNE, 0, 5, ICONST_1, IRETURN, ICONST_2, IRETURN, ASTORE_1, RET, 1,
        ]);
        let rewritten = call_subroutine_before_returns(&mut code, 3).unwrap();
        assert_eq!(rewritten, 2);
        assert_eq!(
            code.bytes,
            vec![
                ILOAD_0, IFNE, 0, 8, ICONST_1, JSR, 0, 9, IRETURN, ICONST_2, JSR, 0, 4, IRETURN,
                ASTORE_1, RET, 1
            ]
        );
    }

    #[test]
    fn constructor_bodies_start_after_the_super_call() {
        let mut constants = ConstantPool::new();
        let [new_hi, new_lo] = ((constants.get_class("Helper").unwrap().0).0).to_be_bytes();
        let [helper_hi, helper_lo] = ((constants
            .get_method_ref("Helper", "<init>", "()V", false)
            .unwrap()
            .0)
            .0)
            .to_be_bytes();
        let [super_hi, super_lo] = ((constants
            .get_method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap()
            .0)
            .0)
            .to_be_bytes();
        let [check_hi, check_lo] = ((constants
            .get_method_ref("Point", "check", "()V", false)
            .unwrap()
            .0)
            .0)
            .to_be_bytes();

        // new Helper() is built before calling super(), and a private call follows
        let code = Code::new(2, 1, vec![
            NEW, new_hi, new_lo, DUP, INVOKESPECIAL, helper_hi, helper_lo, POP, ALOAD_0,
            INVOKESPECIAL, super_hi, super_lo, ALOAD_0, INVOKESPECIAL, check_hi, check_lo, RETURN,
        ]);
        assert_eq!(body_start(&code, &constants, true).unwrap(), 12);
        assert_eq!(body_start(&code, &constants, false).unwrap(), 0);

        let code = Code::new(1, 1, vec![ALOAD_0, INVOKESPECIAL, check_hi, check_lo, RETURN]);
        assert!(matches!(
            body_start(&code, &constants, true),
            Err(Error::MissingSuperCall)
        ));
    }
}
