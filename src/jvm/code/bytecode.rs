use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex, ConstantPool};
use crate::jvm::code::opcodes::*;
use crate::jvm::code::ExceptionTable;
use crate::jvm::{Error, ValueKind};

/// Scratch buffer that instructions get appended to
///
/// Besides the raw bytes, the buffer tracks the current operand stack depth along with the
/// highest depth and the number of local variable slots reached so far. Exception handlers
/// registered here use offsets relative to the start of the buffer.
///
/// A buffer is filled once and then copied into a method body: it never shares storage with the
/// code it ends up in.
#[derive(Debug, Clone)]
pub struct Bytecode {
    bytes: Vec<u8>,
    stack_depth: i32,
    max_stack: usize,
    max_locals: usize,
    exception_table: ExceptionTable,
}

impl Bytecode {
    /// Empty buffer whose high-water marks start at the given values
    pub fn new(max_stack: u16, max_locals: u16) -> Bytecode {
        Bytecode {
            bytes: vec![],
            stack_depth: 0,
            max_stack: max_stack as usize,
            max_locals: max_locals as usize,
            exception_table: ExceptionTable::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset at which the next byte will be written
    pub fn current_pc(&self) -> usize {
        self.bytes.len()
    }

    pub fn byte_at(&self, pos: usize) -> Option<u8> {
        self.bytes.get(pos).copied()
    }

    pub fn exception_table(&self) -> &ExceptionTable {
        &self.exception_table
    }

    pub fn stack_depth(&self) -> i32 {
        self.stack_depth
    }

    /// Set the stack depth (eg. to 1 at the start of an exception handler)
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.stack_depth = depth;
        if depth > 0 && depth as usize > self.max_stack {
            self.max_stack = depth as usize;
        }
    }

    /// Adjust the stack depth, bumping the high-water mark if needed
    pub fn grow_stack(&mut self, diff: i32) {
        self.set_stack_depth(self.stack_depth + diff);
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    /// Raise the local variable high-water mark to at least `locals`
    pub fn reserve_locals(&mut self, locals: usize) {
        self.max_locals = self.max_locals.max(locals);
    }

    /// Grab the next free local slots
    pub fn allocate_local(&mut self, width: u16) -> usize {
        let slot = self.max_locals;
        self.max_locals += width as usize;
        slot
    }

    /// High-water marks, checked to fit the class file format
    pub fn limits(&self) -> Result<(u16, u16), Error> {
        let max_stack = u16::try_from(self.max_stack)
            .map_err(|_| Error::MethodCodeMaxStackOverflow(self.max_stack))?;
        let max_locals = u16::try_from(self.max_locals)
            .map_err(|_| Error::MethodCodeMaxLocalsOverflow(self.max_locals))?;
        Ok((max_stack, max_locals))
    }

    /// Append a raw byte (for operands)
    pub fn add(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn add_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    /// Overwrite two bytes at `pos` (used to patch forward branches)
    pub fn write_u16(&mut self, pos: usize, value: u16) {
        self.bytes[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, pos: usize, value: i32) {
        self.bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Append an opcode, applying its fixed stack effect
    pub fn add_opcode(&mut self, opcode: u8) {
        self.bytes.push(opcode);
        self.grow_stack(stack_growth(opcode));
    }

    /// Append an instruction taking a 2-byte constant pool index (`new`, `checkcast`, field
    /// accesses, ...)
    pub fn add_index(&mut self, opcode: u8, index: ConstantIndex) {
        self.add_opcode(opcode);
        self.add_u16(index.0);
    }

    /// Load a local variable, using the shortest encoding available
    pub fn add_load(&mut self, slot: usize, kind: ValueKind) -> Result<(), Error> {
        self.add_local_access(kind.load_opcode(), ILOAD_0, slot, kind)
    }

    /// Store into a local variable, using the shortest encoding available
    pub fn add_store(&mut self, slot: usize, kind: ValueKind) -> Result<(), Error> {
        self.add_local_access(kind.store_opcode(), ISTORE_0, slot, kind)
    }

    fn add_local_access(
        &mut self,
        opcode: u8,
        short_base: u8,
        slot: usize,
        kind: ValueKind,
    ) -> Result<(), Error> {
        let family = opcode - if short_base == ILOAD_0 { ILOAD } else { ISTORE };
        if slot < 4 {
            // `iload_0` .. `aload_3` are grouped by type, four per type
            self.add_opcode(short_base + family * 4 + slot as u8);
        } else if slot <= u8::MAX as usize {
            self.add_opcode(opcode);
            self.add(slot as u8);
        } else {
            let slot16 =
                u16::try_from(slot).map_err(|_| Error::MethodCodeMaxLocalsOverflow(slot))?;
            self.add(WIDE);
            self.add_opcode(opcode);
            self.add_u16(slot16);
        }
        self.reserve_locals(slot + kind.slots() as usize);
        Ok(())
    }

    /// Return from a subroutine whose return address is stored in `slot`
    pub fn add_ret(&mut self, slot: usize) -> Result<(), Error> {
        if slot <= u8::MAX as usize {
            self.add_opcode(RET);
            self.add(slot as u8);
        } else {
            let slot16 =
                u16::try_from(slot).map_err(|_| Error::MethodCodeMaxLocalsOverflow(slot))?;
            self.add(WIDE);
            self.add_opcode(RET);
            self.add_u16(slot16);
        }
        self.reserve_locals(slot + 1);
        Ok(())
    }

    /// Push an `int` constant, using the shortest encoding available
    pub fn add_iconst(&mut self, value: i32, constants: &mut ConstantPool) -> Result<(), Error> {
        match value {
            -1..=5 => self.add_opcode((ICONST_0 as i32 + value) as u8),
            -128..=127 => {
                self.add_opcode(BIPUSH);
                self.add(value as i8 as u8);
            }
            -32768..=32767 => {
                self.add_opcode(SIPUSH);
                self.add_u16(value as i16 as u16);
            }
            _ => {
                let index = constants.get_integer(value)?;
                self.add_ldc(index);
            }
        }
        Ok(())
    }

    /// Push a single-width constant from the pool
    pub fn add_ldc(&mut self, index: ConstantIndex) {
        if index.0 <= u8::MAX as u16 {
            self.add_opcode(LDC);
            self.add(index.0 as u8);
        } else {
            self.add_index(LDC_W, index);
        }
    }

    /// Push a `long` or `double` constant from the pool
    pub fn add_ldc2(&mut self, index: ConstantIndex) {
        self.add_index(LDC2_W, index);
    }

    /// Push the zero value of a kind (`0`, `0L`, `0.0f`, `0.0`, or `null`)
    pub fn add_zero(&mut self, kind: ValueKind) {
        self.add_opcode(kind.zero_opcode());
    }

    /// Register an exception handler (offsets relative to the start of this buffer)
    pub fn add_exception_handler(
        &mut self,
        start: usize,
        end: usize,
        handler: usize,
        catch_type: ClassConstantIndex,
    ) -> Result<(), Error> {
        self.exception_table.add(start, end, handler, catch_type)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_accesses_pick_short_forms() {
        let mut bytecode = Bytecode::new(0, 0);
        bytecode.add_load(0, ValueKind::Reference).unwrap();
        bytecode.add_load(3, ValueKind::Int).unwrap();
        bytecode.add_store(2, ValueKind::Long).unwrap();
        bytecode.add_store(7, ValueKind::Double).unwrap();
        bytecode.add_load(300, ValueKind::Float).unwrap();
        assert_eq!(
            bytecode.bytes(),
            &[ALOAD_0, ILOAD_3, LSTORE_2, DSTORE, 7, WIDE, FLOAD, 1, 44]
        );
        assert_eq!(bytecode.max_locals(), 301);
        assert_eq!(bytecode.max_stack(), 2);
    }

    #[test]
    fn int_constants_pick_short_forms() {
        let mut constants = ConstantPool::new();
        let mut bytecode = Bytecode::new(0, 0);
        for value in [-1, 5, 6, -129, 40_000] {
            bytecode.add_iconst(value, &mut constants).unwrap();
        }
        assert_eq!(
            bytecode.bytes(),
            &[ICONST_M1, ICONST_5, BIPUSH, 6, SIPUSH, 0xff, 0x7f, LDC, 1]
        );
        assert_eq!(bytecode.stack_depth(), 5);
        assert_eq!(bytecode.max_stack(), 5);
    }

    #[test]
    fn high_water_marks_never_drop() {
        let mut bytecode = Bytecode::new(4, 2);
        bytecode.add_opcode(ICONST_0);
        bytecode.add_opcode(POP);
        assert_eq!(bytecode.max_stack(), 4);
        assert_eq!(bytecode.allocate_local(2), 2);
        assert_eq!(bytecode.max_locals(), 4);
        bytecode.add_ret(1).unwrap();
        assert_eq!(bytecode.max_locals(), 4);
        assert_eq!(bytecode.limits().unwrap(), (4, 4));
    }
}
