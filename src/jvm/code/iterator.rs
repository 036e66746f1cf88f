//! Cursor over the instructions of a method body, with support for splicing in code
//!
//! ### Gap insertion
//!
//! Inserting bytes in the middle of a method body shifts everything after the insertion point, so
//! every relative branch offset crossing that point has to be fixed up along with the exception
//! table and any debug attributes mentioning code offsets. Two details make this more than a
//! simple shift:
//!
//!   - `tableswitch`/`lookupswitch` pad their operands to a 4-byte boundary, so moving a switch
//!     can change its length.
//!
//!   - a 16-bit branch may no longer reach its target. Those get rewritten into their 32-bit form:
//!
//! ```text,ignore,no_run
//!     goto L          =>      goto_w L
//!     jsr L           =>      jsr_w L
//!
//!     if* L           =>      ifnot* +8
//!                             goto_w L
//! ```
//!
//! Widening a branch moves code again, which might push other branches out of range. Layout is
//! therefore recomputed until nothing new overflows. This terminates: the set of widened branches
//! only grows and is bounded by the number of branches.
//!
//! ### Insertion point
//!
//! Branch targets, handler offsets, and debug offsets equal to the insertion point are where the
//! choice between "inclusive" and "exclusive" insertion matters. An inclusive gap is entered by
//! jumps to the insertion point (the new code runs first). An exclusive gap is skipped by them,
//! so jumps keep landing on the instruction that was originally there.

use crate::jvm::code::opcodes::*;
use crate::jvm::code::{Code, ExceptionTable};
use crate::jvm::Error;
use std::collections::HashSet;

/// Position-addressable cursor over a method body
///
/// Offsets obtained from the cursor are invalidated by insertions before them. The cursor's own
/// position is carried along, so a scan can keep going after inserting code.
pub struct CodeIterator<'a> {
    code: &'a mut Code,
    current: usize,
}

impl<'a> CodeIterator<'a> {
    pub(crate) fn new(code: &'a mut Code) -> CodeIterator<'a> {
        CodeIterator { code, current: 0 }
    }

    pub fn code(&self) -> &Code {
        self.code
    }

    pub fn code_length(&self) -> usize {
        self.code.bytes.len()
    }

    /// Move back to the first instruction
    pub fn begin(&mut self) {
        self.current = 0;
    }

    /// Move to an offset (which should be an instruction boundary)
    pub fn move_to(&mut self, pos: usize) {
        self.current = pos;
    }

    pub fn has_next(&self) -> bool {
        self.current < self.code.bytes.len()
    }

    /// Offset of the instruction that `next` will return
    pub fn look_ahead(&self) -> usize {
        self.current
    }

    pub fn byte_at(&self, pos: usize) -> Result<u8, Error> {
        self.code
            .bytes
            .get(pos)
            .copied()
            .ok_or(Error::TruncatedInstruction(pos))
    }

    pub fn u16_at(&self, pos: usize) -> Result<u16, Error> {
        let bytes = self.slice(pos, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn s16_at(&self, pos: usize) -> Result<i16, Error> {
        Ok(self.u16_at(pos)? as i16)
    }

    pub fn s32_at(&self, pos: usize) -> Result<i32, Error> {
        let bytes = self.slice(pos, 4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn slice(&self, pos: usize, len: usize) -> Result<&[u8], Error> {
        self.code
            .bytes
            .get(pos..pos + len)
            .ok_or(Error::TruncatedInstruction(pos))
    }

    fn slice_mut(&mut self, pos: usize, len: usize) -> Result<&mut [u8], Error> {
        self.code
            .bytes
            .get_mut(pos..pos + len)
            .ok_or(Error::TruncatedInstruction(pos))
    }

    pub fn write_byte(&mut self, pos: usize, value: u8) -> Result<(), Error> {
        self.slice_mut(pos, 1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, pos: usize, value: u16) -> Result<(), Error> {
        self.slice_mut(pos, 2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i16(&mut self, pos: usize, value: i16) -> Result<(), Error> {
        self.slice_mut(pos, 2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i32(&mut self, pos: usize, value: i32) -> Result<(), Error> {
        self.slice_mut(pos, 4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Open a gap of `len` `nop` bytes in front of the instruction at `at`
    ///
    /// `at` must be an instruction boundary or the code length. Returns the offset at which the
    /// gap starts, which differs from `at` if branches before it had to be widened. Nothing is
    /// modified if this fails.
    pub fn insert_gap(&mut self, at: usize, len: usize, exclusive: bool) -> Result<usize, Error> {
        let layout = Layout::compute(&self.code.bytes, at, len, exclusive)?;
        let mut relocated = Code {
            bytes: layout.emit(&self.code.bytes)?,
            ..self.code.clone()
        };
        relocated
            .exception_table
            .relocate(|pc| layout.relocate(pc))?;
        relocated.relocate_debug_info(|pc| layout.relocate(pc))?;
        let current = layout.relocate(self.current)?;

        if !layout.widened.is_empty() {
            log::debug!(
                "Widened {} branches to fit a {} byte gap at {}",
                layout.widened.len(),
                len,
                at
            );
        }

        *self.code = relocated;
        self.current = current;
        Ok(layout.gap_start())
    }

    /// Insert code in front of the instruction at `at`, so that jumps to `at` run it
    pub fn insert(&mut self, at: usize, code: &[u8]) -> Result<usize, Error> {
        let pos = self.insert_gap(at, code.len(), false)?;
        self.code.bytes[pos..pos + code.len()].copy_from_slice(code);
        Ok(pos)
    }

    /// Insert code in front of the instruction at `at`, so that jumps to `at` skip it
    pub fn insert_ex(&mut self, at: usize, code: &[u8]) -> Result<usize, Error> {
        let pos = self.insert_gap(at, code.len(), true)?;
        self.code.bytes[pos..pos + code.len()].copy_from_slice(code);
        Ok(pos)
    }

    /// Add code after the last instruction, returning the offset it starts at
    ///
    /// Nothing needs relocating since no existing code moves. Code containing switches is
    /// assumed to be laid out for a 4-byte aligned start, so it gets placed after `nop` padding
    /// if needed.
    pub fn append(&mut self, code: &[u8]) -> Result<usize, Error> {
        let end = self.code.bytes.len();
        let pos = if end % 4 != 0 && contains_switch(code)? {
            end + 4 - end % 4
        } else {
            end
        };
        let new_len = pos + code.len();
        if new_len > u16::MAX as usize {
            return Err(Error::MethodCodeOverflow(new_len));
        }
        self.code.bytes.resize(pos, NOP);
        self.code.bytes.extend_from_slice(code);
        Ok(pos)
    }

    /// Add handlers with lower priority than the existing ones
    pub fn append_exception_table(
        &mut self,
        table: &ExceptionTable,
        offset: usize,
    ) -> Result<(), Error> {
        self.code.exception_table.append(table, offset)
    }

    /// Add handlers with higher priority than the existing ones
    pub fn insert_exception_table(
        &mut self,
        table: &ExceptionTable,
        offset: usize,
    ) -> Result<(), Error> {
        self.code.exception_table.prepend(table, offset)
    }
}

/// Steps through instruction offsets
impl<'a> Iterator for CodeIterator<'a> {
    type Item = Result<usize, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let pos = self.current;
        Some(instruction_length(&self.code.bytes, pos).map(|len| {
            self.current = pos + len;
            pos
        }))
    }
}

/// New placement of the instructions of a method body around a gap
struct Layout {
    /// Old instruction offsets
    starts: Vec<usize>,

    /// New instruction offsets
    new_starts: Vec<usize>,

    old_len: usize,
    new_len: usize,

    at: usize,

    /// Index of the instruction at `at` (or `starts.len()` for a gap at the end)
    at_index: usize,
    gap: usize,
    exclusive: bool,

    /// Indices of 16-bit branches that will be rewritten to use 32-bit offsets
    widened: HashSet<usize>,
}

impl Layout {
    fn compute(code: &[u8], at: usize, gap: usize, exclusive: bool) -> Result<Layout, Error> {
        let mut starts = vec![];
        let mut pos = 0;
        while pos < code.len() {
            starts.push(pos);
            pos += instruction_length(code, pos)?;
        }

        let at_index = if at == code.len() {
            starts.len()
        } else {
            starts
                .binary_search(&at)
                .map_err(|_| Error::InvalidInstructionBoundary(at))?
        };

        let mut layout = Layout {
            starts,
            new_starts: vec![],
            old_len: code.len(),
            new_len: 0,
            at,
            at_index,
            gap,
            exclusive,
            widened: HashSet::new(),
        };

        loop {
            layout.place(code);
            if layout.new_len > u16::MAX as usize {
                return Err(Error::MethodCodeOverflow(layout.new_len));
            }

            let mut overflowing = vec![];
            for (idx, &pos) in layout.starts.iter().enumerate() {
                let opcode = code[pos];
                if !is_short_branch(opcode) || layout.widened.contains(&idx) {
                    continue;
                }
                let target = layout.relocate(branch_target(code, pos, 2)?)?;
                let displacement = target as isize - layout.new_starts[idx] as isize;
                if i16::try_from(displacement).is_err() {
                    overflowing.push(idx);
                }
            }

            if overflowing.is_empty() {
                return Ok(layout);
            }
            log::trace!("{} branches overflow, widening", overflowing.len());
            layout.widened.extend(overflowing);
        }
    }

    fn old_length(&self, idx: usize) -> usize {
        let end = self.starts.get(idx + 1).copied().unwrap_or(self.old_len);
        end - self.starts[idx]
    }

    /// Length of an instruction once it is placed at `new_pos`
    fn new_length(&self, code: &[u8], idx: usize, new_pos: usize) -> usize {
        let pos = self.starts[idx];
        let old_length = self.old_length(idx);
        match code[pos] {
            TABLESWITCH | LOOKUPSWITCH => {
                old_length - switch_padding(pos) + switch_padding(new_pos)
            }
            GOTO | JSR if self.widened.contains(&idx) => 5,
            _ if self.widened.contains(&idx) => 8,
            _ => old_length,
        }
    }

    /// Assign new offsets to every instruction
    fn place(&mut self, code: &[u8]) {
        self.new_starts.clear();
        let mut pc = 0;
        for idx in 0..self.starts.len() {
            if idx == self.at_index {
                pc += self.gap;
            }
            self.new_starts.push(pc);
            pc += self.new_length(code, idx, pc);
        }
        if self.at_index == self.starts.len() {
            pc += self.gap;
        }
        self.new_len = pc;
    }

    fn gap_start(&self) -> usize {
        let after_gap = self
            .new_starts
            .get(self.at_index)
            .copied()
            .unwrap_or(self.new_len);
        after_gap - self.gap
    }

    /// Where an old offset ends up
    fn relocate(&self, old: usize) -> Result<usize, Error> {
        if old == self.at {
            let gap_start = self.gap_start();
            return Ok(if self.exclusive {
                gap_start + self.gap
            } else {
                gap_start
            });
        }
        if old == self.old_len {
            return Ok(self.new_len);
        }
        match self.starts.binary_search(&old) {
            Ok(idx) => Ok(self.new_starts[idx]),
            Err(_) => Err(Error::InvalidInstructionBoundary(old)),
        }
    }

    /// Offset relative to `from` for reaching the relocated `old_target`
    fn displacement(&self, from: usize, old_target: usize) -> Result<i32, Error> {
        Ok(self.relocate(old_target)? as i32 - from as i32)
    }

    /// Produce the relocated code
    fn emit(&self, code: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out: Vec<u8> = Vec::with_capacity(self.new_len);
        for (idx, &pos) in self.starts.iter().enumerate() {
            if idx == self.at_index {
                out.resize(out.len() + self.gap, NOP);
            }
            let here = self.new_starts[idx];
            let opcode = code[pos];

            if is_short_branch(opcode) {
                let target = branch_target(code, pos, 2)?;
                if !self.widened.contains(&idx) {
                    let offset = self.displacement(here, target)? as i16;
                    out.push(opcode);
                    out.extend_from_slice(&offset.to_be_bytes());
                } else if let Some(inverted) = invert_conditional(opcode) {
                    out.push(inverted);
                    out.extend_from_slice(&8i16.to_be_bytes());
                    out.push(GOTO_W);
                    let offset = self.displacement(here + 3, target)?;
                    out.extend_from_slice(&offset.to_be_bytes());
                } else {
                    out.push(if opcode == GOTO { GOTO_W } else { JSR_W });
                    out.extend_from_slice(&self.displacement(here, target)?.to_be_bytes());
                }
                continue;
            }

            match opcode {
                GOTO_W | JSR_W => {
                    let target = branch_target(code, pos, 4)?;
                    out.push(opcode);
                    out.extend_from_slice(&self.displacement(here, target)?.to_be_bytes());
                }
                TABLESWITCH => {
                    let operands = pos + 1 + switch_padding(pos);
                    out.push(opcode);
                    out.resize(out.len() + switch_padding(here), 0);
                    let default = switch_target(code, pos, operands)?;
                    out.extend_from_slice(&self.displacement(here, default)?.to_be_bytes());
                    out.extend_from_slice(&code[operands + 4..operands + 12]);
                    let low = read_i32(code, operands + 4);
                    let high = read_i32(code, operands + 8);
                    for i in 0..(high as i64 - low as i64 + 1) as usize {
                        let target = switch_target(code, pos, operands + 12 + 4 * i)?;
                        out.extend_from_slice(&self.displacement(here, target)?.to_be_bytes());
                    }
                }
                LOOKUPSWITCH => {
                    let operands = pos + 1 + switch_padding(pos);
                    out.push(opcode);
                    out.resize(out.len() + switch_padding(here), 0);
                    let default = switch_target(code, pos, operands)?;
                    out.extend_from_slice(&self.displacement(here, default)?.to_be_bytes());
                    out.extend_from_slice(&code[operands + 4..operands + 8]);
                    let npairs = read_i32(code, operands + 4) as usize;
                    for i in 0..npairs {
                        let pair = operands + 8 + 8 * i;
                        out.extend_from_slice(&code[pair..pair + 4]);
                        let target = switch_target(code, pos, pair + 4)?;
                        out.extend_from_slice(&self.displacement(here, target)?.to_be_bytes());
                    }
                }
                _ => out.extend_from_slice(&code[pos..pos + self.old_length(idx)]),
            }
        }
        if self.at_index == self.starts.len() {
            out.resize(out.len() + self.gap, NOP);
        }
        debug_assert_eq!(out.len(), self.new_len);
        Ok(out)
    }
}

/// Read an `i32` that `instruction_length` already checked to be in bounds
fn read_i32(code: &[u8], pos: usize) -> i32 {
    i32::from_be_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

/// Absolute target of a branch at `pos`, whose offset operand is `width` bytes wide
fn branch_target(code: &[u8], pos: usize, width: usize) -> Result<usize, Error> {
    let offset = if width == 2 {
        i16::from_be_bytes([code[pos + 1], code[pos + 2]]) as isize
    } else {
        read_i32(code, pos + 1) as isize
    };
    absolute(pos, offset)
}

/// Absolute target of a switch entry stored at `operand`
fn switch_target(code: &[u8], pos: usize, operand: usize) -> Result<usize, Error> {
    absolute(pos, read_i32(code, operand) as isize)
}

fn contains_switch(code: &[u8]) -> Result<bool, Error> {
    let mut pos = 0;
    while pos < code.len() {
        if matches!(code[pos], TABLESWITCH | LOOKUPSWITCH) {
            return Ok(true);
        }
        pos += instruction_length(code, pos)?;
    }
    Ok(false)
}

fn absolute(pos: usize, offset: isize) -> Result<usize, Error> {
    let target = pos as isize + offset;
    usize::try_from(target).map_err(|_| Error::InvalidInstructionBoundary(pos))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{
        ClassConstantIndex, ConstantPool, LineNumber, LineNumberTable,
    };
    use crate::jvm::code::CodeAttribute;

    fn code(bytes: Vec<u8>) -> Code {
        Code::new(2, 2, bytes)
    }

    #[test]
    fn forward_branch_over_gap() {
        let mut body = code(vec![GOTO, 0, 5, NOP, NOP, RETURN]);
        let pos = body.iterator().insert_gap(4, 2, false).unwrap();
        assert_eq!(pos, 4);
        assert_eq!(body.bytes, vec![GOTO, 0, 7, NOP, NOP, NOP, NOP, RETURN]);
    }

    #[test]
    fn branch_to_insertion_point() {
        // `goto` jumping back to the first instruction (a loop head)
        let original = vec![NOP, GOTO, 0xff, 0xff];

        let mut inclusive = code(original.clone());
        inclusive.iterator().insert_gap(0, 2, false).unwrap();
        assert_eq!(inclusive.bytes, vec![NOP, NOP, NOP, GOTO, 0xff, 0xfd]);

        let mut exclusive = code(original);
        exclusive.iterator().insert_gap(0, 2, true).unwrap();
        assert_eq!(exclusive.bytes, vec![NOP, NOP, NOP, GOTO, 0xff, 0xff]);
    }

    #[test]
    fn goto_widened_when_out_of_range() {
        // goto from 0 to 32763, right at the edge of the signed 16-bit range
        let mut bytes = vec![GOTO, 0x7f, 0xfb];
        bytes.resize(32763, NOP);
        bytes.push(RETURN);
        let mut body = code(bytes);

        let pos = body.iterator().insert_gap(3, 10, false).unwrap();
        assert_eq!(pos, 5);
        assert_eq!(body.bytes[0], GOTO_W);
        assert_eq!(read_i32(&body.bytes, 1), 32763 + 2 + 10);
        assert_eq!(body.bytes[32763 + 12], RETURN);
        assert_eq!(body.bytes.len(), 32764 + 12);
    }

    #[test]
    fn conditional_widened_when_out_of_range() {
        let mut bytes = vec![ICONST_0, IFEQ, 0x7f, 0xfa];
        bytes.resize(32763, NOP);
        bytes.push(RETURN);
        let mut body = code(bytes);

        body.iterator().insert_gap(4, 10, false).unwrap();
        assert_eq!(&body.bytes[1..4], &[IFNE, 0, 8]);
        assert_eq!(body.bytes[4], GOTO_W);
        // `goto_w` sits at 4 and the `return` moved from 32763 to 32763 + 5 + 10
        assert_eq!(read_i32(&body.bytes, 5), 32778 - 4);
        assert_eq!(body.bytes[32778], RETURN);
    }

    #[test]
    fn switch_padding_is_recomputed() {
        // nop; tableswitch (at 1) with targets to the `return` at 24
        let mut bytes = vec![NOP, TABLESWITCH, 0, 0];
        bytes.extend_from_slice(&[0, 0, 0, 23, 0, 0, 0, 0, 0, 0, 0, 1]);
        bytes.extend_from_slice(&[0, 0, 0, 23, 0, 0, 0, 23]);
        bytes.push(RETURN);
        let mut body = code(bytes);

        body.iterator().insert_gap(0, 1, false).unwrap();
        // tableswitch now at 2, needs a single padding byte, `return` ends up at 24
        assert_eq!(body.bytes.len(), 25);
        assert_eq!(body.bytes[2], TABLESWITCH);
        assert_eq!(body.bytes[3], 0);
        assert_eq!(read_i32(&body.bytes, 4), 22);
        assert_eq!(read_i32(&body.bytes, 16), 22);
        assert_eq!(read_i32(&body.bytes, 20), 22);
        assert_eq!(body.bytes[24], RETURN);
    }

    #[test]
    fn handlers_and_lines_move() {
        let mut constants = ConstantPool::new();
        let lines_name = constants.get_utf8("LineNumberTable").unwrap();
        let mut body = code(vec![ICONST_0, IRETURN, ASTORE_1, ICONST_1, IRETURN]);
        body.exception_table
            .add(0, 2, 2, ClassConstantIndex::NONE)
            .unwrap();
        body.attributes.push(CodeAttribute::LineNumbers(
            lines_name,
            LineNumberTable(vec![
                LineNumber {
                    start_pc: 0,
                    line_number: 1,
                },
                LineNumber {
                    start_pc: 2,
                    line_number: 2,
                },
            ]),
        ));

        body.iterator().insert_gap(1, 3, false).unwrap();
        let handler = body.exception_table.0[0];
        assert_eq!(
            (handler.start_pc, handler.end_pc, handler.handler_pc),
            (0, 5, 5)
        );
        match &body.attributes[0] {
            CodeAttribute::LineNumbers(_, table) => {
                assert_eq!(table.0[0].start_pc, 0);
                assert_eq!(table.0[1].start_pc, 5);
            }
            other => panic!("unexpected attribute {:?}", other),
        }
    }

    #[test]
    fn insertion_must_be_on_a_boundary() {
        let mut body = code(vec![SIPUSH, 0, 1, IRETURN]);
        let before = body.clone();
        assert!(matches!(
            body.iterator().insert_gap(1, 3, false),
            Err(Error::InvalidInstructionBoundary(1))
        ));
        assert_eq!(body, before);
    }

    #[test]
    fn code_length_limit() {
        let mut bytes = vec![NOP; 65530];
        bytes.push(RETURN);
        let mut body = code(bytes);
        assert!(matches!(
            body.iterator().insert_gap(0, 5, false),
            Err(Error::MethodCodeOverflow(65536))
        ));
        assert!(body.iterator().insert_gap(0, 4, false).is_ok());
    }

    #[test]
    fn scanning_while_inserting() {
        // Put a `nop` in front of every `ireturn`
        let mut body = code(vec![ILOAD_0, IFEQ, 0, 5, ICONST_1, IRETURN, ICONST_0, IRETURN]);
        let mut iter = body.iterator();
        let mut inserted = 0;
        while let Some(pos) = iter.next() {
            let pos = pos.unwrap();
            if iter.byte_at(pos).unwrap() == IRETURN {
                iter.insert(pos, &[NOP]).unwrap();
                inserted += 1;
            }
        }
        assert_eq!(inserted, 2);
        assert_eq!(
            body.bytes,
            vec![ILOAD_0, IFEQ, 0, 6, ICONST_1, NOP, IRETURN, ICONST_0, NOP, IRETURN]
        );
    }

    #[test]
    fn append_and_patch() {
        let mut body = code(vec![RETURN]);
        let mut iter = body.iterator();
        let pos = iter.append(&[GOTO, 0, 0]).unwrap();
        assert_eq!(pos, 1);
        iter.write_i16(pos + 1, -1).unwrap();
        assert_eq!(iter.s16_at(pos + 1).unwrap(), -1);
        assert!(iter.write_i32(3, 0).is_err());
        assert_eq!(iter.code_length(), 4);
    }

    #[test]
    fn appended_switches_stay_aligned() {
        let mut switch = vec![TABLESWITCH, 0, 0, 0];
        switch.extend_from_slice(&[0, 0, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 20]);
        switch.push(RETURN);

        let mut body = code(vec![ICONST_0, IRETURN]);
        let pos = body.iterator().append(&switch).unwrap();
        assert_eq!(pos, 4);
        assert_eq!(&body.bytes[..4], &[ICONST_0, IRETURN, NOP, NOP]);
        assert_eq!(body.instruction_starts().unwrap(), vec![0, 1, 2, 3, 4, 24]);

        let pos = body.iterator().append(&[RETURN]).unwrap();
        assert_eq!(pos, 25);
    }
}
