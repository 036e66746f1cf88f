//! A small assembler for JVM bytecode listings
//!
//! ### Syntax
//!
//! A snippet is a list of statements separated by newlines or `;`. The whole snippet may be
//! wrapped in `{ ... }`, and `//` starts a comment running to the end of the line.
//!
//! ```text,ignore,no_run
//!     {
//!       getstatic java/lang/System.out:Ljava/io/PrintStream;
//!       load $_                                  // typed load of the return value
//!       invokevirtual java/io/PrintStream.println:(I)V
//!     }
//! ```
//!
//! Every statement is an optional `label:` followed by an instruction. Instructions are either
//! JVM opcodes spelled by their mnemonic, or one of a handful of pseudo-instructions:
//!
//!   - `load <var>` / `store <var>` move a variable using the opcode matching its type
//!   - `iconst <n>` pushes an `int` using the shortest encoding
//!   - `local <name> <type>` declares a fresh local variable
//!   - `catch <Class|any> from <L> to <L> using <L>` adds an exception handler
//!
//! Operands are integers, variables (`$0`, `$1`, ..., `$_`, or declared names), labels, class
//! names (`java/lang/String`, `java.lang.String`, `int[]`, ...), member references written
//! `Owner.name:Descriptor`, and literals for `ldc` (`"text"`, `42`, `1.5f`, `7L`, `2.0`).
//! `tableswitch` takes its low key, its labels, then `default <L>`, and `lookupswitch` takes
//! `key:label` pairs, then `default <L>`.
//!
//! A `;` ending a class type inside a descriptor (eg. `Ljava/lang/String;`) does not end the
//! statement.
//!
//! ### Stack tracking
//!
//! The operand stack depth is tracked instruction by instruction so that the buffer ends up with
//! the right high-water mark. After an unconditional jump, the depth is unknown until the next
//! label, which restores the depth recorded by the first branch to that label (or 1 for
//! exception handlers).
//!
//! `tableswitch` and `lookupswitch` are padded assuming the buffer will start on a 4-byte
//! boundary.

use crate::jvm;
use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex, ConstantPool};
use crate::jvm::code::opcodes::*;
use crate::jvm::code::Bytecode;
use crate::jvm::{
    parse_type_name, FieldType, MethodDescriptor, ParseDescriptor, RefType, RenderDescriptor,
    ValueKind,
};
use crate::snippet::{CompileError, Scope, SnippetCompiler};
use crate::util::Width;
use std::collections::HashMap;

/// Compiler for snippets written as bytecode listings
#[derive(Debug, Default, Clone, Copy)]
pub struct Assembler;

impl SnippetCompiler for Assembler {
    fn compile(
        &self,
        source: &str,
        scope: &mut Scope,
        bytecode: &mut Bytecode,
        constants: &mut ConstantPool,
    ) -> Result<(), CompileError> {
        let statements = tokenize(source)?;
        log::trace!("Assembling {} statements", statements.len());

        let mut assembly = Assembly {
            scope,
            bytecode,
            constants,
            labels: HashMap::new(),
            fixups: vec![],
            handlers: vec![],
            reachable: true,
        };
        for statement in &statements {
            assembly.statement(statement)?;
        }
        assembly.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
}

#[derive(Debug)]
struct Statement {
    line: usize,
    tokens: Vec<Token>,
}

/// Split source into statements of tokens
fn tokenize(source: &str) -> Result<Vec<Statement>, CompileError> {
    let trimmed = source.trim();
    let source = match trimmed.strip_prefix('{') {
        Some(inner) => inner.strip_suffix('}').ok_or(CompileError::Syntax {
            line: 1,
            message: "unbalanced '{'".to_owned(),
        })?,
        None => trimmed,
    };

    let mut statements = vec![];
    for (idx, text) in source.lines().enumerate() {
        let line = idx + 1;
        let mut tokens = vec![];
        let mut rest = text;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() || rest.starts_with("//") {
                break;
            }

            let ends_statement = if let Some(quoted) = rest.strip_prefix('"') {
                let (string, remaining) = read_string(quoted, line)?;
                tokens.push(Token::Str(string));
                rest = remaining;
                match rest.strip_prefix(';') {
                    Some(remaining) => {
                        rest = remaining;
                        true
                    }
                    None => false,
                }
            } else if let Some(remaining) = rest.strip_prefix(';') {
                rest = remaining;
                true
            } else {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '"')
                    .unwrap_or(rest.len());
                let (mut word, remaining) = rest.split_at(end);
                rest = remaining;
                if let Some(comment) = word.find("//") {
                    word = &word[..comment];
                    rest = "";
                }
                let (word, ends_statement) = split_terminator(word);
                if !word.is_empty() {
                    tokens.push(Token::Word(word.to_owned()));
                }
                ends_statement
            };

            if ends_statement && !tokens.is_empty() {
                statements.push(Statement {
                    line,
                    tokens: std::mem::take(&mut tokens),
                });
            }
        }
        if !tokens.is_empty() {
            statements.push(Statement { line, tokens });
        }
    }
    Ok(statements)
}

/// Read a string literal (after the opening quote), returning it and the text following it
fn read_string(text: &str, line: usize) -> Result<(String, &str), CompileError> {
    let mut string = String::new();
    let mut chars = text.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((string, &text[idx + 1..])),
            '\\' => {
                let escaped = match chars.next() {
                    Some((_, 'n')) => '\n',
                    Some((_, 't')) => '\t',
                    Some((_, 'r')) => '\r',
                    Some((_, '0')) => '\0',
                    Some((_, '"')) => '"',
                    Some((_, '\\')) => '\\',
                    other => {
                        let message = format!("bad escape '\\{}'", other.map_or(' ', |(_, c)| c));
                        return Err(CompileError::Syntax { line, message });
                    }
                };
                string.push(escaped);
            }
            c => string.push(c),
        }
    }
    Err(CompileError::Syntax {
        line,
        message: "unterminated string literal".to_owned(),
    })
}

/// Split off a trailing `;`, unless it closes a class type in a descriptor
fn split_terminator(word: &str) -> (&str, bool) {
    match word.strip_suffix(';') {
        Some(rest) if !is_descriptor_word(word) => (rest, true),
        _ => (word, false),
    }
}

fn is_descriptor_word(word: &str) -> bool {
    let descriptor = word.rsplit(':').next().unwrap_or(word);
    let looks_like_descriptor = word.contains(':')
        || word.contains('/')
        || descriptor.starts_with('(')
        || descriptor.starts_with('[');
    looks_like_descriptor
        && (FieldType::parse(descriptor).is_ok() || MethodDescriptor::parse(descriptor).is_ok())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Parse decimal or `0x` hexadecimal integers, with an optional sign
fn parse_int(word: &str) -> Option<i64> {
    let (negative, digits) = match word.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, word),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None if digits.starts_with(|c: char| c.is_ascii_digit()) => digits.parse::<i64>().ok()?,
        None => return None,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn encoding<E: Into<jvm::Error>>(line: usize) -> impl FnOnce(E) -> CompileError {
    move |error| CompileError::Bytecode {
        line,
        error: error.into(),
    }
}

/// Operands of one statement, consumed left to right
struct Operands<'t> {
    line: usize,
    tokens: &'t [Token],
}

impl<'t> Operands<'t> {
    fn syntax(&self, message: String) -> CompileError {
        CompileError::Syntax {
            line: self.line,
            message,
        }
    }

    fn next(&mut self, what: &str) -> Result<&'t Token, CompileError> {
        match self.tokens.split_first() {
            Some((token, rest)) => {
                self.tokens = rest;
                Ok(token)
            }
            None => Err(self.syntax(format!("expected {}", what))),
        }
    }

    fn word(&mut self, what: &str) -> Result<&'t str, CompileError> {
        match self.next(what)? {
            Token::Word(word) => Ok(word),
            Token::Str(string) => Err(self.syntax(format!("expected {}, found \"{}\"", what, string))),
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), CompileError> {
        let word = self.word(keyword)?;
        if word != keyword {
            return Err(self.syntax(format!("expected '{}', found '{}'", keyword, word)));
        }
        Ok(())
    }

    fn int<T: TryFrom<i64>>(&mut self, what: &str) -> Result<T, CompileError> {
        let word = self.word(what)?;
        parse_int(word)
            .and_then(|value| T::try_from(value).ok())
            .ok_or_else(|| self.syntax(format!("expected {}, found '{}'", what, word)))
    }

    fn peek_word(&self) -> Option<&'t str> {
        match self.tokens.first() {
            Some(Token::Word(word)) => Some(word),
            _ => None,
        }
    }

    fn finish(self) -> Result<(), CompileError> {
        match self.tokens.first() {
            None => Ok(()),
            Some(token) => Err(self.syntax(format!("unexpected operand {:?}", token))),
        }
    }
}

#[derive(Debug, Default)]
struct Label {
    pos: Option<usize>,
    /// Stack depth expected on entry
    depth: Option<i32>,
}

/// Branch offset to fill in once the target label is placed
struct Fixup {
    line: usize,
    label: String,
    instruction_pos: usize,
    operand_pos: usize,
    wide: bool,
}

struct PendingHandler {
    line: usize,
    start: String,
    end: String,
    handler: String,
    catch_type: ClassConstantIndex,
}

struct Assembly<'a> {
    scope: &'a mut Scope,
    bytecode: &'a mut Bytecode,
    constants: &'a mut ConstantPool,
    labels: HashMap<String, Label>,
    fixups: Vec<Fixup>,
    handlers: Vec<PendingHandler>,

    /// Can the next instruction be reached by falling through?
    reachable: bool,
}

impl<'a> Assembly<'a> {
    fn statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        let line = statement.line;
        let mut tokens = &statement.tokens[..];

        while let Some(Token::Word(word)) = tokens.first() {
            match word.strip_suffix(':') {
                Some(label) if is_identifier(label) => {
                    self.place_label(label, line)?;
                    tokens = &tokens[1..];
                }
                _ => break,
            }
        }

        let (first, rest) = match tokens.split_first() {
            None => return Ok(()),
            Some(split) => split,
        };
        let mut operands = Operands { line, tokens: rest };
        let mnemonic = match first {
            Token::Word(word) => word.as_str(),
            Token::Str(string) => {
                let message = format!("expected an instruction, found \"{}\"", string);
                return Err(CompileError::Syntax { line, message });
            }
        };

        match mnemonic {
            "load" | "store" => {
                let name = operands.word("variable")?;
                let variable = self.scope.lookup(name).cloned().ok_or_else(|| {
                    CompileError::UnknownVariable {
                        line,
                        name: name.to_owned(),
                    }
                })?;
                let kind = variable.typ.kind();
                let result = if mnemonic == "load" {
                    self.bytecode.add_load(variable.slot, kind)
                } else {
                    self.bytecode.add_store(variable.slot, kind)
                };
                result.map_err(encoding(line))?;
            }
            "iconst" => {
                let value = operands.int::<i32>("int constant")?;
                self.bytecode
                    .add_iconst(value, self.constants)
                    .map_err(encoding(line))?;
            }
            "local" => {
                let name = operands.word("variable name")?;
                if !is_identifier(name) {
                    let message = format!("'{}' is not a valid variable name", name);
                    return Err(CompileError::Syntax { line, message });
                }
                let typ = self.field_type(operands.word("variable type")?, line)?;
                self.scope.record_variable(&typ, name, self.bytecode);
            }
            "catch" => {
                let class = operands.word("exception class")?;
                let catch_type = if class == "any" {
                    ClassConstantIndex::NONE
                } else {
                    self.class_constant(class, line)?
                };
                operands.keyword("from")?;
                let start = operands.word("label")?.to_owned();
                operands.keyword("to")?;
                let end = operands.word("label")?.to_owned();
                operands.keyword("using")?;
                let handler = operands.word("label")?.to_owned();
                self.expect_depth(&handler, 1);
                self.handlers.push(PendingHandler {
                    line,
                    start,
                    end,
                    handler,
                    catch_type,
                });
            }
            _ => {
                let opcode =
                    from_mnemonic(mnemonic).ok_or_else(|| CompileError::UnknownInstruction {
                        line,
                        mnemonic: mnemonic.to_owned(),
                    })?;
                self.instruction(opcode, &mut operands)?;
                if self.bytecode.stack_depth() < 0 {
                    return Err(CompileError::StackUnderflow { line });
                }
            }
        }

        operands.finish()
    }

    fn instruction(&mut self, opcode: u8, operands: &mut Operands) -> Result<(), CompileError> {
        let line = operands.line;
        match opcode {
            BIPUSH => {
                let value = operands.int::<i8>("byte")?;
                self.bytecode.add_opcode(opcode);
                self.bytecode.add(value as u8);
            }
            SIPUSH => {
                let value = operands.int::<i16>("short")?;
                self.bytecode.add_opcode(opcode);
                self.bytecode.add_u16(value as u16);
            }
            LDC | LDC_W => {
                let index = self.single_constant(operands)?;
                self.bytecode.add_ldc(index);
            }
            LDC2_W => {
                let index = self.double_constant(operands)?;
                self.bytecode.add_ldc2(index);
            }
            ILOAD..=ALOAD => {
                let slot = self.slot(operands)?;
                let kind = kind_of_family(opcode - ILOAD);
                self.bytecode
                    .add_load(slot, kind)
                    .map_err(encoding(line))?;
            }
            ISTORE..=ASTORE => {
                let slot = self.slot(operands)?;
                let kind = kind_of_family(opcode - ISTORE);
                self.bytecode
                    .add_store(slot, kind)
                    .map_err(encoding(line))?;
            }
            RET => {
                let slot = self.slot(operands)?;
                self.bytecode.add_ret(slot).map_err(encoding(line))?;
            }
            IINC => {
                let slot = self.slot(operands)?;
                let delta = operands.int::<i16>("increment")?;
                match (u8::try_from(slot), i8::try_from(delta)) {
                    (Ok(slot8), Ok(delta8)) => {
                        self.bytecode.add_opcode(IINC);
                        self.bytecode.add(slot8);
                        self.bytecode.add(delta8 as u8);
                    }
                    _ => {
                        let slot16 = u16::try_from(slot)
                            .map_err(|_| jvm::Error::MethodCodeMaxLocalsOverflow(slot))
                            .map_err(encoding(line))?;
                        self.bytecode.add(WIDE);
                        self.bytecode.add_opcode(IINC);
                        self.bytecode.add_u16(slot16);
                        self.bytecode.add_u16(delta as u16);
                    }
                }
                self.bytecode.reserve_locals(slot + 1);
            }
            IFEQ..=JSR | IFNULL | IFNONNULL | GOTO_W | JSR_W => {
                let label = operands.word("label")?;
                let wide = opcode == GOTO_W || opcode == JSR_W;
                let pos = self.bytecode.current_pc();
                self.bytecode.add_opcode(opcode);
                self.fixup(label, line, pos, wide);
                self.expect_depth(label, self.bytecode.stack_depth());
                if opcode == JSR || opcode == JSR_W {
                    // The subroutine consumes the return address
                    self.bytecode.grow_stack(-1);
                }
            }
            TABLESWITCH => self.table_switch(operands)?,
            LOOKUPSWITCH => self.lookup_switch(operands)?,
            GETSTATIC..=PUTFIELD => {
                let (owner, name, descriptor) = member(operands.word("field reference")?, line)?;
                let typ = FieldType::parse(descriptor).map_err(|_| CompileError::BadDescriptor {
                    line,
                    descriptor: descriptor.to_owned(),
                })?;
                let width = typ.width() as i32;
                let index = self
                    .constants
                    .get_field_ref(&owner, name, descriptor)
                    .map_err(encoding(line))?;
                self.bytecode.add_index(opcode, index.into());
                self.bytecode.grow_stack(match opcode {
                    GETSTATIC => width,
                    PUTSTATIC => -width,
                    GETFIELD => width - 1,
                    _ => -width - 1,
                });
            }
            INVOKEVIRTUAL..=INVOKEINTERFACE => {
                let (owner, name, descriptor) = member(operands.word("method reference")?, line)?;
                let method = MethodDescriptor::parse(descriptor).map_err(|_| {
                    CompileError::BadDescriptor {
                        line,
                        descriptor: descriptor.to_owned(),
                    }
                })?;
                let is_interface = opcode == INVOKEINTERFACE;
                let index = self
                    .constants
                    .get_method_ref(&owner, name, descriptor, is_interface)
                    .map_err(encoding(line))?;
                self.bytecode.add_index(opcode, index.into());
                if is_interface {
                    let count = u8::try_from(method.parameter_length(true)).map_err(|_| {
                        operands.syntax(format!("too many arguments for '{}'", name))
                    })?;
                    self.bytecode.add(count);
                    self.bytecode.add(0);
                }
                self.bytecode
                    .grow_stack(method.stack_effect(opcode != INVOKESTATIC));
            }
            INVOKEDYNAMIC => {
                return Err(operands.syntax("invokedynamic is not supported".to_owned()));
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
                let class = self.class_constant(operands.word("class")?, line)?;
                self.bytecode.add_index(opcode, class.into());
            }
            NEWARRAY => {
                let element = operands.word("primitive type")?;
                let code = match element {
                    "boolean" => 4,
                    "char" => 5,
                    "float" => 6,
                    "double" => 7,
                    "byte" => 8,
                    "short" => 9,
                    "int" => 10,
                    "long" => 11,
                    other => {
                        return Err(CompileError::BadDescriptor {
                            line,
                            descriptor: other.to_owned(),
                        })
                    }
                };
                self.bytecode.add_opcode(NEWARRAY);
                self.bytecode.add(code);
            }
            MULTIANEWARRAY => {
                let class = self.class_constant(operands.word("array class")?, line)?;
                let dimensions = operands.int::<u8>("dimensions")?;
                if dimensions == 0 {
                    return Err(operands.syntax("an array needs at least one dimension".to_owned()));
                }
                self.bytecode.add_index(MULTIANEWARRAY, class.into());
                self.bytecode.add(dimensions);
                self.bytecode.grow_stack(1 - dimensions as i32);
            }
            WIDE => {
                let message = "'wide' is picked automatically for large operands".to_owned();
                return Err(operands.syntax(message));
            }
            _ => self.bytecode.add_opcode(opcode),
        }

        if matches!(
            opcode,
            GOTO | GOTO_W | ATHROW | RET | TABLESWITCH | LOOKUPSWITCH | IRETURN..=RETURN
        ) {
            self.reachable = false;
        }
        Ok(())
    }

    /// `tableswitch <low> <label>... default <label>`
    fn table_switch(&mut self, operands: &mut Operands) -> Result<(), CompileError> {
        let line = operands.line;
        let low = operands.int::<i32>("low key")?;
        let mut targets = vec![];
        while operands.peek_word() != Some("default") {
            targets.push(operands.word("label or 'default'")?);
        }
        operands.keyword("default")?;
        let default = operands.word("default label")?;
        if targets.is_empty() {
            return Err(operands.syntax("tableswitch needs at least one label".to_owned()));
        }
        let high = i32::try_from(low as i64 + targets.len() as i64 - 1)
            .map_err(|_| operands.syntax("too many tableswitch labels".to_owned()))?;

        let pos = self.switch_header(TABLESWITCH, default, line);
        self.bytecode.add_i32(low);
        self.bytecode.add_i32(high);
        for target in targets {
            self.switch_target(target, line, pos);
        }
        Ok(())
    }

    /// `lookupswitch <key>:<label>... default <label>`
    fn lookup_switch(&mut self, operands: &mut Operands) -> Result<(), CompileError> {
        let line = operands.line;
        let mut pairs = vec![];
        while operands.peek_word() != Some("default") {
            let pair = operands.word("key:label or 'default'")?;
            let (key, label) = pair
                .split_once(':')
                .and_then(|(key, label)| Some((i32::try_from(parse_int(key)?).ok()?, label)))
                .ok_or_else(|| operands.syntax(format!("expected key:label, found '{}'", pair)))?;
            pairs.push((key, label));
        }
        operands.keyword("default")?;
        let default = operands.word("default label")?;

        pairs.sort_by_key(|(key, _)| *key);
        if let Some(pair) = pairs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(operands.syntax(format!("duplicate lookupswitch key {}", pair[0].0)));
        }

        let pos = self.switch_header(LOOKUPSWITCH, default, line);
        self.bytecode.add_i32(pairs.len() as i32);
        for (key, label) in pairs {
            self.bytecode.add_i32(key);
            self.switch_target(label, line, pos);
        }
        Ok(())
    }

    /// Emit a switch opcode, its padding, and its default offset, returning the opcode position
    fn switch_header(&mut self, opcode: u8, default: &str, line: usize) -> usize {
        let pos = self.bytecode.current_pc();
        self.bytecode.add_opcode(opcode);
        for _ in 0..switch_padding(pos) {
            self.bytecode.add(0);
        }
        self.switch_target(default, line, pos);
        pos
    }

    fn switch_target(&mut self, label: &str, line: usize, instruction_pos: usize) {
        self.fixups.push(Fixup {
            line,
            label: label.to_owned(),
            instruction_pos,
            operand_pos: self.bytecode.current_pc(),
            wide: true,
        });
        self.bytecode.add_i32(0);
        self.expect_depth(label, self.bytecode.stack_depth());
    }

    /// Emit a placeholder offset for a branch whose opcode is at `instruction_pos`
    fn fixup(&mut self, label: &str, line: usize, instruction_pos: usize, wide: bool) {
        self.fixups.push(Fixup {
            line,
            label: label.to_owned(),
            instruction_pos,
            operand_pos: self.bytecode.current_pc(),
            wide,
        });
        if wide {
            self.bytecode.add_i32(0);
        } else {
            self.bytecode.add_u16(0);
        }
    }

    /// Record the stack depth on entry to a label, unless one is already known
    fn expect_depth(&mut self, label: &str, depth: i32) {
        let label = self.labels.entry(label.to_owned()).or_default();
        label.depth.get_or_insert(depth);
    }

    fn place_label(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        let pos = self.bytecode.current_pc();
        let label = self.labels.entry(name.to_owned()).or_default();
        if label.pos.is_some() {
            return Err(CompileError::DuplicateLabel {
                line,
                label: name.to_owned(),
            });
        }
        label.pos = Some(pos);
        match label.depth {
            Some(depth) if !self.reachable => self.bytecode.set_stack_depth(depth),
            None => label.depth = Some(self.bytecode.stack_depth()),
            _ => (),
        }
        self.reachable = true;
        Ok(())
    }

    fn label_pos(&self, name: &str, line: usize) -> Result<usize, CompileError> {
        self.labels
            .get(name)
            .and_then(|label| label.pos)
            .ok_or_else(|| CompileError::UndefinedLabel {
                line,
                label: name.to_owned(),
            })
    }

    /// Patch branch offsets and register exception handlers
    fn finish(self) -> Result<(), CompileError> {
        for fixup in &self.fixups {
            let target = self.label_pos(&fixup.label, fixup.line)?;
            let offset = target as i64 - fixup.instruction_pos as i64;
            if fixup.wide {
                self.bytecode.write_i32(fixup.operand_pos, offset as i32);
            } else {
                let offset = i16::try_from(offset).map_err(|_| CompileError::Syntax {
                    line: fixup.line,
                    message: format!("label '{}' is out of range, use goto_w", fixup.label),
                })?;
                self.bytecode.write_u16(fixup.operand_pos, offset as u16);
            }
        }

        for handler in &self.handlers {
            let start = self.label_pos(&handler.start, handler.line)?;
            let end = self.label_pos(&handler.end, handler.line)?;
            let target = self.label_pos(&handler.handler, handler.line)?;
            self.bytecode
                .add_exception_handler(start, end, target, handler.catch_type)
                .map_err(encoding(handler.line))?;
        }
        Ok(())
    }

    /// Local slot operand: a variable in scope or a raw slot number
    fn slot(&self, operands: &mut Operands) -> Result<usize, CompileError> {
        let word = operands.word("local variable")?;
        if let Some(slot) = parse_int(word) {
            return usize::try_from(slot)
                .map_err(|_| operands.syntax(format!("invalid local slot {}", slot)));
        }
        self.scope
            .lookup(word)
            .map(|variable| variable.slot)
            .ok_or_else(|| CompileError::UnknownVariable {
                line: operands.line,
                name: word.to_owned(),
            })
    }

    fn field_type(&self, name: &str, line: usize) -> Result<FieldType, CompileError> {
        parse_type_name(name).map_err(|_| CompileError::BadDescriptor {
            line,
            descriptor: name.to_owned(),
        })
    }

    /// Class constant for a class or array type name
    fn class_constant(&mut self, name: &str, line: usize) -> Result<ClassConstantIndex, CompileError> {
        let class_name = match self.field_type(name, line)? {
            FieldType::Ref(RefType::Object(class_name)) => class_name,
            array @ FieldType::Ref(RefType::Array(_)) => array.render(),
            FieldType::Base(_) => {
                return Err(CompileError::BadDescriptor {
                    line,
                    descriptor: name.to_owned(),
                })
            }
        };
        self.constants
            .get_class(class_name)
            .map_err(encoding(line))
    }

    /// Operand of `ldc`: a string, `int`, `float`, or class literal
    fn single_constant(&mut self, operands: &mut Operands) -> Result<ConstantIndex, CompileError> {
        let line = operands.line;
        let word = match operands.next("constant")? {
            Token::Str(string) => {
                let index = self
                    .constants
                    .get_string(string.as_str())
                    .map_err(encoding(line))?;
                return Ok(index.into());
            }
            Token::Word(word) => word.as_str(),
        };

        let result = if let Some(int) = parse_int(word) {
            let int = i32::try_from(int)
                .map_err(|_| operands.syntax(format!("{} does not fit in an int", int)))?;
            self.constants.get_integer(int)
        } else if let Some(float) = parse_float(word, &['f', 'F']) {
            self.constants.get_float(float as f32)
        } else {
            return self.class_constant(word, line).map(ConstantIndex::from);
        };
        result.map_err(encoding(line))
    }

    /// Operand of `ldc2_w`: a `long` or `double` literal
    fn double_constant(&mut self, operands: &mut Operands) -> Result<ConstantIndex, CompileError> {
        let line = operands.line;
        let word = operands.word("long or double constant")?;
        let long = word
            .strip_suffix(|c: char| c == 'L' || c == 'l')
            .unwrap_or(word);
        let result = if let Some(long) = parse_int(long) {
            self.constants.get_long(long)
        } else if let Some(double) = parse_float(word, &['d', 'D']) {
            self.constants.get_double(double)
        } else {
            return Err(operands.syntax(format!("expected long or double, found '{}'", word)));
        };
        result.map_err(encoding(line))
    }
}

/// Parse a floating point literal, with an optional type suffix
fn parse_float(word: &str, suffixes: &[char]) -> Option<f64> {
    let digits = word.strip_suffix(suffixes).unwrap_or(word);
    if !digits.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
        return None;
    }
    digits.parse::<f64>().ok()
}

/// Value kind for an offset within a typed opcode family (`iload`, `lload`, ...)
fn kind_of_family(offset: u8) -> ValueKind {
    match offset {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        3 => ValueKind::Double,
        _ => ValueKind::Reference,
    }
}

/// Split `Owner.name:Descriptor`, normalizing dots in the owner to slashes
fn member(word: &str, line: usize) -> Result<(String, &str, &str), CompileError> {
    word.split_once(':')
        .and_then(|(path, descriptor)| {
            let (owner, name) = path.rsplit_once('.')?;
            Some((owner.replace('.', "/"), name, descriptor))
        })
        .filter(|(owner, name, descriptor)| {
            !owner.is_empty() && !name.is_empty() && !descriptor.is_empty()
        })
        .ok_or_else(|| CompileError::Syntax {
            line,
            message: format!("expected Owner.name:Descriptor, found '{}'", word),
        })
}
