//! Fixture classes and a tiny interpreter for running patched methods
//!
//! The interpreter covers the instructions used by the fixtures and by the snippets in the
//! tests. It panics on anything it does not understand, and also when a method uses more stack
//! or locals than its `Code` attribute declares. It does not track initialization of objects, so
//! tests on constructors check handler ranges against the `super()` call themselves.

#![allow(dead_code)]

use classpatch::jvm::class_file::{
    ClassConstantIndex, ClassFile, Constant, ConstantIndex, ConstantPool, Method, Version,
};
use classpatch::jvm::code::opcodes::*;
use classpatch::jvm::code::Code;
use classpatch::jvm::{ClassAccessFlags, MethodAccessFlags};

pub const CLASS_NAME: &str = "Fixture";

/// Exception thrown by `idiv` when dividing by zero
pub const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";

pub struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    pub fn new(version: Version) -> ClassBuilder {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(CLASS_NAME).unwrap();
        let super_class = constants.get_class("java/lang/Object").unwrap();
        ClassBuilder {
            class: ClassFile {
                version,
                constants,
                access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
                this_class,
                super_class,
                interfaces: vec![],
                fields: vec![],
                methods: vec![],
                attributes: vec![],
            },
        }
    }

    /// Add a method with a body
    ///
    /// `handlers` are `(start, end, handler, catch type)` with `None` catching everything.
    pub fn method(
        mut self,
        flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        bytes: Vec<u8>,
        handlers: &[(usize, usize, usize, Option<&str>)],
    ) -> ClassBuilder {
        let constants = &mut self.class.constants;
        let mut code = Code::new(max_stack, max_locals, bytes);
        for (start, end, handler, catch_type) in handlers {
            let catch_type = match catch_type {
                None => ClassConstantIndex::NONE,
                Some(class) => constants.get_class(*class).unwrap(),
            };
            code.exception_table
                .add(*start, *end, *handler, catch_type)
                .unwrap();
        }
        let mut method = Method {
            access_flags: flags,
            name_index: constants.get_utf8(name).unwrap(),
            descriptor_index: constants.get_utf8(descriptor).unwrap(),
            attributes: vec![],
        };
        method.set_code(&code, constants).unwrap();
        self.class.methods.push(method);
        self
    }

    /// Add a method without a body
    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> ClassBuilder {
        let constants = &mut self.class.constants;
        self.class.methods.push(Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
            name_index: constants.get_utf8(name).unwrap(),
            descriptor_index: constants.get_utf8(descriptor).unwrap(),
            attributes: vec![],
        });
        self
    }

    pub fn build(self) -> ClassFile {
        self.class
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.class.to_bytes().unwrap()
    }
}

const STATIC: MethodAccessFlags = MethodAccessFlags::STATIC;

/// Class with one method per situation the tests care about
///
///   - `static sign(I)I`: two returns behind a branch
///   - `static countdown(I)I`: loop jumping back to the first instruction
///   - `static divide(II)I`: throws `ArithmeticException` on zero
///   - `static risky(I)I`: throws `IllegalStateException` on zero
///   - `total(J)J`: instance method on `long`s
///   - `static greet()V`: prints "hi"
///   - `static pick(I)I`: `tableswitch` over 0 and 1
///   - `static compute()I`: returns 1
///   - `shape()I`: abstract
///   - `<init>(I)V`: calls `super()`, then divides 10 by its argument
pub fn fixture(version: Version) -> ClassBuilder {
    ClassBuilder::new(version)
        .method(
            STATIC,
            "sign",
            "(I)I",
            1,
            1,
            vec![ILOAD_0, IFLE, 0, 5, ICONST_1, IRETURN, ICONST_M1, IRETURN],
            &[],
        )
        .method(
            STATIC,
            "countdown",
            "(I)I",
            1,
            1,
            vec![
                ILOAD_0, IFLE, 0, 9, IINC, 0, 0xFF, GOTO, 0xFF, 0xF9, ILOAD_0, IRETURN,
            ],
            &[],
        )
        .method(
            STATIC,
            "divide",
            "(II)I",
            2,
            2,
            vec![ILOAD_0, ILOAD_1, IDIV, IRETURN],
            &[],
        )
        .risky()
        .method(
            MethodAccessFlags::PUBLIC,
            "total",
            "(J)J",
            4,
            3,
            vec![LLOAD_1, LCONST_1, LADD, LRETURN],
            &[],
        )
        .greet()
        .method(
            STATIC,
            "pick",
            "(I)I",
            1,
            1,
            vec![
                ILOAD_0, TABLESWITCH, 0, 0, 0, 0, 0, 29, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 23, 0, 0,
                0, 26, BIPUSH, 10, IRETURN, BIPUSH, 20, IRETURN, ICONST_M1, IRETURN,
            ],
            &[],
        )
        .method(STATIC, "compute", "()I", 1, 0, vec![ICONST_1, IRETURN], &[])
        .abstract_method("shape", "()I")
        .constructor()
}

impl ClassBuilder {
    fn risky(mut self) -> ClassBuilder {
        let constants = &mut self.class.constants;
        let class = constants
            .get_class("java/lang/IllegalStateException")
            .unwrap();
        let init = constants
            .get_method_ref("java/lang/IllegalStateException", "<init>", "()V", false)
            .unwrap();
        let [class_hi, class_lo] = (class.0).0.to_be_bytes();
        let [init_hi, init_lo] = (init.0).0.to_be_bytes();
        // if ($1 == 0) throw new IllegalStateException(); return $1;
        let bytes = vec![
            ILOAD_0, IFNE, 0, 11, NEW, class_hi, class_lo, DUP, INVOKESPECIAL, init_hi, init_lo,
            ATHROW, ILOAD_0, IRETURN,
        ];
        self.method(STATIC, "risky", "(I)I", 2, 1, bytes, &[])
    }

    fn constructor(mut self) -> ClassBuilder {
        let init = self
            .class
            .constants
            .get_method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap();
        let [init_hi, init_lo] = (init.0).0.to_be_bytes();
        let bytes = vec![
            ALOAD_0, INVOKESPECIAL, init_hi, init_lo, BIPUSH, 10, ILOAD_1, IDIV, POP, RETURN,
        ];
        self.method(MethodAccessFlags::PUBLIC, "<init>", "(I)V", 2, 2, bytes, &[])
    }

    fn greet(mut self) -> ClassBuilder {
        let constants = &mut self.class.constants;
        let out = constants
            .get_field_ref("java/lang/System", "out", "Ljava/io/PrintStream;")
            .unwrap();
        let hi = constants.get_string("hi").unwrap();
        let println = constants
            .get_method_ref(
                "java/io/PrintStream",
                "println",
                "(Ljava/lang/String;)V",
                false,
            )
            .unwrap();
        let [out_hi, out_lo] = (out.0).0.to_be_bytes();
        let [println_hi, println_lo] = (println.0).0.to_be_bytes();
        let hi = u8::try_from((hi.0).0).unwrap();
        let bytes = vec![
            GETSTATIC, out_hi, out_lo, LDC, hi, INVOKEVIRTUAL, println_hi, println_lo, RETURN,
        ];
        self.method(STATIC, "greet", "()V", 2, 0, bytes, &[])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Null,
    Str(String),

    /// Instance of a class (the tests never look inside objects)
    Object(String),
    ReturnAddress(usize),

    /// Second half of a `long` in the locals
    Top,
}

impl Value {
    fn width(&self) -> usize {
        match self {
            Value::Long(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),

    /// Uncaught exception, by class name
    Threw(String),
}

/// Result of running a method: how it completed, and what it printed
#[derive(Debug)]
pub struct Run {
    pub outcome: Outcome,
    pub printed: Vec<String>,
}

/// Does a handler for `catch_type` catch an exception of class `thrown`?
fn catches(catch_type: &str, thrown: &str) -> bool {
    catch_type == thrown || catch_type == "java/lang/Throwable" || catch_type == "java/lang/Exception"
}

/// Run a method of a class file
pub fn run(class: &[u8], name: &str, descriptor: &str, args: Vec<Value>) -> Run {
    let class = ClassFile::parse(class).unwrap();
    let index = class.find_method(name, Some(descriptor)).unwrap();
    let code = class.methods[index]
        .code(&class.constants)
        .unwrap()
        .expect("method has no code");
    Interpreter::new(&class.constants, &code, args).run()
}

struct Interpreter<'a> {
    constants: &'a ConstantPool,
    code: &'a Code,
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    printed: Vec<String>,
}

impl<'a> Interpreter<'a> {
    fn new(constants: &'a ConstantPool, code: &'a Code, args: Vec<Value>) -> Interpreter<'a> {
        let mut interpreter = Interpreter {
            constants,
            code,
            stack: vec![],
            locals: vec![None; code.max_locals as usize],
            printed: vec![],
        };
        let mut slot = 0;
        for arg in args {
            let width = arg.width();
            interpreter.store(slot, arg);
            slot += width;
        }
        interpreter
    }

    fn depth(&self) -> usize {
        self.stack.iter().map(Value::width).sum()
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
        assert!(
            self.depth() <= self.code.max_stack as usize,
            "stack depth {} exceeds max_stack {}",
            self.depth(),
            self.code.max_stack
        );
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn pop_int(&mut self) -> i32 {
        match self.pop() {
            Value::Int(i) => i,
            other => panic!("expected an int, found {:?}", other),
        }
    }

    fn pop_long(&mut self) -> i64 {
        match self.pop() {
            Value::Long(l) => l,
            other => panic!("expected a long, found {:?}", other),
        }
    }

    fn load(&mut self, slot: usize) -> Value {
        match self.locals.get(slot) {
            Some(Some(value)) if *value != Value::Top => value.clone(),
            other => panic!("reading local {} holding {:?}", slot, other),
        }
    }

    fn store(&mut self, slot: usize, value: Value) {
        let width = value.width();
        assert!(
            slot + width <= self.locals.len(),
            "local {} exceeds max_locals {}",
            slot,
            self.locals.len()
        );
        if width == 2 {
            self.locals[slot + 1] = Some(Value::Top);
        }
        self.locals[slot] = Some(value);
    }

    fn u8_at(&self, pos: usize) -> u8 {
        self.code.bytes[pos]
    }

    fn i16_at(&self, pos: usize) -> i16 {
        i16::from_be_bytes([self.code.bytes[pos], self.code.bytes[pos + 1]])
    }

    fn i32_at(&self, pos: usize) -> i32 {
        let b = &self.code.bytes[pos..pos + 4];
        i32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn constant(&self, pos: usize) -> &'a Constant {
        let index = ConstantIndex(self.i16_at(pos) as u16);
        self.constants.get(index).unwrap()
    }

    /// Owner, name, and descriptor of the member referenced at `pos`
    fn member(&self, pos: usize) -> (&'a str, &'a str, &'a str) {
        let (class, name_and_type) = match self.constant(pos) {
            Constant::FieldRef(class, name_and_type) => (*class, *name_and_type),
            Constant::MethodRef {
                class,
                name_and_type,
                ..
            } => (*class, *name_and_type),
            other => panic!("expected a member reference, found {:?}", other),
        };
        let owner = self.constants.class_name(class).unwrap();
        match self.constants.get(name_and_type.0).unwrap() {
            Constant::NameAndType { name, descriptor } => (
                owner,
                self.constants.utf8(*name).unwrap(),
                self.constants.utf8(*descriptor).unwrap(),
            ),
            other => panic!("expected a name and type, found {:?}", other),
        }
    }

    fn class_at(&self, pos: usize) -> &'a str {
        let index = ConstantIndex(self.i16_at(pos) as u16);
        self.constants.class_name(ClassConstantIndex(index)).unwrap()
    }

    /// Where to continue after an exception is thrown at `pc`, if anywhere
    fn handler(&self, pc: usize, thrown: &str) -> Option<usize> {
        self.code
            .exception_table
            .iter()
            .find(|handler| {
                handler.covers(pc)
                    && (handler.is_catch_all()
                        || catches(self.constants.class_name(handler.catch_type).unwrap(), thrown))
            })
            .map(|handler| handler.handler_pc as usize)
    }

    fn run(mut self) -> Run {
        let mut pc = 0;
        for _ in 0..1_000_000 {
            assert!(pc < self.code.bytes.len(), "fell off the end of the code");
            let opcode = self.code.bytes[pc];
            let mut next = pc + instruction_length(&self.code.bytes, pc).unwrap();
            let mut thrown: Option<String> = None;

            match opcode {
                NOP => (),
                ACONST_NULL => self.push(Value::Null),
                ICONST_M1..=ICONST_5 => self.push(Value::Int(opcode as i32 - ICONST_0 as i32)),
                LCONST_0 | LCONST_1 => self.push(Value::Long((opcode - LCONST_0) as i64)),
                BIPUSH => self.push(Value::Int(self.u8_at(pc + 1) as i8 as i32)),
                SIPUSH => self.push(Value::Int(self.i16_at(pc + 1) as i32)),
                LDC | LDC_W => {
                    let index = if opcode == LDC {
                        self.u8_at(pc + 1) as u16
                    } else {
                        self.i16_at(pc + 1) as u16
                    };
                    let value = match self.constants.get(ConstantIndex(index)).unwrap() {
                        Constant::Integer(i) => Value::Int(*i),
                        Constant::String(utf8) => {
                            Value::Str(self.constants.utf8(*utf8).unwrap().to_owned())
                        }
                        other => panic!("unsupported constant {:?}", other),
                    };
                    self.push(value);
                }
                LDC2_W => match self.constant(pc + 1) {
                    Constant::Long(l) => self.push(Value::Long(*l)),
                    other => panic!("unsupported constant {:?}", other),
                },
                ILOAD | LLOAD | ALOAD => {
                    let value = self.load(self.u8_at(pc + 1) as usize);
                    self.push(value);
                }
                ILOAD_0..=ALOAD_3 => {
                    let value = self.load(((opcode - ILOAD_0) % 4) as usize);
                    self.push(value);
                }
                ISTORE | LSTORE | ASTORE => {
                    let value = self.pop();
                    self.store(self.u8_at(pc + 1) as usize, value);
                }
                ISTORE_0..=ASTORE_3 => {
                    let value = self.pop();
                    self.store(((opcode - ISTORE_0) % 4) as usize, value);
                }
                POP => {
                    self.pop();
                }
                DUP => {
                    let value = self.pop();
                    self.push(value.clone());
                    self.push(value);
                }
                IADD | ISUB | IMUL => {
                    let (b, a) = (self.pop_int(), self.pop_int());
                    self.push(Value::Int(match opcode {
                        IADD => a.wrapping_add(b),
                        ISUB => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    }));
                }
                IDIV => {
                    let (b, a) = (self.pop_int(), self.pop_int());
                    if b == 0 {
                        thrown = Some(ARITHMETIC_EXCEPTION.to_owned());
                    } else {
                        self.push(Value::Int(a.wrapping_div(b)));
                    }
                }
                LADD => {
                    let (b, a) = (self.pop_long(), self.pop_long());
                    self.push(Value::Long(a.wrapping_add(b)));
                }
                IINC => {
                    let slot = self.u8_at(pc + 1) as usize;
                    let delta = self.u8_at(pc + 2) as i8 as i32;
                    match self.load(slot) {
                        Value::Int(i) => self.store(slot, Value::Int(i + delta)),
                        other => panic!("iinc on {:?}", other),
                    }
                }
                IFEQ..=IFLE => {
                    let value = self.pop_int();
                    let taken = match opcode {
                        IFEQ => value == 0,
                        IFNE => value != 0,
                        IFLT => value < 0,
                        IFGE => value >= 0,
                        IFGT => value > 0,
                        _ => value <= 0,
                    };
                    if taken {
                        next = (pc as isize + self.i16_at(pc + 1) as isize) as usize;
                    }
                }
                IF_ICMPEQ..=IF_ICMPLE => {
                    let (b, a) = (self.pop_int(), self.pop_int());
                    let taken = match opcode {
                        IF_ICMPEQ => a == b,
                        IF_ICMPNE => a != b,
                        IF_ICMPLT => a < b,
                        IF_ICMPGE => a >= b,
                        IF_ICMPGT => a > b,
                        _ => a <= b,
                    };
                    if taken {
                        next = (pc as isize + self.i16_at(pc + 1) as isize) as usize;
                    }
                }
                IFNULL | IFNONNULL => {
                    let is_null = self.pop() == Value::Null;
                    if is_null == (opcode == IFNULL) {
                        next = (pc as isize + self.i16_at(pc + 1) as isize) as usize;
                    }
                }
                GOTO => next = (pc as isize + self.i16_at(pc + 1) as isize) as usize,
                GOTO_W => next = (pc as isize + self.i32_at(pc + 1) as isize) as usize,
                JSR => {
                    self.push(Value::ReturnAddress(next));
                    next = (pc as isize + self.i16_at(pc + 1) as isize) as usize;
                }
                JSR_W => {
                    self.push(Value::ReturnAddress(next));
                    next = (pc as isize + self.i32_at(pc + 1) as isize) as usize;
                }
                RET => match self.load(self.u8_at(pc + 1) as usize) {
                    Value::ReturnAddress(address) => next = address,
                    other => panic!("ret to {:?}", other),
                },
                TABLESWITCH => {
                    let base = pc + 1 + switch_padding(pc);
                    let default = self.i32_at(base);
                    let low = self.i32_at(base + 4);
                    let high = self.i32_at(base + 8);
                    let key = self.pop_int();
                    let offset = if low <= key && key <= high {
                        self.i32_at(base + 12 + 4 * (key - low) as usize)
                    } else {
                        default
                    };
                    next = (pc as isize + offset as isize) as usize;
                }
                LOOKUPSWITCH => {
                    let base = pc + 1 + switch_padding(pc);
                    let pairs = self.i32_at(base + 4) as usize;
                    let key = self.pop_int();
                    let offset = (0..pairs)
                        .map(|i| base + 8 + 8 * i)
                        .find(|pos| self.i32_at(*pos) == key)
                        .map_or(self.i32_at(base), |pos| self.i32_at(pos + 4));
                    next = (pc as isize + offset as isize) as usize;
                }
                IRETURN | LRETURN | ARETURN => {
                    let value = self.pop();
                    return self.finish(Outcome::Returned(Some(value)));
                }
                RETURN => return self.finish(Outcome::Returned(None)),
                GETSTATIC => match self.member(pc + 1) {
                    ("java/lang/System", "out", _) => {
                        self.push(Value::Object("java/io/PrintStream".to_owned()))
                    }
                    other => panic!("unsupported field {:?}", other),
                },
                INVOKEVIRTUAL => match self.member(pc + 1) {
                    ("java/io/PrintStream", "println", descriptor) => {
                        let line = match self.pop() {
                            Value::Int(i) => i.to_string(),
                            Value::Long(l) => l.to_string(),
                            Value::Str(s) => s,
                            Value::Null => "null".to_owned(),
                            other => panic!("printing {:?} with {}", other, descriptor),
                        };
                        self.pop();
                        self.printed.push(line);
                    }
                    other => panic!("unsupported method {:?}", other),
                },
                INVOKESPECIAL => match self.member(pc + 1) {
                    (_, "<init>", "()V") => {
                        self.pop();
                    }
                    other => panic!("unsupported method {:?}", other),
                },
                NEW => {
                    let class = self.class_at(pc + 1).to_owned();
                    self.push(Value::Object(class));
                }
                CHECKCAST => (),
                ATHROW => match self.pop() {
                    Value::Object(class) => thrown = Some(class),
                    Value::Null => thrown = Some("java/lang/NullPointerException".to_owned()),
                    other => panic!("throwing {:?}", other),
                },
                _ => panic!(
                    "unsupported opcode {} at {}",
                    mnemonic(opcode).unwrap_or("?"),
                    pc
                ),
            }

            if let Some(class) = thrown {
                match self.handler(pc, &class) {
                    Some(handler) => {
                        self.stack.clear();
                        self.push(Value::Object(class));
                        next = handler;
                    }
                    None => return self.finish(Outcome::Threw(class)),
                }
            }
            pc = next;
        }
        panic!("method did not finish")
    }

    fn finish(self, outcome: Outcome) -> Run {
        Run {
            outcome,
            printed: self.printed,
        }
    }
}

/// Body of a method in a serialized class
pub fn code_of(class: &[u8], name: &str) -> Code {
    let class = ClassFile::parse(class).unwrap();
    let index = class.find_method(name, None).unwrap();
    class.methods[index]
        .code(&class.constants)
        .unwrap()
        .expect("method has no code")
}

/// Offsets of every instruction with this opcode
pub fn positions_of(code: &Code, opcode: u8) -> Vec<usize> {
    code.instruction_starts()
        .unwrap()
        .into_iter()
        .filter(|pos| code.bytes[*pos] == opcode)
        .collect()
}

pub fn returned(value: Value) -> Outcome {
    Outcome::Returned(Some(value))
}

pub fn threw(class: &str) -> Outcome {
    Outcome::Threw(class.to_owned())
}
