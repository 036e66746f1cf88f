//! Opcode constants and per-opcode facts (mnemonics, lengths, stack growth)
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-6.html

use crate::jvm::Error;

macro_rules! opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal, $grow:literal;)*) => {
        $(pub const $name: u8 = $code;)*

        /// Mnemonic of an opcode, if it is a valid one
        pub fn mnemonic(opcode: u8) -> Option<&'static str> {
            match opcode {
                $($code => Some($mnemonic),)*
                _ => None,
            }
        }

        /// Opcode for a (lowercase) mnemonic
        pub fn from_mnemonic(mnemonic: &str) -> Option<u8> {
            match mnemonic {
                $($mnemonic => Some($code),)*
                _ => None,
            }
        }

        /// Change in operand stack depth caused by executing an opcode
        ///
        /// Field accesses, invocations, and `multianewarray` depend on their operands, so they are
        /// reported as 0 here and the caller accounts for them.
        pub fn stack_growth(opcode: u8) -> i32 {
            match opcode {
                $($code => $grow,)*
                _ => 0,
            }
        }
    };
}

opcodes! {
    NOP = 0x00, "nop", 0;
    ACONST_NULL = 0x01, "aconst_null", 1;
    ICONST_M1 = 0x02, "iconst_m1", 1;
    ICONST_0 = 0x03, "iconst_0", 1;
    ICONST_1 = 0x04, "iconst_1", 1;
    ICONST_2 = 0x05, "iconst_2", 1;
    ICONST_3 = 0x06, "iconst_3", 1;
    ICONST_4 = 0x07, "iconst_4", 1;
    ICONST_5 = 0x08, "iconst_5", 1;
    LCONST_0 = 0x09, "lconst_0", 2;
    LCONST_1 = 0x0a, "lconst_1", 2;
    FCONST_0 = 0x0b, "fconst_0", 1;
    FCONST_1 = 0x0c, "fconst_1", 1;
    FCONST_2 = 0x0d, "fconst_2", 1;
    DCONST_0 = 0x0e, "dconst_0", 2;
    DCONST_1 = 0x0f, "dconst_1", 2;
    BIPUSH = 0x10, "bipush", 1;
    SIPUSH = 0x11, "sipush", 1;
    LDC = 0x12, "ldc", 1;
    LDC_W = 0x13, "ldc_w", 1;
    LDC2_W = 0x14, "ldc2_w", 2;
    ILOAD = 0x15, "iload", 1;
    LLOAD = 0x16, "lload", 2;
    FLOAD = 0x17, "fload", 1;
    DLOAD = 0x18, "dload", 2;
    ALOAD = 0x19, "aload", 1;
    ILOAD_0 = 0x1a, "iload_0", 1;
    ILOAD_1 = 0x1b, "iload_1", 1;
    ILOAD_2 = 0x1c, "iload_2", 1;
    ILOAD_3 = 0x1d, "iload_3", 1;
    LLOAD_0 = 0x1e, "lload_0", 2;
    LLOAD_1 = 0x1f, "lload_1", 2;
    LLOAD_2 = 0x20, "lload_2", 2;
    LLOAD_3 = 0x21, "lload_3", 2;
    FLOAD_0 = 0x22, "fload_0", 1;
    FLOAD_1 = 0x23, "fload_1", 1;
    FLOAD_2 = 0x24, "fload_2", 1;
    FLOAD_3 = 0x25, "fload_3", 1;
    DLOAD_0 = 0x26, "dload_0", 2;
    DLOAD_1 = 0x27, "dload_1", 2;
    DLOAD_2 = 0x28, "dload_2", 2;
    DLOAD_3 = 0x29, "dload_3", 2;
    ALOAD_0 = 0x2a, "aload_0", 1;
    ALOAD_1 = 0x2b, "aload_1", 1;
    ALOAD_2 = 0x2c, "aload_2", 1;
    ALOAD_3 = 0x2d, "aload_3", 1;
    IALOAD = 0x2e, "iaload", -1;
    LALOAD = 0x2f, "laload", 0;
    FALOAD = 0x30, "faload", -1;
    DALOAD = 0x31, "daload", 0;
    AALOAD = 0x32, "aaload", -1;
    BALOAD = 0x33, "baload", -1;
    CALOAD = 0x34, "caload", -1;
    SALOAD = 0x35, "saload", -1;
    ISTORE = 0x36, "istore", -1;
    LSTORE = 0x37, "lstore", -2;
    FSTORE = 0x38, "fstore", -1;
    DSTORE = 0x39, "dstore", -2;
    ASTORE = 0x3a, "astore", -1;
    ISTORE_0 = 0x3b, "istore_0", -1;
    ISTORE_1 = 0x3c, "istore_1", -1;
    ISTORE_2 = 0x3d, "istore_2", -1;
    ISTORE_3 = 0x3e, "istore_3", -1;
    LSTORE_0 = 0x3f, "lstore_0", -2;
    LSTORE_1 = 0x40, "lstore_1", -2;
    LSTORE_2 = 0x41, "lstore_2", -2;
    LSTORE_3 = 0x42, "lstore_3", -2;
    FSTORE_0 = 0x43, "fstore_0", -1;
    FSTORE_1 = 0x44, "fstore_1", -1;
    FSTORE_2 = 0x45, "fstore_2", -1;
    FSTORE_3 = 0x46, "fstore_3", -1;
    DSTORE_0 = 0x47, "dstore_0", -2;
    DSTORE_1 = 0x48, "dstore_1", -2;
    DSTORE_2 = 0x49, "dstore_2", -2;
    DSTORE_3 = 0x4a, "dstore_3", -2;
    ASTORE_0 = 0x4b, "astore_0", -1;
    ASTORE_1 = 0x4c, "astore_1", -1;
    ASTORE_2 = 0x4d, "astore_2", -1;
    ASTORE_3 = 0x4e, "astore_3", -1;
    IASTORE = 0x4f, "iastore", -3;
    LASTORE = 0x50, "lastore", -4;
    FASTORE = 0x51, "fastore", -3;
    DASTORE = 0x52, "dastore", -4;
    AASTORE = 0x53, "aastore", -3;
    BASTORE = 0x54, "bastore", -3;
    CASTORE = 0x55, "castore", -3;
    SASTORE = 0x56, "sastore", -3;
    POP = 0x57, "pop", -1;
    POP2 = 0x58, "pop2", -2;
    DUP = 0x59, "dup", 1;
    DUP_X1 = 0x5a, "dup_x1", 1;
    DUP_X2 = 0x5b, "dup_x2", 1;
    DUP2 = 0x5c, "dup2", 2;
    DUP2_X1 = 0x5d, "dup2_x1", 2;
    DUP2_X2 = 0x5e, "dup2_x2", 2;
    SWAP = 0x5f, "swap", 0;
    IADD = 0x60, "iadd", -1;
    LADD = 0x61, "ladd", -2;
    FADD = 0x62, "fadd", -1;
    DADD = 0x63, "dadd", -2;
    ISUB = 0x64, "isub", -1;
    LSUB = 0x65, "lsub", -2;
    FSUB = 0x66, "fsub", -1;
    DSUB = 0x67, "dsub", -2;
    IMUL = 0x68, "imul", -1;
    LMUL = 0x69, "lmul", -2;
    FMUL = 0x6a, "fmul", -1;
    DMUL = 0x6b, "dmul", -2;
    IDIV = 0x6c, "idiv", -1;
    LDIV = 0x6d, "ldiv", -2;
    FDIV = 0x6e, "fdiv", -1;
    DDIV = 0x6f, "ddiv", -2;
    IREM = 0x70, "irem", -1;
    LREM = 0x71, "lrem", -2;
    FREM = 0x72, "frem", -1;
    DREM = 0x73, "drem", -2;
    INEG = 0x74, "ineg", 0;
    LNEG = 0x75, "lneg", 0;
    FNEG = 0x76, "fneg", 0;
    DNEG = 0x77, "dneg", 0;
    ISHL = 0x78, "ishl", -1;
    LSHL = 0x79, "lshl", -1;
    ISHR = 0x7a, "ishr", -1;
    LSHR = 0x7b, "lshr", -1;
    IUSHR = 0x7c, "iushr", -1;
    LUSHR = 0x7d, "lushr", -1;
    IAND = 0x7e, "iand", -1;
    LAND = 0x7f, "land", -2;
    IOR = 0x80, "ior", -1;
    LOR = 0x81, "lor", -2;
    IXOR = 0x82, "ixor", -1;
    LXOR = 0x83, "lxor", -2;
    IINC = 0x84, "iinc", 0;
    I2L = 0x85, "i2l", 1;
    I2F = 0x86, "i2f", 0;
    I2D = 0x87, "i2d", 1;
    L2I = 0x88, "l2i", -1;
    L2F = 0x89, "l2f", -1;
    L2D = 0x8a, "l2d", 0;
    F2I = 0x8b, "f2i", 0;
    F2L = 0x8c, "f2l", 1;
    F2D = 0x8d, "f2d", 1;
    D2I = 0x8e, "d2i", -1;
    D2L = 0x8f, "d2l", 0;
    D2F = 0x90, "d2f", -1;
    I2B = 0x91, "i2b", 0;
    I2C = 0x92, "i2c", 0;
    I2S = 0x93, "i2s", 0;
    LCMP = 0x94, "lcmp", -3;
    FCMPL = 0x95, "fcmpl", -1;
    FCMPG = 0x96, "fcmpg", -1;
    DCMPL = 0x97, "dcmpl", -3;
    DCMPG = 0x98, "dcmpg", -3;
    IFEQ = 0x99, "ifeq", -1;
    IFNE = 0x9a, "ifne", -1;
    IFLT = 0x9b, "iflt", -1;
    IFGE = 0x9c, "ifge", -1;
    IFGT = 0x9d, "ifgt", -1;
    IFLE = 0x9e, "ifle", -1;
    IF_ICMPEQ = 0x9f, "if_icmpeq", -2;
    IF_ICMPNE = 0xa0, "if_icmpne", -2;
    IF_ICMPLT = 0xa1, "if_icmplt", -2;
    IF_ICMPGE = 0xa2, "if_icmpge", -2;
    IF_ICMPGT = 0xa3, "if_icmpgt", -2;
    IF_ICMPLE = 0xa4, "if_icmple", -2;
    IF_ACMPEQ = 0xa5, "if_acmpeq", -2;
    IF_ACMPNE = 0xa6, "if_acmpne", -2;
    GOTO = 0xa7, "goto", 0;
    JSR = 0xa8, "jsr", 1;
    RET = 0xa9, "ret", 0;
    TABLESWITCH = 0xaa, "tableswitch", -1;
    LOOKUPSWITCH = 0xab, "lookupswitch", -1;
    IRETURN = 0xac, "ireturn", -1;
    LRETURN = 0xad, "lreturn", -2;
    FRETURN = 0xae, "freturn", -1;
    DRETURN = 0xaf, "dreturn", -2;
    ARETURN = 0xb0, "areturn", -1;
    RETURN = 0xb1, "return", 0;
    GETSTATIC = 0xb2, "getstatic", 0;
    PUTSTATIC = 0xb3, "putstatic", 0;
    GETFIELD = 0xb4, "getfield", 0;
    PUTFIELD = 0xb5, "putfield", 0;
    INVOKEVIRTUAL = 0xb6, "invokevirtual", 0;
    INVOKESPECIAL = 0xb7, "invokespecial", 0;
    INVOKESTATIC = 0xb8, "invokestatic", 0;
    INVOKEINTERFACE = 0xb9, "invokeinterface", 0;
    INVOKEDYNAMIC = 0xba, "invokedynamic", 0;
    NEW = 0xbb, "new", 1;
    NEWARRAY = 0xbc, "newarray", 0;
    ANEWARRAY = 0xbd, "anewarray", 0;
    ARRAYLENGTH = 0xbe, "arraylength", 0;
    ATHROW = 0xbf, "athrow", -1;
    CHECKCAST = 0xc0, "checkcast", 0;
    INSTANCEOF = 0xc1, "instanceof", 0;
    MONITORENTER = 0xc2, "monitorenter", -1;
    MONITOREXIT = 0xc3, "monitorexit", -1;
    WIDE = 0xc4, "wide", 0;
    MULTIANEWARRAY = 0xc5, "multianewarray", 0;
    IFNULL = 0xc6, "ifnull", -1;
    IFNONNULL = 0xc7, "ifnonnull", -1;
    GOTO_W = 0xc8, "goto_w", 0;
    JSR_W = 0xc9, "jsr_w", 1;
}

/// Does the opcode have an effect on the stack that can only be computed from its operands?
pub fn has_variable_stack_growth(opcode: u8) -> bool {
    matches!(opcode, GETSTATIC..=INVOKEDYNAMIC | MULTIANEWARRAY)
}

/// Length of instructions whose size does not depend on their position or operands
fn fixed_length(opcode: u8) -> Option<usize> {
    let len = match opcode {
        BIPUSH | LDC | ILOAD..=ALOAD | ISTORE..=ASTORE | RET | NEWARRAY => 2,
        SIPUSH | LDC_W | LDC2_W | IINC | IFEQ..=JSR | GETSTATIC..=INVOKESTATIC | NEW
        | ANEWARRAY | CHECKCAST | INSTANCEOF | IFNULL | IFNONNULL => 3,
        MULTIANEWARRAY => 4,
        INVOKEINTERFACE | INVOKEDYNAMIC | GOTO_W | JSR_W => 5,
        NOP..=DCONST_1
        | ILOAD_0..=SALOAD
        | ISTORE_0..=LXOR
        | I2L..=DCMPG
        | IRETURN..=RETURN
        | ARRAYLENGTH
        | ATHROW
        | MONITORENTER
        | MONITOREXIT => 1,
        _ => return None,
    };
    Some(len)
}

/// Padding bytes following a `tableswitch` or `lookupswitch` opcode at `pos`
pub fn switch_padding(pos: usize) -> usize {
    3 - (pos & 3)
}

/// Length in bytes of the instruction starting at `pos`
pub fn instruction_length(code: &[u8], pos: usize) -> Result<usize, Error> {
    let opcode = *code.get(pos).ok_or(Error::TruncatedInstruction(pos))?;
    let len = match opcode {
        TABLESWITCH => {
            let base = pos + 1 + switch_padding(pos);
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(Error::MalformedSwitch(pos));
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            base + 12 + 4 * count - pos
        }
        LOOKUPSWITCH => {
            let base = pos + 1 + switch_padding(pos);
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 {
                return Err(Error::MalformedSwitch(pos));
            }
            base + 8 + 8 * npairs as usize - pos
        }
        WIDE => match code.get(pos + 1).copied() {
            Some(IINC) => 6,
            Some(ILOAD..=ALOAD | ISTORE..=ASTORE | RET) => 4,
            Some(other) => {
                return Err(Error::UnknownOpcode {
                    offset: pos + 1,
                    opcode: other,
                })
            }
            None => return Err(Error::TruncatedInstruction(pos)),
        },
        _ => fixed_length(opcode).ok_or(Error::UnknownOpcode {
            offset: pos,
            opcode,
        })?,
    };
    if pos + len > code.len() {
        return Err(Error::TruncatedInstruction(pos));
    }
    Ok(len)
}

fn read_i32(code: &[u8], pos: usize) -> Result<i32, Error> {
    match code.get(pos..pos + 4) {
        Some(bytes) => Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(Error::TruncatedInstruction(pos)),
    }
}

/// Is this one of the `xreturn` instructions?
pub fn is_return(opcode: u8) -> bool {
    (IRETURN..=RETURN).contains(&opcode)
}

/// Branches with a signed 16-bit relative offset (conditionals, `goto`, `jsr`)
pub fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL)
}

/// Conditional branches
pub fn is_conditional_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL)
}

/// Conditional branch testing the opposite condition
///
/// Conditionals come in pairs (`ifeq`/`ifne`, `if_icmplt`/`if_icmpge`, ...) whose opcodes differ
/// only in the lowest bit, after shifting by the first opcode of the range.
pub fn invert_conditional(opcode: u8) -> Option<u8> {
    match opcode {
        IFEQ..=IF_ACMPNE => Some(((opcode - IFEQ) ^ 1) + IFEQ),
        IFNULL | IFNONNULL => Some(opcode ^ 1),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mnemonics_round_trip() {
        assert_eq!(mnemonic(GOTO_W), Some("goto_w"));
        assert_eq!(from_mnemonic("invokevirtual"), Some(INVOKEVIRTUAL));
        assert_eq!(from_mnemonic("return"), Some(RETURN));
        assert_eq!(mnemonic(0xca), None);
        assert_eq!(from_mnemonic("breakpoint"), None);
    }

    #[test]
    fn fixed_lengths() {
        let cases: &[(&[u8], usize)] = &[
            (&[NOP], 1),
            (&[BIPUSH, 5], 2),
            (&[SIPUSH, 1, 0], 3),
            (&[IINC, 1, 1], 3),
            (&[GOTO, 0, 3], 3),
            (&[INVOKEINTERFACE, 0, 1, 1, 0], 5),
            (&[MULTIANEWARRAY, 0, 1, 2], 4),
            (&[JSR_W, 0, 0, 0, 5], 5),
            (&[WIDE, ILOAD, 1, 0], 4),
            (&[WIDE, IINC, 1, 0, 0, 1], 6),
        ];
        for (code, len) in cases {
            assert_eq!(instruction_length(code, 0).unwrap(), *len, "{:?}", code);
        }
    }

    #[test]
    fn switch_lengths_depend_on_position() {
        // tableswitch at 1: two padding bytes, default, low = 0, high = 1, two offsets
        let mut code = vec![NOP, TABLESWITCH, 0, 0];
        code.extend_from_slice(&[0, 0, 0, 20, 0, 0, 0, 0, 0, 0, 0, 1]);
        code.extend_from_slice(&[0, 0, 0, 20, 0, 0, 0, 20]);
        assert_eq!(instruction_length(&code, 1).unwrap(), 23);

        // lookupswitch at 0: three padding bytes, default, one pair
        let mut code = vec![LOOKUPSWITCH, 0, 0, 0];
        code.extend_from_slice(&[0, 0, 0, 20, 0, 0, 0, 1, 0, 0, 0, 7, 0, 0, 0, 20]);
        assert_eq!(instruction_length(&code, 0).unwrap(), 20);
    }

    #[test]
    fn malformed_instructions() {
        assert!(matches!(
            instruction_length(&[0xfe], 0),
            Err(Error::UnknownOpcode { .. })
        ));
        assert!(matches!(
            instruction_length(&[SIPUSH, 1], 0),
            Err(Error::TruncatedInstruction(0))
        ));
    }

    #[test]
    fn stack_growth_samples() {
        assert_eq!(stack_growth(LCONST_1), 2);
        assert_eq!(stack_growth(LCMP), -3);
        assert_eq!(stack_growth(IF_ICMPGE), -2);
        assert_eq!(stack_growth(LASTORE), -4);
        assert_eq!(stack_growth(JSR_W), 1);
        assert!(has_variable_stack_growth(INVOKESTATIC));
        assert!(!has_variable_stack_growth(NEW));
    }

    #[test]
    fn inverted_conditionals() {
        assert_eq!(invert_conditional(IFEQ), Some(IFNE));
        assert_eq!(invert_conditional(IFLT), Some(IFGE));
        assert_eq!(invert_conditional(IF_ICMPLE), Some(IF_ICMPGT));
        assert_eq!(invert_conditional(IF_ACMPNE), Some(IF_ACMPEQ));
        assert_eq!(invert_conditional(IFNULL), Some(IFNONNULL));
        assert_eq!(invert_conditional(GOTO), None);
    }
}
