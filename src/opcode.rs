use crate::classfile::{ConstantPool, PoolEntry};
use crate::descriptor::{
    BasicType, FieldSignature, MethodSignature, ObjectType, ValueType, object_type_from_pool_class,
};
use crate::error::IrError;
use crate::ir::Const;

/// Binary arithmetic and bit operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

/// Three-way comparison flavors (`lcmp`, `fcmpl`, ...).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CmpKind {
    Long,
    FloatL,
    FloatG,
    DoubleL,
    DoubleG,
}

/// Branch conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Operand shapes of conditional branches.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum IfKind {
    /// `ifeq` .. `ifle`: one int operand compared against zero.
    IntZero,
    /// `if_icmp*`: two int operands.
    IntCmp,
    /// `if_acmpeq`/`if_acmpne`: two reference operands.
    RefCmp,
    /// `ifnull`/`ifnonnull`: one reference operand compared against null.
    RefNull,
}

/// Local-slot kinds of loads, stores, and returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SlotKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl SlotKind {
    pub fn basic_type(self) -> Option<BasicType> {
        match self {
            SlotKind::Int => Some(BasicType::Int),
            SlotKind::Long => Some(BasicType::Long),
            SlotKind::Float => Some(BasicType::Float),
            SlotKind::Double => Some(BasicType::Double),
            SlotKind::Ref => None,
        }
    }
}

/// Element kinds of array loads and stores.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ArrayKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
    Byte,
    Char,
    Short,
}

impl ArrayKind {
    pub fn element_type(self) -> ValueType {
        match self {
            ArrayKind::Int => ValueType::Basic(BasicType::Int),
            ArrayKind::Long => ValueType::Basic(BasicType::Long),
            ArrayKind::Float => ValueType::Basic(BasicType::Float),
            ArrayKind::Double => ValueType::Basic(BasicType::Double),
            ArrayKind::Byte => ValueType::Basic(BasicType::Byte),
            ArrayKind::Char => ValueType::Basic(BasicType::Char),
            ArrayKind::Short => ValueType::Basic(BasicType::Short),
            ArrayKind::Ref => ValueType::object(),
        }
    }
}

/// A field reference resolved from the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldRef {
    pub class_name: String,
    pub signature: FieldSignature,
}

/// A method reference resolved from the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodRef {
    /// Receiver type named at the call site; array receivers dispatch like
    /// `java/lang/Object`.
    pub target: ObjectType,
    pub signature: MethodSignature,
    pub is_interface: bool,
}

impl MethodRef {
    /// Internal class name of the receiver, with array receivers mapped to
    /// `java/lang/Object`.
    pub fn receiver_class(&self) -> &str {
        match &self.target {
            ObjectType::Class(name) => name,
            ObjectType::Array(_) => "java/lang/Object",
        }
    }
}

/// A JVM opcode with operands resolved and branch targets absolute.
#[derive(Clone, Debug, PartialEq)]
pub enum OpCode {
    Nop,
    Const(Const),
    Load(SlotKind, u16),
    Store(SlotKind, u16),
    ArrayLoad(ArrayKind),
    ArrayStore(ArrayKind),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Arith(ArithOp, BasicType),
    Neg(BasicType),
    IInc(u16, i16),
    Conv(BasicType, BasicType),
    Cmp(CmpKind),
    If {
        cond: CmpOp,
        kind: IfKind,
        target: usize,
    },
    Goto(usize),
    Jsr(usize),
    Ret(u16),
    TableSwitch {
        default: usize,
        low: i32,
        targets: Vec<usize>,
    },
    LookupSwitch {
        default: usize,
        pairs: Vec<(i32, usize)>,
    },
    Return(Option<SlotKind>),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    GetField(FieldRef),
    PutField(FieldRef),
    InvokeVirtual(MethodRef),
    InvokeSpecial(MethodRef),
    InvokeStatic(MethodRef),
    InvokeInterface(MethodRef),
    InvokeDynamic(MethodSignature),
    New(String),
    NewArray(BasicType),
    ANewArray(ObjectType),
    MultiANewArray(ObjectType, u8),
    ArrayLength,
    AThrow,
    CheckCast(ObjectType),
    InstanceOf(ObjectType),
    MonitorEnter,
    MonitorExit,
}

impl OpCode {
    /// Whether resolving this opcode may trigger class loading (JVM linking),
    /// the trigger set of `CheckLink`.
    pub fn may_link(&self) -> bool {
        matches!(
            self,
            OpCode::New(_)
                | OpCode::NewArray(_)
                | OpCode::ANewArray(_)
                | OpCode::MultiANewArray(_, _)
                | OpCode::CheckCast(_)
                | OpCode::InstanceOf(_)
                | OpCode::GetStatic(_)
                | OpCode::PutStatic(_)
                | OpCode::GetField(_)
                | OpCode::PutField(_)
                | OpCode::InvokeVirtual(_)
                | OpCode::InvokeSpecial(_)
                | OpCode::InvokeStatic(_)
                | OpCode::InvokeInterface(_)
        )
    }
}

/// One decoded instruction at its bytecode pc.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedOp {
    pub pc: usize,
    pub op: OpCode,
}

/// Decode a full code array into resolved opcodes.
pub fn decode_method(code: &[u8], pool: &ConstantPool) -> Result<Vec<DecodedOp>, IrError> {
    let mut decoded = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let (op, length) = decode_at(code, pc, pool)?;
        decoded.push(DecodedOp { pc, op });
        pc += length;
    }
    Ok(decoded)
}

fn byte(code: &[u8], offset: usize) -> Result<u8, IrError> {
    code.get(offset)
        .copied()
        .ok_or_else(|| IrError::malformed(offset, "bytecode ends inside an instruction"))
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16, IrError> {
    Ok(u16::from_be_bytes([byte(code, offset)?, byte(code, offset + 1)?]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16, IrError> {
    Ok(read_u16(code, offset)? as i16)
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32, IrError> {
    Ok(i32::from_be_bytes([
        byte(code, offset)?,
        byte(code, offset + 1)?,
        byte(code, offset + 2)?,
        byte(code, offset + 3)?,
    ]))
}

fn branch_target(pc: usize, offset: i32) -> Result<usize, IrError> {
    let target = pc as i64 + offset as i64;
    if target < 0 {
        return Err(IrError::malformed(pc, "branch before method start"));
    }
    Ok(target as usize)
}

fn pool_class(pool: &ConstantPool, index: u16, pc: usize) -> Result<String, IrError> {
    match pool.entry(index) {
        Some(PoolEntry::Class(name)) => Ok(name.clone()),
        _ => Err(IrError::malformed(pc, format!("pool entry {index} is not a class"))),
    }
}

fn pool_object_type(pool: &ConstantPool, index: u16, pc: usize) -> Result<ObjectType, IrError> {
    let name = pool_class(pool, index, pc)?;
    object_type_from_pool_class(&name)
        .map_err(|err| IrError::malformed(pc, format!("bad class entry: {err}")))
}

fn pool_field_ref(pool: &ConstantPool, index: u16, pc: usize) -> Result<FieldRef, IrError> {
    match pool.entry(index) {
        Some(PoolEntry::FieldRef {
            class_name,
            name,
            descriptor,
        }) => Ok(FieldRef {
            class_name: class_name.clone(),
            signature: FieldSignature::parse(name.clone(), descriptor)
                .map_err(|err| IrError::malformed(pc, format!("bad field descriptor: {err}")))?,
        }),
        _ => Err(IrError::malformed(pc, format!("pool entry {index} is not a field ref"))),
    }
}

fn pool_method_ref(pool: &ConstantPool, index: u16, pc: usize) -> Result<MethodRef, IrError> {
    match pool.entry(index) {
        Some(PoolEntry::MethodRef {
            class_name,
            name,
            descriptor,
            is_interface,
        }) => Ok(MethodRef {
            target: object_type_from_pool_class(class_name)
                .map_err(|err| IrError::malformed(pc, format!("bad method owner: {err}")))?,
            signature: MethodSignature::parse(name.clone(), descriptor)
                .map_err(|err| IrError::malformed(pc, format!("bad method descriptor: {err}")))?,
            is_interface: *is_interface,
        }),
        _ => Err(IrError::malformed(pc, format!("pool entry {index} is not a method ref"))),
    }
}

fn ldc_constant(pool: &ConstantPool, index: u16, pc: usize, wide: bool) -> Result<Const, IrError> {
    match pool.entry(index) {
        Some(PoolEntry::Int(value)) if !wide => Ok(Const::Int(*value)),
        Some(PoolEntry::Float(value)) if !wide => Ok(Const::Float(*value)),
        Some(PoolEntry::Str(value)) if !wide => Ok(Const::Str(value.clone())),
        Some(PoolEntry::Class(name)) if !wide => Ok(Const::Class(
            object_type_from_pool_class(name)
                .map_err(|err| IrError::malformed(pc, format!("bad class constant: {err}")))?,
        )),
        Some(PoolEntry::Long(value)) if wide => Ok(Const::Long(*value)),
        Some(PoolEntry::Double(value)) if wide => Ok(Const::Double(*value)),
        _ => Err(IrError::malformed(
            pc,
            format!("pool entry {index} is not a loadable constant"),
        )),
    }
}

fn switch_padding(pc: usize) -> usize {
    (4 - ((pc + 1) % 4)) % 4
}

fn decode_at(code: &[u8], pc: usize, pool: &ConstantPool) -> Result<(OpCode, usize), IrError> {
    let opcode = code[pc];
    let op = match opcode {
        0x00 => (OpCode::Nop, 1),
        0x01 => (OpCode::Const(Const::Null), 1),
        0x02..=0x08 => (OpCode::Const(Const::Int(opcode as i32 - 0x03)), 1),
        0x09 | 0x0a => (OpCode::Const(Const::Long((opcode - 0x09) as i64)), 1),
        0x0b..=0x0d => (OpCode::Const(Const::Float((opcode - 0x0b) as f32)), 1),
        0x0e | 0x0f => (OpCode::Const(Const::Double((opcode - 0x0e) as f64)), 1),
        0x10 => (OpCode::Const(Const::Int(byte(code, pc + 1)? as i8 as i32)), 2),
        0x11 => (OpCode::Const(Const::Int(read_i16(code, pc + 1)? as i32)), 3),
        0x12 => (
            OpCode::Const(ldc_constant(pool, byte(code, pc + 1)? as u16, pc, false)?),
            2,
        ),
        0x13 => (
            OpCode::Const(ldc_constant(pool, read_u16(code, pc + 1)?, pc, false)?),
            3,
        ),
        0x14 => (
            OpCode::Const(ldc_constant(pool, read_u16(code, pc + 1)?, pc, true)?),
            3,
        ),
        0x15 => (OpCode::Load(SlotKind::Int, byte(code, pc + 1)? as u16), 2),
        0x16 => (OpCode::Load(SlotKind::Long, byte(code, pc + 1)? as u16), 2),
        0x17 => (OpCode::Load(SlotKind::Float, byte(code, pc + 1)? as u16), 2),
        0x18 => (OpCode::Load(SlotKind::Double, byte(code, pc + 1)? as u16), 2),
        0x19 => (OpCode::Load(SlotKind::Ref, byte(code, pc + 1)? as u16), 2),
        0x1a..=0x1d => (OpCode::Load(SlotKind::Int, (opcode - 0x1a) as u16), 1),
        0x1e..=0x21 => (OpCode::Load(SlotKind::Long, (opcode - 0x1e) as u16), 1),
        0x22..=0x25 => (OpCode::Load(SlotKind::Float, (opcode - 0x22) as u16), 1),
        0x26..=0x29 => (OpCode::Load(SlotKind::Double, (opcode - 0x26) as u16), 1),
        0x2a..=0x2d => (OpCode::Load(SlotKind::Ref, (opcode - 0x2a) as u16), 1),
        0x2e => (OpCode::ArrayLoad(ArrayKind::Int), 1),
        0x2f => (OpCode::ArrayLoad(ArrayKind::Long), 1),
        0x30 => (OpCode::ArrayLoad(ArrayKind::Float), 1),
        0x31 => (OpCode::ArrayLoad(ArrayKind::Double), 1),
        0x32 => (OpCode::ArrayLoad(ArrayKind::Ref), 1),
        0x33 => (OpCode::ArrayLoad(ArrayKind::Byte), 1),
        0x34 => (OpCode::ArrayLoad(ArrayKind::Char), 1),
        0x35 => (OpCode::ArrayLoad(ArrayKind::Short), 1),
        0x36 => (OpCode::Store(SlotKind::Int, byte(code, pc + 1)? as u16), 2),
        0x37 => (OpCode::Store(SlotKind::Long, byte(code, pc + 1)? as u16), 2),
        0x38 => (OpCode::Store(SlotKind::Float, byte(code, pc + 1)? as u16), 2),
        0x39 => (OpCode::Store(SlotKind::Double, byte(code, pc + 1)? as u16), 2),
        0x3a => (OpCode::Store(SlotKind::Ref, byte(code, pc + 1)? as u16), 2),
        0x3b..=0x3e => (OpCode::Store(SlotKind::Int, (opcode - 0x3b) as u16), 1),
        0x3f..=0x42 => (OpCode::Store(SlotKind::Long, (opcode - 0x3f) as u16), 1),
        0x43..=0x46 => (OpCode::Store(SlotKind::Float, (opcode - 0x43) as u16), 1),
        0x47..=0x4a => (OpCode::Store(SlotKind::Double, (opcode - 0x47) as u16), 1),
        0x4b..=0x4e => (OpCode::Store(SlotKind::Ref, (opcode - 0x4b) as u16), 1),
        0x4f => (OpCode::ArrayStore(ArrayKind::Int), 1),
        0x50 => (OpCode::ArrayStore(ArrayKind::Long), 1),
        0x51 => (OpCode::ArrayStore(ArrayKind::Float), 1),
        0x52 => (OpCode::ArrayStore(ArrayKind::Double), 1),
        0x53 => (OpCode::ArrayStore(ArrayKind::Ref), 1),
        0x54 => (OpCode::ArrayStore(ArrayKind::Byte), 1),
        0x55 => (OpCode::ArrayStore(ArrayKind::Char), 1),
        0x56 => (OpCode::ArrayStore(ArrayKind::Short), 1),
        0x57 => (OpCode::Pop, 1),
        0x58 => (OpCode::Pop2, 1),
        0x59 => (OpCode::Dup, 1),
        0x5a => (OpCode::DupX1, 1),
        0x5b => (OpCode::DupX2, 1),
        0x5c => (OpCode::Dup2, 1),
        0x5d => (OpCode::Dup2X1, 1),
        0x5e => (OpCode::Dup2X2, 1),
        0x5f => (OpCode::Swap, 1),
        0x60 => (OpCode::Arith(ArithOp::Add, BasicType::Int), 1),
        0x61 => (OpCode::Arith(ArithOp::Add, BasicType::Long), 1),
        0x62 => (OpCode::Arith(ArithOp::Add, BasicType::Float), 1),
        0x63 => (OpCode::Arith(ArithOp::Add, BasicType::Double), 1),
        0x64 => (OpCode::Arith(ArithOp::Sub, BasicType::Int), 1),
        0x65 => (OpCode::Arith(ArithOp::Sub, BasicType::Long), 1),
        0x66 => (OpCode::Arith(ArithOp::Sub, BasicType::Float), 1),
        0x67 => (OpCode::Arith(ArithOp::Sub, BasicType::Double), 1),
        0x68 => (OpCode::Arith(ArithOp::Mul, BasicType::Int), 1),
        0x69 => (OpCode::Arith(ArithOp::Mul, BasicType::Long), 1),
        0x6a => (OpCode::Arith(ArithOp::Mul, BasicType::Float), 1),
        0x6b => (OpCode::Arith(ArithOp::Mul, BasicType::Double), 1),
        0x6c => (OpCode::Arith(ArithOp::Div, BasicType::Int), 1),
        0x6d => (OpCode::Arith(ArithOp::Div, BasicType::Long), 1),
        0x6e => (OpCode::Arith(ArithOp::Div, BasicType::Float), 1),
        0x6f => (OpCode::Arith(ArithOp::Div, BasicType::Double), 1),
        0x70 => (OpCode::Arith(ArithOp::Rem, BasicType::Int), 1),
        0x71 => (OpCode::Arith(ArithOp::Rem, BasicType::Long), 1),
        0x72 => (OpCode::Arith(ArithOp::Rem, BasicType::Float), 1),
        0x73 => (OpCode::Arith(ArithOp::Rem, BasicType::Double), 1),
        0x74 => (OpCode::Neg(BasicType::Int), 1),
        0x75 => (OpCode::Neg(BasicType::Long), 1),
        0x76 => (OpCode::Neg(BasicType::Float), 1),
        0x77 => (OpCode::Neg(BasicType::Double), 1),
        0x78 => (OpCode::Arith(ArithOp::Shl, BasicType::Int), 1),
        0x79 => (OpCode::Arith(ArithOp::Shl, BasicType::Long), 1),
        0x7a => (OpCode::Arith(ArithOp::Shr, BasicType::Int), 1),
        0x7b => (OpCode::Arith(ArithOp::Shr, BasicType::Long), 1),
        0x7c => (OpCode::Arith(ArithOp::Ushr, BasicType::Int), 1),
        0x7d => (OpCode::Arith(ArithOp::Ushr, BasicType::Long), 1),
        0x7e => (OpCode::Arith(ArithOp::And, BasicType::Int), 1),
        0x7f => (OpCode::Arith(ArithOp::And, BasicType::Long), 1),
        0x80 => (OpCode::Arith(ArithOp::Or, BasicType::Int), 1),
        0x81 => (OpCode::Arith(ArithOp::Or, BasicType::Long), 1),
        0x82 => (OpCode::Arith(ArithOp::Xor, BasicType::Int), 1),
        0x83 => (OpCode::Arith(ArithOp::Xor, BasicType::Long), 1),
        0x84 => (
            OpCode::IInc(byte(code, pc + 1)? as u16, byte(code, pc + 2)? as i8 as i16),
            3,
        ),
        0x85 => (OpCode::Conv(BasicType::Int, BasicType::Long), 1),
        0x86 => (OpCode::Conv(BasicType::Int, BasicType::Float), 1),
        0x87 => (OpCode::Conv(BasicType::Int, BasicType::Double), 1),
        0x88 => (OpCode::Conv(BasicType::Long, BasicType::Int), 1),
        0x89 => (OpCode::Conv(BasicType::Long, BasicType::Float), 1),
        0x8a => (OpCode::Conv(BasicType::Long, BasicType::Double), 1),
        0x8b => (OpCode::Conv(BasicType::Float, BasicType::Int), 1),
        0x8c => (OpCode::Conv(BasicType::Float, BasicType::Long), 1),
        0x8d => (OpCode::Conv(BasicType::Float, BasicType::Double), 1),
        0x8e => (OpCode::Conv(BasicType::Double, BasicType::Int), 1),
        0x8f => (OpCode::Conv(BasicType::Double, BasicType::Long), 1),
        0x90 => (OpCode::Conv(BasicType::Double, BasicType::Float), 1),
        0x91 => (OpCode::Conv(BasicType::Int, BasicType::Byte), 1),
        0x92 => (OpCode::Conv(BasicType::Int, BasicType::Char), 1),
        0x93 => (OpCode::Conv(BasicType::Int, BasicType::Short), 1),
        0x94 => (OpCode::Cmp(CmpKind::Long), 1),
        0x95 => (OpCode::Cmp(CmpKind::FloatL), 1),
        0x96 => (OpCode::Cmp(CmpKind::FloatG), 1),
        0x97 => (OpCode::Cmp(CmpKind::DoubleL), 1),
        0x98 => (OpCode::Cmp(CmpKind::DoubleG), 1),
        0x99..=0x9e => {
            let cond = zero_cmp_op(opcode - 0x99);
            (
                OpCode::If {
                    cond,
                    kind: IfKind::IntZero,
                    target: branch_target(pc, read_i16(code, pc + 1)? as i32)?,
                },
                3,
            )
        }
        0x9f..=0xa4 => {
            let cond = zero_cmp_op(opcode - 0x9f);
            (
                OpCode::If {
                    cond,
                    kind: IfKind::IntCmp,
                    target: branch_target(pc, read_i16(code, pc + 1)? as i32)?,
                },
                3,
            )
        }
        0xa5 | 0xa6 => (
            OpCode::If {
                cond: if opcode == 0xa5 { CmpOp::Eq } else { CmpOp::Ne },
                kind: IfKind::RefCmp,
                target: branch_target(pc, read_i16(code, pc + 1)? as i32)?,
            },
            3,
        ),
        0xa7 => (
            OpCode::Goto(branch_target(pc, read_i16(code, pc + 1)? as i32)?),
            3,
        ),
        0xa8 => (
            OpCode::Jsr(branch_target(pc, read_i16(code, pc + 1)? as i32)?),
            3,
        ),
        0xa9 => (OpCode::Ret(byte(code, pc + 1)? as u16), 2),
        0xaa => {
            let padding = switch_padding(pc);
            let base = pc + 1 + padding;
            let default = branch_target(pc, read_i32(code, base)?)?;
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(IrError::malformed(pc, "tableswitch high below low"));
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            if count > code.len() {
                return Err(IrError::malformed(pc, "tableswitch larger than the method"));
            }
            let mut targets = Vec::with_capacity(count);
            for index in 0..count {
                targets.push(branch_target(pc, read_i32(code, base + 12 + index * 4)?)?);
            }
            (
                OpCode::TableSwitch {
                    default,
                    low,
                    targets,
                },
                1 + padding + 12 + count * 4,
            )
        }
        0xab => {
            let padding = switch_padding(pc);
            let base = pc + 1 + padding;
            let default = branch_target(pc, read_i32(code, base)?)?;
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 || npairs as usize > code.len() {
                return Err(IrError::malformed(pc, "lookupswitch pair count out of range"));
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for index in 0..npairs as usize {
                let key = read_i32(code, base + 8 + index * 8)?;
                let target = branch_target(pc, read_i32(code, base + 12 + index * 8)?)?;
                pairs.push((key, target));
            }
            (
                OpCode::LookupSwitch { default, pairs },
                1 + padding + 8 + npairs as usize * 8,
            )
        }
        0xac => (OpCode::Return(Some(SlotKind::Int)), 1),
        0xad => (OpCode::Return(Some(SlotKind::Long)), 1),
        0xae => (OpCode::Return(Some(SlotKind::Float)), 1),
        0xaf => (OpCode::Return(Some(SlotKind::Double)), 1),
        0xb0 => (OpCode::Return(Some(SlotKind::Ref)), 1),
        0xb1 => (OpCode::Return(None), 1),
        0xb2 => (OpCode::GetStatic(pool_field_ref(pool, read_u16(code, pc + 1)?, pc)?), 3),
        0xb3 => (OpCode::PutStatic(pool_field_ref(pool, read_u16(code, pc + 1)?, pc)?), 3),
        0xb4 => (OpCode::GetField(pool_field_ref(pool, read_u16(code, pc + 1)?, pc)?), 3),
        0xb5 => (OpCode::PutField(pool_field_ref(pool, read_u16(code, pc + 1)?, pc)?), 3),
        0xb6 => (
            OpCode::InvokeVirtual(pool_method_ref(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xb7 => (
            OpCode::InvokeSpecial(pool_method_ref(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xb8 => (
            OpCode::InvokeStatic(pool_method_ref(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xb9 => (
            OpCode::InvokeInterface(pool_method_ref(pool, read_u16(code, pc + 1)?, pc)?),
            5,
        ),
        0xba => {
            let index = read_u16(code, pc + 1)?;
            let signature = match pool.entry(index) {
                Some(PoolEntry::Dynamic { name, descriptor }) => {
                    MethodSignature::parse(name.clone(), descriptor).map_err(|err| {
                        IrError::malformed(pc, format!("bad invokedynamic descriptor: {err}"))
                    })?
                }
                _ => {
                    return Err(IrError::malformed(
                        pc,
                        format!("pool entry {index} is not an invokedynamic site"),
                    ));
                }
            };
            (OpCode::InvokeDynamic(signature), 5)
        }
        0xbb => (OpCode::New(pool_class(pool, read_u16(code, pc + 1)?, pc)?), 3),
        0xbc => {
            let element = match byte(code, pc + 1)? {
                4 => BasicType::Bool,
                5 => BasicType::Char,
                6 => BasicType::Float,
                7 => BasicType::Double,
                8 => BasicType::Byte,
                9 => BasicType::Short,
                10 => BasicType::Int,
                11 => BasicType::Long,
                other => {
                    return Err(IrError::malformed(pc, format!("bad newarray type {other}")));
                }
            };
            (OpCode::NewArray(element), 2)
        }
        0xbd => (
            OpCode::ANewArray(pool_object_type(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xbe => (OpCode::ArrayLength, 1),
        0xbf => (OpCode::AThrow, 1),
        0xc0 => (
            OpCode::CheckCast(pool_object_type(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xc1 => (
            OpCode::InstanceOf(pool_object_type(pool, read_u16(code, pc + 1)?, pc)?),
            3,
        ),
        0xc2 => (OpCode::MonitorEnter, 1),
        0xc3 => (OpCode::MonitorExit, 1),
        0xc4 => {
            let wrapped = byte(code, pc + 1)?;
            let slot = read_u16(code, pc + 2)?;
            match wrapped {
                0x15 => (OpCode::Load(SlotKind::Int, slot), 4),
                0x16 => (OpCode::Load(SlotKind::Long, slot), 4),
                0x17 => (OpCode::Load(SlotKind::Float, slot), 4),
                0x18 => (OpCode::Load(SlotKind::Double, slot), 4),
                0x19 => (OpCode::Load(SlotKind::Ref, slot), 4),
                0x36 => (OpCode::Store(SlotKind::Int, slot), 4),
                0x37 => (OpCode::Store(SlotKind::Long, slot), 4),
                0x38 => (OpCode::Store(SlotKind::Float, slot), 4),
                0x39 => (OpCode::Store(SlotKind::Double, slot), 4),
                0x3a => (OpCode::Store(SlotKind::Ref, slot), 4),
                0x84 => (OpCode::IInc(slot, read_i16(code, pc + 4)?), 6),
                0xa9 => (OpCode::Ret(slot), 4),
                other => {
                    return Err(IrError::malformed(pc, format!("bad wide opcode 0x{other:02x}")));
                }
            }
        }
        0xc5 => (
            OpCode::MultiANewArray(
                pool_object_type(pool, read_u16(code, pc + 1)?, pc)?,
                byte(code, pc + 3)?,
            ),
            4,
        ),
        0xc6 => (
            OpCode::If {
                cond: CmpOp::Eq,
                kind: IfKind::RefNull,
                target: branch_target(pc, read_i16(code, pc + 1)? as i32)?,
            },
            3,
        ),
        0xc7 => (
            OpCode::If {
                cond: CmpOp::Ne,
                kind: IfKind::RefNull,
                target: branch_target(pc, read_i16(code, pc + 1)? as i32)?,
            },
            3,
        ),
        0xc8 => (OpCode::Goto(branch_target(pc, read_i32(code, pc + 1)?)?), 5),
        0xc9 => (OpCode::Jsr(branch_target(pc, read_i32(code, pc + 1)?)?), 5),
        other => {
            return Err(IrError::malformed(pc, format!("unsupported opcode 0x{other:02x}")));
        }
    };
    Ok(op)
}

fn zero_cmp_op(offset: u8) -> CmpOp {
    match offset {
        0 => CmpOp::Eq,
        1 => CmpOp::Ne,
        2 => CmpOp::Lt,
        3 => CmpOp::Ge,
        4 => CmpOp::Gt,
        _ => CmpOp::Le,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ConstantPool;

    fn empty_pool() -> ConstantPool {
        ConstantPool::from_entries(Vec::new())
    }

    #[test]
    fn decodes_constants_loads_and_arithmetic() {
        // iconst_2; bipush -3; iadd; istore_1; return
        let code = [0x05, 0x10, 0xfd, 0x60, 0x3c, 0xb1];

        let decoded = decode_method(&code, &empty_pool()).expect("decode");

        assert_eq!(
            decoded.iter().map(|d| (d.pc, d.op.clone())).collect::<Vec<_>>(),
            vec![
                (0, OpCode::Const(Const::Int(2))),
                (1, OpCode::Const(Const::Int(-3))),
                (3, OpCode::Arith(ArithOp::Add, BasicType::Int)),
                (4, OpCode::Store(SlotKind::Int, 1)),
                (5, OpCode::Return(None)),
            ]
        );
    }

    #[test]
    fn decodes_branches_with_absolute_targets() {
        // 0: iload_1; 1: ifge +5 (-> 6); 4: goto -4 (-> 0); ...
        let code = [0x1b, 0x9c, 0x00, 0x05, 0xa7, 0xff, 0xfc, 0xb1];

        let decoded = decode_method(&code, &empty_pool()).expect("decode");

        assert_eq!(
            decoded[1].op,
            OpCode::If {
                cond: CmpOp::Ge,
                kind: IfKind::IntZero,
                target: 6
            }
        );
        assert_eq!(decoded[2].op, OpCode::Goto(0));
    }

    #[test]
    fn decodes_tableswitch_with_padding() {
        // pc 0: tableswitch, padding 3, default +28, low 1, high 2, offsets +20, +24
        let mut code = vec![0xaa, 0, 0, 0];
        code.extend_from_slice(&28i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&20i32.to_be_bytes());
        code.extend_from_slice(&24i32.to_be_bytes());
        code.extend_from_slice(&[0xb1; 10]);

        let decoded = decode_method(&code, &empty_pool()).expect("decode");

        assert_eq!(
            decoded[0].op,
            OpCode::TableSwitch {
                default: 28,
                low: 1,
                targets: vec![20, 24],
            }
        );
        assert_eq!(decoded[1].pc, 24);
    }

    #[test]
    fn decodes_wide_iinc() {
        let mut code = vec![0xc4, 0x84];
        code.extend_from_slice(&300u16.to_be_bytes());
        code.extend_from_slice(&(-7i16).to_be_bytes());
        code.push(0xb1);

        let decoded = decode_method(&code, &empty_pool()).expect("decode");

        assert_eq!(decoded[0].op, OpCode::IInc(300, -7));
        assert_eq!(decoded[1].op, OpCode::Return(None));
    }

    #[test]
    fn resolves_method_refs_from_pool() {
        let pool = ConstantPool::from_entries(vec![PoolEntry::MethodRef {
            class_name: "com/example/Foo".to_string(),
            name: "bar".to_string(),
            descriptor: "(I)V".to_string(),
            is_interface: false,
        }]);
        let code = [0xb6, 0x00, 0x01, 0xb1];

        let decoded = decode_method(&code, &pool).expect("decode");

        match &decoded[0].op {
            OpCode::InvokeVirtual(method_ref) => {
                assert_eq!(method_ref.receiver_class(), "com/example/Foo");
                assert_eq!(method_ref.signature.name, "bar");
            }
            other => panic!("expected invokevirtual, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let code = [0xcb];

        let result = decode_method(&code, &empty_pool());

        assert!(matches!(result, Err(IrError::MalformedBytecode { .. })));
    }
}
