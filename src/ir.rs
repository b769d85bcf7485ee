use std::collections::BTreeMap;
use std::fmt;

use crate::classfile::LineNumber;
use crate::descriptor::{BasicType, FieldSignature, MethodSignature, ObjectType, ValueType};
use crate::opcode::{ArithOp, CmpKind, CmpOp, OpCode};

/// An IR variable: a stable index into the method's variable table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Var(pub usize);

impl Var {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a variable comes from. Distinct origins never share an index.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum VarOrigin {
    /// A bytecode local slot, with its debug name when the class carries one.
    Original { slot: u16, name: Option<String> },
    /// Fresh temporary introduced by three-address normalisation.
    Temp(usize),
    /// The exception value at a handler entry.
    Catch(usize),
    /// Canonical stack slot at a join reached by goto or fallthrough edges.
    Branch { slot: usize, target: usize },
    /// Canonical stack slot at a join reached by a conditional-taken edge.
    Branch2 { slot: usize, target: usize },
}

/// Per-method variable interner: equal origins share an index.
#[derive(Clone, Debug, Default)]
pub struct VarTable {
    origins: Vec<VarOrigin>,
    index: BTreeMap<VarOrigin, usize>,
    next_temp: usize,
}

impl VarTable {
    pub fn new() -> Self {
        VarTable::default()
    }

    pub fn var(&mut self, origin: VarOrigin) -> Var {
        if let Some(existing) = self.index.get(&origin) {
            return Var(*existing);
        }
        let index = self.origins.len();
        self.origins.push(origin.clone());
        self.index.insert(origin, index);
        Var(index)
    }

    pub fn fresh_temp(&mut self) -> Var {
        let origin = VarOrigin::Temp(self.next_temp);
        self.next_temp += 1;
        self.var(origin)
    }

    pub fn origin(&self, var: Var) -> &VarOrigin {
        &self.origins[var.0]
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Var, &VarOrigin)> {
        self.origins
            .iter()
            .enumerate()
            .map(|(index, origin)| (Var(index), origin))
    }
}

/// Literal constants the IR can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Const {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Class(ObjectType),
}

impl Const {
    pub fn value_type(&self) -> ValueType {
        match self {
            Const::Null => ValueType::object(),
            Const::Int(_) => ValueType::Basic(BasicType::Int),
            Const::Long(_) => ValueType::Basic(BasicType::Long),
            Const::Float(_) => ValueType::Basic(BasicType::Float),
            Const::Double(_) => ValueType::Basic(BasicType::Double),
            Const::Str(_) => ValueType::class("java/lang/String"),
            Const::Class(_) => ValueType::class("java/lang/Class"),
        }
    }
}

/// Side-effect-free operand: a constant or a typed variable read.
#[derive(Clone, Debug, PartialEq)]
pub enum BasicExpr {
    Const(Const),
    Var(ValueType, Var),
}

impl BasicExpr {
    pub fn value_type(&self) -> ValueType {
        match self {
            BasicExpr::Const(constant) => constant.value_type(),
            BasicExpr::Var(value_type, _) => value_type.clone(),
        }
    }

    pub fn var(&self) -> Option<Var> {
        match self {
            BasicExpr::Var(_, var) => Some(*var),
            BasicExpr::Const(_) => None,
        }
    }
}

/// Unary operators.
#[derive(Clone, Debug, PartialEq)]
pub enum UnOp {
    Neg(BasicType),
    Conv { from: BasicType, to: BasicType },
    ArrayLength,
    InstanceOf(ObjectType),
    Cast(ObjectType),
}

/// Binary operators, including array reads.
#[derive(Clone, Debug, PartialEq)]
pub enum BinOp {
    Arith(ArithOp, BasicType),
    Cmp(CmpKind),
    ArrayLoad(ValueType),
}

/// Expressions read memory but never write; operand positions are basic.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Basic(BasicExpr),
    Unop(UnOp, BasicExpr),
    Binop(BinOp, BasicExpr, BasicExpr),
    Field(BasicExpr, String, FieldSignature),
    StaticField(String, FieldSignature),
}

impl Expr {
    pub fn is_basic(&self) -> bool {
        matches!(self, Expr::Basic(_))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Basic(basic) => basic.value_type(),
            Expr::Unop(op, _) => match op {
                UnOp::Neg(basic) => ValueType::Basic(*basic),
                UnOp::Conv { to, .. } => ValueType::Basic(*to),
                UnOp::ArrayLength => ValueType::Basic(BasicType::Int),
                UnOp::InstanceOf(_) => ValueType::Basic(BasicType::Int),
                UnOp::Cast(object) => ValueType::Object(object.clone()),
            },
            Expr::Binop(op, _, _) => match op {
                BinOp::Arith(_, basic) => ValueType::Basic(*basic),
                BinOp::Cmp(_) => ValueType::Basic(BasicType::Int),
                BinOp::ArrayLoad(element) => element.clone(),
            },
            Expr::Field(_, _, field) => field.field_type.clone(),
            Expr::StaticField(_, field) => field.field_type.clone(),
        }
    }

    /// Whether this expression reads the given variable.
    pub fn uses_var(&self, var: Var) -> bool {
        let reads = |basic: &BasicExpr| basic.var() == Some(var);
        match self {
            Expr::Basic(basic) => reads(basic),
            Expr::Unop(_, operand) => reads(operand),
            Expr::Binop(_, left, right) => reads(left) || reads(right),
            Expr::Field(object, _, _) => reads(object),
            Expr::StaticField(_, _) => false,
        }
    }
}

/// Virtual dispatch flavor at a call site.
#[derive(Clone, Debug, PartialEq)]
pub enum CallKind {
    Virtual(ObjectType),
    Interface(String),
}

/// Explicit runtime guards, emitted in JVM exception order.
#[derive(Clone, Debug, PartialEq)]
pub enum Check {
    NullPointer(BasicExpr),
    ArrayBound { array: BasicExpr, index: BasicExpr },
    ArrayStore { array: BasicExpr, value: BasicExpr },
    NegativeArraySize(BasicExpr),
    Cast { value: BasicExpr, target: ObjectType },
    Arithmetic(BasicExpr),
    Link(OpCode),
}

/// Three-address instructions over a dense pc array.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Nop,
    AffectVar {
        var: Var,
        expr: Expr,
    },
    AffectArray {
        array: BasicExpr,
        index: BasicExpr,
        value: BasicExpr,
    },
    AffectField {
        object: BasicExpr,
        class_name: String,
        field: FieldSignature,
        value: BasicExpr,
    },
    AffectStaticField {
        class_name: String,
        field: FieldSignature,
        value: Expr,
    },
    Goto(usize),
    Ifd {
        cond: CmpOp,
        lhs: BasicExpr,
        rhs: BasicExpr,
        target: usize,
    },
    Throw(BasicExpr),
    Return(Option<BasicExpr>),
    New {
        var: Var,
        class_name: String,
        arg_types: Vec<ValueType>,
        args: Vec<BasicExpr>,
    },
    NewArray {
        var: Var,
        element_type: ValueType,
        dims: Vec<BasicExpr>,
    },
    InvokeStatic {
        result: Option<Var>,
        class_name: String,
        signature: MethodSignature,
        args: Vec<BasicExpr>,
    },
    InvokeVirtual {
        result: Option<Var>,
        object: BasicExpr,
        kind: CallKind,
        signature: MethodSignature,
        args: Vec<BasicExpr>,
    },
    InvokeNonVirtual {
        result: Option<Var>,
        object: BasicExpr,
        class_name: String,
        signature: MethodSignature,
        args: Vec<BasicExpr>,
    },
    /// Opaque dynamic call site; never contributes call edges.
    InvokeDynamic {
        result: Option<Var>,
        signature: MethodSignature,
        args: Vec<BasicExpr>,
    },
    MonitorEnter(BasicExpr),
    MonitorExit(BasicExpr),
    MayInit(String),
    Check(Check),
}

impl Instr {
    /// The variable this instruction defines, if any.
    pub fn def_var(&self) -> Option<Var> {
        match self {
            Instr::AffectVar { var, .. }
            | Instr::New { var, .. }
            | Instr::NewArray { var, .. } => Some(*var),
            Instr::InvokeStatic { result, .. }
            | Instr::InvokeVirtual { result, .. }
            | Instr::InvokeNonVirtual { result, .. }
            | Instr::InvokeDynamic { result, .. } => *result,
            _ => None,
        }
    }

    /// Whether execution can continue at `pc + 1`.
    pub fn has_fallthrough(&self) -> bool {
        !matches!(
            self,
            Instr::Goto(_) | Instr::Throw(_) | Instr::Return(_)
        )
    }

    /// Visit every basic operand position.
    pub fn for_each_operand<'a>(&'a self, mut visit: impl FnMut(&'a BasicExpr)) {
        let mut visit_expr = |expr: &'a Expr, visit: &mut dyn FnMut(&'a BasicExpr)| match expr {
            Expr::Basic(basic) => visit(basic),
            Expr::Unop(_, operand) => visit(operand),
            Expr::Binop(_, left, right) => {
                visit(left);
                visit(right);
            }
            Expr::Field(object, _, _) => visit(object),
            Expr::StaticField(_, _) => {}
        };
        match self {
            Instr::Nop | Instr::Goto(_) | Instr::MayInit(_) => {}
            Instr::AffectVar { expr, .. } => visit_expr(expr, &mut visit),
            Instr::AffectArray {
                array,
                index,
                value,
            } => {
                visit(array);
                visit(index);
                visit(value);
            }
            Instr::AffectField { object, value, .. } => {
                visit(object);
                visit(value);
            }
            Instr::AffectStaticField { value, .. } => visit_expr(value, &mut visit),
            Instr::Ifd { lhs, rhs, .. } => {
                visit(lhs);
                visit(rhs);
            }
            Instr::Throw(value) => visit(value),
            Instr::Return(value) => {
                if let Some(value) = value {
                    visit(value);
                }
            }
            Instr::New { args, .. } | Instr::NewArray { dims: args, .. } => {
                for arg in args {
                    visit(arg);
                }
            }
            Instr::InvokeStatic { args, .. } | Instr::InvokeDynamic { args, .. } => {
                for arg in args {
                    visit(arg);
                }
            }
            Instr::InvokeVirtual { object, args, .. }
            | Instr::InvokeNonVirtual { object, args, .. } => {
                visit(object);
                for arg in args {
                    visit(arg);
                }
            }
            Instr::MonitorEnter(value) | Instr::MonitorExit(value) => visit(value),
            Instr::Check(check) => match check {
                Check::NullPointer(value) | Check::NegativeArraySize(value)
                | Check::Arithmetic(value) => visit(value),
                Check::ArrayBound { array, index } => {
                    visit(array);
                    visit(index);
                }
                Check::ArrayStore { array, value } => {
                    visit(array);
                    visit(value);
                }
                Check::Cast { value, .. } => visit(value),
                Check::Link(_) => {}
            },
        }
    }
}

/// Exception handler over IR pcs; `catch_type = None` is a catch-all.
#[derive(Clone, Debug, PartialEq)]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub catch_type: Option<String>,
    pub catch_var: Var,
}

/// A method in three-address form.
#[derive(Clone, Debug)]
pub struct MethodIr {
    pub vars: VarTable,
    pub params: Vec<(ValueType, Var)>,
    pub code: Vec<Instr>,
    pub exception_handlers: Vec<Handler>,
    pub line_numbers: Vec<LineNumber>,
    /// First IR pc emitted for each reachable bytecode pc.
    pub pc_bc2ir: BTreeMap<usize, usize>,
    /// Originating bytecode pc of each IR pc.
    pub pc_ir2bc: Vec<usize>,
    /// True at every pc targeted by a branch or handler entry.
    pub jump_targets: Vec<bool>,
}

impl MethodIr {
    /// Source line of an IR pc, through the bytecode line-number table.
    pub fn line_for_pc(&self, pc: usize) -> Option<u32> {
        let bytecode_pc = *self.pc_ir2bc.get(pc)? as u16;
        let mut candidate = None;
        for entry in &self.line_numbers {
            if entry.start_pc <= bytecode_pc {
                candidate = Some(entry.line as u32);
            } else {
                break;
            }
        }
        candidate
    }
}

impl fmt::Display for VarOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarOrigin::Original { slot, name: Some(name) } => write!(f, "{name}[{slot}]"),
            VarOrigin::Original { slot, name: None } => write!(f, "l{slot}"),
            VarOrigin::Temp(index) => write!(f, "$t{index}"),
            VarOrigin::Catch(index) => write!(f, "$catch{index}"),
            VarOrigin::Branch { slot, target } => write!(f, "$b{slot}@{target}"),
            VarOrigin::Branch2 { slot, target } => write!(f, "$c{slot}@{target}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::BasicType;

    #[test]
    fn var_table_interns_equal_origins() {
        let mut vars = VarTable::new();

        let first = vars.var(VarOrigin::Original { slot: 1, name: None });
        let second = vars.var(VarOrigin::Original { slot: 1, name: None });
        let named = vars.var(VarOrigin::Original {
            slot: 1,
            name: Some("x".to_string()),
        });

        assert_eq!(first, second);
        assert_ne!(first, named);
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn fresh_temps_never_collide() {
        let mut vars = VarTable::new();

        let a = vars.fresh_temp();
        let b = vars.fresh_temp();

        assert_ne!(a, b);
        assert_eq!(*vars.origin(a), VarOrigin::Temp(0));
        assert_eq!(*vars.origin(b), VarOrigin::Temp(1));
    }

    #[test]
    fn expr_types_follow_operators() {
        let mut vars = VarTable::new();
        let x = vars.fresh_temp();
        let int_var = BasicExpr::Var(ValueType::Basic(BasicType::Int), x);

        let negated = Expr::Unop(UnOp::Neg(BasicType::Int), int_var.clone());
        let compared = Expr::Binop(
            BinOp::Cmp(crate::opcode::CmpKind::Long),
            int_var.clone(),
            int_var.clone(),
        );

        assert_eq!(negated.value_type(), ValueType::Basic(BasicType::Int));
        assert_eq!(compared.value_type(), ValueType::Basic(BasicType::Int));
    }

    #[test]
    fn uses_var_sees_through_operand_positions() {
        let mut vars = VarTable::new();
        let x = vars.fresh_temp();
        let y = vars.fresh_temp();
        let expr = Expr::Binop(
            BinOp::Arith(crate::opcode::ArithOp::Add, BasicType::Int),
            BasicExpr::Var(ValueType::Basic(BasicType::Int), x),
            BasicExpr::Const(Const::Int(1)),
        );

        assert!(expr.uses_var(x));
        assert!(!expr.uses_var(y));
    }
}
