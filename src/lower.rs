use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::classfile::{CodeAttribute, ConstantPool, LocalVariableEntry, MethodRecord, local_debug_name};
use crate::descriptor::{BasicType, ObjectType, ValueType};
use crate::error::IrError;
use crate::ir::{
    BasicExpr, BinOp, CallKind, Check, Const, Expr, Handler, Instr, MethodIr, UnOp, Var, VarOrigin,
    VarTable,
};
use crate::opcode::{self, ArithOp, ArrayKind, CmpOp, IfKind, MethodRef, OpCode};

/// Transformer configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LowerOptions {
    /// Typecheck stack and local slots while recoding.
    pub bcv: bool,
    /// Emit `CheckLink` before link-triggering opcodes.
    pub check_link: bool,
}

/// Recode one method's bytecode into three-address IR.
///
/// The walk is a single forward pass: the verifier property guarantees a
/// unique stack shape per pc, so joins only need the canonical variables
/// recorded by the first incoming edge.
pub fn lower_method(
    class_name: &str,
    method: &MethodRecord,
    pool: &ConstantPool,
    options: &LowerOptions,
) -> Result<MethodIr, IrError> {
    let code = method
        .code
        .as_ref()
        .ok_or_else(|| IrError::bad_stack(0, "method has no code attribute"))?;
    let decoded = opcode::decode_method(&code.bytecode, pool)?;
    if decoded.is_empty() {
        return Err(IrError::bad_stack(0, "empty code attribute"));
    }

    let mut branch_targets = BTreeSet::new();
    for instruction in &decoded {
        match &instruction.op {
            OpCode::Jsr(_) | OpCode::Ret(_) => return Err(IrError::Subroutine),
            OpCode::Goto(target) => {
                branch_targets.insert(*target);
            }
            OpCode::If { target, .. } => {
                branch_targets.insert(*target);
            }
            OpCode::TableSwitch {
                default, targets, ..
            } => {
                branch_targets.insert(*default);
                branch_targets.extend(targets.iter().copied());
            }
            OpCode::LookupSwitch { default, pairs } => {
                branch_targets.insert(*default);
                branch_targets.extend(pairs.iter().map(|(_, target)| *target));
            }
            _ => {}
        }
    }

    let mut lowering = Lowering {
        options,
        vars: VarTable::new(),
        stack: Vec::new(),
        local_types: BTreeMap::new(),
        locals_debug: &code.local_variables,
        out: Vec::new(),
        ir2bc: Vec::new(),
        bc2ir: BTreeMap::new(),
        join_stacks: BTreeMap::new(),
        branch_targets,
        pc: 0,
    };

    let params = lowering.bind_parameters(class_name, method);
    let entry_info = lowering.bind_handlers(code);

    let mut reachable = true;
    for (index, instruction) in decoded.iter().enumerate() {
        let pc = instruction.pc;
        let next_pc = decoded
            .get(index + 1)
            .map(|next| next.pc)
            .unwrap_or(code.bytecode.len());

        if let Some((catch_var, catch_type)) = entry_info.get(&pc) {
            if reachable {
                return Err(IrError::bad_stack(pc, "fallthrough into handler entry"));
            }
            lowering.stack = vec![Slot::Expr(Expr::Basic(BasicExpr::Var(
                ValueType::Object(catch_type.clone()),
                *catch_var,
            )))];
            reachable = true;
        } else if !reachable {
            if lowering.branch_targets.contains(&pc) {
                lowering.stack = lowering.join_entry_stack(pc);
                reachable = true;
            } else {
                // Dead code: decoded for pc arithmetic, never lowered.
                continue;
            }
        }

        lowering.pc = pc;
        let first_emitted = lowering.out.len();
        let fallthrough = lowering.op(&instruction.op, next_pc)?;

        if fallthrough {
            if index + 1 == decoded.len() {
                return Err(IrError::bad_stack(pc, "execution falls off code end"));
            }
            if lowering.branch_targets.contains(&next_pc) {
                lowering.transfer_to_target(next_pc, EdgeKind::Jump)?;
                lowering.stack = lowering.join_entry_stack(next_pc);
            }
        }
        // Map only pcs that emitted: the map stays an exact inverse of ir2bc.
        if lowering.out.len() > first_emitted {
            lowering.bc2ir.insert(pc, first_emitted);
        }
        reachable = fallthrough;
    }

    lowering.finish(code, params, entry_info)
}

/// Join-edge flavor, deciding the origin of canonical stack variables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EdgeKind {
    Jump,
    Conditional,
}

/// One abstract stack slot.
#[derive(Clone, Debug, PartialEq)]
enum Slot {
    Expr(Expr),
    Uninit { pc: usize, class_name: String },
}

impl Slot {
    fn width(&self) -> usize {
        match self {
            Slot::Expr(expr) => expr.value_type().slot_width(),
            Slot::Uninit { .. } => 1,
        }
    }
}

/// Canonical stack shape recorded at a join.
#[derive(Clone, Debug, PartialEq)]
enum JoinSlot {
    Var(ValueType, Var),
    Uninit { pc: usize, class_name: String },
}

struct Lowering<'a> {
    options: &'a LowerOptions,
    vars: VarTable,
    stack: Vec<Slot>,
    local_types: BTreeMap<u16, ValueType>,
    locals_debug: &'a [LocalVariableEntry],
    out: Vec<Instr>,
    ir2bc: Vec<usize>,
    bc2ir: BTreeMap<usize, usize>,
    join_stacks: BTreeMap<usize, Vec<JoinSlot>>,
    branch_targets: BTreeSet<usize>,
    pc: usize,
}

impl<'a> Lowering<'a> {
    fn bind_parameters(
        &mut self,
        class_name: &str,
        method: &MethodRecord,
    ) -> Vec<(ValueType, Var)> {
        let mut params = Vec::new();
        let mut slot = 0u16;
        if !method.is_static {
            let this_type = ValueType::class(class_name);
            let var = self.local_var(slot, 0);
            self.local_types.insert(slot, this_type.clone());
            params.push((this_type, var));
            slot += 1;
        }
        for parameter in &method.signature.parameters {
            let var = self.local_var(slot, 0);
            self.local_types.insert(slot, parameter.clone());
            params.push((parameter.clone(), var));
            slot += parameter.slot_width() as u16;
        }
        params
    }

    fn bind_handlers(&mut self, code: &CodeAttribute) -> BTreeMap<usize, (Var, ObjectType)> {
        let mut entry_info: BTreeMap<usize, (Var, ObjectType)> = BTreeMap::new();
        for (index, handler) in code.exception_table.iter().enumerate() {
            let entry = handler.handler_pc as usize;
            if entry_info.contains_key(&entry) {
                continue;
            }
            let catch_type = handler
                .catch_type
                .as_deref()
                .map(ObjectType::class)
                .unwrap_or_else(|| ObjectType::class("java/lang/Throwable"));
            let var = self.vars.var(VarOrigin::Catch(index));
            entry_info.insert(entry, (var, catch_type));
        }
        entry_info
    }

    fn local_var(&mut self, slot: u16, name_pc: usize) -> Var {
        let name = local_debug_name(self.locals_debug, slot, name_pc).map(str::to_string);
        self.vars.var(VarOrigin::Original { slot, name })
    }

    fn emit(&mut self, instr: Instr) {
        self.out.push(instr);
        self.ir2bc.push(self.pc);
    }

    fn pop(&mut self) -> Result<Slot, IrError> {
        self.stack
            .pop()
            .ok_or_else(|| IrError::bad_stack(self.pc, "operand stack underflow"))
    }

    /// Assign a compound expression to a fresh temporary and return the read.
    fn as_basic(&mut self, expr: Expr) -> BasicExpr {
        match expr {
            Expr::Basic(basic) => basic,
            compound => {
                let value_type = compound.value_type();
                let temp = self.vars.fresh_temp();
                self.emit(Instr::AffectVar {
                    var: temp,
                    expr: compound,
                });
                BasicExpr::Var(value_type, temp)
            }
        }
    }

    fn pop_expr(&mut self) -> Result<Expr, IrError> {
        match self.pop()? {
            Slot::Expr(expr) => Ok(expr),
            Slot::Uninit { .. } => Err(IrError::UninitIsNotExpr { pc: self.pc }),
        }
    }

    fn pop_basic(&mut self) -> Result<BasicExpr, IrError> {
        let expr = self.pop_expr()?;
        Ok(self.as_basic(expr))
    }

    /// Flush every compound slot to a temporary; markers and basics stay.
    fn flush_all(&mut self) {
        for index in 0..self.stack.len() {
            if let Slot::Expr(expr) = &self.stack[index] {
                if !expr.is_basic() {
                    let expr = expr.clone();
                    let basic = self.as_basic(expr);
                    self.stack[index] = Slot::Expr(Expr::Basic(basic));
                }
            }
        }
    }

    /// Flush every slot whose expression reads `var`, preserving the value it
    /// held before the coming store.
    fn flush_slots_using(&mut self, var: Var) {
        for index in 0..self.stack.len() {
            if let Slot::Expr(expr) = &self.stack[index] {
                if expr.uses_var(var) {
                    let expr = expr.clone();
                    let value_type = expr.value_type();
                    let temp = self.vars.fresh_temp();
                    self.emit(Instr::AffectVar { var: temp, expr });
                    self.stack[index] =
                        Slot::Expr(Expr::Basic(BasicExpr::Var(value_type, temp)));
                }
            }
        }
    }

    fn push_expr(&mut self, expr: Expr) {
        self.stack.push(Slot::Expr(expr));
    }

    fn push_basic(&mut self, basic: BasicExpr) {
        self.push_expr(Expr::Basic(basic));
    }

    /// Make the top slot duplicable: compounds become temporaries.
    fn materialize_top(&mut self) -> Result<(), IrError> {
        let top = self
            .stack
            .last()
            .ok_or_else(|| IrError::bad_stack(self.pc, "operand stack underflow"))?;
        if let Slot::Expr(expr) = top {
            if !expr.is_basic() {
                let expr = expr.clone();
                let basic = self.as_basic(expr);
                let top_index = self.stack.len() - 1;
                self.stack[top_index] = Slot::Expr(Expr::Basic(basic));
            }
        }
        Ok(())
    }

    /// Pop slots totaling exactly `width` words, bottom-first in the result.
    fn take_block(&mut self, width: usize) -> Result<Vec<Slot>, IrError> {
        let mut block = Vec::new();
        let mut total = 0;
        while total < width {
            self.materialize_top()?;
            let slot = self.pop()?;
            total += slot.width();
            block.push(slot);
        }
        if total != width {
            return Err(IrError::bad_stack(self.pc, "dup splits a two-word value"));
        }
        block.reverse();
        Ok(block)
    }

    fn dup_pattern(&mut self, copy_width: usize, skip_width: usize) -> Result<(), IrError> {
        let copied = self.take_block(copy_width)?;
        let skipped = if skip_width == 0 {
            Vec::new()
        } else {
            self.take_block(skip_width)?
        };
        self.stack.extend(copied.clone());
        self.stack.extend(skipped);
        self.stack.extend(copied);
        Ok(())
    }

    fn join_entry_stack(&self, target: usize) -> Vec<Slot> {
        self.join_stacks
            .get(&target)
            .map(|canonical| {
                canonical
                    .iter()
                    .map(|slot| match slot {
                        JoinSlot::Var(value_type, var) => {
                            Slot::Expr(Expr::Basic(BasicExpr::Var(value_type.clone(), *var)))
                        }
                        JoinSlot::Uninit { pc, class_name } => Slot::Uninit {
                            pc: *pc,
                            class_name: class_name.clone(),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Route the current stack along an edge into `target`, storing live
    /// slots into the target's canonical variables.
    fn transfer_to_target(&mut self, target: usize, kind: EdgeKind) -> Result<(), IrError> {
        if target <= self.pc {
            if !self.stack.is_empty() {
                return Err(IrError::NonemptyStackBackwardJump { pc: self.pc });
            }
            if self
                .join_stacks
                .get(&target)
                .is_some_and(|canonical| !canonical.is_empty())
            {
                return Err(IrError::bad_stack(self.pc, "stack height mismatch at join"));
            }
            return Ok(());
        }

        if !self.join_stacks.contains_key(&target) {
            let mut canonical = Vec::with_capacity(self.stack.len());
            for (slot_index, slot) in self.stack.clone().into_iter().enumerate() {
                canonical.push(match slot {
                    Slot::Uninit { pc, class_name } => JoinSlot::Uninit { pc, class_name },
                    Slot::Expr(expr) => {
                        let origin = match kind {
                            EdgeKind::Jump => VarOrigin::Branch {
                                slot: slot_index,
                                target,
                            },
                            EdgeKind::Conditional => VarOrigin::Branch2 {
                                slot: slot_index,
                                target,
                            },
                        };
                        JoinSlot::Var(expr.value_type(), self.vars.var(origin))
                    }
                });
            }
            self.join_stacks.insert(target, canonical);
        }

        let canonical = self.join_stacks.get(&target).cloned().expect("recorded join");
        if canonical.len() != self.stack.len() {
            return Err(IrError::bad_stack(self.pc, "stack height mismatch at join"));
        }
        for (slot, join_slot) in self.stack.clone().into_iter().zip(canonical) {
            match (slot, join_slot) {
                (
                    Slot::Uninit { pc, class_name },
                    JoinSlot::Uninit {
                        pc: expected_pc,
                        class_name: expected_class,
                    },
                ) => {
                    if pc != expected_pc || class_name != expected_class {
                        return Err(IrError::TypeConstraintOnUninit { pc: self.pc });
                    }
                }
                (Slot::Expr(expr), JoinSlot::Var(value_type, var)) => {
                    if self.options.bcv
                        && !join_types_compatible(&expr.value_type(), &value_type)
                    {
                        return Err(IrError::bad_stack(self.pc, "stack type mismatch at join"));
                    }
                    if matches!(&expr, Expr::Basic(BasicExpr::Var(_, existing)) if *existing == var)
                    {
                        continue;
                    }
                    self.emit(Instr::AffectVar { var, expr });
                }
                _ => return Err(IrError::TypeConstraintOnUninit { pc: self.pc }),
            }
        }
        Ok(())
    }

    fn pop_args(
        &mut self,
        signature: &crate::descriptor::MethodSignature,
    ) -> Result<Vec<BasicExpr>, IrError> {
        let mut args = Vec::with_capacity(signature.parameters.len());
        for _ in &signature.parameters {
            args.push(self.pop_basic()?);
        }
        args.reverse();
        Ok(args)
    }

    fn invoke_result(
        &mut self,
        signature: &crate::descriptor::MethodSignature,
    ) -> (Option<Var>, Option<ValueType>) {
        match &signature.return_type {
            Some(return_type) => {
                let temp = self.vars.fresh_temp();
                (Some(temp), Some(return_type.clone()))
            }
            None => (None, None),
        }
    }

    fn push_invoke_result(&mut self, result: Option<Var>, return_type: Option<ValueType>) {
        if let (Some(var), Some(value_type)) = (result, return_type) {
            self.push_basic(BasicExpr::Var(value_type, var));
        }
    }

    fn expect_int_like(&self, operand: &BasicExpr) -> Result<(), IrError> {
        if !self.options.bcv {
            return Ok(());
        }
        match operand.value_type() {
            ValueType::Basic(
                BasicType::Int | BasicType::Byte | BasicType::Short | BasicType::Char
                | BasicType::Bool,
            ) => Ok(()),
            _ => Err(IrError::bad_stack(self.pc, "expected an int operand")),
        }
    }

    fn expect_basic(&self, operand: &BasicExpr, expected: BasicType) -> Result<(), IrError> {
        if !self.options.bcv {
            return Ok(());
        }
        match expected {
            BasicType::Int | BasicType::Byte | BasicType::Short | BasicType::Char
            | BasicType::Bool => self.expect_int_like(operand),
            wide => match operand.value_type() {
                ValueType::Basic(actual) if actual == wide => Ok(()),
                _ => Err(IrError::bad_stack(
                    self.pc,
                    format!("expected a {wide:?} operand"),
                )),
            },
        }
    }

    fn expect_reference(&self, operand: &BasicExpr) -> Result<(), IrError> {
        if !self.options.bcv {
            return Ok(());
        }
        if operand.value_type().is_reference() {
            Ok(())
        } else {
            Err(IrError::bad_stack(self.pc, "expected a reference operand"))
        }
    }

    /// Lower one opcode; returns whether execution continues at the next pc.
    fn op(&mut self, op: &OpCode, next_pc: usize) -> Result<bool, IrError> {
        if self.options.check_link && op.may_link() {
            self.emit(Instr::Check(Check::Link(op.clone())));
        }
        match op {
            OpCode::Nop => Ok(true),
            OpCode::Const(constant) => {
                self.push_basic(BasicExpr::Const(constant.clone()));
                Ok(true)
            }
            OpCode::Load(kind, slot) => {
                let value_type = match kind.basic_type() {
                    Some(basic) => ValueType::Basic(basic),
                    None => self
                        .local_types
                        .get(slot)
                        .filter(|known| known.is_reference())
                        .cloned()
                        .unwrap_or_else(ValueType::object),
                };
                if self.options.bcv {
                    if let Some(known) = self.local_types.get(slot) {
                        if !join_types_compatible(known, &value_type) {
                            return Err(IrError::bad_stack(self.pc, "local slot type mismatch"));
                        }
                    }
                }
                let var = self.local_var(*slot, self.pc);
                self.push_basic(BasicExpr::Var(value_type, var));
                Ok(true)
            }
            OpCode::Store(kind, slot) => {
                let expr = self.pop_expr()?;
                if self.options.bcv {
                    let expected = match kind.basic_type() {
                        Some(basic) => ValueType::Basic(basic),
                        None => ValueType::object(),
                    };
                    if !join_types_compatible(&expr.value_type(), &expected) {
                        return Err(IrError::bad_stack(self.pc, "store of a mistyped value"));
                    }
                }
                let value_type = expr.value_type();
                let var = self.local_var(*slot, next_pc);
                self.flush_slots_using(var);
                self.emit(Instr::AffectVar { var, expr });
                self.local_types.insert(*slot, value_type);
                Ok(true)
            }
            OpCode::ArrayLoad(kind) => {
                let index = self.pop_basic()?;
                let array = self.pop_basic()?;
                self.expect_int_like(&index)?;
                self.expect_reference(&array)?;
                let element = match array.value_type() {
                    ValueType::Object(ObjectType::Array(element)) => *element,
                    _ => kind.element_type(),
                };
                self.emit(Instr::Check(Check::NullPointer(array.clone())));
                self.emit(Instr::Check(Check::ArrayBound {
                    array: array.clone(),
                    index: index.clone(),
                }));
                self.push_expr(Expr::Binop(BinOp::ArrayLoad(element), array, index));
                Ok(true)
            }
            OpCode::ArrayStore(kind) => {
                let value = self.pop_basic()?;
                let index = self.pop_basic()?;
                let array = self.pop_basic()?;
                self.expect_int_like(&index)?;
                self.expect_reference(&array)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(array.clone())));
                self.emit(Instr::Check(Check::ArrayBound {
                    array: array.clone(),
                    index: index.clone(),
                }));
                if matches!(kind, ArrayKind::Ref) {
                    self.emit(Instr::Check(Check::ArrayStore {
                        array: array.clone(),
                        value: value.clone(),
                    }));
                }
                self.emit(Instr::AffectArray {
                    array,
                    index,
                    value,
                });
                Ok(true)
            }
            OpCode::Pop => {
                self.pop()?;
                Ok(true)
            }
            OpCode::Pop2 => {
                let top = self.pop()?;
                if top.width() == 1 {
                    self.pop()?;
                }
                Ok(true)
            }
            OpCode::Dup => self.dup_pattern(1, 0).map(|_| true),
            OpCode::DupX1 => self.dup_pattern(1, 1).map(|_| true),
            OpCode::DupX2 => self.dup_pattern(1, 2).map(|_| true),
            OpCode::Dup2 => self.dup_pattern(2, 0).map(|_| true),
            OpCode::Dup2X1 => self.dup_pattern(2, 1).map(|_| true),
            OpCode::Dup2X2 => self.dup_pattern(2, 2).map(|_| true),
            OpCode::Swap => {
                let top = self.pop()?;
                let below = self.pop()?;
                if top.width() != 1 || below.width() != 1 {
                    return Err(IrError::bad_stack(self.pc, "swap of a two-word value"));
                }
                self.stack.push(top);
                self.stack.push(below);
                Ok(true)
            }
            OpCode::Arith(arith_op, basic) => {
                let rhs = self.pop_basic()?;
                let lhs = self.pop_basic()?;
                self.expect_basic(&lhs, *basic)?;
                match arith_op {
                    ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr => {
                        self.expect_int_like(&rhs)?
                    }
                    _ => self.expect_basic(&rhs, *basic)?,
                }
                let expr = Expr::Binop(BinOp::Arith(*arith_op, *basic), lhs, rhs.clone());
                let is_integer_division = matches!(arith_op, ArithOp::Div | ArithOp::Rem)
                    && matches!(basic, BasicType::Int | BasicType::Long);
                if is_integer_division {
                    self.emit(Instr::Check(Check::Arithmetic(rhs)));
                    let basic_expr = self.as_basic(expr);
                    self.push_basic(basic_expr);
                } else {
                    self.push_expr(expr);
                }
                Ok(true)
            }
            OpCode::Neg(basic) => {
                let operand = self.pop_basic()?;
                self.expect_basic(&operand, *basic)?;
                self.push_expr(Expr::Unop(UnOp::Neg(*basic), operand));
                Ok(true)
            }
            OpCode::IInc(slot, increment) => {
                let var = self.local_var(*slot, self.pc);
                self.flush_slots_using(var);
                self.emit(Instr::AffectVar {
                    var,
                    expr: Expr::Binop(
                        BinOp::Arith(ArithOp::Add, BasicType::Int),
                        BasicExpr::Var(ValueType::Basic(BasicType::Int), var),
                        BasicExpr::Const(Const::Int(*increment as i32)),
                    ),
                });
                Ok(true)
            }
            OpCode::Conv(from, to) => {
                let operand = self.pop_basic()?;
                self.expect_basic(&operand, *from)?;
                self.push_expr(Expr::Unop(UnOp::Conv { from: *from, to: *to }, operand));
                Ok(true)
            }
            OpCode::Cmp(kind) => {
                let rhs = self.pop_basic()?;
                let lhs = self.pop_basic()?;
                self.push_expr(Expr::Binop(BinOp::Cmp(*kind), lhs, rhs));
                Ok(true)
            }
            OpCode::If { cond, kind, target } => {
                let (lhs, rhs) = match kind {
                    IfKind::IntZero => {
                        let lhs = self.pop_basic()?;
                        self.expect_int_like(&lhs)?;
                        (lhs, BasicExpr::Const(Const::Int(0)))
                    }
                    IfKind::RefNull => {
                        let lhs = self.pop_basic()?;
                        self.expect_reference(&lhs)?;
                        (lhs, BasicExpr::Const(Const::Null))
                    }
                    IfKind::IntCmp => {
                        let rhs = self.pop_basic()?;
                        let lhs = self.pop_basic()?;
                        self.expect_int_like(&lhs)?;
                        self.expect_int_like(&rhs)?;
                        (lhs, rhs)
                    }
                    IfKind::RefCmp => {
                        let rhs = self.pop_basic()?;
                        let lhs = self.pop_basic()?;
                        self.expect_reference(&lhs)?;
                        self.expect_reference(&rhs)?;
                        (lhs, rhs)
                    }
                };
                self.flush_all();
                self.transfer_to_target(*target, EdgeKind::Conditional)?;
                self.emit(Instr::Ifd {
                    cond: *cond,
                    lhs,
                    rhs,
                    target: *target,
                });
                Ok(true)
            }
            OpCode::Goto(target) => {
                self.transfer_to_target(*target, EdgeKind::Jump)?;
                self.emit(Instr::Goto(*target));
                Ok(false)
            }
            OpCode::TableSwitch {
                default,
                low,
                targets,
            } => {
                let key = self.pop_basic()?;
                self.expect_int_like(&key)?;
                self.flush_all();
                for (offset, target) in targets.iter().enumerate() {
                    self.transfer_to_target(*target, EdgeKind::Jump)?;
                    self.emit(Instr::Ifd {
                        cond: CmpOp::Eq,
                        lhs: key.clone(),
                        rhs: BasicExpr::Const(Const::Int(low + offset as i32)),
                        target: *target,
                    });
                }
                self.transfer_to_target(*default, EdgeKind::Jump)?;
                self.emit(Instr::Goto(*default));
                Ok(false)
            }
            OpCode::LookupSwitch { default, pairs } => {
                let key = self.pop_basic()?;
                self.expect_int_like(&key)?;
                self.flush_all();
                for (match_value, target) in pairs {
                    self.transfer_to_target(*target, EdgeKind::Jump)?;
                    self.emit(Instr::Ifd {
                        cond: CmpOp::Eq,
                        lhs: key.clone(),
                        rhs: BasicExpr::Const(Const::Int(*match_value)),
                        target: *target,
                    });
                }
                self.transfer_to_target(*default, EdgeKind::Jump)?;
                self.emit(Instr::Goto(*default));
                Ok(false)
            }
            OpCode::Return(kind) => {
                let value = match kind {
                    Some(slot_kind) => {
                        let value = self.pop_basic()?;
                        if let Some(basic) = slot_kind.basic_type() {
                            self.expect_basic(&value, basic)?;
                        } else {
                            self.expect_reference(&value)?;
                        }
                        Some(value)
                    }
                    None => None,
                };
                self.emit(Instr::Return(value));
                Ok(false)
            }
            OpCode::GetStatic(field_ref) => {
                self.emit(Instr::MayInit(field_ref.class_name.clone()));
                self.push_expr(Expr::StaticField(
                    field_ref.class_name.clone(),
                    field_ref.signature.clone(),
                ));
                Ok(true)
            }
            OpCode::PutStatic(field_ref) => {
                let value = self.pop_expr()?;
                self.flush_all();
                self.emit(Instr::MayInit(field_ref.class_name.clone()));
                self.emit(Instr::AffectStaticField {
                    class_name: field_ref.class_name.clone(),
                    field: field_ref.signature.clone(),
                    value,
                });
                Ok(true)
            }
            OpCode::GetField(field_ref) => {
                let object = self.pop_basic()?;
                self.expect_reference(&object)?;
                self.emit(Instr::Check(Check::NullPointer(object.clone())));
                self.push_expr(Expr::Field(
                    object,
                    field_ref.class_name.clone(),
                    field_ref.signature.clone(),
                ));
                Ok(true)
            }
            OpCode::PutField(field_ref) => {
                let value = self.pop_basic()?;
                let object = self.pop_basic()?;
                self.expect_reference(&object)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(object.clone())));
                self.emit(Instr::AffectField {
                    object,
                    class_name: field_ref.class_name.clone(),
                    field: field_ref.signature.clone(),
                    value,
                });
                Ok(true)
            }
            OpCode::InvokeStatic(method_ref) => {
                let args = self.pop_args(&method_ref.signature)?;
                self.flush_all();
                self.emit(Instr::MayInit(method_ref.receiver_class().to_string()));
                let (result, return_type) = self.invoke_result(&method_ref.signature);
                self.emit(Instr::InvokeStatic {
                    result,
                    class_name: method_ref.receiver_class().to_string(),
                    signature: method_ref.signature.clone(),
                    args,
                });
                self.push_invoke_result(result, return_type);
                Ok(true)
            }
            OpCode::InvokeVirtual(method_ref) => {
                let args = self.pop_args(&method_ref.signature)?;
                let object = self.pop_basic()?;
                self.expect_reference(&object)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(object.clone())));
                let (result, return_type) = self.invoke_result(&method_ref.signature);
                self.emit(Instr::InvokeVirtual {
                    result,
                    object,
                    kind: CallKind::Virtual(method_ref.target.clone()),
                    signature: method_ref.signature.clone(),
                    args,
                });
                self.push_invoke_result(result, return_type);
                Ok(true)
            }
            OpCode::InvokeInterface(method_ref) => {
                let args = self.pop_args(&method_ref.signature)?;
                let object = self.pop_basic()?;
                self.expect_reference(&object)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(object.clone())));
                let (result, return_type) = self.invoke_result(&method_ref.signature);
                self.emit(Instr::InvokeVirtual {
                    result,
                    object,
                    kind: CallKind::Interface(method_ref.receiver_class().to_string()),
                    signature: method_ref.signature.clone(),
                    args,
                });
                self.push_invoke_result(result, return_type);
                Ok(true)
            }
            OpCode::InvokeSpecial(method_ref) => self.invoke_special(method_ref),
            OpCode::InvokeDynamic(signature) => {
                let args = self.pop_args(signature)?;
                self.flush_all();
                debug!(
                    site = %signature,
                    "invokedynamic lowered as an opaque call site"
                );
                let (result, return_type) = self.invoke_result(signature);
                self.emit(Instr::InvokeDynamic {
                    result,
                    signature: signature.clone(),
                    args,
                });
                self.push_invoke_result(result, return_type);
                Ok(true)
            }
            OpCode::New(class_name) => {
                self.emit(Instr::MayInit(class_name.clone()));
                self.stack.push(Slot::Uninit {
                    pc: self.pc,
                    class_name: class_name.clone(),
                });
                Ok(true)
            }
            OpCode::NewArray(element) => {
                let length = self.pop_basic()?;
                self.expect_int_like(&length)?;
                self.emit(Instr::Check(Check::NegativeArraySize(length.clone())));
                let element_type = ValueType::Basic(*element);
                let array_type = ValueType::array(element_type.clone());
                let var = self.vars.fresh_temp();
                self.emit(Instr::NewArray {
                    var,
                    element_type,
                    dims: vec![length],
                });
                self.push_basic(BasicExpr::Var(array_type, var));
                Ok(true)
            }
            OpCode::ANewArray(component) => {
                let length = self.pop_basic()?;
                self.expect_int_like(&length)?;
                self.emit(Instr::Check(Check::NegativeArraySize(length.clone())));
                let element_type = ValueType::Object(component.clone());
                let array_type = ValueType::array(element_type.clone());
                let var = self.vars.fresh_temp();
                self.emit(Instr::NewArray {
                    var,
                    element_type,
                    dims: vec![length],
                });
                self.push_basic(BasicExpr::Var(array_type, var));
                Ok(true)
            }
            OpCode::MultiANewArray(array_type, dimensions) => {
                if *dimensions == 0 {
                    return Err(IrError::BadMultiarrayDimension { pc: self.pc });
                }
                let mut dims = Vec::with_capacity(*dimensions as usize);
                for _ in 0..*dimensions {
                    dims.push(self.pop_basic()?);
                }
                dims.reverse();
                for dim in &dims {
                    self.expect_int_like(dim)?;
                    self.emit(Instr::Check(Check::NegativeArraySize(dim.clone())));
                }
                let mut element_type = ValueType::Object(array_type.clone());
                for _ in 0..*dimensions {
                    element_type = match element_type {
                        ValueType::Object(ObjectType::Array(inner)) => *inner,
                        _ => {
                            return Err(IrError::malformed(
                                self.pc,
                                "multianewarray dimension exceeds array depth",
                            ));
                        }
                    };
                }
                let var = self.vars.fresh_temp();
                self.emit(Instr::NewArray {
                    var,
                    element_type,
                    dims,
                });
                self.push_basic(BasicExpr::Var(ValueType::Object(array_type.clone()), var));
                Ok(true)
            }
            OpCode::ArrayLength => {
                let array = self.pop_basic()?;
                self.expect_reference(&array)?;
                self.emit(Instr::Check(Check::NullPointer(array.clone())));
                self.push_expr(Expr::Unop(UnOp::ArrayLength, array));
                Ok(true)
            }
            OpCode::AThrow => {
                let value = self.pop_basic()?;
                self.expect_reference(&value)?;
                self.emit(Instr::Check(Check::NullPointer(value.clone())));
                self.emit(Instr::Throw(value));
                Ok(false)
            }
            OpCode::CheckCast(target) => {
                let value = self.pop_basic()?;
                self.expect_reference(&value)?;
                self.emit(Instr::Check(Check::Cast {
                    value: value.clone(),
                    target: target.clone(),
                }));
                self.push_expr(Expr::Unop(UnOp::Cast(target.clone()), value));
                Ok(true)
            }
            OpCode::InstanceOf(target) => {
                let value = self.pop_basic()?;
                self.expect_reference(&value)?;
                self.push_expr(Expr::Unop(UnOp::InstanceOf(target.clone()), value));
                Ok(true)
            }
            OpCode::MonitorEnter => {
                let value = self.pop_basic()?;
                self.expect_reference(&value)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(value.clone())));
                self.emit(Instr::MonitorEnter(value));
                Ok(true)
            }
            OpCode::MonitorExit => {
                let value = self.pop_basic()?;
                self.expect_reference(&value)?;
                self.flush_all();
                self.emit(Instr::Check(Check::NullPointer(value.clone())));
                self.emit(Instr::MonitorExit(value));
                Ok(true)
            }
            OpCode::Jsr(_) | OpCode::Ret(_) => Err(IrError::Subroutine),
        }
    }

    fn invoke_special(&mut self, method_ref: &MethodRef) -> Result<bool, IrError> {
        let args = self.pop_args(&method_ref.signature)?;
        if method_ref.signature.name == "<init>" {
            match self.pop()? {
                Slot::Uninit { pc, class_name } => {
                    if class_name != method_ref.receiver_class() {
                        return Err(IrError::ContentConstraintOnUninit { pc: self.pc });
                    }
                    self.flush_all();
                    let var = self.vars.fresh_temp();
                    self.emit(Instr::New {
                        var,
                        class_name: class_name.clone(),
                        arg_types: method_ref.signature.parameters.clone(),
                        args,
                    });
                    // Every remaining copy of the marker is the same fresh
                    // object, dup'd before the constructor ran.
                    let replacement = Expr::Basic(BasicExpr::Var(
                        ValueType::Object(ObjectType::class(class_name.clone())),
                        var,
                    ));
                    let marker = Slot::Uninit {
                        pc,
                        class_name: class_name.clone(),
                    };
                    for slot in &mut self.stack {
                        if *slot == marker {
                            *slot = Slot::Expr(replacement.clone());
                        }
                    }
                    Ok(true)
                }
                Slot::Expr(object_expr) => {
                    let object = self.as_basic(object_expr);
                    self.expect_reference(&object)?;
                    self.flush_all();
                    self.emit(Instr::Check(Check::NullPointer(object.clone())));
                    self.emit(Instr::InvokeNonVirtual {
                        result: None,
                        object,
                        class_name: method_ref.receiver_class().to_string(),
                        signature: method_ref.signature.clone(),
                        args,
                    });
                    Ok(true)
                }
            }
        } else {
            let object = self.pop_basic()?;
            self.expect_reference(&object)?;
            self.flush_all();
            self.emit(Instr::Check(Check::NullPointer(object.clone())));
            let (result, return_type) = self.invoke_result(&method_ref.signature);
            self.emit(Instr::InvokeNonVirtual {
                result,
                object,
                class_name: method_ref.receiver_class().to_string(),
                signature: method_ref.signature.clone(),
                args,
            });
            self.push_invoke_result(result, return_type);
            Ok(true)
        }
    }

    fn finish(
        mut self,
        code: &CodeAttribute,
        params: Vec<(ValueType, Var)>,
        entry_info: BTreeMap<usize, (Var, ObjectType)>,
    ) -> Result<MethodIr, IrError> {
        let out_len = self.out.len();
        // A branch target may have emitted nothing itself (pure pushes); the
        // first instruction at or after it is the semantic entry.
        let map_boundary = |bytecode_pc: usize, bc2ir: &BTreeMap<usize, usize>| -> usize {
            bc2ir
                .range(bytecode_pc..)
                .next()
                .map(|(_, ir_pc)| *ir_pc)
                .unwrap_or(out_len)
        };

        let mut ir_jump_targets = Vec::new();
        for index in 0..out_len {
            let replacement = match &self.out[index] {
                Instr::Goto(target) => {
                    let ir_target = map_boundary(*target, &self.bc2ir);
                    if ir_target >= out_len {
                        return Err(IrError::malformed(*target, "branch into unmapped bytecode"));
                    }
                    if ir_target == index + 1 {
                        // Collapsed jump: keep a placeholder so pc arithmetic
                        // relative to the bytecode stays meaningful.
                        Some(Instr::Nop)
                    } else {
                        ir_jump_targets.push(ir_target);
                        Some(Instr::Goto(ir_target))
                    }
                }
                Instr::Ifd {
                    cond,
                    lhs,
                    rhs,
                    target,
                } => {
                    let ir_target = map_boundary(*target, &self.bc2ir);
                    if ir_target >= out_len {
                        return Err(IrError::malformed(*target, "branch into unmapped bytecode"));
                    }
                    ir_jump_targets.push(ir_target);
                    Some(Instr::Ifd {
                        cond: *cond,
                        lhs: lhs.clone(),
                        rhs: rhs.clone(),
                        target: ir_target,
                    })
                }
                _ => None,
            };
            if let Some(instr) = replacement {
                self.out[index] = instr;
            }
        }

        let mut handlers = Vec::new();
        for handler in &code.exception_table {
            let start = map_boundary(handler.start_pc as usize, &self.bc2ir);
            let end = map_boundary(handler.end_pc as usize, &self.bc2ir);
            let entry = map_boundary(handler.handler_pc as usize, &self.bc2ir);
            if start >= end || entry >= out_len {
                continue;
            }
            let (catch_var, _) = entry_info
                .get(&(handler.handler_pc as usize))
                .expect("handler entry was bound");
            handlers.push(Handler {
                start,
                end,
                handler: entry,
                catch_type: handler.catch_type.clone(),
                catch_var: *catch_var,
            });
            ir_jump_targets.push(entry);
        }

        let mut jump_targets = vec![false; out_len];
        for target in ir_jump_targets {
            if target < out_len {
                jump_targets[target] = true;
            }
        }

        debug!(
            instructions = out_len,
            variables = self.vars.len(),
            handlers = handlers.len(),
            "lowered method body"
        );

        Ok(MethodIr {
            vars: self.vars,
            params,
            code: self.out,
            exception_handlers: handlers,
            line_numbers: code.line_numbers.clone(),
            pc_bc2ir: self.bc2ir,
            pc_ir2bc: self.ir2bc,
            jump_targets,
        })
    }
}

fn join_types_compatible(left: &ValueType, right: &ValueType) -> bool {
    match (left, right) {
        (ValueType::Object(_), ValueType::Object(_)) => true,
        (ValueType::Basic(a), ValueType::Basic(b)) => {
            let int_like = |basic: &BasicType| {
                matches!(
                    basic,
                    BasicType::Int | BasicType::Byte | BasicType::Short | BasicType::Char
                        | BasicType::Bool
                )
            };
            a == b || (int_like(a) && int_like(b))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{CodeAttribute, ConstantPool, MethodRecord, PoolEntry, RawExceptionHandler};
    use crate::descriptor::MethodSignature;
    use crate::ir::VarOrigin;

    fn static_method(descriptor: &str, code: Vec<u8>) -> MethodRecord {
        MethodRecord {
            signature: MethodSignature::parse("m", descriptor).expect("signature"),
            is_static: true,
            is_native: false,
            is_abstract: false,
            is_private: false,
            code: Some(CodeAttribute {
                max_stack: 8,
                max_locals: 8,
                bytecode: code,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
                local_variables: Vec::new(),
            }),
        }
    }

    fn lower(descriptor: &str, code: Vec<u8>, pool: ConstantPool) -> Result<MethodIr, IrError> {
        let method = static_method(descriptor, code);
        lower_method("com/example/Test", &method, &pool, &LowerOptions::default())
    }

    fn int_var(ir: &MethodIr, slot: u16) -> BasicExpr {
        let var = ir
            .vars
            .iter()
            .find(|(_, origin)| matches!(origin, VarOrigin::Original { slot: s, .. } if *s == slot))
            .map(|(var, _)| var)
            .expect("local variable");
        BasicExpr::Var(ValueType::Basic(BasicType::Int), var)
    }

    #[test]
    fn folds_constructor_into_single_new() {
        let pool = ConstantPool::from_entries(vec![
            PoolEntry::Class("com/example/C".to_string()),
            PoolEntry::MethodRef {
                class_name: "com/example/C".to_string(),
                name: "<init>".to_string(),
                descriptor: "(I)V".to_string(),
                is_interface: false,
            },
        ]);
        // new C; dup; iconst_1; invokespecial C.<init>(I)V; astore_1; return
        let code = vec![0xbb, 0, 1, 0x59, 0x04, 0xb7, 0, 2, 0x4c, 0xb1];

        let ir = lower("()V", code, pool).expect("lower");

        assert_eq!(ir.code[0], Instr::MayInit("com/example/C".to_string()));
        let new_var = match &ir.code[1] {
            Instr::New {
                var,
                class_name,
                arg_types,
                args,
            } => {
                assert_eq!(class_name, "com/example/C");
                assert_eq!(arg_types, &vec![ValueType::Basic(BasicType::Int)]);
                assert_eq!(args, &vec![BasicExpr::Const(Const::Int(1))]);
                *var
            }
            other => panic!("expected folded New, got {other:?}"),
        };
        // The dup'd reference is the same fresh temporary.
        match &ir.code[2] {
            Instr::AffectVar { expr, .. } => {
                assert_eq!(
                    expr,
                    &Expr::Basic(BasicExpr::Var(
                        ValueType::class("com/example/C"),
                        new_var
                    ))
                );
            }
            other => panic!("expected store of the folded object, got {other:?}"),
        }
        assert_eq!(ir.code[3], Instr::Return(None));
    }

    #[test]
    fn array_store_checks_follow_jvm_order() {
        // aload_0; iload_1; aload_2; aastore; return
        let code = vec![0x2a, 0x1b, 0x2c, 0x53, 0xb1];

        let ir = lower("([Ljava/lang/Object;ILjava/lang/Object;)V", code, ConstantPool::default())
            .expect("lower");

        let array = match &ir.code[0] {
            Instr::Check(Check::NullPointer(array)) => array.clone(),
            other => panic!("expected null check first, got {other:?}"),
        };
        match &ir.code[1] {
            Instr::Check(Check::ArrayBound { array: checked, .. }) => {
                assert_eq!(checked, &array)
            }
            other => panic!("expected bound check second, got {other:?}"),
        }
        assert!(matches!(&ir.code[2], Instr::Check(Check::ArrayStore { .. })));
        assert!(matches!(&ir.code[3], Instr::AffectArray { .. }));
        assert_eq!(ir.code[4], Instr::Return(None));
    }

    #[test]
    fn integer_division_checks_divisor_then_assigns_once() {
        // iload_0; iload_1; idiv; ireturn
        let code = vec![0x1a, 0x1b, 0x6c, 0xac];

        let ir = lower("(II)I", code, ConstantPool::default()).expect("lower");

        let divisor = int_var(&ir, 1);
        assert_eq!(
            ir.code[0],
            Instr::Check(Check::Arithmetic(divisor.clone()))
        );
        let temp = match &ir.code[1] {
            Instr::AffectVar { var, expr } => {
                assert_eq!(
                    expr,
                    &Expr::Binop(
                        BinOp::Arith(ArithOp::Div, BasicType::Int),
                        int_var(&ir, 0),
                        divisor
                    )
                );
                *var
            }
            other => panic!("expected division assignment, got {other:?}"),
        };
        assert_eq!(
            ir.code[2],
            Instr::Return(Some(BasicExpr::Var(ValueType::Basic(BasicType::Int), temp)))
        );
        assert_eq!(ir.code.len(), 3);
    }

    #[test]
    fn conditional_join_canonicalizes_stack_into_branch_vars() {
        // iload_0; ifeq -> 8; iconst_1; goto -> 9; 8: iconst_2; 9: ireturn
        let code = vec![0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac];

        let ir = lower("(Z)I", code, ConstantPool::default()).expect("lower");

        // ir0 Ifd, ir1 store 1 into the join var, ir2 Goto, ir3 store 2, ir4 return
        assert!(matches!(&ir.code[0], Instr::Ifd { target: 3, .. }));
        let join_var = match &ir.code[1] {
            Instr::AffectVar { var, expr } => {
                assert_eq!(expr, &Expr::Basic(BasicExpr::Const(Const::Int(1))));
                *var
            }
            other => panic!("expected join store, got {other:?}"),
        };
        assert_eq!(
            *ir.vars.origin(join_var),
            VarOrigin::Branch { slot: 0, target: 9 }
        );
        assert_eq!(ir.code[2], Instr::Goto(4));
        match &ir.code[3] {
            Instr::AffectVar { var, expr } => {
                assert_eq!(*var, join_var);
                assert_eq!(expr, &Expr::Basic(BasicExpr::Const(Const::Int(2))));
            }
            other => panic!("expected second join store, got {other:?}"),
        }
        assert_eq!(
            ir.code[4],
            Instr::Return(Some(BasicExpr::Var(
                ValueType::Basic(BasicType::Int),
                join_var
            )))
        );
        assert!(ir.jump_targets[3]);
        assert!(ir.jump_targets[4]);
    }

    #[test]
    fn pc_maps_are_inverses() {
        let code = vec![0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac];

        let ir = lower("(Z)I", code, ConstantPool::default()).expect("lower");

        for (ir_pc, bytecode_pc) in ir.pc_ir2bc.iter().enumerate() {
            assert!(ir.pc_bc2ir[bytecode_pc] <= ir_pc);
        }
        for (bytecode_pc, ir_pc) in &ir.pc_bc2ir {
            assert_eq!(ir.pc_ir2bc[*ir_pc], *bytecode_pc);
        }
    }

    #[test]
    fn rejects_backward_jump_with_values_on_stack() {
        // iconst_1; goto -> 0
        let code = vec![0x04, 0xa7, 0xff, 0xff];

        let result = lower("()V", code, ConstantPool::default());

        assert!(matches!(
            result,
            Err(IrError::NonemptyStackBackwardJump { pc: 1 })
        ));
    }

    #[test]
    fn rejects_subroutines() {
        let code = vec![0xa8, 0x00, 0x03, 0xb1];

        let result = lower("()V", code, ConstantPool::default());

        assert_eq!(result.err(), Some(IrError::Subroutine));
    }

    #[test]
    fn rejects_zero_dimension_multianewarray() {
        let pool = ConstantPool::from_entries(vec![PoolEntry::Class("[[I".to_string())]);
        let code = vec![0xc5, 0, 1, 0, 0xb1];

        let result = lower("()V", code, pool);

        assert!(matches!(
            result,
            Err(IrError::BadMultiarrayDimension { pc: 0 })
        ));
    }

    #[test]
    fn rejects_uninitialised_reference_used_as_value() {
        let pool = ConstantPool::from_entries(vec![PoolEntry::Class("com/example/C".to_string())]);
        // new C; astore_0
        let code = vec![0xbb, 0, 1, 0x4b, 0xb1];

        let result = lower("()V", code, pool);

        assert!(matches!(result, Err(IrError::UninitIsNotExpr { pc: 3 })));
    }

    #[test]
    fn handler_entry_binds_catch_variable() {
        let method = MethodRecord {
            signature: MethodSignature::parse("m", "()V").expect("signature"),
            is_static: true,
            is_native: false,
            is_abstract: false,
            is_private: false,
            code: Some(CodeAttribute {
                max_stack: 2,
                max_locals: 2,
                // aconst_null; athrow; 2: astore_0; 3: return
                bytecode: vec![0x01, 0xbf, 0x4b, 0xb1],
                exception_table: vec![RawExceptionHandler {
                    start_pc: 0,
                    end_pc: 2,
                    handler_pc: 2,
                    catch_type: None,
                }],
                line_numbers: Vec::new(),
                local_variables: Vec::new(),
            }),
        };

        let ir = lower_method(
            "com/example/Test",
            &method,
            &ConstantPool::default(),
            &LowerOptions::default(),
        )
        .expect("lower");

        assert_eq!(ir.exception_handlers.len(), 1);
        let handler = &ir.exception_handlers[0];
        assert_eq!(handler.catch_type, None);
        assert_eq!(*ir.vars.origin(handler.catch_var), VarOrigin::Catch(0));
        // The handler body stores the caught value.
        match &ir.code[handler.handler] {
            Instr::AffectVar { expr, .. } => {
                assert_eq!(
                    expr,
                    &Expr::Basic(BasicExpr::Var(
                        ValueType::class("java/lang/Throwable"),
                        handler.catch_var
                    ))
                );
            }
            other => panic!("expected catch store, got {other:?}"),
        }
        assert!(ir.jump_targets[handler.handler]);
    }

    #[test]
    fn check_link_precedes_linking_opcodes() {
        let pool = ConstantPool::from_entries(vec![PoolEntry::Class("com/example/C".to_string())]);
        let code = vec![0xbb, 0, 1, 0x57, 0xb1];
        let method = static_method("()V", code);

        let ir = lower_method(
            "com/example/Test",
            &method,
            &pool,
            &LowerOptions {
                bcv: false,
                check_link: true,
            },
        )
        .expect("lower");

        assert!(matches!(&ir.code[0], Instr::Check(Check::Link(OpCode::New(_)))));
        assert_eq!(ir.code[1], Instr::MayInit("com/example/C".to_string()));
    }

    #[test]
    fn every_emitted_operand_is_basic() {
        // Exercise compound flushing: iload_0; iload_1; iadd; iload_0; imul; ireturn
        let code = vec![0x1a, 0x1b, 0x60, 0x1a, 0x68, 0xac];

        let ir = lower("(II)I", code, ConstantPool::default()).expect("lower");

        for instr in &ir.code {
            instr.for_each_operand(|operand| {
                assert!(matches!(
                    operand,
                    BasicExpr::Const(_) | BasicExpr::Var(_, _)
                ));
            });
        }
    }

    #[test]
    fn affect_var_types_agree_with_expressions() {
        let code = vec![0x1a, 0x1b, 0x60, 0x3d, 0x1c, 0xac];

        let ir = lower("(II)I", code, ConstantPool::default()).expect("lower");

        for instr in &ir.code {
            if let Instr::AffectVar { var, expr } = instr {
                // Every later read of this variable must carry the same type.
                for other in &ir.code {
                    other.for_each_operand(|operand| {
                        if let BasicExpr::Var(value_type, read) = operand {
                            if read == var {
                                assert_eq!(value_type, &expr.value_type());
                            }
                        }
                    });
                }
            }
        }
    }
}
