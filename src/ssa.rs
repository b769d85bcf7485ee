use std::collections::{BTreeMap, BTreeSet};

use crate::cfg;
use crate::descriptor::ValueType;
use crate::ir::{BasicExpr, Expr, Handler, Instr, MethodIr, Var};

/// A φ-node: `def` selects one of `uses` by incoming edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phi {
    pub def: Var,
    /// `uses[k]` is the value arriving from the k-th predecessor.
    pub uses: Vec<Var>,
}

/// Mapping from SSA variables back to their pre-SSA source and version.
#[derive(Clone, Debug, Default)]
pub struct SsaVarTable {
    entries: Vec<(Var, usize)>,
}

impl SsaVarTable {
    fn fresh(&mut self, source: Var, version: usize) -> Var {
        let index = self.entries.len();
        self.entries.push((source, version));
        Var(index)
    }

    pub fn source(&self, var: Var) -> (Var, usize) {
        self.entries[var.0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A method in SSA form: renamed code plus φ-nodes and predecessor lists.
#[derive(Clone, Debug)]
pub struct SsaMethod {
    pub code: Vec<Instr>,
    pub phi_nodes: Vec<Vec<Phi>>,
    pub preds: Vec<Vec<i64>>,
    pub params: Vec<(ValueType, Var)>,
    pub exception_handlers: Vec<Handler>,
    pub vars: SsaVarTable,
}

/// Convert an IR method to pruned SSA.
///
/// Dominance-based φ-placement over the CFG extended with exception edges,
/// preorder renaming along the dominator tree, then a liveness pass that
/// drops φ-nodes whose definition is dead at the join.
pub fn convert(ir: &MethodIr) -> SsaMethod {
    let n = ir.code.len();
    let preds = cfg::predecessors(ir);
    let succs: Vec<Vec<usize>> = (0..n).map(|pc| cfg::successors(ir, pc)).collect();

    let reachable = reachable_set(&succs, n);
    let rpo = reverse_postorder(&succs, &reachable);
    let mut rpo_index = vec![usize::MAX; n];
    for (order, pc) in rpo.iter().enumerate() {
        rpo_index[*pc] = order;
    }

    let idom = dominators(&preds, &rpo, &rpo_index);
    let frontiers = dominance_frontiers(&preds, &idom, &reachable);

    // Definition sites per source variable; parameters and catch variables
    // are definitions at the entry and at their handler entries.
    let mut def_sites: BTreeMap<Var, BTreeSet<usize>> = BTreeMap::new();
    for (_, var) in &ir.params {
        def_sites.entry(*var).or_default().insert(0);
    }
    for handler in &ir.exception_handlers {
        def_sites
            .entry(handler.catch_var)
            .or_default()
            .insert(handler.handler);
    }
    for (pc, instr) in ir.code.iter().enumerate() {
        if !reachable[pc] {
            continue;
        }
        if let Some(var) = instr.def_var() {
            def_sites.entry(var).or_default().insert(pc);
        }
    }

    // φ-placement at the iterated dominance frontier of multi-def variables.
    let mut phi_sources: BTreeMap<usize, BTreeSet<Var>> = BTreeMap::new();
    for (var, sites) in &def_sites {
        if sites.len() < 2 {
            continue;
        }
        let mut work: Vec<usize> = sites.iter().copied().collect();
        let mut placed = BTreeSet::new();
        while let Some(site) = work.pop() {
            for join in &frontiers[site] {
                if placed.insert(*join) {
                    phi_sources.entry(*join).or_default().insert(*var);
                    if !sites.contains(join) {
                        work.push(*join);
                    }
                }
            }
        }
    }

    Renamer::run(ir, preds, succs, idom, reachable, phi_sources)
}

fn reachable_set(succs: &[Vec<usize>], n: usize) -> Vec<bool> {
    let mut reachable = vec![false; n];
    if n == 0 {
        return reachable;
    }
    let mut stack = vec![0usize];
    reachable[0] = true;
    while let Some(pc) = stack.pop() {
        for next in &succs[pc] {
            if !reachable[*next] {
                reachable[*next] = true;
                stack.push(*next);
            }
        }
    }
    reachable
}

fn reverse_postorder(succs: &[Vec<usize>], reachable: &[bool]) -> Vec<usize> {
    let n = succs.len();
    let mut visited = vec![false; n];
    let mut order = Vec::new();
    if n == 0 {
        return order;
    }
    // Iterative DFS with an explicit enter/exit stack.
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;
    while let Some((pc, child)) = stack.pop() {
        if child < succs[pc].len() {
            stack.push((pc, child + 1));
            let next = succs[pc][child];
            if reachable[next] && !visited[next] {
                visited[next] = true;
                stack.push((next, 0));
            }
        } else {
            order.push(pc);
        }
    }
    order.reverse();
    order
}

/// Iterative immediate-dominator computation over reverse postorder.
fn dominators(preds: &[Vec<i64>], rpo: &[usize], rpo_index: &[usize]) -> Vec<Option<usize>> {
    let n = preds.len();
    let mut idom: Vec<Option<usize>> = vec![None; n];
    if n == 0 {
        return idom;
    }
    idom[0] = Some(0);
    let mut changed = true;
    while changed {
        changed = false;
        for pc in rpo.iter().skip(1) {
            let mut new_idom: Option<usize> = None;
            for pred in &preds[*pc] {
                if *pred < 0 {
                    continue;
                }
                let pred = *pred as usize;
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, rpo_index, pred, current),
                });
            }
            if let Some(new_idom) = new_idom {
                if idom[*pc] != Some(new_idom) {
                    idom[*pc] = Some(new_idom);
                    changed = true;
                }
            }
        }
    }
    idom
}

fn intersect(idom: &[Option<usize>], rpo_index: &[usize], a: usize, b: usize) -> usize {
    let mut finger_a = a;
    let mut finger_b = b;
    while finger_a != finger_b {
        while rpo_index[finger_a] > rpo_index[finger_b] {
            finger_a = idom[finger_a].expect("processed node has an idom");
        }
        while rpo_index[finger_b] > rpo_index[finger_a] {
            finger_b = idom[finger_b].expect("processed node has an idom");
        }
    }
    finger_a
}

fn dominance_frontiers(
    preds: &[Vec<i64>],
    idom: &[Option<usize>],
    reachable: &[bool],
) -> Vec<BTreeSet<usize>> {
    let n = preds.len();
    let mut frontiers = vec![BTreeSet::new(); n];
    for pc in 0..n {
        if !reachable[pc] {
            continue;
        }
        let has_entry_edge = preds[pc].contains(&-1);
        let incoming: Vec<usize> = preds[pc]
            .iter()
            .filter(|pred| **pred >= 0)
            .map(|pred| *pred as usize)
            .filter(|pred| reachable[*pred])
            .collect();
        // The artificial entry predecessor makes a back-edged pc 0 a join.
        if incoming.len() + usize::from(has_entry_edge) < 2 {
            continue;
        }
        let Some(dominator) = idom[pc] else { continue };
        for pred in incoming {
            let mut runner = pred;
            while runner != dominator {
                frontiers[runner].insert(pc);
                match idom[runner] {
                    Some(next) if next != runner => runner = next,
                    _ => break,
                }
            }
        }
    }
    frontiers
}

struct Renamer<'a> {
    ir: &'a MethodIr,
    preds: Vec<Vec<i64>>,
    succs: Vec<Vec<usize>>,
    reachable: Vec<bool>,
    stacks: BTreeMap<Var, Vec<Var>>,
    versions: BTreeMap<Var, usize>,
    vars: SsaVarTable,
    code: Vec<Instr>,
    phis: Vec<Vec<PhiBuild>>,
    handler_entry_var: BTreeMap<usize, Var>,
}

#[derive(Clone, Debug)]
struct PhiBuild {
    source: Var,
    def: Var,
    uses: Vec<Var>,
}

impl<'a> Renamer<'a> {
    fn run(
        ir: &'a MethodIr,
        preds: Vec<Vec<i64>>,
        succs: Vec<Vec<usize>>,
        idom: Vec<Option<usize>>,
        reachable: Vec<bool>,
        phi_sources: BTreeMap<usize, BTreeSet<Var>>,
    ) -> SsaMethod {
        let n = ir.code.len();
        let mut renamer = Renamer {
            ir,
            preds,
            succs,
            reachable,
            stacks: BTreeMap::new(),
            versions: BTreeMap::new(),
            vars: SsaVarTable::default(),
            code: ir.code.clone(),
            phis: vec![Vec::new(); n],
            handler_entry_var: BTreeMap::new(),
        };

        // Version 0 of every variable exists at entry; verified code never
        // reads locals before writing them, this just keeps renaming total.
        for (var, _) in ir.vars.iter() {
            let initial = renamer.vars.fresh(var, 0);
            renamer.versions.insert(var, 1);
            renamer.stacks.insert(var, vec![initial]);
        }

        for (pc, sources) in &phi_sources {
            let pred_count = renamer.preds[*pc].len();
            for source in sources {
                renamer.phis[*pc].push(PhiBuild {
                    source: *source,
                    def: Var(usize::MAX),
                    uses: vec![Var(usize::MAX); pred_count],
                });
            }
        }

        // Dominator-tree children, visited in pc order for determinism.
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for pc in 0..n {
            if pc == 0 || !renamer.reachable[pc] {
                continue;
            }
            if let Some(parent) = idom[pc] {
                children[parent].push(pc);
            }
        }

        if n > 0 && renamer.reachable[0] {
            renamer.visit(0, &children);
        }

        let params = ir
            .params
            .iter()
            .map(|(value_type, var)| (value_type.clone(), renamer.vars_entry_version(*var)))
            .collect();

        let handlers = ir
            .exception_handlers
            .iter()
            .map(|handler| Handler {
                catch_var: renamer
                    .handler_entry_var
                    .get(&handler.handler)
                    .copied()
                    .unwrap_or_else(|| renamer.vars_entry_version(handler.catch_var)),
                ..handler.clone()
            })
            .collect();

        let mut ssa = SsaMethod {
            code: renamer.code,
            phi_nodes: renamer
                .phis
                .into_iter()
                .map(|phis| {
                    phis.into_iter()
                        .map(|phi| Phi {
                            def: phi.def,
                            uses: phi.uses,
                        })
                        .collect()
                })
                .collect(),
            preds: renamer.preds,
            params,
            exception_handlers: handlers,
            vars: renamer.vars,
        };
        let succs = ssa_succs(&ssa);
        prune_dead_phis(&mut ssa, &succs);
        ssa
    }

    /// The version-0 SSA variable of a source variable.
    fn vars_entry_version(&self, source: Var) -> Var {
        self.stacks[&source][0]
    }

    fn define(&mut self, source: Var) -> Var {
        let version = self.versions.entry(source).or_insert(0);
        let ssa_var = self.vars.fresh(source, *version);
        *version += 1;
        self.stacks.entry(source).or_default().push(ssa_var);
        ssa_var
    }

    fn current(&self, source: Var) -> Var {
        *self.stacks[&source].last().expect("variable stack is seeded")
    }

    fn visit(&mut self, root: usize, children: &[Vec<usize>]) {
        // Iterative preorder walk; the frame remembers how many definitions
        // to pop on exit.
        enum Event {
            Enter(usize),
            Exit(usize, Vec<Var>),
        }
        let mut stack = vec![Event::Enter(root)];
        while let Some(event) = stack.pop() {
            match event {
                Event::Exit(_, defined) => {
                    for source in defined.into_iter().rev() {
                        self.stacks.get_mut(&source).expect("seeded").pop();
                    }
                }
                Event::Enter(pc) => {
                    let mut defined = Vec::new();

                    if pc == 0 {
                        // The artificial entry edge carries version-0 values.
                        if let Some(position) =
                            self.preds[0].iter().position(|pred| *pred == -1)
                        {
                            for index in 0..self.phis[0].len() {
                                let source = self.phis[0][index].source;
                                let current = self.current(source);
                                self.phis[0][index].uses[position] = current;
                            }
                        }
                    }

                    for index in 0..self.phis[pc].len() {
                        let source = self.phis[pc][index].source;
                        let def = self.define(source);
                        self.phis[pc][index].def = def;
                        defined.push(source);
                    }

                    if let Some(catch_source) = self.catch_var_at(pc) {
                        let def = self.define(catch_source);
                        self.handler_entry_var.insert(pc, def);
                        defined.push(catch_source);
                    }

                    let renamed = self.rename_instr(pc, &mut defined);
                    self.code[pc] = renamed;

                    for successor in self.succs[pc].clone() {
                        let position = self.preds[successor]
                            .iter()
                            .position(|pred| *pred == pc as i64)
                            .expect("successor lists its predecessor");
                        for index in 0..self.phis[successor].len() {
                            let source = self.phis[successor][index].source;
                            let current = self.current(source);
                            self.phis[successor][index].uses[position] = current;
                        }
                    }

                    stack.push(Event::Exit(pc, defined));
                    for child in children[pc].iter().rev() {
                        stack.push(Event::Enter(*child));
                    }
                }
            }
        }
    }

    fn catch_var_at(&self, pc: usize) -> Option<Var> {
        self.ir
            .exception_handlers
            .iter()
            .find(|handler| handler.handler == pc)
            .map(|handler| handler.catch_var)
    }

    fn rename_instr(&mut self, pc: usize, defined: &mut Vec<Var>) -> Instr {
        let instr = self.ir.code[pc].clone();
        match instr {
            Instr::AffectVar { var, expr } => {
                let expr = map_expr(self, &expr);
                let def = self.define(var);
                defined.push(var);
                Instr::AffectVar { var: def, expr }
            }
            Instr::New {
                var,
                class_name,
                arg_types,
                args,
            } => {
                let args = args.iter().map(|arg| map_basic(self, arg)).collect();
                let def = self.define(var);
                defined.push(var);
                Instr::New {
                    var: def,
                    class_name,
                    arg_types,
                    args,
                }
            }
            Instr::NewArray {
                var,
                element_type,
                dims,
            } => {
                let dims = dims.iter().map(|dim| map_basic(self, dim)).collect();
                let def = self.define(var);
                defined.push(var);
                Instr::NewArray {
                    var: def,
                    element_type,
                    dims,
                }
            }
            Instr::InvokeStatic {
                result,
                class_name,
                signature,
                args,
            } => {
                let args: Vec<_> = args.iter().map(|arg| map_basic(self, arg)).collect();
                let result = result.map(|var| {
                    let def = self.define(var);
                    defined.push(var);
                    def
                });
                Instr::InvokeStatic {
                    result,
                    class_name,
                    signature,
                    args,
                }
            }
            Instr::InvokeVirtual {
                result,
                object,
                kind,
                signature,
                args,
            } => {
                let object = map_basic(self, &object);
                let args: Vec<_> = args.iter().map(|arg| map_basic(self, arg)).collect();
                let result = result.map(|var| {
                    let def = self.define(var);
                    defined.push(var);
                    def
                });
                Instr::InvokeVirtual {
                    result,
                    object,
                    kind,
                    signature,
                    args,
                }
            }
            Instr::InvokeNonVirtual {
                result,
                object,
                class_name,
                signature,
                args,
            } => {
                let object = map_basic(self, &object);
                let args: Vec<_> = args.iter().map(|arg| map_basic(self, arg)).collect();
                let result = result.map(|var| {
                    let def = self.define(var);
                    defined.push(var);
                    def
                });
                Instr::InvokeNonVirtual {
                    result,
                    object,
                    class_name,
                    signature,
                    args,
                }
            }
            Instr::InvokeDynamic {
                result,
                signature,
                args,
            } => {
                let args: Vec<_> = args.iter().map(|arg| map_basic(self, arg)).collect();
                let result = result.map(|var| {
                    let def = self.define(var);
                    defined.push(var);
                    def
                });
                Instr::InvokeDynamic {
                    result,
                    signature,
                    args,
                }
            }
            Instr::AffectArray {
                array,
                index,
                value,
            } => Instr::AffectArray {
                array: map_basic(self, &array),
                index: map_basic(self, &index),
                value: map_basic(self, &value),
            },
            Instr::AffectField {
                object,
                class_name,
                field,
                value,
            } => Instr::AffectField {
                object: map_basic(self, &object),
                class_name,
                field,
                value: map_basic(self, &value),
            },
            Instr::AffectStaticField {
                class_name,
                field,
                value,
            } => Instr::AffectStaticField {
                class_name,
                field,
                value: map_expr(self, &value),
            },
            Instr::Ifd {
                cond,
                lhs,
                rhs,
                target,
            } => Instr::Ifd {
                cond,
                lhs: map_basic(self, &lhs),
                rhs: map_basic(self, &rhs),
                target,
            },
            Instr::Throw(value) => Instr::Throw(map_basic(self, &value)),
            Instr::Return(value) => {
                Instr::Return(value.map(|value| map_basic(self, &value)))
            }
            Instr::MonitorEnter(value) => Instr::MonitorEnter(map_basic(self, &value)),
            Instr::MonitorExit(value) => Instr::MonitorExit(map_basic(self, &value)),
            Instr::Check(check) => {
                use crate::ir::Check;
                Instr::Check(match check {
                    Check::NullPointer(value) => Check::NullPointer(map_basic(self, &value)),
                    Check::ArrayBound { array, index } => Check::ArrayBound {
                        array: map_basic(self, &array),
                        index: map_basic(self, &index),
                    },
                    Check::ArrayStore { array, value } => Check::ArrayStore {
                        array: map_basic(self, &array),
                        value: map_basic(self, &value),
                    },
                    Check::NegativeArraySize(value) => {
                        Check::NegativeArraySize(map_basic(self, &value))
                    }
                    Check::Cast { value, target } => Check::Cast {
                        value: map_basic(self, &value),
                        target,
                    },
                    Check::Arithmetic(value) => Check::Arithmetic(map_basic(self, &value)),
                    Check::Link(op) => Check::Link(op),
                })
            }
            other @ (Instr::Nop | Instr::Goto(_) | Instr::MayInit(_)) => other,
        }
    }
}

fn map_basic(renamer: &Renamer<'_>, basic: &BasicExpr) -> BasicExpr {
    match basic {
        BasicExpr::Var(value_type, var) => {
            BasicExpr::Var(value_type.clone(), renamer.current(*var))
        }
        constant => constant.clone(),
    }
}

fn map_expr(renamer: &Renamer<'_>, expr: &Expr) -> Expr {
    match expr {
        Expr::Basic(basic) => Expr::Basic(map_basic(renamer, basic)),
        Expr::Unop(op, operand) => Expr::Unop(op.clone(), map_basic(renamer, operand)),
        Expr::Binop(op, left, right) => Expr::Binop(
            op.clone(),
            map_basic(renamer, left),
            map_basic(renamer, right),
        ),
        Expr::Field(object, class_name, field) => Expr::Field(
            map_basic(renamer, object),
            class_name.clone(),
            field.clone(),
        ),
        Expr::StaticField(class_name, field) => {
            Expr::StaticField(class_name.clone(), field.clone())
        }
    }
}

fn ssa_succs(ssa: &SsaMethod) -> Vec<Vec<usize>> {
    let n = ssa.code.len();
    let mut succs = vec![Vec::new(); n];
    for (pc, entries) in ssa.preds.iter().enumerate() {
        for pred in entries {
            if *pred >= 0 {
                succs[*pred as usize].push(pc);
            }
        }
    }
    succs
}

/// Drop φ-nodes whose definition is not live at the join point, iterating
/// because a dropped φ may kill the uses feeding another.
fn prune_dead_phis(ssa: &mut SsaMethod, succs: &[Vec<usize>]) {
    loop {
        let live_out = liveness(ssa, succs);
        let mut dropped = false;
        for pc in 0..ssa.code.len() {
            let mut instr_uses = BTreeSet::new();
            ssa.code[pc].for_each_operand(|operand| {
                if let BasicExpr::Var(_, var) = operand {
                    instr_uses.insert(*var);
                }
            });
            let before = ssa.phi_nodes[pc].len();
            let live = &live_out[pc];
            ssa.phi_nodes[pc].retain(|phi| instr_uses.contains(&phi.def) || live.contains(&phi.def));
            if ssa.phi_nodes[pc].len() != before {
                dropped = true;
            }
        }
        if !dropped {
            break;
        }
    }
}

/// Backward liveness over the SSA form; φ uses are live at the tail of the
/// matching predecessor, catch variables at their handler entries.
fn liveness(ssa: &SsaMethod, succs: &[Vec<usize>]) -> Vec<BTreeSet<Var>> {
    let n = ssa.code.len();
    let mut live_in: Vec<BTreeSet<Var>> = vec![BTreeSet::new(); n];
    let mut live_out: Vec<BTreeSet<Var>> = vec![BTreeSet::new(); n];

    let mut uses: Vec<BTreeSet<Var>> = vec![BTreeSet::new(); n];
    let mut defs: Vec<BTreeSet<Var>> = vec![BTreeSet::new(); n];
    for pc in 0..n {
        ssa.code[pc].for_each_operand(|operand| {
            if let BasicExpr::Var(_, var) = operand {
                uses[pc].insert(*var);
            }
        });
        if let Some(def) = ssa.code[pc].def_var() {
            defs[pc].insert(def);
        }
        for phi in &ssa.phi_nodes[pc] {
            defs[pc].insert(phi.def);
        }
    }
    for handler in &ssa.exception_handlers {
        if handler.handler < n {
            uses[handler.handler].insert(handler.catch_var);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for pc in (0..n).rev() {
            let mut out = BTreeSet::new();
            for successor in &succs[pc] {
                out.extend(live_in[*successor].iter().copied());
                let position = ssa.preds[*successor]
                    .iter()
                    .position(|pred| *pred == pc as i64);
                if let Some(position) = position {
                    for phi in &ssa.phi_nodes[*successor] {
                        if let Some(use_var) = phi.uses.get(position) {
                            out.insert(*use_var);
                        }
                    }
                }
            }
            let mut input: BTreeSet<Var> = uses[pc].clone();
            for var in out.difference(&defs[pc]) {
                input.insert(*var);
            }
            if out != live_out[pc] {
                live_out[pc] = out;
                changed = true;
            }
            if input != live_in[pc] {
                live_in[pc] = input;
                changed = true;
            }
        }
    }
    live_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{CodeAttribute, ConstantPool, MethodRecord};
    use crate::descriptor::MethodSignature;
    use crate::ir::Const;
    use crate::lower::{LowerOptions, lower_method};

    fn lower(descriptor: &str, code: Vec<u8>) -> MethodIr {
        let method = MethodRecord {
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
        };
        lower_method(
            "com/example/Test",
            &method,
            &ConstantPool::default(),
            &LowerOptions::default(),
        )
        .expect("lower")
    }

    #[test]
    fn diamond_gets_exactly_one_phi_with_two_uses() {
        // if (x == 0) y = 2 else y = 1; return y
        // iload_0; ifeq -> 8; iconst_1; goto -> 9; 8: iconst_2; 9: ireturn
        let ir = lower(
            "(I)I",
            vec![0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac],
        );

        let ssa = convert(&ir);

        let phi_count: usize = ssa.phi_nodes.iter().map(Vec::len).sum();
        assert_eq!(phi_count, 1);
        let join = ssa
            .phi_nodes
            .iter()
            .position(|phis| !phis.is_empty())
            .expect("join phi");
        assert_eq!(join, 4);
        let phi = &ssa.phi_nodes[join][0];
        assert_eq!(phi.uses.len(), ssa.preds[join].len());
        assert_eq!(ssa.preds[join], vec![2, 3]);

        // The returned variable is the phi's definition.
        match &ssa.code[join] {
            Instr::Return(Some(BasicExpr::Var(_, returned))) => assert_eq!(*returned, phi.def),
            other => panic!("expected return of phi def, got {other:?}"),
        }

        // Each use comes from the matching branch assignment.
        let use_from_goto = phi.uses[0];
        let use_from_fall = phi.uses[1];
        match &ssa.code[1] {
            Instr::AffectVar { var, expr } => {
                assert_eq!(*var, use_from_goto);
                assert_eq!(expr, &Expr::Basic(BasicExpr::Const(Const::Int(1))));
            }
            other => panic!("unexpected instruction {other:?}"),
        }
        match &ssa.code[3] {
            Instr::AffectVar { var, expr } => {
                assert_eq!(*var, use_from_fall);
                assert_eq!(expr, &Expr::Basic(BasicExpr::Const(Const::Int(2))));
            }
            other => panic!("unexpected instruction {other:?}"),
        }
    }

    #[test]
    fn every_ssa_variable_has_one_definition() {
        // A loop so renaming exercises back edges:
        // 0: iconst_0; 1: istore_0; 2: iload_0; 3: bipush 10; 5: if_icmpge -> 14;
        // 8: iinc 0 1; 11: goto -> 2; 14: return
        let ir = lower(
            "()V",
            vec![
                0x03, 0x3b, 0x1a, 0x10, 0x0a, 0xa2, 0x00, 0x09, 0x84, 0x00, 0x01, 0xa7, 0xff,
                0xf7, 0xb1,
            ],
        );

        let ssa = convert(&ir);

        let mut seen = BTreeSet::new();
        for (pc, instr) in ssa.code.iter().enumerate() {
            if let Some(def) = instr.def_var() {
                assert!(seen.insert(def), "variable defined twice");
            }
            for phi in &ssa.phi_nodes[pc] {
                assert!(seen.insert(phi.def), "phi def collides");
                assert_eq!(phi.uses.len(), ssa.preds[pc].len());
            }
        }
    }

    #[test]
    fn loop_header_at_entry_merges_param_and_latch_values() {
        // while (x != 0) x = x - 1; return x;
        // 0: iload_0; 1: ifeq -> 11; 4: iload_0; 5: iconst_1; 6: isub;
        // 7: istore_0; 8: goto -> 0; 11: iload_0; 12: ireturn
        let ir = lower(
            "(I)I",
            vec![
                0x1a, 0x99, 0x00, 0x0a, 0x1a, 0x04, 0x64, 0x3b, 0xa7, 0xff, 0xf8, 0x1a, 0xac,
            ],
        );

        let ssa = convert(&ir);

        // The loop header is IR pc 0: entry edge plus the latch back edge.
        assert_eq!(ssa.preds[0], vec![-1, 2]);
        assert_eq!(ssa.phi_nodes[0].len(), 1);
        let phi = &ssa.phi_nodes[0][0];
        assert_eq!(phi.uses.len(), 2);
        // Entry side is the parameter's version 0.
        assert_eq!(phi.uses[0], ssa.params[0].1);
        // Latch side is the subtraction's definition.
        match &ssa.code[1] {
            Instr::AffectVar { var, .. } => assert_eq!(*var, phi.uses[1]),
            other => panic!("expected loop body store, got {other:?}"),
        }
    }

    #[test]
    fn straight_line_code_needs_no_phis() {
        let ir = lower("(II)I", vec![0x1a, 0x1b, 0x60, 0xac]);

        let ssa = convert(&ir);

        assert!(ssa.phi_nodes.iter().all(Vec::is_empty));
    }

    #[test]
    fn dead_join_variables_lose_their_phis() {
        // Both branches assign y but nothing reads it after the join.
        // iload_0; ifeq -> 8; iconst_1; goto -> 9; 8: iconst_2; 9: istore_1; return
        let ir = lower(
            "(I)V",
            vec![
                0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0x3c, 0xb1,
            ],
        );

        let ssa = convert(&ir);

        // The canonical join variable is consumed by the store at the join pc,
        // so one phi survives; storing into a dead local adds none beyond it.
        let phi_count: usize = ssa.phi_nodes.iter().map(Vec::len).sum();
        assert!(phi_count <= 1);
    }
}
