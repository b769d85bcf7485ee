use crate::ir::{Instr, MethodIr};

/// Successor pcs of one IR pc, including exception edges into handlers.
pub fn successors(ir: &MethodIr, pc: usize) -> Vec<usize> {
    let mut out = Vec::new();
    match &ir.code[pc] {
        Instr::Goto(target) => out.push(*target),
        Instr::Ifd { target, .. } => {
            out.push(pc + 1);
            out.push(*target);
        }
        Instr::Throw(_) | Instr::Return(_) => {}
        _ => out.push(pc + 1),
    }
    for handler in &ir.exception_handlers {
        if handler.start <= pc && pc < handler.end {
            out.push(handler.handler);
        }
    }
    out.retain(|target| *target < ir.code.len());
    out.sort_unstable();
    out.dedup();
    out
}

/// Predecessors of every pc; the entry keeps the artificial predecessor `-1`.
pub fn predecessors(ir: &MethodIr) -> Vec<Vec<i64>> {
    let mut preds: Vec<Vec<i64>> = vec![Vec::new(); ir.code.len()];
    if !ir.code.is_empty() {
        preds[0].push(-1);
    }
    for pc in 0..ir.code.len() {
        for successor in successors(ir, pc) {
            preds[successor].push(pc as i64);
        }
    }
    for entry in &mut preds {
        entry.sort_unstable();
        entry.dedup();
    }
    preds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicExpr, Const, Handler, Instr, VarTable};
    use crate::opcode::CmpOp;

    fn method(code: Vec<Instr>, handlers: Vec<Handler>) -> MethodIr {
        let len = code.len();
        MethodIr {
            vars: VarTable::new(),
            params: Vec::new(),
            code,
            exception_handlers: handlers,
            line_numbers: Vec::new(),
            pc_bc2ir: Default::default(),
            pc_ir2bc: (0..len).collect(),
            jump_targets: vec![false; len],
        }
    }

    #[test]
    fn branches_have_both_successors() {
        let ir = method(
            vec![
                Instr::Ifd {
                    cond: CmpOp::Eq,
                    lhs: BasicExpr::Const(Const::Int(0)),
                    rhs: BasicExpr::Const(Const::Int(0)),
                    target: 2,
                },
                Instr::Goto(3),
                Instr::Nop,
                Instr::Return(None),
            ],
            Vec::new(),
        );

        assert_eq!(successors(&ir, 0), vec![1, 2]);
        assert_eq!(successors(&ir, 1), vec![3]);
        assert_eq!(successors(&ir, 3), Vec::<usize>::new());
    }

    #[test]
    fn handler_ranges_add_exception_edges() {
        let mut vars = VarTable::new();
        let catch_var = vars.fresh_temp();
        let ir = method(
            vec![
                Instr::Nop,
                Instr::Nop,
                Instr::Return(None),
                Instr::Return(None),
            ],
            vec![Handler {
                start: 0,
                end: 2,
                handler: 3,
                catch_type: None,
                catch_var,
            }],
        );

        assert_eq!(successors(&ir, 0), vec![1, 3]);
        assert_eq!(successors(&ir, 1), vec![2, 3]);
        assert_eq!(successors(&ir, 2), Vec::<usize>::new());

        let preds = predecessors(&ir);
        assert_eq!(preds[0], vec![-1]);
        assert_eq!(preds[3], vec![0, 1]);
    }
}
