use std::collections::BTreeMap;

use tracing::warn;

use crate::cfg;
use crate::classfile::MethodRecord;
use crate::descriptor::{ObjectType, SigKey, ValueType};
use crate::domains::{AbFSet, AbLocals, AbMethod, AbVSet, ProgramPoint, Site, SiteId, SiteTable};
use crate::hierarchy::Hierarchy;
use crate::ir::{BasicExpr, BinOp, Const, Expr, Instr, MethodIr, UnOp, Var};
use crate::lower::{LowerOptions, lower_method};
use crate::program::Program;
use crate::rta::EntryPoint;
use crate::solver::{Constraint, InsensitiveContext, MethodKey, State, StateValue, StateVar, solve};

/// Result of the class-flow (points-to) analysis.
pub struct ClassFlowResult {
    pub state: State<InsensitiveContext>,
    pub sites: SiteTable,
    pub methods: BTreeMap<MethodKey, MethodIr>,
}

impl ClassFlowResult {
    /// Environment before the given IR pc.
    pub fn locals_at(&self, class_name: &str, method: &SigKey, pc: usize) -> AbLocals {
        let key = (class_name.to_string(), method.clone());
        self.state.locals(&InsensitiveContext, &key, pc)
    }

    pub fn method_ir(&self, class_name: &str, method: &SigKey) -> Option<&MethodIr> {
        self.methods
            .get(&(class_name.to_string(), method.clone()))
    }

    /// Find the site allocating the given object type, if unique.
    pub fn site_of(&self, object_type: &ObjectType) -> Option<SiteId> {
        let mut found = None;
        for (id, site) in self.sites.iter() {
            if &site.object_type == object_type {
                if found.is_some() {
                    return None;
                }
                found = Some(id);
            }
        }
        found
    }
}

/// Run the class-flow analysis over every method RTA reached, using the RTA
/// dispatch map for interprocedural edges.
pub fn analyze(
    program: &Program,
    entry_points: &[EntryPoint],
    options: &LowerOptions,
) -> ClassFlowResult {
    let mut methods: BTreeMap<MethodKey, MethodIr> = BTreeMap::new();
    for method_id in program.parsed_methods() {
        let node = program.hierarchy.node(method_id.class);
        let method = &node.methods[method_id.index];
        if method.code.is_none() {
            continue;
        }
        let record = MethodRecord {
            signature: method.signature.clone(),
            is_static: method.is_static,
            is_native: method.is_native,
            is_abstract: method.is_abstract,
            is_private: method.is_private,
            code: method.code.clone(),
        };
        match lower_method(&node.name, &record, &node.pool, options) {
            Ok(ir) => {
                methods.insert((node.name.clone(), method.signature.key()), ir);
            }
            Err(error) => {
                warn!(class = %node.name, method = %method.signature, %error, "method excluded from class-flow analysis");
            }
        }
    }

    // Interning happens up front so the transfer closures can borrow the
    // completed table: solving itself never creates sites.
    let mut sites = SiteTable::default();
    let mut method_sites: BTreeMap<MethodKey, Vec<InstrSites>> = BTreeMap::new();
    for (key, ir) in &methods {
        let per_pc = (0..ir.code.len())
            .map(|pc| intern_instr_sites(key, ir, pc, &ir.code[pc], &mut sites))
            .collect();
        method_sites.insert(key.clone(), per_pc);
    }

    let eval = EvalContext {
        hierarchy: &program.hierarchy,
        sites: &sites,
    };
    let mut constraints: Vec<Constraint<'_, InsensitiveContext>> = Vec::new();
    for (key, ir) in &methods {
        generate_method(program, key, ir, &method_sites[key], eval, &mut constraints);
    }

    for entry in entry_points {
        let key = (entry.class_name.clone(), entry.method.clone());
        let Some(ir) = methods.get(&key) else { continue };
        let param_kinds: Vec<bool> = ir
            .params
            .iter()
            .map(|(value_type, _)| value_type.is_reference())
            .collect();
        constraints.push(Constraint {
            sources: Vec::new(),
            target: StateVar::Method(InsensitiveContext, key.clone()),
            transfer: Box::new(move |_: &State<InsensitiveContext>| {
                let mut args = AbLocals::empty();
                for (position, is_reference) in param_kinds.iter().enumerate() {
                    let value = if *is_reference {
                        AbVSet::Top
                    } else {
                        AbVSet::Primitive
                    };
                    args = args.set_var(Var(position), value);
                }
                StateValue::Method(AbMethod::reachable(args))
            }),
        });
    }

    let mut state = State::default();
    solve(&mut state, &constraints);
    drop(constraints);
    ClassFlowResult {
        state,
        sites,
        methods,
    }
}

/// Shared read-only context for transfer evaluation.
#[derive(Clone, Copy)]
struct EvalContext<'a> {
    hierarchy: &'a Hierarchy,
    sites: &'a SiteTable,
}

/// Per-instruction interned sites used by the transfer closures.
#[derive(Clone, Debug, Default)]
struct InstrSites {
    allocation: Option<SiteId>,
    string_constant: Option<SiteId>,
    class_constant: Option<SiteId>,
    static_holder: Option<SiteId>,
}

fn generate_method<'a>(
    program: &Program,
    key: &MethodKey,
    ir: &MethodIr,
    sites_per_pc: &[InstrSites],
    eval: EvalContext<'a>,
    constraints: &mut Vec<Constraint<'a, InsensitiveContext>>,
) {
    let context = InsensitiveContext;

    // Entry environment from the method summary.
    let params = ir.params.clone();
    let entry_key = key.clone();
    constraints.push(Constraint {
        sources: vec![StateVar::Method(context, key.clone())],
        target: StateVar::Pc(context, key.clone(), 0),
        transfer: Box::new(move |state: &State<InsensitiveContext>| {
            let summary = state.method(&InsensitiveContext, &entry_key);
            StateValue::Locals(summary.init_locals(&params))
        }),
    });

    for pc in 0..ir.code.len() {
        let instr = ir.code[pc].clone();
        let instr_sites = sites_per_pc[pc].clone();
        let field_sources = field_reads(&instr);
        let callees = invoke_callees(program, key, ir, pc, &instr);

        // Flow into each successor.
        for successor in cfg::successors(ir, pc) {
            let exception_var = ir
                .exception_handlers
                .iter()
                .find(|handler| {
                    handler.start <= pc && pc < handler.end && handler.handler == successor
                })
                .map(|handler| handler.catch_var);

            let mut sources = vec![StateVar::Pc(context, key.clone(), pc)];
            sources.extend(
                field_sources
                    .iter()
                    .map(|field_key| StateVar::Field(field_key.clone())),
            );
            sources.extend(
                callees
                    .iter()
                    .map(|callee| StateVar::Method(context, callee.clone())),
            );

            let transfer_key = key.clone();
            let transfer_instr = instr.clone();
            let transfer_sites = instr_sites.clone();
            let transfer_callees = callees.clone();
            constraints.push(Constraint {
                sources,
                target: StateVar::Pc(context, key.clone(), successor),
                transfer: Box::new(move |state: &State<InsensitiveContext>| {
                    let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                    let out = match exception_var {
                        Some(catch_var) => env.set_var(catch_var, AbVSet::Top),
                        None => step(
                            state,
                            &env,
                            &transfer_instr,
                            &transfer_sites,
                            &transfer_callees,
                            eval,
                        ),
                    };
                    StateValue::Locals(out)
                }),
            });
        }

        // Summary and heap contributions.
        match &instr {
            Instr::Return(value) => {
                let value = value.clone();
                let transfer_key = key.clone();
                let transfer_sites = instr_sites.clone();
                constraints.push(Constraint {
                    sources: vec![StateVar::Pc(context, key.clone(), pc)],
                    target: StateVar::Method(context, key.clone()),
                    transfer: Box::new(move |state: &State<InsensitiveContext>| {
                        let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                        if env.is_bot() {
                            return StateValue::Method(AbMethod::Bot);
                        }
                        let returned = match &value {
                            Some(basic) => eval_basic(&env, basic, &transfer_sites),
                            None => AbVSet::Primitive,
                        };
                        StateValue::Method(AbMethod::returning(returned))
                    }),
                });
            }
            Instr::Throw(value) => {
                let value = value.clone();
                let transfer_key = key.clone();
                let transfer_sites = instr_sites.clone();
                constraints.push(Constraint {
                    sources: vec![StateVar::Pc(context, key.clone(), pc)],
                    target: StateVar::Method(context, key.clone()),
                    transfer: Box::new(move |state: &State<InsensitiveContext>| {
                        let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                        if env.is_bot() {
                            return StateValue::Method(AbMethod::Bot);
                        }
                        StateValue::Method(AbMethod::throwing(eval_basic(
                            &env,
                            &value,
                            &transfer_sites,
                        )))
                    }),
                });
            }
            Instr::AffectField {
                object,
                class_name,
                field,
                value,
            } => {
                let object = object.clone();
                let value = value.clone();
                let field_key = (class_name.clone(), field.name.clone());
                let transfer_key = key.clone();
                let transfer_sites = instr_sites.clone();
                constraints.push(Constraint {
                    sources: vec![StateVar::Pc(context, key.clone(), pc)],
                    target: StateVar::Field(field_key),
                    transfer: Box::new(move |state: &State<InsensitiveContext>| {
                        let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                        if env.is_bot() {
                            return StateValue::Field(AbFSet::Bot);
                        }
                        let objects = eval_basic(&env, &object, &transfer_sites);
                        let stored = eval_basic(&env, &value, &transfer_sites);
                        StateValue::Field(AbFSet::var2fset(&objects, &stored))
                    }),
                });
            }
            Instr::AffectStaticField {
                class_name,
                field,
                value,
            } => {
                let value = value.clone();
                let field_key = (class_name.clone(), field.name.clone());
                let transfer_key = key.clone();
                let transfer_sites = instr_sites.clone();
                let mut sources = vec![StateVar::Pc(context, key.clone(), pc)];
                sources.extend(
                    field_sources
                        .iter()
                        .map(|field_key| StateVar::Field(field_key.clone())),
                );
                constraints.push(Constraint {
                    sources,
                    target: StateVar::Field(field_key),
                    transfer: Box::new(move |state: &State<InsensitiveContext>| {
                        let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                        if env.is_bot() {
                            return StateValue::Field(AbFSet::Bot);
                        }
                        let holder = transfer_sites
                            .static_holder
                            .map(AbVSet::singleton)
                            .unwrap_or(AbVSet::Bot);
                        let stored = eval_expr(state, &env, &value, &transfer_sites, eval);
                        StateValue::Field(AbFSet::var2fset(&holder, &stored))
                    }),
                });
            }
            Instr::New { args, .. } => {
                // The folded constructor call: the fresh site is the receiver.
                let args = args.clone();
                for callee in &callees {
                    let transfer_key = key.clone();
                    let transfer_sites = instr_sites.clone();
                    let args = args.clone();
                    constraints.push(Constraint {
                        sources: vec![StateVar::Pc(context, key.clone(), pc)],
                        target: StateVar::Method(context, callee.clone()),
                        transfer: Box::new(move |state: &State<InsensitiveContext>| {
                            let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                            if env.is_bot() {
                                return StateValue::Method(AbMethod::Bot);
                            }
                            let receiver = transfer_sites
                                .allocation
                                .map(AbVSet::singleton)
                                .unwrap_or(AbVSet::Top);
                            let mut positions = AbLocals::empty().set_var(Var(0), receiver);
                            for (offset, arg) in args.iter().enumerate() {
                                positions = positions.set_var(
                                    Var(offset + 1),
                                    eval_basic(&env, arg, &transfer_sites),
                                );
                            }
                            StateValue::Method(AbMethod::reachable(positions))
                        }),
                    });

                    let callee_key = callee.clone();
                    constraints.push(Constraint {
                        sources: vec![StateVar::Method(context, callee.clone())],
                        target: StateVar::Method(context, key.clone()),
                        transfer: Box::new(move |state: &State<InsensitiveContext>| {
                            let summary = state.method(&InsensitiveContext, &callee_key);
                            StateValue::Method(AbMethod::throwing(summary.exc()))
                        }),
                    });
                }
            }
            Instr::InvokeStatic { args, .. }
            | Instr::InvokeVirtual { args, .. }
            | Instr::InvokeNonVirtual { args, .. } => {
                let receiver = match &instr {
                    Instr::InvokeVirtual { object, .. }
                    | Instr::InvokeNonVirtual { object, .. } => Some(object.clone()),
                    _ => None,
                };
                let args = args.clone();
                for callee in &callees {
                    // Arguments flow into the callee summary.
                    let transfer_key = key.clone();
                    let transfer_sites = instr_sites.clone();
                    let receiver = receiver.clone();
                    let args = args.clone();
                    constraints.push(Constraint {
                        sources: vec![StateVar::Pc(context, key.clone(), pc)],
                        target: StateVar::Method(context, callee.clone()),
                        transfer: Box::new(move |state: &State<InsensitiveContext>| {
                            let env = state.locals(&InsensitiveContext, &transfer_key, pc);
                            if env.is_bot() {
                                return StateValue::Method(AbMethod::Bot);
                            }
                            let mut positions = AbLocals::empty();
                            let mut position = 0usize;
                            if let Some(receiver) = &receiver {
                                positions = positions.set_var(
                                    Var(position),
                                    eval_basic(&env, receiver, &transfer_sites),
                                );
                                position += 1;
                            }
                            for arg in &args {
                                positions = positions.set_var(
                                    Var(position),
                                    eval_basic(&env, arg, &transfer_sites),
                                );
                                position += 1;
                            }
                            StateValue::Method(AbMethod::reachable(positions))
                        }),
                    });

                    // Callee exceptions propagate to this method's summary.
                    let callee_key = callee.clone();
                    constraints.push(Constraint {
                        sources: vec![StateVar::Method(context, callee.clone())],
                        target: StateVar::Method(context, key.clone()),
                        transfer: Box::new(move |state: &State<InsensitiveContext>| {
                            let summary = state.method(&InsensitiveContext, &callee_key);
                            StateValue::Method(AbMethod::throwing(summary.exc()))
                        }),
                    });
                }
            }
            _ => {}
        }
    }
}

/// Abstract one instruction along a normal edge.
fn step(
    state: &State<InsensitiveContext>,
    env: &AbLocals,
    instr: &Instr,
    sites: &InstrSites,
    callees: &[MethodKey],
    eval: EvalContext<'_>,
) -> AbLocals {
    if env.is_bot() {
        return AbLocals::Bot;
    }
    match instr {
        Instr::AffectVar { var, expr } => {
            env.set_var(*var, eval_expr(state, env, expr, sites, eval))
        }
        Instr::New { var, .. } | Instr::NewArray { var, .. } => {
            let site = sites.allocation.map(AbVSet::singleton).unwrap_or(AbVSet::Top);
            env.set_var(*var, site)
        }
        Instr::InvokeStatic { result, signature, .. }
        | Instr::InvokeVirtual { result, signature, .. }
        | Instr::InvokeNonVirtual { result, signature, .. } => match result {
            Some(result) => {
                let mut returned = AbVSet::Bot;
                for callee in callees {
                    returned.join_into(&state.method(&InsensitiveContext, callee).ret());
                }
                if callees.is_empty() {
                    // No resolved target: the result is unconstrained.
                    returned = conservative_result(signature.return_type.as_ref());
                }
                env.set_var(*result, returned)
            }
            None => env.clone(),
        },
        Instr::InvokeDynamic { result, signature, .. } => match result {
            Some(result) => env.set_var(*result, conservative_result(signature.return_type.as_ref())),
            None => env.clone(),
        },
        _ => env.clone(),
    }
}

fn conservative_result(return_type: Option<&ValueType>) -> AbVSet {
    match return_type {
        Some(value_type) if value_type.is_reference() => AbVSet::Top,
        _ => AbVSet::Primitive,
    }
}

fn eval_basic(env: &AbLocals, basic: &BasicExpr, sites: &InstrSites) -> AbVSet {
    match basic {
        BasicExpr::Const(Const::Null) => AbVSet::empty(),
        BasicExpr::Const(Const::Str(_)) => sites
            .string_constant
            .map(AbVSet::singleton)
            .unwrap_or(AbVSet::Top),
        BasicExpr::Const(Const::Class(_)) => sites
            .class_constant
            .map(AbVSet::singleton)
            .unwrap_or(AbVSet::Top),
        BasicExpr::Const(_) => AbVSet::Primitive,
        BasicExpr::Var(_, var) => env.get_var(*var),
    }
}

fn eval_expr(
    state: &State<InsensitiveContext>,
    env: &AbLocals,
    expr: &Expr,
    sites: &InstrSites,
    eval: EvalContext<'_>,
) -> AbVSet {
    match expr {
        Expr::Basic(basic) => eval_basic(env, basic, sites),
        Expr::Unop(UnOp::Cast(target), operand) => {
            // A succeeding checkcast narrows the set to compatible sites.
            eval_basic(env, operand, sites).filter_with_compatible(
                eval.hierarchy,
                eval.sites,
                target,
            )
        }
        Expr::Unop(_, _) => AbVSet::Primitive,
        Expr::Binop(BinOp::ArrayLoad(element), _, _) => {
            if element.is_reference() {
                AbVSet::Top
            } else {
                AbVSet::Primitive
            }
        }
        Expr::Binop(_, _, _) => AbVSet::Primitive,
        Expr::Field(object, class_name, field) => {
            if !field.field_type.is_reference() {
                return AbVSet::Primitive;
            }
            let objects = eval_basic(env, object, sites);
            state
                .field(&(class_name.clone(), field.name.clone()))
                .fset2var(&objects)
        }
        Expr::StaticField(class_name, field) => {
            if !field.field_type.is_reference() {
                return AbVSet::Primitive;
            }
            let holder = sites
                .static_holder
                .map(AbVSet::singleton)
                .unwrap_or(AbVSet::Bot);
            state
                .field(&(class_name.clone(), field.name.clone()))
                .fset2var(&holder)
        }
    }
}

fn intern_instr_sites(
    key: &MethodKey,
    ir: &MethodIr,
    pc: usize,
    instr: &Instr,
    sites: &mut SiteTable,
) -> InstrSites {
    let point = ProgramPoint {
        class_name: key.0.clone(),
        method: key.1.clone(),
        pc: ir.pc_ir2bc.get(pc).copied().unwrap_or(pc),
    };
    let mut result = InstrSites::default();

    match instr {
        Instr::New { class_name, .. } => {
            result.allocation = Some(sites.intern(Site {
                context: vec![point.clone()],
                object_type: ObjectType::class(class_name.clone()),
            }));
        }
        Instr::NewArray {
            element_type, dims, ..
        } => {
            let mut array_type = element_type.clone();
            for _ in 0..dims.len() {
                array_type = ValueType::array(array_type);
            }
            if let ValueType::Object(object_type) = array_type {
                result.allocation = Some(sites.intern(Site {
                    context: vec![point.clone()],
                    object_type,
                }));
            }
        }
        _ => {}
    }

    let mut saw_string = false;
    let mut saw_class = false;
    instr.for_each_operand(|operand| match operand {
        BasicExpr::Const(Const::Str(_)) => saw_string = true,
        BasicExpr::Const(Const::Class(_)) => saw_class = true,
        _ => {}
    });
    if saw_string {
        result.string_constant = Some(sites.intern(Site {
            context: vec![point.clone()],
            object_type: ObjectType::class("java/lang/String"),
        }));
    }
    if saw_class {
        result.class_constant = Some(sites.intern(Site {
            context: vec![point.clone()],
            object_type: ObjectType::class("java/lang/Class"),
        }));
    }

    let static_class = match instr {
        Instr::AffectStaticField { class_name, .. } => Some(class_name.clone()),
        Instr::AffectVar {
            expr: Expr::StaticField(class_name, _),
            ..
        } => Some(class_name.clone()),
        _ => None,
    };
    if let Some(class_name) = static_class {
        result.static_holder = Some(sites.intern(Site {
            context: Vec::new(),
            object_type: ObjectType::class(class_name),
        }));
    }

    result
}

/// Static field keys read by the instruction's expressions.
fn field_reads(instr: &Instr) -> Vec<(String, String)> {
    let mut keys = Vec::new();
    let mut from_expr = |expr: &Expr| match expr {
        Expr::Field(_, class_name, field) | Expr::StaticField(class_name, field) => {
            keys.push((class_name.clone(), field.name.clone()));
        }
        _ => {}
    };
    match instr {
        Instr::AffectVar { expr, .. } => from_expr(expr),
        Instr::AffectStaticField { value, .. } => from_expr(value),
        _ => {}
    }
    keys
}

/// Resolved callee keys of an invoke instruction, from the RTA caches.
fn invoke_callees(
    program: &Program,
    key: &MethodKey,
    ir: &MethodIr,
    pc: usize,
    instr: &Instr,
) -> Vec<MethodKey> {
    if !matches!(
        instr,
        Instr::InvokeStatic { .. }
            | Instr::InvokeVirtual { .. }
            | Instr::InvokeNonVirtual { .. }
            | Instr::New { .. }
    ) {
        return Vec::new();
    }
    let Some(bytecode_pc) = ir.pc_ir2bc.get(pc).copied() else {
        return Vec::new();
    };
    match program.static_lookup_method(&key.0, &key.1, bytecode_pc) {
        Ok(targets) => targets.into_keys().collect(),
        Err(error) => {
            warn!(class = %key.0, method = %(key.1).0, pc = bytecode_pc, %error, "invoke site has no dispatch entry");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::PoolEntry;
    use crate::classpath::MemoryProvider;
    use crate::ir::VarOrigin;
    use crate::rta::{self, AnalysisOptions};
    use crate::test_fixtures::{
        class, concrete_method, field, field_ref, method_ref, object_class, pool, static_method,
    };

    /// `A a = new A(); a.f = new B(); x = a.f;` with a single allocation of B.
    fn points_to_fixture() -> MemoryProvider {
        let mut provider = MemoryProvider::default();
        provider.add(object_class());

        let mut a = class("com/example/A", "java/lang/Object", &[]);
        a.fields = vec![field("f", "Lcom/example/B;")];
        a.methods = vec![concrete_method("<init>", "()V", vec![0xb1])];
        provider.add(a);

        let mut b = class("com/example/B", "java/lang/Object", &[]);
        b.methods = vec![concrete_method("<init>", "()V", vec![0xb1])];
        provider.add(b);

        let mut main = class("com/example/Main", "java/lang/Object", &[]);
        main.pool = pool(vec![
            PoolEntry::Class("com/example/A".to_string()),
            method_ref("com/example/A", "<init>", "()V"),
            PoolEntry::Class("com/example/B".to_string()),
            method_ref("com/example/B", "<init>", "()V"),
            field_ref("com/example/A", "f", "Lcom/example/B;"),
        ]);
        main.methods = vec![static_method(
            "main",
            "()V",
            vec![
                0xbb, 0, 1, // new A
                0x59, // dup
                0xb7, 0, 2, // invokespecial A.<init>
                0x4b, // astore_0
                0x2a, // aload_0
                0xbb, 0, 3, // new B
                0x59, // dup
                0xb7, 0, 4, // invokespecial B.<init>
                0xb5, 0, 5, // putfield A.f
                0x2a, // aload_0
                0xb4, 0, 5, // getfield A.f
                0x4c, // astore_1
                0xb1, // return
            ],
        )];
        provider.add(main);
        provider
    }

    fn analyze_fixture(provider: &mut MemoryProvider, entries: &[EntryPoint]) -> ClassFlowResult {
        let program = rta::run(provider, entries, None, AnalysisOptions::default());
        analyze(&program, entries, &LowerOptions::default())
    }

    #[test]
    fn field_flow_reaches_the_loaded_variable() {
        let mut provider = points_to_fixture();
        let entries = vec![EntryPoint::new("com/example/Main", "main", "()V")];

        let result = analyze_fixture(&mut provider, &entries);

        let main_key = ("main".to_string(), "()V".to_string());
        let ir = result
            .method_ir("com/example/Main", &main_key)
            .expect("main analyzed");
        let return_pc = ir
            .code
            .iter()
            .position(|instr| matches!(instr, Instr::Return(None)))
            .expect("return present");
        let x = ir
            .vars
            .iter()
            .find(|(_, origin)| matches!(origin, VarOrigin::Original { slot: 1, .. }))
            .map(|(var, _)| var)
            .expect("local x");

        let site_b = result
            .site_of(&ObjectType::class("com/example/B"))
            .expect("B has a unique site");
        let env = result.locals_at("com/example/Main", &main_key, return_pc);
        assert_eq!(env.get_var(x), AbVSet::singleton(site_b));
    }

    #[test]
    fn allocation_sites_stay_distinct_per_program_point() {
        let mut provider = points_to_fixture();
        let entries = vec![EntryPoint::new("com/example/Main", "main", "()V")];

        let result = analyze_fixture(&mut provider, &entries);

        let site_a = result
            .site_of(&ObjectType::class("com/example/A"))
            .expect("A has a unique site");
        let site_b = result
            .site_of(&ObjectType::class("com/example/B"))
            .expect("B has a unique site");
        assert_ne!(site_a, site_b);
    }

    #[test]
    fn checkcast_narrows_to_compatible_sites() {
        let mut provider = MemoryProvider::default();
        provider.add(object_class());
        provider.add(class("com/example/A", "java/lang/Object", &[]));

        let mut b = class("com/example/B", "com/example/A", &[]);
        b.methods = vec![concrete_method("<init>", "()V", vec![0xb1])];
        provider.add(b);

        let mut c = class("com/example/C", "java/lang/Object", &[]);
        c.methods = vec![concrete_method("<init>", "()V", vec![0xb1])];
        provider.add(c);

        let mut main = class("com/example/Main", "java/lang/Object", &[]);
        main.pool = pool(vec![
            PoolEntry::Class("com/example/B".to_string()),
            method_ref("com/example/B", "<init>", "()V"),
            PoolEntry::Class("com/example/C".to_string()),
            method_ref("com/example/C", "<init>", "()V"),
            PoolEntry::Class("com/example/A".to_string()),
        ]);
        main.methods = vec![static_method(
            "main",
            "()V",
            vec![
                0xbb, 0, 1, // new B
                0x59, // dup
                0xb7, 0, 2, // invokespecial B.<init>
                0x4b, // astore_0
                0xbb, 0, 3, // new C
                0x59, // dup
                0xb7, 0, 4, // invokespecial C.<init>
                0x4c, // astore_1
                0x2a, // aload_0
                0xc0, 0, 5, // checkcast A
                0x4d, // astore_2
                0x2b, // aload_1
                0xc0, 0, 5, // checkcast A
                0x4e, // astore_3
                0xb1, // return
            ],
        )];
        provider.add(main);

        let entries = vec![EntryPoint::new("com/example/Main", "main", "()V")];
        let result = analyze_fixture(&mut provider, &entries);

        let main_key = ("main".to_string(), "()V".to_string());
        let ir = result
            .method_ir("com/example/Main", &main_key)
            .expect("main analyzed");
        let return_pc = ir
            .code
            .iter()
            .position(|instr| matches!(instr, Instr::Return(None)))
            .expect("return present");
        let local = |slot: u16| {
            ir.vars
                .iter()
                .find(|(_, origin)| {
                    matches!(origin, VarOrigin::Original { slot: s, .. } if *s == slot)
                })
                .map(|(var, _)| var)
                .expect("local present")
        };

        let site_b = result
            .site_of(&ObjectType::class("com/example/B"))
            .expect("B allocated once");
        let env = result.locals_at("com/example/Main", &main_key, return_pc);
        // The upcast of a B keeps its site; casting the unrelated C to A
        // leaves nothing.
        assert_eq!(env.get_var(local(2)), AbVSet::singleton(site_b));
        assert_eq!(env.get_var(local(3)), AbVSet::empty());
    }

    #[test]
    fn returned_allocations_flow_back_to_callers() {
        let mut provider = MemoryProvider::default();
        provider.add(object_class());

        let mut b = class("com/example/B", "java/lang/Object", &[]);
        b.methods = vec![concrete_method("<init>", "()V", vec![0xb1])];
        provider.add(b);

        let mut factory = class("com/example/Factory", "java/lang/Object", &[]);
        factory.pool = pool(vec![
            PoolEntry::Class("com/example/B".to_string()),
            method_ref("com/example/B", "<init>", "()V"),
            method_ref("com/example/Factory", "make", "()Lcom/example/B;"),
        ]);
        factory.methods = vec![
            static_method(
                "make",
                "()Lcom/example/B;",
                // new B; dup; invokespecial B.<init>; areturn
                vec![0xbb, 0, 1, 0x59, 0xb7, 0, 2, 0xb0],
            ),
            static_method(
                "main",
                "()V",
                // invokestatic make; astore_0; return
                vec![0xb8, 0, 3, 0x4b, 0xb1],
            ),
        ];
        provider.add(factory);

        let entries = vec![EntryPoint::new("com/example/Factory", "main", "()V")];
        let result = analyze_fixture(&mut provider, &entries);

        let main_key = ("main".to_string(), "()V".to_string());
        let ir = result
            .method_ir("com/example/Factory", &main_key)
            .expect("main analyzed");
        let return_pc = ir
            .code
            .iter()
            .position(|instr| matches!(instr, Instr::Return(None)))
            .expect("return present");
        let stored = ir
            .vars
            .iter()
            .find(|(_, origin)| matches!(origin, VarOrigin::Original { slot: 0, .. }))
            .map(|(var, _)| var)
            .expect("local 0");

        let site_b = result
            .site_of(&ObjectType::class("com/example/B"))
            .expect("B allocated once");
        let env = result.locals_at("com/example/Factory", &main_key, return_pc);
        assert_eq!(env.get_var(stored), AbVSet::singleton(site_b));
    }
}
