use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::descriptor::SigKey;
use crate::domains::{AbFSet, AbLocals, AbMethod};

/// Call-site sensitivity tag attached to state variables. The provided
/// [`InsensitiveContext`] is the empty tag.
pub trait ContextTag: Clone + Ord + fmt::Debug + Default {}

/// Context-insensitive analysis: every call site shares one tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct InsensitiveContext;

impl ContextTag for InsensitiveContext {}

/// Identity of a static field in the state.
pub type FieldKey = (String, String);
/// Identity of a method in the state.
pub type MethodKey = (String, SigKey);

/// One variable of the equation system.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum StateVar<C: ContextTag> {
    Field(FieldKey),
    Method(C, MethodKey),
    Pc(C, MethodKey, usize),
}

/// Value carried by a state variable; the kind always matches the variable.
#[derive(Clone, Debug)]
pub enum StateValue {
    Field(AbFSet),
    Method(AbMethod),
    Locals(AbLocals),
}

/// The full analysis state: field, method, and program-point domains.
#[derive(Clone, Debug, Default)]
pub struct State<C: ContextTag> {
    fields: BTreeMap<FieldKey, AbFSet>,
    methods: BTreeMap<(C, MethodKey), AbMethod>,
    pcs: BTreeMap<(C, MethodKey, usize), AbLocals>,
}

impl<C: ContextTag> State<C> {
    pub fn field(&self, key: &FieldKey) -> AbFSet {
        self.fields.get(key).cloned().unwrap_or(AbFSet::Bot)
    }

    pub fn method(&self, context: &C, key: &MethodKey) -> AbMethod {
        self.methods
            .get(&(context.clone(), key.clone()))
            .cloned()
            .unwrap_or(AbMethod::Bot)
    }

    pub fn locals(&self, context: &C, key: &MethodKey, pc: usize) -> AbLocals {
        self.pcs
            .get(&(context.clone(), key.clone(), pc))
            .cloned()
            .unwrap_or(AbLocals::Bot)
    }

    /// Join a value into a variable; returns whether the state grew.
    pub fn join(&mut self, var: &StateVar<C>, value: StateValue) -> bool {
        match (var, value) {
            (StateVar::Field(key), StateValue::Field(value)) => self
                .fields
                .entry(key.clone())
                .or_insert(AbFSet::Bot)
                .join_into(&value),
            (StateVar::Method(context, key), StateValue::Method(value)) => self
                .methods
                .entry((context.clone(), key.clone()))
                .or_insert(AbMethod::Bot)
                .join_into(&value),
            (StateVar::Pc(context, key, pc), StateValue::Locals(value)) => self
                .pcs
                .entry((context.clone(), key.clone(), *pc))
                .or_insert(AbLocals::Bot)
                .join_into(&value),
            (var, value) => {
                debug_assert!(false, "state value kind mismatch at {var:?}: {value:?}");
                false
            }
        }
    }
}

/// A monotone transfer from source variables to one destination.
pub struct Constraint<'a, C: ContextTag> {
    pub sources: Vec<StateVar<C>>,
    pub target: StateVar<C>,
    pub transfer: Box<dyn Fn(&State<C>) -> StateValue + 'a>,
}

impl<'a, C: ContextTag> fmt::Debug for Constraint<'a, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("sources", &self.sources)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Run the constraint system to its least fixpoint.
///
/// Every constraint is evaluated once to seed the state, then a dirty-set
/// worklist re-evaluates the constraints whose sources changed. The dirty set
/// is ordered, so iteration order is deterministic; the result does not
/// depend on it by monotonicity.
pub fn solve<C: ContextTag>(state: &mut State<C>, constraints: &[Constraint<'_, C>]) {
    let mut by_source: BTreeMap<StateVar<C>, Vec<usize>> = BTreeMap::new();
    for (index, constraint) in constraints.iter().enumerate() {
        for source in &constraint.sources {
            by_source.entry(source.clone()).or_default().push(index);
        }
    }

    let mut dirty: BTreeSet<StateVar<C>> = BTreeSet::new();
    for constraint in constraints {
        let value = (constraint.transfer)(state);
        if state.join(&constraint.target, value) {
            dirty.insert(constraint.target.clone());
        }
    }

    while let Some(var) = dirty.pop_first() {
        let Some(dependents) = by_source.get(&var) else {
            continue;
        };
        for index in dependents {
            let constraint = &constraints[*index];
            let value = (constraint.transfer)(state);
            if state.join(&constraint.target, value) {
                dirty.insert(constraint.target.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ObjectType;
    use crate::domains::{AbVSet, Site, SiteTable};
    use crate::ir::Var;

    fn method_key(name: &str) -> MethodKey {
        (
            "com/example/Main".to_string(),
            (name.to_string(), "()V".to_string()),
        )
    }

    #[test]
    fn chain_of_transfers_reaches_fixpoint() {
        let mut table = SiteTable::default();
        let site = table.intern(Site {
            context: Vec::new(),
            object_type: ObjectType::class("com/example/A"),
        });

        let a = StateVar::Pc(InsensitiveContext, method_key("m"), 0);
        let b = StateVar::Pc(InsensitiveContext, method_key("m"), 1);
        let c = StateVar::Pc(InsensitiveContext, method_key("m"), 2);

        // a := {site at var 0}; b := a; c := b
        let constraints = vec![
            Constraint {
                sources: Vec::new(),
                target: a.clone(),
                transfer: Box::new(move |_: &State<InsensitiveContext>| {
                    StateValue::Locals(AbLocals::empty().set_var(Var(0), AbVSet::singleton(site)))
                }),
            },
            Constraint {
                sources: vec![a.clone()],
                target: b.clone(),
                transfer: Box::new(|state: &State<InsensitiveContext>| {
                    StateValue::Locals(state.locals(&InsensitiveContext, &method_key("m"), 0))
                }),
            },
            Constraint {
                sources: vec![b.clone()],
                target: c.clone(),
                transfer: Box::new(|state: &State<InsensitiveContext>| {
                    StateValue::Locals(state.locals(&InsensitiveContext, &method_key("m"), 1))
                }),
            },
        ];

        let mut state = State::default();
        solve(&mut state, &constraints);

        let end = state.locals(&InsensitiveContext, &method_key("m"), 2);
        assert_eq!(end.get_var(Var(0)), AbVSet::singleton(site));
    }

    #[test]
    fn cyclic_constraints_terminate_by_monotonicity() {
        let mut table = SiteTable::default();
        let first = table.intern(Site {
            context: Vec::new(),
            object_type: ObjectType::class("com/example/A"),
        });
        let second = table.intern(Site {
            context: Vec::new(),
            object_type: ObjectType::class("com/example/B"),
        });

        let a = StateVar::Pc(InsensitiveContext, method_key("loop"), 0);
        let b = StateVar::Pc(InsensitiveContext, method_key("loop"), 1);

        // a := {first} ∪ b; b := a ∪ {second}; the loop must converge with
        // both sites everywhere.
        let constraints = vec![
            Constraint {
                sources: vec![b.clone()],
                target: a.clone(),
                transfer: Box::new(move |state: &State<InsensitiveContext>| {
                    let mut env = state.locals(&InsensitiveContext, &method_key("loop"), 1);
                    if env.is_bot() {
                        env = AbLocals::empty();
                    }
                    let joined = AbVSet::join(env.get_var(Var(0)), &AbVSet::singleton(first));
                    StateValue::Locals(AbLocals::empty().set_var(Var(0), joined))
                }),
            },
            Constraint {
                sources: vec![a.clone()],
                target: b.clone(),
                transfer: Box::new(move |state: &State<InsensitiveContext>| {
                    let mut env = state.locals(&InsensitiveContext, &method_key("loop"), 0);
                    if env.is_bot() {
                        env = AbLocals::empty();
                    }
                    let joined = AbVSet::join(env.get_var(Var(0)), &AbVSet::singleton(second));
                    StateValue::Locals(AbLocals::empty().set_var(Var(0), joined))
                }),
            },
        ];

        let mut state = State::default();
        solve(&mut state, &constraints);

        let expected: AbVSet = AbVSet::join(AbVSet::singleton(first), &AbVSet::singleton(second));
        assert_eq!(
            state
                .locals(&InsensitiveContext, &method_key("loop"), 0)
                .get_var(Var(0)),
            expected
        );
        assert_eq!(
            state
                .locals(&InsensitiveContext, &method_key("loop"), 1)
                .get_var(Var(0)),
            expected
        );
    }

    #[test]
    fn method_summaries_flow_through_method_vars() {
        let mut table = SiteTable::default();
        let site = table.intern(Site {
            context: Vec::new(),
            object_type: ObjectType::class("com/example/A"),
        });

        let callee = StateVar::Method(InsensitiveContext, method_key("callee"));
        let caller_pc = StateVar::Pc(InsensitiveContext, method_key("caller"), 1);

        let constraints = vec![
            Constraint {
                sources: Vec::new(),
                target: callee.clone(),
                transfer: Box::new(move |_: &State<InsensitiveContext>| {
                    StateValue::Method(AbMethod::returning(AbVSet::singleton(site)))
                }),
            },
            Constraint {
                sources: vec![callee.clone()],
                target: caller_pc.clone(),
                transfer: Box::new(|state: &State<InsensitiveContext>| {
                    let summary = state.method(&InsensitiveContext, &method_key("callee"));
                    StateValue::Locals(AbLocals::empty().set_var(Var(2), summary.ret()))
                }),
            },
        ];

        let mut state = State::default();
        solve(&mut state, &constraints);

        assert_eq!(
            state
                .locals(&InsensitiveContext, &method_key("caller"), 1)
                .get_var(Var(2)),
            AbVSet::singleton(site)
        );
    }
}
