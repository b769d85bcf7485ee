use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::descriptor::{ObjectType, SigKey, ValueType};
use crate::hierarchy::Hierarchy;
use crate::ir::Var;

/// A point in the program: method plus IR pc.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProgramPoint {
    pub class_name: String,
    pub method: SigKey,
    pub pc: usize,
}

/// An allocation site: the allocation context (possibly empty) paired with
/// the allocated object type. Identity is structural.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Site {
    pub context: Vec<ProgramPoint>,
    pub object_type: ObjectType,
}

/// Stable integer identity of an interned site.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SiteId(pub usize);

/// Program-wide site interner: structural identity becomes integer identity.
#[derive(Clone, Debug, Default)]
pub struct SiteTable {
    sites: Vec<Site>,
    index: BTreeMap<Site, SiteId>,
}

impl SiteTable {
    pub fn intern(&mut self, site: Site) -> SiteId {
        if let Some(id) = self.index.get(&site) {
            return *id;
        }
        let id = SiteId(self.sites.len());
        self.sites.push(site.clone());
        self.index.insert(site, id);
        id
    }

    pub fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.0]
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SiteId, &Site)> {
        self.sites
            .iter()
            .enumerate()
            .map(|(index, site)| (SiteId(index), site))
    }
}

/// Value abstraction: which allocation sites may a value denote.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbVSet {
    Bot,
    Primitive,
    Set(BTreeSet<SiteId>),
    Top,
}

impl AbVSet {
    pub fn singleton(site: SiteId) -> AbVSet {
        AbVSet::Set(BTreeSet::from([site]))
    }

    pub fn empty() -> AbVSet {
        AbVSet::Set(BTreeSet::new())
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, AbVSet::Bot)
    }

    /// Least upper bound; returns whether `self` changed.
    pub fn join_into(&mut self, other: &AbVSet) -> bool {
        match (&mut *self, other) {
            (_, AbVSet::Bot) => false,
            (AbVSet::Top, _) => false,
            (AbVSet::Bot, _) => {
                *self = other.clone();
                true
            }
            (_, AbVSet::Top) => {
                *self = AbVSet::Top;
                true
            }
            (AbVSet::Primitive, AbVSet::Primitive) => false,
            (AbVSet::Set(left), AbVSet::Set(right)) => {
                let before = left.len();
                left.extend(right.iter().copied());
                left.len() != before
            }
            (AbVSet::Primitive, AbVSet::Set(_)) | (AbVSet::Set(_), AbVSet::Primitive) => {
                // Type-unsound mixing is detected by the solver, not asserted
                // away; keep the coercion but surface it.
                warn!("joining primitive and reference abstractions, widening to top");
                *self = AbVSet::Top;
                true
            }
        }
    }

    pub fn join(mut left: AbVSet, right: &AbVSet) -> AbVSet {
        left.join_into(right);
        left
    }

    /// Greatest lower bound.
    pub fn inter(&self, other: &AbVSet) -> AbVSet {
        match (self, other) {
            (AbVSet::Bot, _) | (_, AbVSet::Bot) => AbVSet::Bot,
            (AbVSet::Top, value) | (value, AbVSet::Top) => value.clone(),
            (AbVSet::Primitive, AbVSet::Primitive) => AbVSet::Primitive,
            (AbVSet::Set(left), AbVSet::Set(right)) => {
                AbVSet::Set(left.intersection(right).copied().collect())
            }
            (AbVSet::Primitive, AbVSet::Set(_)) | (AbVSet::Set(_), AbVSet::Primitive) => {
                AbVSet::Bot
            }
        }
    }

    /// Drop the allocation context, keeping only object types. `None` means
    /// every type is possible.
    pub fn concretize(&self, table: &SiteTable) -> Option<BTreeSet<ObjectType>> {
        match self {
            AbVSet::Top => None,
            AbVSet::Bot | AbVSet::Primitive => Some(BTreeSet::new()),
            AbVSet::Set(sites) => Some(
                sites
                    .iter()
                    .map(|site| table.site(*site).object_type.clone())
                    .collect(),
            ),
        }
    }

    /// Keep the sites whose type is compatible with `target`.
    pub fn filter_with_compatible(
        &self,
        hierarchy: &Hierarchy,
        table: &SiteTable,
        target: &ObjectType,
    ) -> AbVSet {
        self.filter_sites(table, |site| {
            hierarchy.object_subtype(&site.object_type, target)
        })
    }

    /// Keep the sites whose type is not compatible with `target`.
    pub fn filter_with_uncompatible(
        &self,
        hierarchy: &Hierarchy,
        table: &SiteTable,
        target: &ObjectType,
    ) -> AbVSet {
        self.filter_sites(table, |site| {
            !hierarchy.object_subtype(&site.object_type, target)
        })
    }

    fn filter_sites(&self, table: &SiteTable, keep: impl Fn(&Site) -> bool) -> AbVSet {
        match self {
            AbVSet::Bot => AbVSet::Bot,
            AbVSet::Top => AbVSet::Top,
            AbVSet::Primitive => {
                debug_assert!(false, "subtype filter applied to a primitive abstraction");
                AbVSet::Bot
            }
            AbVSet::Set(sites) => AbVSet::Set(
                sites
                    .iter()
                    .filter(|site| keep(table.site(**site)))
                    .copied()
                    .collect(),
            ),
        }
    }
}

/// Heap abstraction for one field: per-site value abstraction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbFSet {
    Bot,
    Map(BTreeMap<SiteId, AbVSet>),
}

impl AbFSet {
    pub fn is_bot(&self) -> bool {
        matches!(self, AbFSet::Bot)
    }

    /// Field store: every site the object may be gains the stored value.
    pub fn var2fset(objects: &AbVSet, value: &AbVSet) -> AbFSet {
        match objects {
            AbVSet::Bot | AbVSet::Top => AbFSet::Bot,
            AbVSet::Primitive => {
                debug_assert!(false, "field store through a primitive abstraction");
                AbFSet::Bot
            }
            AbVSet::Set(sites) => AbFSet::Map(
                sites
                    .iter()
                    .map(|site| (*site, value.clone()))
                    .collect(),
            ),
        }
    }

    /// Field load: union of the abstraction at every site the object may be.
    pub fn fset2var(&self, objects: &AbVSet) -> AbVSet {
        let AbFSet::Map(map) = self else {
            return AbVSet::Bot;
        };
        match objects {
            AbVSet::Bot => AbVSet::Bot,
            AbVSet::Top => AbVSet::Top,
            AbVSet::Primitive => {
                debug_assert!(false, "field load through a primitive abstraction");
                AbVSet::Bot
            }
            AbVSet::Set(sites) => {
                let mut result = AbVSet::Bot;
                for site in sites {
                    if let Some(value) = map.get(site) {
                        result.join_into(value);
                    }
                }
                result
            }
        }
    }

    /// Pointwise join; returns whether `self` changed.
    pub fn join_into(&mut self, other: &AbFSet) -> bool {
        match (&mut *self, other) {
            (_, AbFSet::Bot) => false,
            (AbFSet::Bot, _) => {
                *self = other.clone();
                true
            }
            (AbFSet::Map(left), AbFSet::Map(right)) => {
                let mut changed = false;
                for (site, value) in right {
                    changed |= left.entry(*site).or_insert(AbVSet::Bot).join_into(value);
                }
                changed
            }
        }
    }
}

/// Per-pc environment: variable index to value abstraction. `Bot` is an
/// unreachable pc.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbLocals {
    Bot,
    Locals(BTreeMap<usize, AbVSet>),
}

impl AbLocals {
    pub fn empty() -> AbLocals {
        AbLocals::Locals(BTreeMap::new())
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, AbLocals::Bot)
    }

    pub fn get_var(&self, var: Var) -> AbVSet {
        match self {
            AbLocals::Bot => AbVSet::Bot,
            AbLocals::Locals(map) => map.get(&var.index()).cloned().unwrap_or(AbVSet::Bot),
        }
    }

    /// Assignment; an unreachable value makes the whole environment
    /// unreachable.
    pub fn set_var(&self, var: Var, value: AbVSet) -> AbLocals {
        match self {
            AbLocals::Bot => AbLocals::Bot,
            AbLocals::Locals(map) => {
                if value.is_bot() {
                    return AbLocals::Bot;
                }
                let mut updated = map.clone();
                updated.insert(var.index(), value);
                AbLocals::Locals(updated)
            }
        }
    }

    /// Pointwise join; returns whether `self` changed.
    pub fn join_into(&mut self, other: &AbLocals) -> bool {
        match (&mut *self, other) {
            (_, AbLocals::Bot) => false,
            (AbLocals::Bot, _) => {
                *self = other.clone();
                true
            }
            (AbLocals::Locals(left), AbLocals::Locals(right)) => {
                let mut changed = false;
                for (index, value) in right {
                    changed |= left.entry(*index).or_insert(AbVSet::Bot).join_into(value);
                }
                changed
            }
        }
    }
}

/// Method summary: argument abstractions, return, and thrown exceptions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbMethod {
    Bot,
    Reachable {
        /// Keyed by parameter position (receiver first for instance methods).
        args: AbLocals,
        ret: AbVSet,
        exc: AbVSet,
    },
}

impl AbMethod {
    pub fn is_bot(&self) -> bool {
        matches!(self, AbMethod::Bot)
    }

    pub fn reachable(args: AbLocals) -> AbMethod {
        AbMethod::Reachable {
            args,
            ret: AbVSet::Bot,
            exc: AbVSet::Bot,
        }
    }

    pub fn returning(ret: AbVSet) -> AbMethod {
        AbMethod::Reachable {
            args: AbLocals::Bot,
            ret,
            exc: AbVSet::Bot,
        }
    }

    pub fn throwing(exc: AbVSet) -> AbMethod {
        AbMethod::Reachable {
            args: AbLocals::Bot,
            ret: AbVSet::Bot,
            exc,
        }
    }

    pub fn ret(&self) -> AbVSet {
        match self {
            AbMethod::Bot => AbVSet::Bot,
            AbMethod::Reachable { ret, .. } => ret.clone(),
        }
    }

    pub fn exc(&self) -> AbVSet {
        match self {
            AbMethod::Bot => AbVSet::Bot,
            AbMethod::Reachable { exc, .. } => exc.clone(),
        }
    }

    /// Project the position-keyed argument abstractions onto the target
    /// method's parameter variables.
    pub fn init_locals(&self, params: &[(ValueType, Var)]) -> AbLocals {
        match self {
            AbMethod::Bot => AbLocals::Bot,
            AbMethod::Reachable { args, .. } => {
                let mut locals = BTreeMap::new();
                for (position, (_, var)) in params.iter().enumerate() {
                    let value = args.get_var(Var(position));
                    if !value.is_bot() {
                        locals.insert(var.index(), value);
                    }
                }
                AbLocals::Locals(locals)
            }
        }
    }

    /// Componentwise join; returns whether `self` changed.
    pub fn join_into(&mut self, other: &AbMethod) -> bool {
        match (&mut *self, other) {
            (_, AbMethod::Bot) => false,
            (AbMethod::Bot, _) => {
                *self = other.clone();
                true
            }
            (
                AbMethod::Reachable { args, ret, exc },
                AbMethod::Reachable {
                    args: other_args,
                    ret: other_ret,
                    exc: other_exc,
                },
            ) => {
                let mut changed = args.join_into(other_args);
                changed |= ret.join_into(other_ret);
                changed |= exc.join_into(other_exc);
                changed
            }
        }
    }
}
