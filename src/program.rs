use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::descriptor::SigKey;
use crate::error::ResolveError;
use crate::hierarchy::{ClassId, ClassNode, Hierarchy, MethodId};
use crate::opcode::{self, OpCode};

/// Call-site key: receiver class named at the site plus method signature.
pub type CallKey = (String, SigKey);
/// Resolved target key: declaring class plus method signature.
pub type TargetKey = (String, SigKey);

pub type VirtualCache = BTreeMap<CallKey, BTreeMap<TargetKey, MethodId>>;
pub type DirectCache = BTreeMap<CallKey, (TargetKey, MethodId)>;
pub type SpecialCache = BTreeMap<(String, CallKey), (TargetKey, MethodId)>;

/// A resolution failure recorded at one call or field site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionFailure {
    pub class_name: String,
    pub method: SigKey,
    pub pc: usize,
    pub error: ResolveError,
}

/// The RTA fixpoint: hierarchy, parsed methods, and dispatch caches.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub hierarchy: Hierarchy,
    pub virtual_cache: VirtualCache,
    pub interface_cache: VirtualCache,
    pub static_cache: DirectCache,
    pub special_cache: SpecialCache,
    pub native_methods: BTreeSet<TargetKey>,
    pub native_edges: BTreeMap<TargetKey, BTreeSet<TargetKey>>,
    pub failures: Vec<ResolutionFailure>,
}

impl Program {
    /// Every method the driver parsed, in deterministic order.
    pub fn parsed_methods(&self) -> Vec<MethodId> {
        let mut parsed = Vec::new();
        for (index, class) in self.hierarchy.classes.iter().enumerate() {
            for (method_index, method) in class.methods.iter().enumerate() {
                if method.has_been_parsed {
                    parsed.push(MethodId {
                        class: ClassId(index),
                        index: method_index,
                    });
                }
            }
        }
        parsed
    }

    /// Possible callees of the invoke opcode at `pc` inside the named method.
    pub fn static_lookup_method(
        &self,
        class_name: &str,
        method: &SigKey,
        pc: usize,
    ) -> Result<BTreeMap<TargetKey, MethodId>> {
        let class_id = self
            .hierarchy
            .id_of(class_name)
            .with_context(|| format!("unknown class {class_name}"))?;
        let node = self.hierarchy.node(class_id);
        let method_index = node
            .method_index(method)
            .with_context(|| format!("unknown method {}.{}{}", class_name, method.0, method.1))?;
        let code = node.methods[method_index]
            .code
            .as_ref()
            .with_context(|| "method has no code")?;
        let decoded = opcode::decode_method(&code.bytecode, &node.pool)
            .map_err(|err| anyhow::anyhow!("decode {class_name}.{}: {err}", method.0))?;
        let op = decoded
            .iter()
            .find(|candidate| candidate.pc == pc)
            .with_context(|| format!("no opcode at pc {pc}"))?;

        let lookup = match &op.op {
            OpCode::InvokeVirtual(method_ref) => self
                .virtual_cache
                .get(&(
                    method_ref.receiver_class().to_string(),
                    method_ref.signature.key(),
                ))
                .cloned()
                .unwrap_or_default(),
            OpCode::InvokeInterface(method_ref) => self
                .interface_cache
                .get(&(
                    method_ref.receiver_class().to_string(),
                    method_ref.signature.key(),
                ))
                .cloned()
                .unwrap_or_default(),
            OpCode::InvokeStatic(method_ref) => self
                .static_cache
                .get(&(
                    method_ref.receiver_class().to_string(),
                    method_ref.signature.key(),
                ))
                .map(|(target, id)| BTreeMap::from([(target.clone(), *id)]))
                .unwrap_or_default(),
            OpCode::InvokeSpecial(method_ref) => self
                .special_cache
                .get(&(
                    class_name.to_string(),
                    (
                        method_ref.receiver_class().to_string(),
                        method_ref.signature.key(),
                    ),
                ))
                .map(|(target, id)| BTreeMap::from([(target.clone(), *id)]))
                .unwrap_or_default(),
            other => anyhow::bail!("opcode at pc {pc} is not an invoke: {other:?}"),
        };
        Ok(lookup)
    }

    /// Serde-friendly mirror; lossless in both directions.
    pub fn snapshot(&self) -> ProgramSnapshot {
        ProgramSnapshot {
            classes: self.hierarchy.classes.clone(),
            by_name: self
                .hierarchy
                .by_name
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect(),
            implementers: self
                .hierarchy
                .implementers
                .iter()
                .map(|(interface, classes)| (*interface, classes.iter().copied().collect()))
                .collect(),
            virtual_cache: flatten_virtual(&self.virtual_cache),
            interface_cache: flatten_virtual(&self.interface_cache),
            static_cache: self
                .static_cache
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            special_cache: self
                .special_cache
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            native_methods: self.native_methods.iter().cloned().collect(),
            native_edges: self
                .native_edges
                .iter()
                .map(|(from, to)| (from.clone(), to.iter().cloned().collect()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: ProgramSnapshot) -> Program {
        let hierarchy = Hierarchy::from_parts(
            snapshot.classes,
            snapshot.by_name.into_iter().collect(),
            snapshot
                .implementers
                .into_iter()
                .map(|(interface, classes)| (interface, classes.into_iter().collect()))
                .collect(),
        );
        Program {
            hierarchy,
            virtual_cache: unflatten_virtual(snapshot.virtual_cache),
            interface_cache: unflatten_virtual(snapshot.interface_cache),
            static_cache: snapshot.static_cache.into_iter().collect(),
            special_cache: snapshot.special_cache.into_iter().collect(),
            native_methods: snapshot.native_methods.into_iter().collect(),
            native_edges: snapshot
                .native_edges
                .into_iter()
                .map(|(from, to)| (from, to.into_iter().collect()))
                .collect(),
            failures: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot()).context("serialize program snapshot")
    }

    pub fn from_json(data: &str) -> Result<Program> {
        let snapshot = serde_json::from_str(data).context("parse program snapshot")?;
        Ok(Program::from_snapshot(snapshot))
    }
}

/// Persisted form of [`Program`]: composite-key maps become entry vectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgramSnapshot {
    classes: Vec<ClassNode>,
    by_name: Vec<(String, ClassId)>,
    implementers: Vec<(ClassId, Vec<ClassId>)>,
    virtual_cache: Vec<(CallKey, Vec<(TargetKey, MethodId)>)>,
    interface_cache: Vec<(CallKey, Vec<(TargetKey, MethodId)>)>,
    static_cache: Vec<(CallKey, (TargetKey, MethodId))>,
    special_cache: Vec<((String, CallKey), (TargetKey, MethodId))>,
    native_methods: Vec<TargetKey>,
    native_edges: Vec<(TargetKey, Vec<TargetKey>)>,
}

fn flatten_virtual(cache: &VirtualCache) -> Vec<(CallKey, Vec<(TargetKey, MethodId)>)> {
    cache
        .iter()
        .map(|(key, targets)| {
            (
                key.clone(),
                targets
                    .iter()
                    .map(|(target, id)| (target.clone(), *id))
                    .collect(),
            )
        })
        .collect()
}

fn unflatten_virtual(entries: Vec<(CallKey, Vec<(TargetKey, MethodId)>)>) -> VirtualCache {
    entries
        .into_iter()
        .map(|(key, targets)| (key, targets.into_iter().collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::PoolEntry;
    use crate::classpath::MemoryProvider;
    use crate::rta::{self, AnalysisOptions, EntryPoint};
    use crate::test_fixtures::{class, concrete_method, method_ref, object_class, pool, static_method};

    fn analyzed_program() -> Program {
        let mut provider = MemoryProvider::default();
        provider.add(object_class());

        let mut a = class("com/example/A", "java/lang/Object", &[]);
        a.methods = vec![
            concrete_method("<init>", "()V", vec![0xb1]),
            concrete_method("m", "()V", vec![0xb1]),
        ];
        provider.add(a);

        let mut b = class("com/example/B", "com/example/A", &[]);
        b.methods = vec![
            concrete_method("<init>", "()V", vec![0xb1]),
            concrete_method("m", "()V", vec![0xb1]),
        ];
        provider.add(b);

        let mut main = class("com/example/Main", "java/lang/Object", &[]);
        main.pool = pool(vec![
            PoolEntry::Class("com/example/B".to_string()),
            method_ref("com/example/B", "<init>", "()V"),
            method_ref("com/example/A", "m", "()V"),
        ]);
        main.methods = vec![static_method(
            "main",
            "()V",
            vec![0xbb, 0, 1, 0x59, 0xb7, 0, 2, 0x4b, 0x2a, 0xb6, 0, 3, 0xb1],
        )];
        provider.add(main);

        rta::run(
            &mut provider,
            &[EntryPoint::new("com/example/Main", "main", "()V")],
            None,
            AnalysisOptions::default(),
        )
    }

    #[test]
    fn snapshot_round_trips_losslessly() {
        let program = analyzed_program();

        let reloaded = Program::from_json(&program.to_json().expect("serialize"))
            .expect("deserialize");

        assert_eq!(
            reloaded.hierarchy.by_name.len(),
            program.hierarchy.by_name.len()
        );
        assert_eq!(reloaded.virtual_cache, program.virtual_cache);
        assert_eq!(reloaded.interface_cache, program.interface_cache);
        assert_eq!(reloaded.static_cache, program.static_cache);
        assert_eq!(reloaded.special_cache, program.special_cache);
        assert_eq!(
            reloaded.parsed_methods().len(),
            program.parsed_methods().len()
        );

        let b_id = reloaded.hierarchy.id_of("com/example/B").expect("B kept");
        assert!(reloaded.hierarchy.node(b_id).is_instantiated);
    }

    #[test]
    fn reloaded_program_answers_the_same_lookups() {
        let program = analyzed_program();
        let reloaded = Program::from_json(&program.to_json().expect("serialize"))
            .expect("deserialize");
        let main = ("main".to_string(), "()V".to_string());

        let before = program
            .static_lookup_method("com/example/Main", &main, 9)
            .expect("lookup before");
        let after = reloaded
            .static_lookup_method("com/example/Main", &main, 9)
            .expect("lookup after");

        assert_eq!(before, after);
        assert!(!after.is_empty());
    }
}
