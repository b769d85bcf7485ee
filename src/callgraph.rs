use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::SigKey;
use crate::opcode::{self, OpCode};
use crate::program::Program;

/// One resolved call edge, from a call site to a concrete callee.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller_class: String,
    pub caller_method: SigKey,
    pub pc: usize,
    pub callee_class: String,
    pub callee_method: SigKey,
}

/// Export every call edge of the program, deterministically ordered.
///
/// Bytecode sites carry their pc; edges contributed by native stubs carry
/// pc 0, as stubs name callees without locations.
pub fn edges(program: &Program) -> Vec<CallEdge> {
    let mut edges = BTreeSet::new();

    for method_id in program.parsed_methods() {
        let node = program.hierarchy.node(method_id.class);
        let method = &node.methods[method_id.index];
        let Some(code) = &method.code else { continue };
        let decoded = match opcode::decode_method(&code.bytecode, &node.pool) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(class = %node.name, method = %method.signature, %error, "skipping undecodable method in export");
                continue;
            }
        };
        let caller_method = method.signature.key();
        for instruction in decoded {
            if !matches!(
                instruction.op,
                OpCode::InvokeVirtual(_)
                    | OpCode::InvokeInterface(_)
                    | OpCode::InvokeSpecial(_)
                    | OpCode::InvokeStatic(_)
            ) {
                continue;
            }
            let Ok(targets) =
                program.static_lookup_method(&node.name, &caller_method, instruction.pc)
            else {
                continue;
            };
            for ((callee_class, callee_method), _) in targets {
                edges.insert(CallEdge {
                    caller_class: node.name.clone(),
                    caller_method: caller_method.clone(),
                    pc: instruction.pc,
                    callee_class,
                    callee_method,
                });
            }
        }
    }

    for ((caller_class, caller_method), targets) in &program.native_edges {
        for (callee_class, callee_method) in targets {
            edges.insert(CallEdge {
                caller_class: caller_class.clone(),
                caller_method: caller_method.clone(),
                pc: 0,
                callee_class: callee_class.clone(),
                callee_method: callee_method.clone(),
            });
        }
    }

    edges.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::PoolEntry;
    use crate::classpath::MemoryProvider;
    use crate::rta::{self, AnalysisOptions, EntryPoint};
    use crate::test_fixtures::{class, concrete_method, method_ref, object_class, pool, static_method};

    #[test]
    fn exports_the_devirtualized_edge() {
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

        let program = rta::run(
            &mut provider,
            &[EntryPoint::new("com/example/Main", "main", "()V")],
            None,
            AnalysisOptions::default(),
        );

        let edges = edges(&program);

        let virtual_edges: Vec<&CallEdge> = edges
            .iter()
            .filter(|edge| edge.callee_method.0 == "m")
            .collect();
        assert_eq!(virtual_edges.len(), 1);
        let edge = virtual_edges[0];
        assert_eq!(edge.caller_class, "com/example/Main");
        assert_eq!(edge.pc, 9);
        assert_eq!(edge.callee_class, "com/example/B");
    }

    #[test]
    fn edges_serialize_to_json() {
        let edge = CallEdge {
            caller_class: "com/example/Main".to_string(),
            caller_method: ("main".to_string(), "()V".to_string()),
            pc: 9,
            callee_class: "com/example/B".to_string(),
            callee_method: ("m".to_string(), "()V".to_string()),
        };

        let json = serde_json::to_string(&edge).expect("serialize edge");
        let back: CallEdge = serde_json::from_str(&json).expect("deserialize edge");

        assert_eq!(back, edge);
    }
}
