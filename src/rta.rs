use std::collections::{BTreeSet, VecDeque};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::classpath::ClassProvider;
use crate::descriptor::SigKey;
use crate::error::ResolveError;
use crate::hierarchy::{ClassId, Hierarchy, MethodId};
use crate::ir::Const;
use crate::natives::NativeStubs;
use crate::opcode::{self, FieldRef, MethodRef, OpCode};
use crate::program::{Program, ResolutionFailure, TargetKey};

/// Analysis-wide configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnalysisOptions {
    /// Typecheck stack slots while lowering to IR.
    pub bcv: bool,
    /// Emit `CheckLink` in the IR for link-triggering opcodes.
    pub check_link: bool,
    /// Follow native stubs; implied by passing a stubs table to `run`.
    pub parse_natives: bool,
}

/// One analysis entry point.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPoint {
    pub class_name: String,
    pub method: SigKey,
}

impl EntryPoint {
    pub fn new(class_name: &str, name: &str, descriptor: &str) -> EntryPoint {
        EntryPoint {
            class_name: class_name.to_string(),
            method: (name.to_string(), descriptor.to_string()),
        }
    }

    /// Parse `pkg/Class#name(descriptor)returntype`.
    pub fn parse(spec: &str) -> Result<EntryPoint> {
        let (class_name, method) = spec
            .split_once('#')
            .with_context(|| format!("entry point {spec:?} is missing '#'"))?;
        let open = method
            .find('(')
            .with_context(|| format!("entry point {spec:?} is missing a descriptor"))?;
        Ok(EntryPoint::new(class_name, &method[..open], &method[open..]))
    }
}

/// Bootstrap entry points mirroring the HotSpot startup sequence.
pub fn default_entry_points() -> Vec<EntryPoint> {
    const CLINIT_CLASSES: [&str; 7] = [
        "java/lang/Object",
        "java/lang/System",
        "java/lang/ThreadGroup",
        "java/lang/Thread",
        "java/lang/ref/Finalizer",
        "java/lang/Class",
        "java/lang/OutOfMemoryError",
    ];
    const EXCEPTION_CLASSES: [&str; 6] = [
        "java/lang/NullPointerException",
        "java/lang/ArithmeticException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/ArrayStoreException",
        "java/lang/ClassCastException",
        "java/lang/NegativeArraySizeException",
    ];
    let mut entries = Vec::new();
    for class_name in CLINIT_CLASSES {
        entries.push(EntryPoint::new(class_name, "<clinit>", "()V"));
    }
    entries.push(EntryPoint::new(
        "java/lang/System",
        "initializeSystemClass",
        "()V",
    ));
    for class_name in EXCEPTION_CLASSES {
        entries.push(EntryPoint::new(class_name, "<init>", "()V"));
    }
    entries
}

/// Run Rapid Type Analysis from the given entry points.
///
/// Every state update is monotone, so the workset drains to a fixpoint;
/// resolution failures are recorded per site and never abort the analysis.
pub fn run(
    provider: &mut dyn ClassProvider,
    entry_points: &[EntryPoint],
    stubs: Option<NativeStubs>,
    options: AnalysisOptions,
) -> Program {
    let parse_natives = options.parse_natives || stubs.is_some();
    let mut rta = Rta {
        provider,
        hierarchy: Hierarchy::default(),
        workset: VecDeque::new(),
        clinits: BTreeSet::new(),
        program: Program::default(),
        stubs,
        parse_natives,
    };

    for entry in entry_points {
        rta.add_entry(entry);
    }
    while let Some(method_id) = rta.workset.pop_front() {
        rta.process(method_id);
    }

    let Rta {
        hierarchy,
        mut program,
        ..
    } = rta;
    program.hierarchy = hierarchy;
    program
}

struct Rta<'p> {
    provider: &'p mut dyn ClassProvider,
    hierarchy: Hierarchy,
    workset: VecDeque<MethodId>,
    clinits: BTreeSet<ClassId>,
    /// Caches and failure log accumulate here; the hierarchy is attached last.
    program: Program,
    stubs: Option<NativeStubs>,
    parse_natives: bool,
}

impl<'p> Rta<'p> {
    fn resolve_class(&mut self, name: &str) -> Result<ClassId, ResolveError> {
        self.hierarchy.resolve(&mut *self.provider, name)
    }

    fn add_entry(&mut self, entry: &EntryPoint) {
        let class_id = match self.resolve_class(&entry.class_name) {
            Ok(class_id) => class_id,
            Err(error) => {
                debug!(class = %entry.class_name, %error, "entry point class unavailable");
                return;
            }
        };
        self.schedule_clinit(class_id);
        match self.lookup_concrete(class_id, &entry.method) {
            Ok((_, method_id)) => self.enqueue(method_id),
            Err(error) => {
                debug!(
                    class = %entry.class_name,
                    method = %entry.method.0,
                    %error,
                    "entry point method unavailable"
                );
            }
        }
    }

    fn enqueue(&mut self, method_id: MethodId) {
        let method = &mut self.hierarchy.node_mut(method_id.class).methods[method_id.index];
        if !method.has_been_parsed {
            method.has_been_parsed = true;
            self.workset.push_back(method_id);
        }
    }

    fn record_failure(&mut self, class_name: &str, method: &SigKey, pc: usize, error: ResolveError) {
        warn!(class = %class_name, method = %method.0, pc, %error, "resolution failed at site");
        self.program.failures.push(ResolutionFailure {
            class_name: class_name.to_string(),
            method: method.clone(),
            pc,
            error,
        });
    }

    fn process(&mut self, method_id: MethodId) {
        let node = self.hierarchy.node(method_id.class);
        let caller_class = node.name.clone();
        let caller_id = method_id.class;
        let method = &node.methods[method_id.index];
        let caller_method = method.signature.key();

        if method.is_native {
            self.process_native(&caller_class, &caller_method);
            return;
        }
        let Some(code) = method.code.clone() else {
            return;
        };
        let pool = node.pool.clone();

        let decoded = match opcode::decode_method(&code.bytecode, &pool) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(class = %caller_class, method = %caller_method.0, %error, "skipping undecodable method");
                return;
            }
        };

        for instruction in &decoded {
            let pc = instruction.pc;
            match &instruction.op {
                OpCode::New(class_name) => {
                    let class_name = class_name.clone();
                    self.instantiate_by_name(&caller_class, &caller_method, pc, &class_name);
                }
                OpCode::Const(Const::Class(_)) => {
                    // A class literal materialises a java.lang.Class object.
                    self.instantiate_by_name(&caller_class, &caller_method, pc, "java/lang/Class");
                }
                OpCode::GetStatic(field_ref) | OpCode::PutStatic(field_ref) => {
                    let field_ref = field_ref.clone();
                    self.resolve_static_field(&caller_class, &caller_method, pc, &field_ref);
                }
                OpCode::InvokeVirtual(method_ref) => {
                    let method_ref = method_ref.clone();
                    self.invoke_virtual(&caller_class, &caller_method, pc, &method_ref);
                }
                OpCode::InvokeInterface(method_ref) => {
                    let method_ref = method_ref.clone();
                    self.invoke_interface(&caller_class, &caller_method, pc, &method_ref);
                }
                OpCode::InvokeSpecial(method_ref) => {
                    let method_ref = method_ref.clone();
                    self.invoke_special(caller_id, &caller_class, &caller_method, pc, &method_ref);
                }
                OpCode::InvokeStatic(method_ref) => {
                    let method_ref = method_ref.clone();
                    self.invoke_static(&caller_class, &caller_method, pc, &method_ref);
                }
                OpCode::InvokeDynamic(signature) => {
                    debug!(
                        class = %caller_class,
                        method = %caller_method.0,
                        pc,
                        site = %signature,
                        "invokedynamic site has no call edges"
                    );
                }
                _ => {}
            }
        }
    }

    fn process_native(&mut self, class_name: &str, method: &SigKey) {
        let stub = if self.parse_natives {
            self.stubs
                .as_ref()
                .and_then(|stubs| stubs.get(class_name, method))
                .cloned()
        } else {
            None
        };
        let Some(stub) = stub else {
            warn!(class = %class_name, method = %method.0, "native method treated as opaque");
            self.program
                .native_methods
                .insert((class_name.to_string(), method.clone()));
            return;
        };
        for allocated in &stub.allocated_classes {
            self.instantiate_by_name(class_name, method, 0, allocated);
        }
        for callee in &stub.callees {
            let callee_key = (callee.name.clone(), callee.descriptor.clone());
            match self
                .resolve_class(&callee.class_name)
                .and_then(|class_id| self.lookup_concrete(class_id, &callee_key))
            {
                Ok((target, target_id)) => {
                    self.program
                        .native_edges
                        .entry((class_name.to_string(), method.clone()))
                        .or_default()
                        .insert(target);
                    self.enqueue(target_id);
                }
                Err(error) => self.record_failure(class_name, method, 0, error),
            }
        }
    }

    fn instantiate_by_name(
        &mut self,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        class_name: &str,
    ) {
        match self.resolve_class(class_name) {
            Ok(class_id) => self.instantiate(class_id),
            Err(error) => self.record_failure(caller_class, caller_method, pc, error),
        }
    }

    /// Mark a class instantiated and replay every memoised dispatch that the
    /// new receiver can answer.
    fn instantiate(&mut self, class_id: ClassId) {
        if self.hierarchy.node(class_id).is_instantiated {
            return;
        }
        self.hierarchy.node_mut(class_id).is_instantiated = true;
        let class_name = self.hierarchy.node(class_id).name.clone();

        for ancestor in self.hierarchy.ancestors(class_id) {
            let ancestor_name = self.hierarchy.node(ancestor).name.clone();
            self.hierarchy
                .node_mut(ancestor)
                .instantiated_subclasses
                .insert(class_name.clone(), class_id);
            let memoised: Vec<SigKey> = self
                .hierarchy
                .node(ancestor)
                .memorized_virtual_calls
                .iter()
                .cloned()
                .collect();
            for signature in memoised {
                if let Ok((target, target_id)) = self.lookup_concrete(class_id, &signature) {
                    self.program
                        .virtual_cache
                        .entry((ancestor_name.clone(), signature))
                        .or_default()
                        .insert(target, target_id);
                    self.enqueue(target_id);
                }
            }
        }

        for interface in self.hierarchy.interface_closure(class_id) {
            let interface_name = self.hierarchy.node(interface).name.clone();
            let memoised: Vec<SigKey> = self
                .hierarchy
                .node(interface)
                .memorized_interface_calls
                .iter()
                .cloned()
                .collect();
            for signature in memoised {
                if let Ok((target, target_id)) = self.lookup_concrete(class_id, &signature) {
                    self.program
                        .interface_cache
                        .entry((interface_name.clone(), signature))
                        .or_default()
                        .insert(target, target_id);
                    self.enqueue(target_id);
                }
            }
        }

        self.schedule_clinit(class_id);
    }

    /// Schedule `<clinit>`: classes walk their superclass chain, interfaces
    /// trigger only their own initialiser (JVM §5.5).
    fn schedule_clinit(&mut self, class_id: ClassId) {
        if self.hierarchy.node(class_id).is_interface() {
            self.schedule_own_clinit(class_id);
            return;
        }
        for ancestor in self.hierarchy.ancestors(class_id) {
            self.schedule_own_clinit(ancestor);
        }
    }

    fn schedule_own_clinit(&mut self, class_id: ClassId) {
        if !self.clinits.insert(class_id) {
            return;
        }
        let key = ("<clinit>".to_string(), "()V".to_string());
        if let Some(index) = self.hierarchy.node(class_id).method_index(&key) {
            self.enqueue(MethodId {
                class: class_id,
                index,
            });
        }
    }

    /// Whether the signature resolves statically anywhere in the receiver's
    /// hierarchy, abstract declarations included.
    fn method_exists(&self, receiver: ClassId, signature: &SigKey) -> bool {
        if self
            .hierarchy
            .ancestors(receiver)
            .into_iter()
            .any(|candidate| self.hierarchy.node(candidate).method_index(signature).is_some())
        {
            return true;
        }
        self.hierarchy
            .interface_closure(receiver)
            .into_iter()
            .any(|interface| self.hierarchy.node(interface).method_index(signature).is_some())
    }

    /// Private members resolve only inside their own nest: the outer class
    /// and its `Outer$Inner` companions.
    fn check_access(
        &self,
        caller_class: &str,
        target: &TargetKey,
        target_id: MethodId,
    ) -> Result<(), ResolveError> {
        let method = self.hierarchy.method(target_id);
        if method.is_private && nest_root(caller_class) != nest_root(&target.0) {
            let (member, _) = &target.1;
            return Err(ResolveError::IllegalAccess {
                class: target.0.clone(),
                member: member.clone(),
            });
        }
        Ok(())
    }

    /// JVM virtual lookup: walk up from the receiver class, then search
    /// superinterfaces for a concrete (default) method.
    fn lookup_concrete(
        &self,
        receiver: ClassId,
        signature: &SigKey,
    ) -> Result<(TargetKey, MethodId), ResolveError> {
        for candidate in self.hierarchy.ancestors(receiver) {
            let node = self.hierarchy.node(candidate);
            if let Some(index) = node.method_index(signature) {
                let method = &node.methods[index];
                if method.is_abstract {
                    return Err(ResolveError::AbstractMethod {
                        class: node.name.clone(),
                        name: signature.0.clone(),
                        descriptor: signature.1.clone(),
                    });
                }
                return Ok((
                    (node.name.clone(), signature.clone()),
                    MethodId {
                        class: candidate,
                        index,
                    },
                ));
            }
        }
        for interface in self.hierarchy.interface_closure(receiver) {
            let node = self.hierarchy.node(interface);
            if let Some(index) = node.method_index(signature) {
                let method = &node.methods[index];
                if !method.is_abstract && !method.is_static {
                    return Ok((
                        (node.name.clone(), signature.clone()),
                        MethodId {
                            class: interface,
                            index,
                        },
                    ));
                }
            }
        }
        Err(ResolveError::NoSuchMethod {
            class: self.hierarchy.node(receiver).name.clone(),
            name: signature.0.clone(),
            descriptor: signature.1.clone(),
        })
    }

    fn invoke_virtual(
        &mut self,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        method_ref: &MethodRef,
    ) {
        let receiver_name = method_ref.receiver_class().to_string();
        let signature = method_ref.signature.key();
        let receiver = match self.resolve_class(&receiver_name) {
            Ok(receiver) => receiver,
            Err(error) => {
                self.record_failure(caller_class, caller_method, pc, error);
                return;
            }
        };
        if !self.method_exists(receiver, &signature) {
            self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::NoSuchMethod {
                    class: receiver_name,
                    name: signature.0.clone(),
                    descriptor: signature.1.clone(),
                },
            );
            return;
        }
        self.hierarchy
            .node_mut(receiver)
            .memorized_virtual_calls
            .insert(signature.clone());
        let key = (receiver_name.clone(), signature.clone());
        self.program.virtual_cache.entry(key.clone()).or_default();

        let receivers: Vec<ClassId> = self
            .hierarchy
            .node(receiver)
            .instantiated_subclasses
            .values()
            .copied()
            .collect();
        let had_candidates = !receivers.is_empty();
        let mut resolved_any = false;
        for instantiated in receivers {
            match self.lookup_concrete(instantiated, &signature) {
                Ok((target, target_id)) => {
                    self.program
                        .virtual_cache
                        .entry(key.clone())
                        .or_default()
                        .insert(target, target_id);
                    self.enqueue(target_id);
                    resolved_any = true;
                }
                Err(error) => self.record_failure(caller_class, caller_method, pc, error),
            }
        }
        // The method resolves statically but no instantiated receiver
        // provides it: a distinct outcome from NoSuchMethodError.
        if had_candidates && !resolved_any {
            self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::InvokeNotFound {
                    caller_class: caller_class.to_string(),
                    caller_method: format!("{}{}", caller_method.0, caller_method.1),
                    callee_class: receiver_name,
                    callee_method: format!("{}{}", signature.0, signature.1),
                },
            );
        }
    }

    fn invoke_interface(
        &mut self,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        method_ref: &MethodRef,
    ) {
        let interface_name = method_ref.receiver_class().to_string();
        let signature = method_ref.signature.key();
        let interface = match self.resolve_class(&interface_name) {
            Ok(interface) => interface,
            Err(error) => {
                self.record_failure(caller_class, caller_method, pc, error);
                return;
            }
        };
        if !self.hierarchy.node(interface).is_interface() {
            self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::IncompatibleClassChange {
                    class: interface_name,
                    member: signature.0.clone(),
                },
            );
            return;
        }
        if !self.method_exists(interface, &signature) {
            self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::NoSuchMethod {
                    class: interface_name,
                    name: signature.0.clone(),
                    descriptor: signature.1.clone(),
                },
            );
            return;
        }
        self.hierarchy
            .node_mut(interface)
            .memorized_interface_calls
            .insert(signature.clone());
        let key = (interface_name.clone(), signature.clone());
        self.program.interface_cache.entry(key.clone()).or_default();

        let implementers: Vec<ClassId> = self
            .hierarchy
            .implementers
            .get(&interface)
            .map(|classes| classes.iter().copied().collect())
            .unwrap_or_default();
        let mut candidates = 0usize;
        let mut resolved_any = false;
        for implementer in implementers {
            if !self.hierarchy.node(implementer).is_instantiated {
                continue;
            }
            candidates += 1;
            match self.lookup_concrete(implementer, &signature) {
                Ok((target, target_id)) => {
                    self.program
                        .interface_cache
                        .entry(key.clone())
                        .or_default()
                        .insert(target, target_id);
                    self.enqueue(target_id);
                    resolved_any = true;
                }
                Err(error) => self.record_failure(caller_class, caller_method, pc, error),
            }
        }
        if candidates > 0 && !resolved_any {
            self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::InvokeNotFound {
                    caller_class: caller_class.to_string(),
                    caller_method: format!("{}{}", caller_method.0, caller_method.1),
                    callee_class: interface_name,
                    callee_method: format!("{}{}", signature.0, signature.1),
                },
            );
        }
    }

    fn invoke_special(
        &mut self,
        caller_id: ClassId,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        method_ref: &MethodRef,
    ) {
        let target_name = method_ref.receiver_class().to_string();
        let signature = method_ref.signature.key();
        let target_class = match self.resolve_class(&target_name) {
            Ok(target_class) => target_class,
            Err(error) => {
                self.record_failure(caller_class, caller_method, pc, error);
                return;
            }
        };
        // ACC_SUPER semantics: a non-constructor call to a strict superclass
        // method starts the walk at the caller's direct superclass.
        let start = if signature.0 != "<init>"
            && self.hierarchy.is_strict_superclass(target_class, caller_id)
        {
            self.hierarchy
                .node(caller_id)
                .super_class
                .unwrap_or(target_class)
        } else {
            target_class
        };
        match self.lookup_concrete(start, &signature) {
            Ok((target, target_id)) => {
                if let Err(error) = self.check_access(caller_class, &target, target_id) {
                    self.record_failure(caller_class, caller_method, pc, error);
                    return;
                }
                self.program.special_cache.insert(
                    (caller_class.to_string(), (target_name, signature)),
                    (target, target_id),
                );
                self.enqueue(target_id);
            }
            Err(error) => self.record_failure(caller_class, caller_method, pc, error),
        }
    }

    fn invoke_static(
        &mut self,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        method_ref: &MethodRef,
    ) {
        let target_name = method_ref.receiver_class().to_string();
        let signature = method_ref.signature.key();
        let target_class = match self.resolve_class(&target_name) {
            Ok(target_class) => target_class,
            Err(error) => {
                self.record_failure(caller_class, caller_method, pc, error);
                return;
            }
        };
        let mut resolved = None;
        for candidate in self.hierarchy.ancestors(target_class) {
            let node = self.hierarchy.node(candidate);
            if let Some(index) = node.method_index(&signature) {
                if !node.methods[index].is_static {
                    self.record_failure(
                        caller_class,
                        caller_method,
                        pc,
                        ResolveError::IncompatibleClassChange {
                            class: node.name.clone(),
                            member: signature.0.clone(),
                        },
                    );
                    return;
                }
                resolved = Some((
                    (node.name.clone(), signature.clone()),
                    MethodId {
                        class: candidate,
                        index,
                    },
                ));
                break;
            }
        }
        match resolved {
            Some((target, target_id)) => {
                if let Err(error) = self.check_access(caller_class, &target, target_id) {
                    self.record_failure(caller_class, caller_method, pc, error);
                    return;
                }
                self.program
                    .static_cache
                    .insert((target_name, signature), (target.clone(), target_id));
                self.enqueue(target_id);
                self.schedule_clinit(target_id.class);
            }
            None => self.record_failure(
                caller_class,
                caller_method,
                pc,
                ResolveError::NoSuchMethod {
                    class: target_name,
                    name: signature.0.clone(),
                    descriptor: signature.1.clone(),
                },
            ),
        }
    }

    /// JVM field resolution: the class, its superinterfaces, then the
    /// superclass chain; every class on the path gets its initialiser,
    /// interfaces only their own.
    fn resolve_static_field(
        &mut self,
        caller_class: &str,
        caller_method: &SigKey,
        pc: usize,
        field_ref: &FieldRef,
    ) {
        let holder = match self.resolve_class(&field_ref.class_name) {
            Ok(holder) => holder,
            Err(error) => {
                self.record_failure(caller_class, caller_method, pc, error);
                return;
            }
        };
        let mut current = Some(holder);
        while let Some(class_id) = current {
            self.schedule_own_clinit(class_id);
            if self.class_declares_static_field(class_id, field_ref) {
                return;
            }
            for interface in self.hierarchy.interface_closure(class_id) {
                if self.class_declares_static_field(interface, field_ref) {
                    self.schedule_own_clinit(interface);
                    return;
                }
            }
            current = self.hierarchy.node(class_id).super_class;
        }
        self.record_failure(
            caller_class,
            caller_method,
            pc,
            ResolveError::NoSuchField {
                class: field_ref.class_name.clone(),
                field: field_ref.signature.name.clone(),
            },
        );
    }

    fn class_declares_static_field(&self, class_id: ClassId, field_ref: &FieldRef) -> bool {
        self.hierarchy.node(class_id).fields.iter().any(|field| {
            field.is_static
                && field.signature.name == field_ref.signature.name
                && field.signature.descriptor == field_ref.signature.descriptor
        })
    }
}

fn nest_root(class_name: &str) -> &str {
    class_name.split('$').next().unwrap_or(class_name)
}
