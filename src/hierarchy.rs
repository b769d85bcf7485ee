use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::classfile::{ClassAccess, ClassFile, CodeAttribute, ConstantPool, FieldRecord};
use crate::classpath::ClassProvider;
use crate::descriptor::{MethodSignature, ObjectType, SigKey, ValueType};
use crate::error::ResolveError;

/// Arena index of a class node. All hierarchy edges are ids, never pointers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClassId(pub usize);

/// A concrete method: its class plus the index into that class's method list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MethodId {
    pub class: ClassId,
    pub index: usize,
}

/// Method record inside the hierarchy, carrying the RTA parse flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodNode {
    pub signature: MethodSignature,
    pub is_static: bool,
    pub is_native: bool,
    pub is_abstract: bool,
    pub is_private: bool,
    pub code: Option<CodeAttribute>,
    /// Workset dedup bit; flips false to true exactly once.
    pub has_been_parsed: bool,
}

/// One class or interface in the arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassNode {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub access: ClassAccess,
    pub fields: Vec<FieldRecord>,
    pub methods: Vec<MethodNode>,
    pub children_classes: Vec<ClassId>,
    pub children_interfaces: Vec<ClassId>,
    pub is_instantiated: bool,
    /// Instantiated classes at or below this node, keyed by name.
    pub instantiated_subclasses: BTreeMap<String, ClassId>,
    pub memorized_virtual_calls: BTreeSet<SigKey>,
    pub memorized_interface_calls: BTreeSet<SigKey>,
    pub pool: ConstantPool,
}

impl ClassNode {
    pub fn is_interface(&self) -> bool {
        self.access.is_interface
    }

    pub fn method_index(&self, key: &SigKey) -> Option<usize> {
        self.methods.iter().position(|method| {
            method.signature.name == key.0 && method.signature.descriptor == key.1
        })
    }
}

/// The loaded class hierarchy: an id-indexed arena plus derived relations.
#[derive(Clone, Debug, Default)]
pub struct Hierarchy {
    pub classes: Vec<ClassNode>,
    pub by_name: BTreeMap<String, ClassId>,
    /// Interface id to the classes transitively implementing it.
    pub implementers: BTreeMap<ClassId, BTreeSet<ClassId>>,
    loading: BTreeSet<String>,
}

impl Hierarchy {
    /// Rebuild a hierarchy from persisted parts.
    pub fn from_parts(
        classes: Vec<ClassNode>,
        by_name: BTreeMap<String, ClassId>,
        implementers: BTreeMap<ClassId, BTreeSet<ClassId>>,
    ) -> Hierarchy {
        Hierarchy {
            classes,
            by_name,
            implementers,
            loading: BTreeSet::new(),
        }
    }

    pub fn node(&self, id: ClassId) -> &ClassNode {
        &self.classes[id.0]
    }

    pub fn node_mut(&mut self, id: ClassId) -> &mut ClassNode {
        &mut self.classes[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn method(&self, id: MethodId) -> &MethodNode {
        &self.node(id.class).methods[id.index]
    }

    /// Load a class with all its superclasses and interfaces, linking child
    /// and implementer edges. Idempotent per name.
    pub fn resolve(
        &mut self,
        provider: &mut dyn ClassProvider,
        name: &str,
    ) -> Result<ClassId, ResolveError> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        if !self.loading.insert(name.to_string()) {
            return Err(ResolveError::IncompatibleClassChange {
                class: name.to_string(),
                member: "circular superclass chain".to_string(),
            });
        }
        let result = self.load_new(provider, name);
        self.loading.remove(name);
        result
    }

    fn load_new(
        &mut self,
        provider: &mut dyn ClassProvider,
        name: &str,
    ) -> Result<ClassId, ResolveError> {
        let class_file = match provider.find_class(name) {
            Ok(Some(class_file)) => class_file,
            Ok(None) => {
                return Err(ResolveError::NoClassDefFound {
                    class: name.to_string(),
                });
            }
            Err(error) => {
                tracing::warn!(class = name, %error, "class loading failed");
                return Err(ResolveError::NoClassDefFound {
                    class: name.to_string(),
                });
            }
        };
        let ClassFile {
            name: class_name,
            super_name,
            interfaces,
            access,
            fields,
            methods,
            pool,
        } = class_file;

        let super_class = match &super_name {
            Some(super_name) => Some(self.resolve(provider, super_name)?),
            None => None,
        };
        let mut interface_ids = Vec::with_capacity(interfaces.len());
        for interface in &interfaces {
            interface_ids.push(self.resolve(provider, interface)?);
        }

        let id = ClassId(self.classes.len());
        let methods = methods
            .into_iter()
            .map(|method| MethodNode {
                signature: method.signature,
                is_static: method.is_static,
                is_native: method.is_native,
                is_abstract: method.is_abstract,
                is_private: method.is_private,
                code: method.code,
                has_been_parsed: false,
            })
            .collect();
        self.classes.push(ClassNode {
            name: class_name.clone(),
            super_class,
            interfaces: interface_ids.clone(),
            access,
            fields,
            methods,
            children_classes: Vec::new(),
            children_interfaces: Vec::new(),
            is_instantiated: false,
            instantiated_subclasses: BTreeMap::new(),
            memorized_virtual_calls: BTreeSet::new(),
            memorized_interface_calls: BTreeSet::new(),
            pool,
        });
        self.by_name.insert(class_name, id);

        let is_interface = access.is_interface;
        if let Some(super_id) = super_class {
            if is_interface {
                self.node_mut(super_id).children_interfaces.push(id);
            } else {
                self.node_mut(super_id).children_classes.push(id);
            }
        }
        for interface_id in interface_ids {
            if is_interface {
                self.node_mut(interface_id).children_interfaces.push(id);
            }
        }
        if !is_interface {
            for interface_id in self.interface_closure(id) {
                self.implementers.entry(interface_id).or_default().insert(id);
            }
        }
        Ok(id)
    }

    /// The class itself followed by its superclass chain.
    pub fn ancestors(&self, id: ClassId) -> Vec<ClassId> {
        let mut chain = vec![id];
        let mut current = self.node(id).super_class;
        while let Some(next) = current {
            chain.push(next);
            current = self.node(next).super_class;
        }
        chain
    }

    /// Every interface the class implements, directly or through supertypes.
    pub fn interface_closure(&self, id: ClassId) -> BTreeSet<ClassId> {
        let mut closure = BTreeSet::new();
        let mut work: Vec<ClassId> = Vec::new();
        for ancestor in self.ancestors(id) {
            work.extend(self.node(ancestor).interfaces.iter().copied());
        }
        if self.node(id).is_interface() {
            work.extend(self.node(id).interfaces.iter().copied());
        }
        while let Some(interface) = work.pop() {
            if closure.insert(interface) {
                work.extend(self.node(interface).interfaces.iter().copied());
                if let Some(super_id) = self.node(interface).super_class {
                    if self.node(super_id).is_interface() {
                        work.push(super_id);
                    }
                }
            }
        }
        closure
    }

    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        self.ancestors(sub).contains(&sup)
    }

    /// Strict superclass relation, excluding the class itself.
    pub fn is_strict_superclass(&self, sup: ClassId, sub: ClassId) -> bool {
        sup != sub && self.is_subclass(sub, sup)
    }

    /// Class/interface subtyping over loaded ids.
    pub fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        if self.is_subclass(sub, sup) {
            return true;
        }
        self.interface_closure(sub).contains(&sup)
    }

    /// Subtyping over object types, covering array covariance and the
    /// array supertypes mandated by the JLS.
    pub fn object_subtype(&self, sub: &ObjectType, sup: &ObjectType) -> bool {
        match (sub, sup) {
            (_, ObjectType::Class(name)) if name == "java/lang/Object" => true,
            (ObjectType::Class(sub_name), ObjectType::Class(sup_name)) => {
                if sub_name == sup_name {
                    return true;
                }
                match (self.id_of(sub_name), self.id_of(sup_name)) {
                    (Some(sub_id), Some(sup_id)) => self.is_subtype(sub_id, sup_id),
                    _ => false,
                }
            }
            (ObjectType::Array(_), ObjectType::Class(name)) => {
                name == "java/lang/Cloneable" || name == "java/io/Serializable"
            }
            (ObjectType::Array(sub_element), ObjectType::Array(sup_element)) => {
                match (sub_element.as_ref(), sup_element.as_ref()) {
                    (ValueType::Object(sub_object), ValueType::Object(sup_object)) => {
                        self.object_subtype(sub_object, sup_object)
                    }
                    (left, right) => left == right,
                }
            }
            (ObjectType::Class(_), ObjectType::Array(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classpath::MemoryProvider;
    use crate::descriptor::{BasicType, ValueType};
    use crate::test_fixtures::{class, interface, object_class};

    fn sample_hierarchy() -> (Hierarchy, MemoryProvider) {
        let mut provider = MemoryProvider::default();
        provider.add(object_class());
        provider.add(interface("com/example/Greeter", &[]));
        provider.add(class("com/example/Base", "java/lang/Object", &["com/example/Greeter"]));
        provider.add(class("com/example/Sub", "com/example/Base", &[]));
        (Hierarchy::default(), provider)
    }

    #[test]
    fn resolve_loads_superclasses_and_links_children() {
        let (mut hierarchy, mut provider) = sample_hierarchy();

        let sub = hierarchy
            .resolve(&mut provider, "com/example/Sub")
            .expect("resolve Sub");

        let base = hierarchy.id_of("com/example/Base").expect("Base loaded");
        let object = hierarchy.id_of("java/lang/Object").expect("Object loaded");
        assert_eq!(hierarchy.node(sub).super_class, Some(base));
        assert!(hierarchy.node(base).children_classes.contains(&sub));
        assert!(hierarchy.node(object).children_classes.contains(&base));
    }

    #[test]
    fn implementers_are_transitive_over_subclassing() {
        let (mut hierarchy, mut provider) = sample_hierarchy();

        let sub = hierarchy
            .resolve(&mut provider, "com/example/Sub")
            .expect("resolve Sub");
        let greeter = hierarchy.id_of("com/example/Greeter").expect("interface");

        let implementers = hierarchy.implementers.get(&greeter).expect("implementers");
        assert!(implementers.contains(&sub));
        assert!(implementers.contains(&hierarchy.id_of("com/example/Base").expect("Base")));
    }

    #[test]
    fn subtype_covers_interfaces_and_classes() {
        let (mut hierarchy, mut provider) = sample_hierarchy();
        let sub = hierarchy
            .resolve(&mut provider, "com/example/Sub")
            .expect("resolve Sub");
        let greeter = hierarchy.id_of("com/example/Greeter").expect("interface");
        let object = hierarchy.id_of("java/lang/Object").expect("Object");

        assert!(hierarchy.is_subtype(sub, greeter));
        assert!(hierarchy.is_subtype(sub, object));
        assert!(!hierarchy.is_subtype(object, sub));
    }

    #[test]
    fn missing_class_is_a_resolution_error() {
        let mut provider = MemoryProvider::default();
        let mut hierarchy = Hierarchy::default();

        let result = hierarchy.resolve(&mut provider, "com/example/Missing");

        assert!(matches!(result, Err(ResolveError::NoClassDefFound { .. })));
    }

    #[test]
    fn array_subtyping_is_covariant_for_references() {
        let (mut hierarchy, mut provider) = sample_hierarchy();
        hierarchy
            .resolve(&mut provider, "com/example/Sub")
            .expect("resolve");

        let sub_array = ObjectType::Array(Box::new(ValueType::class("com/example/Sub")));
        let base_array = ObjectType::Array(Box::new(ValueType::class("com/example/Base")));
        let int_array = ObjectType::Array(Box::new(ValueType::Basic(BasicType::Int)));

        assert!(hierarchy.object_subtype(&sub_array, &base_array));
        assert!(!hierarchy.object_subtype(&base_array, &sub_array));
        assert!(hierarchy.object_subtype(&int_array, &ObjectType::object()));
        assert!(!hierarchy.object_subtype(&int_array, &base_array));
    }
}
