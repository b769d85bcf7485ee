//! Shared builders for synthetic classes used across module tests.

use crate::classfile::{
    ClassAccess, ClassFile, CodeAttribute, ConstantPool, FieldRecord, MethodRecord, PoolEntry,
};
use crate::descriptor::{FieldSignature, MethodSignature};

pub fn object_class() -> ClassFile {
    ClassFile {
        name: "java/lang/Object".to_string(),
        super_name: None,
        interfaces: Vec::new(),
        access: ClassAccess::default(),
        fields: Vec::new(),
        methods: vec![concrete_method("<init>", "()V", vec![0xb1])],
        pool: ConstantPool::default(),
    }
}

pub fn class(name: &str, super_name: &str, interfaces: &[&str]) -> ClassFile {
    ClassFile {
        name: name.to_string(),
        super_name: Some(super_name.to_string()),
        interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        access: ClassAccess::default(),
        fields: Vec::new(),
        methods: Vec::new(),
        pool: ConstantPool::default(),
    }
}

pub fn interface(name: &str, extends: &[&str]) -> ClassFile {
    ClassFile {
        name: name.to_string(),
        super_name: Some("java/lang/Object".to_string()),
        interfaces: extends.iter().map(|s| s.to_string()).collect(),
        access: ClassAccess {
            is_interface: true,
            is_abstract: true,
            is_final: false,
        },
        fields: Vec::new(),
        methods: Vec::new(),
        pool: ConstantPool::default(),
    }
}

pub fn concrete_method(name: &str, descriptor: &str, bytecode: Vec<u8>) -> MethodRecord {
    MethodRecord {
        signature: MethodSignature::parse(name, descriptor).expect("method signature"),
        is_static: false,
        is_native: false,
        is_abstract: false,
        is_private: false,
        code: Some(code(bytecode)),
    }
}

pub fn static_method(name: &str, descriptor: &str, bytecode: Vec<u8>) -> MethodRecord {
    MethodRecord {
        is_static: true,
        ..concrete_method(name, descriptor, bytecode)
    }
}

pub fn abstract_method(name: &str, descriptor: &str) -> MethodRecord {
    MethodRecord {
        signature: MethodSignature::parse(name, descriptor).expect("method signature"),
        is_static: false,
        is_native: false,
        is_abstract: true,
        is_private: false,
        code: None,
    }
}

pub fn native_method(name: &str, descriptor: &str) -> MethodRecord {
    MethodRecord {
        signature: MethodSignature::parse(name, descriptor).expect("method signature"),
        is_static: false,
        is_native: true,
        is_abstract: false,
        is_private: false,
        code: None,
    }
}

pub fn code(bytecode: Vec<u8>) -> CodeAttribute {
    CodeAttribute {
        max_stack: 8,
        max_locals: 8,
        bytecode,
        exception_table: Vec::new(),
        line_numbers: Vec::new(),
        local_variables: Vec::new(),
    }
}

pub fn field(name: &str, descriptor: &str) -> FieldRecord {
    FieldRecord {
        signature: FieldSignature::parse(name, descriptor).expect("field signature"),
        is_static: false,
        is_final: false,
    }
}

pub fn pool(entries: Vec<PoolEntry>) -> ConstantPool {
    ConstantPool::from_entries(entries)
}

/// Pool entry for a method reference.
pub fn method_ref(class_name: &str, name: &str, descriptor: &str) -> PoolEntry {
    PoolEntry::MethodRef {
        class_name: class_name.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        is_interface: false,
    }
}

/// Pool entry for an interface method reference.
pub fn interface_method_ref(class_name: &str, name: &str, descriptor: &str) -> PoolEntry {
    PoolEntry::MethodRef {
        class_name: class_name.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        is_interface: true,
    }
}

/// Pool entry for a field reference.
pub fn field_ref(class_name: &str, name: &str, descriptor: &str) -> PoolEntry {
    PoolEntry::FieldRef {
        class_name: class_name.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}
