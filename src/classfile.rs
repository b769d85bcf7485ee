use anyhow::{Context, Result};
use classfile_parser::attribute_info::{AttributeInfo, code_attribute_parser};
use classfile_parser::class_parser;
use classfile_parser::constant_info::ConstantInfo;
use classfile_parser::field_info::FieldAccessFlags;
use classfile_parser::method_info::MethodAccessFlags;
use serde::{Deserialize, Serialize};

use crate::descriptor::{FieldSignature, MethodSignature, SigKey};

/// A parsed class, the input record of every downstream component.
#[derive(Clone, Debug)]
pub struct ClassFile {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access: ClassAccess,
    pub fields: Vec<FieldRecord>,
    pub methods: Vec<MethodRecord>,
    pub pool: ConstantPool,
}

impl ClassFile {
    pub fn method(&self, key: &SigKey) -> Option<&MethodRecord> {
        self.methods
            .iter()
            .find(|method| method.signature.name == key.0 && method.signature.descriptor == key.1)
    }
}

/// Class-level access flags the analysis cares about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClassAccess {
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_final: bool,
}

/// Field definition for a class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldRecord {
    pub signature: FieldSignature,
    pub is_static: bool,
    pub is_final: bool,
}

/// Method definition together with its code attribute, when present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodRecord {
    pub signature: MethodSignature,
    pub is_static: bool,
    pub is_native: bool,
    pub is_abstract: bool,
    pub is_private: bool,
    pub code: Option<CodeAttribute>,
}

/// Code attribute contents: bytecode plus its side tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<RawExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
    pub local_variables: Vec<LocalVariableEntry>,
}

/// Exception handler over bytecode pcs; `catch_type` is `None` for catch-all.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<String>,
}

/// Line number mapping entry from bytecode offsets to source lines.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

/// Debug name for a local slot over a bytecode pc range.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name: String,
    pub descriptor: String,
    pub slot: u16,
}

/// Constant-pool view with operands resolved to owned values.
///
/// Indexing is one-based like the class-file format; wide constants keep their
/// phantom second slot so indexes line up.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PoolEntry {
    Utf8(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(String),
    Str(String),
    FieldRef {
        class_name: String,
        name: String,
        descriptor: String,
    },
    MethodRef {
        class_name: String,
        name: String,
        descriptor: String,
        is_interface: bool,
    },
    NameAndType {
        name: String,
        descriptor: String,
    },
    /// invokedynamic call-site name and descriptor.
    Dynamic {
        name: String,
        descriptor: String,
    },
    Unused,
}

impl ConstantPool {
    pub fn from_entries(entries: Vec<PoolEntry>) -> Self {
        ConstantPool { entries }
    }

    pub fn entry(&self, index: u16) -> Option<&PoolEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.entry(index)? {
            PoolEntry::Class(name) => Some(name),
            _ => None,
        }
    }
}

/// Parse raw `.class` bytes into the analysis input record.
pub fn parse_class_bytes(data: &[u8]) -> Result<ClassFile> {
    let (_, class) = class_parser(data)
        .map_err(|err| anyhow::anyhow!("parse class file bytes: {err:?}"))?;
    let raw_pool = &class.const_pool;

    let name = raw_class_name(raw_pool, class.this_class).context("resolve class name")?;
    let super_name = if class.super_class == 0 {
        None
    } else {
        Some(raw_class_name(raw_pool, class.super_class).context("resolve super class name")?)
    };
    let mut interfaces = Vec::new();
    for interface_index in &class.interfaces {
        interfaces.push(
            raw_class_name(raw_pool, *interface_index).context("resolve interface name")?,
        );
    }

    let pool = resolve_pool(raw_pool);
    let access = ClassAccess {
        is_interface: class
            .access_flags
            .contains(classfile_parser::ClassAccessFlags::INTERFACE),
        is_abstract: class
            .access_flags
            .contains(classfile_parser::ClassAccessFlags::ABSTRACT),
        is_final: class
            .access_flags
            .contains(classfile_parser::ClassAccessFlags::FINAL),
    };

    let mut fields = Vec::new();
    for field in &class.fields {
        let field_name = raw_utf8(raw_pool, field.name_index).context("resolve field name")?;
        let descriptor =
            raw_utf8(raw_pool, field.descriptor_index).context("resolve field descriptor")?;
        fields.push(FieldRecord {
            signature: FieldSignature::parse(field_name, &descriptor)?,
            is_static: field.access_flags.contains(FieldAccessFlags::STATIC),
            is_final: field.access_flags.contains(FieldAccessFlags::FINAL),
        });
    }

    let mut methods = Vec::new();
    for method in &class.methods {
        let method_name = raw_utf8(raw_pool, method.name_index).context("resolve method name")?;
        let descriptor =
            raw_utf8(raw_pool, method.descriptor_index).context("resolve method descriptor")?;
        let code = find_code_attribute(raw_pool, &method.attributes)
            .with_context(|| format!("parse code of {method_name}{descriptor}"))?;
        methods.push(MethodRecord {
            signature: MethodSignature::parse(method_name, &descriptor)?,
            is_static: method.access_flags.contains(MethodAccessFlags::STATIC),
            is_native: method.access_flags.contains(MethodAccessFlags::NATIVE),
            is_abstract: method.access_flags.contains(MethodAccessFlags::ABSTRACT),
            is_private: method.access_flags.contains(MethodAccessFlags::PRIVATE),
            code,
        });
    }

    Ok(ClassFile {
        name,
        super_name,
        interfaces,
        access,
        fields,
        methods,
        pool,
    })
}

fn raw_entry(pool: &[ConstantInfo], index: u16) -> Option<&ConstantInfo> {
    if index == 0 {
        return None;
    }
    pool.get(index as usize - 1)
}

fn raw_utf8(pool: &[ConstantInfo], index: u16) -> Result<String> {
    match raw_entry(pool, index) {
        Some(ConstantInfo::Utf8(utf8)) => Ok(utf8.utf8_string.clone()),
        _ => anyhow::bail!("constant pool entry {index} is not utf8"),
    }
}

fn raw_class_name(pool: &[ConstantInfo], index: u16) -> Result<String> {
    match raw_entry(pool, index) {
        Some(ConstantInfo::Class(class)) => raw_utf8(pool, class.name_index),
        _ => anyhow::bail!("constant pool entry {index} is not a class"),
    }
}

fn raw_name_and_type(pool: &[ConstantInfo], index: u16) -> Result<(String, String)> {
    match raw_entry(pool, index) {
        Some(ConstantInfo::NameAndType(entry)) => Ok((
            raw_utf8(pool, entry.name_index)?,
            raw_utf8(pool, entry.descriptor_index)?,
        )),
        _ => anyhow::bail!("constant pool entry {index} is not a name-and-type"),
    }
}

fn resolve_pool(raw_pool: &[ConstantInfo]) -> ConstantPool {
    let mut entries = Vec::with_capacity(raw_pool.len());
    for entry in raw_pool {
        let resolved = match entry {
            ConstantInfo::Utf8(utf8) => PoolEntry::Utf8(utf8.utf8_string.clone()),
            ConstantInfo::Integer(value) => PoolEntry::Int(value.value),
            ConstantInfo::Float(value) => PoolEntry::Float(value.value),
            ConstantInfo::Long(value) => PoolEntry::Long(value.value),
            ConstantInfo::Double(value) => PoolEntry::Double(value.value),
            ConstantInfo::Class(class) => match raw_utf8(raw_pool, class.name_index) {
                Ok(name) => PoolEntry::Class(name),
                Err(_) => PoolEntry::Unused,
            },
            ConstantInfo::String(string) => match raw_utf8(raw_pool, string.string_index) {
                Ok(value) => PoolEntry::Str(value),
                Err(_) => PoolEntry::Unused,
            },
            ConstantInfo::FieldRef(field_ref) => {
                match member_ref(raw_pool, field_ref.class_index, field_ref.name_and_type_index) {
                    Ok((class_name, name, descriptor)) => PoolEntry::FieldRef {
                        class_name,
                        name,
                        descriptor,
                    },
                    Err(_) => PoolEntry::Unused,
                }
            }
            ConstantInfo::MethodRef(method_ref) => {
                match member_ref(raw_pool, method_ref.class_index, method_ref.name_and_type_index)
                {
                    Ok((class_name, name, descriptor)) => PoolEntry::MethodRef {
                        class_name,
                        name,
                        descriptor,
                        is_interface: false,
                    },
                    Err(_) => PoolEntry::Unused,
                }
            }
            ConstantInfo::InterfaceMethodRef(method_ref) => {
                match member_ref(raw_pool, method_ref.class_index, method_ref.name_and_type_index)
                {
                    Ok((class_name, name, descriptor)) => PoolEntry::MethodRef {
                        class_name,
                        name,
                        descriptor,
                        is_interface: true,
                    },
                    Err(_) => PoolEntry::Unused,
                }
            }
            ConstantInfo::NameAndType(entry) => {
                match (
                    raw_utf8(raw_pool, entry.name_index),
                    raw_utf8(raw_pool, entry.descriptor_index),
                ) {
                    (Ok(name), Ok(descriptor)) => PoolEntry::NameAndType { name, descriptor },
                    _ => PoolEntry::Unused,
                }
            }
            ConstantInfo::InvokeDynamic(invoke_dynamic) => {
                match raw_name_and_type(raw_pool, invoke_dynamic.name_and_type_index) {
                    Ok((name, descriptor)) => PoolEntry::Dynamic { name, descriptor },
                    Err(_) => PoolEntry::Unused,
                }
            }
            _ => PoolEntry::Unused,
        };
        entries.push(resolved);
    }
    ConstantPool { entries }
}

fn member_ref(
    pool: &[ConstantInfo],
    class_index: u16,
    name_and_type_index: u16,
) -> Result<(String, String, String)> {
    let class_name = raw_class_name(pool, class_index)?;
    let (name, descriptor) = raw_name_and_type(pool, name_and_type_index)?;
    Ok((class_name, name, descriptor))
}

fn find_code_attribute(
    pool: &[ConstantInfo],
    attributes: &[AttributeInfo],
) -> Result<Option<CodeAttribute>> {
    for attribute in attributes {
        let attribute_name = raw_utf8(pool, attribute.attribute_name_index)?;
        if attribute_name != "Code" {
            continue;
        }
        let (_, code) = code_attribute_parser(&attribute.info)
            .map_err(|err| anyhow::anyhow!("parse code attribute: {err:?}"))?;

        let mut exception_table = Vec::new();
        for entry in &code.exception_table {
            let catch_type = if entry.catch_type == 0 {
                None
            } else {
                Some(raw_class_name(pool, entry.catch_type).context("resolve catch type")?)
            };
            exception_table.push(RawExceptionHandler {
                start_pc: entry.start_pc,
                end_pc: entry.end_pc,
                handler_pc: entry.handler_pc,
                catch_type,
            });
        }

        let mut line_numbers = Vec::new();
        let mut local_variables = Vec::new();
        for nested in &code.attributes {
            match raw_utf8(pool, nested.attribute_name_index)?.as_str() {
                "LineNumberTable" => {
                    line_numbers = parse_line_number_table(&nested.info)
                        .context("parse LineNumberTable")?;
                }
                "LocalVariableTable" => {
                    local_variables = parse_local_variable_table(pool, &nested.info)
                        .context("parse LocalVariableTable")?;
                }
                _ => {}
            }
        }

        return Ok(Some(CodeAttribute {
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            bytecode: code.code.clone(),
            exception_table,
            line_numbers,
            local_variables,
        }));
    }
    Ok(None)
}

fn parse_line_number_table(info: &[u8]) -> Result<Vec<LineNumber>> {
    let count = read_u16(info, 0)? as usize;
    let mut table = Vec::with_capacity(count);
    for index in 0..count {
        let base = 2 + index * 4;
        table.push(LineNumber {
            start_pc: read_u16(info, base)?,
            line: read_u16(info, base + 2)?,
        });
    }
    Ok(table)
}

fn parse_local_variable_table(
    pool: &[ConstantInfo],
    info: &[u8],
) -> Result<Vec<LocalVariableEntry>> {
    let count = read_u16(info, 0)? as usize;
    let mut table = Vec::with_capacity(count);
    for index in 0..count {
        let base = 2 + index * 10;
        table.push(LocalVariableEntry {
            start_pc: read_u16(info, base)?,
            length: read_u16(info, base + 2)?,
            name: raw_utf8(pool, read_u16(info, base + 4)?)?,
            descriptor: raw_utf8(pool, read_u16(info, base + 6)?)?,
            slot: read_u16(info, base + 8)?,
        });
    }
    Ok(table)
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let slice = data
        .get(offset..offset + 2)
        .context("attribute u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

/// Look up the debug name of a local slot at a bytecode pc.
pub fn local_debug_name(
    locals: &[LocalVariableEntry],
    slot: u16,
    pc: usize,
) -> Option<&str> {
    locals.iter().find_map(|entry| {
        let start = entry.start_pc as usize;
        let end = start + entry.length as usize;
        if entry.slot == slot && start <= pc && pc < end {
            Some(entry.name.as_str())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_number_table_bytes() {
        // count=2, (0 -> 10), (5 -> 11)
        let info = [0, 2, 0, 0, 0, 10, 0, 5, 0, 11];

        let table = parse_line_number_table(&info).expect("parse table");

        assert_eq!(table.len(), 2);
        assert_eq!(table[0].start_pc, 0);
        assert_eq!(table[0].line, 10);
        assert_eq!(table[1].start_pc, 5);
        assert_eq!(table[1].line, 11);
    }

    #[test]
    fn local_debug_name_respects_slot_and_range() {
        let locals = vec![
            LocalVariableEntry {
                start_pc: 2,
                length: 6,
                name: "count".to_string(),
                descriptor: "I".to_string(),
                slot: 1,
            },
            LocalVariableEntry {
                start_pc: 0,
                length: 10,
                name: "this".to_string(),
                descriptor: "Lcom/example/Foo;".to_string(),
                slot: 0,
            },
        ];

        assert_eq!(local_debug_name(&locals, 1, 3), Some("count"));
        assert_eq!(local_debug_name(&locals, 1, 0), None);
        assert_eq!(local_debug_name(&locals, 1, 8), None);
        assert_eq!(local_debug_name(&locals, 0, 0), Some("this"));
    }

    #[test]
    fn parses_minimal_class_file_bytes() {
        // Hand-assembled class file: `interface com/example/I extends Object`.
        let mut data: Vec<u8> = Vec::new();
        data.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes()); // minor
        data.extend_from_slice(&52u16.to_be_bytes()); // major (Java 8)
        data.extend_from_slice(&5u16.to_be_bytes()); // pool count = entries + 1
        // 1: utf8 "com/example/I"
        data.push(1);
        let name = b"com/example/I";
        data.extend_from_slice(&(name.len() as u16).to_be_bytes());
        data.extend_from_slice(name);
        // 2: utf8 "java/lang/Object"
        data.push(1);
        let object = b"java/lang/Object";
        data.extend_from_slice(&(object.len() as u16).to_be_bytes());
        data.extend_from_slice(object);
        // 3: class #1, 4: class #2
        data.push(7);
        data.extend_from_slice(&1u16.to_be_bytes());
        data.push(7);
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&0x0600u16.to_be_bytes()); // ACC_INTERFACE | ACC_ABSTRACT
        data.extend_from_slice(&3u16.to_be_bytes()); // this
        data.extend_from_slice(&4u16.to_be_bytes()); // super
        data.extend_from_slice(&0u16.to_be_bytes()); // interfaces
        data.extend_from_slice(&0u16.to_be_bytes()); // fields
        data.extend_from_slice(&0u16.to_be_bytes()); // methods
        data.extend_from_slice(&0u16.to_be_bytes()); // attributes

        let class = parse_class_bytes(&data).expect("parse class");

        assert_eq!(class.name, "com/example/I");
        assert_eq!(class.super_name.as_deref(), Some("java/lang/Object"));
        assert!(class.access.is_interface);
        assert!(class.methods.is_empty());
    }
}
