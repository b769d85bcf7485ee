use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};
use serde::{Deserialize, Serialize};

/// JVM primitive value kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum BasicType {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl BasicType {
    /// Number of local/stack slots a value of this type occupies.
    pub fn slot_width(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            _ => 1,
        }
    }
}

/// Reference types: classes and arrays, by internal name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Class(String),
    Array(Box<ValueType>),
}

impl ObjectType {
    pub fn class(name: impl Into<String>) -> Self {
        ObjectType::Class(name.into())
    }

    pub fn object() -> Self {
        ObjectType::Class("java/lang/Object".to_string())
    }
}

/// Any JVM value type.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Basic(BasicType),
    Object(ObjectType),
}

impl ValueType {
    pub fn object() -> Self {
        ValueType::Object(ObjectType::object())
    }

    pub fn class(name: impl Into<String>) -> Self {
        ValueType::Object(ObjectType::class(name))
    }

    pub fn array(element: ValueType) -> Self {
        ValueType::Object(ObjectType::Array(Box::new(element)))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ValueType::Object(_))
    }

    pub fn slot_width(&self) -> usize {
        match self {
            ValueType::Basic(basic) => basic.slot_width(),
            ValueType::Object(_) => 1,
        }
    }

    /// Parse a field descriptor such as `I` or `[Ljava/lang/String;`.
    pub fn parse(descriptor: &str) -> Result<ValueType> {
        // A field descriptor is exactly one parameter of the method grammar.
        let wrapped = format!("({descriptor})V");
        let parsed = MethodDescriptor::from_str(&wrapped)
            .map_err(|err| anyhow::anyhow!("parse type descriptor {descriptor:?}: {err:?}"))?;
        let mut parameters = parsed.parameter_types().iter();
        match (parameters.next(), parameters.next()) {
            (Some(only), None) => convert_type(only)
                .with_context(|| format!("void is not a value type: {descriptor:?}")),
            _ => anyhow::bail!("expected a single type in {descriptor:?}"),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Basic(BasicType::Bool) => write!(f, "boolean"),
            ValueType::Basic(BasicType::Byte) => write!(f, "byte"),
            ValueType::Basic(BasicType::Char) => write!(f, "char"),
            ValueType::Basic(BasicType::Short) => write!(f, "short"),
            ValueType::Basic(BasicType::Int) => write!(f, "int"),
            ValueType::Basic(BasicType::Long) => write!(f, "long"),
            ValueType::Basic(BasicType::Float) => write!(f, "float"),
            ValueType::Basic(BasicType::Double) => write!(f, "double"),
            ValueType::Object(ObjectType::Class(name)) => write!(f, "{name}"),
            ValueType::Object(ObjectType::Array(element)) => write!(f, "{element}[]"),
        }
    }
}

/// A named field together with its declared type.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FieldSignature {
    pub name: String,
    pub descriptor: String,
    pub field_type: ValueType,
}

impl FieldSignature {
    pub fn parse(name: impl Into<String>, descriptor: &str) -> Result<FieldSignature> {
        Ok(FieldSignature {
            name: name.into(),
            descriptor: descriptor.to_string(),
            field_type: ValueType::parse(descriptor)?,
        })
    }
}

/// A named method together with its parsed parameter and return types.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub descriptor: String,
    pub parameters: Vec<ValueType>,
    pub return_type: Option<ValueType>,
}

impl MethodSignature {
    pub fn parse(name: impl Into<String>, descriptor: &str) -> Result<MethodSignature> {
        let parsed = MethodDescriptor::from_str(descriptor)
            .map_err(|err| anyhow::anyhow!("parse method descriptor {descriptor:?}: {err:?}"))?;
        let mut parameters = Vec::new();
        for parameter in parsed.parameter_types().iter() {
            parameters.push(
                convert_type(parameter).with_context(|| format!("void parameter in {descriptor:?}"))?,
            );
        }
        let return_type = convert_type(parsed.return_type());
        Ok(MethodSignature {
            name: name.into(),
            descriptor: descriptor.to_string(),
            parameters,
            return_type,
        })
    }

    /// Key used by dispatch caches and the workset: name plus raw descriptor.
    pub fn key(&self) -> SigKey {
        (self.name.clone(), self.descriptor.clone())
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// Name plus raw descriptor, the identity of a method within a class.
pub type SigKey = (String, String);

fn convert_type(descriptor: &TypeDescriptor) -> Option<ValueType> {
    match descriptor {
        TypeDescriptor::Void => None,
        TypeDescriptor::Byte => Some(ValueType::Basic(BasicType::Byte)),
        TypeDescriptor::Char => Some(ValueType::Basic(BasicType::Char)),
        TypeDescriptor::Double => Some(ValueType::Basic(BasicType::Double)),
        TypeDescriptor::Float => Some(ValueType::Basic(BasicType::Float)),
        TypeDescriptor::Integer => Some(ValueType::Basic(BasicType::Int)),
        TypeDescriptor::Long => Some(ValueType::Basic(BasicType::Long)),
        TypeDescriptor::Short => Some(ValueType::Basic(BasicType::Short)),
        TypeDescriptor::Boolean => Some(ValueType::Basic(BasicType::Bool)),
        TypeDescriptor::Object(name) => Some(ValueType::class(name.clone())),
        TypeDescriptor::Array(element, dimensions) => {
            let mut result = convert_type(element)?;
            for _ in 0..(*dimensions as usize) {
                result = ValueType::array(result);
            }
            Some(result)
        }
    }
}

/// Interpret a constant-pool class entry, which may be a plain internal name
/// or an array descriptor such as `[[I`.
pub fn object_type_from_pool_class(name: &str) -> Result<ObjectType> {
    if name.starts_with('[') {
        match ValueType::parse(name)? {
            ValueType::Object(object) => Ok(object),
            ValueType::Basic(_) => anyhow::bail!("array class entry {name:?} is not a reference"),
        }
    } else {
        Ok(ObjectType::class(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_descriptor_with_arrays_and_wide_types() {
        let signature =
            MethodSignature::parse("m", "(I[Ljava/lang/String;J)D").expect("parse descriptor");

        assert_eq!(
            signature.parameters,
            vec![
                ValueType::Basic(BasicType::Int),
                ValueType::array(ValueType::class("java/lang/String")),
                ValueType::Basic(BasicType::Long),
            ]
        );
        assert_eq!(
            signature.return_type,
            Some(ValueType::Basic(BasicType::Double))
        );
    }

    #[test]
    fn parses_void_return() {
        let signature = MethodSignature::parse("<init>", "()V").expect("parse descriptor");

        assert!(signature.parameters.is_empty());
        assert_eq!(signature.return_type, None);
    }

    #[test]
    fn pool_class_entry_accepts_plain_and_array_forms() {
        assert_eq!(
            object_type_from_pool_class("java/lang/String").expect("plain class"),
            ObjectType::class("java/lang/String")
        );
        assert_eq!(
            object_type_from_pool_class("[[I").expect("array class"),
            ObjectType::Array(Box::new(ValueType::array(ValueType::Basic(BasicType::Int))))
        );
    }

    #[test]
    fn slot_widths_follow_jvm_categories() {
        assert_eq!(ValueType::Basic(BasicType::Long).slot_width(), 2);
        assert_eq!(ValueType::Basic(BasicType::Double).slot_width(), 2);
        assert_eq!(ValueType::Basic(BasicType::Int).slot_width(), 1);
        assert_eq!(ValueType::object().slot_width(), 1);
    }
}
