use thiserror::Error;

/// Fatal per-method failures raised while recoding bytecode into the IR.
///
/// These indicate either invalid input bytecode or a stack shape the
/// transformer refuses to handle; the caller decides whether to skip the
/// method or abort the analysis.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("subroutines (jsr/ret) are not supported")]
    Subroutine,
    #[error("multianewarray with dimension 0 at pc {pc}")]
    BadMultiarrayDimension { pc: usize },
    #[error("invalid operand stack at pc {pc}: {reason}")]
    BadStack { pc: usize, reason: String },
    #[error("backward jump with a non-empty stack at pc {pc}")]
    NonemptyStackBackwardJump { pc: usize },
    #[error("uninitialised reference used as an expression at pc {pc}")]
    UninitIsNotExpr { pc: usize },
    #[error("type constraint on an uninitialised reference at pc {pc}")]
    TypeConstraintOnUninit { pc: usize },
    #[error("constructor call at pc {pc} does not match its uninitialised reference")]
    ContentConstraintOnUninit { pc: usize },
    #[error("malformed bytecode at pc {pc}: {reason}")]
    MalformedBytecode { pc: usize, reason: String },
}

impl IrError {
    pub(crate) fn bad_stack(pc: usize, reason: impl Into<String>) -> Self {
        IrError::BadStack {
            pc,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(pc: usize, reason: impl Into<String>) -> Self {
        IrError::MalformedBytecode {
            pc,
            reason: reason.into(),
        }
    }
}

/// JVM-mandated resolution failures.
///
/// Raised by dispatch and field resolution; the RTA driver records them per
/// site and continues with no edge rather than aborting.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("incompatible class change resolving {member} in {class}")]
    IncompatibleClassChange { class: String, member: String },
    #[error("no such method {name}{descriptor} in {class}")]
    NoSuchMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("no such field {field} in {class}")]
    NoSuchField { class: String, field: String },
    #[error("no class definition found for {class}")]
    NoClassDefFound { class: String },
    #[error("abstract method {name}{descriptor} selected in {class}")]
    AbstractMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("illegal access to {member} in {class}")]
    IllegalAccess { class: String, member: String },
    #[error("no receiver found for call from {caller_class}.{caller_method} to {callee_class}.{callee_method}")]
    InvokeNotFound {
        caller_class: String,
        caller_method: String,
        callee_class: String,
        callee_method: String,
    },
}
