use crate::{
    compile_type::AbstractType,
    object_model::{ClassId, cid},
};
use compact_str::CompactString;
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    mem,
};

/// Smis are signed integers of this many bits (value bits, tag excluded).
pub const SMI_BITS: u32 = 62;
pub const SMI_MIN: i64 = -(1 << SMI_BITS);
pub const SMI_MAX: i64 = (1 << SMI_BITS) - 1;

pub fn is_smi(value: i64) -> bool {
    (SMI_MIN..=SMI_MAX).contains(&value)
}

#[derive(Clone, Debug)]
pub enum ConstValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(CompactString),
    Type(AbstractType),
    /// Marks environment slots whose value was optimized away.
    OptimizedOut,
}

/// Special PartialEq that compares doubles
/// with bitwise equality.
impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstValue::Null, ConstValue::Null) => true,
            (ConstValue::Bool(a), ConstValue::Bool(b)) => a == b,
            (ConstValue::Int(a), ConstValue::Int(b)) => a == b,
            (ConstValue::Double(a), ConstValue::Double(b)) => a.to_bits() == b.to_bits(),
            (ConstValue::String(a), ConstValue::String(b)) => a == b,
            (ConstValue::Type(a), ConstValue::Type(b)) => a == b,
            (ConstValue::OptimizedOut, ConstValue::OptimizedOut) => true,
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            ConstValue::Null | ConstValue::OptimizedOut => {}
            ConstValue::Bool(x) => x.hash(state),
            ConstValue::Int(x) => x.hash(state),
            ConstValue::Double(x) => x.to_bits().hash(state),
            ConstValue::String(x) => x.hash(state),
            ConstValue::Type(x) => x.hash(state),
        }
    }
}

impl ConstValue {
    pub fn cid(&self) -> ClassId {
        match self {
            ConstValue::Null => cid::NULL,
            ConstValue::Bool(_) => cid::BOOL,
            ConstValue::Int(v) if is_smi(*v) => cid::SMI,
            ConstValue::Int(_) => cid::MINT,
            ConstValue::Double(_) => cid::DOUBLE,
            ConstValue::String(s) if s.is_ascii() => cid::ONE_BYTE_STRING,
            ConstValue::String(_) => cid::TWO_BYTE_STRING,
            ConstValue::Type(_) => cid::OBJECT,
            ConstValue::OptimizedOut => cid::ILLEGAL,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_smi(&self) -> Option<i64> {
        self.as_int().filter(|&v| is_smi(v))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConstValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ConstValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConstValue::Null)
    }
}

impl Display for ConstValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Null => write!(f, "null"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Double(d) => write!(f, "{d:?}"),
            ConstValue::String(s) => write!(f, "{s:?}"),
            ConstValue::Type(t) => write!(f, "type {t}"),
            ConstValue::OptimizedOut => write!(f, "<optimized out>"),
        }
    }
}
