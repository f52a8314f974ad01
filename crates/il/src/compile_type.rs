//! Static type information attached to definitions and uses.
//!
//! `CompileType` forms a join semilattice: `none()` is bottom (nothing is
//! known yet, e.g. an unvisited phi input) and nullable `dynamic()` is
//! top.

use crate::object_model::{ClassId, ClassTable, cid};
use std::fmt::{self, Display, Formatter};

/// A static type from the source language, reduced to what the compiler
/// needs for type tests and refinement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AbstractType {
    Dynamic,
    Void,
    Never,
    Null,
    Class {
        cid: ClassId,
        args: Vec<AbstractType>,
        nullable: bool,
    },
    /// A type parameter of the enclosing class (`function_level == false`)
    /// or function, instantiated at runtime from the type argument vectors.
    TypeParameter {
        index: u32,
        function_level: bool,
        nullable: bool,
    },
}

impl AbstractType {
    pub fn class(cid: ClassId) -> Self {
        AbstractType::Class {
            cid,
            args: Vec::new(),
            nullable: false,
        }
    }

    pub fn nullable_class(cid: ClassId) -> Self {
        AbstractType::Class {
            cid,
            args: Vec::new(),
            nullable: true,
        }
    }

    pub fn object() -> Self {
        Self::class(cid::OBJECT)
    }

    /// Top types accept every value, including null.
    pub fn is_top(&self) -> bool {
        match self {
            AbstractType::Dynamic | AbstractType::Void => true,
            AbstractType::Class { cid, nullable, .. } => *cid == cid::OBJECT && *nullable,
            _ => false,
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            AbstractType::Dynamic | AbstractType::Void | AbstractType::Null => true,
            AbstractType::Never => false,
            AbstractType::Class { nullable, .. } | AbstractType::TypeParameter { nullable, .. } => {
                *nullable
            }
        }
    }

    /// Whether the type mentions no type parameters.
    pub fn is_instantiated(&self) -> bool {
        match self {
            AbstractType::TypeParameter { .. } => false,
            AbstractType::Class { args, .. } => args.iter().all(AbstractType::is_instantiated),
            _ => true,
        }
    }

    /// A class type whose type arguments (if any) are all top types,
    /// so an instance test only needs the receiver's class id.
    pub fn is_raw_class(&self) -> bool {
        matches!(self, AbstractType::Class { args, .. } if args.iter().all(AbstractType::is_top))
    }

    pub fn type_class_id(&self) -> Option<ClassId> {
        match self {
            AbstractType::Class { cid, .. } => Some(*cid),
            AbstractType::Null => Some(cid::NULL),
            _ => None,
        }
    }

    pub fn with_nullability(&self, nullable: bool) -> Self {
        match self.clone() {
            AbstractType::Class { cid, args, .. } => AbstractType::Class {
                cid,
                args,
                nullable,
            },
            AbstractType::TypeParameter {
                index,
                function_level,
                ..
            } => AbstractType::TypeParameter {
                index,
                function_level,
                nullable,
            },
            AbstractType::Null if !nullable => AbstractType::Never,
            other => other,
        }
    }

    /// Static subtype relation. Conservative: `false` means "not provably
    /// a subtype", not "provably not a subtype".
    pub fn is_subtype_of(&self, other: &AbstractType, classes: &ClassTable) -> bool {
        if other.is_top() || self == other {
            return true;
        }
        match (self, other) {
            (AbstractType::Never, _) => true,
            (AbstractType::Null, _) => other.is_nullable(),
            (AbstractType::Dynamic | AbstractType::Void, _) => false,
            (
                AbstractType::Class {
                    cid: a,
                    args: args_a,
                    nullable: null_a,
                },
                AbstractType::Class {
                    cid: b,
                    args: args_b,
                    nullable: null_b,
                },
            ) => {
                if *null_a && !*null_b {
                    return false;
                }
                if !classes.is_subclass_of(*a, *b) {
                    return false;
                }
                if args_b.iter().all(AbstractType::is_top) {
                    return true;
                }
                a == b
                    && args_a.len() == args_b.len()
                    && args_a
                        .iter()
                        .zip(args_b)
                        .all(|(x, y)| x.is_subtype_of(y, classes))
            }
            _ => false,
        }
    }
}

impl Display for AbstractType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbstractType::Dynamic => write!(f, "dynamic"),
            AbstractType::Void => write!(f, "void"),
            AbstractType::Never => write!(f, "Never"),
            AbstractType::Null => write!(f, "Null"),
            AbstractType::Class {
                cid,
                args,
                nullable,
            } => {
                write!(f, "#{cid}")?;
                if !args.is_empty() {
                    write!(f, "<")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ">")?;
                }
                if *nullable {
                    write!(f, "?")?;
                }
                Ok(())
            }
            AbstractType::TypeParameter {
                index,
                function_level,
                nullable,
            } => {
                let prefix = if *function_level { "F" } else { "T" };
                write!(f, "{prefix}{index}{}", if *nullable { "?" } else { "" })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompileType {
    nullable: bool,
    /// `cid::ILLEGAL` means "not computed yet, derive from the type".
    cid: ClassId,
    ty: Option<AbstractType>,
}

impl CompileType {
    pub fn new(nullable: bool, cid: ClassId, ty: Option<AbstractType>) -> Self {
        Self { nullable, cid, ty }
    }

    pub fn none() -> Self {
        Self::new(false, cid::ILLEGAL, None)
    }

    pub fn dynamic() -> Self {
        Self::new(true, cid::DYNAMIC, Some(AbstractType::Dynamic))
    }

    pub fn null() -> Self {
        Self::new(true, cid::NULL, Some(AbstractType::Null))
    }

    pub fn from_cid(cid: ClassId) -> Self {
        Self::new(cid == cid::NULL, cid, None)
    }

    pub fn from_abstract_type(ty: AbstractType) -> Self {
        let nullable = ty.is_nullable();
        Self::new(nullable, cid::ILLEGAL, Some(ty))
    }

    pub fn bool() -> Self {
        Self::from_cid(cid::BOOL)
    }

    pub fn smi() -> Self {
        Self::from_cid(cid::SMI)
    }

    pub fn int() -> Self {
        Self::new(false, cid::DYNAMIC, Some(AbstractType::class(cid::INT)))
    }

    pub fn double() -> Self {
        Self::from_cid(cid::DOUBLE)
    }

    pub fn is_none(&self) -> bool {
        self.cid == cid::ILLEGAL && self.ty.is_none()
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn can_be_null(&self) -> bool {
        self.nullable
    }

    pub fn copy_non_nullable(&self) -> Self {
        let cid = if self.cid == cid::NULL {
            cid::ILLEGAL
        } else {
            self.cid
        };
        let ty = self.ty.as_ref().map(|t| t.with_nullability(false));
        Self::new(false, cid, ty)
    }

    /// The class id of non-null values of this type, or `cid::DYNAMIC`.
    pub fn to_nullable_cid(&self, classes: &ClassTable) -> ClassId {
        if self.cid != cid::ILLEGAL {
            return self.cid;
        }
        match &self.ty {
            None => cid::DYNAMIC,
            Some(AbstractType::Null) => cid::NULL,
            Some(AbstractType::Class { cid: c, .. }) if classes.is_leaf(*c) => *c,
            Some(_) => cid::DYNAMIC,
        }
    }

    /// The exact class id of every value of this type, or `cid::DYNAMIC`.
    pub fn to_cid(&self, classes: &ClassTable) -> ClassId {
        if self.is_none() {
            return cid::ILLEGAL;
        }
        if self.cid == cid::NULL || self.cid == cid::DYNAMIC {
            return self.cid;
        }
        if self.nullable {
            return cid::DYNAMIC;
        }
        self.to_nullable_cid(classes)
    }

    pub fn to_abstract_type(&self) -> AbstractType {
        if let Some(ty) = &self.ty {
            return ty.clone();
        }
        match self.cid {
            cid::ILLEGAL => AbstractType::Never,
            cid::DYNAMIC => AbstractType::Dynamic,
            cid::NULL => AbstractType::Null,
            c => AbstractType::Class {
                cid: c,
                args: Vec::new(),
                nullable: self.nullable,
            },
        }
    }

    /// Least upper bound.
    pub fn union(&self, other: &CompileType, classes: &ClassTable) -> CompileType {
        if other.is_none() {
            return self.clone();
        }
        if self.is_none() {
            return other.clone();
        }

        let nullable = self.nullable || other.nullable;
        let cid_a = self.to_nullable_cid(classes);
        let cid_b = other.to_nullable_cid(classes);

        if cid_a == cid::NULL {
            return other.with_nullable(true);
        }
        if cid_b == cid::NULL {
            return self.with_nullable(true);
        }
        if cid_a == cid_b && cid_a != cid::DYNAMIC {
            return CompileType::new(nullable, cid_a, None);
        }

        let ty_a = self.to_abstract_type();
        let ty_b = other.to_abstract_type();
        let ty = if ty_a.is_subtype_of(&ty_b, classes) {
            ty_b
        } else if ty_b.is_subtype_of(&ty_a, classes) {
            ty_a
        } else if (ty_a.type_class_id().is_some_and(|c| classes.is_subclass_of(c, cid::NUM)))
            && (ty_b.type_class_id().is_some_and(|c| classes.is_subclass_of(c, cid::NUM)))
        {
            let both_int = [&ty_a, &ty_b].iter().all(|t| {
                t.type_class_id()
                    .is_some_and(|c| classes.is_subclass_of(c, cid::INT))
            });
            AbstractType::class(if both_int { cid::INT } else { cid::NUM })
        } else {
            AbstractType::Dynamic
        };
        let ty = ty.with_nullability(nullable || ty.is_nullable());
        CompileType::new(nullable, cid::DYNAMIC, Some(ty))
    }

    fn with_nullable(&self, nullable: bool) -> Self {
        let mut copy = self.clone();
        copy.nullable = nullable;
        if let Some(ty) = &copy.ty {
            copy.ty = Some(ty.with_nullability(nullable || ty.is_nullable()));
        }
        copy
    }

    /// Combines what is already known (`old`) with a newly inferred type,
    /// preferring the more precise information.
    pub fn compute_refined_type(
        old: &CompileType,
        new: &CompileType,
        classes: &ClassTable,
    ) -> CompileType {
        if old.is_none() {
            return new.clone();
        }
        if new.is_none() {
            return old.clone();
        }

        let new_cid = new.to_cid(classes);
        let old_cid = old.to_cid(classes);
        if new_cid != old_cid {
            if new_cid != cid::DYNAMIC {
                return new.clone();
            } else if old_cid != cid::DYNAMIC {
                return old.clone();
            }
        }

        let old_ty = old.to_abstract_type();
        let new_ty = new.to_abstract_type();
        let preferred = if old_ty.is_subtype_of(&new_ty, classes) {
            old
        } else {
            new
        };

        let nullable = old.nullable && new.nullable;
        if preferred.nullable && !nullable {
            preferred.copy_non_nullable()
        } else {
            preferred.clone()
        }
    }

    pub fn is_assignable_to(&self, ty: &AbstractType, classes: &ClassTable) -> bool {
        if ty.is_top() {
            return true;
        }
        if self.is_none() {
            return true;
        }
        if self.nullable && !ty.is_nullable() {
            return false;
        }
        let c = self.to_nullable_cid(classes);
        if c != cid::DYNAMIC && ty.is_instantiated() && ty.is_raw_class() {
            return classes.is_subtype_of(c, ty);
        }
        self.to_abstract_type().is_subtype_of(ty, classes)
    }

    /// Decides `value is ty` at compile time when possible.
    pub fn is_instance_of(&self, ty: &AbstractType, classes: &ClassTable) -> Option<bool> {
        if ty.is_top() {
            return Some(true);
        }
        if !ty.is_instantiated() {
            return None;
        }
        if self.to_cid(classes) == cid::NULL {
            return Some(ty.is_nullable());
        }
        if self.is_assignable_to(ty, classes) {
            return Some(true);
        }
        let c = self.to_cid(classes);
        if c != cid::DYNAMIC && ty.is_raw_class() {
            return Some(classes.is_subtype_of(c, ty));
        }
        None
    }

    pub fn can_be_smi(&self, classes: &ClassTable) -> bool {
        match self.to_nullable_cid(classes) {
            cid::SMI => true,
            cid::DYNAMIC => match self.to_abstract_type() {
                AbstractType::Class { cid: c, .. } => {
                    c == cid::OBJECT || c == cid::NUM || c == cid::INT
                }
                AbstractType::Dynamic | AbstractType::Void | AbstractType::TypeParameter { .. } => {
                    true
                }
                AbstractType::Null | AbstractType::Never => false,
            },
            _ => false,
        }
    }

    pub fn is_bool(&self, classes: &ClassTable) -> bool {
        self.to_cid(classes) == cid::BOOL
    }
}

impl Display for CompileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        match (self.cid, &self.ty) {
            (c, _) if c != cid::ILLEGAL && c != cid::DYNAMIC => {
                write!(f, "cid:{c}{}", if self.nullable { "?" } else { "" })
            }
            (_, Some(ty)) => write!(f, "{ty}"),
            _ => write!(f, "dynamic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_of_smi_and_null_is_nullable_smi() {
        let classes = ClassTable::new();
        let t = CompileType::smi().union(&CompileType::null(), &classes);
        assert!(t.is_nullable());
        assert_eq!(t.to_nullable_cid(&classes), cid::SMI);
        assert_eq!(t.to_cid(&classes), cid::DYNAMIC);
    }

    #[test]
    fn union_with_none_is_identity() {
        let classes = ClassTable::new();
        assert_eq!(
            CompileType::none().union(&CompileType::double(), &classes),
            CompileType::double()
        );
        assert_eq!(
            CompileType::double().union(&CompileType::none(), &classes),
            CompileType::double()
        );
    }

    #[test]
    fn union_of_integers_is_int() {
        let classes = ClassTable::new();
        let t = CompileType::smi().union(&CompileType::from_cid(cid::MINT), &classes);
        assert_eq!(t.to_cid(&classes), cid::DYNAMIC);
        assert_eq!(t.to_abstract_type(), AbstractType::class(cid::INT));
        assert!(!t.is_nullable());
    }

    #[test]
    fn refined_type_prefers_exact_cid() {
        let classes = ClassTable::new();
        let refined =
            CompileType::compute_refined_type(&CompileType::dynamic(), &CompileType::smi(), &classes);
        assert_eq!(refined, CompileType::smi());
        let refined =
            CompileType::compute_refined_type(&CompileType::smi(), &CompileType::dynamic(), &classes);
        assert_eq!(refined, CompileType::smi());
    }

    #[test]
    fn refined_type_drops_nullability() {
        let classes = ClassTable::new();
        let old = CompileType::from_abstract_type(AbstractType::nullable_class(cid::STRING));
        let new = CompileType::from_abstract_type(AbstractType::class(cid::STRING));
        let refined = CompileType::compute_refined_type(&old, &new, &classes);
        assert!(!refined.is_nullable());
    }

    #[test]
    fn static_instance_of() {
        let classes = ClassTable::new();
        let int = AbstractType::class(cid::INT);
        assert_eq!(CompileType::smi().is_instance_of(&int, &classes), Some(true));
        assert_eq!(CompileType::double().is_instance_of(&int, &classes), Some(false));
        assert_eq!(CompileType::null().is_instance_of(&int, &classes), Some(false));
        assert_eq!(CompileType::dynamic().is_instance_of(&int, &classes), None);
    }
}
