//! Narrow interface to the object model.
//!
//! The compiler never inspects heap objects directly. It only needs to
//! know class ids, the class hierarchy (for closed-world analyses and
//! type tests), field slots, and the signatures of functions it calls
//! or compiles.

use crate::{
    cids::{CidRange, Cids},
    compile_type::AbstractType,
    ir::ConstValue,
};
use compact_str::CompactString;
use cranelift_entity::PrimaryMap;
use ember_core::IndexMap;
use smallvec::SmallVec;

pub type ClassId = u32;

/// Predefined class ids. User classes are numbered from
/// [`cid::NUM_PREDEFINED`].
pub mod cid {
    use super::ClassId;

    pub const ILLEGAL: ClassId = 0;
    /// Not a concrete class: the value may have any class.
    pub const DYNAMIC: ClassId = 1;
    pub const VOID: ClassId = 2;
    pub const NULL: ClassId = 3;
    pub const OBJECT: ClassId = 4;
    pub const NUM: ClassId = 5;
    pub const INT: ClassId = 6;
    pub const SMI: ClassId = 7;
    pub const MINT: ClassId = 8;
    pub const DOUBLE: ClassId = 9;
    pub const STRING: ClassId = 10;
    pub const ONE_BYTE_STRING: ClassId = 11;
    pub const TWO_BYTE_STRING: ClassId = 12;
    pub const BOOL: ClassId = 13;
    pub const ARRAY: ClassId = 14;
    pub const CLOSURE: ClassId = 15;
    pub const NUM_PREDEFINED: ClassId = 16;

    pub fn is_integer(cid: ClassId) -> bool {
        cid == SMI || cid == MINT
    }

    pub fn is_string(cid: ClassId) -> bool {
        cid == ONE_BYTE_STRING || cid == TWO_BYTE_STRING
    }
}

ember_core::entity_ref! {
    pub struct FunctionId;
}

/// A field location inside an object, in words from the object start.
/// Word 0 holds the header (which contains the class id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub name: CompactString,
    pub offset_in_words: u32,
    /// Immutable slots can be loaded once and reused (CSE).
    pub is_immutable: bool,
}

impl Slot {
    pub const HEADER_WORDS: u32 = 1;

    pub fn new(name: impl Into<CompactString>, offset_in_words: u32) -> Self {
        Self {
            name: name.into(),
            offset_in_words,
            is_immutable: false,
        }
    }

    pub fn array_length() -> Self {
        Self {
            name: "length".into(),
            offset_in_words: Self::HEADER_WORDS,
            is_immutable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FunctionKind {
    Regular,
    Getter,
    Setter,
    ImplicitGetter(Slot),
    ImplicitSetter(Slot),
    Closure,
    Constructor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamedParameter {
    pub name: CompactString,
    pub default: ConstValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionInfo {
    pub name: CompactString,
    pub owner: ClassId,
    pub kind: FunctionKind,
    /// Includes the receiver (or the closure object).
    pub num_fixed_parameters: u32,
    pub optional_positional: Vec<ConstValue>,
    /// Optional named parameters in declaration order.
    pub optional_named: Vec<NamedParameter>,
    pub is_static: bool,
    /// Functions that are never compiled unoptimized and therefore
    /// cannot deoptimize.
    pub is_force_optimized: bool,
}

impl FunctionInfo {
    pub fn new(name: impl Into<CompactString>, owner: ClassId, num_fixed_parameters: u32) -> Self {
        Self {
            name: name.into(),
            owner,
            kind: FunctionKind::Regular,
            num_fixed_parameters,
            optional_positional: Vec::new(),
            optional_named: Vec::new(),
            is_static: false,
            is_force_optimized: false,
        }
    }

    pub fn has_optional_parameters(&self) -> bool {
        !self.optional_positional.is_empty() || !self.optional_named.is_empty()
    }

    pub fn num_optional_parameters(&self) -> u32 {
        (self.optional_positional.len() + self.optional_named.len()) as u32
    }

    pub fn num_parameters(&self) -> u32 {
        self.num_fixed_parameters + self.num_optional_parameters()
    }

    pub fn min_positional_args(&self) -> u32 {
        self.num_fixed_parameters
    }

    pub fn max_positional_args(&self) -> u32 {
        self.num_fixed_parameters + self.optional_positional.len() as u32
    }

    /// Indices into `optional_named`, ordered by parameter name.
    pub fn sorted_named_parameters(&self) -> SmallVec<[usize; 4]> {
        let mut order: SmallVec<[usize; 4]> = (0..self.optional_named.len()).collect();
        order.sort_by(|&a, &b| self.optional_named[a].name.cmp(&self.optional_named[b].name));
        order
    }
}

#[derive(Clone, Debug)]
pub struct ClassInfo {
    pub cid: ClassId,
    pub name: CompactString,
    pub superclass: Option<ClassId>,
    pub interfaces: SmallVec<[ClassId; 2]>,
    pub is_abstract: bool,
    pub fields: Vec<Slot>,
    pub methods: IndexMap<CompactString, FunctionId>,
    pub num_type_arguments: u32,
}

/// Closed-world view of all classes and functions of the program.
#[derive(Clone, Debug)]
pub struct ClassTable {
    classes: Vec<ClassInfo>,
    functions: PrimaryMap<FunctionId, FunctionInfo>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        let mut table = Self {
            classes: Vec::new(),
            functions: PrimaryMap::new(),
        };

        let predefined: [(ClassId, &str, Option<ClassId>, bool); cid::NUM_PREDEFINED as usize] = [
            (cid::ILLEGAL, "<illegal>", None, true),
            (cid::DYNAMIC, "dynamic", None, true),
            (cid::VOID, "void", None, true),
            (cid::NULL, "Null", Some(cid::OBJECT), false),
            (cid::OBJECT, "Object", None, false),
            (cid::NUM, "num", Some(cid::OBJECT), true),
            (cid::INT, "int", Some(cid::NUM), true),
            (cid::SMI, "_Smi", Some(cid::INT), false),
            (cid::MINT, "_Mint", Some(cid::INT), false),
            (cid::DOUBLE, "double", Some(cid::NUM), false),
            (cid::STRING, "String", Some(cid::OBJECT), true),
            (cid::ONE_BYTE_STRING, "_OneByteString", Some(cid::STRING), false),
            (cid::TWO_BYTE_STRING, "_TwoByteString", Some(cid::STRING), false),
            (cid::BOOL, "bool", Some(cid::OBJECT), false),
            (cid::ARRAY, "_List", Some(cid::OBJECT), false),
            (cid::CLOSURE, "_Closure", Some(cid::OBJECT), false),
        ];

        for (expected_cid, name, superclass, is_abstract) in predefined {
            let cid = table.push_class(name, superclass);
            assert_eq!(cid, expected_cid);
            table.classes[cid as usize].is_abstract = is_abstract;
        }
        table.classes[cid::ARRAY as usize]
            .fields
            .push(Slot::array_length());

        table
    }

    fn push_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        let cid = self.classes.len() as ClassId;
        self.classes.push(ClassInfo {
            cid,
            name: name.into(),
            superclass,
            interfaces: SmallVec::new(),
            is_abstract: false,
            fields: Vec::new(),
            methods: IndexMap::default(),
            num_type_arguments: 0,
        });
        cid
    }

    /// Adds a class. Classes must be added superclass first.
    pub fn add_class(&mut self, name: &str, superclass: ClassId) -> ClassId {
        assert!(
            (superclass as usize) < self.classes.len(),
            "superclass must be registered before its subclasses"
        );
        self.push_class(name, Some(superclass))
    }

    pub fn set_abstract(&mut self, cid: ClassId, is_abstract: bool) {
        self.classes[cid as usize].is_abstract = is_abstract;
    }

    pub fn add_interface(&mut self, cid: ClassId, interface: ClassId) {
        self.classes[cid as usize].interfaces.push(interface);
    }

    pub fn set_num_type_arguments(&mut self, cid: ClassId, n: u32) {
        self.classes[cid as usize].num_type_arguments = n;
    }

    /// Adds an instance field, laid out after all inherited fields.
    pub fn add_field(&mut self, cid: ClassId, name: &str) -> Slot {
        let offset = Slot::HEADER_WORDS + self.instance_field_count(cid);
        let slot = Slot::new(name, offset);
        self.classes[cid as usize].fields.push(slot.clone());
        slot
    }

    /// Adds a method to a class and returns its function id.
    pub fn add_method(&mut self, cid: ClassId, selector: &str, info: FunctionInfo) -> FunctionId {
        let id = self.functions.push(info);
        self.classes[cid as usize]
            .methods
            .insert(selector.into(), id);
        id
    }

    /// Adds implicit getter and setter methods for a field.
    pub fn add_field_accessors(&mut self, cid: ClassId, slot: &Slot) -> (FunctionId, FunctionId) {
        let mut getter = FunctionInfo::new(format!("get:{}", slot.name), cid, 1);
        getter.kind = FunctionKind::ImplicitGetter(slot.clone());
        let mut setter = FunctionInfo::new(format!("set:{}", slot.name), cid, 2);
        setter.kind = FunctionKind::ImplicitSetter(slot.clone());
        (
            self.add_method(cid, &format!("get:{}", slot.name), getter),
            self.add_method(cid, &format!("set:{}", slot.name), setter),
        )
    }

    /// Adds a function that is not a method (a static function or a closure body).
    pub fn add_function(&mut self, info: FunctionInfo) -> FunctionId {
        self.functions.push(info)
    }

    pub fn superclass(&self, cid: ClassId) -> Option<ClassId> {
        self.class(cid).superclass
    }

    pub fn num_cids(&self) -> ClassId {
        self.classes.len() as ClassId
    }

    pub fn class(&self, cid: ClassId) -> &ClassInfo {
        &self.classes[cid as usize]
    }

    pub fn function(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id]
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| i as ClassId)
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    pub fn class_name(&self, cid: ClassId) -> &str {
        self.classes
            .get(cid as usize)
            .map(|c| c.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn instance_field_count(&self, cid: ClassId) -> u32 {
        let class = self.class(cid);
        let inherited = class
            .superclass
            .map(|sup| self.instance_field_count(sup))
            .unwrap_or(0);
        inherited + class.fields.len() as u32
    }

    /// All instance slots of a class, inherited ones first.
    pub fn instance_slots(&self, cid: ClassId) -> Vec<Slot> {
        let class = self.class(cid);
        let mut slots = class
            .superclass
            .map(|sup| self.instance_slots(sup))
            .unwrap_or_default();
        slots.extend(class.fields.iter().cloned());
        slots
    }

    pub fn field_slot(&self, cid: ClassId, name: &str) -> Option<&Slot> {
        let mut current = Some(cid);
        while let Some(c) = current {
            let class = self.class(c);
            if let Some(slot) = class.fields.iter().find(|s| s.name == name) {
                return Some(slot);
            }
            current = class.superclass;
        }
        None
    }

    /// Whether `cid` is `sup` or extends / implements it.
    pub fn is_subclass_of(&self, cid: ClassId, sup: ClassId) -> bool {
        if cid == sup || sup == cid::OBJECT {
            return cid != cid::ILLEGAL;
        }
        let class = match self.classes.get(cid as usize) {
            Some(c) => c,
            None => return false,
        };
        class
            .superclass
            .is_some_and(|parent| self.is_subclass_of(parent, sup))
            || class
                .interfaces
                .iter()
                .any(|&iface| self.is_subclass_of(iface, sup))
    }

    /// The runtime subtype judgment for an instance of class `cid`.
    ///
    /// Instances carry no type arguments, so class types are compared
    /// by their class only. Uninstantiated types never reach this
    /// function; callers instantiate them first.
    pub fn is_subtype_of(&self, cid: ClassId, ty: &AbstractType) -> bool {
        match ty {
            AbstractType::Dynamic | AbstractType::Void => true,
            AbstractType::Never => false,
            AbstractType::Null => cid == cid::NULL,
            AbstractType::Class {
                cid: type_cid,
                nullable,
                ..
            } => {
                if cid == cid::NULL {
                    *nullable || *type_cid == cid::NULL
                } else {
                    self.is_subclass_of(cid, *type_cid)
                }
            }
            AbstractType::TypeParameter { .. } => {
                panic!("runtime type test against uninstantiated type {ty}")
            }
        }
    }

    /// Whether no class other than `cid` itself can be an instance of `cid`.
    pub fn is_leaf(&self, cid: ClassId) -> bool {
        !self.class(cid).is_abstract
            && (0..self.num_cids()).all(|other| other == cid || !self.is_subclass_of(other, cid))
    }

    /// Concrete class ids that are subclasses of `cid`, as sorted ranges
    /// (closed-world class hierarchy analysis).
    pub fn subtype_ranges(&self, cid: ClassId) -> Cids {
        Cids::from_ranges(
            (0..self.num_cids())
                .filter(|&c| !self.class(c).is_abstract && c != cid::NULL)
                .filter(|&c| self.is_subclass_of(c, cid))
                .map(CidRange::single),
        )
    }

    /// Finds the implementation of `selector` for receivers of class `cid`.
    pub fn resolve_dynamic(&self, cid: ClassId, selector: &str) -> Option<FunctionId> {
        let mut current = Some(cid);
        while let Some(c) = current {
            let class = self.classes.get(c as usize)?;
            if let Some(&f) = class.methods.get(selector) {
                return Some(f);
            }
            current = class.superclass;
        }
        None
    }

    /// If every concrete receiver class in `cids` resolves `selector`
    /// to the same function, returns it.
    pub fn unique_target(&self, cids: &Cids, selector: &str) -> Option<FunctionId> {
        let mut target = None;
        for range in cids.ranges() {
            for c in range.start..=range.end {
                if c >= self.num_cids() || self.class(c).is_abstract {
                    continue;
                }
                let resolved = self.resolve_dynamic(c, selector)?;
                match target {
                    None => target = Some(resolved),
                    Some(t) if t == resolved => {}
                    Some(_) => return None,
                }
            }
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_hierarchy() {
        let classes = ClassTable::new();
        assert!(classes.is_subclass_of(cid::SMI, cid::INT));
        assert!(classes.is_subclass_of(cid::SMI, cid::NUM));
        assert!(classes.is_subclass_of(cid::DOUBLE, cid::OBJECT));
        assert!(!classes.is_subclass_of(cid::DOUBLE, cid::INT));
        assert_eq!(
            classes.subtype_ranges(cid::INT).ranges(),
            &[CidRange::new(cid::SMI, cid::MINT)]
        );
    }

    #[test]
    fn fields_are_laid_out_after_inherited_ones() {
        let mut classes = ClassTable::new();
        let a = classes.add_class("A", cid::OBJECT);
        let x = classes.add_field(a, "x");
        let b = classes.add_class("B", a);
        let y = classes.add_field(b, "y");
        assert_eq!(x.offset_in_words, 1);
        assert_eq!(y.offset_in_words, 2);
        assert_eq!(classes.field_slot(b, "x"), Some(&x));
        assert_eq!(classes.instance_slots(b), vec![x, y]);
    }

    #[test]
    fn unique_target_through_inheritance() {
        let mut classes = ClassTable::new();
        let a = classes.add_class("A", cid::OBJECT);
        let b = classes.add_class("B", a);
        let foo = classes.add_method(a, "foo", FunctionInfo::new("A.foo", a, 1));
        assert_eq!(classes.unique_target(&classes.subtype_ranges(a), "foo"), Some(foo));

        let foo_b = classes.add_method(b, "foo", FunctionInfo::new("B.foo", b, 1));
        assert_eq!(classes.unique_target(&classes.subtype_ranges(a), "foo"), None);
        assert_eq!(classes.unique_target(&Cids::create_monomorphic(b), "foo"), Some(foo_b));
    }
}
