use crate::{
    cids::{CallTargets, CidRange, Cids},
    compile_type::{AbstractType, CompileType},
    feedback::ArgumentsDescriptor,
    ir::{BlockId, ConstValue, DeoptId, Environment, InstrId, Representation, TokenPos, UseId},
    object_model::{ClassId, FunctionId, Slot},
};
use compact_str::CompactString;
use cranelift_entity::packed_option::PackedOption;
use smallvec::SmallVec;

/// Operator tokens of arithmetic and comparison instructions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Add,
    Sub,
    Mul,
    TruncDiv,
    Mod,
    Div,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Negate,
    BitNot,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

impl Token {
    pub fn name(self) -> &'static str {
        match self {
            Token::Add => "+",
            Token::Sub => "-",
            Token::Mul => "*",
            Token::TruncDiv => "~/",
            Token::Mod => "%",
            Token::Div => "/",
            Token::BitAnd => "&",
            Token::BitOr => "|",
            Token::BitXor => "^",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::Negate => "unary-",
            Token::BitNot => "~",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Lte => "<=",
            Token::Gte => ">=",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::StrictEq => "===",
            Token::StrictNe => "!==",
        }
    }

    pub fn from_name(name: &str) -> Option<Token> {
        const ALL: [Token; 21] = [
            Token::Add,
            Token::Sub,
            Token::Mul,
            Token::TruncDiv,
            Token::Mod,
            Token::Div,
            Token::BitAnd,
            Token::BitOr,
            Token::BitXor,
            Token::Shl,
            Token::Shr,
            Token::Negate,
            Token::BitNot,
            Token::Lt,
            Token::Gt,
            Token::Lte,
            Token::Gte,
            Token::Eq,
            Token::Ne,
            Token::StrictEq,
            Token::StrictNe,
        ];
        ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn is_relational(self) -> bool {
        matches!(self, Token::Lt | Token::Gt | Token::Lte | Token::Gte)
    }

    pub fn is_equality(self) -> bool {
        matches!(self, Token::Eq | Token::Ne | Token::StrictEq | Token::StrictNe)
    }

    pub fn is_binary_arithmetic(self) -> bool {
        matches!(
            self,
            Token::Add
                | Token::Sub
                | Token::Mul
                | Token::TruncDiv
                | Token::Mod
                | Token::Div
                | Token::BitAnd
                | Token::BitOr
                | Token::BitXor
                | Token::Shl
                | Token::Shr
        )
    }

    /// Operator selector used by instance calls, e.g. `+` or `<`.
    pub fn from_selector(selector: &str) -> Option<Token> {
        match selector {
            "unary-" => Some(Token::Negate),
            _ => Token::from_name(selector).filter(|t| !matches!(t, Token::StrictEq | Token::StrictNe)),
        }
    }

    pub fn negate_comparison(self) -> Token {
        match self {
            Token::Lt => Token::Gte,
            Token::Gt => Token::Lte,
            Token::Lte => Token::Gt,
            Token::Gte => Token::Lt,
            Token::Eq => Token::Ne,
            Token::Ne => Token::Eq,
            Token::StrictEq => Token::StrictNe,
            Token::StrictNe => Token::StrictEq,
            other => panic!("{other:?} is not a comparison"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Goto {
    pub target: BlockId,
}

/// Input 0 is the boolean condition.
#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    pub true_target: BlockId,
    pub false_target: BlockId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Redefinition {
    pub constrained_type: Option<CompileType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryOp {
    pub op: Token,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnaryOp {
    pub op: Token,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub op: Token,
    /// The class id the comparison is specialized for (smi, mint or double).
    pub operation_cid: ClassId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StrictCompare {
    pub op: Token,
    /// Numbers compare by value even when boxed in different objects.
    pub needs_number_check: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestCids {
    pub cids: Cids,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoxValue {
    pub from: Representation,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Unbox {
    pub to: Representation,
    /// Deoptimizes when the input is not of the expected class instead of
    /// assuming a preceding check.
    pub speculative: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceCall {
    pub selector: CompactString,
    pub args_desc: ArgumentsDescriptor,
    pub checked_argument_count: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolymorphicInstanceCall {
    pub selector: CompactString,
    pub args_desc: ArgumentsDescriptor,
    pub targets: CallTargets,
    /// All possible receiver classes are covered, so no miss path is needed.
    pub complete: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StaticCall {
    pub target: FunctionId,
    pub args_desc: ArgumentsDescriptor,
}

/// Argument 0 is the closure.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosureCall {
    pub args_desc: ArgumentsDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MoveArgument {
    /// Distance from the stack pointer at the call, in words.
    pub sp_relative_index: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AllocateObject {
    pub cls: ClassId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadField {
    pub slot: Slot,
}

/// Inputs: instance, value.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreField {
    pub slot: Slot,
    pub emit_store_barrier: bool,
    /// Initializing store into a freshly allocated object.
    pub is_initialization: bool,
}

/// Inputs: array, index.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadIndexed {
    pub class_id: ClassId,
}

/// Inputs: array, index, value.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreIndexed {
    pub class_id: ClassId,
    pub emit_store_barrier: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckClass {
    pub cids: Cids,
    pub licm_hoisted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckSmi {
    pub licm_hoisted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckClassId {
    pub range: CidRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckStackOverflow {
    pub loop_depth: u32,
}

/// Inputs: value, instantiator type arguments, function type arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeTest {
    pub ty: AbstractType,
}

/// Inputs: value, instantiator type arguments, function type arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct AssertAssignable {
    pub ty: AbstractType,
    pub dst_name: CompactString,
}

/// Describes an object whose allocation was removed and which is
/// reconstructed during deoptimization. Inputs are the field values, one
/// per slot.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializeObject {
    pub cls: ClassId,
    pub slots: Vec<Slot>,
}

/// The closed set of instruction kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrKind {
    Goto(Goto),
    Branch(Branch),
    Return,
    Throw,
    ReThrow,

    Constant(ConstValue),
    Parameter(Parameter),
    Phi,
    Redefinition(Redefinition),

    BinarySmiOp(BinaryOp),
    BinaryInt64Op(BinaryOp),
    UnarySmiOp(UnaryOp),
    BinaryDoubleOp(BinaryOp),
    /// Operates inline when both inputs are smis and falls back to an
    /// instance call of the operator otherwise.
    CheckedSmiOp(BinaryOp),
    CheckedSmiComparison(BinaryOp),
    RelationalOp(Comparison),
    EqualityCompare(Comparison),
    StrictCompare(StrictCompare),
    TestCids(TestCids),
    BooleanNegate,
    Box(BoxValue),
    Unbox(Unbox),

    InstanceCall(InstanceCall),
    PolymorphicInstanceCall(PolymorphicInstanceCall),
    StaticCall(StaticCall),
    ClosureCall(ClosureCall),
    MoveArgument(MoveArgument),

    AllocateObject(AllocateObject),
    LoadField(LoadField),
    StoreInstanceField(StoreField),
    LoadIndexed(LoadIndexed),
    StoreIndexed(StoreIndexed),
    LoadClassId,

    CheckClass(CheckClass),
    CheckSmi(CheckSmi),
    CheckNull,
    CheckClassId(CheckClassId),
    /// Inputs: length, index. Produces the index.
    CheckArrayBound,
    CheckStackOverflow(CheckStackOverflow),

    InstanceOf(TypeTest),
    AssertAssignable(AssertAssignable),
    AssertBoolean,

    MaterializeObject(MaterializeObject),
}

impl InstrKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstrKind::Goto(_) => "goto",
            InstrKind::Branch(_) => "branch",
            InstrKind::Return => "return",
            InstrKind::Throw => "throw",
            InstrKind::ReThrow => "rethrow",
            InstrKind::Constant(_) => "constant",
            InstrKind::Parameter(_) => "parameter",
            InstrKind::Phi => "phi",
            InstrKind::Redefinition(_) => "redefinition",
            InstrKind::BinarySmiOp(_) => "binary_smi_op",
            InstrKind::BinaryInt64Op(_) => "binary_int64_op",
            InstrKind::UnarySmiOp(_) => "unary_smi_op",
            InstrKind::BinaryDoubleOp(_) => "binary_double_op",
            InstrKind::CheckedSmiOp(_) => "checked_smi_op",
            InstrKind::CheckedSmiComparison(_) => "checked_smi_comparison",
            InstrKind::RelationalOp(_) => "relational_op",
            InstrKind::EqualityCompare(_) => "equality_compare",
            InstrKind::StrictCompare(_) => "strict_compare",
            InstrKind::TestCids(_) => "test_cids",
            InstrKind::BooleanNegate => "boolean_negate",
            InstrKind::Box(_) => "box",
            InstrKind::Unbox(_) => "unbox",
            InstrKind::InstanceCall(_) => "instance_call",
            InstrKind::PolymorphicInstanceCall(_) => "polymorphic_instance_call",
            InstrKind::StaticCall(_) => "static_call",
            InstrKind::ClosureCall(_) => "closure_call",
            InstrKind::MoveArgument(_) => "move_argument",
            InstrKind::AllocateObject(_) => "allocate_object",
            InstrKind::LoadField(_) => "load_field",
            InstrKind::StoreInstanceField(_) => "store_field",
            InstrKind::LoadIndexed(_) => "load_indexed",
            InstrKind::StoreIndexed(_) => "store_indexed",
            InstrKind::LoadClassId => "load_class_id",
            InstrKind::CheckClass(_) => "check_class",
            InstrKind::CheckSmi(_) => "check_smi",
            InstrKind::CheckNull => "check_null",
            InstrKind::CheckClassId(_) => "check_class_id",
            InstrKind::CheckArrayBound => "check_array_bound",
            InstrKind::CheckStackOverflow(_) => "check_stack_overflow",
            InstrKind::InstanceOf(_) => "instance_of",
            InstrKind::AssertAssignable(_) => "assert_assignable",
            InstrKind::AssertBoolean => "assert_boolean",
            InstrKind::MaterializeObject(_) => "materialize_object",
        }
    }

    /// Number of inputs the kind requires, or `None` for variadic kinds.
    pub fn fixed_input_count(&self) -> Option<usize> {
        Some(match self {
            InstrKind::Goto(_)
            | InstrKind::Constant(_)
            | InstrKind::Parameter(_)
            | InstrKind::AllocateObject(_)
            | InstrKind::CheckStackOverflow(_) => 0,
            InstrKind::Branch(_)
            | InstrKind::Return
            | InstrKind::Throw
            | InstrKind::Redefinition(_)
            | InstrKind::UnarySmiOp(_)
            | InstrKind::BooleanNegate
            | InstrKind::Box(_)
            | InstrKind::Unbox(_)
            | InstrKind::MoveArgument(_)
            | InstrKind::LoadField(_)
            | InstrKind::LoadClassId
            | InstrKind::CheckClass(_)
            | InstrKind::CheckSmi(_)
            | InstrKind::CheckNull
            | InstrKind::CheckClassId(_)
            | InstrKind::TestCids(_)
            | InstrKind::AssertBoolean => 1,
            InstrKind::ReThrow
            | InstrKind::BinarySmiOp(_)
            | InstrKind::BinaryInt64Op(_)
            | InstrKind::BinaryDoubleOp(_)
            | InstrKind::CheckedSmiOp(_)
            | InstrKind::CheckedSmiComparison(_)
            | InstrKind::RelationalOp(_)
            | InstrKind::EqualityCompare(_)
            | InstrKind::StrictCompare(_)
            | InstrKind::StoreInstanceField(_)
            | InstrKind::LoadIndexed(_)
            | InstrKind::CheckArrayBound => 2,
            InstrKind::StoreIndexed(_) | InstrKind::InstanceOf(_) | InstrKind::AssertAssignable(_) => 3,
            InstrKind::MaterializeObject(m) => m.slots.len(),
            InstrKind::Phi
            | InstrKind::InstanceCall(_)
            | InstrKind::PolymorphicInstanceCall(_)
            | InstrKind::StaticCall(_)
            | InstrKind::ClosureCall(_) => return None,
        })
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            InstrKind::Goto(_)
                | InstrKind::Branch(_)
                | InstrKind::Return
                | InstrKind::Throw
                | InstrKind::ReThrow
        )
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            InstrKind::Goto(goto) => SmallVec::from_elem(goto.target, 1),
            InstrKind::Branch(branch) => {
                SmallVec::from_slice(&[branch.true_target, branch.false_target])
            }
            _ => SmallVec::new(),
        }
    }

    /// Whether the instruction produces a value.
    pub fn is_definition(&self) -> bool {
        !matches!(
            self,
            InstrKind::Goto(_)
                | InstrKind::Branch(_)
                | InstrKind::Return
                | InstrKind::Throw
                | InstrKind::ReThrow
                | InstrKind::StoreInstanceField(_)
                | InstrKind::StoreIndexed(_)
                | InstrKind::CheckClass(_)
                | InstrKind::CheckSmi(_)
                | InstrKind::CheckClassId(_)
                | InstrKind::CheckStackOverflow(_)
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            InstrKind::InstanceCall(_)
                | InstrKind::PolymorphicInstanceCall(_)
                | InstrKind::StaticCall(_)
                | InstrKind::ClosureCall(_)
        )
    }

    pub fn args_desc(&self) -> Option<&ArgumentsDescriptor> {
        match self {
            InstrKind::InstanceCall(call) => Some(&call.args_desc),
            InstrKind::PolymorphicInstanceCall(call) => Some(&call.args_desc),
            InstrKind::StaticCall(call) => Some(&call.args_desc),
            InstrKind::ClosureCall(call) => Some(&call.args_desc),
            _ => None,
        }
    }

    /// Whether the instruction may deoptimize, eagerly (a failed guard)
    /// or lazily (a call returning to invalidated code). Such instructions
    /// must carry an environment and a deopt id.
    pub fn can_deoptimize(&self) -> bool {
        match self {
            InstrKind::BinarySmiOp(bin) => matches!(
                bin.op,
                Token::Add | Token::Sub | Token::Mul | Token::Shl | Token::TruncDiv | Token::Mod
            ),
            InstrKind::UnarySmiOp(un) => un.op == Token::Negate,
            InstrKind::Unbox(unbox) => unbox.speculative,
            InstrKind::InstanceCall(_)
            | InstrKind::PolymorphicInstanceCall(_)
            | InstrKind::StaticCall(_)
            | InstrKind::ClosureCall(_)
            | InstrKind::CheckedSmiOp(_)
            | InstrKind::CheckedSmiComparison(_)
            | InstrKind::CheckClass(_)
            | InstrKind::CheckSmi(_)
            | InstrKind::CheckNull
            | InstrKind::CheckClassId(_)
            | InstrKind::CheckArrayBound
            | InstrKind::CheckStackOverflow(_)
            | InstrKind::InstanceOf(_)
            | InstrKind::AssertAssignable(_)
            | InstrKind::AssertBoolean => true,
            _ => false,
        }
    }

    pub fn has_unknown_side_effects(&self) -> bool {
        matches!(
            self,
            InstrKind::InstanceCall(_)
                | InstrKind::PolymorphicInstanceCall(_)
                | InstrKind::StaticCall(_)
                | InstrKind::ClosureCall(_)
                | InstrKind::CheckedSmiOp(_)
                | InstrKind::CheckedSmiComparison(_)
        )
    }

    pub fn may_throw(&self) -> bool {
        matches!(
            self,
            InstrKind::Throw
                | InstrKind::ReThrow
                | InstrKind::InstanceCall(_)
                | InstrKind::PolymorphicInstanceCall(_)
                | InstrKind::StaticCall(_)
                | InstrKind::ClosureCall(_)
                | InstrKind::CheckedSmiOp(_)
                | InstrKind::CheckedSmiComparison(_)
                | InstrKind::CheckNull
                | InstrKind::CheckStackOverflow(_)
                | InstrKind::AssertAssignable(_)
                | InstrKind::AssertBoolean
        )
    }

    /// Pure instructions: two occurrences with equal inputs and
    /// attributes compute the same value.
    pub fn allows_cse(&self) -> bool {
        match self {
            InstrKind::LoadField(load) => load.slot.is_immutable,
            InstrKind::BinarySmiOp(_)
            | InstrKind::BinaryInt64Op(_)
            | InstrKind::UnarySmiOp(_)
            | InstrKind::BinaryDoubleOp(_)
            | InstrKind::RelationalOp(_)
            | InstrKind::EqualityCompare(_)
            | InstrKind::StrictCompare(_)
            | InstrKind::TestCids(_)
            | InstrKind::BooleanNegate
            | InstrKind::Box(_)
            | InstrKind::Unbox(_)
            | InstrKind::LoadClassId
            | InstrKind::CheckClass(_)
            | InstrKind::CheckSmi(_)
            | InstrKind::CheckNull
            | InstrKind::CheckClassId(_)
            | InstrKind::CheckArrayBound => true,
            _ => false,
        }
    }

    /// Equality of everything but the kind tag and the inputs. Only
    /// meaningful between kinds with the same tag.
    pub fn attributes_equal(&self, other: &InstrKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other) && self == other
    }

    /// Whether the instruction writes memory that loads could observe.
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            InstrKind::StoreInstanceField(_) | InstrKind::StoreIndexed(_)
        )
    }

    /// Checks whose only effect is a possible deoptimization.
    pub fn is_check(&self) -> bool {
        matches!(
            self,
            InstrKind::CheckClass(_)
                | InstrKind::CheckSmi(_)
                | InstrKind::CheckNull
                | InstrKind::CheckClassId(_)
                | InstrKind::CheckArrayBound
        )
    }

    /// The definition this instruction refines without changing its
    /// value, if any.
    pub fn redefined_input(&self) -> Option<usize> {
        match self {
            InstrKind::Redefinition(_) | InstrKind::CheckNull | InstrKind::AssertAssignable(_) => {
                Some(0)
            }
            InstrKind::CheckArrayBound => Some(1),
            _ => None,
        }
    }

    pub fn default_representation(&self) -> Representation {
        match self {
            InstrKind::BinaryInt64Op(_) => Representation::UnboxedInt64,
            InstrKind::BinaryDoubleOp(_) => Representation::UnboxedDouble,
            InstrKind::Unbox(unbox) => unbox.to,
            _ if !self.is_definition() => Representation::NoRepresentation,
            _ => Representation::Tagged,
        }
    }

    /// Representation the instruction expects for input `index`.
    pub fn required_input_representation(&self, _index: usize) -> Representation {
        match self {
            InstrKind::BinaryInt64Op(_) => Representation::UnboxedInt64,
            InstrKind::BinaryDoubleOp(_) => Representation::UnboxedDouble,
            InstrKind::Box(boxed) => boxed.from,
            InstrKind::RelationalOp(cmp) | InstrKind::EqualityCompare(cmp)
                if cmp.operation_cid == crate::object_model::cid::DOUBLE =>
            {
                Representation::UnboxedDouble
            }
            InstrKind::RelationalOp(cmp) | InstrKind::EqualityCompare(cmp)
                if cmp.operation_cid == crate::object_model::cid::MINT =>
            {
                Representation::UnboxedInt64
            }
            _ => Representation::Tagged,
        }
    }
}

/// An instruction node. Block entries are not instructions; they are
/// [`BlockData`](crate::ir::BlockData) values that own an instruction list.
#[derive(Clone, Debug)]
pub struct InstrData {
    pub kind: InstrKind,
    /// Owning block. `None` when not (or no longer) in the graph.
    pub block: PackedOption<BlockId>,
    pub prev: PackedOption<InstrId>,
    pub next: PackedOption<InstrId>,
    pub inputs: SmallVec<[UseId; 3]>,
    pub env: Option<Environment>,
    pub deopt_id: Option<DeoptId>,
    pub token_pos: TokenPos,
    /// SSA name of a definition. Instructions that produce no value have none.
    pub ssa_temp: Option<u32>,
    pub input_use_list: PackedOption<UseId>,
    pub env_use_list: PackedOption<UseId>,
    /// Cached static type of the produced value.
    pub compile_type: Option<CompileType>,
    pub representation: Representation,
    /// Set once the call has been lowered to move-argument form.
    pub move_arguments: Option<SmallVec<[InstrId; 4]>>,
}

impl InstrData {
    pub fn new(kind: InstrKind) -> Self {
        let representation = kind.default_representation();
        Self {
            kind,
            block: PackedOption::default(),
            prev: PackedOption::default(),
            next: PackedOption::default(),
            inputs: SmallVec::new(),
            env: None,
            deopt_id: None,
            token_pos: TokenPos::NO_SOURCE,
            ssa_temp: None,
            input_use_list: PackedOption::default(),
            env_use_list: PackedOption::default(),
            compile_type: None,
            representation,
            move_arguments: None,
        }
    }

    pub fn is_definition(&self) -> bool {
        self.kind.is_definition()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstrKind::Phi)
    }

    pub fn as_constant(&self) -> Option<&ConstValue> {
        match &self.kind {
            InstrKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn argument_count(&self) -> usize {
        match &self.move_arguments {
            Some(args) => args.len(),
            None if self.kind.is_call() => self.inputs.len(),
            None => 0,
        }
    }
}
