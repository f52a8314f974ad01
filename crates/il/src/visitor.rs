//! Double dispatch over instruction kinds.

use crate::{
    flow_graph::FlowGraph,
    ir::{self, BlockId, ConstValue, InstrId, InstrKind},
};

/// One method per instruction kind. Every method defaults to
/// [`FlowGraphVisitor::visit_default`], which does nothing, so a visitor
/// only overrides the kinds it cares about.
pub trait FlowGraphVisitor {
    fn visit_default(&mut self, _instr: InstrId) {}

    /// Visits phis, then every instruction of the block in order.
    fn visit_block(&mut self, graph: &FlowGraph, block: BlockId) {
        for &phi in &graph.blocks[block].phis {
            dispatch(self, phi, &graph.instrs[phi].kind);
        }
        for instr in graph.block_instrs(block) {
            dispatch(self, instr, &graph.instrs[instr].kind);
        }
    }

    fn visit_goto(&mut self, instr: InstrId, _data: &ir::Goto) {
        self.visit_default(instr);
    }

    fn visit_branch(&mut self, instr: InstrId, _data: &ir::Branch) {
        self.visit_default(instr);
    }

    fn visit_return(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_throw(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_rethrow(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_constant(&mut self, instr: InstrId, _data: &ConstValue) {
        self.visit_default(instr);
    }

    fn visit_parameter(&mut self, instr: InstrId, _data: &ir::Parameter) {
        self.visit_default(instr);
    }

    fn visit_phi(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_redefinition(&mut self, instr: InstrId, _data: &ir::Redefinition) {
        self.visit_default(instr);
    }

    fn visit_binary_smi_op(&mut self, instr: InstrId, _data: &ir::BinaryOp) {
        self.visit_default(instr);
    }

    fn visit_binary_int64_op(&mut self, instr: InstrId, _data: &ir::BinaryOp) {
        self.visit_default(instr);
    }

    fn visit_unary_smi_op(&mut self, instr: InstrId, _data: &ir::UnaryOp) {
        self.visit_default(instr);
    }

    fn visit_binary_double_op(&mut self, instr: InstrId, _data: &ir::BinaryOp) {
        self.visit_default(instr);
    }

    fn visit_checked_smi_op(&mut self, instr: InstrId, _data: &ir::BinaryOp) {
        self.visit_default(instr);
    }

    fn visit_checked_smi_comparison(&mut self, instr: InstrId, _data: &ir::BinaryOp) {
        self.visit_default(instr);
    }

    fn visit_relational_op(&mut self, instr: InstrId, _data: &ir::Comparison) {
        self.visit_default(instr);
    }

    fn visit_equality_compare(&mut self, instr: InstrId, _data: &ir::Comparison) {
        self.visit_default(instr);
    }

    fn visit_strict_compare(&mut self, instr: InstrId, _data: &ir::StrictCompare) {
        self.visit_default(instr);
    }

    fn visit_test_cids(&mut self, instr: InstrId, _data: &ir::TestCids) {
        self.visit_default(instr);
    }

    fn visit_boolean_negate(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_box(&mut self, instr: InstrId, _data: &ir::BoxValue) {
        self.visit_default(instr);
    }

    fn visit_unbox(&mut self, instr: InstrId, _data: &ir::Unbox) {
        self.visit_default(instr);
    }

    fn visit_instance_call(&mut self, instr: InstrId, _data: &ir::InstanceCall) {
        self.visit_default(instr);
    }

    fn visit_polymorphic_instance_call(&mut self, instr: InstrId, _data: &ir::PolymorphicInstanceCall) {
        self.visit_default(instr);
    }

    fn visit_static_call(&mut self, instr: InstrId, _data: &ir::StaticCall) {
        self.visit_default(instr);
    }

    fn visit_closure_call(&mut self, instr: InstrId, _data: &ir::ClosureCall) {
        self.visit_default(instr);
    }

    fn visit_move_argument(&mut self, instr: InstrId, _data: &ir::MoveArgument) {
        self.visit_default(instr);
    }

    fn visit_allocate_object(&mut self, instr: InstrId, _data: &ir::AllocateObject) {
        self.visit_default(instr);
    }

    fn visit_load_field(&mut self, instr: InstrId, _data: &ir::LoadField) {
        self.visit_default(instr);
    }

    fn visit_store_instance_field(&mut self, instr: InstrId, _data: &ir::StoreField) {
        self.visit_default(instr);
    }

    fn visit_load_indexed(&mut self, instr: InstrId, _data: &ir::LoadIndexed) {
        self.visit_default(instr);
    }

    fn visit_store_indexed(&mut self, instr: InstrId, _data: &ir::StoreIndexed) {
        self.visit_default(instr);
    }

    fn visit_load_class_id(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_check_class(&mut self, instr: InstrId, _data: &ir::CheckClass) {
        self.visit_default(instr);
    }

    fn visit_check_smi(&mut self, instr: InstrId, _data: &ir::CheckSmi) {
        self.visit_default(instr);
    }

    fn visit_check_null(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_check_class_id(&mut self, instr: InstrId, _data: &ir::CheckClassId) {
        self.visit_default(instr);
    }

    fn visit_check_array_bound(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_check_stack_overflow(&mut self, instr: InstrId, _data: &ir::CheckStackOverflow) {
        self.visit_default(instr);
    }

    fn visit_instance_of(&mut self, instr: InstrId, _data: &ir::TypeTest) {
        self.visit_default(instr);
    }

    fn visit_assert_assignable(&mut self, instr: InstrId, _data: &ir::AssertAssignable) {
        self.visit_default(instr);
    }

    fn visit_assert_boolean(&mut self, instr: InstrId) {
        self.visit_default(instr);
    }

    fn visit_materialize_object(&mut self, instr: InstrId, _data: &ir::MaterializeObject) {
        self.visit_default(instr);
    }
}

/// Calls the visitor method matching `kind`.
pub fn dispatch<V: FlowGraphVisitor + ?Sized>(visitor: &mut V, instr: InstrId, kind: &InstrKind) {
    match kind {
        InstrKind::Goto(data) => visitor.visit_goto(instr, data),
        InstrKind::Branch(data) => visitor.visit_branch(instr, data),
        InstrKind::Return => visitor.visit_return(instr),
        InstrKind::Throw => visitor.visit_throw(instr),
        InstrKind::ReThrow => visitor.visit_rethrow(instr),
        InstrKind::Constant(data) => visitor.visit_constant(instr, data),
        InstrKind::Parameter(data) => visitor.visit_parameter(instr, data),
        InstrKind::Phi => visitor.visit_phi(instr),
        InstrKind::Redefinition(data) => visitor.visit_redefinition(instr, data),
        InstrKind::BinarySmiOp(data) => visitor.visit_binary_smi_op(instr, data),
        InstrKind::BinaryInt64Op(data) => visitor.visit_binary_int64_op(instr, data),
        InstrKind::UnarySmiOp(data) => visitor.visit_unary_smi_op(instr, data),
        InstrKind::BinaryDoubleOp(data) => visitor.visit_binary_double_op(instr, data),
        InstrKind::CheckedSmiOp(data) => visitor.visit_checked_smi_op(instr, data),
        InstrKind::CheckedSmiComparison(data) => visitor.visit_checked_smi_comparison(instr, data),
        InstrKind::RelationalOp(data) => visitor.visit_relational_op(instr, data),
        InstrKind::EqualityCompare(data) => visitor.visit_equality_compare(instr, data),
        InstrKind::StrictCompare(data) => visitor.visit_strict_compare(instr, data),
        InstrKind::TestCids(data) => visitor.visit_test_cids(instr, data),
        InstrKind::BooleanNegate => visitor.visit_boolean_negate(instr),
        InstrKind::Box(data) => visitor.visit_box(instr, data),
        InstrKind::Unbox(data) => visitor.visit_unbox(instr, data),
        InstrKind::InstanceCall(data) => visitor.visit_instance_call(instr, data),
        InstrKind::PolymorphicInstanceCall(data) => visitor.visit_polymorphic_instance_call(instr, data),
        InstrKind::StaticCall(data) => visitor.visit_static_call(instr, data),
        InstrKind::ClosureCall(data) => visitor.visit_closure_call(instr, data),
        InstrKind::MoveArgument(data) => visitor.visit_move_argument(instr, data),
        InstrKind::AllocateObject(data) => visitor.visit_allocate_object(instr, data),
        InstrKind::LoadField(data) => visitor.visit_load_field(instr, data),
        InstrKind::StoreInstanceField(data) => visitor.visit_store_instance_field(instr, data),
        InstrKind::LoadIndexed(data) => visitor.visit_load_indexed(instr, data),
        InstrKind::StoreIndexed(data) => visitor.visit_store_indexed(instr, data),
        InstrKind::LoadClassId => visitor.visit_load_class_id(instr),
        InstrKind::CheckClass(data) => visitor.visit_check_class(instr, data),
        InstrKind::CheckSmi(data) => visitor.visit_check_smi(instr, data),
        InstrKind::CheckNull => visitor.visit_check_null(instr),
        InstrKind::CheckClassId(data) => visitor.visit_check_class_id(instr, data),
        InstrKind::CheckArrayBound => visitor.visit_check_array_bound(instr),
        InstrKind::CheckStackOverflow(data) => visitor.visit_check_stack_overflow(instr, data),
        InstrKind::InstanceOf(data) => visitor.visit_instance_of(instr, data),
        InstrKind::AssertAssignable(data) => visitor.visit_assert_assignable(instr, data),
        InstrKind::AssertBoolean => visitor.visit_assert_boolean(instr),
        InstrKind::MaterializeObject(data) => visitor.visit_materialize_object(instr, data),
    }
}
