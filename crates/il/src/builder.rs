use crate::{
    compile_type::AbstractType,
    feedback::ArgumentsDescriptor,
    flow_graph::{EnvFrameSpec, FlowGraph},
    ir::{
        self, BlockId, BlockKind, ConstValue, InstrId, InstrKind, Token, TokenPos,
    },
    object_model::{ClassId, ClassTable, FunctionId, Slot},
};
use compact_str::CompactString;
use std::sync::Arc;

/// Builder API for a `FlowGraph`.
///
/// Instructions that can deoptimize get a fresh deopt id and, unless one
/// is given explicitly, a single-frame environment holding the
/// parameters, the current locals and the instruction's inputs (the
/// expression stack of the unoptimized code at that point).
pub struct GraphBuilder {
    graph: FlowGraph,
    current_block: BlockId,
    parameters: Vec<InstrId>,
    locals: Vec<InstrId>,
}

impl GraphBuilder {
    pub fn new(classes: Arc<ClassTable>, function: FunctionId) -> Self {
        let mut graph = FlowGraph::new(classes, function);
        let entry = graph.add_block(BlockKind::FunctionEntry);
        let num_parameters = graph.function_info().num_parameters();
        let parameters = (0..num_parameters)
            .map(|index| {
                graph.add_initial_definition(
                    entry,
                    InstrKind::Parameter(ir::Parameter { index }),
                )
            })
            .collect();
        Self {
            graph,
            current_block: entry,
            parameters,
            locals: Vec::new(),
        }
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut FlowGraph {
        &mut self.graph
    }

    pub fn entry_block(&self) -> BlockId {
        self.graph
            .normal_entry()
            .unwrap_or_else(|| panic!("builder graph has no function entry"))
    }

    pub fn parameter(&self, index: usize) -> InstrId {
        self.parameters[index]
    }

    pub fn constant(&mut self, value: ConstValue) -> InstrId {
        self.graph.constant(value)
    }

    pub fn int(&mut self, value: i64) -> InstrId {
        self.graph.constant(ConstValue::Int(value))
    }

    pub fn null(&mut self) -> InstrId {
        self.graph.constant(ConstValue::Null)
    }

    pub fn create_block(&mut self, kind: BlockKind) -> BlockId {
        self.graph.add_block(kind)
    }

    pub fn create_join(&mut self) -> BlockId {
        self.graph.add_block(BlockKind::Join)
    }

    pub fn create_target(&mut self) -> BlockId {
        self.graph.add_block(BlockKind::Target)
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Sets the interpreter locals recorded in default environments.
    pub fn set_locals(&mut self, locals: &[InstrId]) {
        self.locals = locals.to_vec();
    }

    pub fn phi(&mut self, block: BlockId, inputs: &[InstrId]) -> InstrId {
        self.graph.add_phi(block, inputs)
    }

    pub fn instr(&mut self) -> InstrBuilder<'_> {
        InstrBuilder {
            builder: self,
            env: None,
            token_pos: TokenPos::NO_SOURCE,
        }
    }

    pub fn finish(mut self) -> FlowGraph {
        self.graph.compute_block_info();
        self.graph
    }

    fn default_environment(&self, inputs: &[InstrId]) -> Vec<EnvFrameSpec> {
        let info = self.graph.function_info();
        let values = self
            .parameters
            .iter()
            .chain(&self.locals)
            .chain(inputs)
            .copied()
            .collect();
        vec![EnvFrameSpec {
            function: self.graph.function,
            values,
            fixed_parameter_count: info.num_parameters(),
            deopt_id: ir::DeoptId(0),
        }]
    }
}

pub struct InstrBuilder<'a> {
    builder: &'a mut GraphBuilder,
    env: Option<Vec<EnvFrameSpec>>,
    token_pos: TokenPos,
}

impl InstrBuilder<'_> {
    /// Overrides the environment. Frame deopt ids of the innermost frame
    /// are replaced by the instruction's deopt id.
    pub fn with_env(mut self, frames: Vec<EnvFrameSpec>) -> Self {
        self.env = Some(frames);
        self
    }

    pub fn at(mut self, token_pos: TokenPos) -> Self {
        self.token_pos = token_pos;
        self
    }

    pub fn emit(self, kind: InstrKind, inputs: &[InstrId]) -> InstrId {
        let builder = self.builder;
        let can_deoptimize = kind.can_deoptimize();
        let graph = &mut builder.graph;
        let instr = graph.new_instr(kind, inputs);
        graph.instrs[instr].token_pos = self.token_pos;
        if can_deoptimize {
            let deopt_id = graph.alloc_deopt_id();
            graph.instrs[instr].deopt_id = Some(deopt_id);
            let mut frames = self
                .env
                .unwrap_or_else(|| builder.default_environment(inputs));
            if let Some(innermost) = frames.last_mut() {
                innermost.deopt_id = deopt_id;
            }
            builder.graph.set_environment(instr, frames);
        }
        builder.graph.append(builder.current_block, instr);
        instr
    }

    pub fn goto(self, target: BlockId) {
        self.emit(InstrKind::Goto(ir::Goto { target }), &[]);
    }

    pub fn branch(self, condition: InstrId, true_target: BlockId, false_target: BlockId) {
        self.emit(
            InstrKind::Branch(ir::Branch {
                true_target,
                false_target,
            }),
            &[condition],
        );
    }

    pub fn return_(self, value: InstrId) {
        self.emit(InstrKind::Return, &[value]);
    }

    pub fn throw(self, exception: InstrId) {
        self.emit(InstrKind::Throw, &[exception]);
    }

    pub fn binary_smi_op(self, op: Token, left: InstrId, right: InstrId) -> InstrId {
        self.emit(InstrKind::BinarySmiOp(ir::BinaryOp { op }), &[left, right])
    }

    pub fn relational_op(self, op: Token, operation_cid: ClassId, left: InstrId, right: InstrId) -> InstrId {
        self.emit(
            InstrKind::RelationalOp(ir::Comparison { op, operation_cid }),
            &[left, right],
        )
    }

    pub fn strict_compare(self, op: Token, left: InstrId, right: InstrId) -> InstrId {
        self.emit(
            InstrKind::StrictCompare(ir::StrictCompare {
                op,
                needs_number_check: false,
            }),
            &[left, right],
        )
    }

    pub fn instance_call(
        self,
        selector: &str,
        args_desc: ArgumentsDescriptor,
        checked_argument_count: u8,
        args: &[InstrId],
    ) -> InstrId {
        self.emit(
            InstrKind::InstanceCall(ir::InstanceCall {
                selector: CompactString::from(selector),
                args_desc,
                checked_argument_count,
            }),
            args,
        )
    }

    pub fn static_call(self, target: FunctionId, args_desc: ArgumentsDescriptor, args: &[InstrId]) -> InstrId {
        self.emit(
            InstrKind::StaticCall(ir::StaticCall { target, args_desc }),
            args,
        )
    }

    pub fn closure_call(self, args_desc: ArgumentsDescriptor, args: &[InstrId]) -> InstrId {
        self.emit(InstrKind::ClosureCall(ir::ClosureCall { args_desc }), args)
    }

    pub fn allocate_object(self, cls: ClassId) -> InstrId {
        self.emit(InstrKind::AllocateObject(ir::AllocateObject { cls }), &[])
    }

    pub fn load_field(self, slot: Slot, instance: InstrId) -> InstrId {
        self.emit(InstrKind::LoadField(ir::LoadField { slot }), &[instance])
    }

    pub fn store_field(self, slot: Slot, instance: InstrId, value: InstrId) -> InstrId {
        self.emit(
            InstrKind::StoreInstanceField(ir::StoreField {
                slot,
                emit_store_barrier: true,
                is_initialization: false,
            }),
            &[instance, value],
        )
    }

    pub fn check_stack_overflow(self, loop_depth: u32) -> InstrId {
        self.emit(
            InstrKind::CheckStackOverflow(ir::CheckStackOverflow { loop_depth }),
            &[],
        )
    }

    pub fn instance_of(self, ty: AbstractType, value: InstrId, type_args: [InstrId; 2]) -> InstrId {
        self.emit(
            InstrKind::InstanceOf(ir::TypeTest { ty }),
            &[value, type_args[0], type_args[1]],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_model::{FunctionInfo, cid};

    #[test]
    fn builds_a_diamond() {
        let mut classes = ClassTable::new();
        let f = classes.add_function(FunctionInfo::new("diamond", cid::OBJECT, 1));
        let mut b = GraphBuilder::new(Arc::new(classes), f);

        let join = b.create_join();
        let then_block = b.create_target();
        let else_block = b.create_target();

        let param = b.parameter(0);
        let null = b.null();
        let cond = b.instr().strict_compare(Token::StrictEq, param, null);
        b.instr().branch(cond, then_block, else_block);

        b.switch_to_block(then_block);
        b.instr().goto(join);
        b.switch_to_block(else_block);
        b.instr().goto(join);

        b.switch_to_block(join);
        let one = b.int(1);
        let phi = b.phi(join, &[one, param]);
        b.instr().return_(phi);

        let graph = b.finish();
        assert_eq!(graph.predecessors(join), &[then_block, else_block]);
        assert_eq!(graph.blocks[join].dominator.expand(), Some(b_entry(&graph)));
        assert_eq!(graph.reverse_postorder().len(), 5);
        assert!(graph.instr_dominates(param, phi));
    }

    fn b_entry(graph: &FlowGraph) -> BlockId {
        graph.normal_entry().unwrap()
    }
}
