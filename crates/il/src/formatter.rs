//! Converts flow graphs to S-expressions.
//!
//! Values and blocks are renamed in print order (`v0`, `v1`, ... and
//! `B0`, `B1`, ...), so the output does not depend on arena indices and
//! is stable across passes that allocate fresh instructions.

use crate::{
    cids::{CallTargets, Cids},
    compile_type::AbstractType,
    feedback::ArgumentsDescriptor,
    flow_graph::FlowGraph,
    ir::{BlockId, BlockKind, ConstValue, InstrId, InstrKind},
    object_model::{ClassId, ClassTable, FunctionId, Slot},
};
use ember_core::{
    CompilerConfig, HashMap,
    sexpr::{SExpr, float, int, list, string, symbol},
};
use std::fmt::{self, Display, Formatter as FmtFormatter};

/// Renders a whole graph in reverse postorder.
pub fn format_graph(graph: &FlowGraph) -> SExpr {
    Formatter::new(graph).format_graph()
}

/// Logs the graph when printing is enabled for its function.
pub fn print_flow_graph(graph: &FlowGraph, config: &CompilerConfig, phase: &str) {
    if config.should_print(graph.name()) {
        tracing::info!(
            target: "ember::flow_graph",
            "*** {phase} flow graph of {}:\n{}",
            graph.name(),
            format_graph(graph)
        );
    }
}

pub fn format_type(ty: &AbstractType, classes: &ClassTable) -> SExpr {
    let nullable_suffix = |nullable: bool| if nullable { "?" } else { "" };
    match ty {
        AbstractType::Dynamic => symbol("dynamic"),
        AbstractType::Void => symbol("void"),
        AbstractType::Never => symbol("Never"),
        AbstractType::Null => symbol("Null"),
        AbstractType::Class {
            cid,
            args,
            nullable,
        } => {
            let head = symbol(format!(
                "{}{}",
                classes.class_name(*cid),
                nullable_suffix(*nullable)
            ));
            if args.is_empty() {
                head
            } else {
                list(std::iter::once(head).chain(args.iter().map(|a| format_type(a, classes))))
            }
        }
        AbstractType::TypeParameter {
            index,
            function_level,
            nullable,
        } => symbol(format!(
            "{}{index}{}",
            if *function_level { "F" } else { "T" },
            nullable_suffix(*nullable)
        )),
    }
}

pub fn format_cids(cids: &Cids) -> SExpr {
    list(
        std::iter::once(symbol("cids")).chain(cids.ranges().iter().map(|range| {
            if range.is_single_cid() {
                int(range.start.into())
            } else {
                list([int(range.start.into()), int(range.end.into())])
            }
        })),
    )
}

pub fn format_slot(slot: &Slot) -> SExpr {
    let mut items = vec![
        symbol("slot"),
        symbol(slot.name.clone()),
        int(slot.offset_in_words.into()),
    ];
    if slot.is_immutable {
        items.push(symbol("immutable"));
    }
    list(items)
}

pub fn format_constant(value: &ConstValue, classes: &ClassTable) -> SExpr {
    match value {
        ConstValue::Null => symbol("null"),
        ConstValue::Bool(b) => symbol(if *b { "true" } else { "false" }),
        ConstValue::Int(v) => int(*v),
        ConstValue::Double(d) => list([symbol("double"), float(*d)]),
        ConstValue::String(s) => string(s.clone()),
        ConstValue::Type(t) => list([symbol("type"), format_type(t, classes)]),
        ConstValue::OptimizedOut => symbol("optimized_out"),
    }
}

fn format_args_desc(desc: &ArgumentsDescriptor) -> SExpr {
    let mut items = vec![symbol("args"), int(desc.count.into())];
    let mut named: Vec<_> = desc.named.iter().collect();
    named.sort_by_key(|n| n.position);
    items.extend(named.into_iter().map(|n| symbol(n.name.clone())));
    if desc.type_args_len > 0 {
        items.push(list([symbol("type_args"), int(desc.type_args_len.into())]));
    }
    list(items)
}

fn format_targets(targets: &CallTargets, classes: &ClassTable) -> SExpr {
    list(
        std::iter::once(symbol("targets")).chain(targets.targets().iter().map(|t| {
            let range = if t.range.is_single_cid() {
                int(t.range.start.into())
            } else {
                list([int(t.range.start.into()), int(t.range.end.into())])
            };
            list([
                range,
                function_name(t.target, classes),
                int(t.count as i64),
            ])
        })),
    )
}

fn function_name(f: FunctionId, classes: &ClassTable) -> SExpr {
    symbol(classes.function(f).name.clone())
}

fn class_name(cid: ClassId, classes: &ClassTable) -> SExpr {
    symbol(classes.class_name(cid))
}

struct Formatter<'a> {
    graph: &'a FlowGraph,
    value_names: HashMap<InstrId, SExpr>,
    block_names: HashMap<BlockId, SExpr>,
}

impl<'a> Formatter<'a> {
    fn new(graph: &'a FlowGraph) -> Self {
        let mut this = Self {
            graph,
            value_names: HashMap::default(),
            block_names: HashMap::default(),
        };
        let mut next_value = 0;
        for (i, &block) in graph.reverse_postorder().iter().enumerate() {
            this.block_names.insert(block, symbol(format!("B{i}")));
            let data = &graph.blocks[block];
            let defs = data
                .initial_definitions
                .iter()
                .chain(&data.phis)
                .copied()
                .chain(graph.block_instrs(block).filter(|&i| graph.instrs[i].is_definition()));
            for def in defs {
                this.value_names.insert(def, symbol(format!("v{next_value}")));
                next_value += 1;
            }
        }
        this
    }

    /// A formatter that names values by SSA temp, for printing single
    /// instructions without a full pass over the graph.
    fn unnumbered(graph: &'a FlowGraph) -> Self {
        Self {
            graph,
            value_names: HashMap::default(),
            block_names: HashMap::default(),
        }
    }

    fn value(&self, def: InstrId) -> SExpr {
        self.value_names.get(&def).cloned().unwrap_or_else(|| {
            match self.graph.instrs[def].ssa_temp {
                Some(temp) => symbol(format!("t{temp}")),
                None => symbol(format!("i{}", cranelift_entity::EntityRef::index(def))),
            }
        })
    }

    fn block(&self, block: BlockId) -> SExpr {
        self.block_names
            .get(&block)
            .cloned()
            .unwrap_or_else(|| symbol(format!("b{}", cranelift_entity::EntityRef::index(block))))
    }

    fn format_graph(&self) -> SExpr {
        let mut items = vec![symbol("graph"), symbol(self.graph.name())];
        for &block in self.graph.reverse_postorder() {
            items.push(self.format_block(block));
        }
        list(items)
    }

    fn format_block(&self, block: BlockId) -> SExpr {
        let data = &self.graph.blocks[block];
        let kind = match &data.kind {
            BlockKind::IndirectEntry { indirect_id } => {
                list([symbol("indirect_entry"), int((*indirect_id).into())])
            }
            BlockKind::CatchBlockEntry { catch_try_index } => {
                list([symbol("catch_entry"), int((*catch_try_index).into())])
            }
            other => symbol(other.name()),
        };
        let mut items = vec![symbol("block"), self.block(block), kind];
        if data.is_join() {
            items.push(list(
                std::iter::once(symbol("preds"))
                    .chain(data.predecessors.iter().map(|&p| self.block(p))),
            ));
        }
        if let Some(try_index) = data.try_index {
            items.push(list([symbol("try"), int(try_index.into())]));
        }
        for &def in data.initial_definitions.iter().chain(&data.phis) {
            items.push(self.format_instr(def));
        }
        for instr in self.graph.block_instrs(block) {
            items.push(self.format_instr(instr));
        }
        list(items)
    }

    fn format_instr(&self, instr: InstrId) -> SExpr {
        let graph = self.graph;
        let classes = &*graph.classes;
        let data = &graph.instrs[instr];
        let mut items = Vec::new();
        if data.is_definition() {
            items.push(self.value(instr));
        }
        items.push(symbol(data.kind.name()));

        match &data.kind {
            InstrKind::Goto(goto) => items.push(self.block(goto.target)),
            InstrKind::Branch(branch) => {
                items.push(self.block(branch.true_target));
                items.push(self.block(branch.false_target));
            }
            InstrKind::Constant(value) => items.push(format_constant(value, classes)),
            InstrKind::Parameter(param) => items.push(int(param.index.into())),
            InstrKind::Redefinition(redef) => {
                if let Some(ty) = &redef.constrained_type {
                    let cid = ty.to_nullable_cid(classes);
                    items.push(list([symbol("cid"), int(cid.into())]));
                }
            }
            InstrKind::BinarySmiOp(op)
            | InstrKind::BinaryInt64Op(op)
            | InstrKind::BinaryDoubleOp(op)
            | InstrKind::CheckedSmiOp(op)
            | InstrKind::CheckedSmiComparison(op) => items.push(symbol(op.op.name())),
            InstrKind::UnarySmiOp(op) => items.push(symbol(op.op.name())),
            InstrKind::RelationalOp(cmp) | InstrKind::EqualityCompare(cmp) => {
                items.push(symbol(cmp.op.name()));
                items.push(class_name(cmp.operation_cid, classes));
            }
            InstrKind::StrictCompare(cmp) => {
                items.push(symbol(cmp.op.name()));
                if cmp.needs_number_check {
                    items.push(symbol("number_check"));
                }
            }
            InstrKind::TestCids(test) => items.push(format_cids(&test.cids)),
            InstrKind::Box(boxed) => items.push(symbol(boxed.from.name())),
            InstrKind::Unbox(unbox) => {
                items.push(symbol(unbox.to.name()));
                if unbox.speculative {
                    items.push(symbol("speculative"));
                }
            }
            InstrKind::InstanceCall(call) => {
                items.push(symbol(call.selector.clone()));
                items.push(int(call.checked_argument_count.into()));
                items.push(format_args_desc(&call.args_desc));
            }
            InstrKind::PolymorphicInstanceCall(call) => {
                items.push(symbol(call.selector.clone()));
                items.push(format_args_desc(&call.args_desc));
                items.push(format_targets(&call.targets, classes));
                if call.complete {
                    items.push(symbol("complete"));
                }
            }
            InstrKind::StaticCall(call) => {
                items.push(function_name(call.target, classes));
                items.push(format_args_desc(&call.args_desc));
            }
            InstrKind::ClosureCall(call) => items.push(format_args_desc(&call.args_desc)),
            InstrKind::MoveArgument(mv) => items.push(int(mv.sp_relative_index.into())),
            InstrKind::AllocateObject(alloc) => items.push(class_name(alloc.cls, classes)),
            InstrKind::LoadField(load) => items.push(format_slot(&load.slot)),
            InstrKind::StoreInstanceField(store) => {
                items.push(format_slot(&store.slot));
                if !store.emit_store_barrier {
                    items.push(symbol("no_barrier"));
                }
                if store.is_initialization {
                    items.push(symbol("init"));
                }
            }
            InstrKind::LoadIndexed(load) => items.push(class_name(load.class_id, classes)),
            InstrKind::StoreIndexed(store) => {
                items.push(class_name(store.class_id, classes));
                if !store.emit_store_barrier {
                    items.push(symbol("no_barrier"));
                }
            }
            InstrKind::CheckClass(check) => {
                items.push(format_cids(&check.cids));
                if check.licm_hoisted {
                    items.push(symbol("hoisted"));
                }
            }
            InstrKind::CheckSmi(check) => {
                if check.licm_hoisted {
                    items.push(symbol("hoisted"));
                }
            }
            InstrKind::CheckClassId(check) => {
                items.push(format_cids(&Cids::from_ranges([check.range])));
            }
            InstrKind::CheckStackOverflow(check) => items.push(int(check.loop_depth.into())),
            InstrKind::InstanceOf(test) => {
                items.push(list([symbol("type"), format_type(&test.ty, classes)]));
            }
            InstrKind::AssertAssignable(assert) => {
                items.push(list([symbol("type"), format_type(&assert.ty, classes)]));
                items.push(symbol(assert.dst_name.clone()));
            }
            InstrKind::MaterializeObject(mat) => {
                items.push(class_name(mat.cls, classes));
                items.push(list(
                    std::iter::once(symbol("slots")).chain(mat.slots.iter().map(format_slot)),
                ));
            }
            InstrKind::Return
            | InstrKind::Throw
            | InstrKind::ReThrow
            | InstrKind::Phi
            | InstrKind::BooleanNegate
            | InstrKind::LoadClassId
            | InstrKind::CheckNull
            | InstrKind::CheckArrayBound
            | InstrKind::AssertBoolean => {}
        }

        items.extend(graph.inputs(instr).map(|def| self.value(def)));

        if let Some(moves) = &data.move_arguments {
            items.push(list(
                std::iter::once(symbol("moved")).chain(moves.iter().map(|&m| self.value(m))),
            ));
        }
        if let Some(deopt_id) = data.deopt_id {
            items.push(list([symbol("deopt"), int(deopt_id.0.into())]));
        }
        if let Some(env) = &data.env {
            let mut env_items = vec![symbol("env")];
            if env.lazy_deopt_to_before {
                env_items.push(symbol("lazy_before"));
            }
            for frame in &env.frames {
                let mut frame_items = vec![
                    symbol("frame"),
                    function_name(frame.function, classes),
                    int(frame.fixed_parameter_count.into()),
                    int(frame.deopt_id.0.into()),
                ];
                frame_items.extend(
                    frame
                        .values
                        .iter()
                        .map(|&u| self.value(graph.uses[u].definition)),
                );
                env_items.push(list(frame_items));
            }
            items.push(list(env_items));
        }

        list(items)
    }
}

/// Single-line rendering of one instruction.
pub struct InstrDisplay<'a> {
    graph: &'a FlowGraph,
    instr: InstrId,
}

impl FlowGraph {
    pub fn display_instr(&self, instr: InstrId) -> InstrDisplay<'_> {
        InstrDisplay { graph: self, instr }
    }
}

impl Display for InstrDisplay<'_> {
    fn fmt(&self, f: &mut FmtFormatter<'_>) -> fmt::Result {
        let expr = Formatter::unnumbered(self.graph).format_instr(self.instr);
        write_flat(&expr, f)
    }
}

fn write_flat(expr: &SExpr, f: &mut FmtFormatter<'_>) -> fmt::Result {
    match expr {
        SExpr::List(items) => {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write_flat(item, f)?;
            }
            write!(f, ")")
        }
        atom => write!(f, "{}", atom.to_string().trim_end()),
    }
}
