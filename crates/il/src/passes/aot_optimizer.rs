//! Specializes dynamic operations using static types, the closed-world
//! class hierarchy and inline-cache feedback.
//!
//! Specializations justified by feedback alone are speculative: they
//! insert guards that deoptimize to the unoptimized call when the
//! feedback turns out wrong. Guards carry the environment and deopt id
//! of the call they replace, so deoptimization re-executes the call.

use crate::{
    Bailout, FlowGraph, InstrId, InstrKind,
    cids::{CallTargets, CidRange, Cids, TargetInfo},
    feedback::{ICData, TypeFeedback},
    ir::{self, ConstValue, Representation, Token},
    object_model::{FunctionId, FunctionKind, cid},
    passes::type_propagator::is_boolean_value,
};
use compact_str::CompactString;
use ember_core::CompilerConfig;
use smallvec::SmallVec;

pub struct AotOptimizer<'a> {
    graph: &'a mut FlowGraph,
    feedback: &'a TypeFeedback,
    config: &'a CompilerConfig,
}

impl<'a> AotOptimizer<'a> {
    pub fn new(graph: &'a mut FlowGraph, feedback: &'a TypeFeedback, config: &'a CompilerConfig) -> Self {
        Self {
            graph,
            feedback,
            config,
        }
    }

    pub fn optimize(
        graph: &'a mut FlowGraph,
        feedback: &'a TypeFeedback,
        config: &'a CompilerConfig,
    ) -> Result<(), Bailout> {
        let _span = tracing::debug_span!("aot_optimizer", function = graph.name()).entered();
        let mut this = Self::new(graph, feedback, config);
        this.apply_ic_data()?;
        this.fold_type_tests();
        this.verify_force_optimized()
    }

    fn function_name(&self) -> CompactString {
        self.graph.name().into()
    }

    fn is_force_optimized(&self) -> bool {
        self.graph.function_info().is_force_optimized
    }

    /// Specializes every instance call in the graph.
    pub fn apply_ic_data(&mut self) -> Result<(), Bailout> {
        for block in self.graph.reverse_postorder().to_vec() {
            for instr in self.graph.block_instrs_snapshot(block) {
                let InstrKind::InstanceCall(call) = &self.graph.instrs[instr].kind else {
                    continue;
                };
                let call = call.clone();
                let ic = self
                    .graph
                    .instrs[instr]
                    .deopt_id
                    .and_then(|id| self.feedback.get(id));
                if self.try_specialize(instr, &call, ic) {
                    continue;
                }
                if self.is_force_optimized() {
                    return Err(Bailout::UnresolvedCall {
                        function: self.function_name(),
                        selector: call.selector,
                    });
                }
                tracing::trace!("instance call {} stays dynamic", call.selector);
            }
        }
        Ok(())
    }

    /// Speculation is allowed unless disabled, the function can never
    /// deoptimize, or the site deoptimized too often before.
    fn can_speculate(&self, call: InstrId) -> bool {
        if !self.config.use_speculative_inlining || self.is_force_optimized() {
            return false;
        }
        match self.graph.instrs[call].deopt_id {
            Some(id) => !self.feedback.is_blacklisted(id),
            None => false,
        }
    }

    fn try_specialize(&mut self, call: InstrId, data: &ir::InstanceCall, ic: Option<&ICData>) -> bool {
        let plain = data.args_desc.named.is_empty() && data.args_desc.type_args_len == 0;
        if plain {
            if let Some(op) = Token::from_selector(&data.selector) {
                if self.try_specialize_operator(call, op, ic) {
                    return true;
                }
            }
        }
        self.try_resolve_call(call, data, ic)
    }

    fn arg_cid(&self, call: InstrId, index: usize) -> u32 {
        self.graph.value_cid(self.graph.input_use(call, index))
    }

    fn try_specialize_operator(&mut self, call: InstrId, op: Token, ic: Option<&ICData>) -> bool {
        let graph = &*self.graph;
        let speculate = self.can_speculate(call);
        match graph.instrs[call].input_count() {
            1 => {
                let static_smi = self.arg_cid(call, 0) == cid::SMI;
                let ic_smi = ic.is_some_and(|ic| ic.has_only_cid(cid::SMI));
                if matches!(op, Token::Negate | Token::BitNot) && (static_smi || speculate && ic_smi) {
                    let value = graph.input_at(call, 0);
                    if !static_smi {
                        self.add_check_smi(value, call);
                    }
                    self.replace_call(call, InstrKind::UnarySmiOp(ir::UnaryOp { op }), &[value]);
                    return true;
                }
                false
            }
            2 => {
                let left = graph.input_at(call, 0);
                let right = graph.input_at(call, 1);
                if matches!(op, Token::Eq | Token::Ne) && self.try_null_comparison(call, op, left, right) {
                    return true;
                }

                let arg_cids = [self.arg_cid(call, 0), self.arg_cid(call, 1)];
                let tested_two = ic.is_some_and(|ic| ic.num_args_tested == 2);
                let ic_only = |cids: &[u32]| tested_two && ic.is_some_and(|ic| ic.has_only_cids(cids));

                if arg_cids == [cid::SMI, cid::SMI] || speculate && ic_only(&[cid::SMI]) {
                    if let Some(kind) = smi_operation(op) {
                        for (i, value) in [left, right].into_iter().enumerate() {
                            if arg_cids[i] != cid::SMI {
                                self.add_check_smi(value, call);
                            }
                        }
                        self.replace_call(call, kind, &[left, right]);
                        return true;
                    }
                }

                let static_double = arg_cids == [cid::DOUBLE, cid::DOUBLE];
                if self.config.unbox_doubles && (static_double || speculate && ic_only(&[cid::DOUBLE])) {
                    if self.specialize_double(call, op, [left, right], arg_cids) {
                        return true;
                    }
                }

                let saw_mint = ic.is_some_and(|ic| ic.checks.iter().any(|c| c.cids.contains(&cid::MINT)));
                if self.config.unbox_mints && speculate && saw_mint && ic_only(&[cid::SMI, cid::MINT]) {
                    if self.specialize_mint(call, op, [left, right]) {
                        return true;
                    }
                }

                // Without speculation, smi fast paths fall back to the
                // call when an operand is not a smi.
                let types = [self.graph.input_type(call, 0), self.graph.input_type(call, 1)];
                let may_be_smi = types.iter().all(|t| t.can_be_smi(&self.graph.classes));
                if !speculate && may_be_smi && !self.is_force_optimized() {
                    let kind = if op.is_binary_arithmetic() && op != Token::Div {
                        InstrKind::CheckedSmiOp(ir::BinaryOp { op })
                    } else if op.is_relational() || matches!(op, Token::Eq | Token::Ne) {
                        InstrKind::CheckedSmiComparison(ir::BinaryOp { op })
                    } else {
                        return false;
                    };
                    self.replace_call(call, kind, &[left, right]);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// `x == null` is an identity test.
    fn try_null_comparison(&mut self, call: InstrId, op: Token, left: InstrId, right: InstrId) -> bool {
        let is_null = |def| self.graph.constant_value(def).is_some_and(ConstValue::is_null);
        if !is_null(left) && !is_null(right) {
            return false;
        }
        let op = if op == Token::Eq {
            Token::StrictEq
        } else {
            Token::StrictNe
        };
        self.replace_call(
            call,
            InstrKind::StrictCompare(ir::StrictCompare {
                op,
                needs_number_check: false,
            }),
            &[left, right],
        );
        true
    }

    fn specialize_double(&mut self, call: InstrId, op: Token, args: [InstrId; 2], arg_cids: [u32; 2]) -> bool {
        enum Shape {
            Arithmetic,
            Relational,
            Equality,
        }
        let shape = match op {
            Token::Add | Token::Sub | Token::Mul | Token::Div => Shape::Arithmetic,
            op if op.is_relational() => Shape::Relational,
            Token::Eq | Token::Ne => Shape::Equality,
            _ => return false,
        };

        let mut unboxed: SmallVec<[InstrId; 2]> = SmallVec::new();
        for (i, value) in args.into_iter().enumerate() {
            if arg_cids[i] != cid::DOUBLE {
                self.add_check_class(value, Cids::create_monomorphic(cid::DOUBLE), call);
            }
            let unbox = InstrKind::Unbox(ir::Unbox {
                to: Representation::UnboxedDouble,
                speculative: false,
            });
            unboxed.push(self.insert_before_call(call, unbox, &[value]));
        }

        let cmp = ir::Comparison {
            op,
            operation_cid: cid::DOUBLE,
        };
        match shape {
            Shape::Arithmetic => {
                let result = self.insert_before_call(
                    call,
                    InstrKind::BinaryDoubleOp(ir::BinaryOp { op }),
                    &unboxed,
                );
                let boxed = InstrKind::Box(ir::BoxValue {
                    from: Representation::UnboxedDouble,
                });
                self.replace_call(call, boxed, &[result]);
            }
            Shape::Relational => {
                self.replace_call(call, InstrKind::RelationalOp(cmp), &unboxed);
            }
            Shape::Equality => {
                self.replace_call(call, InstrKind::EqualityCompare(cmp), &unboxed);
            }
        }
        true
    }

    fn specialize_mint(&mut self, call: InstrId, op: Token, args: [InstrId; 2]) -> bool {
        let arithmetic = matches!(
            op,
            Token::Add | Token::Sub | Token::Mul | Token::BitAnd | Token::BitOr | Token::BitXor
        );
        if !arithmetic && !op.is_relational() && !matches!(op, Token::Eq | Token::Ne) {
            return false;
        }

        let unboxed: SmallVec<[InstrId; 2]> = args
            .into_iter()
            .map(|value| {
                let unbox = InstrKind::Unbox(ir::Unbox {
                    to: Representation::UnboxedInt64,
                    speculative: true,
                });
                self.insert_before_call(call, unbox, &[value])
            })
            .collect();

        if arithmetic {
            let result = self.insert_before_call(
                call,
                InstrKind::BinaryInt64Op(ir::BinaryOp { op }),
                &unboxed,
            );
            let boxed = InstrKind::Box(ir::BoxValue {
                from: Representation::UnboxedInt64,
            });
            self.replace_call(call, boxed, &[result]);
        } else {
            let cmp = ir::Comparison {
                op,
                operation_cid: cid::MINT,
            };
            let kind = if op.is_relational() {
                InstrKind::RelationalOp(cmp)
            } else {
                InstrKind::EqualityCompare(cmp)
            };
            self.replace_call(call, kind, &unboxed);
        }
        true
    }

    /// Receiver classes known from the static type, without feedback.
    fn static_receiver_cids(&self, call: InstrId) -> Option<Cids> {
        let graph = &*self.graph;
        let ty = graph.input_type(call, 0);
        if ty.is_none() || ty.can_be_null() {
            return None;
        }
        let exact = ty.to_cid(&graph.classes);
        if exact != cid::DYNAMIC && exact != cid::ILLEGAL {
            return Some(Cids::create_monomorphic(exact));
        }
        match ty.to_abstract_type().type_class_id() {
            Some(c) if c != cid::OBJECT => {
                let cids = graph.classes.subtype_ranges(c);
                (!cids.is_empty()).then_some(cids)
            }
            _ => None,
        }
    }

    /// Targets for every class in `cids`, if all of them resolve.
    fn complete_targets(&self, cids: &Cids, selector: &str) -> Option<CallTargets> {
        let classes = &self.graph.classes;
        let mut targets: SmallVec<[TargetInfo; 2]> = SmallVec::new();
        for range in cids.ranges() {
            for c in range.start..=range.end {
                if classes.class(c).is_abstract {
                    continue;
                }
                targets.push(TargetInfo {
                    range: CidRange::single(c),
                    target: classes.resolve_dynamic(c, selector)?,
                    count: 0,
                });
            }
        }
        Some(CallTargets::new(targets))
    }

    fn try_resolve_call(&mut self, call: InstrId, data: &ir::InstanceCall, ic: Option<&ICData>) -> bool {
        let receiver = self.graph.input_at(call, 0);

        if let Some(cids) = self.static_receiver_cids(call) {
            if let Some(target) = self.graph.classes.unique_target(&cids, &data.selector) {
                if self.try_inline_accessor(call, target, None) {
                    return true;
                }
                tracing::debug!("{} has the unique target {}", data.selector, self.graph.classes.function(target).name);
                self.replace_call(
                    call,
                    InstrKind::StaticCall(ir::StaticCall {
                        target,
                        args_desc: data.args_desc.clone(),
                    }),
                    &self.call_inputs(call),
                );
                return true;
            }
            if let Some(targets) = self.complete_targets(&cids, &data.selector) {
                if !targets.is_empty() && targets.len() <= self.config.max_polymorphic_checks {
                    self.replace_with_polymorphic(call, data, targets, true);
                    return true;
                }
            }
        }

        if self.is_force_optimized() {
            return false;
        }
        let Some(ic) = ic.filter(|ic| !ic.is_empty()) else {
            return false;
        };
        let targets = CallTargets::create_and_expand(ic, &self.graph.classes);
        if self.can_speculate(call) && targets.has_single_target() {
            let Some(target) = targets.first_target() else {
                return false;
            };
            let cids = targets.as_cids();
            if self.try_inline_accessor(call, target, Some(&cids)) {
                return true;
            }
            self.add_check_class(receiver, cids, call);
            self.replace_call(
                call,
                InstrKind::StaticCall(ir::StaticCall {
                    target,
                    args_desc: data.args_desc.clone(),
                }),
                &self.call_inputs(call),
            );
            return true;
        }
        if targets.len() <= self.config.max_polymorphic_checks {
            self.replace_with_polymorphic(call, data, targets, false);
            return true;
        }
        false
    }

    fn replace_with_polymorphic(&mut self, call: InstrId, data: &ir::InstanceCall, targets: CallTargets, complete: bool) {
        tracing::debug!(complete, "{} dispatches over {} targets", data.selector, targets.len());
        let kind = InstrKind::PolymorphicInstanceCall(ir::PolymorphicInstanceCall {
            selector: data.selector.clone(),
            args_desc: data.args_desc.clone(),
            targets,
            complete,
        });
        let inputs = self.call_inputs(call);
        self.replace_call(call, kind, &inputs);
    }

    /// Replaces a call of an implicit getter or setter by the field
    /// access, guarding the receiver with `guard` when given.
    fn try_inline_accessor(&mut self, call: InstrId, target: FunctionId, guard: Option<&Cids>) -> bool {
        let info = self.graph.classes.function(target);
        let argc = self.graph.instrs[call].input_count();
        let receiver = self.graph.input_at(call, 0);
        match info.kind.clone() {
            FunctionKind::ImplicitGetter(slot) if argc == 1 => {
                if let Some(cids) = guard {
                    self.add_check_class(receiver, cids.clone(), call);
                }
                tracing::debug!("inlined getter of {}", slot.name);
                self.replace_call(call, InstrKind::LoadField(ir::LoadField { slot }), &[receiver]);
                true
            }
            FunctionKind::ImplicitSetter(slot) if argc == 2 => {
                if let Some(cids) = guard {
                    self.add_check_class(receiver, cids.clone(), call);
                }
                let value = self.graph.input_at(call, 1);
                let value_cid = self.graph.type_of(value).to_cid(&self.graph.classes);
                let emit_store_barrier = !matches!(value_cid, cid::SMI | cid::NULL | cid::BOOL);
                let store = InstrKind::StoreInstanceField(ir::StoreField {
                    slot,
                    emit_store_barrier,
                    is_initialization: false,
                });
                self.insert_before_call(call, store, &[receiver, value]);
                let null = self.graph.constant_null();
                self.graph.replace_all_uses_with(call, null);
                self.graph.remove_from_graph(call);
                tracing::debug!("inlined setter");
                true
            }
            _ => false,
        }
    }

    fn call_inputs(&self, call: InstrId) -> SmallVec<[InstrId; 4]> {
        self.graph.inputs(call).collect()
    }

    /// Creates an instruction in front of `call`, giving it the call's
    /// deopt id and environment if it can deoptimize.
    fn insert_before_call(&mut self, call: InstrId, kind: InstrKind, inputs: &[InstrId]) -> InstrId {
        let instr = self.new_from_call(call, kind, inputs);
        self.graph.insert_before(call, instr);
        instr
    }

    fn new_from_call(&mut self, call: InstrId, kind: InstrKind, inputs: &[InstrId]) -> InstrId {
        let can_deoptimize = kind.can_deoptimize();
        let graph = &mut *self.graph;
        let instr = graph.new_instr(kind, inputs);
        graph.instrs[instr].token_pos = graph.instrs[call].token_pos;
        if can_deoptimize {
            graph.instrs[instr].deopt_id = graph.instrs[call].deopt_id;
            graph.copy_environment(call, instr);
        }
        instr
    }

    fn replace_call(&mut self, call: InstrId, kind: InstrKind, inputs: &[InstrId]) -> InstrId {
        tracing::debug!("replacing {} by {}", self.graph.display_instr(call), kind.name());
        let instr = self.new_from_call(call, kind, inputs);
        self.graph.replace_instruction(call, instr);
        instr
    }

    /// Guards `value` to be a smi. Returns the guard.
    pub fn add_check_smi(&mut self, value: InstrId, call: InstrId) -> InstrId {
        self.insert_before_call(
            call,
            InstrKind::CheckSmi(ir::CheckSmi {
                licm_hoisted: false,
            }),
            &[value],
        )
    }

    /// Guards `value` to have one of `cids`. A smi-only guard becomes a
    /// smi check.
    pub fn add_check_class(&mut self, value: InstrId, cids: Cids, call: InstrId) -> InstrId {
        if cids.monomorphic_receiver_cid() == Some(cid::SMI) {
            return self.add_check_smi(value, call);
        }
        self.insert_before_call(
            call,
            InstrKind::CheckClass(ir::CheckClass {
                cids,
                licm_hoisted: false,
            }),
            &[value],
        )
    }

    /// Guards argument `arg` of `call` with the classes feedback recorded
    /// for it, unless its static type already implies them.
    pub fn add_checks_for_arg(&mut self, call: InstrId, arg: usize, ic: &ICData) -> Option<InstrId> {
        let cids = Cids::from_ic_data(ic, arg);
        if cids.is_empty() {
            return None;
        }
        let static_cid = self.arg_cid(call, arg);
        if cids.monomorphic_receiver_cid() == Some(static_cid) {
            return None;
        }
        let value = self.graph.input_at(call, arg);
        Some(self.add_check_class(value, cids, call))
    }

    fn fold_type_tests(&mut self) {
        for block in self.graph.reverse_postorder().to_vec() {
            for instr in self.graph.block_instrs_snapshot(block) {
                match &self.graph.instrs[instr].kind {
                    InstrKind::InstanceOf(_) => self.replace_with_instance_of(instr),
                    InstrKind::AssertAssignable(_) => self.replace_with_type_cast(instr),
                    InstrKind::AssertBoolean => {
                        let value = self.graph.input_at(instr, 0);
                        if is_boolean_value(self.graph, value) {
                            self.graph.replace_all_uses_with(instr, value);
                            self.graph.remove_from_graph(instr);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Decides `value is T` statically, or reduces it to a class-id test
    /// when `T` is a class whose subclasses are known.
    pub fn replace_with_instance_of(&mut self, instr: InstrId) {
        let InstrKind::InstanceOf(test) = &self.graph.instrs[instr].kind else {
            return;
        };
        let ty = test.ty.clone();
        let graph = &mut *self.graph;
        let value_type = graph.input_type(instr, 0);
        if let Some(result) = value_type.is_instance_of(&ty, &graph.classes) {
            tracing::debug!("instance_of {ty} is always {result}");
            let constant = graph.constant(ConstValue::Bool(result));
            graph.replace_all_uses_with(instr, constant);
            graph.remove_from_graph(instr);
            return;
        }

        let Some(type_cid) = ty.type_class_id().filter(|_| ty.is_instantiated() && ty.is_raw_class()) else {
            return;
        };
        let mut ranges = SmallVec::<[CidRange; 4]>::from_slice(graph.classes.subtype_ranges(type_cid).ranges());
        if ty.is_nullable() {
            ranges.push(CidRange::single(cid::NULL));
        }
        let cids = Cids::from_ranges(ranges);
        if cids.is_empty() {
            return;
        }
        let value = graph.input_at(instr, 0);
        let test_cids = graph.new_instr(InstrKind::TestCids(ir::TestCids { cids }), &[value]);
        graph.instrs[test_cids].token_pos = graph.instrs[instr].token_pos;
        graph.replace_instruction(instr, test_cids);
    }

    /// Drops a type assertion the value's static type already satisfies.
    pub fn replace_with_type_cast(&mut self, instr: InstrId) {
        let InstrKind::AssertAssignable(assert) = &self.graph.instrs[instr].kind else {
            return;
        };
        let ty = assert.ty.clone();
        let graph = &mut *self.graph;
        let value_type = graph.input_type(instr, 0);
        if value_type.is_assignable_to(&ty, &graph.classes) {
            let value = graph.input_at(instr, 0);
            graph.replace_all_uses_with(instr, value);
            graph.remove_from_graph(instr);
        }
    }

    /// A force-optimized function has no unoptimized code to return to.
    fn verify_force_optimized(&self) -> Result<(), Bailout> {
        if !self.is_force_optimized() {
            return Ok(());
        }
        for &block in self.graph.reverse_postorder() {
            for instr in self.graph.block_instrs(block) {
                let kind = &self.graph.instrs[instr].kind;
                let eager = kind.is_check() || matches!(kind, InstrKind::Unbox(u) if u.speculative);
                if eager {
                    return Err(Bailout::CannotDeoptimize {
                        function: self.function_name(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The smi instruction computing `op`, if there is one.
fn smi_operation(op: Token) -> Option<InstrKind> {
    Some(match op {
        Token::Add
        | Token::Sub
        | Token::Mul
        | Token::TruncDiv
        | Token::Mod
        | Token::BitAnd
        | Token::BitOr
        | Token::BitXor
        | Token::Shl
        | Token::Shr => InstrKind::BinarySmiOp(ir::BinaryOp { op }),
        op if op.is_relational() => InstrKind::RelationalOp(ir::Comparison {
            op,
            operation_cid: cid::SMI,
        }),
        Token::Eq | Token::Ne => InstrKind::EqualityCompare(ir::Comparison {
            op,
            operation_cid: cid::SMI,
        }),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parser::{ParsedFunction, parse_program},
        passes::type_propagator::propagate_types,
        validation::check_flow_graph,
    };
    use indoc::indoc;

    fn optimize(src: &str, config: &CompilerConfig) -> Result<FlowGraph, Bailout> {
        let ParsedFunction { mut graph, feedback } = parse_program(src).unwrap().into_first().unwrap();
        propagate_types(&mut graph);
        AotOptimizer::optimize(&mut graph, &feedback, config)?;
        check_flow_graph(&graph, config).unwrap();
        Ok(graph)
    }

    fn live(graph: &FlowGraph, name: &str) -> Vec<InstrId> {
        graph
            .instrs
            .keys()
            .filter(|&i| graph.is_attached(i) && graph.instrs[i].kind.name() == name)
            .collect()
    }

    const SMI_ADD: &str = indoc! {"
        (program
            (function add (fixed 2) static)
            (graph add
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 instance_call + 2 (args 2) v0 v1 (deopt 4))
                    (return v2)))
            (feedback add (ic 4 + 2 (check (_Smi _Smi) add 100))))
    "};

    #[test]
    fn smi_feedback_specializes_with_guards() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let graph = optimize(SMI_ADD, &config).unwrap();

        let checks = live(&graph, "check_smi");
        assert_eq!(checks.len(), 2);
        let op = live(&graph, "binary_smi_op")[0];
        for check in checks {
            assert_eq!(graph.instrs[check].deopt_id, graph.instrs[op].deopt_id);
            assert_eq!(graph.environment_spec(check).unwrap()[0].values, graph.environment_spec(op).unwrap()[0].values);
        }
        assert!(live(&graph, "instance_call").is_empty());
    }

    #[test]
    fn blacklisted_sites_use_checked_smi_ops() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let src = SMI_ADD.replace("(feedback add ", "(feedback add (blacklist 4) ");
        let graph = optimize(&src, &config).unwrap();
        assert!(live(&graph, "check_smi").is_empty());
        assert_eq!(live(&graph, "checked_smi_op").len(), 1);
    }

    #[test]
    fn monomorphic_call_gets_a_class_guard_and_a_direct_call() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let graph = optimize(
            indoc! {"
                (program
                    (class A Object)
                    (function A.foo (owner A) (fixed 2) (method foo))
                    (function main (fixed 2) static)
                    (graph main
                        (block B0 graph_entry)
                        (block B1 function_entry
                            (v0 parameter 0)
                            (v1 parameter 1)
                            (v2 instance_call foo 1 (args 2) v0 v1 (deopt 2))
                            (return v2)))
                    (feedback main (ic 2 foo 1 (check (A) A.foo 7))))
            "},
            &config,
        )
        .unwrap();

        let [check] = live(&graph, "check_class")[..] else {
            panic!("expected one class check");
        };
        let [call] = live(&graph, "static_call")[..] else {
            panic!("expected one static call");
        };
        let a = graph.classes.class_by_name("A").unwrap();
        let InstrKind::CheckClass(data) = &graph.instrs[check].kind else {
            unreachable!()
        };
        assert_eq!(data.cids.monomorphic_receiver_cid(), Some(a));
        assert_eq!(graph.instrs[call].deopt_id, Some(ir::DeoptId(2)));
        assert_eq!(graph.instrs[check].deopt_id, Some(ir::DeoptId(2)));
        let env = graph.environment_spec(call).unwrap();
        assert_eq!(env[0].values[2..], [graph.argument_at(call, 0), graph.argument_at(call, 1)]);
    }

    #[test]
    fn class_hierarchy_resolves_calls_without_guards() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let graph = optimize(
            indoc! {"
                (program
                    (class A Object (fields x) accessors)
                    (function A.foo (owner A) (fixed 1) (method foo))
                    (graph main
                        (block B0 graph_entry)
                        (block B1 function_entry
                            (v0 allocate_object A)
                            (v1 instance_call foo 1 (args 1) v0)
                            (v2 instance_call get:x 1 (args 1) v0)
                            (return v2))))
            "},
            &config,
        )
        .unwrap();
        assert!(live(&graph, "check_class").is_empty());
        assert_eq!(live(&graph, "static_call").len(), 1);
        assert_eq!(live(&graph, "load_field").len(), 1);
    }

    #[test]
    fn unresolved_call_in_force_optimized_function_bails_out() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let err = optimize(
            indoc! {"
                (program
                    (function f (fixed 1) static force_optimized)
                    (graph f
                        (block B0 graph_entry)
                        (block B1 function_entry
                            (v0 parameter 0)
                            (v1 instance_call foo 1 (args 1) v0)
                            (return v1))))
            "},
            &config,
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            Bailout::UnresolvedCall {
                function: "f".into(),
                selector: "foo".into(),
            }
        );
    }

    #[test]
    fn statically_known_type_tests_fold() {
        tracing_subscriber::fmt::try_init().ok();
        let config = CompilerConfig::default();
        let graph = optimize(
            indoc! {"
                (program
                    (class A Object)
                    (class B A)
                    (class C Object)
                    (graph main
                        (block B0 graph_entry)
                        (block B1 function_entry
                            (v0 parameter 0)
                            (v1 allocate_object B)
                            (v2 instance_of (type A) v1 null null)
                            (v3 instance_of (type A) v0 null null)
                            (return v2))))
            "},
            &config,
        )
        .unwrap();
        assert!(live(&graph, "instance_of").is_empty());
        let [test] = live(&graph, "test_cids")[..] else {
            panic!("expected one cid test");
        };
        let InstrKind::TestCids(data) = &graph.instrs[test].kind else {
            unreachable!()
        };
        let a = graph.classes.class_by_name("A").unwrap();
        let b = graph.classes.class_by_name("B").unwrap();
        assert_eq!(data.cids.ranges(), &[CidRange::new(a, b)]);
    }

    #[test]
    fn satisfied_type_assertions_are_dropped() {
        tracing_subscriber::fmt::try_init().ok();
        let graph = optimize(
            indoc! {"
                (program
                    (class A Object)
                    (class B A)
                    (graph main
                        (block B0 graph_entry)
                        (block B1 function_entry
                            (v0 parameter 0)
                            (v1 allocate_object B)
                            (v2 assert_assignable (type A) known v1 null null)
                            (v3 assert_assignable (type A) unknown v0 null null)
                            (return v2))))
            "},
            &CompilerConfig::default(),
        )
        .unwrap();
        let [remaining] = live(&graph, "assert_assignable")[..] else {
            panic!("expected one assertion to remain");
        };
        let param = graph.input_at(remaining, 0);
        assert_eq!(graph.instrs[param].kind.name(), "parameter");
    }
}
