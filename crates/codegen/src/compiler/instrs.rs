//! Code for the non-call instructions: control flow, arithmetic,
//! comparisons, boxing, memory access and guards.

use super::{FlowGraphCompiler, SlowPath};
use crate::{
    CodegenError,
    assembler::{Address, AluOp, Condition, FpuOp, Label, MachInst, Operand, ShiftOp},
    compiled_code::PoolEntry,
    deopt::DeoptReason,
    isa::Register,
    layout::{self, tag_smi},
    locations::{AllocatedLocations, ContainsCall, LocationSummary, Policy},
    parallel_move::{MoveOperands, ParallelMoveResolver},
    stubs::{CallTarget, RuntimeEntry, StubId},
};
use bumpalo::collections::Vec as BumpVec;
use ember_il::{
    InstrId, InstrKind,
    cids::{CidRange, Cids},
    ir::{Branch, ConstValue, Representation, Token, Unbox},
    object_model::{ClassId, cid},
};
use smallvec::smallvec;
use tracing::trace;

impl FlowGraphCompiler<'_> {
    pub(super) fn emit_instruction(&mut self, instr: InstrId) -> Result<(), CodegenError> {
        let graph = self.graph;
        let kind = &graph.instrs[instr].kind;
        trace!(instr = ?instr, kind = kind.name(), "emit");
        match kind {
            // Values already in their homes, or pushed by the call that
            // consumes them.
            InstrKind::Constant(_)
            | InstrKind::Parameter(_)
            | InstrKind::Phi
            | InstrKind::Redefinition(_)
            | InstrKind::MoveArgument(_)
            | InstrKind::MaterializeObject(_) => {}

            InstrKind::Goto(goto) => self.emit_goto(goto.target),
            InstrKind::Branch(branch) => self.emit_branch(instr, branch)?,
            InstrKind::Return => self.emit_return(instr),
            InstrKind::Throw => self.emit_throw(instr, RuntimeEntry::Throw, 1),
            InstrKind::ReThrow => self.emit_throw(instr, RuntimeEntry::ReThrow, 2),

            InstrKind::BinarySmiOp(bin) => self.emit_binary_smi_op(instr, bin.op)?,
            InstrKind::BinaryInt64Op(bin) => self.emit_binary_int64_op(instr, bin.op)?,
            InstrKind::UnarySmiOp(un) => self.emit_unary_smi_op(instr, un.op)?,
            InstrKind::BinaryDoubleOp(bin) => self.emit_binary_double_op(instr, bin.op)?,
            InstrKind::CheckedSmiOp(bin) => self.emit_checked_smi_op(instr, bin.op)?,
            InstrKind::CheckedSmiComparison(bin) => {
                self.emit_checked_smi_comparison(instr, bin.op)?
            }
            InstrKind::RelationalOp(_)
            | InstrKind::EqualityCompare(_)
            | InstrKind::StrictCompare(_)
            | InstrKind::TestCids(_) => {
                if !self.is_fused(instr) {
                    self.emit_comparison_value(instr)?;
                }
            }
            InstrKind::BooleanNegate => self.emit_boolean_negate(instr),
            InstrKind::Box(boxed) => self.emit_box(instr, boxed.from)?,
            InstrKind::Unbox(unbox) => self.emit_unbox(instr, unbox)?,

            InstrKind::InstanceCall(call) => self.emit_instance_call(instr, call)?,
            InstrKind::PolymorphicInstanceCall(call) => self.emit_polymorphic_call(instr, call)?,
            InstrKind::StaticCall(call) => self.emit_static_call(instr, call)?,
            InstrKind::ClosureCall(call) => self.emit_closure_call(instr, call)?,

            InstrKind::AllocateObject(alloc) => self.emit_allocate_object(instr, alloc.cls),
            InstrKind::LoadField(load) => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No)
                        .input(Policy::RequiresRegister)
                        .output(Policy::RequiresRegister),
                );
                self.emitter.load_field(
                    &mut self.asm,
                    locs.out(),
                    locs.input(0),
                    load.slot.offset_in_words,
                );
                self.store_output(instr, locs.output);
            }
            InstrKind::StoreInstanceField(store) => {
                let locs = self.prepare(instr, &self.store_summary(2, store.emit_store_barrier));
                let (object, value) = (locs.input(0), locs.input(1));
                self.emitter.store_field(
                    &mut self.asm,
                    value,
                    object,
                    store.slot.offset_in_words,
                );
                if store.emit_store_barrier {
                    self.emit_write_barrier(value);
                }
            }
            InstrKind::LoadIndexed(load) => {
                self.check_array_class(load.class_id)?;
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No)
                        .inputs(Policy::RequiresRegister, 2)
                        .output(Policy::RequiresRegister),
                );
                let addr = self.element_address(locs.input(0), locs.input(1));
                self.asm.emit(MachInst::Load {
                    dst: locs.out(),
                    addr,
                });
                self.store_output(instr, locs.output);
            }
            InstrKind::StoreIndexed(store) => {
                self.check_array_class(store.class_id)?;
                let locs = self.prepare(instr, &self.store_summary(3, store.emit_store_barrier));
                let addr = self.element_address(locs.input(0), locs.input(1));
                let value = locs.input(2);
                self.asm.emit(MachInst::Store { src: value, addr });
                if store.emit_store_barrier {
                    self.emit_write_barrier(value);
                }
            }
            InstrKind::LoadClassId => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No)
                        .input(Policy::RequiresRegister)
                        .output(Policy::RequiresRegister),
                );
                self.emitter
                    .load_class_id_may_be_smi(&mut self.asm, locs.out(), locs.input(0));
                self.emitter.smi_tag(&mut self.asm, locs.out());
                self.store_output(instr, locs.output);
            }

            InstrKind::CheckClass(check) => {
                let reason = if check.licm_hoisted {
                    DeoptReason::HoistedCheckClass
                } else {
                    DeoptReason::CheckClass
                };
                self.emit_check_class(instr, &check.cids, reason)?;
            }
            InstrKind::CheckSmi(check) => {
                let reason = if check.licm_hoisted {
                    DeoptReason::HoistedCheckSmi
                } else {
                    DeoptReason::CheckSmi
                };
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No).input(Policy::RequiresRegister),
                );
                let deopt = self.add_deopt_stub(instr, reason)?;
                self.emitter
                    .branch_if_not_smi(&mut self.asm, locs.input(0), deopt);
            }
            InstrKind::CheckNull => self.emit_check_null(instr),
            InstrKind::CheckClassId(check) => self.emit_check_class_id(instr, check.range)?,
            InstrKind::CheckArrayBound => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No).inputs(Policy::RequiresRegister, 2),
                );
                let deopt = self.add_deopt_stub(instr, DeoptReason::CheckArrayBound)?;
                // Unsigned, so negative indices fail as well.
                self.asm.emit(MachInst::Compare {
                    lhs: locs.input(1),
                    rhs: Operand::Reg(locs.input(0)),
                });
                self.asm.emit(MachInst::BranchIf {
                    cond: Condition::AboveEqual,
                    target: deopt,
                });
            }
            InstrKind::CheckStackOverflow(_) => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::CallOnSlowPath)
                        .temp(Policy::RequiresRegister),
                );
                let entry = self.asm.new_label();
                let exit = self.asm.new_label();
                self.emitter
                    .check_stack_overflow(&mut self.asm, locs.temp(0), entry);
                self.asm.bind(exit);
                self.slow_paths
                    .push(SlowPath::StackOverflow { instr, entry, exit });
            }

            InstrKind::InstanceOf(test) => self.emit_instance_of(instr, &test.ty),
            InstrKind::AssertAssignable(assert) => self.emit_assert_assignable(instr, assert),
            InstrKind::AssertBoolean => self.emit_assert_boolean(instr),
        }
        Ok(())
    }

    // Control flow.

    fn emit_goto(&mut self, target: ember_il::BlockId) {
        let graph = self.graph;
        let target_data = &graph.blocks[target];
        if !target_data.phis.is_empty() {
            let pred_index = target_data
                .predecessors
                .iter()
                .position(|&pred| pred == self.current_block)
                .unwrap_or_else(|| {
                    panic!("{:?} is not a predecessor of {target:?}", self.current_block)
                });
            let mut moves = BumpVec::with_capacity_in(target_data.phis.len(), self.bump);
            for &phi in &target_data.phis {
                let value = graph.input_at(phi, pred_index);
                moves.push(MoveOperands::new(
                    self.frame.home(value),
                    self.frame.home(phi),
                    graph.instrs[phi].representation,
                ));
            }
            ParallelMoveResolver::new(&mut self.asm, self.emitter, graph, self.bump)
                .resolve(&moves);
        }
        if self.next_block != Some(target) {
            let label = self.block_label(target);
            self.asm.emit(MachInst::Jump(label));
        }
    }

    fn emit_branch(&mut self, instr: InstrId, branch: &Branch) -> Result<(), CodegenError> {
        let condition = self.graph.input_at(instr, 0);
        let cond = if self.is_fused(condition) {
            let summary = self.comparison_summary(condition, false)?;
            let locs = self.prepare(condition, &summary);
            self.emit_compare(condition, &locs)?
        } else {
            let locs = self.prepare(
                instr,
                &LocationSummary::new(ContainsCall::No).input(Policy::RequiresRegister),
            );
            self.emitter.compare_object(
                &mut self.asm,
                locs.input(0),
                PoolEntry::Object(ConstValue::Bool(true)),
            );
            Condition::Equal
        };
        let true_label = self.block_label(branch.true_target);
        self.asm.emit(MachInst::BranchIf {
            cond,
            target: true_label,
        });
        if self.next_block != Some(branch.false_target) {
            let false_label = self.block_label(branch.false_target);
            self.asm.emit(MachInst::Jump(false_label));
        }
        Ok(())
    }

    fn emit_return(&mut self, instr: InstrId) {
        self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No).input(Policy::Fixed(self.conv.result)),
        );
        self.emitter.leave_dart_frame(&mut self.asm);
        self.asm.emit(MachInst::Ret);
    }

    fn emit_throw(&mut self, instr: InstrId, entry: RuntimeEntry, inputs: usize) {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::Call).inputs(Policy::RequiresRegister, inputs),
        );
        for i in 0..inputs {
            self.asm.emit(MachInst::Push(locs.input(i)));
        }
        self.call_runtime(instr, entry);
    }

    // Arithmetic.

    fn emit_binary_smi_op(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        let count_reg = self.shift_count_policy();
        let summary = match op {
            Token::Add | Token::Sub | Token::Mul | Token::BitAnd | Token::BitOr | Token::BitXor => {
                LocationSummary::new(ContainsCall::No)
                    .inputs(Policy::RequiresRegister, 2)
                    .output(Policy::SameAsFirstInput)
            }
            Token::Shl => LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .input(count_reg)
                .temp(Policy::RequiresRegister)
                .temp(Policy::RequiresRegister)
                .output(Policy::SameAsFirstInput),
            Token::Shr => LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .input(count_reg)
                .output(Policy::SameAsFirstInput),
            Token::TruncDiv | Token::Mod => self.division_summary(),
            _ => return Err(self.unsupported(format!("smi operation {}", op.name()))),
        };
        let deopt = if self.graph.instrs[instr].kind.can_deoptimize() {
            Some(self.add_deopt_stub(instr, DeoptReason::BinarySmiOp)?)
        } else {
            None
        };
        let locs = self.prepare(instr, &summary);
        let (left, right, out) = (locs.input(0), locs.input(1), locs.out());
        debug_assert_eq!(left, out);
        let deopt = || deopt.unwrap_or_else(|| panic!("{} cannot deoptimize", op.name()));
        match op {
            Token::Add | Token::Sub => {
                self.alu(alu_op(op), out, right);
                self.branch(Condition::Overflow, deopt());
            }
            Token::Mul => {
                self.emitter.smi_untag(&mut self.asm, out);
                self.alu(AluOp::Mul, out, right);
                self.branch(Condition::Overflow, deopt());
            }
            Token::BitAnd | Token::BitOr | Token::BitXor => self.alu(alu_op(op), out, right),
            Token::Shl => {
                let (original, check) = (locs.temp(0), locs.temp(1));
                let max_count = i64::from(self.arch.word_bits() - 1);
                self.emitter.smi_untag(&mut self.asm, right);
                self.asm.emit(MachInst::Compare {
                    lhs: right,
                    rhs: Operand::Imm(max_count),
                });
                // Unsigned: negative counts deoptimize as well.
                self.branch(Condition::Above, deopt());
                self.mov(original, out);
                self.shift(ShiftOp::Shl, out, Operand::Reg(right));
                // Bits shifted out must all equal the sign.
                self.mov(check, out);
                self.shift(ShiftOp::Sar, check, Operand::Reg(right));
                self.asm.emit(MachInst::Compare {
                    lhs: check,
                    rhs: Operand::Reg(original),
                });
                self.branch(Condition::NotEqual, deopt());
            }
            Token::Shr => {
                self.emitter.smi_untag(&mut self.asm, right);
                self.saturate_shift_count(right);
                self.emitter.smi_untag(&mut self.asm, out);
                self.shift(ShiftOp::Sar, out, Operand::Reg(right));
                self.emitter.smi_tag(&mut self.asm, out);
            }
            Token::TruncDiv | Token::Mod => {
                self.asm.emit(MachInst::Compare {
                    lhs: right,
                    rhs: Operand::Imm(0),
                });
                self.branch(Condition::Equal, deopt());
                self.emitter.smi_untag(&mut self.asm, left);
                self.emitter.smi_untag(&mut self.asm, right);
                self.asm.emit(MachInst::Div {
                    dst: left,
                    src: right,
                    remainder: op == Token::Mod,
                });
                if op == Token::Mod {
                    self.adjust_remainder(left, right);
                    self.emitter.smi_tag(&mut self.asm, out);
                } else {
                    // MIN_SMI ~/ -1 is the only quotient that does not fit.
                    self.emitter.smi_tag(&mut self.asm, out);
                    self.branch(Condition::Overflow, deopt());
                }
            }
            _ => unreachable!(),
        }
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn emit_binary_int64_op(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        if !self.emitter.supports_unboxed_int64() {
            return Err(self.unsupported("unboxed int64 arithmetic"));
        }
        let summary = match op {
            Token::Add | Token::Sub | Token::Mul | Token::BitAnd | Token::BitOr | Token::BitXor => {
                LocationSummary::new(ContainsCall::No)
                    .inputs(Policy::RequiresRegister, 2)
                    .output(Policy::SameAsFirstInput)
            }
            Token::Shl | Token::Shr => LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .input(self.shift_count_policy())
                .output(Policy::SameAsFirstInput),
            _ => return Err(self.unsupported(format!("int64 operation {}", op.name()))),
        };
        let locs = self.prepare(instr, &summary);
        let (right, out) = (locs.input(1), locs.out());
        match op {
            Token::Shl => {
                // Counts past the word width shift everything out.
                let in_range = self.asm.new_label();
                let done = self.asm.new_label();
                self.asm.emit(MachInst::Compare {
                    lhs: right,
                    rhs: Operand::Imm(i64::from(self.arch.word_bits() - 1)),
                });
                self.branch(Condition::BelowEqual, in_range);
                self.emitter.load_immediate(&mut self.asm, out, 0);
                self.asm.emit(MachInst::Jump(done));
                self.asm.bind(in_range);
                self.shift(ShiftOp::Shl, out, Operand::Reg(right));
                self.asm.bind(done);
            }
            Token::Shr => {
                self.saturate_shift_count(right);
                self.shift(ShiftOp::Sar, out, Operand::Reg(right));
            }
            _ => self.alu(alu_op(op), out, right),
        }
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn emit_unary_smi_op(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .output(Policy::SameAsFirstInput),
        );
        let out = locs.out();
        match op {
            Token::Negate => {
                let deopt = self.add_deopt_stub(instr, DeoptReason::UnaryOp)?;
                self.asm.emit(MachInst::Neg(out));
                self.branch(Condition::Overflow, deopt);
            }
            Token::BitNot => {
                self.asm.emit(MachInst::Not(out));
                self.asm.emit(MachInst::Alu {
                    op: AluOp::And,
                    dst: out,
                    src: Operand::Imm(!layout::SMI_TAG_MASK),
                });
            }
            _ => return Err(self.unsupported(format!("unary smi operation {}", op.name()))),
        }
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn emit_binary_double_op(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        let fpu_op = match op {
            Token::Add => FpuOp::Add,
            Token::Sub => FpuOp::Sub,
            Token::Mul => FpuOp::Mul,
            Token::Div => FpuOp::Div,
            _ => return Err(self.unsupported(format!("double operation {}", op.name()))),
        };
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No)
                .inputs(Policy::RequiresFpuRegister, 2)
                .output(Policy::SameAsFirstInput),
        );
        self.asm.emit(MachInst::FpuAlu {
            op: fpu_op,
            dst: locs.fpu_out(),
            src: locs.fpu_input(1),
        });
        self.store_output(instr, locs.output);
        Ok(())
    }

    /// Smi fast path of an operator call. The operands stay intact so the
    /// slow path can pass them to the operator.
    fn emit_checked_smi_op(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::CallOnSlowPath)
                .inputs(Policy::RequiresRegister, 2)
                .temp(Policy::RequiresRegister)
                .output(Policy::RequiresRegister),
        );
        let (left, right, out) = (locs.input(0), locs.input(1), locs.out());
        let entry = self.asm.new_label();
        let exit = self.asm.new_label();
        self.branch_if_either_not_smi(left, right, locs.temp(0), entry);
        match op {
            Token::Add | Token::Sub => {
                self.mov(out, left);
                self.alu(alu_op(op), out, right);
                self.branch(Condition::Overflow, entry);
            }
            Token::Mul => {
                self.mov(out, left);
                self.emitter.smi_untag(&mut self.asm, out);
                self.alu(AluOp::Mul, out, right);
                self.branch(Condition::Overflow, entry);
            }
            Token::BitAnd | Token::BitOr | Token::BitXor => {
                self.mov(out, left);
                self.alu(alu_op(op), out, right);
            }
            _ => {
                self.asm.emit(MachInst::Jump(entry));
            }
        }
        self.asm.bind(exit);
        self.slow_paths.push(SlowPath::CheckedSmi {
            instr,
            entry,
            exit,
            op,
            left,
            right,
            out,
        });
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn emit_checked_smi_comparison(&mut self, instr: InstrId, op: Token) -> Result<(), CodegenError> {
        let cond = self.token_condition(op)?;
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::CallOnSlowPath)
                .inputs(Policy::RequiresRegister, 2)
                .temp(Policy::RequiresRegister)
                .output(Policy::RequiresRegister),
        );
        let (left, right, out) = (locs.input(0), locs.input(1), locs.out());
        let entry = self.asm.new_label();
        let exit = self.asm.new_label();
        self.branch_if_either_not_smi(left, right, locs.temp(0), entry);
        self.asm.emit(MachInst::Compare {
            lhs: left,
            rhs: Operand::Reg(right),
        });
        self.materialize_condition(cond, out);
        self.asm.bind(exit);
        self.slow_paths.push(SlowPath::CheckedSmi {
            instr,
            entry,
            exit,
            op,
            left,
            right,
            out,
        });
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn branch_if_either_not_smi(
        &mut self,
        left: Register,
        right: Register,
        scratch: Register,
        target: Label,
    ) {
        self.mov(scratch, left);
        self.asm.emit(MachInst::Alu {
            op: AluOp::Or,
            dst: scratch,
            src: Operand::Reg(right),
        });
        self.emitter
            .branch_if_not_smi(&mut self.asm, scratch, target);
    }

    // Comparisons.

    fn comparison_summary(
        &self,
        instr: InstrId,
        materialize: bool,
    ) -> Result<LocationSummary, CodegenError> {
        let mut summary = match &self.graph.instrs[instr].kind {
            InstrKind::RelationalOp(cmp) | InstrKind::EqualityCompare(cmp) => {
                let policy = match cmp.operation_cid {
                    cid::DOUBLE => Policy::RequiresFpuRegister,
                    cid::SMI | cid::MINT => Policy::RequiresRegister,
                    other => {
                        return Err(self.unsupported(format!("comparison of class {other}")));
                    }
                };
                LocationSummary::new(ContainsCall::No).inputs(policy, 2)
            }
            InstrKind::StrictCompare(_) => {
                LocationSummary::new(ContainsCall::No).inputs(Policy::RequiresRegister, 2)
            }
            InstrKind::TestCids(_) => LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .temp(Policy::RequiresRegister)
                .temp(Policy::RequiresRegister),
            other => unreachable!("{} is not a comparison", other.name()),
        };
        if materialize {
            summary = summary.output(Policy::RequiresRegister);
        }
        Ok(summary)
    }

    /// Sets the flags for the comparison `instr` and returns the condition
    /// that holds when it is true.
    fn emit_compare(
        &mut self,
        instr: InstrId,
        locs: &AllocatedLocations,
    ) -> Result<Condition, CodegenError> {
        match &self.graph.instrs[instr].kind {
            InstrKind::RelationalOp(cmp) | InstrKind::EqualityCompare(cmp) => {
                if cmp.operation_cid == cid::DOUBLE {
                    self.asm.emit(MachInst::FpuCompare {
                        lhs: locs.fpu_input(0),
                        rhs: locs.fpu_input(1),
                    });
                } else {
                    self.asm.emit(MachInst::Compare {
                        lhs: locs.input(0),
                        rhs: Operand::Reg(locs.input(1)),
                    });
                }
                self.token_condition(cmp.op)
            }
            InstrKind::StrictCompare(cmp) if cmp.needs_number_check => {
                self.asm.emit(MachInst::Push(locs.input(0)));
                self.asm.emit(MachInst::Push(locs.input(1)));
                self.emitter.call(
                    &mut self.asm,
                    CallTarget::Stub(StubId::IdenticalWithNumberCheck),
                );
                self.emitter.drop_arguments(&mut self.asm, 2);
                self.emitter.compare_object(
                    &mut self.asm,
                    self.conv.result,
                    PoolEntry::Object(ConstValue::Bool(true)),
                );
                match cmp.op {
                    Token::StrictEq => Ok(Condition::Equal),
                    _ => Ok(Condition::NotEqual),
                }
            }
            InstrKind::StrictCompare(cmp) => {
                self.asm.emit(MachInst::Compare {
                    lhs: locs.input(0),
                    rhs: Operand::Reg(locs.input(1)),
                });
                self.token_condition(cmp.op)
            }
            InstrKind::TestCids(test) => {
                let (value, class_id, found) = (locs.input(0), locs.temp(0), locs.temp(1));
                let hit = self.asm.new_label();
                self.emitter
                    .load_class_id_may_be_smi(&mut self.asm, class_id, value);
                self.emitter.load_immediate(&mut self.asm, found, 1);
                for &range in test.cids.ranges() {
                    self.branch_if_cid_in_range(class_id, range, hit);
                }
                self.emitter.load_immediate(&mut self.asm, found, 0);
                self.asm.bind(hit);
                self.asm.emit(MachInst::Compare {
                    lhs: found,
                    rhs: Operand::Imm(1),
                });
                Ok(Condition::Equal)
            }
            other => unreachable!("{} is not a comparison", other.name()),
        }
    }

    fn emit_comparison_value(&mut self, instr: InstrId) -> Result<(), CodegenError> {
        let summary = self.comparison_summary(instr, true)?;
        let locs = self.prepare(instr, &summary);
        let cond = self.emit_compare(instr, &locs)?;
        self.materialize_condition(cond, locs.out());
        self.store_output(instr, locs.output);
        Ok(())
    }

    fn emit_boolean_negate(&mut self, instr: InstrId) {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .output(Policy::RequiresRegister),
        );
        self.emitter.compare_object(
            &mut self.asm,
            locs.input(0),
            PoolEntry::Object(ConstValue::Bool(true)),
        );
        self.materialize_condition(Condition::NotEqual, locs.out());
        self.store_output(instr, locs.output);
    }

    pub(super) fn token_condition(&self, op: Token) -> Result<Condition, CodegenError> {
        Ok(match op {
            Token::Lt => Condition::Less,
            Token::Gt => Condition::Greater,
            Token::Lte => Condition::LessEqual,
            Token::Gte => Condition::GreaterEqual,
            Token::Eq | Token::StrictEq => Condition::Equal,
            Token::Ne | Token::StrictNe => Condition::NotEqual,
            other => return Err(self.unsupported(format!("comparison {}", other.name()))),
        })
    }

    /// Branches to `target` when the untagged class id in `class_id` is in
    /// `range`. On the taken path `class_id` may have been offset.
    pub(super) fn branch_if_cid_in_range(&mut self, class_id: Register, range: CidRange, target: Label) {
        if range.is_single_cid() {
            self.asm.emit(MachInst::Compare {
                lhs: class_id,
                rhs: Operand::Imm(i64::from(range.start)),
            });
            self.branch(Condition::Equal, target);
            return;
        }
        self.asm.emit(MachInst::Alu {
            op: AluOp::Sub,
            dst: class_id,
            src: Operand::Imm(i64::from(range.start)),
        });
        self.asm.emit(MachInst::Compare {
            lhs: class_id,
            rhs: Operand::Imm(i64::from(range.extent())),
        });
        self.branch(Condition::BelowEqual, target);
        self.asm.emit(MachInst::Alu {
            op: AluOp::Add,
            dst: class_id,
            src: Operand::Imm(i64::from(range.start)),
        });
    }

    /// Branches to `target` when the class id is outside `range`, leaving
    /// `class_id` intact. `scratch` may be clobbered.
    pub(super) fn branch_if_cid_not_in_range(
        &mut self,
        class_id: Register,
        range: CidRange,
        scratch: Register,
        target: Label,
    ) {
        if range.is_single_cid() {
            self.asm.emit(MachInst::Compare {
                lhs: class_id,
                rhs: Operand::Imm(i64::from(range.start)),
            });
            self.branch(Condition::NotEqual, target);
            return;
        }
        self.mov(scratch, class_id);
        self.asm.emit(MachInst::Alu {
            op: AluOp::Sub,
            dst: scratch,
            src: Operand::Imm(i64::from(range.start)),
        });
        self.asm.emit(MachInst::Compare {
            lhs: scratch,
            rhs: Operand::Imm(i64::from(range.extent())),
        });
        self.branch(Condition::Above, target);
    }

    // Boxing.

    fn emit_box(&mut self, instr: InstrId, from: Representation) -> Result<(), CodegenError> {
        match from {
            Representation::UnboxedDouble => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::Call)
                        .input(Policy::RequiresFpuRegister)
                        .output(Policy::Fixed(self.conv.result)),
                );
                self.call_allocation_stub(instr, StubId::AllocateDouble);
                self.asm.emit(MachInst::StoreFpu {
                    src: locs.fpu_input(0),
                    addr: Address::new(
                        locs.out(),
                        layout::field_offset(self.arch, layout::double::VALUE_WORD),
                    ),
                });
                self.store_output(instr, locs.output);
            }
            Representation::UnboxedInt64 if self.emitter.supports_unboxed_int64() => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::CallOnSlowPath)
                        .input(Policy::RequiresRegister)
                        .temp(Policy::Fixed(self.conv.result))
                        .output(Policy::RequiresRegister),
                );
                let (value, out) = (locs.input(0), locs.out());
                let entry = self.asm.new_label();
                let exit = self.asm.new_label();
                self.mov(out, value);
                self.emitter.smi_tag(&mut self.asm, out);
                self.branch(Condition::Overflow, entry);
                self.asm.bind(exit);
                self.slow_paths.push(SlowPath::BoxInt64 {
                    instr,
                    entry,
                    exit,
                    value,
                    out,
                });
                self.store_output(instr, locs.output);
            }
            other => return Err(self.unsupported(format!("boxing {}", other.name()))),
        }
        Ok(())
    }

    pub(super) fn emit_box_int64_slow_path(
        &mut self,
        instr: InstrId,
        entry: Label,
        exit: Label,
        value: Register,
        out: Register,
    ) {
        self.asm.bind(entry);
        self.call_allocation_stub(instr, StubId::AllocateMint);
        let result = self.conv.result;
        self.asm.emit(MachInst::Store {
            src: value,
            addr: Address::new(result, layout::field_offset(self.arch, layout::mint::VALUE_WORD)),
        });
        self.mov(out, result);
        self.asm.emit(MachInst::Jump(exit));
    }

    fn emit_unbox(&mut self, instr: InstrId, unbox: &Unbox) -> Result<(), CodegenError> {
        let deopt = if unbox.speculative {
            Some(self.add_deopt_stub(instr, DeoptReason::Unbox)?)
        } else {
            None
        };
        match unbox.to {
            Representation::UnboxedDouble => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No)
                        .input(Policy::RequiresRegister)
                        .temp(Policy::RequiresRegister)
                        .output(Policy::RequiresFpuRegister),
                );
                let (value, scratch, out) = (locs.input(0), locs.temp(0), locs.fpu_out());
                let not_smi = self.asm.new_label();
                let done = self.asm.new_label();
                self.emitter.branch_if_not_smi(&mut self.asm, value, not_smi);
                self.mov(scratch, value);
                self.emitter.smi_untag(&mut self.asm, scratch);
                self.asm.emit(MachInst::IntToDouble { dst: out, src: scratch });
                self.asm.emit(MachInst::Jump(done));
                self.asm.bind(not_smi);
                if let Some(deopt) = deopt {
                    self.emitter.load_class_id(&mut self.asm, scratch, value);
                    self.asm.emit(MachInst::Compare {
                        lhs: scratch,
                        rhs: Operand::Imm(i64::from(cid::DOUBLE)),
                    });
                    self.branch(Condition::NotEqual, deopt);
                }
                self.asm.emit(MachInst::LoadFpu {
                    dst: out,
                    addr: Address::new(
                        value,
                        layout::field_offset(self.arch, layout::double::VALUE_WORD),
                    ),
                });
                self.asm.bind(done);
                self.store_output(instr, locs.output);
            }
            Representation::UnboxedInt64 if self.emitter.supports_unboxed_int64() => {
                let locs = self.prepare(
                    instr,
                    &LocationSummary::new(ContainsCall::No)
                        .input(Policy::RequiresRegister)
                        .output(Policy::RequiresRegister),
                );
                let (value, out) = (locs.input(0), locs.out());
                let done = self.asm.new_label();
                self.mov(out, value);
                self.emitter.smi_untag(&mut self.asm, out);
                self.emitter.branch_if_smi(&mut self.asm, value, done);
                if let Some(deopt) = deopt {
                    self.emitter.load_class_id(&mut self.asm, out, value);
                    self.asm.emit(MachInst::Compare {
                        lhs: out,
                        rhs: Operand::Imm(i64::from(cid::MINT)),
                    });
                    self.branch(Condition::NotEqual, deopt);
                }
                self.emitter
                    .load_field(&mut self.asm, out, value, layout::mint::VALUE_WORD);
                self.asm.bind(done);
                self.store_output(instr, locs.output);
            }
            other => return Err(self.unsupported(format!("unboxing to {}", other.name()))),
        }
        Ok(())
    }

    // Memory.

    fn emit_allocate_object(&mut self, instr: InstrId, cls: ClassId) {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::Call).output(Policy::Fixed(self.conv.result)),
        );
        self.call_allocation_stub(instr, StubId::AllocateObject(cls));
        self.store_output(instr, locs.output);
    }

    /// Stores with a barrier take the object in the register the write
    /// barrier stub expects it in.
    fn store_summary(&self, inputs: usize, barrier: bool) -> LocationSummary {
        if barrier {
            LocationSummary::new(ContainsCall::CallOnSlowPath)
                .input(Policy::Fixed(self.conv.result))
                .inputs(Policy::RequiresRegister, inputs - 1)
        } else {
            LocationSummary::new(ContainsCall::No).inputs(Policy::RequiresRegister, inputs)
        }
    }

    /// Object in the result register. Smis need no barrier.
    fn emit_write_barrier(&mut self, value: Register) {
        let done = self.asm.new_label();
        self.emitter.branch_if_smi(&mut self.asm, value, done);
        self.emitter.call(
            &mut self.asm,
            CallTarget::Stub(StubId::WriteBarrier),
        );
        self.asm.bind(done);
    }

    fn check_array_class(&self, class_id: ClassId) -> Result<(), CodegenError> {
        if class_id == cid::ARRAY {
            Ok(())
        } else {
            Err(self.unsupported(format!("indexed access to class {class_id}")))
        }
    }

    /// Address of the element at the smi `index`.
    fn element_address(&self, array: Register, index: Register) -> Address {
        Address::indexed(
            array,
            index,
            self.arch.word_size_log2() - layout::SMI_TAG_SHIFT,
            layout::field_offset(self.arch, layout::array::DATA_WORD),
        )
    }

    // Guards.

    fn emit_check_class(
        &mut self,
        instr: InstrId,
        cids: &Cids,
        reason: DeoptReason,
    ) -> Result<(), CodegenError> {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No)
                .input(Policy::RequiresRegister)
                .temp(self.shift_count_policy())
                .temp(Policy::RequiresRegister),
        );
        let (value, class_id, mask) = (locs.input(0), locs.temp(0), locs.temp(1));
        let deopt = self.add_deopt_stub(instr, reason)?;
        let ok = self.asm.new_label();
        if cids.contains(cid::SMI) {
            self.emitter.branch_if_smi(&mut self.asm, value, ok);
        } else {
            self.emitter.branch_if_smi(&mut self.asm, value, deopt);
        }
        if cids.ranges().iter().all(|r| r.is_single_cid() && r.start == cid::SMI) {
            self.asm.emit(MachInst::Jump(deopt));
            self.asm.bind(ok);
            return Ok(());
        }
        self.emitter.load_class_id(&mut self.asm, class_id, value);
        if cids.is_bit_test() {
            let lowest = i64::from(cids.lowest());
            self.asm.emit(MachInst::Alu {
                op: AluOp::Sub,
                dst: class_id,
                src: Operand::Imm(lowest),
            });
            self.asm.emit(MachInst::Compare {
                lhs: class_id,
                rhs: Operand::Imm(i64::from(cids.highest()) - lowest),
            });
            self.branch(Condition::Above, deopt);
            self.emitter
                .load_immediate(&mut self.asm, mask, cids.compute_cid_mask() as i64);
            self.shift(ShiftOp::Shr, mask, Operand::Reg(class_id));
            self.asm.emit(MachInst::Test {
                lhs: mask,
                rhs: Operand::Imm(1),
            });
            self.branch(Condition::Equal, deopt);
        } else {
            for &range in cids.ranges() {
                self.branch_if_cid_in_range(class_id, range, ok);
            }
            self.asm.emit(MachInst::Jump(deopt));
        }
        self.asm.bind(ok);
        Ok(())
    }

    /// The input is a class id as produced by `LoadClassId`, a smi.
    fn emit_check_class_id(&mut self, instr: InstrId, range: CidRange) -> Result<(), CodegenError> {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::No).input(Policy::RequiresRegister),
        );
        let value = locs.input(0);
        let deopt = self.add_deopt_stub(instr, DeoptReason::CheckClassId)?;
        let start = tag_smi(i64::from(range.start));
        if range.is_single_cid() {
            self.asm.emit(MachInst::Compare {
                lhs: value,
                rhs: Operand::Imm(start),
            });
            self.branch(Condition::NotEqual, deopt);
        } else {
            self.asm.emit(MachInst::Alu {
                op: AluOp::Sub,
                dst: value,
                src: Operand::Imm(start),
            });
            self.asm.emit(MachInst::Compare {
                lhs: value,
                rhs: Operand::Imm(tag_smi(i64::from(range.extent()))),
            });
            self.branch(Condition::Above, deopt);
        }
        Ok(())
    }

    fn emit_check_null(&mut self, instr: InstrId) {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::CallOnSlowPath).input(Policy::RequiresRegister),
        );
        let entry = self.asm.new_label();
        self.emitter.compare_object(
            &mut self.asm,
            locs.input(0),
            PoolEntry::Object(ConstValue::Null),
        );
        self.branch(Condition::Equal, entry);
        self.slow_paths.push(SlowPath::Throw {
            instr,
            entry,
            runtime: RuntimeEntry::NullError,
            args: smallvec![],
        });
    }

    // Small emission helpers.

    fn shift_count_policy(&self) -> Policy {
        self.emitter
            .shift_count_register()
            .map_or(Policy::RequiresRegister, Policy::Fixed)
    }

    /// Dividend fixed to the ISA's dividend register when it has one.
    fn division_summary(&self) -> LocationSummary {
        match self.emitter.division_registers() {
            Some((dividend, high)) => LocationSummary::new(ContainsCall::No)
                .input(Policy::Fixed(dividend))
                .input(Policy::RequiresRegister)
                .temp(Policy::Fixed(high))
                .output(Policy::Fixed(dividend)),
            None => LocationSummary::new(ContainsCall::No)
                .inputs(Policy::RequiresRegister, 2)
                .output(Policy::SameAsFirstInput),
        }
    }

    /// Counts beyond the word width (or negative) shift by the maximum.
    fn saturate_shift_count(&mut self, count: Register) {
        let max = i64::from(self.arch.word_bits() - 1);
        let in_range = self.asm.new_label();
        self.asm.emit(MachInst::Compare {
            lhs: count,
            rhs: Operand::Imm(max),
        });
        self.branch(Condition::BelowEqual, in_range);
        self.emitter.load_immediate(&mut self.asm, count, max);
        self.asm.bind(in_range);
    }

    /// Turns a truncating remainder into one with the sign of the divisor
    /// removed: the result is never negative.
    fn adjust_remainder(&mut self, remainder: Register, divisor: Register) {
        let done = self.asm.new_label();
        let negative_divisor = self.asm.new_label();
        self.asm.emit(MachInst::Compare {
            lhs: remainder,
            rhs: Operand::Imm(0),
        });
        self.branch(Condition::GreaterEqual, done);
        self.asm.emit(MachInst::Compare {
            lhs: divisor,
            rhs: Operand::Imm(0),
        });
        self.branch(Condition::Less, negative_divisor);
        self.alu(AluOp::Add, remainder, divisor);
        self.asm.emit(MachInst::Jump(done));
        self.asm.bind(negative_divisor);
        self.alu(AluOp::Sub, remainder, divisor);
        self.asm.bind(done);
    }

    pub(super) fn mov(&mut self, dst: Register, src: Register) {
        if dst != src {
            self.asm.emit(MachInst::Move { dst, src });
        }
    }

    fn alu(&mut self, op: AluOp, dst: Register, src: Register) {
        self.asm.emit(MachInst::Alu {
            op,
            dst,
            src: Operand::Reg(src),
        });
    }

    fn shift(&mut self, op: ShiftOp, dst: Register, count: Operand) {
        self.asm.emit(MachInst::Shift { op, dst, count });
    }

    pub(super) fn branch(&mut self, cond: Condition, target: Label) {
        self.asm.emit(MachInst::BranchIf { cond, target });
    }
}

fn alu_op(op: Token) -> AluOp {
    match op {
        Token::Add => AluOp::Add,
        Token::Sub => AluOp::Sub,
        Token::Mul => AluOp::Mul,
        Token::BitAnd => AluOp::And,
        Token::BitOr => AluOp::Or,
        Token::BitXor => AluOp::Xor,
        other => unreachable!("{} has no ALU form", other.name()),
    }
}
