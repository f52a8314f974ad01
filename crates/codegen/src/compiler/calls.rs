//! Calls: arguments are pushed from their homes in call order, the
//! callee's result comes back in the result register and the caller
//! drops the arguments.

use super::FlowGraphCompiler;
use crate::{
    CodegenError,
    assembler::{Label, MachInst},
    compiled_code::{PcDescriptorKind, PoolEntry, StaticCallEntry},
    isa::Register,
    layout,
    locations::Location,
    stubs::{CallTarget, StubId},
};
use compact_str::CompactString;
use ember_il::{
    InstrId,
    feedback::ArgumentsDescriptor,
    ir::{
        ClosureCall, InstanceCall, PolymorphicInstanceCall, Representation, StaticCall, Token,
    },
    object_model::{FunctionId, FunctionKind},
};

impl FlowGraphCompiler<'_> {
    /// Pushes the arguments of `call`, first argument deepest, and returns
    /// how many were pushed.
    fn push_arguments(&mut self, call: InstrId) -> Result<u32, CodegenError> {
        let graph = self.graph;
        let count = graph.instrs[call].argument_count();
        let scratch = self.conv.tmp.unwrap_or(self.conv.result);
        for i in 0..count {
            let arg = graph.argument_at(call, i);
            let rep = match graph.move_argument_at(call, i) {
                Some(mv) => graph.instrs[mv].representation,
                None => graph.instrs[arg].representation,
            };
            if rep != Representation::Tagged {
                return Err(self.unsupported(format!("passing an {} argument", rep.name())));
            }
            let home = self.frame.home(arg);
            match home {
                Location::Register(reg) => self.asm.emit(MachInst::Push(reg)),
                _ => {
                    self.move_value(home, Location::Register(scratch), Representation::Tagged);
                    self.asm.emit(MachInst::Push(scratch))
                }
            };
        }
        Ok(count as u32)
    }

    fn load_arguments_descriptor(&mut self, args_desc: &ArgumentsDescriptor) {
        self.emitter.load_object(
            &mut self.asm,
            self.conv.args_desc,
            PoolEntry::ArgsDesc(args_desc.clone()),
        );
    }

    /// Whether a direct call to `target` has to pass the arguments
    /// descriptor: the callee checks or copies its parameters.
    fn target_needs_arguments_descriptor(
        &self,
        target: FunctionId,
        args_desc: &ArgumentsDescriptor,
    ) -> bool {
        let info = self.graph.classes.function(target);
        info.has_optional_parameters()
            || info.kind == FunctionKind::Closure
            || args_desc.named_count() > 0
            || args_desc.type_args_len > 0
    }

    /// Calls `target` directly and records the static call for patching.
    fn emit_direct_call(
        &mut self,
        instr: InstrId,
        target: FunctionId,
        args_desc: &ArgumentsDescriptor,
        kind: PcDescriptorKind,
        count: u32,
    ) {
        if self.target_needs_arguments_descriptor(target, args_desc) {
            self.load_arguments_descriptor(args_desc);
        }
        let pc_offset = self.emitter.call(&mut self.asm, CallTarget::Function(target));
        self.metadata
            .static_calls
            .push(StaticCallEntry { pc_offset, target });
        self.emit_call_metadata(instr, pc_offset, kind, count);
    }

    fn finish_call(&mut self, instr: InstrId, count: u32) {
        self.emitter.drop_arguments(&mut self.asm, count);
        self.store_output(instr, Location::Register(self.conv.result));
    }

    pub(super) fn emit_static_call(
        &mut self,
        instr: InstrId,
        call: &StaticCall,
    ) -> Result<(), CodegenError> {
        let count = self.push_arguments(instr)?;
        let kind = if self.config.optimizing {
            PcDescriptorKind::OtherCall
        } else {
            PcDescriptorKind::UnoptStaticCall
        };
        self.emit_direct_call(instr, call.target, &call.args_desc, kind, count);
        self.finish_call(instr, count);
        Ok(())
    }

    pub(super) fn emit_instance_call(
        &mut self,
        instr: InstrId,
        call: &InstanceCall,
    ) -> Result<(), CodegenError> {
        let count = self.push_arguments(instr)?;
        self.emit_dynamic_dispatch(
            instr,
            &call.selector,
            &call.args_desc,
            call.checked_argument_count,
            count,
        );
        self.finish_call(instr, count);
        Ok(())
    }

    /// Calls through the runtime's dispatch machinery with the arguments
    /// already pushed: a switchable call in precompiled code, a
    /// megamorphic cache lookup once feedback has seen too many classes,
    /// an inline cache otherwise.
    fn emit_dynamic_dispatch(
        &mut self,
        instr: InstrId,
        selector: &CompactString,
        args_desc: &ArgumentsDescriptor,
        num_args_tested: u8,
        count: u32,
    ) {
        let deopt_id = self.deopt_id_of(instr);
        self.load_arguments_descriptor(args_desc);
        let checks = self
            .feedback
            .get(deopt_id)
            .map_or(0, |ic| ic.number_of_checks());
        let (entry, stub) = if self.config.precompiled {
            (
                PoolEntry::UnlinkedCall {
                    selector: selector.clone(),
                    args_desc: args_desc.clone(),
                },
                StubId::SwitchableCall,
            )
        } else if checks > self.config.max_polymorphic_checks {
            (
                PoolEntry::MegamorphicCache {
                    selector: selector.clone(),
                    args_desc: args_desc.clone(),
                },
                StubId::MegamorphicCall,
            )
        } else {
            (
                PoolEntry::ICData {
                    selector: selector.clone(),
                    args_desc: args_desc.clone(),
                    num_args_tested,
                    deopt_id,
                },
                StubId::InlineCache { num_args_tested },
            )
        };
        self.emitter
            .load_object(&mut self.asm, self.conv.ic_data, entry);
        let pc_offset = self.emitter.call(&mut self.asm, CallTarget::Stub(stub));
        self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::IcCall, count);
    }

    /// Receiver position among the arguments: after the type argument
    /// vector when there is one.
    fn receiver_index(args_desc: &ArgumentsDescriptor) -> usize {
        usize::from(args_desc.type_args_len > 0)
    }

    pub(super) fn emit_polymorphic_call(
        &mut self,
        instr: InstrId,
        call: &PolymorphicInstanceCall,
    ) -> Result<(), CodegenError> {
        let count = self.push_arguments(instr)?;
        let [receiver, class_id, scratch] = self.free_registers(&[self.conv.args_desc]);
        let receiver_def = self
            .graph
            .argument_at(instr, Self::receiver_index(&call.args_desc));
        self.load_value(receiver, receiver_def);
        self.emitter
            .load_class_id_may_be_smi(&mut self.asm, class_id, receiver);

        let targets = call.targets.targets();
        let done = self.asm.new_label();
        for (i, target) in targets.iter().enumerate() {
            let is_last = i + 1 == targets.len();
            let next: Option<Label> = if is_last && call.complete {
                None
            } else {
                let next = self.asm.new_label();
                self.branch_if_cid_not_in_range(class_id, target.range, scratch, next);
                Some(next)
            };
            self.emit_direct_call(
                instr,
                target.target,
                &call.args_desc,
                PcDescriptorKind::OtherCall,
                count,
            );
            self.asm.emit(MachInst::Jump(done));
            if let Some(next) = next {
                self.asm.bind(next);
            }
        }
        if !call.complete {
            self.emit_dynamic_dispatch(instr, &call.selector, &call.args_desc, 1, count);
        }
        self.asm.bind(done);
        self.finish_call(instr, count);
        Ok(())
    }

    pub(super) fn emit_closure_call(
        &mut self,
        instr: InstrId,
        call: &ClosureCall,
    ) -> Result<(), CodegenError> {
        let count = self.push_arguments(instr)?;
        let [function] = self.free_registers(&[self.conv.args_desc]);
        let closure = self
            .graph
            .argument_at(instr, Self::receiver_index(&call.args_desc));
        self.load_value(function, closure);
        self.emitter.load_field(
            &mut self.asm,
            function,
            function,
            layout::closure::FUNCTION_WORD,
        );
        self.load_arguments_descriptor(&call.args_desc);
        let pc_offset = self
            .emitter
            .call(&mut self.asm, CallTarget::Register(function));
        self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::OtherCall, count);
        self.finish_call(instr, count);
        Ok(())
    }

    /// Calls the operator `op` on `left` and `right` through an inline
    /// cache and returns to `exit` with its result in `out`.
    pub(super) fn emit_checked_smi_slow_path(
        &mut self,
        instr: InstrId,
        entry: Label,
        exit: Label,
        op: Token,
        operands: [Register; 2],
        out: Register,
    ) {
        self.asm.bind(entry);
        for reg in operands {
            self.asm.emit(MachInst::Push(reg));
        }
        let args_desc = ArgumentsDescriptor::positional(2);
        self.load_arguments_descriptor(&args_desc);
        let deopt_id = self.deopt_id_of(instr);
        self.emitter.load_object(
            &mut self.asm,
            self.conv.ic_data,
            PoolEntry::ICData {
                selector: op.name().into(),
                args_desc,
                num_args_tested: 2,
                deopt_id,
            },
        );
        let pc_offset = self.emitter.call(
            &mut self.asm,
            CallTarget::Stub(StubId::InlineCache { num_args_tested: 2 }),
        );
        self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::IcCall, 2);
        self.emitter.drop_arguments(&mut self.asm, 2);
        self.mov(out, self.conv.result);
        self.asm.emit(MachInst::Jump(exit));
    }
}
