//! Instance-of tests and type assertions.
//!
//! A test runs in up to three tiers, each of which either decides or
//! falls through to the next: an inline class-id test when the type is
//! simple enough, a probe of the call site's subtype test cache, and
//! finally the runtime, which also fills the cache.

use super::{FlowGraphCompiler, SlowPath};
use crate::{
    assembler::{Condition, Label, MachInst},
    compiled_code::PoolEntry,
    isa::Register,
    locations::{ContainsCall, Location, LocationSummary, Policy},
    stubs::{CallTarget, RuntimeEntry, StubId},
};
use compact_str::CompactString;
use ember_il::{
    InstrId,
    compile_type::AbstractType,
    ir::{AssertAssignable, ConstValue},
    object_model::cid,
};
use smallvec::smallvec;

/// Registers of a type test: the fixed registers the stubs and the
/// runtime expect, plus a scratch register for class ids.
struct TypeTestRegs {
    instance: Register,
    instantiator_type_args: Register,
    function_type_args: Register,
    cache: Register,
    cache_result: Register,
    class_id: Register,
}

impl FlowGraphCompiler<'_> {
    fn type_test_summary(&self, output: bool) -> LocationSummary {
        let conv = self.conv;
        let summary = LocationSummary::new(ContainsCall::Call)
            .input(Policy::Fixed(conv.type_test_instance))
            .input(Policy::Fixed(conv.instantiator_type_args))
            .input(Policy::Fixed(conv.function_type_args))
            .temp(Policy::Fixed(conv.subtype_test_cache))
            .temp(Policy::Fixed(conv.subtype_test_cache_result))
            .temp(Policy::RequiresRegister);
        if output {
            summary.output(Policy::Fixed(conv.result))
        } else {
            summary
        }
    }

    fn prepare_type_test(&mut self, instr: InstrId, output: bool) -> TypeTestRegs {
        let summary = self.type_test_summary(output);
        let locs = self.prepare(instr, &summary);
        TypeTestRegs {
            instance: locs.input(0),
            instantiator_type_args: locs.input(1),
            function_type_args: locs.input(2),
            cache: locs.temp(0),
            cache_result: locs.temp(1),
            class_id: locs.temp(2),
        }
    }

    pub(super) fn emit_instance_of(&mut self, instr: InstrId, ty: &AbstractType) {
        let graph = self.graph;
        let known = graph
            .input_type(instr, 0)
            .is_instance_of(ty, &graph.classes);
        if let Some(result) = known {
            let locs = self.prepare(
                instr,
                &LocationSummary::new(ContainsCall::No).output(Policy::RequiresRegister),
            );
            self.load_bool(locs.out(), result);
            self.store_output(instr, locs.output);
            return;
        }

        let regs = self.prepare_type_test(instr, true);
        let out = self.conv.result;
        let is_true = self.asm.new_label();
        let is_false = self.asm.new_label();
        let done = self.asm.new_label();
        let decided =
            self.config.inline_type_tests && self.emit_inline_type_test(ty, &regs, is_true, is_false);
        if !decided {
            let cache = self.next_subtype_test_cache_index();
            self.emit_subtype_test_cache_probe(cache, &regs, is_true, is_false);
            self.emit_runtime_type_test(instr, ty, None, cache, &regs);
            // The runtime leaves the answer in the result register.
            self.asm.emit(MachInst::Jump(done));
        }
        self.asm.bind(is_true);
        self.load_bool(out, true);
        self.asm.emit(MachInst::Jump(done));
        self.asm.bind(is_false);
        self.load_bool(out, false);
        self.asm.bind(done);
        self.store_output(instr, Location::Register(out));
    }

    /// Checks that the input is assignable to the type, throwing through
    /// the runtime when it is not. The value flows on unchanged.
    pub(super) fn emit_assert_assignable(&mut self, instr: InstrId, assert: &AssertAssignable) {
        let graph = self.graph;
        if graph
            .input_type(instr, 0)
            .is_assignable_to(&assert.ty, &graph.classes)
        {
            return;
        }
        let regs = self.prepare_type_test(instr, false);
        let done = self.asm.new_label();
        let failed = self.asm.new_label();
        let decided = self.config.inline_type_tests
            && self.emit_inline_type_test(&assert.ty, &regs, done, failed);
        let cache = self.next_subtype_test_cache_index();
        if !decided {
            self.emit_subtype_test_cache_probe(cache, &regs, done, failed);
        }
        // The runtime throws unless the value passes after instantiating
        // the type.
        self.asm.bind(failed);
        self.emit_runtime_type_test(instr, &assert.ty, Some(&assert.dst_name), cache, &regs);
        self.asm.bind(done);
    }

    pub(super) fn emit_assert_boolean(&mut self, instr: InstrId) {
        let locs = self.prepare(
            instr,
            &LocationSummary::new(ContainsCall::CallOnSlowPath).input(Policy::RequiresRegister),
        );
        let value = locs.input(0);
        let ok = self.asm.new_label();
        let entry = self.asm.new_label();
        self.emitter.compare_object(
            &mut self.asm,
            value,
            PoolEntry::Object(ConstValue::Bool(true)),
        );
        self.branch(Condition::Equal, ok);
        self.emitter.compare_object(
            &mut self.asm,
            value,
            PoolEntry::Object(ConstValue::Bool(false)),
        );
        self.branch(Condition::NotEqual, entry);
        self.asm.bind(ok);
        self.slow_paths.push(SlowPath::Throw {
            instr,
            entry,
            runtime: RuntimeEntry::NonBoolTypeError,
            args: smallvec![value],
        });
    }

    fn next_subtype_test_cache_index(&mut self) -> u32 {
        let index = self.next_subtype_test_cache;
        self.next_subtype_test_cache += 1;
        index
    }

    /// Emits a class-id based test. Returns whether the test always
    /// branches to one of the labels; otherwise it falls through when
    /// undecided.
    fn emit_inline_type_test(
        &mut self,
        ty: &AbstractType,
        regs: &TypeTestRegs,
        is_true: Label,
        is_false: Label,
    ) -> bool {
        let graph = self.graph;
        let classes = &*graph.classes;
        let value = regs.instance;
        if ty.is_top() {
            self.asm.emit(MachInst::Jump(is_true));
            return true;
        }

        // Null is an instance of nullable types only, whatever they are
        // instantiated to.
        let null_target = match ty {
            AbstractType::TypeParameter { nullable: true, .. } => Some(is_true),
            AbstractType::TypeParameter { .. } => None,
            _ if ty.is_nullable() => Some(is_true),
            _ => Some(is_false),
        };
        if let Some(target) = null_target {
            self.emitter.compare_object(
                &mut self.asm,
                value,
                PoolEntry::Object(ConstValue::Null),
            );
            self.branch(Condition::Equal, target);
        }

        match ty {
            AbstractType::Null | AbstractType::Never => {
                self.asm.emit(MachInst::Jump(is_false));
                true
            }
            AbstractType::Class { cid: type_cid, .. } if ty.is_instantiated() => {
                let raw_test = ty.is_raw_class();
                // Instances of other classes can be rejected here even when
                // the type arguments are left to the later tiers.
                let maybe = (!raw_test).then(|| self.asm.new_label());
                let smi_target = if classes.is_subtype_of(cid::SMI, &AbstractType::class(*type_cid)) {
                    maybe.unwrap_or(is_true)
                } else {
                    is_false
                };
                self.emitter.branch_if_smi(&mut self.asm, value, smi_target);
                self.emitter
                    .load_class_id(&mut self.asm, regs.class_id, value);
                let in_range = maybe.unwrap_or(is_true);
                for &range in classes.subtype_ranges(*type_cid).ranges() {
                    self.branch_if_cid_in_range(regs.class_id, range, in_range);
                }
                self.asm.emit(MachInst::Jump(is_false));
                match maybe {
                    Some(maybe) => {
                        self.asm.bind(maybe);
                        false
                    }
                    None => true,
                }
            }
            _ => false,
        }
    }

    /// Looks the instance up in the call site's cache. Falls through on
    /// a miss.
    fn emit_subtype_test_cache_probe(
        &mut self,
        cache: u32,
        regs: &TypeTestRegs,
        is_true: Label,
        is_false: Label,
    ) {
        if !self.config.use_subtype_test_cache {
            return;
        }
        self.emitter.load_object(
            &mut self.asm,
            regs.cache,
            PoolEntry::SubtypeTestCache(cache),
        );
        self.emitter
            .call(&mut self.asm, CallTarget::Stub(StubId::SubtypeTestCache));
        self.emitter.compare_object(
            &mut self.asm,
            regs.cache_result,
            PoolEntry::Object(ConstValue::Bool(true)),
        );
        self.branch(Condition::Equal, is_true);
        self.emitter.compare_object(
            &mut self.asm,
            regs.cache_result,
            PoolEntry::Object(ConstValue::Bool(false)),
        );
        self.branch(Condition::Equal, is_false);
    }

    /// Calls `Instanceof`, or `TypeCheck` when `dst_name` is given.
    fn emit_runtime_type_test(
        &mut self,
        instr: InstrId,
        ty: &AbstractType,
        dst_name: Option<&CompactString>,
        cache: u32,
        regs: &TypeTestRegs,
    ) {
        self.asm.emit(MachInst::Push(regs.instance));
        self.emitter.push_object(
            &mut self.asm,
            PoolEntry::Object(ConstValue::Type(ty.clone())),
        );
        self.asm.emit(MachInst::Push(regs.instantiator_type_args));
        self.asm.emit(MachInst::Push(regs.function_type_args));
        let entry = match dst_name {
            Some(name) => {
                self.emitter.push_object(
                    &mut self.asm,
                    PoolEntry::Object(ConstValue::String(name.clone())),
                );
                RuntimeEntry::TypeCheck
            }
            None => RuntimeEntry::Instanceof,
        };
        self.emitter
            .push_object(&mut self.asm, PoolEntry::SubtypeTestCache(cache));
        self.call_runtime(instr, entry);
    }
}
