//! Host side of the stubs and runtime entries.

use super::{
    CacheEntry, CallSiteKind, Control, Deoptimization, DeoptFrame, HOST_RETURN, Outcome,
    SimError, Simulator, decode_return_address,
};
use crate::{
    deopt::{DeoptEntry, DeoptInstr},
    layout::{self, untag_smi},
    stubs::{RuntimeEntry, StubId},
};
use compact_str::{CompactString, format_compact};
use ember_il::{
    compile_type::AbstractType,
    object_model::{ClassId, cid},
};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Where unwinding or a stack walk starts: a frame, given by its FP, and
/// the return address into its code.
#[derive(Copy, Clone, Debug)]
struct FrameCursor {
    code: usize,
    pc_offset: u32,
    fp: i64,
}

impl Simulator {
    /// Value `index` of `count` values pushed first to last; the last one
    /// is on top of the stack.
    fn stack_value(&self, index: u32, count: u32) -> Result<i64, SimError> {
        let ws = self.machine.word_size();
        self.machine
            .load(self.machine.sp() + i64::from(count - 1 - index) * ws)
    }

    fn cursor_at_call(&self, ret: i64) -> Result<FrameCursor, SimError> {
        let (code, pc_offset) = decode_return_address(ret).ok_or(SimError::BadReturnAddress(ret))?;
        Ok(FrameCursor {
            code,
            pc_offset,
            fp: self.machine.fp(),
        })
    }

    pub(super) fn call_stub(&mut self, stub: StubId, ret: Option<i64>) -> Result<Control, SimError> {
        trace!(%stub, "stub");
        let conv = self.machine.conventions();
        if stub.can_allocate() {
            if let Some(ret) = ret {
                self.verify_stack_maps(self.cursor_at_call(ret)?)?;
            }
        }
        match stub {
            StubId::Deoptimize => {
                let ret = ret.ok_or_else(|| runtime_error("tail call to the deoptimization stub"))?;
                let cursor = self.cursor_at_call(ret)?;
                let entry = self.codes[cursor.code]
                    .code
                    .deopt_table
                    .entry_at(cursor.pc_offset)
                    .cloned()
                    .ok_or_else(|| runtime_error("deoptimization without a deopt table entry"))?;
                let deopt = self.deoptimize(cursor.code, &entry, None)?;
                Ok(Control::Finished(Outcome::Deoptimized(deopt)))
            }
            StubId::OptimizeFunction => {
                let object = self.machine.reg(conv.ic_data);
                let function = *self
                    .objects
                    .functions
                    .get(&object)
                    .ok_or_else(|| runtime_error("optimization request without a function"))?;
                debug!(function = self.function_name(function), "optimization requested");
                self.stats.optimization_requests.push(function);
                Ok(Control::Next)
            }
            StubId::StackOverflow => {
                self.stats.stack_overflow_checks += 1;
                Ok(Control::Next)
            }
            StubId::AllocateObject(cls) => {
                let object = self.new_instance(cls, &[])?;
                self.machine.set_reg(conv.result, object);
                Ok(Control::Next)
            }
            StubId::AllocateDouble => {
                let object = self.box_double(0)?;
                self.machine.set_reg(conv.result, object);
                Ok(Control::Next)
            }
            StubId::AllocateMint => {
                let words = 1 + 8 / self.arch().word_size();
                let object = self.machine.allocate(cid::MINT, words)?;
                self.machine.set_reg(conv.result, object);
                Ok(Control::Next)
            }
            StubId::WriteBarrier => {
                let object = self.machine.reg(conv.result);
                if !self.machine.is_valid_tagged(object) || layout::is_smi_word(object) {
                    return Err(runtime_error(format_compact!(
                        "write barrier for {object:#x}, not an object"
                    )));
                }
                Ok(Control::Next)
            }
            StubId::SubtypeTestCache => {
                let instance = self.machine.reg(conv.type_test_instance);
                let cache = self.machine.reg(conv.subtype_test_cache);
                let key = (
                    self.class_id_of(instance)?,
                    self.machine.reg(conv.instantiator_type_args),
                    self.machine.reg(conv.function_type_args),
                );
                let hit = self
                    .objects
                    .caches
                    .get(&cache)
                    .ok_or_else(|| runtime_error("subtype test cache probe without a cache"))?
                    .iter()
                    .find(|e| (e.cid, e.instantiator_type_args, e.function_type_args) == key)
                    .map(|e| e.result);
                let answer = match hit {
                    Some(result) => self.bool_value(result),
                    None => self.null(),
                };
                self.machine.set_reg(conv.subtype_test_cache_result, answer);
                Ok(Control::Next)
            }
            StubId::InlineCache { .. } | StubId::MegamorphicCall | StubId::SwitchableCall => {
                let ret = ret.ok_or_else(|| runtime_error("tail call to a dispatch stub"))?;
                self.dispatch(ret)
            }
            StubId::IdenticalWithNumberCheck => {
                let left = self.stack_value(0, 2)?;
                let right = self.stack_value(1, 2)?;
                let identical = self.identical_with_number_check(left, right);
                let answer = self.bool_value(identical);
                self.machine.set_reg(conv.result, answer);
                Ok(Control::Next)
            }
            StubId::NoSuchMethodDispatcher => {
                let function = self.codes[self.pc.code].code.function;
                self.stats.no_such_method.push(function);
                // The callee's frame is gone: the return address points
                // into the caller.
                let ret = match conv.link {
                    Some(lr) => self.machine.reg(lr),
                    None => self.machine.pop()?,
                };
                let message = format_compact!(
                    "NoSuchMethodError: {} does not accept these arguments",
                    self.function_name(function)
                );
                let exception = self.string(&message);
                self.throw_from(ret, exception)
            }
        }
    }

    pub(super) fn call_runtime(&mut self, entry: RuntimeEntry, ret: i64) -> Result<Control, SimError> {
        trace!(entry = entry.name(), "runtime call");
        self.verify_stack_maps(self.cursor_at_call(ret)?)?;
        let count = entry.argument_count();
        match entry {
            RuntimeEntry::Throw => {
                let exception = self.stack_value(0, count)?;
                self.throw_from(ret, exception)
            }
            RuntimeEntry::ReThrow => {
                let exception = self.stack_value(0, count)?;
                let stack_trace = self.stack_value(1, count)?;
                self.unwind(self.cursor_at_call(ret)?, exception, stack_trace)
            }
            RuntimeEntry::NonBoolTypeError => {
                let value = self.stack_value(0, count)?;
                let message = format_compact!(
                    "TypeError: {} is not a bool",
                    self.describe(value)
                );
                let exception = self.string(&message);
                self.throw_from(ret, exception)
            }
            RuntimeEntry::NullError => {
                let exception = self.string("NullError: null check failed");
                self.throw_from(ret, exception)
            }
            RuntimeEntry::Instanceof | RuntimeEntry::TypeCheck => {
                let instance = self.stack_value(0, count)?;
                let type_object = self.stack_value(1, count)?;
                let instantiator_type_args = self.stack_value(2, count)?;
                let function_type_args = self.stack_value(3, count)?;
                let cache = self.stack_value(count - 1, count)?;
                let ty = self
                    .objects
                    .types
                    .get(&type_object)
                    .cloned()
                    .ok_or_else(|| runtime_error("type test against a non-type"))?;
                let instance_cid = self.class_id_of(instance)?;
                let result = self.is_instance_of(instance_cid, &ty);
                if let Some(entries) = self.objects.caches.get_mut(&cache) {
                    let cached = CacheEntry {
                        cid: instance_cid,
                        instantiator_type_args,
                        function_type_args,
                        result,
                    };
                    if !entries.contains(&cached) {
                        entries.push(cached);
                    }
                }
                if entry == RuntimeEntry::Instanceof {
                    let answer = self.bool_value(result);
                    self.machine.set_reg(self.machine.conventions().result, answer);
                    return Ok(Control::Next);
                }
                if result {
                    return Ok(Control::Next);
                }
                let name = self.stack_value(4, count)?;
                let message = format_compact!(
                    "TypeError: {} is not a subtype of {ty} in {}",
                    self.describe(instance),
                    self.string_value(name).unwrap_or("?")
                );
                let exception = self.string(&message);
                self.throw_from(ret, exception)
            }
        }
    }

    /// Runtime subtype test. Type parameters are instantiated to
    /// `dynamic`: instances carry no type arguments.
    fn is_instance_of(&self, instance_cid: ClassId, ty: &AbstractType) -> bool {
        if !ty.is_instantiated() {
            return true;
        }
        self.classes.is_subtype_of(instance_cid, ty)
    }

    fn identical_with_number_check(&self, left: i64, right: i64) -> bool {
        if left == right {
            return true;
        }
        if layout::is_smi_word(left) || layout::is_smi_word(right) {
            return false;
        }
        match (self.class_id_of(left), self.class_id_of(right)) {
            (Ok(a), Ok(b)) if a == b && (a == cid::MINT || a == cid::DOUBLE) => {
                let payload = |value| {
                    let address = self.machine.field_address(value, layout::mint::VALUE_WORD);
                    self.machine.load_u64(address).ok()
                };
                payload(left).is_some() && payload(left) == payload(right)
            }
            _ => false,
        }
    }

    /// Short rendering of a value for error messages.
    fn describe(&self, value: i64) -> CompactString {
        if let Some(v) = self.int_value(value) {
            return format_compact!("{v}");
        }
        if self.is_null(value) {
            return "null".into();
        }
        match self.class_id_of(value) {
            Ok(class) => format_compact!("an instance of {}", self.classes.class_name(class)),
            Err(_) => format_compact!("{value:#x}"),
        }
    }

    /// Inline cache, megamorphic cache and switchable call dispatch. The
    /// arguments are on the stack, the call site object is in the IC data
    /// register.
    fn dispatch(&mut self, ret: i64) -> Result<Control, SimError> {
        let conv = self.machine.conventions();
        let site_object = self.machine.reg(conv.ic_data);
        let site = self
            .objects
            .call_sites
            .get(&site_object)
            .ok_or_else(|| runtime_error("dispatch without a call site"))?;
        let selector = site.ic.selector.clone();
        let count = site.ic.args_desc.size_with_type_args();
        let receiver_index = u32::from(site.ic.args_desc.type_args_len > 0);
        let tested = u32::from(site.ic.num_args_tested);

        let receiver_cid = self.class_id_of(self.stack_value(receiver_index, count)?)?;
        let mut cids: SmallVec<[ClassId; 2]> = SmallVec::new();
        for i in 0..tested {
            let arg = self.stack_value(receiver_index + i, count)?;
            cids.push(self.class_id_of(arg)?);
        }
        let Some(target) = self.classes.resolve_dynamic(receiver_cid, &selector) else {
            let message = format_compact!(
                "NoSuchMethodError: {} has no method {selector}",
                self.classes.class_name(receiver_cid)
            );
            let exception = self.string(&message);
            return self.throw_from(ret, exception);
        };
        if let Some(site) = self.objects.call_sites.get_mut(&site_object) {
            if site.kind != CallSiteKind::Megamorphic {
                site.ic.add_check(&cids, target, 1);
            }
        }
        trace!(%selector, ?cids, target = self.function_name(target), "dispatch");
        self.enter_function(target, Some(ret))?;
        Ok(Control::Jumped)
    }

    fn throw_from(&mut self, ret: i64, exception: i64) -> Result<Control, SimError> {
        let stack_trace = self.string("<stack trace>");
        if ret == HOST_RETURN {
            return Ok(Control::Finished(Outcome::Threw(exception)));
        }
        self.unwind(self.cursor_at_call(ret)?, exception, stack_trace)
    }

    /// Walks frames from `cursor` to the first one whose call site is
    /// covered by a try block, and enters that handler.
    fn unwind(
        &mut self,
        mut cursor: FrameCursor,
        exception: i64,
        stack_trace: i64,
    ) -> Result<Control, SimError> {
        let ws = self.machine.word_size();
        let frame = self.frame_layout();
        loop {
            let code = &self.codes[cursor.code].code;
            let handler = code
                .call_descriptor_at(cursor.pc_offset)
                .and_then(|d| d.try_index)
                .and_then(|try_index| code.handler_for(try_index));
            if let Some(handler) = handler {
                debug!(
                    function = self.function_name(code.function),
                    handler, "caught exception"
                );
                let conv = self.machine.conventions();
                self.machine.set_reg(conv.fp, cursor.fp);
                self.machine.set_reg(conv.result, exception);
                self.machine.set_reg(conv.stack_trace, stack_trace);
                let index = self.instruction_index(cursor.code, handler)?;
                self.pc.code = cursor.code;
                self.pc.index = index;
                return Ok(Control::Jumped);
            }
            let ret = self
                .machine
                .load(cursor.fp + i64::from(frame.return_address_from_fp) * ws)?;
            let caller_fp = self
                .machine
                .load(cursor.fp + i64::from(frame.saved_caller_fp_from_fp) * ws)?;
            if ret == HOST_RETURN {
                debug!("uncaught exception");
                return Ok(Control::Finished(Outcome::Threw(exception)));
            }
            let (code, pc_offset) =
                decode_return_address(ret).ok_or(SimError::BadReturnAddress(ret))?;
            cursor = FrameCursor {
                code,
                pc_offset,
                fp: caller_fp,
            };
        }
    }

    /// Checks that every slot the stack maps of the frames on the stack
    /// mark as tagged, and every outgoing argument, holds a valid tagged
    /// value.
    fn verify_stack_maps(&mut self, mut cursor: FrameCursor) -> Result<(), SimError> {
        let ws = self.machine.word_size();
        let frame = self.frame_layout();
        // Outgoing arguments of the innermost frame start at SP; those of
        // an outer frame sit above its callee's return address.
        let mut arguments_base = self.machine.sp();
        loop {
            let code = &self.codes[cursor.code].code;
            let bad = |what: CompactString| SimError::BadStackMap {
                function: self.function_name(code.function).into(),
                pc_offset: cursor.pc_offset,
                what,
            };
            let map = code
                .stack_map_at(cursor.pc_offset)
                .ok_or_else(|| bad("no stack map".into()))?;
            for slot in 0..code.spill_slot_count {
                if !map.is_tagged(slot) {
                    continue;
                }
                let index = frame.first_local_from_fp - slot as i32;
                let word = self.machine.load(cursor.fp + i64::from(index) * ws)?;
                if !self.machine.is_valid_tagged(word) {
                    return Err(bad(format_compact!(
                        "spill slot {slot} holds {word:#x}, not a tagged value"
                    )));
                }
            }
            for i in 0..map.outgoing_arguments {
                let word = self.machine.load(arguments_base + i64::from(i) * ws)?;
                if !self.machine.is_valid_tagged(word) {
                    return Err(bad(format_compact!(
                        "outgoing argument {i} is {word:#x}, not a tagged value"
                    )));
                }
            }

            let ret = self
                .machine
                .load(cursor.fp + i64::from(frame.return_address_from_fp) * ws)?;
            if ret == HOST_RETURN {
                break;
            }
            let (code, pc_offset) =
                decode_return_address(ret).ok_or(SimError::BadReturnAddress(ret))?;
            arguments_base = cursor.fp + i64::from(frame.return_address_from_fp + 1) * ws;
            let caller_fp = self
                .machine
                .load(cursor.fp + i64::from(frame.saved_caller_fp_from_fp) * ws)?;
            cursor = FrameCursor {
                code,
                pc_offset,
                fp: caller_fp,
            };
        }
        self.stats.safepoints_verified += 1;
        Ok(())
    }

    /// Rebuilds the unoptimized frames described by `entry` from the
    /// optimized frame at FP.
    pub(super) fn deoptimize(
        &mut self,
        code: usize,
        entry: &DeoptEntry,
        result: Option<i64>,
    ) -> Result<Deoptimization, SimError> {
        let info = self.codes[code]
            .code
            .deopt_table
            .info(entry)
            .cloned()
            .ok_or_else(|| runtime_error("deopt table entry without deopt info"))?;
        let function = self.codes[code].code.function;
        debug!(
            function = self.function_name(function),
            deopt_id = %entry.deopt_id,
            reason = %entry.reason,
            lazy = result.is_some(),
            "deoptimizing"
        );
        let ws = self.machine.word_size();
        let fp = self.machine.fp();
        let frame = self.frame_layout();

        let slots = info.frame_slots();
        let mut words = Vec::with_capacity(slots.len());
        let mut references = Vec::new();
        for (i, instr) in slots.iter().enumerate() {
            let word = match instr {
                DeoptInstr::Pp(_) | DeoptInstr::PcMarker(None) | DeoptInstr::RetAddress { .. } => 0,
                DeoptInstr::CallerPp => match frame.saved_caller_pp_from_fp {
                    Some(index) => self.machine.load(fp + i64::from(index) * ws)?,
                    None => 0,
                },
                DeoptInstr::PcMarker(Some(f)) => crate::backend::pc_marker(*f),
                DeoptInstr::CallerFp => self
                    .machine
                    .load(fp + i64::from(frame.saved_caller_fp_from_fp) * ws)?,
                DeoptInstr::CallerPc => self
                    .machine
                    .load(fp + i64::from(frame.return_address_from_fp) * ws)?,
                DeoptInstr::Constant(value) => self.constant_object(value)?,
                DeoptInstr::StackSlot(index) => self.machine.load(fp + i64::from(*index) * ws)?,
                DeoptInstr::DoubleStackSlot(index) => {
                    let bits = self.machine.load_u64(fp + i64::from(*index) * ws)?;
                    self.box_double(bits)?
                }
                DeoptInstr::Int64StackSlot(index) => {
                    let value = self.machine.load_u64(fp + i64::from(*index) * ws)? as i64;
                    self.box_int(value)?
                }
                DeoptInstr::MaterializedObjectRef(m) => {
                    references.push((i, *m as usize));
                    0
                }
                DeoptInstr::MaterializeObject { .. } => {
                    return Err(runtime_error("materialization among the frame words"));
                }
            };
            words.push(word);
        }

        // Materialization arguments follow the deoptimization stub's own
        // frame header: class, field count, then (offset, value) pairs.
        let first_argument = slots
            .iter()
            .position(|s| matches!(s, DeoptInstr::RetAddress { .. }))
            .map_or(0, |p| p + 1);
        let mut next = first_argument;
        let mut objects: Vec<i64> = Vec::new();
        for mat in info.materializations() {
            let DeoptInstr::MaterializeObject { cls, field_count } = mat else {
                return Err(runtime_error("unexpected materialization instruction"));
            };
            let null = self.null();
            let object = self
                .machine
                .allocate(*cls, layout::instance_size_in_words(&self.classes, *cls))?;
            for word in 1..layout::instance_size_in_words(&self.classes, *cls) {
                self.machine.store_field(object, word, null)?;
            }
            next += 2;
            for _ in 0..*field_count {
                let offset = u32::try_from(untag_smi(words[next]))
                    .map_err(|_| runtime_error("negative field offset in materialization"))?;
                let mut value = words[next + 1];
                if let Some(&(_, m)) = references.iter().find(|(i, _)| *i == next + 1) {
                    value = *objects
                        .get(m)
                        .ok_or_else(|| runtime_error("materialization refers forward"))?;
                }
                self.machine.store_field(object, offset, value)?;
                next += 2;
            }
            objects.push(object);
        }
        for &(i, m) in &references {
            words[i] = *objects
                .get(m)
                .ok_or_else(|| runtime_error("reference to a missing materialization"))?;
        }
        let materialization_words = next - first_argument;

        let mut frames: Vec<DeoptFrame> = Vec::new();
        let mut arguments = Vec::new();
        let mut current: Option<DeoptFrame> = None;
        let mut in_arguments = false;
        for (instr, &word) in slots.iter().zip(&words) {
            match instr {
                DeoptInstr::Pp(_)
                | DeoptInstr::CallerPp
                | DeoptInstr::PcMarker(_)
                | DeoptInstr::CallerFp => {}
                DeoptInstr::RetAddress { function, deopt_id } => {
                    frames.extend(current.take());
                    current = Some(DeoptFrame {
                        function: *function,
                        deopt_id: *deopt_id,
                        stack: Vec::new(),
                    });
                }
                DeoptInstr::CallerPc => {
                    frames.extend(current.take());
                    in_arguments = true;
                }
                _ if in_arguments => arguments.push(word),
                _ => {
                    if let Some(frame) = &mut current {
                        frame.stack.push(word);
                    }
                }
            }
        }
        frames.extend(current);
        if let Some(innermost) = frames.first_mut() {
            innermost.stack.drain(..materialization_words.min(innermost.stack.len()));
        }
        // Words were collected in increasing address order, the reverse
        // of push order.
        for frame in &mut frames {
            frame.stack.reverse();
        }
        arguments.reverse();

        Ok(Deoptimization {
            function,
            deopt_id: entry.deopt_id,
            reason: entry.reason,
            frames,
            arguments,
            result,
        })
    }
}

fn runtime_error(message: impl Into<CompactString>) -> SimError {
    SimError::Runtime(message.into())
}
