//! Executes generated code against a small model of the runtime.
//!
//! The simulator interprets [`MachInst`] listings of installed
//! [`CompiledCode`], with the calling convention, frame layout and object
//! layout described in [`layout`]. Stubs and runtime entries are
//! implemented on the host side (see `runtime.rs`): inline caches resolve
//! targets through the class table and record what they saw, allocation
//! stubs check the stack maps of every frame on the stack, throws unwind
//! through the catch entries of each frame, and deoptimization rebuilds
//! the unoptimized frames described by the deopt table.
//!
//! Return addresses are encoded as a code number and a PC offset, so a
//! return lands exactly where the code's metadata says it does.

use crate::{
    CompiledCode,
    assembler::{Label, MachInst},
    compiled_code::PoolEntry,
    deopt::DeoptReason,
    isa::Arch,
    layout::{self, FrameLayout, args_desc, tag_smi},
    stubs::{CallTarget, RuntimeEntry, StubId},
};
use compact_str::CompactString;
use cranelift_entity::EntityRef;
use ember_core::HashMap;
use ember_il::{
    DeoptId,
    compile_type::AbstractType,
    feedback::{ArgumentsDescriptor, ICData},
    ir::ConstValue,
    object_model::{ClassId, ClassTable, FunctionId, cid},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

mod machine;
mod runtime;

pub use machine::{CodeContext, HEAP_BASE, Machine, STACK_SIZE, STACK_TOP};

/// Return address that hands control back to the host.
const HOST_RETURN: i64 = 0x3ff0_0000;
const RETURN_ADDRESS_BASE: i64 = 0x4000_0000;
const CODE_NUMBER_SHIFT: u32 = 20;
const MAX_CODES: usize = 1 << 10;

const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    #[error("breakpoint at offset {pc_offset} of {function}")]
    Breakpoint {
        function: CompactString,
        pc_offset: u32,
    },
    #[error("memory fault at {address:#x}")]
    Fault { address: i64 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("no code installed for {0}")]
    MissingCode(CompactString),
    #[error("object index {0} out of range")]
    BadObjectIndex(u32),
    #[error("return to unknown address {0:#x}")]
    BadReturnAddress(i64),
    #[error("stack map at offset {pc_offset} of {function}: {what}")]
    BadStackMap {
        function: CompactString,
        pc_offset: u32,
        what: CompactString,
    },
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("step limit of {0} instructions reached")]
    StepLimit(u64),
    #[error("{0}")]
    Runtime(CompactString),
}

/// How a call from the host ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The value in the result register.
    Returned(i64),
    /// No handler caught the exception.
    Threw(i64),
    Deoptimized(Deoptimization),
}

/// Unoptimized frames rebuilt from a deopt table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Deoptimization {
    /// Function of the optimized code that gave up.
    pub function: FunctionId,
    pub deopt_id: DeoptId,
    pub reason: DeoptReason,
    /// Innermost first.
    pub frames: Vec<DeoptFrame>,
    /// Incoming arguments of the outermost frame, first argument first.
    pub arguments: Vec<i64>,
    /// Result of the call whose return triggered lazy deoptimization.
    pub result: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeoptFrame {
    pub function: FunctionId,
    /// Where unoptimized code resumes.
    pub deopt_id: DeoptId,
    /// Locals and expression stack, bottom first. For outer frames this
    /// ends with the arguments of the call into the next inner frame.
    pub stack: Vec<i64>,
}

/// Events observed by the runtime model.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub steps: u64,
    pub stub_calls: Vec<StubId>,
    pub runtime_calls: Vec<RuntimeEntry>,
    pub optimization_requests: Vec<FunctionId>,
    pub stack_overflow_checks: u32,
    /// Functions whose prologue rejected the arguments.
    pub no_such_method: Vec<FunctionId>,
    /// Stack walks performed at allocation points.
    pub safepoints_verified: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CallSiteKind {
    InlineCache,
    Megamorphic,
    Switchable,
}

struct CallSite {
    kind: CallSiteKind,
    ic: ICData,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct CacheEntry {
    cid: ClassId,
    instantiator_type_args: i64,
    function_type_args: i64,
    result: bool,
}

/// Host-side data of heap objects the runtime gives meaning to.
#[derive(Default)]
struct ObjectTable {
    interned: HashMap<ConstValue, i64>,
    strings: HashMap<i64, CompactString>,
    types: HashMap<i64, AbstractType>,
    functions: HashMap<i64, FunctionId>,
    function_objects: HashMap<FunctionId, i64>,
    args_descs: HashMap<ArgumentsDescriptor, i64>,
    call_sites: HashMap<i64, CallSite>,
    call_sites_by_deopt_id: HashMap<(FunctionId, DeoptId), i64>,
    caches: HashMap<i64, Vec<CacheEntry>>,
}

struct LoadedCode {
    code: CompiledCode,
    /// Raw address of the first pool word; zero without a pool.
    pool_address: i64,
    objects: Vec<i64>,
    invalidated: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Pc {
    code: usize,
    index: usize,
}

/// What execution does after a call into the runtime model.
pub(super) enum Control {
    /// Continue with the instruction after the call.
    Next,
    /// The runtime moved the PC.
    Jumped,
    Finished(Outcome),
}

pub struct Simulator {
    machine: Machine,
    classes: Arc<ClassTable>,
    codes: Vec<LoadedCode>,
    installed: HashMap<FunctionId, usize>,
    objects: ObjectTable,
    /// Entering the first function invalidates the code of the second.
    invalidations: Vec<(FunctionId, FunctionId)>,
    stats: SimStats,
    step_limit: u64,
    pc: Pc,
}

impl Simulator {
    pub fn new(arch: Arch, classes: Arc<ClassTable>) -> Self {
        Self {
            machine: Machine::new(arch),
            classes,
            codes: Vec::new(),
            installed: HashMap::default(),
            objects: ObjectTable::default(),
            invalidations: Vec::new(),
            stats: SimStats::default(),
            step_limit: DEFAULT_STEP_LIMIT,
            pc: Pc { code: 0, index: 0 },
        }
    }

    pub fn arch(&self) -> Arch {
        self.machine.arch()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    /// Makes `code` the current code of its function.
    pub fn install(&mut self, code: CompiledCode) -> Result<(), SimError> {
        assert!(code.arch == self.arch(), "code for {} on a {} simulator", code.arch, self.arch());
        assert!(self.codes.len() < MAX_CODES, "too many pieces of code");
        let function = code.function;
        let objects = code
            .object_pool
            .iter()
            .map(|entry| self.pool_object(function, entry))
            .collect::<Result<Vec<_>, _>>()?;
        let pool_address = if self.arch().uses_object_pool() {
            let ws = self.machine.word_size();
            let address = self.machine.allocate_raw(objects.len() as u32)?;
            for (i, &object) in objects.iter().enumerate() {
                self.machine.store(address + i as i64 * ws, object)?;
            }
            address
        } else {
            0
        };
        debug!(
            function = self.function_name(function),
            size = code.size(),
            pool = objects.len(),
            "installed code"
        );
        self.installed.insert(function, self.codes.len());
        self.codes.push(LoadedCode {
            code,
            pool_address,
            objects,
            invalidated: false,
        });
        Ok(())
    }

    /// Invalidates the code of `victim` when `trigger` is entered, as a
    /// class hierarchy change during the call would. Frames of the victim
    /// deoptimize lazily when control returns to them.
    pub fn invalidate_on_entry(&mut self, trigger: FunctionId, victim: FunctionId) {
        self.invalidations.push((trigger, victim));
    }

    pub fn invalidate(&mut self, function: FunctionId) {
        if let Some(index) = self.installed.remove(&function) {
            debug!(function = self.function_name(function), "invalidated code");
            self.codes[index].invalidated = true;
        }
    }

    /// Calls `function` with positional arguments.
    pub fn call(&mut self, function: FunctionId, args: &[i64]) -> Result<Outcome, SimError> {
        self.call_with(function, args, &ArgumentsDescriptor::positional(args.len() as u32))
    }

    pub fn call_with(
        &mut self,
        function: FunctionId,
        args: &[i64],
        args_desc: &ArgumentsDescriptor,
    ) -> Result<Outcome, SimError> {
        let code = self.code_index(function)?;
        let conv = self.machine.conventions();
        let (saved_fp, saved_sp) = (self.machine.fp(), self.machine.sp());
        for &arg in args {
            self.machine.push(arg)?;
        }
        let desc = self.args_desc_object(args_desc)?;
        self.machine.set_reg(conv.args_desc, desc);
        self.enter(code, Some(HOST_RETURN))?;
        let outcome = self.run();
        self.machine.set_reg(conv.fp, saved_fp);
        self.machine.set_reg(conv.sp, saved_sp);
        outcome
    }

    /// Enters the OSR entry of `function`'s code from a frame that looks
    /// like unoptimized code's: incoming `args`, the fixed frame part and
    /// `locals` below it.
    pub fn enter_osr(
        &mut self,
        function: FunctionId,
        args: &[i64],
        locals: &[i64],
    ) -> Result<Outcome, SimError> {
        let code = self.code_index(function)?;
        let offset = self.codes[code].code.osr_entry_pc_offset.ok_or_else(|| {
            SimError::Runtime(format!("{} has no OSR entry", self.function_name(function)).into())
        })?;
        let conv = self.machine.conventions();
        let (saved_fp, saved_sp) = (self.machine.fp(), self.machine.sp());
        for &arg in args {
            self.machine.push(arg)?;
        }
        self.machine.push(HOST_RETURN)?;
        self.machine.push(saved_fp)?;
        let fp = self.machine.sp();
        self.machine.set_reg(conv.fp, fp);
        self.machine.push(crate::backend::pc_marker(function))?;
        if let Some(pp) = conv.pp {
            self.machine.push(self.machine.reg(pp))?;
        }
        for &local in locals {
            self.machine.push(local)?;
        }
        if let Some(lr) = conv.link {
            self.machine.set_reg(lr, HOST_RETURN);
        }
        self.pc = Pc {
            code,
            index: self.instruction_index(code, offset)?,
        };
        let outcome = self.run();
        self.machine.set_reg(conv.fp, saved_fp);
        self.machine.set_reg(conv.sp, saved_sp);
        outcome
    }

    fn code_index(&self, function: FunctionId) -> Result<usize, SimError> {
        self.installed
            .get(&function)
            .copied()
            .ok_or_else(|| SimError::MissingCode(self.function_name(function).into()))
    }

    fn function_name(&self, function: FunctionId) -> &str {
        &self.classes.function(function).name
    }

    fn instruction_index(&self, code: usize, pc_offset: u32) -> Result<usize, SimError> {
        self.codes[code]
            .code
            .instruction_at(pc_offset)
            .ok_or_else(|| SimError::BadReturnAddress(encode_return_address(code, pc_offset)))
    }

    /// Transfers control to the entry of `code`, passing `ret` the way a
    /// call instruction does. Tail calls pass `None`: the return address
    /// is already in place.
    fn enter(&mut self, code: usize, ret: Option<i64>) -> Result<(), SimError> {
        if let Some(ret) = ret {
            match self.machine.conventions().link {
                Some(lr) => self.machine.set_reg(lr, ret),
                None => self.machine.push(ret)?,
            }
        }
        let function = self.codes[code].code.function;
        trace!(function = self.function_name(function), "enter");
        let victims: Vec<FunctionId> = self
            .invalidations
            .iter()
            .filter(|(trigger, _)| *trigger == function)
            .map(|&(_, victim)| victim)
            .collect();
        for victim in victims {
            self.invalidate(victim);
        }
        self.pc = Pc { code, index: 0 };
        Ok(())
    }

    fn enter_function(&mut self, function: FunctionId, ret: Option<i64>) -> Result<(), SimError> {
        let code = self.code_index(function)?;
        self.enter(code, ret)
    }

    fn jump(&mut self, label: Label) {
        self.pc.index = self.codes[self.pc.code].code.labels[label.index()] as usize;
    }

    /// Offset of the instruction after the current one.
    fn next_pc_offset(&self) -> u32 {
        let code = &self.codes[self.pc.code].code;
        code.offsets[self.pc.index] + code.insts[self.pc.index].encoded_len(code.arch)
    }

    fn run(&mut self) -> Result<Outcome, SimError> {
        loop {
            if self.stats.steps >= self.step_limit {
                return Err(SimError::StepLimit(self.step_limit));
            }
            self.stats.steps += 1;

            let loaded = &self.codes[self.pc.code];
            let inst = loaded.code.insts[self.pc.index].clone();
            let context = CodeContext {
                pool_pointer: loaded.pool_address,
                objects: &loaded.objects,
            };
            if self.machine.execute(&inst, context)? {
                self.pc.index += 1;
                continue;
            }
            let control = match inst {
                MachInst::Jump(label) => {
                    self.jump(label);
                    Control::Jumped
                }
                MachInst::BranchIf { cond, target } => {
                    if self.machine.condition_holds(cond) {
                        self.jump(target);
                        Control::Jumped
                    } else {
                        Control::Next
                    }
                }
                MachInst::Call(target) => {
                    let ret = encode_return_address(self.pc.code, self.next_pc_offset());
                    if let Some(lr) = self.machine.conventions().link {
                        self.machine.set_reg(lr, ret);
                    }
                    self.call_target(target, Some(ret))?
                }
                MachInst::TailCall(target) => self.call_target(target, None)?,
                MachInst::Ret => self.ret()?,
                MachInst::Breakpoint => {
                    let code = &self.codes[self.pc.code].code;
                    return Err(SimError::Breakpoint {
                        function: self.function_name(code.function).into(),
                        pc_offset: code.offsets[self.pc.index],
                    });
                }
                other => unreachable!("{other:?} was executed by the machine"),
            };
            match control {
                Control::Next => self.pc.index += 1,
                Control::Jumped => {}
                Control::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    fn call_target(&mut self, target: CallTarget, ret: Option<i64>) -> Result<Control, SimError> {
        match target {
            CallTarget::Function(function) => {
                self.enter_function(function, ret)?;
                Ok(Control::Jumped)
            }
            CallTarget::Register(reg) => {
                let value = self.machine.reg(reg);
                let function = self.objects.functions.get(&value).copied().ok_or_else(|| {
                    SimError::Runtime(format!("call through {value:#x}, not a function").into())
                })?;
                self.enter_function(function, ret)?;
                Ok(Control::Jumped)
            }
            CallTarget::Stub(stub) => {
                self.stats.stub_calls.push(stub);
                self.call_stub(stub, ret)
            }
            CallTarget::Runtime(entry) => {
                self.stats.runtime_calls.push(entry);
                let ret = ret.ok_or_else(|| {
                    SimError::Runtime(format!("tail call to runtime entry {}", entry.name()).into())
                })?;
                self.call_runtime(entry, ret)
            }
        }
    }

    fn ret(&mut self) -> Result<Control, SimError> {
        let target = match self.machine.conventions().link {
            Some(lr) => self.machine.reg(lr),
            None => self.machine.pop()?,
        };
        if target == HOST_RETURN {
            let result = self.machine.reg(self.machine.conventions().result);
            return Ok(Control::Finished(Outcome::Returned(result)));
        }
        let (code, pc_offset) =
            decode_return_address(target).ok_or(SimError::BadReturnAddress(target))?;
        if code >= self.codes.len() {
            return Err(SimError::BadReturnAddress(target));
        }
        if self.codes[code].invalidated {
            if let Some(entry) = self.codes[code].code.deopt_table.entry_at(pc_offset).cloned() {
                let result = self.machine.reg(self.machine.conventions().result);
                let deopt = self.deoptimize(code, &entry, Some(result))?;
                return Ok(Control::Finished(Outcome::Deoptimized(deopt)));
            }
        }
        self.pc = Pc {
            code,
            index: self.instruction_index(code, pc_offset)?,
        };
        Ok(Control::Jumped)
    }

    // Heap objects.

    pub fn null(&mut self) -> i64 {
        self.constant(&ConstValue::Null)
    }

    pub fn bool_value(&mut self, value: bool) -> i64 {
        self.constant(&ConstValue::Bool(value))
    }

    pub fn smi(&self, value: i64) -> i64 {
        assert!(self.arch().is_smi(value), "{value} is not a smi on {}", self.arch());
        tag_smi(value)
    }

    pub fn string(&mut self, value: &str) -> i64 {
        self.constant(&ConstValue::String(value.into()))
    }

    pub fn double(&mut self, value: f64) -> Result<i64, SimError> {
        self.box_double(value.to_bits())
    }

    /// The object for a constant: a smi when it fits, a canonical object
    /// otherwise.
    pub fn constant(&mut self, value: &ConstValue) -> i64 {
        self.constant_object(value)
            .unwrap_or_else(|err| panic!("cannot allocate constant {value}: {err}"))
    }

    fn constant_object(&mut self, value: &ConstValue) -> Result<i64, SimError> {
        if let ConstValue::Int(v) = value {
            if self.arch().is_smi(*v) {
                return Ok(tag_smi(*v));
            }
        }
        if let Some(&object) = self.objects.interned.get(value) {
            return Ok(object);
        }
        let ws = self.arch().word_size();
        let object = match value {
            ConstValue::Null | ConstValue::OptimizedOut => self.machine.allocate(value.cid(), 1)?,
            ConstValue::Bool(b) => {
                let object = self.machine.allocate(cid::BOOL, 2)?;
                self.machine.store_field(object, 1, tag_smi(i64::from(*b)))?;
                object
            }
            ConstValue::Int(v) => {
                let object = self.machine.allocate(cid::MINT, 1 + 8 / ws)?;
                let address = self.machine.field_address(object, layout::mint::VALUE_WORD);
                self.machine.store_u64(address, *v as u64)?;
                object
            }
            ConstValue::Double(d) => self.box_double(d.to_bits())?,
            ConstValue::String(s) => {
                let object = self.machine.allocate(value.cid(), 1)?;
                self.objects.strings.insert(object, s.clone());
                object
            }
            ConstValue::Type(ty) => {
                let object = self.machine.allocate(cid::OBJECT, 1)?;
                self.objects.types.insert(object, ty.clone());
                object
            }
        };
        self.objects.interned.insert(value.clone(), object);
        Ok(object)
    }

    fn box_double(&mut self, bits: u64) -> Result<i64, SimError> {
        let words = 1 + 8 / self.arch().word_size();
        let object = self.machine.allocate(cid::DOUBLE, words)?;
        let address = self.machine.field_address(object, layout::double::VALUE_WORD);
        self.machine.store_u64(address, bits)?;
        Ok(object)
    }

    /// Boxes a 64-bit integer: a smi when it fits, a mint otherwise.
    fn box_int(&mut self, value: i64) -> Result<i64, SimError> {
        if self.arch().is_smi(value) {
            return Ok(tag_smi(value));
        }
        let words = 1 + 8 / self.arch().word_size();
        let object = self.machine.allocate(cid::MINT, words)?;
        let address = self.machine.field_address(object, layout::mint::VALUE_WORD);
        self.machine.store_u64(address, value as u64)?;
        Ok(object)
    }

    /// A new instance of `cls` with the given leading fields; the rest
    /// are null.
    pub fn new_instance(&mut self, cls: ClassId, fields: &[i64]) -> Result<i64, SimError> {
        let words = layout::instance_size_in_words(&self.classes, cls);
        assert!(fields.len() < words as usize, "too many fields for class {cls}");
        let null = self.null();
        let object = self.machine.allocate(cls, words)?;
        for word in 1..words {
            let value = fields.get(word as usize - 1).copied().unwrap_or(null);
            self.machine.store_field(object, word, value)?;
        }
        Ok(object)
    }

    pub fn new_array(&mut self, elements: &[i64]) -> Result<i64, SimError> {
        let words = layout::array::DATA_WORD + elements.len() as u32;
        let object = self.machine.allocate(cid::ARRAY, words)?;
        self.machine
            .store_field(object, layout::array::LENGTH_WORD, tag_smi(elements.len() as i64))?;
        for (i, &element) in elements.iter().enumerate() {
            self.machine
                .store_field(object, layout::array::DATA_WORD + i as u32, element)?;
        }
        Ok(object)
    }

    /// The canonical function object of `function`, holding its usage
    /// counter.
    pub fn function_object(&mut self, function: FunctionId) -> Result<i64, SimError> {
        if let Some(&object) = self.objects.function_objects.get(&function) {
            return Ok(object);
        }
        let object = self
            .machine
            .allocate(cid::OBJECT, layout::function::SIZE_IN_WORDS)?;
        self.machine
            .store_field(object, layout::function::USAGE_COUNTER_WORD, tag_smi(0))?;
        self.objects.functions.insert(object, function);
        self.objects.function_objects.insert(function, object);
        Ok(object)
    }

    pub fn usage_counter(&self, function: FunctionId) -> Option<i64> {
        let object = *self.objects.function_objects.get(&function)?;
        let counter = self
            .machine
            .load_field(object, layout::function::USAGE_COUNTER_WORD)
            .ok()?;
        Some(layout::untag_smi(counter))
    }

    pub fn new_closure(&mut self, function: FunctionId) -> Result<i64, SimError> {
        let target = self.function_object(function)?;
        let null = self.null();
        let object = self
            .machine
            .allocate(cid::CLOSURE, layout::closure::SIZE_IN_WORDS)?;
        self.machine
            .store_field(object, layout::closure::FUNCTION_WORD, target)?;
        self.machine
            .store_field(object, layout::closure::CONTEXT_WORD, null)?;
        Ok(object)
    }

    fn args_desc_object(&mut self, desc: &ArgumentsDescriptor) -> Result<i64, SimError> {
        if let Some(&object) = self.objects.args_descs.get(desc) {
            return Ok(object);
        }
        let named = desc.named_count();
        let object = self
            .machine
            .allocate(cid::OBJECT, args_desc::size_in_words(named))?;
        let smi = |v: u32| tag_smi(i64::from(v));
        self.machine
            .store_field(object, args_desc::TYPE_ARGS_LEN_WORD, smi(desc.type_args_len))?;
        self.machine
            .store_field(object, args_desc::COUNT_WORD, smi(desc.count))?;
        self.machine
            .store_field(object, args_desc::POSITIONAL_COUNT_WORD, smi(desc.positional_count()))?;
        self.machine
            .store_field(object, args_desc::NAMED_COUNT_WORD, smi(named))?;
        for (i, arg) in desc.named.iter().enumerate() {
            let entry = args_desc::FIRST_NAMED_WORD + i as u32 * args_desc::NAMED_ENTRY_WORDS;
            let name = self.string(&arg.name);
            self.machine
                .store_field(object, entry + args_desc::NAME_OFFSET_IN_ENTRY, name)?;
            self.machine.store_field(
                object,
                entry + args_desc::POSITION_OFFSET_IN_ENTRY,
                smi(arg.position),
            )?;
        }
        let null = self.null();
        self.machine.store_field(
            object,
            args_desc::FIRST_NAMED_WORD + named * args_desc::NAMED_ENTRY_WORDS,
            null,
        )?;
        self.objects.args_descs.insert(desc.clone(), object);
        Ok(object)
    }

    fn call_site_object(
        &mut self,
        function: FunctionId,
        kind: CallSiteKind,
        ic: ICData,
        deopt_id: Option<DeoptId>,
    ) -> Result<i64, SimError> {
        let object = self.machine.allocate(cid::OBJECT, 1)?;
        if let Some(deopt_id) = deopt_id {
            self.objects
                .call_sites_by_deopt_id
                .insert((function, deopt_id), object);
        }
        self.objects.call_sites.insert(object, CallSite { kind, ic });
        Ok(object)
    }

    fn pool_object(&mut self, function: FunctionId, entry: &PoolEntry) -> Result<i64, SimError> {
        match entry {
            PoolEntry::Object(value) => self.constant_object(value),
            PoolEntry::Function(f) => self.function_object(*f),
            PoolEntry::ArgsDesc(desc) => self.args_desc_object(desc),
            PoolEntry::ICData {
                selector,
                args_desc,
                num_args_tested,
                deopt_id,
            } => self.call_site_object(
                function,
                CallSiteKind::InlineCache,
                ICData::new(selector.clone(), args_desc.clone(), *num_args_tested),
                Some(*deopt_id),
            ),
            PoolEntry::MegamorphicCache {
                selector,
                args_desc,
            } => self.call_site_object(
                function,
                CallSiteKind::Megamorphic,
                ICData::new(selector.clone(), args_desc.clone(), 1),
                None,
            ),
            PoolEntry::UnlinkedCall {
                selector,
                args_desc,
            } => self.call_site_object(
                function,
                CallSiteKind::Switchable,
                ICData::new(selector.clone(), args_desc.clone(), 1),
                None,
            ),
            PoolEntry::SubtypeTestCache(_) => {
                let object = self.machine.allocate(cid::OBJECT, 1)?;
                self.objects.caches.insert(object, Vec::new());
                Ok(object)
            }
            PoolEntry::Stub(_) => self.machine.allocate(cid::OBJECT, 1),
        }
    }

    // Inspection.

    pub fn class_id_of(&self, value: i64) -> Result<ClassId, SimError> {
        self.machine.class_id_of(value)
    }

    /// The integer a smi or mint holds.
    pub fn int_value(&self, value: i64) -> Option<i64> {
        if layout::is_smi_word(value) {
            return Some(layout::untag_smi(value));
        }
        if self.class_id_of(value).ok()? != cid::MINT {
            return None;
        }
        let address = self.machine.field_address(value, layout::mint::VALUE_WORD);
        self.machine.load_u64(address).ok().map(|bits| bits as i64)
    }

    pub fn double_value(&self, value: i64) -> Option<f64> {
        if layout::is_smi_word(value) || self.class_id_of(value).ok()? != cid::DOUBLE {
            return None;
        }
        let address = self.machine.field_address(value, layout::double::VALUE_WORD);
        self.machine.load_u64(address).ok().map(f64::from_bits)
    }

    pub fn bool_of(&self, value: i64) -> Option<bool> {
        if layout::is_smi_word(value) || self.class_id_of(value).ok()? != cid::BOOL {
            return None;
        }
        self.machine
            .load_field(value, 1)
            .ok()
            .map(|word| word == tag_smi(1))
    }

    pub fn string_value(&self, value: i64) -> Option<&str> {
        self.objects.strings.get(&value).map(CompactString::as_str)
    }

    pub fn is_null(&self, value: i64) -> bool {
        self.objects.interned.get(&ConstValue::Null) == Some(&value)
    }

    pub fn field(&self, object: i64, word: u32) -> Result<i64, SimError> {
        self.machine.load_field(object, word)
    }

    /// Inline cache state of the call site with `deopt_id` in the code of
    /// `function`.
    pub fn inline_cache(&self, function: FunctionId, deopt_id: DeoptId) -> Option<&ICData> {
        let object = self.objects.call_sites_by_deopt_id.get(&(function, deopt_id))?;
        self.objects.call_sites.get(object).map(|site| &site.ic)
    }

    /// Number of entries recorded in all subtype test caches.
    pub fn subtype_test_cache_entries(&self) -> usize {
        self.objects.caches.values().map(Vec::len).sum()
    }

    fn frame_layout(&self) -> FrameLayout {
        FrameLayout::for_arch(self.arch())
    }
}

fn encode_return_address(code: usize, pc_offset: u32) -> i64 {
    RETURN_ADDRESS_BASE + ((code as i64) << CODE_NUMBER_SHIFT) + i64::from(pc_offset)
}

fn decode_return_address(address: i64) -> Option<(usize, u32)> {
    let relative = address.checked_sub(RETURN_ADDRESS_BASE)?;
    if relative < 0 {
        return None;
    }
    let code = (relative >> CODE_NUMBER_SHIFT) as usize;
    let pc_offset = (relative & ((1 << CODE_NUMBER_SHIFT) - 1)) as u32;
    (code < MAX_CODES).then_some((code, pc_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_addresses_round_trip() {
        let address = encode_return_address(3, 0x1234);
        assert_eq!(decode_return_address(address), Some((3, 0x1234)));
        assert_eq!(decode_return_address(HOST_RETURN), None);
        assert!(i32::try_from(encode_return_address(MAX_CODES - 1, 0xf_ffff)).is_ok());
    }

    #[test]
    fn constants_are_canonical_and_smis_are_immediate() {
        let mut sim = Simulator::new(Arch::Ia32, Arc::new(ClassTable::new()));
        assert_eq!(sim.constant(&ConstValue::Int(21)), tag_smi(21));
        let big = sim.constant(&ConstValue::Int(1 << 40));
        assert_eq!(sim.class_id_of(big).unwrap(), cid::MINT);
        assert_eq!(sim.int_value(big), Some(1 << 40));
        let a = sim.string("x");
        assert_eq!(sim.string("x"), a);
        assert_eq!(sim.string_value(a), Some("x"));
        let t = sim.bool_value(true);
        assert_eq!(sim.bool_of(t), Some(true));
        let d = sim.double(0.5).unwrap();
        assert_eq!(sim.double_value(d), Some(0.5));
    }
}
