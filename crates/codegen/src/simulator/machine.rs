//! Register file, condition flags and word memory of the simulated target.
//!
//! Memory is a sparse map of aligned words covering three regions: the
//! stack, the heap and the word holding the stack limit. Any other access,
//! or a misaligned one, faults; a field access through an untagged
//! pointer is therefore caught.

use super::SimError;
use crate::{
    assembler::{Address, AluOp, Condition, FpuOp, MachInst, Operand, ShiftOp},
    backend::emitter_for,
    isa::{Arch, FpuRegister, Register, RegisterConventions},
    layout::{self, CLASS_ID_WORD, HEAP_OBJECT_TAG, STACK_LIMIT_ADDRESS},
    locations::Location,
};
use ember_core::{HashMap, HashSet};
use ember_il::object_model::ClassId;

/// Highest stack address (exclusive); the stack grows down from here.
pub const STACK_TOP: i64 = 0x1000_0000;
pub const STACK_SIZE: i64 = 0x10_0000;
pub const HEAP_BASE: i64 = 0x2000_0000;
pub const HEAP_SIZE: i64 = 0x1000_0000;

/// Distance between the lowest stack address and the initial limit.
const STACK_LIMIT_HEADROOM: i64 = 0x1000;

#[derive(Copy, Clone, Debug, Default)]
struct Flags {
    eq: bool,
    /// Signed less-than.
    lt: bool,
    /// Unsigned less-than.
    below: bool,
    overflow: bool,
    unordered: bool,
}

/// Objects a piece of code refers to, for the instructions that read
/// them without going through memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct CodeContext<'a> {
    pub pool_pointer: i64,
    /// Value of each object pool entry.
    pub objects: &'a [i64],
}

pub struct Machine {
    arch: Arch,
    conv: &'static RegisterConventions,
    regs: [i64; 16],
    fpu: [u64; 16],
    flags: Flags,
    memory: HashMap<i64, i64>,
    heap_top: i64,
    object_starts: HashSet<i64>,
}

impl Machine {
    pub fn new(arch: Arch) -> Self {
        let conv = arch.conventions();
        let ws = i64::from(arch.word_size());
        let mut machine = Self {
            arch,
            conv,
            regs: [0; 16],
            fpu: [0; 16],
            flags: Flags::default(),
            memory: HashMap::default(),
            heap_top: HEAP_BASE,
            object_starts: HashSet::default(),
        };
        // Leave room above fp for a caller's frame and below it for
        // spill slots that are written without a prologue.
        let fp = STACK_TOP - 64 * ws;
        machine.regs[conv.fp.0 as usize] = fp;
        machine.regs[conv.sp.0 as usize] = fp - 64 * ws;
        machine
            .memory
            .insert(STACK_LIMIT_ADDRESS, STACK_TOP - STACK_SIZE + STACK_LIMIT_HEADROOM);
        machine
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn conventions(&self) -> &'static RegisterConventions {
        self.conv
    }

    pub(super) fn word_size(&self) -> i64 {
        i64::from(self.arch.word_size())
    }

    /// Truncates `value` to a word and sign-extends it back.
    pub fn wrap(&self, value: i64) -> i64 {
        match self.arch.word_bits() {
            32 => value as i32 as i64,
            _ => value,
        }
    }

    fn fits(&self, value: i128) -> bool {
        let bits = self.arch.word_bits();
        let min = -(1i128 << (bits - 1));
        let max = (1i128 << (bits - 1)) - 1;
        (min..=max).contains(&value)
    }

    pub fn reg(&self, reg: Register) -> i64 {
        self.regs[reg.0 as usize]
    }

    pub fn set_reg(&mut self, reg: Register, value: i64) {
        self.regs[reg.0 as usize] = self.wrap(value);
    }

    pub fn fpu_bits(&self, reg: FpuRegister) -> u64 {
        self.fpu[reg.0 as usize]
    }

    pub fn fpu(&self, reg: FpuRegister) -> f64 {
        f64::from_bits(self.fpu_bits(reg))
    }

    pub fn set_fpu_bits(&mut self, reg: FpuRegister, bits: u64) {
        self.fpu[reg.0 as usize] = bits;
    }

    pub fn sp(&self) -> i64 {
        self.reg(self.conv.sp)
    }

    pub fn fp(&self) -> i64 {
        self.reg(self.conv.fp)
    }

    pub fn stack_limit(&self) -> i64 {
        self.memory.get(&STACK_LIMIT_ADDRESS).copied().unwrap_or(0)
    }

    pub fn set_stack_limit(&mut self, limit: i64) {
        self.memory.insert(STACK_LIMIT_ADDRESS, limit);
    }

    fn check_address(&self, address: i64) -> Result<(), SimError> {
        let in_stack = (STACK_TOP - STACK_SIZE..STACK_TOP).contains(&address);
        let in_heap = (HEAP_BASE..self.heap_top).contains(&address);
        let aligned = address % self.word_size() == 0;
        if aligned && (in_stack || in_heap || address == STACK_LIMIT_ADDRESS) {
            Ok(())
        } else {
            Err(SimError::Fault { address })
        }
    }

    pub fn load(&self, address: i64) -> Result<i64, SimError> {
        self.check_address(address)?;
        Ok(self.memory.get(&address).copied().unwrap_or(0))
    }

    pub fn store(&mut self, address: i64, value: i64) -> Result<(), SimError> {
        self.check_address(address)?;
        let value = self.wrap(value);
        self.memory.insert(address, value);
        Ok(())
    }

    /// Loads 64 bits; the low word comes first on 32-bit targets.
    pub fn load_u64(&self, address: i64) -> Result<u64, SimError> {
        if self.word_size() == 8 {
            return Ok(self.load(address)? as u64);
        }
        let low = self.load(address)? as u32;
        let high = self.load(address + 4)? as u32;
        Ok(u64::from(low) | (u64::from(high) << 32))
    }

    pub fn store_u64(&mut self, address: i64, bits: u64) -> Result<(), SimError> {
        if self.word_size() == 8 {
            return self.store(address, bits as i64);
        }
        self.store(address, i64::from(bits as u32 as i32))?;
        self.store(address + 4, i64::from((bits >> 32) as u32 as i32))
    }

    pub fn effective_address(&self, addr: &Address) -> i64 {
        let index = addr
            .index
            .map_or(0, |(reg, scale)| self.reg(reg) << scale);
        self.wrap(self.reg(addr.base) + index + i64::from(addr.disp))
    }

    pub fn push(&mut self, value: i64) -> Result<(), SimError> {
        let sp = self.sp() - self.word_size();
        self.store(sp, value)?;
        self.set_reg(self.conv.sp, sp);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<i64, SimError> {
        let sp = self.sp();
        let value = self.load(sp)?;
        self.set_reg(self.conv.sp, sp + self.word_size());
        Ok(value)
    }

    /// Allocates `words` zeroed words and returns their raw address.
    pub fn allocate_raw(&mut self, words: u32) -> Result<i64, SimError> {
        let address = self.heap_top;
        let end = address + i64::from(words.max(1)) * self.word_size();
        if end > HEAP_BASE + HEAP_SIZE {
            return Err(SimError::OutOfMemory);
        }
        self.heap_top = end;
        Ok(address)
    }

    /// Allocates an object of `words` words (header included) and returns
    /// its tagged pointer.
    pub fn allocate(&mut self, cid: ClassId, words: u32) -> Result<i64, SimError> {
        let address = self.allocate_raw(words)?;
        self.store(address, i64::from(cid))?;
        self.object_starts.insert(address);
        Ok(address + HEAP_OBJECT_TAG)
    }

    /// Whether `word` is a smi or points at an allocated object.
    pub fn is_valid_tagged(&self, word: i64) -> bool {
        layout::is_smi_word(word) || self.object_starts.contains(&(word - HEAP_OBJECT_TAG))
    }

    /// Byte address of word `word` of the object `object` points at.
    pub fn field_address(&self, object: i64, word: u32) -> i64 {
        object + i64::from(layout::field_offset(self.arch, word))
    }

    pub fn load_field(&self, object: i64, word: u32) -> Result<i64, SimError> {
        self.load(self.field_address(object, word))
    }

    pub fn store_field(&mut self, object: i64, word: u32, value: i64) -> Result<(), SimError> {
        self.store(self.field_address(object, word), value)
    }

    /// Class id of any tagged value.
    pub fn class_id_of(&self, value: i64) -> Result<ClassId, SimError> {
        if layout::is_smi_word(value) {
            return Ok(ember_il::object_model::cid::SMI);
        }
        Ok(self.load_field(value, CLASS_ID_WORD)? as ClassId)
    }

    fn slot_address(&self, index: i32) -> i64 {
        self.fp() + i64::from(index) * self.word_size()
    }

    /// Writes a register or an FP-relative frame slot. Doubles are given
    /// by their bits.
    pub fn write_location(&mut self, loc: Location, value: i64) {
        let result = match loc {
            Location::Register(reg) => {
                self.set_reg(reg, value);
                Ok(())
            }
            Location::FpuRegister(reg) => {
                self.set_fpu_bits(reg, value as u64);
                Ok(())
            }
            Location::StackSlot(index) => self.store(self.slot_address(index), value),
            Location::DoubleStackSlot(index) => {
                self.store_u64(self.slot_address(index), value as u64)
            }
            other => panic!("cannot write {other:?}"),
        };
        result.unwrap_or_else(|err| panic!("writing {loc:?}: {err}"));
    }

    pub fn read_location(&self, loc: Location) -> i64 {
        let result = match loc {
            Location::Register(reg) => Ok(self.reg(reg)),
            Location::FpuRegister(reg) => Ok(self.fpu_bits(reg) as i64),
            Location::StackSlot(index) => self.load(self.slot_address(index)),
            Location::DoubleStackSlot(index) => {
                self.load_u64(self.slot_address(index)).map(|bits| bits as i64)
            }
            other => panic!("cannot read {other:?}"),
        };
        result.unwrap_or_else(|err| panic!("reading {loc:?}: {err}"))
    }

    /// Executes instructions that do not transfer control, as found in a
    /// parallel move sequence. Panics on anything else.
    pub fn run_straight_line(&mut self, insts: &[MachInst]) {
        for inst in insts {
            match self.execute(inst, CodeContext::default()) {
                Ok(true) => {}
                Ok(false) => panic!("control transfer in straight-line code: {inst:?}"),
                Err(err) => panic!("{err} executing {inst:?}"),
            }
        }
    }

    fn operand(&self, op: Operand) -> i64 {
        match op {
            Operand::Reg(reg) => self.reg(reg),
            Operand::Imm(imm) => self.wrap(imm),
        }
    }

    fn set_result_flags(&mut self, result: i64, overflow: bool) {
        self.flags = Flags {
            eq: result == 0,
            lt: result < 0,
            below: false,
            overflow,
            unordered: false,
        };
    }

    fn compare(&mut self, a: i64, b: i64) {
        let (ua, ub) = match self.arch.word_bits() {
            32 => (u64::from(a as u32), u64::from(b as u32)),
            _ => (a as u64, b as u64),
        };
        self.flags = Flags {
            eq: a == b,
            lt: a < b,
            below: ua < ub,
            overflow: !self.fits(i128::from(a) - i128::from(b)),
            unordered: false,
        };
    }

    pub fn condition_holds(&self, cond: Condition) -> bool {
        let f = self.flags;
        if f.unordered {
            return matches!(cond, Condition::NotEqual | Condition::Unordered);
        }
        match cond {
            Condition::Equal => f.eq,
            Condition::NotEqual => !f.eq,
            Condition::Less => f.lt,
            Condition::LessEqual => f.lt || f.eq,
            Condition::Greater => !f.lt && !f.eq,
            Condition::GreaterEqual => !f.lt,
            Condition::Below => f.below,
            Condition::BelowEqual => f.below || f.eq,
            Condition::Above => !f.below && !f.eq,
            Condition::AboveEqual => !f.below,
            Condition::Overflow => f.overflow,
            Condition::NoOverflow => !f.overflow,
            Condition::Unordered => false,
            Condition::Ordered => true,
        }
    }

    fn alu(&self, op: AluOp, a: i64, b: i64) -> (i64, bool) {
        let (a, b) = (i128::from(a), i128::from(b));
        let exact = match op {
            AluOp::Add => a + b,
            AluOp::Sub => a - b,
            AluOp::Mul => a * b,
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
        };
        (self.wrap(exact as i64), !self.fits(exact))
    }

    fn shift(&self, op: ShiftOp, value: i64, count: i64) -> i64 {
        let bits = self.arch.word_bits();
        let count = match self.arch {
            // x86 masks the count to the operand width.
            Arch::Ia32 | Arch::X64 => (count as u32) & (bits - 1),
            // ARM uses the low byte; larger counts shift everything out.
            Arch::Arm => {
                let count = (count as u32) & 0xff;
                if count >= bits {
                    return match op {
                        ShiftOp::Sar => self.wrap(value) >> (bits - 1),
                        ShiftOp::Shl | ShiftOp::Shr => 0,
                    };
                }
                count
            }
        };
        if bits == 32 {
            let v = value as i32;
            match op {
                ShiftOp::Shl => i64::from(v.wrapping_shl(count)),
                ShiftOp::Sar => i64::from(v >> count),
                ShiftOp::Shr => i64::from(((v as u32) >> count) as i32),
            }
        } else {
            match op {
                ShiftOp::Shl => value.wrapping_shl(count),
                ShiftOp::Sar => value >> count,
                ShiftOp::Shr => ((value as u64) >> count) as i64,
            }
        }
    }

    /// Executes a data instruction. Returns `Ok(false)` for instructions
    /// that transfer control, which are left to the caller.
    pub fn execute(&mut self, inst: &MachInst, code: CodeContext<'_>) -> Result<bool, SimError> {
        let embedded = |index: u32| -> Result<i64, SimError> {
            code.objects
                .get(index as usize)
                .copied()
                .ok_or(SimError::BadObjectIndex(index))
        };
        match *inst {
            MachInst::Bind(_) => {}
            MachInst::Move { dst, src } => self.set_reg(dst, self.reg(src)),
            MachInst::LoadImmediate { dst, imm } => self.set_reg(dst, imm),
            MachInst::LoadFromPool { dst, index } => {
                let pp = self
                    .conv
                    .pp
                    .unwrap_or_else(|| panic!("{} has no object pool", self.arch));
                let value = self.load(self.reg(pp) + i64::from(index) * self.word_size())?;
                self.set_reg(dst, value);
            }
            MachInst::LoadEmbedded { dst, index } => self.set_reg(dst, embedded(index)?),
            MachInst::LoadPoolPointer(dst) => self.set_reg(dst, code.pool_pointer),
            MachInst::Load { dst, addr } => {
                let value = self.load(self.effective_address(&addr))?;
                self.set_reg(dst, value);
            }
            MachInst::Store { src, addr } => {
                self.store(self.effective_address(&addr), self.reg(src))?;
            }
            MachInst::LoadAbsolute { dst, address } => {
                let value = self.load(address)?;
                self.set_reg(dst, value);
            }
            MachInst::Push(src) => self.push(self.reg(src))?,
            MachInst::PushImmediate(imm) => self.push(imm)?,
            MachInst::PushEmbedded(index) => self.push(embedded(index)?)?,
            MachInst::Pop(dst) => {
                let value = self.pop()?;
                self.set_reg(dst, value);
            }
            MachInst::Alu { op, dst, src } => {
                let (result, overflow) = self.alu(op, self.reg(dst), self.operand(src));
                self.set_reg(dst, result);
                self.set_result_flags(result, overflow);
            }
            MachInst::Shift { op, dst, count } => {
                let result = self.shift(op, self.reg(dst), self.operand(count));
                self.set_reg(dst, result);
                self.set_result_flags(result, false);
            }
            MachInst::Div {
                dst,
                src,
                remainder,
            } => {
                let (a, b) = (self.reg(dst), self.reg(src));
                if b == 0 {
                    return Err(SimError::DivisionByZero);
                }
                let (quotient, rem) = match self.arch.word_bits() {
                    32 => {
                        let (a, b) = (a as i32, b as i32);
                        (i64::from(a.wrapping_div(b)), i64::from(a.wrapping_rem(b)))
                    }
                    _ => (a.wrapping_div(b), a.wrapping_rem(b)),
                };
                // x86 leaves the remainder in the high half register.
                if let Some((_, high)) = emitter_for(self.arch).division_registers() {
                    self.set_reg(high, rem);
                }
                self.set_reg(dst, if remainder { rem } else { quotient });
            }
            MachInst::Neg(reg) => {
                let value = self.reg(reg);
                let (result, overflow) = self.alu(AluOp::Sub, 0, value);
                self.set_reg(reg, result);
                self.set_result_flags(result, overflow);
            }
            MachInst::Not(reg) => self.set_reg(reg, !self.reg(reg)),
            MachInst::Compare { lhs, rhs } => self.compare(self.reg(lhs), self.operand(rhs)),
            MachInst::CompareEmbedded { lhs, index } => {
                self.compare(self.reg(lhs), embedded(index)?)
            }
            MachInst::Test { lhs, rhs } => {
                let result = self.reg(lhs) & self.operand(rhs);
                self.set_result_flags(result, false);
            }
            MachInst::Exchange { reg, addr } => {
                let address = self.effective_address(&addr);
                let value = self.load(address)?;
                self.store(address, self.reg(reg))?;
                self.set_reg(reg, value);
            }
            MachInst::ExchangeRegs(a, b) => {
                let (va, vb) = (self.reg(a), self.reg(b));
                self.set_reg(a, vb);
                self.set_reg(b, va);
            }
            MachInst::LoadFpu { dst, addr } => {
                let bits = self.load_u64(self.effective_address(&addr))?;
                self.set_fpu_bits(dst, bits);
            }
            MachInst::StoreFpu { src, addr } => {
                self.store_u64(self.effective_address(&addr), self.fpu_bits(src))?;
            }
            MachInst::MoveFpu { dst, src } => self.set_fpu_bits(dst, self.fpu_bits(src)),
            MachInst::LoadFpuImmediate { dst, bits } => self.set_fpu_bits(dst, bits),
            MachInst::FpuAlu { op, dst, src } => {
                let (a, b) = (self.fpu(dst), self.fpu(src));
                let result = match op {
                    FpuOp::Add => a + b,
                    FpuOp::Sub => a - b,
                    FpuOp::Mul => a * b,
                    FpuOp::Div => a / b,
                };
                self.set_fpu_bits(dst, result.to_bits());
            }
            MachInst::FpuCompare { lhs, rhs } => {
                let (a, b) = (self.fpu(lhs), self.fpu(rhs));
                self.flags = Flags {
                    eq: a == b,
                    lt: a < b,
                    below: a < b,
                    overflow: false,
                    unordered: a.is_nan() || b.is_nan(),
                };
            }
            MachInst::IntToDouble { dst, src } => {
                self.set_fpu_bits(dst, (self.reg(src) as f64).to_bits());
            }
            MachInst::Jump(_)
            | MachInst::BranchIf { .. }
            | MachInst::Call(_)
            | MachInst::TailCall(_)
            | MachInst::Ret
            | MachInst::Breakpoint => return Ok(false),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_wraps_to_the_word_size() {
        let mut m = Machine::new(Arch::Ia32);
        let r0 = Register(0);
        m.set_reg(r0, i64::from(i32::MAX));
        m.execute(
            &MachInst::Alu {
                op: AluOp::Add,
                dst: r0,
                src: Operand::Imm(1),
            },
            CodeContext::default(),
        )
        .unwrap();
        assert_eq!(m.reg(r0), i64::from(i32::MIN));
        assert!(m.condition_holds(Condition::Overflow));

        let mut m = Machine::new(Arch::X64);
        m.set_reg(r0, i64::from(i32::MAX));
        m.execute(
            &MachInst::Alu {
                op: AluOp::Add,
                dst: r0,
                src: Operand::Imm(1),
            },
            CodeContext::default(),
        )
        .unwrap();
        assert_eq!(m.reg(r0), i64::from(i32::MAX) + 1);
        assert!(m.condition_holds(Condition::NoOverflow));
    }

    #[test]
    fn unordered_compares_only_satisfy_not_equal() {
        let mut m = Machine::new(Arch::X64);
        m.set_fpu_bits(FpuRegister(0), f64::NAN.to_bits());
        m.set_fpu_bits(FpuRegister(1), 1.0f64.to_bits());
        m.execute(
            &MachInst::FpuCompare {
                lhs: FpuRegister(0),
                rhs: FpuRegister(1),
            },
            CodeContext::default(),
        )
        .unwrap();
        assert!(m.condition_holds(Condition::NotEqual));
        assert!(m.condition_holds(Condition::Unordered));
        for cond in [
            Condition::Equal,
            Condition::Less,
            Condition::Greater,
            Condition::GreaterEqual,
            Condition::Above,
        ] {
            assert!(!m.condition_holds(cond), "{cond:?}");
        }
    }

    #[test]
    fn misaligned_and_wild_accesses_fault() {
        let mut m = Machine::new(Arch::Arm);
        let object = m.allocate(7, 2).unwrap();
        assert!(m.is_valid_tagged(object));
        assert_eq!(m.load_field(object, 0).unwrap(), 7);
        // Forgetting the tag lands between words.
        assert!(matches!(m.load(object), Err(SimError::Fault { .. })));
        assert!(matches!(m.load(0x40), Err(SimError::Fault { .. })));
    }

    #[test]
    fn doubles_span_two_words_on_32_bit_targets() {
        let mut m = Machine::new(Arch::Ia32);
        let bits = 2.5f64.to_bits();
        m.write_location(Location::DoubleStackSlot(-4), bits as i64);
        assert_eq!(m.read_location(Location::StackSlot(-4)), i64::from(bits as u32 as i32));
        assert_eq!(m.read_location(Location::StackSlot(-3)), (bits >> 32) as i64);
        assert_eq!(m.read_location(Location::DoubleStackSlot(-4)) as u64, bits);
    }

    #[test]
    fn arm_shifts_by_large_counts_clear_the_register() {
        let mut m = Machine::new(Arch::Arm);
        let r1 = Register(1);
        m.set_reg(r1, 5);
        m.execute(
            &MachInst::Shift {
                op: ShiftOp::Shl,
                dst: r1,
                count: Operand::Imm(40),
            },
            CodeContext::default(),
        )
        .unwrap();
        assert_eq!(m.reg(r1), 0);
    }
}
