//! Arch-neutral machine instructions and the assembler that lays them out.
//!
//! Instruction selection happens in the compiler and the architecture
//! backends, which only emit operations the target can express directly
//! (or, for a few x86 conveniences such as memory operands on `Exchange`,
//! only on the architectures that have them). Encoding is a black box:
//! each instruction occupies a plausible number of bytes for its
//! architecture so that PC offsets in metadata tables are meaningful,
//! but the bytes themselves are opaque.

use crate::{
    compiled_code::{ObjectPoolBuilder, PoolEntry},
    isa::{Arch, FpuRegister, Register, RegisterConventions},
    stubs::CallTarget,
};
use cranelift_entity::{EntityRef, PrimaryMap};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

ember_core::entity_ref! {
    pub struct Label;
}

/// A memory operand: `base + index << scale + disp`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Register,
    pub index: Option<(Register, u8)>,
    pub disp: i32,
}

impl Address {
    pub fn new(base: Register, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Register, index: Register, scale_log2: u8, disp: i32) -> Self {
        Self {
            base,
            index: Some((index, scale_log2)),
            disp,
        }
    }

    pub fn offset_by(self, bytes: i32) -> Self {
        Self {
            disp: self.disp + bytes,
            ..self
        }
    }

    fn registers(&self) -> impl Iterator<Item = Register> + '_ {
        std::iter::once(self.base).chain(self.index.map(|(r, _)| r))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Register),
    Imm(i64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    /// Signed multiply; sets the overflow flag when the product does not
    /// fit in a word.
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    /// Arithmetic shift right.
    Sar,
    /// Logical shift right.
    Shr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FpuOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Branch conditions. After `Test` or an ALU operation, `Equal` and
/// `NotEqual` test for a zero result. After `FpuCompare`, only
/// `NotEqual` and `Unordered` hold for unordered operands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
    Overflow,
    NoOverflow,
    Unordered,
    Ordered,
}

impl Condition {
    pub fn negate(self) -> Condition {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterEqual,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
            Condition::GreaterEqual => Condition::Less,
            Condition::Below => Condition::AboveEqual,
            Condition::BelowEqual => Condition::Above,
            Condition::Above => Condition::BelowEqual,
            Condition::AboveEqual => Condition::Below,
            Condition::Overflow => Condition::NoOverflow,
            Condition::NoOverflow => Condition::Overflow,
            Condition::Unordered => Condition::Ordered,
            Condition::Ordered => Condition::Unordered,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::Equal => "eq",
            Condition::NotEqual => "ne",
            Condition::Less => "lt",
            Condition::LessEqual => "le",
            Condition::Greater => "gt",
            Condition::GreaterEqual => "ge",
            Condition::Below => "b",
            Condition::BelowEqual => "be",
            Condition::Above => "a",
            Condition::AboveEqual => "ae",
            Condition::Overflow => "vs",
            Condition::NoOverflow => "vc",
            Condition::Unordered => "uo",
            Condition::Ordered => "ord",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MachInst {
    /// Zero-sized marker where a label is bound.
    Bind(Label),
    Move {
        dst: Register,
        src: Register,
    },
    LoadImmediate {
        dst: Register,
        imm: i64,
    },
    /// Loads entry `index` of the object pool through the pool pointer.
    LoadFromPool {
        dst: Register,
        index: u32,
    },
    /// Loads an object embedded in the instruction stream (IA32).
    LoadEmbedded {
        dst: Register,
        index: u32,
    },
    /// Materializes the pool pointer of the current code.
    LoadPoolPointer(Register),
    Load {
        dst: Register,
        addr: Address,
    },
    Store {
        src: Register,
        addr: Address,
    },
    LoadAbsolute {
        dst: Register,
        address: i64,
    },
    Push(Register),
    PushImmediate(i64),
    /// Pushes an object embedded in the instruction stream (IA32).
    PushEmbedded(u32),
    Pop(Register),
    Alu {
        op: AluOp,
        dst: Register,
        src: Operand,
    },
    Shift {
        op: ShiftOp,
        dst: Register,
        count: Operand,
    },
    /// Truncating signed division of `dst` by `src`, leaving the quotient
    /// or the remainder in `dst`.
    Div {
        dst: Register,
        src: Register,
        remainder: bool,
    },
    Neg(Register),
    Not(Register),
    Compare {
        lhs: Register,
        rhs: Operand,
    },
    /// Compares against an object embedded in the instruction stream
    /// (IA32).
    CompareEmbedded {
        lhs: Register,
        index: u32,
    },
    Test {
        lhs: Register,
        rhs: Operand,
    },
    /// Swaps a register with a memory word (x86).
    Exchange {
        reg: Register,
        addr: Address,
    },
    ExchangeRegs(Register, Register),
    LoadFpu {
        dst: FpuRegister,
        addr: Address,
    },
    StoreFpu {
        src: FpuRegister,
        addr: Address,
    },
    MoveFpu {
        dst: FpuRegister,
        src: FpuRegister,
    },
    LoadFpuImmediate {
        dst: FpuRegister,
        bits: u64,
    },
    FpuAlu {
        op: FpuOp,
        dst: FpuRegister,
        src: FpuRegister,
    },
    FpuCompare {
        lhs: FpuRegister,
        rhs: FpuRegister,
    },
    /// Converts the untagged integer in `src`.
    IntToDouble {
        dst: FpuRegister,
        src: Register,
    },
    Jump(Label),
    BranchIf {
        cond: Condition,
        target: Label,
    },
    Call(CallTarget),
    TailCall(CallTarget),
    Ret,
    Breakpoint,
}

fn imm_bytes(imm: i64) -> u32 {
    if i8::try_from(imm).is_ok() {
        1
    } else if i32::try_from(imm).is_ok() {
        4
    } else {
        8
    }
}

fn disp_bytes(addr: &Address) -> u32 {
    match addr.disp {
        0 => 0,
        d if i8::try_from(d).is_ok() => 1,
        _ => 4,
    }
}

impl MachInst {
    /// Size of the instruction in bytes on `arch`.
    pub fn encoded_len(&self, arch: Arch) -> u32 {
        match arch {
            Arch::Arm => self.arm_len(),
            Arch::Ia32 => self.x86_len(false),
            Arch::X64 => self.x86_len(true),
        }
    }

    fn arm_len(&self) -> u32 {
        match self {
            MachInst::Bind(_) => 0,
            MachInst::LoadImmediate { imm, .. } if !(0..=0xffff).contains(imm) => 8,
            MachInst::LoadFromPool { index, .. } if *index >= 1024 => 8,
            MachInst::Load { addr, .. } | MachInst::Store { src: _, addr }
                if addr.disp.unsigned_abs() >= 4096 =>
            {
                8
            }
            MachInst::LoadFpuImmediate { .. } | MachInst::LoadAbsolute { .. } => 8,
            // ldr ip, [pp, #off]; blx ip
            MachInst::Call(CallTarget::Stub(_) | CallTarget::Runtime(_))
            | MachInst::TailCall(CallTarget::Stub(_) | CallTarget::Runtime(_)) => 8,
            MachInst::Div { remainder: true, .. } => 12,
            MachInst::Div { .. } => 4,
            MachInst::PushImmediate(_) => 8,
            _ => 4,
        }
    }

    fn x86_len(&self, wide: bool) -> u32 {
        let rex = u32::from(wide);
        match self {
            MachInst::Bind(_) => 0,
            MachInst::Move { .. } => 2 + rex,
            MachInst::LoadImmediate { imm, .. } => match imm_bytes(*imm) {
                8 if wide => 10,
                _ => 5 + rex,
            },
            MachInst::LoadFromPool { index, .. } => 3 + rex + if *index < 16 { 1 } else { 4 },
            MachInst::LoadEmbedded { .. } => 5,
            MachInst::LoadPoolPointer(_) => 7,
            MachInst::Load { addr, .. } | MachInst::Store { addr, .. } => {
                2 + rex + disp_bytes(addr) + u32::from(addr.index.is_some())
            }
            MachInst::LoadAbsolute { .. } => 6 + rex,
            MachInst::Push(Register(r)) | MachInst::Pop(Register(r)) => 1 + u32::from(*r >= 8),
            MachInst::PushImmediate(imm) => match imm_bytes(*imm) {
                1 => 2,
                _ => 5,
            },
            MachInst::PushEmbedded(_) => 5,
            MachInst::Alu { src, .. } | MachInst::Compare { rhs: src, .. } | MachInst::Test { rhs: src, .. } => {
                match src {
                    Operand::Reg(_) => 2 + rex,
                    Operand::Imm(imm) => 2 + rex + imm_bytes(*imm).min(4),
                }
            }
            MachInst::Shift { count, .. } => match count {
                Operand::Reg(_) => 2 + rex,
                Operand::Imm(_) => 3 + rex,
            },
            MachInst::Div { .. } => 5 + 2 * rex,
            MachInst::Neg(_) | MachInst::Not(_) => 2 + rex,
            MachInst::CompareEmbedded { .. } => 6,
            MachInst::Exchange { addr, .. } => 2 + rex + disp_bytes(addr),
            MachInst::ExchangeRegs(..) => 2 + rex,
            MachInst::LoadFpu { addr, .. } | MachInst::StoreFpu { addr, .. } => {
                4 + rex + disp_bytes(addr)
            }
            MachInst::MoveFpu { .. } | MachInst::FpuAlu { .. } | MachInst::FpuCompare { .. } => 4,
            MachInst::LoadFpuImmediate { .. } => 8,
            MachInst::IntToDouble { .. } => 4 + rex,
            MachInst::Jump(_) | MachInst::Call(_) | MachInst::TailCall(_) => 5,
            MachInst::BranchIf { .. } => 6,
            MachInst::Ret | MachInst::Breakpoint => 1,
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            MachInst::Bind(_) => 0x00,
            MachInst::Move { .. } => 0x01,
            MachInst::LoadImmediate { .. } => 0x02,
            MachInst::LoadFromPool { .. } => 0x03,
            MachInst::LoadEmbedded { .. } => 0x04,
            MachInst::LoadPoolPointer(_) => 0x05,
            MachInst::Load { .. } => 0x06,
            MachInst::Store { .. } => 0x07,
            MachInst::LoadAbsolute { .. } => 0x08,
            MachInst::Push(_) => 0x09,
            MachInst::PushImmediate(_) => 0x0a,
            MachInst::PushEmbedded(_) => 0x0b,
            MachInst::Pop(_) => 0x0c,
            MachInst::Alu { op, .. } => 0x10 + *op as u8,
            MachInst::Shift { op, .. } => 0x18 + *op as u8,
            MachInst::Div { .. } => 0x1c,
            MachInst::Neg(_) => 0x1d,
            MachInst::Not(_) => 0x1e,
            MachInst::Compare { .. } => 0x20,
            MachInst::CompareEmbedded { .. } => 0x21,
            MachInst::Test { .. } => 0x22,
            MachInst::Exchange { .. } => 0x23,
            MachInst::ExchangeRegs(..) => 0x24,
            MachInst::LoadFpu { .. } => 0x30,
            MachInst::StoreFpu { .. } => 0x31,
            MachInst::MoveFpu { .. } => 0x32,
            MachInst::LoadFpuImmediate { .. } => 0x33,
            MachInst::FpuAlu { op, .. } => 0x34 + *op as u8,
            MachInst::FpuCompare { .. } => 0x38,
            MachInst::IntToDouble { .. } => 0x39,
            MachInst::Jump(_) => 0x40,
            MachInst::BranchIf { cond, .. } => 0x41 + *cond as u8,
            MachInst::Call(_) => 0x50,
            MachInst::TailCall(_) => 0x51,
            MachInst::Ret => 0x52,
            MachInst::Breakpoint => 0xcc,
        }
    }

    /// Writes the (opaque) encoding of the instruction: an opcode byte
    /// followed by its operands, cut or padded to `encoded_len`.
    pub fn encode(&self, arch: Arch, out: &mut Vec<u8>) {
        let len = self.encoded_len(arch) as usize;
        if len == 0 {
            return;
        }
        let mut bytes: SmallVec<[u8; 16]> = SmallVec::new();
        bytes.push(self.opcode());
        let mut reg = |r: Register| bytes.push(r.0);
        match self {
            MachInst::Move { dst, src } => {
                reg(*dst);
                reg(*src);
            }
            MachInst::Load { dst: r, addr }
            | MachInst::Store { src: r, addr }
            | MachInst::Exchange { reg: r, addr } => {
                reg(*r);
                for r in addr.registers() {
                    reg(r);
                }
            }
            MachInst::Push(r) | MachInst::Pop(r) | MachInst::Neg(r) | MachInst::Not(r) => reg(*r),
            MachInst::Alu { dst, .. } | MachInst::Shift { dst, .. } => reg(*dst),
            _ => {}
        }
        let tail: Option<i64> = match self {
            MachInst::LoadImmediate { imm, .. } | MachInst::PushImmediate(imm) => Some(*imm),
            MachInst::LoadFromPool { index, .. }
            | MachInst::LoadEmbedded { index, .. }
            | MachInst::PushEmbedded(index)
            | MachInst::CompareEmbedded { index, .. } => Some(i64::from(*index)),
            MachInst::Load { addr, .. } | MachInst::Store { addr, .. } => Some(i64::from(addr.disp)),
            MachInst::Jump(label) | MachInst::BranchIf { target: label, .. } => {
                Some(label.index() as i64)
            }
            MachInst::LoadFpuImmediate { bits, .. } => Some(*bits as i64),
            _ => None,
        };
        if let Some(value) = tail {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.resize(len, 0x90);
        out.extend_from_slice(&bytes);
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(
            self,
            MachInst::Jump(_) | MachInst::TailCall(_) | MachInst::Ret
        )
    }

    pub fn display<'a>(&'a self, conventions: &'a RegisterConventions) -> DisplayInst<'a> {
        DisplayInst {
            inst: self,
            conv: conventions,
        }
    }
}

/// Formats an instruction with the register names of an architecture.
pub struct DisplayInst<'a> {
    inst: &'a MachInst,
    conv: &'a RegisterConventions,
}

impl DisplayInst<'_> {
    fn addr(&self, addr: &Address) -> String {
        let mut s = format!("[{}", self.conv.name(addr.base));
        if let Some((index, scale)) = addr.index {
            s.push_str(&format!(" + {} * {}", self.conv.name(index), 1 << scale));
        }
        match addr.disp {
            0 => {}
            d if d < 0 => s.push_str(&format!(" - {}", -i64::from(d))),
            d => s.push_str(&format!(" + {d}")),
        }
        s.push(']');
        s
    }

    fn operand(&self, op: &Operand) -> String {
        match op {
            Operand::Reg(r) => self.conv.name(*r).to_owned(),
            Operand::Imm(imm) => format!("#{imm}"),
        }
    }
}

impl Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let r = |reg: &Register| self.conv.name(*reg);
        let d = |reg: &FpuRegister| self.conv.fpu_name(*reg);
        match self.inst {
            MachInst::Bind(label) => write!(f, "L{}:", label.index()),
            MachInst::Move { dst, src } => write!(f, "mov {}, {}", r(dst), r(src)),
            MachInst::LoadImmediate { dst, imm } => write!(f, "mov {}, #{imm}", r(dst)),
            MachInst::LoadFromPool { dst, index } => write!(f, "ldr {}, pool[{index}]", r(dst)),
            MachInst::LoadEmbedded { dst, index } => write!(f, "mov {}, object[{index}]", r(dst)),
            MachInst::LoadPoolPointer(dst) => write!(f, "ldpp {}", r(dst)),
            MachInst::Load { dst, addr } => write!(f, "ldr {}, {}", r(dst), self.addr(addr)),
            MachInst::Store { src, addr } => write!(f, "str {}, {}", r(src), self.addr(addr)),
            MachInst::LoadAbsolute { dst, address } => write!(f, "ldr {}, [{address:#x}]", r(dst)),
            MachInst::Push(src) => write!(f, "push {}", r(src)),
            MachInst::PushImmediate(imm) => write!(f, "push #{imm}"),
            MachInst::PushEmbedded(index) => write!(f, "push object[{index}]"),
            MachInst::Pop(dst) => write!(f, "pop {}", r(dst)),
            MachInst::Alu { op, dst, src } => {
                let name = match op {
                    AluOp::Add => "add",
                    AluOp::Sub => "sub",
                    AluOp::Mul => "mul",
                    AluOp::And => "and",
                    AluOp::Or => "or",
                    AluOp::Xor => "xor",
                };
                write!(f, "{name} {}, {}", r(dst), self.operand(src))
            }
            MachInst::Shift { op, dst, count } => {
                let name = match op {
                    ShiftOp::Shl => "shl",
                    ShiftOp::Sar => "sar",
                    ShiftOp::Shr => "shr",
                };
                write!(f, "{name} {}, {}", r(dst), self.operand(count))
            }
            MachInst::Div {
                dst,
                src,
                remainder,
            } => {
                let name = if *remainder { "rem" } else { "div" };
                write!(f, "{name} {}, {}", r(dst), r(src))
            }
            MachInst::Neg(reg) => write!(f, "neg {}", r(reg)),
            MachInst::Not(reg) => write!(f, "not {}", r(reg)),
            MachInst::Compare { lhs, rhs } => write!(f, "cmp {}, {}", r(lhs), self.operand(rhs)),
            MachInst::CompareEmbedded { lhs, index } => {
                write!(f, "cmp {}, object[{index}]", r(lhs))
            }
            MachInst::Test { lhs, rhs } => write!(f, "test {}, {}", r(lhs), self.operand(rhs)),
            MachInst::Exchange { reg, addr } => write!(f, "xchg {}, {}", r(reg), self.addr(addr)),
            MachInst::ExchangeRegs(a, b) => write!(f, "xchg {}, {}", r(a), r(b)),
            MachInst::LoadFpu { dst, addr } => write!(f, "fld {}, {}", d(dst), self.addr(addr)),
            MachInst::StoreFpu { src, addr } => write!(f, "fst {}, {}", d(src), self.addr(addr)),
            MachInst::MoveFpu { dst, src } => write!(f, "fmov {}, {}", d(dst), d(src)),
            MachInst::LoadFpuImmediate { dst, bits } => {
                write!(f, "fmov {}, #{}", d(dst), f64::from_bits(*bits))
            }
            MachInst::FpuAlu { op, dst, src } => {
                let name = match op {
                    FpuOp::Add => "fadd",
                    FpuOp::Sub => "fsub",
                    FpuOp::Mul => "fmul",
                    FpuOp::Div => "fdiv",
                };
                write!(f, "{name} {}, {}", d(dst), d(src))
            }
            MachInst::FpuCompare { lhs, rhs } => write!(f, "fcmp {}, {}", d(lhs), d(rhs)),
            MachInst::IntToDouble { dst, src } => write!(f, "cvt {}, {}", d(dst), r(src)),
            MachInst::Jump(label) => write!(f, "b L{}", label.index()),
            MachInst::BranchIf { cond, target } => {
                write!(f, "b{} L{}", cond.mnemonic(), target.index())
            }
            MachInst::Call(target) => write!(f, "call {}", display_target(target, self.conv)),
            MachInst::TailCall(target) => write!(f, "jmp {}", display_target(target, self.conv)),
            MachInst::Ret => write!(f, "ret"),
            MachInst::Breakpoint => write!(f, "brk"),
        }
    }
}

fn display_target(target: &CallTarget, conv: &RegisterConventions) -> String {
    match target {
        CallTarget::Stub(stub) => format!("stub {stub}"),
        CallTarget::Runtime(entry) => format!("runtime {}", entry.name()),
        CallTarget::Function(function) => format!("function#{}", function.index()),
        CallTarget::Register(reg) => conv.name(*reg).to_owned(),
    }
}

/// Output of [`Assembler::finalize`].
#[derive(Clone, Debug)]
pub struct AssembledCode {
    pub insts: Vec<MachInst>,
    /// Byte offset of each instruction.
    pub offsets: Vec<u32>,
    pub code: Vec<u8>,
    /// Instruction index at which each label is bound.
    pub labels: Vec<u32>,
    pub object_pool: Vec<PoolEntry>,
}

/// Records instructions for one function and assigns them offsets.
pub struct Assembler {
    arch: Arch,
    insts: Vec<MachInst>,
    offsets: Vec<u32>,
    code_size: u32,
    labels: PrimaryMap<Label, Option<u32>>,
    pool: ObjectPoolBuilder,
}

impl Assembler {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            insts: Vec::new(),
            offsets: Vec::new(),
            code_size: 0,
            labels: PrimaryMap::new(),
            pool: ObjectPoolBuilder::default(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn conventions(&self) -> &'static RegisterConventions {
        self.arch.conventions()
    }

    /// Appends an instruction, returning its index.
    pub fn emit(&mut self, inst: MachInst) -> usize {
        let index = self.insts.len();
        self.offsets.push(self.code_size);
        self.code_size += inst.encoded_len(self.arch);
        self.insts.push(inst);
        index
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None)
    }

    pub fn bind(&mut self, label: Label) {
        assert!(
            self.labels[label].is_none(),
            "label L{} bound twice",
            label.index()
        );
        self.labels[label] = Some(self.insts.len() as u32);
        self.emit(MachInst::Bind(label));
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label].is_some()
    }

    /// Current offset in bytes; the return address of a call just emitted.
    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    pub fn instruction_count(&self) -> usize {
        self.insts.len()
    }

    pub fn last_instruction(&self) -> Option<&MachInst> {
        self.insts.last()
    }

    /// Index of `entry` in the object pool, adding it if needed.
    pub fn object_index(&mut self, entry: PoolEntry) -> u32 {
        self.pool.add(entry)
    }

    pub fn finalize(self) -> AssembledCode {
        let mut code = Vec::with_capacity(self.code_size as usize);
        for inst in &self.insts {
            inst.encode(self.arch, &mut code);
        }
        debug_assert_eq!(code.len(), self.code_size as usize);

        let labels = self
            .labels
            .iter()
            .map(|(label, pos)| {
                pos.unwrap_or_else(|| panic!("label L{} used but never bound", label.index()))
            })
            .collect();
        AssembledCode {
            insts: self.insts,
            offsets: self.offsets,
            code,
            labels,
            object_pool: self.pool.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::StubId;

    #[test]
    fn offsets_follow_encoded_lengths() {
        let mut asm = Assembler::new(Arch::X64);
        let conv = asm.conventions();
        let label = asm.new_label();
        asm.emit(MachInst::Push(conv.fp));
        asm.emit(MachInst::Move {
            dst: conv.fp,
            src: conv.sp,
        });
        asm.bind(label);
        asm.emit(MachInst::Call(CallTarget::Stub(StubId::Deoptimize)));
        assert_eq!(asm.code_size(), 1 + 3 + 5);

        let code = asm.finalize();
        assert_eq!(code.offsets, vec![0, 1, 4, 4]);
        assert_eq!(code.code.len(), 9);
        assert_eq!(code.labels, vec![2]);
    }

    #[test]
    fn arm_instructions_are_word_sized() {
        let conv = Arch::Arm.conventions();
        let load = MachInst::Load {
            dst: Register(0),
            addr: Address::new(conv.fp, -12),
        };
        assert_eq!(load.encoded_len(Arch::Arm), 4);
        assert_eq!(
            MachInst::LoadImmediate {
                dst: Register(0),
                imm: 1 << 20
            }
            .encoded_len(Arch::Arm),
            8
        );
        assert_eq!(load.display(conv).to_string(), "ldr r0, [fp - 12]");
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn unbound_labels_are_rejected() {
        let mut asm = Assembler::new(Arch::Ia32);
        let label = asm.new_label();
        asm.emit(MachInst::Jump(label));
        asm.finalize();
    }
}
