//! Target architectures and their register conventions.

use std::fmt::{self, Display, Formatter};

/// An architecture the optimizing compiler can target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit ARM with VFP.
    Arm,
    /// 32-bit x86 with SSE2.
    Ia32,
    X64,
}

impl Arch {
    pub const ALL: [Arch; 3] = [Arch::Arm, Arch::Ia32, Arch::X64];

    /// Gets the architecture of the current system, if it is one we
    /// generate code for.
    #[allow(unreachable_code)]
    pub fn native() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            return Some(Arch::X64);
        }
        #[cfg(target_arch = "x86")]
        {
            return Some(Arch::Ia32);
        }
        #[cfg(target_arch = "arm")]
        {
            return Some(Arch::Arm);
        }
        None
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Ia32 => "ia32",
            Arch::X64 => "x64",
        }
    }

    /// Size of a machine word (and of a tagged value) in bytes.
    pub fn word_size(self) -> u32 {
        match self {
            Arch::Arm | Arch::Ia32 => 4,
            Arch::X64 => 8,
        }
    }

    pub fn word_bits(self) -> u32 {
        self.word_size() * 8
    }

    pub fn word_size_log2(self) -> u8 {
        self.word_size().trailing_zeros() as u8
    }

    /// Number of value bits of a smi on this architecture. One bit of the
    /// word is the tag and one is lost to the sign.
    pub fn smi_bits(self) -> u32 {
        self.word_bits() - 2
    }

    pub fn is_smi(self, value: i64) -> bool {
        let bits = self.smi_bits();
        (-(1i64 << bits)..(1i64 << bits)).contains(&value)
    }

    /// Whether objects are loaded through a pool register rather than
    /// embedded in the instruction stream.
    pub fn uses_object_pool(self) -> bool {
        self.conventions().pp.is_some()
    }

    pub fn conventions(self) -> &'static RegisterConventions {
        match self {
            Arch::Arm => &ARM,
            Arch::Ia32 => &IA32,
            Arch::X64 => &X64,
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A general purpose register, numbered as in the architecture's encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FpuRegister(pub u8);

/// Fixed register roles shared by generated code, stubs and the runtime.
#[derive(Debug)]
pub struct RegisterConventions {
    pub arch: Arch,
    pub register_names: &'static [&'static str],
    pub fpu_register_names: &'static [&'static str],
    /// Registers the compiler may assign to values, in preference order.
    pub allocatable: &'static [Register],
    pub allocatable_fpu: &'static [FpuRegister],
    /// Reserved scratch register, if the architecture has one to spare.
    pub tmp: Option<Register>,
    pub fpu_tmp: FpuRegister,
    pub fp: Register,
    pub sp: Register,
    /// Object pool pointer.
    pub pp: Option<Register>,
    /// Holds the return address on architectures whose calls do not
    /// push it.
    pub link: Option<Register>,
    pub result: Register,
    pub args_desc: Register,
    pub ic_data: Register,
    pub type_test_instance: Register,
    pub instantiator_type_args: Register,
    pub function_type_args: Register,
    pub subtype_test_cache: Register,
    pub subtype_test_cache_result: Register,
    /// Receives the stack trace on entry to an exception handler, next to
    /// the exception in `result`.
    pub stack_trace: Register,
}

impl RegisterConventions {
    pub fn name(&self, reg: Register) -> &'static str {
        self.register_names
            .get(reg.0 as usize)
            .copied()
            .unwrap_or("<bad register>")
    }

    pub fn fpu_name(&self, reg: FpuRegister) -> &'static str {
        self.fpu_register_names
            .get(reg.0 as usize)
            .copied()
            .unwrap_or("<bad fpu register>")
    }

    pub fn num_registers(&self) -> usize {
        self.register_names.len()
    }

    pub fn num_fpu_registers(&self) -> usize {
        self.fpu_register_names.len()
    }

    pub fn is_allocatable(&self, reg: Register) -> bool {
        self.allocatable.contains(&reg)
    }
}

const fn regs<const N: usize>(numbers: [u8; N]) -> [Register; N] {
    let mut out = [Register(0); N];
    let mut i = 0;
    while i < N {
        out[i] = Register(numbers[i]);
        i += 1;
    }
    out
}

const fn fpu_regs<const N: usize>(numbers: [u8; N]) -> [FpuRegister; N] {
    let mut out = [FpuRegister(0); N];
    let mut i = 0;
    while i < N {
        out[i] = FpuRegister(numbers[i]);
        i += 1;
    }
    out
}

const ARM_ALLOCATABLE: [Register; 9] = regs([0, 1, 2, 3, 4, 6, 7, 8, 9]);
const ARM_ALLOCATABLE_FPU: [FpuRegister; 14] = fpu_regs([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);

static ARM: RegisterConventions = RegisterConventions {
    arch: Arch::Arm,
    register_names: &[
        "r0", "r1", "r2", "r3", "r4", "pp", "r6", "r7", "r8", "r9", "thr", "fp", "ip", "sp", "lr",
        "pc",
    ],
    fpu_register_names: &[
        "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13",
        "d14", "d15",
    ],
    allocatable: &ARM_ALLOCATABLE,
    allocatable_fpu: &ARM_ALLOCATABLE_FPU,
    tmp: Some(Register(12)),
    fpu_tmp: FpuRegister(15),
    fp: Register(11),
    sp: Register(13),
    pp: Some(Register(5)),
    link: Some(Register(14)),
    result: Register(0),
    args_desc: Register(4),
    ic_data: Register(9),
    type_test_instance: Register(0),
    instantiator_type_args: Register(2),
    function_type_args: Register(1),
    subtype_test_cache: Register(3),
    subtype_test_cache_result: Register(8),
    stack_trace: Register(1),
};

const IA32_ALLOCATABLE: [Register; 6] = regs([0, 1, 2, 3, 6, 7]);
const IA32_ALLOCATABLE_FPU: [FpuRegister; 7] = fpu_regs([0, 1, 2, 3, 4, 5, 6]);

static IA32: RegisterConventions = RegisterConventions {
    arch: Arch::Ia32,
    register_names: &["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"],
    fpu_register_names: &["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"],
    allocatable: &IA32_ALLOCATABLE,
    allocatable_fpu: &IA32_ALLOCATABLE_FPU,
    tmp: None,
    fpu_tmp: FpuRegister(7),
    fp: Register(5),
    sp: Register(4),
    pp: None,
    link: None,
    result: Register(0),
    args_desc: Register(2),
    ic_data: Register(1),
    type_test_instance: Register(0),
    instantiator_type_args: Register(2),
    function_type_args: Register(1),
    subtype_test_cache: Register(6),
    subtype_test_cache_result: Register(3),
    stack_trace: Register(2),
};

const X64_ALLOCATABLE: [Register; 11] = regs([0, 1, 2, 3, 6, 7, 8, 9, 10, 12, 13]);
const X64_ALLOCATABLE_FPU: [FpuRegister; 15] =
    fpu_regs([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);

static X64: RegisterConventions = RegisterConventions {
    arch: Arch::X64,
    register_names: &[
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "tmp", "r12",
        "r13", "thr", "pp",
    ],
    fpu_register_names: &[
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
        "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
    ],
    allocatable: &X64_ALLOCATABLE,
    allocatable_fpu: &X64_ALLOCATABLE_FPU,
    tmp: Some(Register(11)),
    fpu_tmp: FpuRegister(15),
    fp: Register(5),
    sp: Register(4),
    pp: Some(Register(15)),
    link: None,
    result: Register(0),
    args_desc: Register(10),
    ic_data: Register(3),
    type_test_instance: Register(0),
    instantiator_type_args: Register(2),
    function_type_args: Register(1),
    subtype_test_cache: Register(9),
    subtype_test_cache_result: Register(8),
    stack_trace: Register(2),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_registers_are_not_allocatable() {
        for arch in Arch::ALL {
            let conv = arch.conventions();
            let reserved = [Some(conv.fp), Some(conv.sp), conv.pp, conv.tmp, conv.link];
            for reg in reserved.into_iter().flatten() {
                assert!(!conv.is_allocatable(reg), "{arch}: {} is reserved", conv.name(reg));
            }
            assert!(!conv.allocatable_fpu.contains(&conv.fpu_tmp));
            for role in [conv.result, conv.args_desc, conv.ic_data, conv.subtype_test_cache] {
                assert!(conv.is_allocatable(role), "{arch}: {}", conv.name(role));
            }
        }
    }

    #[test]
    fn smi_range_follows_the_word_size() {
        assert!(Arch::X64.is_smi(1 << 61));
        assert!(!Arch::Ia32.is_smi(1 << 30));
        assert!(Arch::Arm.is_smi(-(1 << 30)));
        assert!(!Arch::Arm.is_smi(-(1 << 30) - 1));
    }
}
