//! Prologue code that checks the caller's arguments descriptor against the
//! function's parameters and, for functions with optional parameters,
//! copies the arguments into the frame filling in defaults.

use super::{FlowGraphCompiler, SlowPath};
use crate::{
    assembler::{Address, AluOp, Condition, Label, MachInst, Operand, ShiftOp},
    compiled_code::PoolEntry,
    isa::Register,
    layout::{self, args_desc, tag_smi},
    parallel_move::load_constant,
};
use ember_il::ir::{ConstValue, Representation};

impl FlowGraphCompiler<'_> {
    fn no_such_method_label(&mut self) -> Label {
        if let Some(entry) = self.no_such_method {
            return entry;
        }
        let entry = self.asm.new_label();
        self.no_such_method = Some(entry);
        self.slow_paths.push(SlowPath::NoSuchMethod { entry });
        entry
    }

    /// Compares a smi field of the arguments descriptor with `expected`
    /// and goes to the noSuchMethod path when `mismatch` holds.
    fn check_descriptor_field(
        &mut self,
        scratch: Register,
        word: u32,
        expected: u32,
        mismatch: Condition,
    ) {
        self.emitter
            .load_field(&mut self.asm, scratch, self.conv.args_desc, word);
        self.asm.emit(MachInst::Compare {
            lhs: scratch,
            rhs: Operand::Imm(tag_smi(i64::from(expected))),
        });
        let target = self.no_such_method_label();
        self.asm.emit(MachInst::BranchIf {
            cond: mismatch,
            target,
        });
    }

    /// Closures are called without knowing their target, so even a
    /// closure with only fixed parameters validates its arguments.
    pub(super) fn check_argument_count(&mut self) {
        let [scratch] = self.free_registers(&[self.conv.args_desc]);
        let num_fixed = self.graph.function_info().num_fixed_parameters;
        self.check_descriptor_field(scratch, args_desc::COUNT_WORD, num_fixed, Condition::NotEqual);
        self.check_descriptor_field(scratch, args_desc::NAMED_COUNT_WORD, 0, Condition::NotEqual);
    }

    pub(super) fn copy_parameters(&mut self) {
        let graph = self.graph;
        let info = graph.function_info();
        let arch = self.arch;
        let desc = self.conv.args_desc;
        let [count, base, positional, value] = self.free_registers(&[desc]);
        let num_fixed = info.num_fixed_parameters;
        let num_opt_positional = info.optional_positional.len() as u32;

        self.check_descriptor_field(
            positional,
            args_desc::POSITIONAL_COUNT_WORD,
            info.min_positional_args(),
            Condition::Less,
        );
        self.asm.emit(MachInst::Compare {
            lhs: positional,
            rhs: Operand::Imm(tag_smi(i64::from(info.max_positional_args()))),
        });
        let nsm = self.no_such_method_label();
        self.asm.emit(MachInst::BranchIf {
            cond: Condition::Greater,
            target: nsm,
        });
        if info.optional_named.is_empty() {
            self.check_descriptor_field(value, args_desc::NAMED_COUNT_WORD, 0, Condition::NotEqual);
        }

        // Argument i is at fp + (1 + count - i) words; `base` holds
        // fp + count words.
        let smi_to_bytes = i64::from(arch.word_size_log2()) - i64::from(layout::SMI_TAG_SHIFT);
        self.emitter
            .load_field(&mut self.asm, count, desc, args_desc::COUNT_WORD);
        self.asm.emit(MachInst::Move {
            dst: base,
            src: count,
        });
        self.asm.emit(MachInst::Shift {
            op: ShiftOp::Shl,
            dst: base,
            count: Operand::Imm(smi_to_bytes),
        });
        self.asm.emit(MachInst::Alu {
            op: AluOp::Add,
            dst: base,
            src: Operand::Reg(self.conv.fp),
        });

        for index in 0..num_fixed {
            self.copy_argument(base, index, value);
        }
        for (j, default) in info.optional_positional.iter().enumerate() {
            let index = num_fixed + j as u32;
            let use_default = self.asm.new_label();
            let next = self.asm.new_label();
            self.asm.emit(MachInst::Compare {
                lhs: positional,
                rhs: Operand::Imm(tag_smi(i64::from(index))),
            });
            self.asm.emit(MachInst::BranchIf {
                cond: Condition::LessEqual,
                target: use_default,
            });
            self.copy_argument(base, index, value);
            self.asm.emit(MachInst::Jump(next));
            self.asm.bind(use_default);
            self.store_default(index, default, value);
            self.asm.bind(next);
        }

        if info.optional_named.is_empty() {
            return;
        }
        // Walk the descriptor's named entries, sorted by name like the
        // parameters, advancing past each one that matches.
        let entry = positional;
        let position = count;
        let ws = arch.word_size() as i32;
        let name_offset = layout::field_offset(
            arch,
            args_desc::FIRST_NAMED_WORD + args_desc::NAME_OFFSET_IN_ENTRY,
        );
        let position_offset = layout::field_offset(
            arch,
            args_desc::FIRST_NAMED_WORD + args_desc::POSITION_OFFSET_IN_ENTRY,
        );
        self.asm.emit(MachInst::Move {
            dst: entry,
            src: desc,
        });
        for d in info.sorted_named_parameters() {
            let param = &info.optional_named[d];
            let index = num_fixed + num_opt_positional + d as u32;
            let use_default = self.asm.new_label();
            let next = self.asm.new_label();
            self.asm.emit(MachInst::Load {
                dst: value,
                addr: Address::new(entry, name_offset),
            });
            self.emitter.compare_object(
                &mut self.asm,
                value,
                PoolEntry::Object(ConstValue::String(param.name.clone())),
            );
            self.asm.emit(MachInst::BranchIf {
                cond: Condition::NotEqual,
                target: use_default,
            });
            self.asm.emit(MachInst::Load {
                dst: position,
                addr: Address::new(entry, position_offset),
            });
            self.asm.emit(MachInst::Shift {
                op: ShiftOp::Shl,
                dst: position,
                count: Operand::Imm(smi_to_bytes),
            });
            self.asm.emit(MachInst::Move {
                dst: value,
                src: base,
            });
            self.asm.emit(MachInst::Alu {
                op: AluOp::Sub,
                dst: value,
                src: Operand::Reg(position),
            });
            self.asm.emit(MachInst::Load {
                dst: value,
                addr: Address::new(value, ws),
            });
            self.store_parameter(index, value);
            self.asm.emit(MachInst::Alu {
                op: AluOp::Add,
                dst: entry,
                src: Operand::Imm(i64::from(args_desc::NAMED_ENTRY_WORDS) * i64::from(ws)),
            });
            self.asm.emit(MachInst::Jump(next));
            self.asm.bind(use_default);
            self.store_default(index, &param.default, value);
            self.asm.bind(next);
        }
        // A named argument no parameter matched is left over.
        self.asm.emit(MachInst::Load {
            dst: value,
            addr: Address::new(entry, name_offset),
        });
        self.emitter.compare_object(
            &mut self.asm,
            value,
            PoolEntry::Object(ConstValue::Null),
        );
        let nsm = self.no_such_method_label();
        self.asm.emit(MachInst::BranchIf {
            cond: Condition::NotEqual,
            target: nsm,
        });
    }

    fn copy_argument(&mut self, base: Register, index: u32, scratch: Register) {
        let ws = self.arch.word_size() as i32;
        self.asm.emit(MachInst::Load {
            dst: scratch,
            addr: Address::new(base, (1 - index as i32) * ws),
        });
        self.store_parameter(index, scratch);
    }

    fn store_default(&mut self, index: u32, default: &ConstValue, scratch: Register) {
        load_constant(
            &mut self.asm,
            self.emitter,
            default,
            Representation::Tagged,
            scratch,
        );
        self.store_parameter(index, scratch);
    }

    fn store_parameter(&mut self, index: u32, src: Register) {
        let addr = self.frame.parameter_slot(index).stack_address(self.arch);
        self.asm.emit(MachInst::Store { src, addr });
    }
}
