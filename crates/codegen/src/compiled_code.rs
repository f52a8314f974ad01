//! Machine code together with the metadata tables the runtime consumes.

use crate::{
    assembler::{AssembledCode, MachInst},
    deopt::DeoptTable,
    isa::Arch,
    stubs::StubId,
};
use compact_str::CompactString;
use ember_core::HashMap;
use ember_il::{
    DeoptId,
    feedback::ArgumentsDescriptor,
    ir::{ConstValue, TokenPos},
    object_model::FunctionId,
};
use std::fmt::Write;

/// An object referenced by generated code. On ARM and X64 these live in
/// the object pool addressed through the pool pointer; on IA32 they are
/// embedded in the instruction stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PoolEntry {
    Object(ConstValue),
    Function(FunctionId),
    ArgsDesc(ArgumentsDescriptor),
    /// Inline cache data of an instance call site.
    ICData {
        selector: CompactString,
        args_desc: ArgumentsDescriptor,
        num_args_tested: u8,
        deopt_id: DeoptId,
    },
    MegamorphicCache {
        selector: CompactString,
        args_desc: ArgumentsDescriptor,
    },
    /// Target description of a precompiled-mode call site, replaced by the
    /// runtime as the site is linked.
    UnlinkedCall {
        selector: CompactString,
        args_desc: ArgumentsDescriptor,
    },
    /// A per-site subtype test cache.
    SubtypeTestCache(u32),
    Stub(StubId),
}

/// Deduplicating builder for the object pool.
#[derive(Default)]
pub struct ObjectPoolBuilder {
    entries: Vec<PoolEntry>,
    index: HashMap<PoolEntry, u32>,
}

impl ObjectPoolBuilder {
    pub fn add(&mut self, entry: PoolEntry) -> u32 {
        if let Some(&index) = self.index.get(&entry) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.entries.push(entry.clone());
        self.index.insert(entry, index);
        index
    }

    pub fn finish(self) -> Vec<PoolEntry> {
        self.entries
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PcDescriptorKind {
    /// Return address of an instance call through an inline cache.
    IcCall,
    /// Return address of a static call in unoptimized code.
    UnoptStaticCall,
    /// Return address of any other call to Dart code or a stub.
    OtherCall,
    RuntimeCall,
    /// Point after a call where unoptimized code resumes on
    /// deoptimization.
    Deopt,
    OsrEntry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcDescriptor {
    pub kind: PcDescriptorKind,
    pub pc_offset: u32,
    pub deopt_id: Option<DeoptId>,
    pub token_pos: TokenPos,
    /// Innermost try block enclosing the call, used to find the handler
    /// when the callee throws.
    pub try_index: Option<u32>,
}

/// A direct call whose target must be patched in when the callee's code
/// changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticCallEntry {
    pub pc_offset: u32,
    pub target: FunctionId,
}

/// Tagged frame slots live at a call's return address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackMap {
    pub pc_offset: u32,
    /// Bit `k` covers spill slot `k`, counted down from the first local.
    pub spill_slots: Vec<bool>,
    /// Number of outgoing argument words pushed below the spill area, all
    /// tagged.
    pub outgoing_arguments: u32,
}

impl StackMap {
    pub fn is_tagged(&self, spill_slot: u32) -> bool {
        self.spill_slots
            .get(spill_slot as usize)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchEntry {
    pub try_index: u32,
    pub handler_pc_offset: u32,
}

#[derive(Clone, Debug)]
pub struct CompiledCode {
    pub function: FunctionId,
    pub arch: Arch,
    pub insts: Vec<MachInst>,
    pub offsets: Vec<u32>,
    pub code: Vec<u8>,
    pub labels: Vec<u32>,
    pub object_pool: Vec<PoolEntry>,
    pub pc_descriptors: Vec<PcDescriptor>,
    pub static_calls: Vec<StaticCallEntry>,
    pub stack_maps: Vec<StackMap>,
    pub deopt_table: DeoptTable,
    pub catch_entries: Vec<CatchEntry>,
    /// Number of spill slots below the fixed part of the frame.
    pub spill_slot_count: u32,
    pub osr_entry_pc_offset: Option<u32>,
}

impl CompiledCode {
    pub(crate) fn new(
        function: FunctionId,
        arch: Arch,
        assembled: AssembledCode,
        metadata: CodeMetadata,
    ) -> Self {
        Self {
            function,
            arch,
            insts: assembled.insts,
            offsets: assembled.offsets,
            code: assembled.code,
            labels: assembled.labels,
            object_pool: assembled.object_pool,
            pc_descriptors: metadata.pc_descriptors,
            static_calls: metadata.static_calls,
            stack_maps: metadata.stack_maps,
            deopt_table: metadata.deopt_table,
            catch_entries: metadata.catch_entries,
            spill_slot_count: metadata.spill_slot_count,
            osr_entry_pc_offset: metadata.osr_entry_pc_offset,
        }
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Index of the instruction starting at `pc_offset`.
    pub fn instruction_at(&self, pc_offset: u32) -> Option<usize> {
        let index = self.offsets.partition_point(|&offset| offset < pc_offset);
        // Zero-sized label markers share the offset of what follows them.
        (index < self.offsets.len() && self.offsets[index] == pc_offset).then_some(index)
    }

    pub fn descriptor_at(&self, pc_offset: u32, kind: PcDescriptorKind) -> Option<&PcDescriptor> {
        self.pc_descriptors
            .iter()
            .find(|d| d.pc_offset == pc_offset && d.kind == kind)
    }

    /// The call descriptor recorded at a return address.
    pub fn call_descriptor_at(&self, pc_offset: u32) -> Option<&PcDescriptor> {
        self.pc_descriptors.iter().find(|d| {
            d.pc_offset == pc_offset
                && !matches!(d.kind, PcDescriptorKind::Deopt | PcDescriptorKind::OsrEntry)
        })
    }

    pub fn stack_map_at(&self, pc_offset: u32) -> Option<&StackMap> {
        self.stack_maps.iter().find(|m| m.pc_offset == pc_offset)
    }

    pub fn handler_for(&self, try_index: u32) -> Option<u32> {
        self.catch_entries
            .iter()
            .find(|c| c.try_index == try_index)
            .map(|c| c.handler_pc_offset)
    }

    /// Renders the instruction listing with offsets and metadata markers.
    pub fn disassemble(&self) -> String {
        let conv = self.arch.conventions();
        let mut out = String::new();
        for (inst, &offset) in self.insts.iter().zip(&self.offsets) {
            if let MachInst::Bind(_) = inst {
                let _ = writeln!(out, "{}", inst.display(conv));
                continue;
            }
            let _ = write!(out, "{offset:6}    {}", inst.display(conv));
            let end = offset + inst.encoded_len(self.arch);
            for desc in self.pc_descriptors.iter().filter(|d| d.pc_offset == end) {
                let _ = write!(out, "  ; {:?}", desc.kind);
                if let Some(id) = desc.deopt_id {
                    let _ = write!(out, " deopt {id}");
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Metadata collected by the compiler while emitting code.
#[derive(Default)]
pub(crate) struct CodeMetadata {
    pub pc_descriptors: Vec<PcDescriptor>,
    pub static_calls: Vec<StaticCallEntry>,
    pub stack_maps: Vec<StackMap>,
    pub deopt_table: DeoptTable,
    pub catch_entries: Vec<CatchEntry>,
    pub spill_slot_count: u32,
    pub osr_entry_pc_offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_entries_are_deduplicated() {
        let mut pool = ObjectPoolBuilder::default();
        let a = pool.add(PoolEntry::Object(ConstValue::Double(1.5)));
        let b = pool.add(PoolEntry::Object(ConstValue::Null));
        assert_eq!(pool.add(PoolEntry::Object(ConstValue::Double(1.5))), a);
        assert_ne!(a, b);
        assert_eq!(pool.add(PoolEntry::SubtypeTestCache(0)), 2);
        assert_eq!(pool.add(PoolEntry::SubtypeTestCache(1)), 3);
        assert_eq!(pool.finish().len(), 4);
    }
}
