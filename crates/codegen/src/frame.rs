//! Frame allocation: a home location for every SSA value.
//!
//! Values are kept in memory between instructions. Parameters stay in the
//! caller's outgoing argument area unless the prologue has to copy them
//! (optional parameters), constants have no home at all, and everything
//! else gets its own spill slot. Instructions that forward their input
//! unchanged share the input's home.

use crate::{
    CodegenError,
    compiled_code::StackMap,
    isa::Arch,
    layout::FrameLayout,
    locations::Location,
};
use cranelift_entity::SecondaryMap;
use ember_il::{
    FlowGraph, InstrId, InstrKind,
    ir::{BlockKind, Representation},
};
use tracing::trace;

/// Where the values of one flow graph live in its frame.
pub struct FrameAllocation {
    arch: Arch,
    layout: FrameLayout,
    homes: SecondaryMap<InstrId, Location>,
    /// Definitions that own a spill slot, in allocation order.
    spilled: Vec<InstrId>,
    spill_slot_count: u32,
    copies_parameters: bool,
    osr_local_count: u32,
}

impl FrameAllocation {
    pub fn allocate(graph: &FlowGraph, arch: Arch) -> Result<Self, CodegenError> {
        let info = graph.function_info();
        let layout = FrameLayout::for_arch(arch);
        let num_params = info.num_parameters();
        let copies_parameters = info.has_optional_parameters();
        let osr_local_count = osr_local_count(graph, num_params);

        let mut frame = FrameAllocation {
            arch,
            layout,
            homes: SecondaryMap::new(),
            spilled: Vec::new(),
            spill_slot_count: if copies_parameters { num_params } else { 0 } + osr_local_count,
            copies_parameters,
            osr_local_count,
        };

        for &block in graph.reverse_postorder() {
            let data = &graph.blocks[block];
            for &def in &data.initial_definitions {
                let home = match (&data.kind, &graph.instrs[def].kind) {
                    (_, InstrKind::Constant(_)) => Location::Constant(def),
                    (
                        BlockKind::FunctionEntry | BlockKind::OsrEntry,
                        InstrKind::Parameter(param),
                    ) => frame.parameter_home(param.index, num_params),
                    (BlockKind::CatchBlockEntry { .. }, InstrKind::Parameter(param))
                        if param.index < 2 =>
                    {
                        frame.new_spill_slot(graph, def)?
                    }
                    (kind, instr) => {
                        return Err(CodegenError::Unsupported {
                            arch,
                            what: format!("{} in {}", instr.name(), kind.name()).into(),
                        });
                    }
                };
                frame.homes[def] = home;
            }
            for &phi in &data.phis {
                frame.homes[phi] = frame.new_spill_slot(graph, phi)?;
            }
            for instr in graph.block_instrs(block) {
                let data = &graph.instrs[instr];
                if !data.is_definition() {
                    continue;
                }
                let home = match &data.kind {
                    InstrKind::Constant(_) => Location::Constant(instr),
                    InstrKind::MaterializeObject(_) => Location::Invalid,
                    _ if fuses_into_branch(graph, instr) => Location::Invalid,
                    kind => match forwarded_input(kind) {
                        Some(index) => frame.homes[graph.input_at(instr, index)],
                        None => frame.new_spill_slot(graph, instr)?,
                    },
                };
                frame.homes[instr] = home;
            }
        }
        trace!(
            function = graph.name(),
            spill_slots = frame.spill_slot_count,
            "allocated frame"
        );
        Ok(frame)
    }

    fn parameter_home(&self, index: u32, num_params: u32) -> Location {
        if index >= num_params {
            // Locals of the interrupted unoptimized frame.
            let base = if self.copies_parameters { num_params } else { 0 };
            return Location::StackSlot(self.slot_index(base + index - num_params));
        }
        if self.copies_parameters {
            Location::StackSlot(self.slot_index(index))
        } else {
            Location::StackSlot(self.layout.incoming_argument(index, num_params))
        }
    }

    fn slot_index(&self, spill_slot: u32) -> i32 {
        self.layout.first_local_from_fp - spill_slot as i32
    }

    fn new_spill_slot(&mut self, graph: &FlowGraph, def: InstrId) -> Result<Location, CodegenError> {
        let next = self.spill_slot_count;
        let location = match graph.instrs[def].representation {
            Representation::UnboxedDouble => {
                let words = 8 / self.arch.word_size();
                self.spill_slot_count += words;
                // The lower word has the lower address.
                Location::DoubleStackSlot(self.slot_index(next + words - 1))
            }
            Representation::UnboxedInt64 if self.arch.word_size() < 8 => {
                return Err(CodegenError::Unsupported {
                    arch: self.arch,
                    what: "unboxed int64 values".into(),
                });
            }
            _ => {
                self.spill_slot_count += 1;
                Location::StackSlot(self.slot_index(next))
            }
        };
        self.spilled.push(def);
        Ok(location)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn home(&self, def: InstrId) -> Location {
        self.homes[def]
    }

    pub fn spill_slot_count(&self) -> u32 {
        self.spill_slot_count
    }

    /// Whether the prologue copies parameters into spill slots.
    pub fn copies_parameters(&self) -> bool {
        self.copies_parameters
    }

    /// Home of parameter `index` after the prologue.
    pub fn parameter_slot(&self, index: u32) -> Location {
        Location::StackSlot(self.slot_index(index))
    }

    pub fn osr_local_count(&self) -> u32 {
        self.osr_local_count
    }

    /// Tagged spill slots holding live values at `at`, a call or a slow
    /// path of instruction `at`.
    pub fn stack_map(
        &self,
        graph: &FlowGraph,
        at: InstrId,
        pc_offset: u32,
        outgoing_arguments: u32,
    ) -> StackMap {
        let mut spill_slots = vec![false; self.spill_slot_count as usize];
        for &def in &self.spilled {
            if def == at || graph.instrs[def].representation != Representation::Tagged {
                continue;
            }
            if !graph.instr_dominates(def, at) {
                continue;
            }
            if let Some(slot) = self.homes[def].spill_slot_index(&self.layout) {
                spill_slots[slot as usize] = true;
            }
        }
        // Copied parameters are written by the prologue before any call.
        if self.copies_parameters {
            let params = graph.function_info().num_parameters();
            spill_slots[..params as usize].fill(true);
        }
        StackMap {
            pc_offset,
            spill_slots,
            outgoing_arguments,
        }
    }
}

/// Whether the comparison `instr` is emitted as part of the branch that
/// immediately follows it and consumes its only use. Such comparisons
/// never materialize a value.
pub(crate) fn fuses_into_branch(graph: &FlowGraph, instr: InstrId) -> bool {
    let data = &graph.instrs[instr];
    let fusable = match &data.kind {
        InstrKind::RelationalOp(_) | InstrKind::EqualityCompare(_) | InstrKind::TestCids(_) => true,
        InstrKind::StrictCompare(cmp) => !cmp.needs_number_check,
        _ => false,
    };
    if !fusable {
        return false;
    }
    let Some(next) = data.next.expand() else {
        return false;
    };
    matches!(graph.instrs[next].kind, InstrKind::Branch(_))
        && graph.input_at(next, 0) == instr
        && graph.all_uses(instr).len() == 1
}

/// Index of the input whose value an instruction passes through
/// unchanged, sharing its home.
fn forwarded_input(kind: &InstrKind) -> Option<usize> {
    match kind {
        InstrKind::MoveArgument(_) | InstrKind::AssertBoolean => Some(0),
        kind => kind.redefined_input(),
    }
}

fn osr_local_count(graph: &FlowGraph, num_params: u32) -> u32 {
    let Some(osr) = graph.graph_entry_data().osr_entry.expand() else {
        return 0;
    };
    graph.blocks[osr]
        .initial_definitions
        .iter()
        .filter_map(|&def| match &graph.instrs[def].kind {
            InstrKind::Parameter(param) if param.index >= num_params => {
                Some(param.index - num_params + 1)
            }
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_il::parser::parse_program;
    use indoc::indoc;

    fn find(graph: &FlowGraph, name: &str) -> InstrId {
        graph
            .instrs
            .keys()
            .find(|&i| graph.instrs[i].kind.name() == name)
            .unwrap_or_else(|| panic!("no {name} in graph"))
    }

    #[test]
    fn parameters_stay_in_the_callers_frame() {
        let program = parse_program(indoc! {"
            (graph add
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 binary_smi_op + v0 v1 noenv)
                    (v3 redefinition v2)
                    (return v3)))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let frame = FrameAllocation::allocate(graph, Arch::X64).unwrap();
        let params = &graph.blocks[graph.normal_entry().unwrap()].initial_definitions;
        assert_eq!(frame.home(params[0]), Location::StackSlot(3));
        assert_eq!(frame.home(params[1]), Location::StackSlot(2));

        let add = find(graph, "binary_smi_op");
        assert_eq!(frame.home(add), Location::StackSlot(-3));
        assert_eq!(frame.home(find(graph, "redefinition")), frame.home(add));
        assert_eq!(frame.spill_slot_count(), 1);
    }

    #[test]
    fn doubles_take_two_words_on_32_bit_targets() {
        let program = parse_program(indoc! {"
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 unbox double v0 noenv)
                    (v2 box double v1)
                    (return v2)))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let unbox = find(graph, "unbox");

        let ia32 = FrameAllocation::allocate(graph, Arch::Ia32).unwrap();
        assert_eq!(ia32.home(unbox), Location::DoubleStackSlot(-3));
        assert_eq!(ia32.home(find(graph, "box")), Location::StackSlot(-4));

        let x64 = FrameAllocation::allocate(graph, Arch::X64).unwrap();
        assert_eq!(x64.home(unbox), Location::DoubleStackSlot(-3));
        assert_eq!(x64.home(find(graph, "box")), Location::StackSlot(-4));
    }

    #[test]
    fn int64_values_need_a_64_bit_target() {
        let program = parse_program(indoc! {"
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 unbox int64 v0 noenv)
                    (v2 box int64 v1)
                    (return v2)))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        assert!(FrameAllocation::allocate(graph, Arch::X64).is_ok());
        assert!(matches!(
            FrameAllocation::allocate(graph, Arch::Arm),
            Err(CodegenError::Unsupported { arch: Arch::Arm, .. })
        ));
    }

    #[test]
    fn optional_parameters_are_copied_into_the_frame() {
        let program = parse_program(indoc! {"
            (program
                (function opt (fixed 1) (optional 7) static)
                (graph opt
                    (block B0 graph_entry)
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 parameter 1)
                        (v2 binary_smi_op + v0 v1 noenv)
                        (return v2))))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let frame = FrameAllocation::allocate(graph, Arch::Arm).unwrap();
        let params = &graph.blocks[graph.normal_entry().unwrap()].initial_definitions;
        assert!(frame.copies_parameters());
        assert_eq!(frame.home(params[0]), Location::StackSlot(-3));
        assert_eq!(frame.home(params[1]), Location::StackSlot(-4));
        assert_eq!(frame.home(find(graph, "binary_smi_op")), Location::StackSlot(-5));
    }
}
