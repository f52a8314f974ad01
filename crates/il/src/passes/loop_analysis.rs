use crate::{BlockId, FlowGraph};
use cranelift_entity::{EntitySet, SecondaryMap};
use ember_core::sexpr::{self, SExpr, list, symbol};
use smallvec::SmallVec;

/// A natural loop: the header plus every block that reaches one of the
/// back edges without passing through the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub header: BlockId,
    /// Sources of the edges that jump back to the header.
    pub back_edges: SmallVec<[BlockId; 2]>,
    /// Sorted in reverse postorder, header first.
    pub parts: Vec<BlockId>,
    /// 0 for top-level loops, increasing by 1
    /// for each nested level of loops.
    pub depth: u32,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.parts.contains(&block)
    }
}

/// Loops of a graph, outer loops before the loops nested in them.
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    pub loops: Vec<Loop>,
}

impl LoopInfo {
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn loop_with_header(&self, header: BlockId) -> Option<&Loop> {
        self.loops.iter().find(|l| l.header == header)
    }

    /// The single block entering the loop from outside, if there is
    /// exactly one. It ends in a goto to the header, so code appended
    /// before that goto runs once per loop entry.
    pub fn preheader(&self, graph: &FlowGraph, loop_: &Loop) -> Option<BlockId> {
        let mut entries = graph.blocks[loop_.header]
            .predecessors
            .iter()
            .copied()
            .filter(|pred| !loop_.back_edges.contains(pred));
        let preheader = entries.next()?;
        if entries.next().is_some() {
            return None;
        }
        let last = graph.last_instruction(preheader)?;
        let succs = graph.instrs[last].kind.successors();
        (succs.as_slice() == [loop_.header]).then_some(preheader)
    }

    /// Produces an SExpr representation useful
    /// for testing.
    pub fn to_sexpr(&self, graph: &FlowGraph) -> SExpr {
        let mut names = SecondaryMap::<BlockId, u32>::new();
        for (i, &block) in graph.reverse_postorder().iter().enumerate() {
            names[block] = i as u32;
        }
        let name = |block: BlockId| symbol(format!("B{}", names[block]));

        let mut loops = Vec::new();
        for loop_ in &self.loops {
            let mut parts: Vec<u32> = loop_.parts.iter().map(|&b| names[b]).collect();
            parts.sort_unstable();
            loops.push(list([
                symbol("loop"),
                list([symbol("header"), name(loop_.header)]),
                list([symbol("depth"), sexpr::int(loop_.depth as _)]),
                list([
                    symbol("parts"),
                    list(parts.into_iter().map(|i| symbol(format!("B{i}")))),
                ]),
            ]));
        }

        list([symbol("loops"), list(loops)])
    }
}

impl FlowGraph {
    /// Finds the natural loops and records, for every block, the header
    /// of its innermost loop and its nesting depth. Requires dominators.
    pub fn compute_loops(&mut self) -> LoopInfo {
        for block in self.blocks.values_mut() {
            block.loop_header = None.into();
            block.loop_depth = 0;
        }

        let mut loops = Vec::new();
        for &header in self.reverse_postorder() {
            let back_edges: SmallVec<[BlockId; 2]> = self.blocks[header]
                .predecessors
                .iter()
                .copied()
                .filter(|&pred| self.dominates(header, pred))
                .collect();
            if back_edges.is_empty() {
                continue;
            }

            let mut members = EntitySet::<BlockId>::new();
            members.insert(header);
            let mut stack: Vec<BlockId> = back_edges.to_vec();
            while let Some(block) = stack.pop() {
                if members.insert(block) {
                    stack.extend(self.blocks[block].predecessors.iter().copied());
                }
            }
            let parts = self
                .reverse_postorder()
                .iter()
                .copied()
                .filter(|&b| members.contains(b))
                .collect();
            loops.push(Loop {
                header,
                back_edges,
                parts,
                depth: 0,
            });
        }

        // Headers are visited in reverse postorder, and an enclosing
        // loop's header dominates (so precedes) the nested one's.
        for i in 0..loops.len() {
            let header = loops[i].header;
            let depth = loops[..i].iter().filter(|outer| outer.contains(header)).count();
            loops[i].depth = depth as u32;
            for &block in &loops[i].parts {
                let data = &mut self.blocks[block];
                data.loop_header = header.into();
                data.loop_depth = depth as u32 + 1;
            }
        }

        tracing::trace!(count = loops.len(), "computed loops of {}", self.name());
        LoopInfo { loops }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_program;
    use ember_core::sexpr::SExpr;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_loops() {
        let mut graph = parse_program(indoc! {"
            (graph nested
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (goto B2))
                (block B2 join (preds B1 B6)
                    (v1 phi 0 v2)
                    (branch B3 B7 v0))
                (block B3 target
                    (goto B4))
                (block B4 join (preds B3 B5)
                    (v2 phi v1 v3)
                    (branch B5 B6 v0))
                (block B5 target
                    (v3 binary_smi_op + v2 1)
                    (goto B4))
                (block B6 target
                    (goto B2))
                (block B7 target
                    (return v1)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph;

        let info = graph.compute_loops();
        assert_eq!(info.loops.len(), 2);
        let outer = &info.loops[0];
        let inner = &info.loops[1];
        assert_eq!(outer.depth, 0);
        assert_eq!(inner.depth, 1);
        assert!(outer.contains(inner.header));
        assert_eq!(inner.parts.len(), 2);

        let inner_body = inner.parts[1];
        assert_eq!(graph.blocks[inner_body].loop_depth, 2);
        assert_eq!(graph.blocks[inner_body].loop_header.expand(), Some(inner.header));

        let preheader = info.preheader(&graph, inner).unwrap();
        assert!(outer.contains(preheader));
        assert!(!inner.contains(preheader));

        // Printed names number blocks in reverse postorder, which visits
        // the exit B7 before the outer loop body.
        let expected = SExpr::parse(
            "(loops ((loop (header B2) (depth 0) (parts (B2 B4 B5 B6 B7)))
                     (loop (header B5) (depth 1) (parts (B5 B7)))))",
        )
        .unwrap();
        assert_eq!(info.to_sexpr(&graph).to_string(), expected.to_string());
    }

    #[test]
    fn straight_line_code_has_no_loops() {
        let mut graph = parse_program("(graph f (block B1 function_entry (return 1)))")
            .unwrap()
            .into_first()
            .unwrap()
            .graph;
        assert!(graph.compute_loops().is_empty());
    }
}
