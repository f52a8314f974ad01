//! Decodes the S-expression form produced by the formatter, wrapped in a
//! `program` that declares classes, functions and call-site feedback.
//!
//! The parser is meant for building test cases. Input may be terser
//! than formatter output: literals can appear directly as operands,
//! deopt ids are allocated when omitted, and deoptimizing instructions
//! without an explicit `env` get one holding the parameters followed by
//! the instruction's arguments. `//` starts a comment that runs to the
//! end of the line.

use crate::{
    cids::{CallTargets, CidRange, Cids, TargetInfo},
    compile_type::{AbstractType, CompileType},
    feedback::{ArgumentsDescriptor, ICData, TypeFeedback},
    flow_graph::{EnvFrameSpec, FlowGraph},
    ir::{self, BlockId, BlockKind, ConstValue, DeoptId, InstrId, InstrKind, Representation, Token},
    object_model::{ClassId, ClassTable, FunctionId, FunctionInfo, FunctionKind, NamedParameter, Slot, cid},
};
use compact_str::CompactString;
use ember_core::{
    HashMap,
    sexpr::{SExpr, SExprError},
};
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The text is not a well-formed S-expression.
    #[error("syntax error at {0}")]
    Syntax(#[from] SExprError),
    /// Well-formed, but not a valid program.
    #[error("{0}")]
    Invalid(String),
}

macro_rules! bail {
    ($($arg:tt)*) => {
        return Err(ParseError::Invalid(format!($($arg)*)))
    };
}

type Result<T, E = ParseError> = std::result::Result<T, E>;

pub struct ParsedFunction {
    pub graph: FlowGraph,
    pub feedback: TypeFeedback,
}

pub struct ParsedProgram {
    pub classes: Arc<ClassTable>,
    pub functions: Vec<ParsedFunction>,
}

impl ParsedProgram {
    pub fn function(&self, name: &str) -> Option<&ParsedFunction> {
        self.functions.iter().find(|f| f.graph.name() == name)
    }

    /// Takes the graph of the first (usually only) function.
    pub fn into_first(self) -> Option<ParsedFunction> {
        self.functions.into_iter().next()
    }
}

/// Parses a `(program ...)` or a single `(graph ...)`.
pub fn parse_program(src: &str) -> Result<ParsedProgram> {
    let expr = SExpr::parse(src)?;
    let items: Vec<&SExpr> = match expr.tagged("program") {
        Some(items) => items.iter().collect(),
        None => vec![&expr],
    };

    let mut classes = ClassTable::new();
    for item in &items {
        if let Some(rest) = item.tagged("class") {
            parse_class(&mut classes, rest)?;
        }
    }
    for item in &items {
        if let Some(rest) = item.tagged("function") {
            parse_function_decl(&mut classes, rest)?;
        }
    }
    // Graphs of undeclared functions declare a static function whose
    // fixed parameters are the entry's parameter definitions.
    for item in &items {
        if let Some(rest) = item.tagged("graph") {
            let name = symbol_at(rest, 0, "graph name")?;
            if classes.function_by_name(name).is_none() {
                let params = count_entry_parameters(rest);
                let mut info = FunctionInfo::new(name, cid::OBJECT, params);
                info.is_static = true;
                classes.add_function(info);
            }
        }
    }

    let classes = Arc::new(classes);
    let mut functions: Vec<ParsedFunction> = Vec::new();
    for item in &items {
        if let Some(rest) = item.tagged("graph") {
            let graph = GraphParser::new(classes.clone(), rest)?.parse(rest)?;
            functions.push(ParsedFunction {
                graph,
                feedback: TypeFeedback::new(),
            });
        }
    }
    for item in &items {
        if let Some(rest) = item.tagged("feedback") {
            let name = symbol_at(rest, 0, "feedback function")?;
            let Some(function) = functions.iter_mut().find(|f| f.graph.name() == name) else {
                bail!("feedback for unknown graph {name}");
            };
            for ic in &rest[1..] {
                if let Some([id]) = ic.tagged("blacklist") {
                    let id = DeoptId(int_of(id, "deopt id")? as u32);
                    function.feedback.blacklist(id);
                    continue;
                }
                let (deopt_id, data) = parse_ic(&classes, &function.graph, ic)?;
                function.feedback.insert(deopt_id, data);
            }
        }
    }

    Ok(ParsedProgram { classes, functions })
}

fn symbol_at<'a>(items: &'a [SExpr], index: usize, what: &str) -> Result<&'a str> {
    match items.get(index).and_then(SExpr::as_symbol) {
        Some(s) => Ok(s),
        None => bail!("expected {what} at position {index}"),
    }
}

fn int_of(expr: &SExpr, what: &str) -> Result<i64> {
    match expr.as_int() {
        Some(i) => Ok(i),
        None => bail!("expected integer {what}, found {expr}"),
    }
}

fn class_ref(classes: &ClassTable, expr: &SExpr) -> Result<ClassId> {
    match expr {
        SExpr::Int(i) => Ok(*i as ClassId),
        SExpr::Symbol(name) => match classes.class_by_name(name) {
            Some(c) => Ok(c),
            None => bail!("unknown class {name}"),
        },
        other => bail!("expected class, found {other}"),
    }
}

fn function_ref(classes: &ClassTable, expr: &SExpr) -> Result<FunctionId> {
    let Some(name) = expr.as_symbol() else {
        bail!("expected function name, found {expr}");
    };
    match classes.function_by_name(name) {
        Some(f) => Ok(f),
        None => bail!("unknown function {name}"),
    }
}

fn parse_class(classes: &mut ClassTable, rest: &[SExpr]) -> Result<()> {
    let name = symbol_at(rest, 0, "class name")?;
    let superclass = match rest.get(1) {
        Some(sup) => class_ref(classes, sup)?,
        None => bail!("class {name} needs a superclass"),
    };
    let cid = classes.add_class(name, superclass);
    let mut accessors = false;
    for option in &rest[2..] {
        if let Some(fields) = option.tagged("fields") {
            for field in fields {
                let Some(field) = field.as_symbol() else {
                    bail!("field names are symbols");
                };
                classes.add_field(cid, field);
            }
        } else if let Some(interfaces) = option.tagged("implements") {
            for iface in interfaces {
                let iface = class_ref(classes, iface)?;
                classes.add_interface(cid, iface);
            }
        } else if let Some([n]) = option.tagged("type_args") {
            classes.set_num_type_arguments(cid, int_of(n, "type argument count")? as u32);
        } else if option.as_symbol() == Some("abstract") {
            classes.set_abstract(cid, true);
        } else if option.as_symbol() == Some("accessors") {
            accessors = true;
        } else {
            bail!("unknown class option {option}");
        }
    }
    if accessors {
        for slot in classes.class(cid).fields.clone() {
            classes.add_field_accessors(cid, &slot);
        }
    }
    Ok(())
}

fn parse_function_decl(classes: &mut ClassTable, rest: &[SExpr]) -> Result<()> {
    let name = symbol_at(rest, 0, "function name")?;
    let mut info = FunctionInfo::new(name, cid::OBJECT, 0);
    let mut selector: Option<CompactString> = None;
    for option in &rest[1..] {
        if let Some([owner]) = option.tagged("owner") {
            info.owner = class_ref(classes, owner)?;
        } else if let Some([n]) = option.tagged("fixed") {
            info.num_fixed_parameters = int_of(n, "parameter count")? as u32;
        } else if let Some([sel]) = option.tagged("method") {
            let Some(sel) = sel.as_symbol() else {
                bail!("method selector must be a symbol");
            };
            selector = Some(sel.into());
        } else if let Some(defaults) = option.tagged("optional") {
            info.optional_positional = defaults
                .iter()
                .map(|d| parse_constant(classes, d))
                .collect::<Result<_>>()?;
        } else if let Some(named) = option.tagged("named") {
            for param in named {
                let Some([SExpr::Symbol(param_name), default]) = param.as_list() else {
                    bail!("named parameter must be (name default)");
                };
                info.optional_named.push(NamedParameter {
                    name: param_name.clone(),
                    default: parse_constant(classes, default)?,
                });
            }
        } else {
            match option.as_symbol() {
                Some("static") => info.is_static = true,
                Some("force_optimized") => info.is_force_optimized = true,
                Some("closure") => info.kind = FunctionKind::Closure,
                Some("constructor") => info.kind = FunctionKind::Constructor,
                Some("getter") => info.kind = FunctionKind::Getter,
                Some("setter") => info.kind = FunctionKind::Setter,
                _ => bail!("unknown function option {option}"),
            }
        }
    }
    match selector {
        Some(selector) => {
            let owner = info.owner;
            classes.add_method(owner, &selector, info);
        }
        None => {
            classes.add_function(info);
        }
    }
    Ok(())
}

fn count_entry_parameters(graph_items: &[SExpr]) -> u32 {
    graph_items
        .iter()
        .filter_map(|b| b.tagged("block"))
        .filter(|b| b.get(1).and_then(SExpr::as_symbol) == Some("function_entry"))
        .flat_map(|b| b.iter())
        .filter(|item| {
            item.as_list()
                .is_some_and(|l| l.get(1).and_then(SExpr::as_symbol) == Some("parameter"))
        })
        .count() as u32
}

pub fn parse_constant(classes: &ClassTable, expr: &SExpr) -> Result<ConstValue> {
    Ok(match expr {
        SExpr::Int(i) => ConstValue::Int(*i),
        SExpr::Float(f) => ConstValue::Double(*f),
        SExpr::String(s) => ConstValue::String(s.clone()),
        SExpr::Symbol(s) => match s.as_str() {
            "null" => ConstValue::Null,
            "true" => ConstValue::Bool(true),
            "false" => ConstValue::Bool(false),
            "optimized_out" => ConstValue::OptimizedOut,
            other => bail!("not a constant: {other}"),
        },
        SExpr::List(_) => {
            if let Some([value]) = expr.tagged("double") {
                match value {
                    SExpr::Float(f) => ConstValue::Double(*f),
                    SExpr::Int(i) => ConstValue::Double(*i as f64),
                    other => bail!("bad double {other}"),
                }
            } else if let Some([ty]) = expr.tagged("type") {
                ConstValue::Type(parse_type(classes, ty)?)
            } else {
                bail!("not a constant: {expr}")
            }
        }
    })
}

pub fn parse_type(classes: &ClassTable, expr: &SExpr) -> Result<AbstractType> {
    let (head, args) = match expr {
        SExpr::Symbol(s) => (s.as_str(), &[][..]),
        SExpr::List(items) => match items.split_first() {
            Some((SExpr::Symbol(s), args)) => (s.as_str(), args),
            _ => bail!("malformed type {expr}"),
        },
        _ => bail!("malformed type {expr}"),
    };
    let (name, nullable) = match head.strip_suffix('?') {
        Some(name) => (name, true),
        None => (head, false),
    };
    match name {
        "dynamic" => return Ok(AbstractType::Dynamic),
        "void" => return Ok(AbstractType::Void),
        "Never" => return Ok(AbstractType::Never),
        "Null" => return Ok(AbstractType::Null),
        _ => {}
    }
    for (prefix, function_level) in [("T", false), ("F", true)] {
        if let Some(index) = name.strip_prefix(prefix).and_then(|i| i.parse::<u32>().ok()) {
            return Ok(AbstractType::TypeParameter {
                index,
                function_level,
                nullable,
            });
        }
    }
    let Some(cid) = classes.class_by_name(name) else {
        bail!("unknown class {name} in type");
    };
    Ok(AbstractType::Class {
        cid,
        args: args
            .iter()
            .map(|a| parse_type(classes, a))
            .collect::<Result<_>>()?,
        nullable,
    })
}

fn parse_cids(expr: &SExpr) -> Result<Cids> {
    let Some(items) = expr.tagged("cids") else {
        bail!("expected (cids ...), found {expr}");
    };
    let mut ranges = SmallVec::<[CidRange; 4]>::new();
    for item in items {
        match item {
            SExpr::Int(c) => ranges.push(CidRange::single(*c as ClassId)),
            SExpr::List(bounds) => match &bounds[..] {
                [SExpr::Int(a), SExpr::Int(b)] => {
                    ranges.push(CidRange::new(*a as ClassId, *b as ClassId))
                }
                _ => bail!("malformed cid range {item}"),
            },
            _ => bail!("malformed cid {item}"),
        }
    }
    Ok(Cids::from_ranges(ranges))
}

fn parse_slot(expr: &SExpr) -> Result<Slot> {
    let Some(items) = expr.tagged("slot") else {
        bail!("expected (slot ...), found {expr}");
    };
    match items {
        [SExpr::Symbol(name), SExpr::Int(offset), rest @ ..] => Ok(Slot {
            name: name.clone(),
            offset_in_words: *offset as u32,
            is_immutable: rest.first().and_then(SExpr::as_symbol) == Some("immutable"),
        }),
        _ => bail!("malformed slot {expr}"),
    }
}

fn parse_args_desc(expr: &SExpr) -> Result<ArgumentsDescriptor> {
    let Some(items) = expr.tagged("args") else {
        bail!("expected (args ...), found {expr}");
    };
    let Some((count, rest)) = items.split_first() else {
        bail!("(args) needs a count");
    };
    let count = int_of(count, "argument count")? as u32;
    let mut names = Vec::new();
    let mut type_args_len = 0;
    for item in rest {
        if let Some([n]) = item.tagged("type_args") {
            type_args_len = int_of(n, "type argument count")? as u32;
        } else if let Some(name) = item.as_symbol() {
            names.push(name);
        } else {
            bail!("malformed argument descriptor {expr}");
        }
    }
    Ok(ArgumentsDescriptor::new(count, &names).with_type_args(type_args_len))
}

fn parse_targets(classes: &ClassTable, expr: &SExpr) -> Result<CallTargets> {
    let Some(items) = expr.tagged("targets") else {
        bail!("expected (targets ...), found {expr}");
    };
    let mut targets = SmallVec::new();
    for item in items {
        let Some([range, target, count]) = item.as_list() else {
            bail!("malformed call target {item}");
        };
        let range = match range {
            SExpr::Int(c) => CidRange::single(*c as ClassId),
            SExpr::List(b) => match &b[..] {
                [SExpr::Int(a), SExpr::Int(b)] => CidRange::new(*a as ClassId, *b as ClassId),
                _ => bail!("malformed range {range}"),
            },
            other => CidRange::single(class_ref(classes, other)?),
        };
        targets.push(TargetInfo {
            range,
            target: function_ref(classes, target)?,
            count: int_of(count, "call count")? as u64,
        });
    }
    Ok(CallTargets::new(targets))
}

fn parse_ic(classes: &ClassTable, graph: &FlowGraph, expr: &SExpr) -> Result<(DeoptId, ICData)> {
    let Some(items) = expr.tagged("ic") else {
        bail!("expected (ic ...), found {expr}");
    };
    let [deopt_id, selector, tested, rest @ ..] = items else {
        bail!("malformed ic {expr}");
    };
    let deopt_id = DeoptId(int_of(deopt_id, "deopt id")? as u32);
    let Some(selector) = selector.as_symbol() else {
        bail!("ic selector must be a symbol");
    };
    let num_tested = int_of(tested, "tested argument count")? as u8;

    let mut args_desc = graph
        .instrs
        .values()
        .find(|i| i.deopt_id == Some(deopt_id))
        .and_then(|i| i.kind.args_desc().cloned())
        .unwrap_or_else(|| ArgumentsDescriptor::positional(num_tested.into()));
    let mut data = ICData::new(selector, args_desc.clone(), num_tested);
    for item in rest {
        if item.tagged("args").is_some() {
            args_desc = parse_args_desc(item)?;
            data.args_desc = args_desc.clone();
            continue;
        }
        let Some([cids, target, count]) = item.tagged("check") else {
            bail!("malformed ic check {item}");
        };
        let Some(cids) = cids.as_list() else {
            bail!("ic check cids must be a list");
        };
        let cids: SmallVec<[ClassId; 2]> = cids
            .iter()
            .map(|c| class_ref(classes, c))
            .collect::<Result<_>>()?;
        data.add_check(
            &cids,
            function_ref(classes, target)?,
            int_of(count, "call count")? as u64,
        );
    }
    Ok((deopt_id, data))
}

struct PendingPhi {
    phi: InstrId,
    inputs: Vec<SExpr>,
}

struct GraphParser {
    graph: FlowGraph,
    blocks: HashMap<CompactString, BlockId>,
    values: HashMap<CompactString, InstrId>,
    parameters: Vec<InstrId>,
    pending_phis: Vec<PendingPhi>,
    explicit_preds: Vec<(BlockId, Vec<CompactString>)>,
}

impl GraphParser {
    fn new(classes: Arc<ClassTable>, rest: &[SExpr]) -> Result<Self> {
        let name = symbol_at(rest, 0, "graph name")?;
        let Some(function) = classes.function_by_name(name) else {
            bail!("unknown function {name}");
        };
        let mut graph = FlowGraph::new(classes, function);
        let mut max_deopt = None;
        reserved_deopt_ids(rest, &mut max_deopt);
        if let Some(max) = max_deopt {
            graph.reserve_deopt_ids_up_to(DeoptId(max));
        }
        Ok(Self {
            graph,
            blocks: HashMap::default(),
            values: HashMap::default(),
            parameters: Vec::new(),
            pending_phis: Vec::new(),
            explicit_preds: Vec::new(),
        })
    }

    fn parse(mut self, rest: &[SExpr]) -> Result<FlowGraph> {
        let blocks: Vec<&[SExpr]> = rest[1..]
            .iter()
            .map(|b| match b.tagged("block") {
                Some(items) => Ok(items),
                None => bail!("expected (block ...), found {b}"),
            })
            .collect::<Result<_>>()?;

        for items in &blocks {
            self.declare_block(items)?;
        }
        for items in &blocks {
            self.parse_block(items)?;
        }

        for (block, names) in std::mem::take(&mut self.explicit_preds) {
            let preds: SmallVec<[BlockId; 2]> =
                names.iter().map(|n| self.block(n)).collect::<Result<_>>()?;
            let mut expected = self.graph.blocks[block].predecessors.clone();
            let mut given = preds.clone();
            expected.sort();
            given.sort();
            if expected != given {
                bail!("explicit predecessors of a block do not match its incoming edges");
            }
            self.graph.blocks[block].predecessors = preds;
        }
        for pending in std::mem::take(&mut self.pending_phis) {
            for input in &pending.inputs {
                let def = self.operand(input)?;
                self.graph.add_input(pending.phi, def);
            }
        }

        self.graph.compute_block_info();
        Ok(self.graph)
    }

    fn block(&self, name: &str) -> Result<BlockId> {
        match self.blocks.get(name) {
            Some(&b) => Ok(b),
            None => bail!("unknown block {name}"),
        }
    }

    fn declare_block(&mut self, items: &[SExpr]) -> Result<()> {
        let name = symbol_at(items, 0, "block name")?;
        let kind = match items.get(1) {
            Some(SExpr::Symbol(kind)) => match kind.as_str() {
                "graph_entry" => None,
                "function_entry" => Some(BlockKind::FunctionEntry),
                "osr_entry" => Some(BlockKind::OsrEntry),
                "join" => Some(BlockKind::Join),
                "target" => Some(BlockKind::Target),
                other => bail!("unknown block kind {other}"),
            },
            Some(list) => {
                if let Some([n]) = list.tagged("indirect_entry") {
                    Some(BlockKind::IndirectEntry {
                        indirect_id: int_of(n, "indirect id")? as u32,
                    })
                } else if let Some([n]) = list.tagged("catch_entry") {
                    Some(BlockKind::CatchBlockEntry {
                        catch_try_index: int_of(n, "try index")? as u32,
                    })
                } else {
                    bail!("unknown block kind {list}")
                }
            }
            None => bail!("block {name} has no kind"),
        };
        let block = match kind {
            Some(kind) => self.graph.add_block(kind),
            None => self.graph.graph_entry(),
        };
        self.blocks.insert(name.into(), block);
        Ok(())
    }

    fn parse_block(&mut self, items: &[SExpr]) -> Result<()> {
        let block = self.block(symbol_at(items, 0, "block name")?)?;
        for item in &items[2..] {
            if let Some(preds) = item.tagged("preds") {
                let names = preds
                    .iter()
                    .map(|p| match p.as_symbol() {
                        Some(p) => Ok(CompactString::from(p)),
                        None => bail!("predecessor names are symbols"),
                    })
                    .collect::<Result<_>>()?;
                self.explicit_preds.push((block, names));
            } else if let Some([n]) = item.tagged("try") {
                self.graph.blocks[block].try_index = Some(int_of(n, "try index")? as u32);
            } else {
                self.parse_item(block, item)?;
            }
        }
        Ok(())
    }

    fn define(&mut self, name: Option<&str>, def: InstrId) -> Result<()> {
        if let Some(name) = name {
            if self.values.insert(name.into(), def).is_some() {
                bail!("value {name} defined twice");
            }
        }
        Ok(())
    }

    fn operand(&mut self, expr: &SExpr) -> Result<InstrId> {
        if let SExpr::Symbol(name) = expr {
            if let Some(&def) = self.values.get(name.as_str()) {
                return Ok(def);
            }
        }
        match parse_constant(&self.graph.classes, expr) {
            Ok(value) => Ok(self.graph.constant(value)),
            Err(_) => bail!("undefined value {expr}"),
        }
    }

    fn parse_item(&mut self, block: BlockId, item: &SExpr) -> Result<()> {
        let Some(list) = item.as_list() else {
            bail!("expected instruction, found {item}");
        };
        let (name, kind_name, operands) = match list {
            [SExpr::Symbol(name), SExpr::Symbol(kind), rest @ ..] if is_kind_name(kind) => {
                (Some(name.as_str()), kind.as_str(), rest)
            }
            [SExpr::Symbol(kind), rest @ ..] if is_kind_name(kind) => (None, kind.as_str(), rest),
            _ => bail!("unknown instruction {item}"),
        };

        match kind_name {
            "constant" => {
                let [value] = operands else {
                    bail!("constant takes one value");
                };
                let value = parse_constant(&self.graph.classes, value)?;
                let def = self.graph.constant(value);
                return self.define(name, def);
            }
            "parameter" => {
                let [index] = operands else {
                    bail!("parameter takes an index");
                };
                let index = int_of(index, "parameter index")? as u32;
                let def = self
                    .graph
                    .add_initial_definition(block, InstrKind::Parameter(ir::Parameter { index }));
                if matches!(self.graph.blocks[block].kind, BlockKind::FunctionEntry) {
                    self.parameters.push(def);
                }
                return self.define(name, def);
            }
            "phi" => {
                let phi = self.graph.add_phi(block, &[]);
                self.pending_phis.push(PendingPhi {
                    phi,
                    inputs: operands.to_vec(),
                });
                return self.define(name, phi);
            }
            _ => {}
        }

        let mut plain = Vec::new();
        let mut deopt_id = None;
        let mut env = None;
        let mut moved = None;
        let mut no_env = false;
        for operand in operands {
            if let Some([n]) = operand.tagged("deopt") {
                deopt_id = Some(DeoptId(int_of(n, "deopt id")? as u32));
            } else if let Some(frames) = operand.tagged("env") {
                env = Some(frames);
            } else if let Some(moves) = operand.tagged("moved") {
                moved = Some(moves);
            } else if operand.as_symbol() == Some("noenv") {
                no_env = true;
            } else {
                plain.push(operand);
            }
        }

        let mut cursor = Cursor {
            items: &plain,
            pos: 0,
        };
        let kind = self.parse_kind(kind_name, &mut cursor)?;
        let inputs: Vec<InstrId> = cursor.items[cursor.pos..]
            .iter()
            .map(|e| self.operand(e))
            .collect::<Result<_>>()?;

        let can_deoptimize = kind.can_deoptimize();
        let instr = self.graph.new_instr(kind, &inputs);
        let move_arguments: Option<SmallVec<[InstrId; 4]>> = match moved {
            Some(moves) => Some(moves.iter().map(|m| self.operand(m)).collect::<Result<_>>()?),
            None => None,
        };
        let arguments: Vec<InstrId> = move_arguments.as_deref().unwrap_or(&inputs).to_vec();
        self.graph.instrs[instr].move_arguments = move_arguments;

        if deopt_id.is_none() && can_deoptimize {
            deopt_id = Some(self.graph.alloc_deopt_id());
        }
        self.graph.instrs[instr].deopt_id = deopt_id;

        match env {
            Some(frames) => self.parse_env(instr, frames)?,
            None if can_deoptimize && !no_env => {
                let info = self.graph.function_info();
                let fixed_parameter_count = info.num_parameters();
                let values = self.parameters.iter().copied().chain(arguments).collect();
                let frame = EnvFrameSpec {
                    function: self.graph.function,
                    values,
                    fixed_parameter_count,
                    deopt_id: deopt_id.unwrap_or(DeoptId(0)),
                };
                self.graph.set_environment(instr, vec![frame]);
            }
            None => {}
        }

        self.graph.append(block, instr);
        self.define(name, instr)
    }

    fn parse_env(&mut self, instr: InstrId, items: &[SExpr]) -> Result<()> {
        let mut lazy = false;
        let mut frames = Vec::new();
        for item in items {
            if item.as_symbol() == Some("lazy_before") {
                lazy = true;
                continue;
            }
            let Some([function, fixed, deopt, values @ ..]) = item.tagged("frame") else {
                bail!("malformed environment frame {item}");
            };
            let function = function_ref(&self.graph.classes, function)?;
            frames.push(EnvFrameSpec {
                function,
                fixed_parameter_count: int_of(fixed, "fixed parameter count")? as u32,
                deopt_id: DeoptId(int_of(deopt, "deopt id")? as u32),
                values: values
                    .iter()
                    .map(|v| self.operand(v))
                    .collect::<Result<_>>()?,
            });
        }
        self.graph.set_environment(instr, frames);
        if let Some(env) = &mut self.graph.instrs[instr].env {
            env.lazy_deopt_to_before = lazy;
        }
        Ok(())
    }

    fn parse_kind(&mut self, kind: &str, c: &mut Cursor<'_>) -> Result<InstrKind> {
        let classes = self.graph.classes.clone();
        let classes = &*classes;
        Ok(match kind {
            "goto" => InstrKind::Goto(ir::Goto {
                target: self.block(c.symbol()?)?,
            }),
            "branch" => {
                let true_target = self.block(c.symbol()?)?;
                let false_target = self.block(c.symbol()?)?;
                InstrKind::Branch(ir::Branch {
                    true_target,
                    false_target,
                })
            }
            "return" => InstrKind::Return,
            "throw" => InstrKind::Throw,
            "rethrow" => InstrKind::ReThrow,
            "redefinition" => {
                let constrained_type = match c.tagged("cid") {
                    Some([cid]) => Some(CompileType::from_cid(class_ref(classes, cid)?)),
                    _ => None,
                };
                InstrKind::Redefinition(ir::Redefinition { constrained_type })
            }
            "binary_smi_op" => InstrKind::BinarySmiOp(ir::BinaryOp { op: c.token()? }),
            "binary_int64_op" => InstrKind::BinaryInt64Op(ir::BinaryOp { op: c.token()? }),
            "binary_double_op" => InstrKind::BinaryDoubleOp(ir::BinaryOp { op: c.token()? }),
            "checked_smi_op" => InstrKind::CheckedSmiOp(ir::BinaryOp { op: c.token()? }),
            "checked_smi_comparison" => {
                InstrKind::CheckedSmiComparison(ir::BinaryOp { op: c.token()? })
            }
            "unary_smi_op" => InstrKind::UnarySmiOp(ir::UnaryOp { op: c.token()? }),
            "relational_op" | "equality_compare" => {
                let op = c.token()?;
                let operation_cid = class_ref(classes, c.next()?)?;
                let cmp = ir::Comparison { op, operation_cid };
                if kind == "relational_op" {
                    InstrKind::RelationalOp(cmp)
                } else {
                    InstrKind::EqualityCompare(cmp)
                }
            }
            "strict_compare" => InstrKind::StrictCompare(ir::StrictCompare {
                op: c.token()?,
                needs_number_check: c.flag("number_check"),
            }),
            "test_cids" => InstrKind::TestCids(ir::TestCids {
                cids: parse_cids(c.next()?)?,
            }),
            "boolean_negate" => InstrKind::BooleanNegate,
            "box" => InstrKind::Box(ir::BoxValue {
                from: c.representation()?,
            }),
            "unbox" => InstrKind::Unbox(ir::Unbox {
                to: c.representation()?,
                speculative: c.flag("speculative"),
            }),
            "instance_call" => {
                let selector = c.symbol()?.into();
                let checked_argument_count = int_of(c.next()?, "checked argument count")? as u8;
                InstrKind::InstanceCall(ir::InstanceCall {
                    selector,
                    checked_argument_count,
                    args_desc: parse_args_desc(c.next()?)?,
                })
            }
            "polymorphic_instance_call" => {
                let selector = c.symbol()?.into();
                let args_desc = parse_args_desc(c.next()?)?;
                let targets = parse_targets(classes, c.next()?)?;
                InstrKind::PolymorphicInstanceCall(ir::PolymorphicInstanceCall {
                    selector,
                    args_desc,
                    targets,
                    complete: c.flag("complete"),
                })
            }
            "static_call" => {
                let target = function_ref(classes, c.next()?)?;
                InstrKind::StaticCall(ir::StaticCall {
                    target,
                    args_desc: parse_args_desc(c.next()?)?,
                })
            }
            "closure_call" => InstrKind::ClosureCall(ir::ClosureCall {
                args_desc: parse_args_desc(c.next()?)?,
            }),
            "move_argument" => InstrKind::MoveArgument(ir::MoveArgument {
                sp_relative_index: int_of(c.next()?, "stack index")? as u32,
            }),
            "allocate_object" => InstrKind::AllocateObject(ir::AllocateObject {
                cls: class_ref(classes, c.next()?)?,
            }),
            "load_field" => InstrKind::LoadField(ir::LoadField {
                slot: parse_slot(c.next()?)?,
            }),
            "store_field" => {
                let slot = parse_slot(c.next()?)?;
                let emit_store_barrier = !c.flag("no_barrier");
                InstrKind::StoreInstanceField(ir::StoreField {
                    slot,
                    emit_store_barrier,
                    is_initialization: c.flag("init"),
                })
            }
            "load_indexed" => InstrKind::LoadIndexed(ir::LoadIndexed {
                class_id: class_ref(classes, c.next()?)?,
            }),
            "store_indexed" => InstrKind::StoreIndexed(ir::StoreIndexed {
                class_id: class_ref(classes, c.next()?)?,
                emit_store_barrier: !c.flag("no_barrier"),
            }),
            "load_class_id" => InstrKind::LoadClassId,
            "check_class" => InstrKind::CheckClass(ir::CheckClass {
                cids: parse_cids(c.next()?)?,
                licm_hoisted: c.flag("hoisted"),
            }),
            "check_smi" => InstrKind::CheckSmi(ir::CheckSmi {
                licm_hoisted: c.flag("hoisted"),
            }),
            "check_null" => InstrKind::CheckNull,
            "check_class_id" => {
                let cids = parse_cids(c.next()?)?;
                let [range] = cids.ranges() else {
                    bail!("check_class_id takes a single cid range");
                };
                InstrKind::CheckClassId(ir::CheckClassId { range: *range })
            }
            "check_array_bound" => InstrKind::CheckArrayBound,
            "check_stack_overflow" => InstrKind::CheckStackOverflow(ir::CheckStackOverflow {
                loop_depth: int_of(c.next()?, "loop depth")? as u32,
            }),
            "instance_of" => InstrKind::InstanceOf(ir::TypeTest {
                ty: c.ty(classes)?,
            }),
            "assert_assignable" => {
                let ty = c.ty(classes)?;
                InstrKind::AssertAssignable(ir::AssertAssignable {
                    ty,
                    dst_name: c.symbol()?.into(),
                })
            }
            "assert_boolean" => InstrKind::AssertBoolean,
            "materialize_object" => {
                let cls = class_ref(classes, c.next()?)?;
                let Some(slots) = c.next()?.tagged("slots") else {
                    bail!("materialize_object needs (slots ...)");
                };
                InstrKind::MaterializeObject(ir::MaterializeObject {
                    cls,
                    slots: slots.iter().map(parse_slot).collect::<Result<_>>()?,
                })
            }
            other => bail!("instruction {other} cannot appear here"),
        })
    }
}

struct Cursor<'a> {
    items: &'a [&'a SExpr],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> Result<&'a SExpr> {
        match self.items.get(self.pos) {
            Some(item) => {
                self.pos += 1;
                Ok(item)
            }
            None => bail!("missing operand"),
        }
    }

    fn symbol(&mut self) -> Result<&'a str> {
        let item = self.next()?;
        match item.as_symbol() {
            Some(s) => Ok(s),
            None => bail!("expected symbol, found {item}"),
        }
    }

    fn token(&mut self) -> Result<Token> {
        let name = self.symbol()?;
        match Token::from_name(name) {
            Some(token) => Ok(token),
            None => bail!("unknown operator {name}"),
        }
    }

    fn representation(&mut self) -> Result<Representation> {
        let name = self.symbol()?;
        match Representation::from_name(name) {
            Some(rep) => Ok(rep),
            None => bail!("unknown representation {name}"),
        }
    }

    fn ty(&mut self, classes: &ClassTable) -> Result<AbstractType> {
        match self.next()?.tagged("type") {
            Some([ty]) => parse_type(classes, ty),
            _ => bail!("expected (type ...)"),
        }
    }

    /// Consumes the next operand if it is the symbol `name`.
    fn flag(&mut self, name: &str) -> bool {
        let present = self
            .items
            .get(self.pos)
            .and_then(|i| i.as_symbol())
            .is_some_and(|s| s == name);
        if present {
            self.pos += 1;
        }
        present
    }

    fn tagged(&mut self, head: &str) -> Option<&'a [SExpr]> {
        let rest = self.items.get(self.pos)?.tagged(head)?;
        self.pos += 1;
        Some(rest)
    }
}

const KIND_NAMES: &[&str] = &[
    "goto",
    "branch",
    "return",
    "throw",
    "rethrow",
    "constant",
    "parameter",
    "phi",
    "redefinition",
    "binary_smi_op",
    "binary_int64_op",
    "unary_smi_op",
    "binary_double_op",
    "checked_smi_op",
    "checked_smi_comparison",
    "relational_op",
    "equality_compare",
    "strict_compare",
    "test_cids",
    "boolean_negate",
    "box",
    "unbox",
    "instance_call",
    "polymorphic_instance_call",
    "static_call",
    "closure_call",
    "move_argument",
    "allocate_object",
    "load_field",
    "store_field",
    "load_indexed",
    "store_indexed",
    "load_class_id",
    "check_class",
    "check_smi",
    "check_null",
    "check_class_id",
    "check_array_bound",
    "check_stack_overflow",
    "instance_of",
    "assert_assignable",
    "assert_boolean",
    "materialize_object",
];

fn is_kind_name(name: &str) -> bool {
    KIND_NAMES.contains(&name)
}

fn reserved_deopt_ids(items: &[SExpr], max: &mut Option<u32>) {
    for item in items {
        if let Some([SExpr::Int(n)]) = item.tagged("deopt") {
            *max = Some(max.map_or(*n as u32, |m| m.max(*n as u32)));
        } else if let Some([_, _, SExpr::Int(n), ..]) = item.tagged("frame") {
            *max = Some(max.map_or(*n as u32, |m| m.max(*n as u32)));
        } else if let Some(list) = item.as_list() {
            reserved_deopt_ids(list, max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::format_graph;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_loop_with_phis() {
        let program = parse_program(indoc! {"
            (graph count
                (block B0 graph_entry (v0 constant 0) (v1 constant 1))
                (block B1 function_entry
                    (v2 parameter 0)
                    (goto B2))
                (block B2 join (preds B1 B3)
                    (v3 phi v0 v4)
                    (v5 relational_op < _Smi v3 v2)
                    (branch B3 B4 v5))
                // back edge
                (block B3 target
                    (v4 binary_smi_op + v3 v1)
                    (goto B2))
                (block B4 target
                    (return v3)))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        assert_eq!(graph.name(), "count");
        assert_eq!(graph.function_info().num_fixed_parameters, 1);

        let header = graph.reverse_postorder()[2];
        assert!(graph.blocks[header].is_join());
        assert_eq!(graph.blocks[header].predecessors.len(), 2);
        let phi = graph.blocks[header].phis[0];
        assert_eq!(graph.instrs[phi].inputs.len(), 2);

        let add = graph
            .instrs
            .keys()
            .find(|&i| matches!(graph.instrs[i].kind, InstrKind::BinarySmiOp(_)))
            .unwrap();
        assert!(graph.instrs[add].deopt_id.is_some());
        assert_eq!(graph.instrs[add].env.as_ref().unwrap().innermost().values.len(), 3);
    }

    #[test]
    fn formatter_output_parses_back() {
        let decls = indoc! {"
            (class A Object (fields x))
            (function A.get (owner A) (fixed 1) (method get))
        "};
        let src = format!(
            "(program {decls} {})",
            indoc! {"
                (graph A.get
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 check_null v0)
                        (v2 load_field (slot x 1) v1)
                        (return v2)))
            "}
        );
        let first = format_graph(&parse_program(&src).unwrap().functions[0].graph);
        let again = parse_program(&format!("(program {decls} {first})")).unwrap();
        assert_eq!(format_graph(&again.functions[0].graph), first);
    }

    #[test]
    fn feedback_attaches_to_call_sites() {
        let program = parse_program(indoc! {"
            (program
                (class A Object)
                (function A.foo (owner A) (fixed 1) (method foo))
                (graph main
                    (block B0 graph_entry)
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 instance_call foo 1 (args 1) v0 (deopt 4))
                        (return v1)))
                (feedback main (ic 4 foo 1 (check (A) A.foo 12))))
        "})
        .unwrap();
        let function = program.function("main").unwrap();
        let ic = function.feedback.get(DeoptId(4)).unwrap();
        assert_eq!(ic.aggregate_count(), 12);
        assert_eq!(ic.args_desc.count, 1);
        assert_eq!(function.graph.max_deopt_id(), 6);
    }

    #[test]
    fn reports_undefined_values() {
        let err = parse_program("(graph f (block B1 function_entry (return v9)))")
            .err()
            .unwrap();
        let ParseError::Invalid(message) = err else {
            panic!("expected a semantic error, got {err}");
        };
        assert!(message.starts_with("undefined value v9"));
    }

    #[test]
    fn syntax_errors_carry_their_position() {
        let err = parse_program(indoc! {"
            // @harness checker_accepts
            (graph f
                (block B1 function_entry
                    (return 1))
        "})
        .err()
        .unwrap();
        let ParseError::Syntax(syntax) = &err else {
            panic!("expected a syntax error, got {err}");
        };
        assert_eq!((syntax.line, syntax.column), (2, 1));
        assert_eq!(err.to_string(), "syntax error at 2:1: unterminated list");
    }
}
