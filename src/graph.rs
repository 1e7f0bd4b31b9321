// src/graph.rs
//
// =============================================================================
// SALUS: ITERATION GRAPHS
// =============================================================================
//
// The Graph Brain.
//
// Responsibilities:
// 1. Parse client graph definitions (nodes, typed edges, control deps).
// 2. Assign every node to its lexical loop frame (control-flow analysis).
// 3. Flatten into an immutable GraphView: fused edge records, input-table
//    offsets, pending-count layout. Built once per registration, shared by
//    every execution of that graph.
// 4. Content-hash definitions so re-registrations deduplicate.

use crate::core::{Result, Status};
use crate::device::AllocAttributes;
use crate::ops::{KernelRef, OpRegistry};
use crate::tensor::DataType;

use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

pub const ROOT_FRAME: &str = "";

pub const DEFAULT_MAX_PARALLEL_ITERATIONS: usize = 8;

// ============================================================================
// 1. DEFINITIONS (Client-Facing)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,

    /// Data inputs as `node` / `node:slot`; control deps as `^node`.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub attrs: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    /// Stable content hash used to deduplicate re-registrations.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for node in &self.nodes {
            hasher.update(&node.name);
            hasher.update(&node.op);
            for input in &node.inputs {
                hasher.update(input);
            }
            // Attrs participate in declaration order from a sorted map.
            let mut keys: Vec<_> = node.attrs.keys().collect();
            keys.sort();
            for k in keys {
                hasher.update(k);
                hasher.update(node.attrs[k].to_string());
            }
        }
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// 2. NODE CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeClass {
    Plain,
    Enter { frame_name: String, is_constant: bool },
    Exit,
    NextIteration,
    Merge,
    Switch,
}

impl NodeClass {
    fn from_op(op: &str, attrs: &HashMap<String, Value>) -> Result<Self> {
        Ok(match op {
            "Enter" => {
                let frame_name = attrs
                    .get("frame_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        Status::invalid_argument("Enter node missing frame_name attr")
                    })?
                    .to_string();
                let is_constant =
                    attrs.get("is_constant").and_then(|v| v.as_bool()).unwrap_or(false);
                NodeClass::Enter { frame_name, is_constant }
            }
            "Exit" => NodeClass::Exit,
            "NextIteration" => NodeClass::NextIteration,
            "Merge" => NodeClass::Merge,
            "Switch" => NodeClass::Switch,
            _ => NodeClass::Plain,
        })
    }

    pub fn is_enter(&self) -> bool {
        matches!(self, NodeClass::Enter { .. })
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, NodeClass::Merge)
    }
}

// ============================================================================
// 3. FLATTENED VIEW
// ============================================================================

/// One fused output edge record: where slot `src_slot` flows.
#[derive(Debug, Clone)]
pub struct EdgeInfo {
    pub dst: usize,
    pub src_slot: usize,
    /// Input slot on the destination; None for control edges.
    pub dst_slot: Option<usize>,
    /// Last edge out of the source; the value may be moved, not cloned.
    pub is_last: bool,
}

pub struct NodeItem {
    pub id: usize,
    pub name: String,
    pub op: String,
    pub class: NodeClass,
    pub kernel: KernelRef,
    pub is_expensive: bool,

    /// Offset of this node's input slots in its frame's input table.
    pub input_start: usize,
    pub num_inputs: usize,
    pub num_control_inputs: usize,

    pub output_dtypes: Vec<DataType>,
    pub output_attrs: Vec<AllocAttributes>,
    pub out_edges: Vec<EdgeInfo>,

    /// Index into GraphView::frames.
    pub frame: usize,
    /// Whether any input arrives by reference; such nodes cannot retry on
    /// OOM because the mutation cannot be rolled back.
    pub has_ref_input: bool,

    pub attrs: HashMap<String, Value>,
}

/// Static description of one lexical loop frame.
pub struct FrameInfo {
    pub name: String,
    pub parent: Option<usize>,
    pub nodes: Vec<usize>,
    /// Size of the per-iteration input-tensor table.
    pub total_inputs: usize,
    /// Initial pending count per node in this frame (indexed by node id).
    pub pending_init: HashMap<usize, i32>,
    /// Enter nodes feeding this frame; a dynamic instance is complete only
    /// after all of them have fired.
    pub enter_count: usize,
    pub max_parallel_iterations: usize,
}

pub struct GraphView {
    pub name: String,
    pub fingerprint: String,
    pub nodes: Vec<NodeItem>,
    pub frames: Vec<FrameInfo>,
    /// Nodes with no in-edges; the initial ready queue.
    pub roots: Vec<usize>,
    /// Client-terminated recv nodes whose shapes can be prefetched.
    pub recv_nodes: Vec<usize>,
}

impl GraphView {
    pub fn frame_index(&self, name: &str) -> Option<usize> {
        self.frames.iter().position(|f| f.name == name)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeItem> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

// ============================================================================
// 4. BUILDING
// ============================================================================

struct ParsedInput {
    src: usize,
    src_slot: usize,
    control: bool,
}

fn parse_input(spec: &str, index: &HashMap<String, usize>) -> Result<ParsedInput> {
    let (control, rest) = match spec.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    let (name, slot) = match rest.rsplit_once(':') {
        Some((n, s)) if s.chars().all(|c| c.is_ascii_digit()) => {
            (n, s.parse::<usize>().unwrap_or(0))
        }
        _ => (rest, 0),
    };
    let src = *index
        .get(name)
        .ok_or_else(|| Status::invalid_argument(format!("unknown input node: {}", name)))?;
    Ok(ParsedInput { src, src_slot: slot, control })
}

pub fn build_graph_view(def: &GraphDef, registry: &OpRegistry) -> Result<GraphView> {
    if def.nodes.is_empty() {
        return Err(Status::invalid_argument("graph has no nodes"));
    }

    let mut index: HashMap<String, usize> = HashMap::with_capacity(def.nodes.len());
    for (i, node) in def.nodes.iter().enumerate() {
        if index.insert(node.name.clone(), i).is_some() {
            return Err(Status::invalid_argument(format!("duplicate node name: {}", node.name)));
        }
    }

    // Parse inputs up front.
    let mut inputs: Vec<Vec<ParsedInput>> = Vec::with_capacity(def.nodes.len());
    for node in &def.nodes {
        let mut parsed = Vec::with_capacity(node.inputs.len());
        for spec in &node.inputs {
            parsed.push(parse_input(spec, &index)?);
        }
        inputs.push(parsed);
    }

    // Cycle check on the forward graph. NextIteration edges are the only
    // sanctioned back edges.
    let mut forward: DiGraph<usize, ()> = DiGraph::new();
    let pg_nodes: Vec<_> = (0..def.nodes.len()).map(|i| forward.add_node(i)).collect();
    for (dst, parsed) in inputs.iter().enumerate() {
        if def.nodes[dst].op == "Merge" {
            // Merge's NextIteration input closes the loop; skip back edges.
            for p in parsed {
                if def.nodes[p.src].op != "NextIteration" {
                    forward.add_edge(pg_nodes[p.src], pg_nodes[dst], ());
                }
            }
        } else {
            for p in parsed {
                forward.add_edge(pg_nodes[p.src], pg_nodes[dst], ());
            }
        }
    }
    if petgraph::algo::toposort(&forward, None).is_err() {
        return Err(Status::invalid_argument(
            "graph contains a cycle not closed by NextIteration",
        ));
    }

    // Control-flow analysis: assign every node to a lexical frame.
    let (frame_names, parent_of) = build_control_flow(def, &inputs)?;
    let mut frames: Vec<FrameInfo> = Vec::new();
    let mut frame_index: HashMap<String, usize> = HashMap::new();
    for name in &frame_names {
        if !frame_index.contains_key(name) {
            frame_index.insert(name.clone(), frames.len());
            frames.push(FrameInfo {
                name: name.clone(),
                parent: None,
                nodes: Vec::new(),
                total_inputs: 0,
                pending_init: HashMap::new(),
                enter_count: 0,
                max_parallel_iterations: DEFAULT_MAX_PARALLEL_ITERATIONS,
            });
        }
    }
    for (name, parent) in &parent_of {
        let idx = frame_index[name];
        frames[idx].parent = Some(frame_index[parent]);
    }

    // Materialise node items.
    let mut nodes: Vec<NodeItem> = Vec::with_capacity(def.nodes.len());
    for (id, node) in def.nodes.iter().enumerate() {
        let class = NodeClass::from_op(&node.op, &node.attrs)?;
        let kernel = registry.create(&node.op, &node.attrs)?;

        let num_inputs = inputs[id].iter().filter(|p| !p.control).count();
        let num_control_inputs = inputs[id].len() - num_inputs;

        let output_dtypes = kernel.output_dtypes();
        let on_host = node.attrs.get("on_host").and_then(|v| v.as_bool()).unwrap_or(false);
        let output_attrs = vec![AllocAttributes { on_host }; output_dtypes.len()];

        let is_expensive = node
            .attrs
            .get("expensive")
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| kernel.is_expensive());

        let frame = frame_index[&frame_names[id]];
        frames[frame].nodes.push(id);

        nodes.push(NodeItem {
            id,
            name: node.name.clone(),
            op: node.op.clone(),
            class,
            kernel,
            is_expensive,
            input_start: 0,
            num_inputs,
            num_control_inputs,
            output_dtypes,
            output_attrs,
            out_edges: Vec::new(),
            frame,
            has_ref_input: false,
            attrs: node.attrs.clone(),
        });
    }

    // Loop attribute: any node in a frame may raise its parallelism bound.
    for item in &nodes {
        if let Some(n) = item.attrs.get("max_parallel_iterations").and_then(|v| v.as_u64()) {
            frames[item.frame].max_parallel_iterations = (n as usize).max(1);
        }
    }

    // How many Enter nodes feed each frame.
    for item in &nodes {
        if let NodeClass::Enter { frame_name, .. } = &item.class {
            if let Some(&idx) = frame_index.get(frame_name) {
                frames[idx].enter_count += 1;
            }
        }
    }

    // Input-table offsets, assigned frame by frame.
    for frame in frames.iter_mut() {
        let mut offset = 0;
        for &id in &frame.nodes {
            nodes[id].input_start = offset;
            offset += nodes[id].num_inputs;
        }
        frame.total_inputs = offset;
    }

    // Fused output edge records, with slot mapping per destination.
    let mut slot_cursor: Vec<usize> = vec![0; def.nodes.len()];
    for (dst, parsed) in inputs.iter().enumerate() {
        for p in parsed {
            let dst_slot = if p.control {
                None
            } else {
                let s = slot_cursor[dst];
                slot_cursor[dst] += 1;
                Some(s)
            };
            if dst_slot.is_some() && p.src_slot >= nodes[p.src].output_dtypes.len() {
                return Err(Status::invalid_argument(format!(
                    "{} consumes output {} of {}, which has {} outputs",
                    def.nodes[dst].name,
                    p.src_slot,
                    def.nodes[p.src].name,
                    nodes[p.src].output_dtypes.len()
                )));
            }
            nodes[p.src].out_edges.push(EdgeInfo {
                dst,
                src_slot: p.src_slot,
                dst_slot,
                is_last: false,
            });
        }
    }
    for item in nodes.iter_mut() {
        if let Some(last) = item.out_edges.last_mut() {
            last.is_last = true;
        }
    }
    // Reference inputs: a consumer of a ref-producing op receives refs.
    let ref_sources: Vec<bool> = nodes.iter().map(|n| n.kernel.produces_ref_outputs()).collect();
    for (dst, parsed) in inputs.iter().enumerate() {
        if parsed.iter().any(|p| !p.control && ref_sources[p.src]) {
            nodes[dst].has_ref_input = true;
        }
    }

    // Pending-count layout per frame.
    for frame in frames.iter_mut() {
        for &id in &frame.nodes {
            let item = &nodes[id];
            let init = if item.class.is_merge() {
                2 * item.num_control_inputs as i32 + 1
            } else {
                (item.num_inputs + item.num_control_inputs) as i32
            };
            frame.pending_init.insert(id, init);
        }
    }

    let roots: Vec<usize> =
        (0..nodes.len()).filter(|&i| inputs[i].is_empty()).collect();
    if roots.is_empty() {
        return Err(Status::invalid_argument("graph has no root nodes"));
    }

    let recv_nodes: Vec<usize> =
        nodes.iter().filter(|n| n.op == "Recv").map(|n| n.id).collect();

    Ok(GraphView {
        name: def.name.clone(),
        fingerprint: def.fingerprint(),
        nodes,
        frames,
        roots,
        recv_nodes,
    })
}

/// Breadth-first frame assignment. An Enter node executes in the parent
/// frame; its successors live in the frame it opens. An Exit executes in
/// the child frame; its successors are back in the parent. Everything else
/// inherits the frame of its predecessors.
fn build_control_flow(
    def: &GraphDef,
    inputs: &[Vec<ParsedInput>],
) -> Result<(Vec<String>, HashMap<String, String>)> {
    let n = def.nodes.len();
    let mut frame_of: Vec<Option<String>> = vec![None; n];
    let mut parent_of: HashMap<String, String> = HashMap::new();

    // Successor lists from the parsed inputs.
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (dst, parsed) in inputs.iter().enumerate() {
        for p in parsed {
            succs[p.src].push(dst);
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, parsed) in inputs.iter().enumerate() {
        if parsed.is_empty() {
            frame_of[i] = Some(ROOT_FRAME.to_string());
            queue.push_back(i);
        }
    }

    while let Some(cur) = queue.pop_front() {
        let cur_frame = frame_of[cur].clone().unwrap();
        let cur_node = &def.nodes[cur];

        // Frame the values leaving `cur` land in.
        let out_frame = match cur_node.op.as_str() {
            "Enter" => {
                let child = cur_node
                    .attrs
                    .get("frame_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Status::invalid_argument("Enter node missing frame_name attr"))?
                    .to_string();
                match parent_of.get(&child) {
                    Some(p) if p != &cur_frame => {
                        return Err(Status::invalid_argument(format!(
                            "frame {} entered from both {} and {}",
                            child, p, cur_frame
                        )));
                    }
                    None => {
                        parent_of.insert(child.clone(), cur_frame.clone());
                    }
                    _ => {}
                }
                child
            }
            "Exit" => parent_of.get(&cur_frame).cloned().ok_or_else(|| {
                Status::invalid_argument(format!("Exit node {} outside any frame", cur_node.name))
            })?,
            _ => cur_frame.clone(),
        };

        for &next in &succs[cur] {
            match &frame_of[next] {
                Some(existing) if *existing != out_frame => {
                    return Err(Status::invalid_argument(format!(
                        "node {} reached from frames {} and {}",
                        def.nodes[next].name, existing, out_frame
                    )));
                }
                Some(_) => {}
                None => {
                    frame_of[next] = Some(out_frame.clone());
                    queue.push_back(next);
                }
            }
        }
    }

    let mut result = Vec::with_capacity(n);
    for (i, f) in frame_of.into_iter().enumerate() {
        match f {
            Some(f) => result.push(f),
            None => {
                return Err(Status::invalid_argument(format!(
                    "node {} unreachable from any root",
                    def.nodes[i].name
                )))
            }
        }
    }
    Ok((result, parent_of))
}
