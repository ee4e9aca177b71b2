use crate::{
    BlockGraph, BlockId, CountState, DepDirection, DepType, InstructionClass, NodeId, NodeRoles,
    Result, SchedDg, SchedulerConfig,
};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

fn one() -> f64 {
    1.0
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeDescription {
    pub address: u64,
    /// micro-op index inside the native instruction
    #[serde(default)]
    pub uop: u32,
    pub class: InstructionClass,
    #[serde(default)]
    pub roles: NodeRoles,
    /// extra load latency from the memory model
    #[serde(default)]
    pub mem_penalty: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EdgeDescription {
    pub src: u32,
    pub dst: u32,
    pub direction: DepDirection,
    pub dtype: DepType,
    #[serde(default)]
    pub distance: u32,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub overlapped: bool,
    #[serde(default = "one")]
    pub probability: f64,
    /// reuse an equal edge instead of adding a parallel one
    #[serde(default)]
    pub unique: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BlockDescription {
    pub count: CountState,
    #[serde(default)]
    pub source: bool,
    #[serde(default)]
    pub sink: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ArcDescription {
    pub src: u32,
    pub dst: u32,
    #[serde(default)]
    pub count: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LevelMisses {
    pub level: i32,
    pub misses: f64,
}

/// One executed path as produced by the graph builder.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GraphDescription {
    #[serde(default)]
    pub name: String,
    /// times the path executed, used to weight reports
    #[serde(default = "one")]
    pub frequency: f64,
    /// average loop iterations per path execution
    #[serde(default = "one")]
    pub avg_iterations: f64,
    pub nodes: Vec<NodeDescription>,
    pub edges: Vec<EdgeDescription>,
    /// misses per memory level from the memory model
    #[serde(default)]
    pub misses: Vec<LevelMisses>,
    /// basic block counts of the enclosing routine
    #[serde(default)]
    pub blocks: Vec<BlockDescription>,
    #[serde(default)]
    pub arcs: Vec<ArcDescription>,
}

impl GraphDescription {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<GraphDescription> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn into_graph(&self, config: SchedulerConfig) -> Result<SchedDg> {
        let mut dg = SchedDg::new(config);
        for node in &self.nodes {
            let id = dg.add_node(node.address, node.uop, node.class);
            let n = dg.node_mut(id)?;
            n.roles = node.roles;
            n.mem_penalty = node.mem_penalty;
        }
        for edge in &self.edges {
            let add = if edge.unique {
                SchedDg::add_unique_dependency
            } else {
                SchedDg::add_dependency
            };
            add(
                &mut dg,
                NodeId(edge.src),
                NodeId(edge.dst),
                edge.direction,
                edge.dtype,
                edge.distance,
                edge.level,
                edge.overlapped,
                edge.probability,
            )?;
        }
        dg.set_level_misses(self.misses.iter().map(|m| (m.level, m.misses)).collect());
        Ok(dg)
    }

    /// Block count graph, if the description carries one.
    pub fn block_graph(&self) -> Option<BlockGraph> {
        if self.blocks.is_empty() {
            return None;
        }
        let mut graph = BlockGraph::new();
        for block in &self.blocks {
            graph.add_block(block.count, block.source, block.sink);
        }
        for arc in &self.arcs {
            if arc.src as usize >= self.blocks.len() || arc.dst as usize >= self.blocks.len() {
                log::warn!("Dropping arc {} -> {} to an unknown block", arc.src, arc.dst);
                continue;
            }
            graph.add_arc(BlockId(arc.src), BlockId(arc.dst), arc.count);
        }
        Some(graph)
    }
}
