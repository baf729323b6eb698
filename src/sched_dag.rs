//! The per-block scheduling DAG.
//!
//! One node per instruction, created fresh for each block's scheduling pass.
//! Edges follow true SSA dependencies (plus address/predicate references and
//! the barrier pass's false dependencies) and carry two weights: the soft
//! delay that biases selection priority and the hard delay that bounds
//! `earliest_ip`.  Pseudo split/collect producers are transparent for delay
//! purposes; the latency of the real producer behind them is what counts.

use crate::delay::DelayModel;
use crate::ir::{BlockId, InstrId, Opcode, Shader};
use crate::result::{SchedResult, ScheduleError};
use rustc_hash::{FxHashMap, FxHashSet};

/// A dependency edge to a consumer.
#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub child: usize,
    /// Priority-bias delay in cycles.
    pub soft: u32,
    /// Never-violated issue delay in cycles.
    pub hard: u32,
}

/// Scheduling state for one instruction.
#[derive(Debug)]
pub struct SchedNode {
    pub instr: InstrId,
    /// Position in pre-scheduling program order; the nearest-use heuristic
    /// measures distance in these units.
    pub orig_ip: u32,
    /// Local issue delay: the largest soft edge weight to any consumer.
    pub delay: u32,
    /// Longest soft-weighted path to a sink.
    pub max_delay: u32,
    /// Earliest cycle this instruction may issue given already-scheduled
    /// producers.
    pub earliest_ip: u32,
    pub unscheduled_parents: u32,
    pub scheduled: bool,
    /// The collect consuming this node, when it assembles part of a vector.
    pub collect: Option<InstrId>,
    /// A collect sibling has been scheduled, so the vector's registers are
    /// already accounted as live.
    pub partially_live: bool,
    /// A shader output with no consuming instruction.
    pub output: bool,
    /// Lies on a dependency path leading to a kill/discard.
    pub kill_path: bool,
    pub children: Vec<Edge>,
    pub parents: Vec<usize>,
}

/// The block's dependency DAG.
#[derive(Debug)]
pub struct SchedDag {
    pub nodes: Vec<SchedNode>,
    index: FxHashMap<InstrId, usize>,
}

impl SchedDag {
    pub fn build(
        shader: &Shader,
        block: BlockId,
        model: &dyn DelayModel,
    ) -> SchedResult<SchedDag> {
        let mut dag = SchedDag {
            nodes: Vec::with_capacity(shader.block(block).instrs.len()),
            index: FxHashMap::default(),
        };

        for (pos, &id) in shader.block(block).instrs.iter().enumerate() {
            let idx = dag.nodes.len();
            if dag.index.insert(id, idx).is_some() {
                return Err(ScheduleError::MalformedDag { instr: id });
            }
            dag.nodes.push(SchedNode {
                instr: id,
                orig_ip: pos as u32,
                delay: 0,
                max_delay: 0,
                earliest_ip: 0,
                unscheduled_parents: 0,
                scheduled: false,
                collect: None,
                partially_live: false,
                output: false,
                kill_path: false,
                children: Vec::new(),
                parents: Vec::new(),
            });
        }

        let outputs: FxHashSet<InstrId> = shader.outputs.iter().copied().collect();

        for cidx in 0..dag.nodes.len() {
            let cid = dag.nodes[cidx].instr;
            let consumer = &shader[cid];

            for (n, src) in consumer.srcs.iter().enumerate() {
                let Some(pid) = src.as_ssa() else { continue };
                // Cross-block producers impose no local ordering.
                let Some(&pidx) = dag.index.get(&pid) else { continue };
                if pidx >= cidx {
                    return Err(ScheduleError::MalformedDag { instr: cid });
                }
                let soft = edge_delay(shader, model, pid, consumer, n, true);
                let hard = edge_delay(shader, model, pid, consumer, n, false);
                dag.add_edge(pidx, cidx, soft, hard);
                if consumer.opc == Opcode::MetaCollect {
                    dag.nodes[pidx].collect = Some(cid);
                }
            }

            for pid in consumer
                .address
                .iter()
                .chain(consumer.predicate.iter())
                .copied()
                .collect::<Vec<_>>()
            {
                let Some(&pidx) = dag.index.get(&pid) else { continue };
                if pidx >= cidx {
                    return Err(ScheduleError::MalformedDag { instr: cid });
                }
                let soft = model.delay(&shader[pid], consumer, 0, true);
                let hard = model.delay(&shader[pid], consumer, 0, false);
                dag.add_edge(pidx, cidx, soft, hard);
            }

            for pid in consumer.deps.iter().copied().collect::<Vec<_>>() {
                let Some(&pidx) = dag.index.get(&pid) else { continue };
                if pidx >= cidx {
                    return Err(ScheduleError::MalformedDag { instr: cid });
                }
                dag.add_edge(pidx, cidx, 0, 0);
            }
        }

        for idx in 0..dag.nodes.len() {
            let node = &dag.nodes[idx];
            if node.children.is_empty() && outputs.contains(&node.instr) {
                dag.nodes[idx].output = true;
            }
        }

        dag.mark_kill_paths(shader);
        dag.compute_max_delay();
        Ok(dag)
    }

    pub fn get(&self, id: InstrId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn add_edge(&mut self, parent: usize, child: usize, soft: u32, hard: u32) {
        self.nodes[parent].children.push(Edge { child, soft, hard });
        self.nodes[child].parents.push(parent);
        if !self.nodes[parent].scheduled {
            self.nodes[child].unscheduled_parents += 1;
        }
    }

    /// Add a node for an instruction created mid-schedule (a hazard-breaking
    /// clone).  Edges from any still-unscheduled producers are added; the
    /// caller wires up the consumers.
    pub fn add_cloned_node(&mut self, shader: &Shader, id: InstrId, ip: u32) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(SchedNode {
            instr: id,
            orig_ip: ip,
            delay: 0,
            max_delay: 0,
            earliest_ip: ip,
            unscheduled_parents: 0,
            scheduled: false,
            collect: None,
            partially_live: false,
            output: false,
            kill_path: false,
            children: Vec::new(),
            parents: Vec::new(),
        });
        self.index.insert(id, idx);

        let producers: Vec<InstrId> =
            shader[id].srcs.iter().filter_map(|s| s.as_ssa()).collect();
        for pid in producers {
            if let Some(&pidx) = self.index.get(&pid) {
                if !self.nodes[pidx].scheduled {
                    self.add_edge(pidx, idx, 0, 0);
                }
            }
        }
        idx
    }

    /// Walk ancestor chains from every kill so speculative tex/mem work not
    /// feeding a kill can be recognized and held back.
    fn mark_kill_paths(&mut self, shader: &Shader) {
        let mut stack: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| shader[n.instr].opc.is_kill())
            .map(|(i, _)| i)
            .collect();
        while let Some(idx) = stack.pop() {
            if self.nodes[idx].kill_path {
                continue;
            }
            self.nodes[idx].kill_path = true;
            stack.extend(self.nodes[idx].parents.iter().copied());
        }
    }

    /// Bottom-up `max_delay`: sinks first.  Node creation order is program
    /// order and every edge points forward in it, so the reverse order
    /// visits no node before its children.
    fn compute_max_delay(&mut self) {
        for idx in (0..self.nodes.len()).rev() {
            let delay = self
                .nodes[idx]
                .children
                .iter()
                .map(|e| e.soft)
                .max()
                .unwrap_or(0);
            let best_child = self
                .nodes[idx]
                .children
                .iter()
                .map(|e| self.nodes[e.child].max_delay)
                .max();
            let node = &mut self.nodes[idx];
            node.delay = delay;
            node.max_delay = match best_child {
                Some(c) => c + delay,
                None => delay,
            };
        }
    }
}

/// Delay between a producer and consumer, looking through split/collect
/// wrappers to the real producer.
fn edge_delay(
    shader: &Shader,
    model: &dyn DelayModel,
    prod: InstrId,
    consumer: &crate::ir::Instr,
    src_idx: usize,
    soft: bool,
) -> u32 {
    let p = &shader[prod];
    match p.opc {
        Opcode::MetaSplit | Opcode::MetaCollect => p
            .srcs
            .iter()
            .filter_map(|s| s.as_ssa())
            .map(|q| edge_delay(shader, model, q, consumer, src_idx, soft))
            .max()
            .unwrap_or(0),
        _ => model.delay(p, consumer, src_idx, soft),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ShaderBuilder;
    use crate::delay::GenericDelayModel;
    use crate::ir::{Opcode, RegType::*, Src};

    fn ssa(id: InstrId) -> Src {
        Src::ssa(id, 0)
    }

    #[test]
    fn chain_max_delay_accumulates() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let a = b.alu2(Opcode::Add, ssa(x), ssa(x), F32);
        let m = b.alu2(Opcode::Mul, ssa(a), ssa(a), F32);
        b.output(m);
        let shader = b.finish();
        let model = GenericDelayModel::default();

        let dag = SchedDag::build(&shader, BlockId::new(0), &model).unwrap();
        let xi = dag.get(x).unwrap();
        let ai = dag.get(a).unwrap();
        let mi = dag.get(m).unwrap();

        // mul is a sink with no consumers.
        assert_eq!(dag.nodes[mi].max_delay, 0);
        assert_eq!(dag.nodes[ai].max_delay, 3);
        // input -> add is a meta edge (0) but max_delay still sees the
        // add -> mul leg below it.
        assert_eq!(dag.nodes[xi].max_delay, 3);
        assert!(dag.nodes[mi].output);
        assert!(!dag.nodes[ai].output);
        assert_eq!(dag.nodes[mi].unscheduled_parents, 2);
    }

    #[test]
    fn split_is_transparent_for_delay() {
        let mut b = ShaderBuilder::new();
        let c = b.input(F32);
        let tex = b.sam(ssa(c), None);
        let s0 = b.split(tex, 0, F32);
        let add = b.alu2(Opcode::Add, ssa(s0), ssa(s0), F32);
        b.output(add);
        let shader = b.finish();
        let model = GenericDelayModel::default();

        let dag = SchedDag::build(&shader, BlockId::new(0), &model).unwrap();
        let si = dag.get(s0).unwrap();
        // The split's edge to add carries the texture's soft latency.
        let e = &dag.nodes[si].children[0];
        assert_eq!(e.soft, 10);
        assert_eq!(e.hard, 0);
    }

    #[test]
    fn kill_paths_marked_through_ancestors() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let cmp = b.alu2(Opcode::Cmp, ssa(x), Src::imm(0), F32);
        let p = b.movp(ssa(cmp));
        let k = b.kill(p);
        let unrelated = b.alu2(Opcode::Add, ssa(x), ssa(x), F32);
        b.output(unrelated);
        let shader = b.finish();
        let model = GenericDelayModel::default();

        let dag = SchedDag::build(&shader, BlockId::new(0), &model).unwrap();
        assert!(dag.nodes[dag.get(k).unwrap()].kill_path);
        assert!(dag.nodes[dag.get(p).unwrap()].kill_path);
        assert!(dag.nodes[dag.get(cmp).unwrap()].kill_path);
        assert!(dag.nodes[dag.get(x).unwrap()].kill_path);
        assert!(!dag.nodes[dag.get(unrelated).unwrap()].kill_path);
    }

    #[test]
    fn collect_sources_carry_back_reference() {
        let mut b = ShaderBuilder::new();
        let a = b.input(F32);
        let c = b.input(F32);
        let vec = b.collect(&[a, c], F32);
        let sam = b.sam(ssa(vec), None);
        b.output(sam);
        let shader = b.finish();
        let model = GenericDelayModel::default();

        let dag = SchedDag::build(&shader, BlockId::new(0), &model).unwrap();
        assert_eq!(dag.nodes[dag.get(a).unwrap()].collect, Some(vec));
        assert_eq!(dag.nodes[dag.get(c).unwrap()].collect, Some(vec));
        assert_eq!(dag.nodes[dag.get(vec).unwrap()].collect, None);
    }

    #[test]
    fn duplicate_instruction_is_malformed() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        b.output(x);
        let mut shader = b.finish();
        let dup = shader.blocks[0].instrs[0];
        shader.blocks[0].instrs.push(dup);
        let model = GenericDelayModel::default();

        let err = SchedDag::build(&shader, BlockId::new(0), &model).unwrap_err();
        assert_eq!(err, ScheduleError::MalformedDag { instr: dup });
    }
}
