//! The list scheduler.
//!
//! Each block is scheduled independently.  The pre-pass barrier dependencies
//! and the DAG from [`crate::sched_dag`] fix what *may* be reordered; the
//! heuristic below decides what *should* issue next, balancing latency
//! hiding against register pressure.  Priority cascades through five tiers:
//!
//!   1. pseudo-instructions other than collects, largest `max_delay` first;
//!   2. pressure-decreasing candidates, with hazard deferral;
//!   3. the same without deferral, for when everything ready is deferred;
//!   4. any remaining head, ready-first, nearest use wins, skipping pure
//!      outputs;
//!   5. the same including outputs.
//!
//! The address registers (a0, a1) and the predicate register have no
//! renaming, so at most one live writer of each may exist at a time.  When
//! that serialization wedges the block, the live writer is cloned and its
//! remaining consumers repointed to the clone, which frees the register.

use crate::delay::DelayModel;
use crate::ir::{BlockId, InstrId, Opcode, Shader};
use crate::result::{SchedResult, ScheduleError};
use crate::sched_dag::SchedDag;
use crate::sched_deps::add_barrier_deps;
use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Scheduler tuning knobs.
///
/// The defaults are empirically chosen and carried as configuration rather
/// than load-bearing structure.
#[derive(Clone, Copy, Debug)]
pub struct SchedConfig {
    /// Outstanding texture-class operations allowed before further producers
    /// are deferred.
    pub max_outstanding_tex: u32,
    /// Likewise for SFU operations.
    pub max_outstanding_sfu: u32,
    /// Right shift applied to the nearest-use distance of shader inputs,
    /// biasing them toward early scheduling.
    pub input_distance_shift: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            max_outstanding_tex: 8,
            max_outstanding_sfu: 8,
            input_distance_shift: 1,
        }
    }
}

impl Shader {
    /// Schedule every block, rewriting each block's instruction list into
    /// final emission order.
    pub fn schedule(
        &mut self,
        model: &dyn DelayModel,
        config: &SchedConfig,
    ) -> SchedResult<()> {
        let blocks: Vec<BlockId> = self.block_ids().collect();
        for block in blocks {
            add_barrier_deps(self, block);
            schedule_block(self, block, model, config)?;
        }
        Ok(())
    }
}

/// Schedule one block.
pub fn schedule_block(
    shader: &mut Shader,
    block: BlockId,
    model: &dyn DelayModel,
    config: &SchedConfig,
) -> SchedResult<()> {
    let dag = SchedDag::build(shader, block, model)?;
    let mut ctx = BlockSched::new(shader, block, dag, model, config);
    ctx.run(shader)?;
    shader.block_mut(block).instrs = ctx.order;
    Ok(())
}

/// Which special register an instruction writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Special {
    Addr0,
    Addr1,
    Pred,
}

fn writes_special(opc: Opcode) -> Option<Special> {
    if opc.writes_addr0() {
        Some(Special::Addr0)
    } else if opc.writes_addr1() {
        Some(Special::Addr1)
    } else if opc.writes_pred() {
        Some(Special::Pred)
    } else {
        None
    }
}

/// The live writer of one special register and how many unscheduled
/// consumers still need it.
#[derive(Default)]
struct SpecialSlot {
    writer: Option<InstrId>,
    pending: u32,
}

/// Conflicts recorded while a choose pass ran; consulted for deadlock
/// breaking when the pass comes back empty.
#[derive(Default)]
struct ConflictNotes {
    addr0: bool,
    addr1: bool,
    pred: bool,
}

impl ConflictNotes {
    fn any(&self) -> bool {
        self.addr0 || self.addr1 || self.pred
    }
}

/// Per-block scheduling state.
struct BlockSched<'a> {
    block: BlockId,
    model: &'a dyn DelayModel,
    config: &'a SchedConfig,
    dag: SchedDag,
    /// The final emission order, built up by appending.
    order: Vec<InstrId>,
    unscheduled: usize,
    /// Issue-cycle counter.
    ip: u32,
    addr0: SpecialSlot,
    addr1: SpecialSlot,
    pred: SpecialSlot,
    outstanding_tex: FxHashSet<InstrId>,
    outstanding_sfu: FxHashSet<InstrId>,
    /// Rolling soft-latency budgets; positive while hiding latency of the
    /// newest producer of the class is still worthwhile.
    sy_delay: u32,
    ss_delay: u32,
    remaining_kills: u32,
    remaining_tex: u32,
    remaining_bary: u32,
    /// A just-injected clone that must not be chosen as the very next
    /// instruction, so the split actually breaks the deadlock.
    split_lock: Option<InstrId>,
    notes: ConflictNotes,
    /// Unscheduled in-block consumers per producing instruction, for the
    /// live-effect estimate.
    value_uses: FxHashMap<InstrId, u32>,
}

impl<'a> BlockSched<'a> {
    fn new(
        shader: &Shader,
        block: BlockId,
        dag: SchedDag,
        model: &'a dyn DelayModel,
        config: &'a SchedConfig,
    ) -> BlockSched<'a> {
        let mut remaining_kills = 0;
        let mut remaining_tex = 0;
        let mut remaining_bary = 0;
        let mut value_uses: FxHashMap<InstrId, u32> = FxHashMap::default();

        for &id in &shader.block(block).instrs {
            let instr = &shader[id];
            if instr.opc.is_kill() {
                remaining_kills += 1;
            }
            if instr.opc.is_sy_producer() {
                remaining_tex += 1;
            }
            if instr.opc == Opcode::Bary {
                remaining_bary += 1;
            }
            for p in distinct_producers(shader, id) {
                *value_uses.entry(p).or_insert(0) += 1;
            }
        }

        let unscheduled = dag.nodes.len();
        BlockSched {
            block,
            model,
            config,
            dag,
            order: Vec::with_capacity(unscheduled),
            unscheduled,
            ip: 0,
            addr0: SpecialSlot::default(),
            addr1: SpecialSlot::default(),
            pred: SpecialSlot::default(),
            outstanding_tex: FxHashSet::default(),
            outstanding_sfu: FxHashSet::default(),
            sy_delay: 0,
            ss_delay: 0,
            remaining_kills,
            remaining_tex,
            remaining_bary,
            split_lock: None,
            notes: ConflictNotes::default(),
            value_uses,
        }
    }

    fn run(&mut self, shader: &mut Shader) -> SchedResult<()> {
        debug!("{}: scheduling {} instructions", self.block, self.unscheduled);

        // Fixed pre-pass: block-entry values, then texture prefetches, then
        // push-constant macros, each class fully drained before the next.
        self.drain_class(shader, |opc| opc.is_input());
        self.drain_class(shader, |opc| opc == Opcode::MetaTexPrefetch);
        self.drain_class(shader, |opc| opc == Opcode::PushConst);

        while self.unscheduled > 0 {
            self.notes = ConflictNotes::default();
            if let Some(idx) = self.choose_instr(shader) {
                self.schedule(shader, idx);
                continue;
            }
            if self.notes.any() {
                self.split(shader);
                continue;
            }
            if self.split_lock.take().is_some() {
                // The lock itself was starving the only candidate.
                continue;
            }
            return Err(ScheduleError::Deadlock { block: self.block });
        }
        Ok(())
    }

    fn drain_class(&mut self, shader: &mut Shader, class: impl Fn(Opcode) -> bool) {
        loop {
            let head = (0..self.dag.nodes.len()).find(|&i| {
                let n = &self.dag.nodes[i];
                !n.scheduled
                    && n.unscheduled_parents == 0
                    && class(shader[n.instr].opc)
            });
            match head {
                Some(idx) => self.schedule(shader, idx),
                None => break,
            }
        }
    }

    // ---- instruction choice -------------------------------------------

    fn choose_instr(&mut self, shader: &Shader) -> Option<usize> {
        let heads: Vec<usize> = (0..self.dag.nodes.len())
            .filter(|&i| {
                let n = &self.dag.nodes[i];
                !n.scheduled && n.unscheduled_parents == 0
            })
            .collect();

        if let Some(idx) = self.choose_prio(shader, &heads) {
            return Some(idx);
        }
        if let Some(idx) = self.choose_dec(shader, &heads, true) {
            return Some(idx);
        }
        if let Some(idx) = self.choose_dec(shader, &heads, false) {
            return Some(idx);
        }
        if let Some(idx) = self.choose_inc(shader, &heads, true) {
            return Some(idx);
        }
        self.choose_inc(shader, &heads, false)
    }

    /// Tier 1: pseudo-instructions, except collects whose operands carry
    /// ordinary pressure.  Largest `max_delay` first.
    fn choose_prio(&mut self, shader: &Shader, heads: &[usize]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for &idx in heads {
            let opc = shader[self.dag.nodes[idx].instr].opc;
            if !opc.is_meta() || opc == Opcode::MetaCollect {
                continue;
            }
            if !self.check_instr(shader, idx) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => self.dag.nodes[idx].max_delay > self.dag.nodes[b].max_delay,
            };
            if better {
                best = Some(idx);
            }
        }
        best
    }

    /// Tiers 2 and 3: candidates whose live-value effect is zero or
    /// negative.  Frees-and-ready beats frees-but-waits beats
    /// neutral-and-ready beats neutral-but-waits; ties go to the larger
    /// `max_delay`.
    fn choose_dec(&mut self, shader: &Shader, heads: &[usize], defer: bool) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for &idx in heads {
            if !self.check_instr(shader, idx) {
                continue;
            }
            if self.should_skip(shader, idx) {
                continue;
            }
            if defer && self.should_defer(shader, idx) {
                continue;
            }
            let effect = self.live_effect(shader, idx);
            if effect > 0 {
                continue;
            }
            let ready = self.dag.nodes[idx].earliest_ip <= self.ip;
            let rank = match (effect < 0, ready) {
                (true, true) => 0,
                (true, false) => 1,
                (false, true) => 2,
                (false, false) => 3,
            };
            let better = match best {
                None => true,
                Some((b, brank)) => {
                    rank < brank
                        || (rank == brank
                            && self.dag.nodes[idx].max_delay > self.dag.nodes[b].max_delay)
                }
            };
            if better {
                best = Some((idx, rank));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Tiers 4 and 5: pressure be damned; pick something ready, nearest use
    /// first.  Deferral plays no part here.  Pure outputs are held back on
    /// the first attempt so values with no further consumer are written as
    /// late as possible.
    fn choose_inc(
        &mut self,
        shader: &Shader,
        heads: &[usize],
        avoid_output: bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, u32, u32)> = None;
        for &idx in heads {
            if !self.check_instr(shader, idx) {
                continue;
            }
            if avoid_output && self.dag.nodes[idx].output {
                continue;
            }
            let node = &self.dag.nodes[idx];
            let wait = u32::from(node.earliest_ip > self.ip);
            let mut dist = node
                .children
                .iter()
                .map(|e| self.dag.nodes[e.child].orig_ip.saturating_sub(node.orig_ip))
                .min()
                .unwrap_or(u32::MAX);
            if shader[node.instr].opc.is_input() {
                dist >>= self.config.input_distance_shift;
            }
            let better = match best {
                None => true,
                Some((_, bwait, bdist)) => (wait, dist) < (bwait, bdist),
            };
            if better {
                best = Some((idx, wait, dist));
            }
        }
        best.map(|(idx, _, _)| idx)
    }

    // ---- candidate filters --------------------------------------------

    /// Speculative texture/memory work not feeding a kill is held while
    /// kills remain; a kill may make it unnecessary.
    fn should_skip(&self, shader: &Shader, idx: usize) -> bool {
        if self.remaining_kills == 0 {
            return false;
        }
        let node = &self.dag.nodes[idx];
        let opc = shader[node.instr].opc;
        (opc.is_tex() || opc.is_mem()) && !node.kill_path
    }

    /// Defer a candidate while latency hiding still has something to gain:
    /// its sources are outstanding and the class budget has not run down, or
    /// scheduling it would overflow the outstanding window.
    fn should_defer(&self, shader: &Shader, idx: usize) -> bool {
        let id = self.dag.nodes[idx].instr;
        let instr = &shader[id];
        if instr.opc.is_meta() {
            return false;
        }
        let real = real_producers(shader, id);
        if self.ss_delay > 0 && real.iter().any(|p| self.outstanding_sfu.contains(p)) {
            return true;
        }
        if self.sy_delay > 0
            && self.remaining_tex > 0
            && real.iter().any(|p| self.outstanding_tex.contains(p))
        {
            return true;
        }
        if instr.opc.is_sy_producer()
            && self.outstanding_tex.len() as u32 >= self.config.max_outstanding_tex
        {
            return true;
        }
        if instr.opc.is_ss_producer()
            && self.outstanding_sfu.len() as u32 >= self.config.max_outstanding_sfu
        {
            return true;
        }
        false
    }

    /// Registers made live minus registers freed, were `idx` scheduled now.
    fn live_effect(&self, shader: &Shader, idx: usize) -> i32 {
        let node = &self.dag.nodes[idx];
        let id = node.instr;
        let uses = self.value_uses.get(&id).copied().unwrap_or(0);

        let new_live = if node.partially_live || uses == 0 {
            // Either the collect vector is already counted or the value dies
            // on the spot.
            0
        } else if let Some(c) = node.collect {
            // The first scheduled source allocates the whole vector.
            shader[c].dst_comps() as i32
        } else {
            shader[id].dst_comps() as i32
        };

        let mut freed = 0i32;
        for p in distinct_producers(shader, id) {
            if self.value_uses.get(&p).copied().unwrap_or(0) == 1 {
                freed += shader[p].dst_comps() as i32;
            }
        }
        new_live - freed
    }

    // ---- hazard gate --------------------------------------------------

    /// May `idx` legally issue right now?  Records a conflict note when a
    /// special register is the obstacle.
    fn check_instr(&mut self, shader: &Shader, idx: usize) -> bool {
        let id = self.dag.nodes[idx].instr;
        let opc = shader[id].opc;

        if self.split_lock == Some(id) {
            return false;
        }
        // Kills wait until every interpolation has issued.
        if opc.is_kill() && self.remaining_bary > 0 {
            return false;
        }
        let Some(reg) = writes_special(opc) else {
            return true;
        };
        let occupied = match reg {
            Special::Addr0 => self.addr0.writer,
            Special::Addr1 => self.addr1.writer,
            Special::Pred => self.pred.writer,
        };
        if let Some(w) = occupied {
            debug_assert_ne!(w, id);
            match reg {
                Special::Addr0 => self.notes.addr0 = true,
                Special::Addr1 => self.notes.addr1 = true,
                Special::Pred => self.notes.pred = true,
            }
            return false;
        }
        // The register is scarce; only take it if some consumer can issue
        // immediately afterwards.
        self.writer_unlocks_consumer(shader, idx)
    }

    fn writer_unlocks_consumer(&self, shader: &Shader, widx: usize) -> bool {
        let wid = self.dag.nodes[widx].instr;
        if shader.block(self.block).brcond == Some(wid) {
            return true;
        }
        let mut pending = false;
        for e in &self.dag.nodes[widx].children {
            let child = &self.dag.nodes[e.child];
            if child.scheduled {
                continue;
            }
            let ci = &shader[child.instr];
            if ci.address != Some(wid) && ci.predicate != Some(wid) {
                continue;
            }
            pending = true;
            let from_writer = child
                .parents
                .iter()
                .filter(|&&p| p == widx)
                .count() as u32;
            if child.unscheduled_parents == from_writer {
                return true;
            }
        }
        // A writer with no remaining consumers holds nothing hostage.
        !pending
    }

    // ---- bookkeeping --------------------------------------------------

    fn schedule(&mut self, shader: &mut Shader, idx: usize) {
        let id = self.dag.nodes[idx].instr;
        let opc = shader[id].opc;

        let start = self.ip.max(self.dag.nodes[idx].earliest_ip);
        let issue = self.model.issue_cycles(&shader[id]);
        let elapsed = (start - self.ip) + issue;
        self.ip = start + issue;

        trace!("{}: @{start} schedule {id} ({opc})", self.block);
        self.dag.nodes[idx].scheduled = true;
        self.unscheduled -= 1;
        self.order.push(id);

        let edges: Vec<crate::sched_dag::Edge> = self.dag.nodes[idx].children.clone();
        for e in edges {
            let child = &mut self.dag.nodes[e.child];
            child.unscheduled_parents -= 1;
            child.earliest_ip = child.earliest_ip.max(start + e.hard);
        }

        if let Some(cid) = self.dag.nodes[idx].collect {
            let siblings: SmallVec<[InstrId; 8]> =
                shader[cid].srcs.iter().filter_map(|s| s.as_ssa()).collect();
            for s in siblings {
                if let Some(si) = self.dag.get(s) {
                    self.dag.nodes[si].partially_live = true;
                }
            }
        }

        for p in distinct_producers(shader, id) {
            if let Some(c) = self.value_uses.get_mut(&p) {
                *c = c.saturating_sub(1);
            }
        }

        let addr = shader[id].address;
        let pred = shader[id].predicate;
        for w in [addr, pred].into_iter().flatten() {
            self.release_special_use(w);
        }

        if opc.is_meta() {
            self.sy_delay = self.sy_delay.saturating_sub(elapsed);
            self.ss_delay = self.ss_delay.saturating_sub(elapsed);
        } else {
            let real = real_producers(shader, id);
            // Consuming an outstanding result forces a sync point covering
            // the whole class.
            if real.iter().any(|p| self.outstanding_tex.contains(p)) {
                self.outstanding_tex.clear();
                self.sy_delay = 0;
            } else {
                self.sy_delay = self.sy_delay.saturating_sub(elapsed);
            }
            if real.iter().any(|p| self.outstanding_sfu.contains(p)) {
                self.outstanding_sfu.clear();
                self.ss_delay = 0;
            } else {
                self.ss_delay = self.ss_delay.saturating_sub(elapsed);
            }
            if opc.is_sy_producer() {
                self.outstanding_tex.insert(id);
                self.sy_delay = self.model.sy_budget();
            }
            if opc.is_ss_producer() {
                self.outstanding_sfu.insert(id);
                self.ss_delay = self.model.ss_budget();
            }
        }

        if opc.is_kill() {
            self.remaining_kills -= 1;
        }
        if opc.is_sy_producer() {
            self.remaining_tex -= 1;
        }
        if opc == Opcode::Bary {
            self.remaining_bary -= 1;
        }

        if let Some(reg) = writes_special(opc) {
            self.install_writer(shader, id, reg);
        }

        self.split_lock = None;
    }

    fn slot_mut(&mut self, reg: Special) -> &mut SpecialSlot {
        match reg {
            Special::Addr0 => &mut self.addr0,
            Special::Addr1 => &mut self.addr1,
            Special::Pred => &mut self.pred,
        }
    }

    fn install_writer(&mut self, shader: &Shader, id: InstrId, reg: Special) {
        let pending = self
            .dag
            .nodes
            .iter()
            .filter(|n| {
                if n.scheduled {
                    return false;
                }
                let i = &shader[n.instr];
                i.address == Some(id) || i.predicate == Some(id)
            })
            .count() as u32;
        let slot = self.slot_mut(reg);
        if pending > 0 {
            slot.writer = Some(id);
            slot.pending = pending;
        } else {
            slot.writer = None;
            slot.pending = 0;
        }
    }

    fn release_special_use(&mut self, writer: InstrId) {
        for reg in [Special::Addr0, Special::Addr1, Special::Pred] {
            let slot = self.slot_mut(reg);
            if slot.writer == Some(writer) {
                slot.pending -= 1;
                if slot.pending == 0 {
                    slot.writer = None;
                }
                return;
            }
        }
    }

    // ---- deadlock breaking --------------------------------------------

    /// Clone the live writer of the conflicting special register, repoint
    /// every unscheduled consumer at the clone and free the register.  The
    /// clone is locked out of the very next pick so progress is guaranteed.
    fn split(&mut self, shader: &mut Shader) {
        let reg = if self.notes.addr0 {
            Special::Addr0
        } else if self.notes.addr1 {
            Special::Addr1
        } else {
            Special::Pred
        };
        let slot = self.slot_mut(reg);
        let orig = slot.writer.take().expect("conflict note without live writer");
        slot.pending = 0;

        let clone = shader.clone_instr(orig);
        let cidx = self.dag.add_cloned_node(shader, clone, self.ip);
        debug!("{}: split {orig} -> {clone} to free {reg:?}", self.block);

        for idx in 0..self.dag.nodes.len() {
            if idx == cidx || self.dag.nodes[idx].scheduled {
                continue;
            }
            let cons = self.dag.nodes[idx].instr;
            let mut repointed = false;
            if shader[cons].address == Some(orig) {
                shader[cons].address = Some(clone);
                repointed = true;
            }
            if shader[cons].predicate == Some(orig) {
                shader[cons].predicate = Some(clone);
                repointed = true;
            }
            if repointed {
                let soft = self.model.delay(&shader[clone], &shader[cons], 0, true);
                let hard = self.model.delay(&shader[clone], &shader[cons], 0, false);
                self.dag.add_edge(cidx, idx, soft, hard);
            }
        }
        if shader.block(self.block).brcond == Some(orig) {
            shader.block_mut(self.block).brcond = Some(clone);
        }

        // The clone re-reads the original's sources.
        for p in distinct_producers(shader, clone) {
            *self.value_uses.entry(p).or_insert(0) += 1;
        }
        self.unscheduled += 1;
        self.split_lock = Some(clone);
    }
}

/// Distinct direct SSA producers of `id`'s sources.
fn distinct_producers(shader: &Shader, id: InstrId) -> SmallVec<[InstrId; 8]> {
    let mut out = SmallVec::new();
    for src in &shader[id].srcs {
        if let Some(p) = src.as_ssa() {
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    out
}

/// Distinct real producers behind `id`'s sources, looking through
/// split/collect wrappers.
fn real_producers(shader: &Shader, id: InstrId) -> SmallVec<[InstrId; 8]> {
    fn walk(shader: &Shader, id: InstrId, out: &mut SmallVec<[InstrId; 8]>) {
        for src in &shader[id].srcs {
            if let Some(p) = src.as_ssa() {
                match shader[p].opc {
                    Opcode::MetaSplit | Opcode::MetaCollect => walk(shader, p, out),
                    _ => {
                        if !out.contains(&p) {
                            out.push(p);
                        }
                    }
                }
            }
        }
    }
    let mut out = SmallVec::new();
    walk(shader, id, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ShaderBuilder;
    use crate::delay::GenericDelayModel;
    use crate::ir::{Dst, Instr, RegType::*, Src};

    fn sched(shader: &mut Shader) -> SchedResult<()> {
        shader.schedule(&GenericDelayModel::default(), &SchedConfig::default())
    }

    fn pos(order: &[InstrId], id: InstrId) -> usize {
        order.iter().position(|&x| x == id).unwrap()
    }

    #[test]
    fn dependencies_precede_consumers() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(x, 0), F32);
        let m = b.alu2(Opcode::Mul, Src::ssa(a, 0), Src::ssa(a, 0), F32);
        b.output(m);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert_eq!(order.len(), 3);
        assert!(pos(order, x) < pos(order, a));
        assert!(pos(order, a) < pos(order, m));
    }

    #[test]
    fn inputs_are_drained_first() {
        let mut b = ShaderBuilder::new();
        let c = b.mov_imm(7, U32);
        let x = b.input(U32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(c, 0), U32);
        b.output(a);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert_eq!(order[0], x);
    }

    #[test]
    fn kills_wait_for_interpolation() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let cmp = b.alu2(Opcode::Cmp, Src::ssa(x, 0), Src::imm(0), F32);
        let p = b.movp(Src::ssa(cmp, 0));
        let k = b.kill(p);
        let bary = b.bary(0);
        let out = b.alu2(Opcode::Add, Src::ssa(bary, 0), Src::ssa(bary, 0), F32);
        b.output(out);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert!(pos(order, bary) < pos(order, k));
    }

    // Two address-register writers with interlocked consumer chains: the
    // first writer must be cloned exactly once and its remaining consumer
    // repointed.
    #[test]
    fn interlocked_address_writers_split_once() {
        let mut b = ShaderBuilder::new();
        let x = b.input(U32);
        let y = b.input(U32);
        let w1 = b.mova0(Src::ssa(x, 0));
        let w2 = b.mova0(Src::ssa(y, 0));
        let a = b.mov_relative(w1, 4, U32);
        let mut bi = Instr::new(Opcode::Add, Some(Dst::new(1, U32)), U32);
        bi.srcs.push(Src::ssa(a, 0));
        bi.srcs.push(Src::const_slot(8));
        bi.address = Some(w2);
        let bb = b.push(bi);
        let mut ci = Instr::new(Opcode::Add, Some(Dst::new(1, U32)), U32);
        ci.srcs.push(Src::ssa(bb, 0));
        ci.srcs.push(Src::const_slot(9));
        ci.address = Some(w1);
        let c = b.push(ci);
        b.output(c);
        let mut shader = b.finish();
        let before = shader.num_instrs();

        sched(&mut shader).unwrap();
        let order = shader.blocks[0].instrs.clone();

        // Exactly one clone was added.
        assert_eq!(shader.num_instrs(), before + 1);
        assert_eq!(order.len(), 8);
        let clone = *order
            .iter()
            .find(|&&id| id.index() >= before)
            .expect("clone present in the schedule");
        assert_eq!(shader[clone].opc, Opcode::MovA0);
        // The late consumer now reads the clone and issues after it.
        assert_eq!(shader[c].address, Some(clone));
        assert!(pos(&order, clone) < pos(&order, c));
        assert!(pos(&order, w1) < pos(&order, a));
        assert!(pos(&order, w2) < pos(&order, bb));

        // Replay: never two live a0 writers at once.
        let mut live: Option<(InstrId, usize)> = None;
        for &id in &order {
            if let Some(w) = shader[id].address {
                let (lw, n) = live.expect("consumer with no live writer");
                assert_eq!(lw, w);
                live = if n == 1 { None } else { Some((lw, n - 1)) };
            }
            if shader[id].opc.writes_addr0() {
                assert!(live.is_none(), "second a0 writer while one is live");
                let uses = order
                    .iter()
                    .filter(|&&u| shader[u].address == Some(id))
                    .count();
                if uses > 0 {
                    live = Some((id, uses));
                }
            }
        }
    }

    // More ready texture fetches than the outstanding window: at no prefix
    // of the schedule may the outstanding count exceed the window.
    #[test]
    fn outstanding_texture_window_is_respected() {
        let mut b = ShaderBuilder::new();
        let mut adds = Vec::new();
        for _ in 0..10 {
            let c = b.input(F32);
            let s = b.sam(Src::ssa(c, 0), None);
            let a = b.alu2(Opcode::Add, Src::ssa(s, 0), Src::imm(0), F32);
            adds.push(a);
        }
        for a in adds {
            b.output(a);
        }
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = shader.blocks[0].instrs.clone();
        assert_eq!(order.len(), 30);

        let mut outstanding: FxHashSet<InstrId> = FxHashSet::default();
        for &id in &order {
            let instr = &shader[id];
            if !instr.opc.is_meta()
                && instr
                    .srcs
                    .iter()
                    .filter_map(|s| s.as_ssa())
                    .any(|p| outstanding.contains(&p))
            {
                outstanding.clear();
            }
            if instr.opc.is_sy_producer() {
                outstanding.insert(id);
            }
            assert!(outstanding.len() <= 8, "outstanding tex window exceeded");
        }
    }

    #[test]
    fn schedule_preserves_instruction_set() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let r = b.sfu(Opcode::Rcp, Src::ssa(x, 0));
        let s = b.sam(Src::ssa(x, 0), None);
        let sp = b.split(s, 0, F32);
        let m = b.alu2(Opcode::Mul, Src::ssa(r, 0), Src::ssa(sp, 0), F32);
        b.output(m);
        let mut shader = b.finish();
        let mut before = shader.blocks[0].instrs.clone();

        sched(&mut shader).unwrap();
        let mut after = shader.blocks[0].instrs.clone();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn hard_delay_bounds_issue_cycle() {
        // A lone relative-addressing consumer cannot issue before the a0
        // write's hard latency has elapsed; the scheduler must still finish.
        let mut b = ShaderBuilder::new();
        let x = b.input(U32);
        let w = b.mova0(Src::ssa(x, 0));
        let r = b.mov_relative(w, 4, U32);
        b.output(r);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert!(pos(order, w) < pos(order, r));
    }

    #[test]
    fn fixed_prologue_drains_class_by_class() {
        let mut b = ShaderBuilder::new();
        let c = b.mov_imm(3, U32);
        let pc = b.push_const();
        let x = b.input(F32);
        let pf = b.tex_prefetch();
        let ph = b.phi(F32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(ph, 0), F32);
        let m = b.alu2(Opcode::Mul, Src::ssa(a, 0), Src::ssa(c, 0), F32);
        b.output(m);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        // Inputs and phis first, then the prefetch, then the push-constant
        // macro; ordinary work only after the fixed prologue.
        assert!(pos(order, x) < 2 && pos(order, ph) < 2);
        assert_eq!(pos(order, pf), 2);
        assert_eq!(pos(order, pc), 3);
        assert!(pos(order, c) > 3);
        assert!(pos(order, a) > 3);
    }

    // A consumer of an outstanding SFU result is passed over while the
    // (ss) budget is positive, so independent work hides the latency.
    #[test]
    fn outstanding_sfu_consumer_is_deferred() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let y = b.input(F32);
        let r = b.sfu(Opcode::Rcp, Src::ssa(x, 0));
        let a = b.alu2(Opcode::Add, Src::ssa(r, 0), Src::imm(0), F32);
        let m = b.alu2(Opcode::Mul, Src::ssa(y, 0), Src::imm(0), F32);
        let n = b.alu2(Opcode::Add, Src::ssa(y, 0), Src::imm(1), F32);
        b.output(a);
        b.output(m);
        b.output(n);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert!(pos(order, r) < pos(order, m));
        // Both independent ALU ops issue between the rcp and its consumer.
        assert_eq!(pos(order, a), order.len() - 1);
    }

    // The fallback tier ranks by nearest use alone: a head reading a still
    // outstanding SFU result must not be passed over for unrelated work
    // with a farther use.
    #[test]
    fn fallback_tier_ranks_by_nearest_use_only() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let r = b.sfu(Opcode::Rcp, Src::ssa(x, 0));
        let a = b.alu2(Opcode::Add, Src::ssa(r, 0), Src::imm(0), F32);
        let ca = b.alu2(Opcode::Mul, Src::ssa(a, 0), Src::ssa(r, 0), F32);
        let far = b.alu2(Opcode::Add, Src::imm(0), Src::imm(1), F32);
        let d = b.alu2(Opcode::Mul, Src::ssa(ca, 0), Src::imm(0), F32);
        let cf = b.alu2(Opcode::Mul, Src::ssa(far, 0), Src::imm(0), F32);
        b.output(d);
        b.output(cf);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        // `a` raises pressure and its source is outstanding, but its use is
        // one slot away against `far`'s two; it issues right after the rcp.
        assert_eq!(pos(order, a), pos(order, r) + 1);
        assert!(pos(order, a) < pos(order, far));
    }

    #[test]
    fn barrier_order_survives_scheduling() {
        let mut b = ShaderBuilder::new();
        let a = b.input(U32);
        let v = b.input(U32);
        let ld = b.ldg(Src::ssa(a, 0));
        let st = b.stg(Src::ssa(a, 0), Src::ssa(v, 0));
        b.output(ld);
        let mut shader = b.finish();

        sched(&mut shader).unwrap();
        let order = &shader.blocks[0].instrs;
        assert!(pos(order, ld) < pos(order, st));
    }
}
