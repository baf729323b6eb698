//! Post-scheduling sanity checks.
//!
//! Replays a scheduled shader and confirms the contracts the passes are
//! supposed to uphold: producers precede consumers, no operand dangles, at
//! most one live special-register writer at a time, and kills issue only
//! after interpolation.  Intended for tests and debug builds; the checks are
//! linear passes over the emitted order.

use crate::ir::{BlockId, InstrId, Opcode, Shader};
use crate::result::{SchedResult, ScheduleError};
use log::error;
use rustc_hash::FxHashMap;

/// Check a scheduled shader against the scheduling contracts.
pub fn check_schedule(shader: &Shader) -> SchedResult<()> {
    let mut pos: FxHashMap<InstrId, (BlockId, usize)> = FxHashMap::default();
    for block in shader.block_ids() {
        for (i, &id) in shader.block(block).instrs.iter().enumerate() {
            if pos.insert(id, (block, i)).is_some() {
                error!("{id} appears in the schedule twice");
                return Err(ScheduleError::MalformedDag { instr: id });
            }
        }
    }

    for &out in &shader.outputs {
        if !pos.contains_key(&out) {
            error!("output {out} is not present in any block");
            return Err(ScheduleError::InvalidSchedule { instr: out });
        }
    }

    for block in shader.block_ids() {
        check_order(shader, block, &pos)?;
        check_single_writer(shader, block)?;
        check_kill_order(shader, block)?;
    }
    Ok(())
}

/// Every reference from an instruction must resolve to a scheduled
/// instruction, and block-local references must point strictly backwards.
fn check_order(
    shader: &Shader,
    block: BlockId,
    pos: &FxHashMap<InstrId, (BlockId, usize)>,
) -> SchedResult<()> {
    for (i, &id) in shader.block(block).instrs.iter().enumerate() {
        let instr = &shader[id];
        let refs = instr
            .srcs
            .iter()
            .filter_map(|s| s.as_ssa())
            .chain(instr.address)
            .chain(instr.predicate)
            .chain(instr.deps.iter().copied());
        for p in refs {
            match pos.get(&p) {
                None => {
                    error!("{id} references {p}, which is not in the schedule");
                    return Err(ScheduleError::InvalidSchedule { instr: id });
                }
                Some(&(pb, pi)) => {
                    if pb == block && pi >= i {
                        error!("{id} issues before its dependency {p}");
                        return Err(ScheduleError::InvalidSchedule { instr: id });
                    }
                }
            }
        }
    }
    if let Some(cond) = shader.block(block).brcond {
        if !pos.contains_key(&cond) {
            error!("branch condition {cond} is not in the schedule");
            return Err(ScheduleError::InvalidSchedule { instr: cond });
        }
    }
    Ok(())
}

/// Replay the emitted order tracking live special-register writers: a second
/// writer may not issue while the first still has pending consumers.
fn check_single_writer(shader: &Shader, block: BlockId) -> SchedResult<()> {
    let order = &shader.block(block).instrs;
    let writer_kind = |id: InstrId| -> Option<usize> {
        match shader[id].opc {
            Opcode::MovA0 => Some(0),
            Opcode::MovA1 => Some(1),
            Opcode::MovP => Some(2),
            _ => None,
        }
    };

    let mut live: [Option<(InstrId, usize)>; 3] = [None; 3];
    for (i, &id) in order.iter().enumerate() {
        let instr = &shader[id];
        for w in instr.address.iter().chain(instr.predicate.iter()).copied() {
            let Some(kind) = writer_kind(w) else { continue };
            match live[kind] {
                Some((lw, n)) if lw == w => {
                    live[kind] = if n == 1 { None } else { Some((lw, n - 1)) };
                }
                _ => {
                    error!("{id} consumes special writer {w}, which is not live");
                    return Err(ScheduleError::InvalidSchedule { instr: id });
                }
            }
        }
        if let Some(kind) = writer_kind(id) {
            if live[kind].is_some() {
                error!("{id} writes a special register with a live writer pending");
                return Err(ScheduleError::InvalidSchedule { instr: id });
            }
            let uses = order[i + 1..]
                .iter()
                .filter(|&&c| {
                    shader[c].address == Some(id) || shader[c].predicate == Some(id)
                })
                .count();
            if uses > 0 {
                live[kind] = Some((id, uses));
            }
        }
    }
    Ok(())
}

/// Kills must issue strictly after every interpolation in the block.
fn check_kill_order(shader: &Shader, block: BlockId) -> SchedResult<()> {
    let order = &shader.block(block).instrs;
    let last_bary = order
        .iter()
        .rposition(|&id| shader[id].opc == Opcode::Bary);
    let first_kill = order.iter().position(|&id| shader[id].opc.is_kill());
    if let (Some(b), Some(k)) = (last_bary, first_kill) {
        if k < b {
            let id = order[k];
            error!("{id} kills before interpolation has finished");
            return Err(ScheduleError::InvalidSchedule { instr: id });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ShaderBuilder;
    use crate::ir::{RegType::*, Src};

    #[test]
    fn accepts_well_formed_order() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(x, 0), F32);
        b.output(a);
        let shader = b.finish();
        assert!(check_schedule(&shader).is_ok());
    }

    #[test]
    fn rejects_consumer_before_producer() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(x, 0), F32);
        b.output(a);
        let mut shader = b.finish();
        shader.blocks[0].instrs.swap(0, 1);
        assert_eq!(
            check_schedule(&shader),
            Err(ScheduleError::InvalidSchedule { instr: a })
        );
    }

    #[test]
    fn rejects_two_live_address_writers() {
        let mut b = ShaderBuilder::new();
        let x = b.input(U32);
        let w1 = b.mova0(Src::ssa(x, 0));
        let w2 = b.mova0(Src::ssa(x, 0));
        let r1 = b.mov_relative(w1, 4, U32);
        let r2 = b.mov_relative(w2, 5, U32);
        b.output(r1);
        b.output(r2);
        let shader = b.finish();
        // Order is x, w1, w2, r1, r2: w2 issues while w1 still has r1
        // pending.
        assert_eq!(
            check_schedule(&shader),
            Err(ScheduleError::InvalidSchedule { instr: w2 })
        );
    }

    #[test]
    fn rejects_kill_before_bary() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let cmp = b.alu2(Opcode::Cmp, Src::ssa(x, 0), Src::imm(0), F32);
        let p = b.movp(Src::ssa(cmp, 0));
        let k = b.kill(p);
        let bary = b.bary(0);
        let out = b.alu2(Opcode::Add, Src::ssa(bary, 0), Src::ssa(bary, 0), F32);
        b.output(out);
        let shader = b.finish();
        // Program order has the kill before the bary.
        assert_eq!(
            check_schedule(&shader),
            Err(ScheduleError::InvalidSchedule { instr: k })
        );
    }

    #[test]
    fn rejects_dangling_reference() {
        let mut b = ShaderBuilder::new();
        let x = b.input(F32);
        let a = b.alu2(Opcode::Add, Src::ssa(x, 0), Src::ssa(x, 0), F32);
        b.output(a);
        let mut shader = b.finish();
        // Drop the producer from the block without rewriting the consumer.
        shader.blocks[0].instrs.retain(|&id| id != x);
        assert_eq!(
            check_schedule(&shader),
            Err(ScheduleError::InvalidSchedule { instr: a })
        );
    }
}
