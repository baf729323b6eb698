//! The delay-slot model.
//!
//! Edge weights in the scheduling DAG come from here.  Two modes exist: the
//! "soft" delay biases heuristic priorities and tolerates imprecision, while
//! the "hard" delay bounds `earliest_ip` and must never be violated.  Texture
//! and SFU producers report a soft latency only; their hard synchronization
//! happens through (sy)/(ss) flags at encode time, not through issue cycles.
//!
//! Exact cycle counts are hardware-generation lookup tables upstream.  The
//! model is a trait so callers can inject per-chip tables; the generic table
//! below carries one representative generation.

use crate::ir::{Category, Instr};

/// Cycle-delay oracle between a producer and a consumer.
pub trait DelayModel {
    /// Minimum cycles between issuing `producer` and issuing `consumer`,
    /// where `consumer` reads the producer through source `src_idx`.
    fn delay(&self, producer: &Instr, consumer: &Instr, src_idx: usize, soft: bool) -> u32;

    /// Issue-cycle cost of one instruction.  Pseudo-instructions never reach
    /// the hardware and cost nothing.
    fn issue_cycles(&self, instr: &Instr) -> u32 {
        if instr.opc.is_meta() {
            0
        } else {
            1 + u32::from(instr.repeat)
        }
    }

    /// Fresh soft-latency budget installed when a texture-class producer
    /// issues.
    fn sy_budget(&self) -> u32 {
        10
    }

    /// Fresh soft-latency budget installed when an SFU producer issues.
    fn ss_budget(&self) -> u32 {
        6
    }
}

/// A single-generation delay table.
#[derive(Clone, Copy, Debug)]
pub struct GenericDelayModel {
    /// Soft latency budget for outstanding texture results.
    pub soft_sy: u32,
    /// Soft latency budget for outstanding SFU results.
    pub soft_ss: u32,
    /// Raw ALU result latency.
    pub alu: u32,
    /// Cycles between a special-register write and its first use.
    pub special: u32,
}

impl Default for GenericDelayModel {
    fn default() -> Self {
        GenericDelayModel {
            soft_sy: 10,
            soft_ss: 6,
            alu: 3,
            special: 6,
        }
    }
}

impl DelayModel for GenericDelayModel {
    fn sy_budget(&self) -> u32 {
        self.soft_sy
    }

    fn ss_budget(&self) -> u32 {
        self.soft_ss
    }

    fn delay(&self, producer: &Instr, consumer: &Instr, _src_idx: usize, soft: bool) -> u32 {
        if producer.opc.is_meta() || consumer.opc.is_meta() {
            return 0;
        }
        if producer.opc.is_sy_producer() {
            return if soft { self.soft_sy } else { 0 };
        }
        if producer.opc.is_ss_producer() {
            return if soft { self.soft_ss } else { 0 };
        }
        if producer.opc.writes_addr0()
            || producer.opc.writes_addr1()
            || producer.opc.writes_pred()
        {
            // No sync flag covers the special registers; the full latency is
            // hard.
            return self.special;
        }
        match producer.opc.category() {
            Category::Flow => 0,
            _ => self.alu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Dst, Instr, Opcode, RegType};

    fn instr(opc: Opcode) -> Instr {
        Instr::new(opc, Some(Dst::new(1, RegType::F32)), RegType::F32)
    }

    #[test]
    fn sync_producers_have_no_hard_delay() {
        let m = GenericDelayModel::default();
        let sam = instr(Opcode::Sam);
        let rcp = instr(Opcode::Rcp);
        let add = instr(Opcode::Add);
        assert_eq!(m.delay(&sam, &add, 0, true), 10);
        assert_eq!(m.delay(&sam, &add, 0, false), 0);
        assert_eq!(m.delay(&rcp, &add, 0, true), 6);
        assert_eq!(m.delay(&rcp, &add, 0, false), 0);
    }

    #[test]
    fn special_register_delay_is_hard() {
        let m = GenericDelayModel::default();
        let mova = instr(Opcode::MovA0);
        let add = instr(Opcode::Add);
        assert_eq!(m.delay(&mova, &add, 0, false), 6);
        assert_eq!(m.delay(&mova, &add, 0, true), 6);
    }

    #[test]
    fn repeat_raises_issue_cost() {
        let m = GenericDelayModel::default();
        let mut add = instr(Opcode::Add);
        assert_eq!(m.issue_cycles(&add), 1);
        add.repeat = 3;
        assert_eq!(m.issue_cycles(&add), 4);
    }

    #[test]
    fn meta_is_free_to_issue() {
        let m = GenericDelayModel::default();
        let split = instr(Opcode::MetaSplit);
        assert_eq!(m.issue_cycles(&split), 0);
    }
}
