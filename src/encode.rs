//! Encoding legality predicates.
//!
//! Copy propagation may only rewrite an operand when the result is still
//! encodable.  The rules here are per-category: which source slots accept
//! constants or immediates, and which modifier flags each category can carry.

use crate::ir::{Category, Instr, Opcode, SrcMods, SrcRef};

/// Can `instr`'s source `src_idx` legally hold `rf` with `mods`?
pub fn valid_flags(instr: &Instr, src_idx: usize, rf: SrcRef, mods: SrcMods) -> bool {
    if !valid_mods(instr, mods) {
        return false;
    }
    match rf {
        SrcRef::Ssa { .. } => true,
        SrcRef::Const { .. } => valid_const(instr, src_idx),
        SrcRef::Imm(_) => valid_imm_slot(instr, src_idx),
    }
}

fn valid_mods(instr: &Instr, mods: SrcMods) -> bool {
    if mods.is_none() {
        return true;
    }
    match instr.opc.category() {
        // abs/neg on arithmetic, bnot on the bitwise ops.
        Category::Alu => match instr.opc {
            Opcode::And | Opcode::Or | Opcode::Xor => {
                !mods.intersects(SrcMods::ABS | SrcMods::NEG)
            }
            Opcode::Bary => false,
            _ => !mods.contains(SrcMods::BNOT),
        },
        // cat3 only encodes negate.
        Category::Mad => !mods.intersects(SrcMods::ABS | SrcMods::BNOT),
        Category::Sfu => !mods.contains(SrcMods::BNOT),
        // Moves, flow, tex, mem and meta take sources unmodified.
        _ => false,
    }
}

fn valid_const(instr: &Instr, src_idx: usize) -> bool {
    match instr.opc.category() {
        Category::Mov => !instr.opc.writes_pred(),
        Category::Alu => instr.opc != Opcode::Bary,
        // The second cat3 operand cannot address the const file; this is
        // what drives the operand swap in copy propagation.
        Category::Mad => src_idx != 1,
        Category::Sfu => true,
        Category::Flow | Category::Tex | Category::Mem | Category::Meta => false,
    }
}

fn valid_imm_slot(instr: &Instr, src_idx: usize) -> bool {
    match instr.opc.category() {
        Category::Mov => !instr.opc.writes_pred(),
        Category::Alu => {
            if instr.opc == Opcode::Bary {
                return false;
            }
            // Only one immediate per cat2 instruction.
            !instr
                .srcs
                .iter()
                .enumerate()
                .any(|(i, s)| i != src_idx && matches!(s.rf, SrcRef::Imm(_)))
        }
        Category::Sfu => true,
        Category::Mad
        | Category::Flow
        | Category::Tex
        | Category::Mem
        | Category::Meta => false,
    }
}

/// Does `v` fit `instr`'s immediate encoding?
pub fn valid_immediate(instr: &Instr, v: u32) -> bool {
    match instr.opc.category() {
        // cat1 carries a full 32-bit immediate.
        Category::Mov => true,
        // cat2/cat4 immediates are 16 bits, sign- or zero-extended.
        Category::Alu | Category::Sfu => {
            let s = v as i32;
            v < (1 << 16) || (-(1 << 15)..0).contains(&s)
        }
        _ => false,
    }
}

/// Bit-exact f32 to f16 conversion, or `None` when the value does not
/// round-trip.  Used when narrowing a 32-bit constant for a half-precision
/// float opcode.
pub fn f16_from_f32_exact(f: f32) -> Option<u16> {
    let bits = f.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let frac = bits & 0x7f_ffff;

    if exp == 0 && frac == 0 {
        return Some(sign);
    }
    if exp == 0xff {
        // Inf propagates exactly; NaN payloads do not.
        return if frac == 0 { Some(sign | 0x7c00) } else { None };
    }

    let e = exp - 127;
    if !(-14..=15).contains(&e) {
        return None;
    }
    if frac & 0x1fff != 0 {
        // Low mantissa bits would be rounded away.
        return None;
    }
    Some(sign | (((e + 15) as u16) << 10) | (frac >> 13) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Dst, RegType};

    fn instr(opc: Opcode) -> Instr {
        Instr::new(opc, Some(Dst::new(1, RegType::F32)), RegType::F32)
    }

    #[test]
    fn mad_src1_rejects_const() {
        let mad = instr(Opcode::Mad);
        assert!(valid_flags(&mad, 0, SrcRef::Const { slot: 0 }, SrcMods::NONE));
        assert!(!valid_flags(&mad, 1, SrcRef::Const { slot: 0 }, SrcMods::NONE));
        assert!(valid_flags(&mad, 2, SrcRef::Const { slot: 0 }, SrcMods::NONE));
        assert!(!valid_flags(&mad, 0, SrcRef::Imm(1), SrcMods::NONE));
    }

    #[test]
    fn one_immediate_per_alu_instr() {
        let mut shader = crate::ir::Shader::new(0, 16);
        let producer = shader.add_instr(instr(Opcode::Mov));
        let mut add = instr(Opcode::Add);
        add.srcs.push(crate::ir::Src::imm(3));
        add.srcs.push(crate::ir::Src::ssa(producer, 0));
        assert!(!valid_flags(&add, 1, SrcRef::Imm(4), SrcMods::NONE));
        assert!(valid_flags(&add, 0, SrcRef::Imm(4), SrcMods::NONE));
    }

    #[test]
    fn bitwise_mods() {
        let and = instr(Opcode::And);
        assert!(valid_flags(&and, 0, SrcRef::Imm(1), SrcMods::BNOT));
        assert!(!valid_flags(&and, 0, SrcRef::Imm(1), SrcMods::NEG));
        let add = instr(Opcode::Add);
        assert!(valid_flags(&add, 0, SrcRef::Imm(1), SrcMods::NEG));
        assert!(!valid_flags(&add, 0, SrcRef::Imm(1), SrcMods::BNOT));
    }

    #[test]
    fn alu_immediate_range() {
        let add = instr(Opcode::Add);
        assert!(valid_immediate(&add, 0xffff));
        assert!(valid_immediate(&add, (-5i32) as u32));
        assert!(!valid_immediate(&add, 0x1_0000));
        assert!(!valid_immediate(&add, 0x7fff_0000));
        let mov = instr(Opcode::Mov);
        assert!(valid_immediate(&mov, 0xdead_beef));
    }

    #[test]
    fn f16_round_trip() {
        assert_eq!(f16_from_f32_exact(0.0), Some(0));
        assert_eq!(f16_from_f32_exact(-0.0), Some(0x8000));
        assert_eq!(f16_from_f32_exact(1.0), Some(0x3c00));
        assert_eq!(f16_from_f32_exact(-2.0), Some(0xc000));
        assert_eq!(f16_from_f32_exact(f32::INFINITY), Some(0x7c00));
        assert_eq!(f16_from_f32_exact(65536.0), None);
        assert_eq!(f16_from_f32_exact(1.0000001), None);
    }
}
