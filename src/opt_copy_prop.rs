//! Copy propagation.
//!
//! Eliminates same-type moves and constant/immediate movement chains by
//! rewriting consumer operands to reference the ultimate producer, within
//! the limits of what the hardware can encode.  Immediates that do not fit
//! an instruction's immediate field are lowered into the per-shader
//! constant table instead, budget permitting.
//!
//! The driver visits the roots of each block (keeps, branch condition) and
//! the shader outputs in post-order using an explicit stack, folds each
//! instruction's operands to a fixed point, then runs the late folds:
//! trivial output moves and register-indexed texture operands.

use crate::encode::{f16_from_f32_exact, valid_flags, valid_immediate};
use crate::ir::{
    InstrId, Opcode, RegType, Shader, Src, SrcMods, SrcRef, UseCounts,
};
use log::trace;
use rustc_hash::FxHashSet;

impl Shader {
    /// Run copy propagation over the whole shader.  Returns true if
    /// anything changed, so callers can decide whether dependent passes
    /// need to re-run.
    pub fn opt_copy_prop(&mut self) -> bool {
        let uses = UseCounts::compute(self);
        let mut pass = CopyProp {
            shader: self,
            uses,
            dead: FxHashSet::default(),
            progress: false,
        };
        pass.run();
        let CopyProp {
            dead, progress, ..
        } = pass;

        for block in &mut self.blocks {
            block.instrs.retain(|id| !dead.contains(id));
            block.keeps.retain(|id| !dead.contains(id));
        }
        progress
    }
}

struct CopyProp<'a> {
    shader: &'a mut Shader,
    uses: UseCounts,
    /// Instructions whose use count reached zero; removed from the block
    /// lists once the pass finishes.
    dead: FxHashSet<InstrId>,
    progress: bool,
}

impl CopyProp<'_> {
    fn run(&mut self) {
        let mut visited = FxHashSet::default();
        let mut roots: Vec<InstrId> = Vec::new();
        for block in &self.shader.blocks {
            roots.extend_from_slice(&block.keeps);
            roots.extend(block.brcond);
        }
        roots.extend_from_slice(&self.shader.outputs);

        for root in roots {
            self.visit(root, &mut visited);
        }

        self.eliminate_output_movs();
        self.fold_tex_indices();
    }

    /// Post-order traversal from `root`: sources fold before their
    /// consumers so chains collapse in one driver invocation.
    fn visit(&mut self, root: InstrId, visited: &mut FxHashSet<InstrId>) {
        let mut stack = vec![(root, false)];
        while let Some((id, entered)) = stack.pop() {
            if entered {
                self.instr_cp(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            let instr = &self.shader[id];
            for src in &instr.srcs {
                if let Some(p) = src.as_ssa() {
                    stack.push((p, false));
                }
            }
            if let Some(a) = instr.address {
                stack.push((a, false));
            }
            if let Some(p) = instr.predicate {
                stack.push((p, false));
            }
        }
    }

    /// Fold every operand of `id` until no further fold applies.
    fn instr_cp(&mut self, id: InstrId) {
        loop {
            let mut changed = false;
            for n in 0..self.shader[id].srcs.len() {
                changed |= self.reg_cp(id, n);
            }
            if !changed {
                break;
            }
            self.progress = true;
        }
    }

    /// Attempt to fold the producer of source `n` of `consumer` into the
    /// operand itself.  Returns true on success; on failure nothing is
    /// mutated.
    fn reg_cp(&mut self, consumer: InstrId, n: usize) -> bool {
        let src = self.shader[consumer].srcs[n];
        let Some(prod_id) = src.as_ssa() else {
            return false;
        };
        let prod = &self.shader[prod_id];
        // Only plain type-preserving moves may be seen through; the
        // address/predicate-register writers never propagate.
        if !prod.is_same_type_mov() {
            return false;
        }
        // A relative or predicated mov does not simply forward its operand.
        if prod.address.is_some() || prod.predicate.is_some() {
            return false;
        }
        debug_assert_eq!(prod.srcs.len(), 1);
        let psrc = prod.srcs[0];
        let prod_typ = prod.typ;

        match psrc.rf {
            SrcRef::Ssa { .. } => {
                let Some(mods) = combine_mods(src.mods, psrc.mods) else {
                    return false;
                };
                if !valid_flags(&self.shader[consumer], n, psrc.rf, mods) {
                    return false;
                }
                trace!("cp: {consumer}.src{n} <- {} (through {prod_id})", psrc.as_ssa().unwrap());
                self.shader[consumer].srcs[n] = Src { rf: psrc.rf, mods };
                self.uses.inc(psrc.as_ssa().unwrap());
                self.drop_use(prod_id);
                true
            }
            SrcRef::Const { .. } => {
                let Some(mods) = combine_mods(src.mods, psrc.mods) else {
                    return false;
                };
                if !self.rewrite_const_like(consumer, n, psrc.rf, mods) {
                    return false;
                }
                self.drop_use(prod_id);
                true
            }
            SrcRef::Imm(v) => {
                let Some(mods) = combine_mods(src.mods, psrc.mods) else {
                    return false;
                };
                let Some(folded) = fold_imm(v, mods, prod_typ, self.shader[consumer].typ)
                else {
                    return false;
                };
                if valid_flags(&self.shader[consumer], n, SrcRef::Imm(folded), SrcMods::NONE)
                    && valid_immediate(&self.shader[consumer], folded)
                {
                    trace!("cp: {consumer}.src{n} <- imm {folded:#x}");
                    self.shader[consumer].srcs[n] = Src::imm(folded);
                    self.drop_use(prod_id);
                    return true;
                }
                // Doesn't fit the immediate field; lower into the constant
                // table if the budget allows.  Check slot legality first so
                // a failed fold doesn't consume budget.
                if !self.can_take_const(consumer, n) {
                    return false;
                }
                let Some(slot) = self.shader.imms.lower(folded) else {
                    return false;
                };
                let rf = SrcRef::Const { slot };
                if !self.rewrite_const_like(consumer, n, rf, SrcMods::NONE) {
                    return false;
                }
                trace!("cp: {consumer}.src{n} <- lowered imm {folded:#x} at c{slot}");
                self.drop_use(prod_id);
                true
            }
        }
    }

    /// Could source `n` of `consumer` hold a const-file reference, either
    /// directly or through the mad operand swap?
    fn can_take_const(&self, consumer: InstrId, n: usize) -> bool {
        let probe = SrcRef::Const { slot: 0 };
        let instr = &self.shader[consumer];
        if valid_flags(instr, n, probe, SrcMods::NONE) {
            return true;
        }
        instr.opc.is_mad_like()
            && n == 1
            && !instr.swapped
            && valid_flags(instr, 0, probe, SrcMods::NONE)
            && valid_flags(instr, 1, instr.srcs[0].rf, instr.srcs[0].mods)
    }

    /// Rewrite source `n` of `consumer` to the const-file reference `rf`,
    /// swapping the first two operands of a mad-like instruction when that
    /// is what makes the encoding legal.
    fn rewrite_const_like(
        &mut self,
        consumer: InstrId,
        mut n: usize,
        rf: SrcRef,
        mods: SrcMods,
    ) -> bool {
        if !valid_flags(&self.shader[consumer], n, rf, mods) {
            let instr = &self.shader[consumer];
            let swappable = instr.opc.is_mad_like()
                && n == 1
                && !instr.swapped
                && valid_flags(instr, 0, rf, mods)
                && valid_flags(instr, 1, instr.srcs[0].rf, instr.srcs[0].mods);
            if !swappable {
                return false;
            }
            let instr = &mut self.shader[consumer];
            instr.srcs.swap(0, 1);
            instr.swapped = true;
            n = 0;
            trace!("cp: swapped {consumer} src0/src1 for const fold");
        }
        self.shader[consumer].srcs[n] = Src { rf, mods };
        true
    }

    /// Decrement `id`'s use count; cascade elision through its own sources
    /// when it reaches zero.
    fn drop_use(&mut self, id: InstrId) {
        if self.uses.dec(id) > 0 {
            return;
        }
        let mut worklist = vec![id];
        while let Some(id) = worklist.pop() {
            if !self.dead.insert(id) {
                continue;
            }
            trace!("cp: eliding {id}");
            let instr = &self.shader[id];
            let mut drop: Vec<InstrId> = instr.srcs.iter().filter_map(|s| s.as_ssa()).collect();
            drop.extend(instr.address);
            drop.extend(instr.predicate);
            for p in drop {
                if self.uses.dec(p) == 0 {
                    worklist.push(p);
                }
            }
        }
    }

    /// Elide trivial moves feeding shader outputs: a same-type unmodified
    /// mov whose only remaining use is the output slot itself.
    fn eliminate_output_movs(&mut self) {
        for i in 0..self.shader.outputs.len() {
            let id = self.shader.outputs[i];
            let instr = &self.shader[id];
            if !instr.is_same_type_mov() || self.uses.get(id) != 1 {
                continue;
            }
            if instr.address.is_some() || instr.predicate.is_some() {
                continue;
            }
            let src = instr.srcs[0];
            if !src.mods.is_none() {
                continue;
            }
            let Some(prod) = src.as_ssa() else {
                continue;
            };
            trace!("cp: output mov {id} -> {prod}");
            self.shader.outputs[i] = prod;
            self.uses.inc(prod);
            self.drop_use(id);
            self.progress = true;
        }
    }

    /// Rewrite texture ops whose sampler/texture indices are register-based
    /// but compile-time constant into the immediate-indexed encoding,
    /// shrinking the operand list by one.
    fn fold_tex_indices(&mut self) {
        for b in 0..self.shader.blocks.len() {
            for i in 0..self.shader.blocks[b].instrs.len() {
                let id = self.shader.blocks[b].instrs[i];
                if self.dead.contains(&id) {
                    continue;
                }
                let instr = &self.shader[id];
                if !instr.opc.is_tex() || instr.tex_imm.is_some() {
                    continue;
                }
                let Some(last) = instr.srcs.last() else {
                    continue;
                };
                let Some((samp, tex)) = self.const_samp_tex(*last) else {
                    continue;
                };
                trace!("cp: {id} sampler/texture -> immediate ({samp}, {tex})");
                let dropped = self.shader[id].srcs.pop().unwrap();
                self.shader[id].tex_imm = Some((samp, tex));
                if let Some(p) = dropped.as_ssa() {
                    self.drop_use(p);
                }
                self.progress = true;
            }
        }
    }

    /// The sampler/texture operand folds when it is a two-component collect
    /// of immediate moves, both within the immediate index width.
    fn const_samp_tex(&self, src: Src) -> Option<(u16, u16)> {
        const TEX_IMM_BITS: u32 = 4;
        let collect = &self.shader[src.as_ssa()?];
        if collect.opc != Opcode::MetaCollect || collect.srcs.len() != 2 {
            return None;
        }
        let mut vals = [0u16; 2];
        for (i, s) in collect.srcs.iter().enumerate() {
            let mov = &self.shader[s.as_ssa()?];
            if !mov.is_same_type_mov() || !s.mods.is_none() {
                return None;
            }
            match mov.srcs[0].rf {
                SrcRef::Imm(v) if v < (1 << TEX_IMM_BITS) => vals[i] = v as u16,
                _ => return None,
            }
        }
        Some((vals[0], vals[1]))
    }
}

/// Merge the modifier flags of a folded-through move into the consumer's
/// operand.  Paired negates and paired bitwise-nots cancel; a consumer abs
/// makes an inner negate irrelevant.  Returns `None` for combinations with
/// no single-operand encoding.
fn combine_mods(outer: SrcMods, inner: SrcMods) -> Option<SrcMods> {
    if outer.contains(SrcMods::HALF) != inner.contains(SrcMods::HALF)
        && !inner.is_none()
        && !outer.is_none()
    {
        return None;
    }
    let mut out = SrcMods::NONE;
    if outer.contains(SrcMods::ABS) || (inner.contains(SrcMods::ABS) && !outer.contains(SrcMods::NEG)) {
        out = out | SrcMods::ABS;
    }
    if inner.contains(SrcMods::ABS) && outer.contains(SrcMods::NEG) {
        // neg(abs(x)) keeps both.
        out = out | SrcMods::ABS | SrcMods::NEG;
    } else if !outer.contains(SrcMods::ABS) {
        // Paired negates cancel; a consumer abs swallows the inner negate.
        if outer.contains(SrcMods::NEG) != inner.contains(SrcMods::NEG) {
            out = out | SrcMods::NEG;
        }
    }
    if outer.contains(SrcMods::BNOT) != inner.contains(SrcMods::BNOT) {
        out = out | SrcMods::BNOT;
    }
    if outer.contains(SrcMods::HALF) || inner.contains(SrcMods::HALF) {
        out = out | SrcMods::HALF;
    }
    Some(out)
}

/// Evaluate modifier flags against an immediate at compile time, then
/// narrow for half-precision consumers.  Two's-complement negate/not for
/// integer types, IEEE-754 negate/abs for floats.
fn fold_imm(v: u32, mods: SrcMods, typ: RegType, consumer_typ: RegType) -> Option<u32> {
    let mut v = v;
    if typ.is_float() {
        if mods.contains(SrcMods::BNOT) {
            return None;
        }
        let mut f = f32::from_bits(v);
        if mods.contains(SrcMods::ABS) {
            f = f.abs();
        }
        if mods.contains(SrcMods::NEG) {
            f = -f;
        }
        v = f.to_bits();
    } else {
        if mods.contains(SrcMods::ABS) {
            v = (v as i32).unsigned_abs();
        }
        if mods.contains(SrcMods::NEG) {
            v = v.wrapping_neg();
        }
        if mods.contains(SrcMods::BNOT) {
            v = !v;
        }
    }

    match consumer_typ {
        RegType::F16 => {
            // Narrowing through f16 only makes sense for float values; an
            // integer constant feeding a half consumer keeps its mov.
            if !typ.is_float() {
                return None;
            }
            f16_from_f32_exact(f32::from_bits(v)).map(u32::from)
        }
        RegType::U16 | RegType::S16 => {
            if v < (1 << 16) || (v as i32) >= -(1 << 15) && (v as i32) < 0 {
                Some(v & 0xffff)
            } else {
                None
            }
        }
        _ => Some(v),
    }
}
