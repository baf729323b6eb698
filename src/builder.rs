//! Instruction builders.
//!
//! Convenience layer for constructing shaders, used by the front end glue
//! and throughout the tests.  Instructions are appended to the current block
//! in program order.

use crate::ir::{
    BarrierClass, Block, BlockId, Dst, Instr, InstrId, Opcode, RegType,
    Shader, Src,
};

/// Builds one [`Shader`], block by block.
pub struct ShaderBuilder {
    shader: Shader,
    cur: BlockId,
}

impl ShaderBuilder {
    pub fn new() -> ShaderBuilder {
        Self::with_const_budget(64, 64)
    }

    /// `imm_base` is the first constant slot the immediates table may use;
    /// `max_const_words` bounds it.
    pub fn with_const_budget(imm_base: u16, max_const_words: usize) -> ShaderBuilder {
        let mut shader = Shader::new(imm_base, max_const_words);
        shader.blocks.push(Block::default());
        ShaderBuilder {
            shader,
            cur: BlockId::new(0),
        }
    }

    pub fn finish(self) -> Shader {
        self.shader
    }

    pub fn cur_block(&self) -> BlockId {
        self.cur
    }

    pub fn start_block(&mut self) -> BlockId {
        self.shader.blocks.push(Block::default());
        self.cur = BlockId::new(self.shader.blocks.len() - 1);
        self.cur
    }

    pub fn push(&mut self, instr: Instr) -> InstrId {
        let id = self.shader.add_instr(instr);
        self.shader.block_mut(self.cur).instrs.push(id);
        id
    }

    /// Mark `id` as a root that must survive with no consumers.
    pub fn keep(&mut self, id: InstrId) {
        self.shader.block_mut(self.cur).keeps.push(id);
    }

    /// Mark `id` as a shader output.
    pub fn output(&mut self, id: InstrId) {
        self.shader.outputs.push(id);
    }

    pub fn set_brcond(&mut self, id: InstrId) {
        self.shader.block_mut(self.cur).brcond = Some(id);
    }

    pub fn input(&mut self, typ: RegType) -> InstrId {
        self.push(Instr::new(Opcode::MetaInput, Some(Dst::new(1, typ)), typ))
    }

    pub fn phi(&mut self, typ: RegType) -> InstrId {
        self.push(Instr::new(Opcode::MetaPhi, Some(Dst::new(1, typ)), typ))
    }

    pub fn mov(&mut self, src: Src, typ: RegType) -> InstrId {
        let mut i = Instr::new(Opcode::Mov, Some(Dst::new(1, typ)), typ);
        i.srcs.push(src);
        self.push(i)
    }

    pub fn mov_imm(&mut self, v: u32, typ: RegType) -> InstrId {
        self.mov(Src::imm(v), typ)
    }

    pub fn mov_const(&mut self, slot: u16, typ: RegType) -> InstrId {
        self.mov(Src::const_slot(slot), typ)
    }

    pub fn alu1(&mut self, opc: Opcode, a: Src, typ: RegType) -> InstrId {
        let mut i = Instr::new(opc, Some(Dst::new(1, typ)), typ);
        i.srcs.push(a);
        self.push(i)
    }

    pub fn alu2(&mut self, opc: Opcode, a: Src, b: Src, typ: RegType) -> InstrId {
        let mut i = Instr::new(opc, Some(Dst::new(1, typ)), typ);
        i.srcs.push(a);
        i.srcs.push(b);
        self.push(i)
    }

    pub fn mad(&mut self, a: Src, b: Src, c: Src, typ: RegType) -> InstrId {
        let mut i = Instr::new(Opcode::Mad, Some(Dst::new(1, typ)), typ);
        i.srcs.push(a);
        i.srcs.push(b);
        i.srcs.push(c);
        self.push(i)
    }

    pub fn sfu(&mut self, opc: Opcode, a: Src) -> InstrId {
        debug_assert!(opc.is_sfu());
        let mut i = Instr::new(opc, Some(Dst::new(1, RegType::F32)), RegType::F32);
        i.srcs.push(a);
        self.push(i)
    }

    pub fn bary(&mut self, inloc: u32) -> InstrId {
        let mut i = Instr::new(Opcode::Bary, Some(Dst::new(1, RegType::F32)), RegType::F32);
        i.srcs.push(Src::imm(inloc));
        self.push(i)
    }

    /// Texture sample with a register-indexed sampler/texture pair
    /// (the last source references a two-component collect).
    pub fn sam(&mut self, coords: Src, samp_tex: Option<Src>) -> InstrId {
        let mut i = Instr::new(Opcode::Sam, Some(Dst::new(4, RegType::F32)), RegType::F32);
        i.srcs.push(coords);
        if let Some(st) = samp_tex {
            i.srcs.push(st);
        } else {
            i.tex_imm = Some((0, 0));
        }
        self.push(i)
    }

    pub fn tex_prefetch(&mut self) -> InstrId {
        self.push(Instr::new(
            Opcode::MetaTexPrefetch,
            Some(Dst::new(4, RegType::F32)),
            RegType::F32,
        ))
    }

    pub fn push_const(&mut self) -> InstrId {
        self.push(Instr::new(Opcode::PushConst, None, RegType::U32))
    }

    pub fn collect(&mut self, elems: &[InstrId], typ: RegType) -> InstrId {
        let mut i = Instr::new(
            Opcode::MetaCollect,
            Some(Dst::new(elems.len() as u8, typ)),
            typ,
        );
        for &e in elems {
            i.srcs.push(Src::ssa(e, 0));
        }
        self.push(i)
    }

    pub fn split(&mut self, vec: InstrId, comp: u8, typ: RegType) -> InstrId {
        let mut i = Instr::new(Opcode::MetaSplit, Some(Dst::new(1, typ)), typ);
        i.srcs.push(Src::ssa(vec, comp));
        self.push(i)
    }

    pub fn mova0(&mut self, src: Src) -> InstrId {
        let mut i = Instr::new(Opcode::MovA0, Some(Dst::new(1, RegType::S32)), RegType::S32);
        i.srcs.push(src);
        self.push(i)
    }

    pub fn mova1(&mut self, src: Src) -> InstrId {
        let mut i = Instr::new(Opcode::MovA1, Some(Dst::new(1, RegType::S32)), RegType::S32);
        i.srcs.push(src);
        self.push(i)
    }

    pub fn movp(&mut self, src: Src) -> InstrId {
        let mut i = Instr::new(Opcode::MovP, Some(Dst::new(1, RegType::U32)), RegType::U32);
        i.srcs.push(src);
        self.push(i)
    }

    /// An instruction consuming the live a0 writer through relative
    /// addressing.
    pub fn mov_relative(&mut self, addr: InstrId, slot: u16, typ: RegType) -> InstrId {
        let mut i = Instr::new(Opcode::Mov, Some(Dst::new(1, typ)), typ);
        i.srcs.push(Src::const_slot(slot));
        i.address = Some(addr);
        self.push(i)
    }

    pub fn kill(&mut self, pred: InstrId) -> InstrId {
        let mut i = Instr::new(Opcode::Kill, None, RegType::U32);
        i.predicate = Some(pred);
        let id = self.push(i);
        self.keep(id);
        id
    }

    pub fn ldg(&mut self, addr: Src) -> InstrId {
        let mut i = Instr::new(Opcode::LdG, Some(Dst::new(1, RegType::U32)), RegType::U32);
        i.srcs.push(addr);
        i.barrier_class = BarrierClass::BUFFER_R;
        i.barrier_conflict = BarrierClass::BUFFER_W | BarrierClass::EVERYTHING;
        self.push(i)
    }

    pub fn stg(&mut self, addr: Src, val: Src) -> InstrId {
        let mut i = Instr::new(Opcode::StG, None, RegType::U32);
        i.srcs.push(addr);
        i.srcs.push(val);
        i.barrier_class = BarrierClass::BUFFER_W;
        i.barrier_conflict =
            BarrierClass::BUFFER_R | BarrierClass::BUFFER_W | BarrierClass::EVERYTHING;
        let id = self.push(i);
        self.keep(id);
        id
    }

    pub fn array_load(&mut self, array_id: u16, addr: Src) -> InstrId {
        let mut i = Instr::new(Opcode::LdL, Some(Dst::new(1, RegType::U32)), RegType::U32);
        i.srcs.push(addr);
        i.array_id = Some(array_id);
        i.barrier_class = BarrierClass::ARRAY_R;
        i.barrier_conflict = BarrierClass::ARRAY_W | BarrierClass::EVERYTHING;
        self.push(i)
    }

    pub fn array_store(&mut self, array_id: u16, addr: Src, val: Src) -> InstrId {
        let mut i = Instr::new(Opcode::StL, None, RegType::U32);
        i.srcs.push(addr);
        i.srcs.push(val);
        i.array_id = Some(array_id);
        i.barrier_class = BarrierClass::ARRAY_W;
        i.barrier_conflict =
            BarrierClass::ARRAY_R | BarrierClass::ARRAY_W | BarrierClass::EVERYTHING;
        let id = self.push(i);
        self.keep(id);
        id
    }
}

impl Default for ShaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
