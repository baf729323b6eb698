//! The ir3 instruction graph.
//!
//! Instructions live in a per-shader arena and are referenced by stable
//! [`InstrId`] handles; blocks own an ordered list of handles plus a "keeps"
//! list of instructions that must survive even with no SSA consumers (stores,
//! barriers and the like).  SSA sources reference their producing instruction
//! and an output component, so the graph is its own def-use structure and no
//! separate value table is needed.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::ops::{BitOr, Index, IndexMut};

/// A stable handle to an instruction in a [`Shader`]'s arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct InstrId(u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// A handle to a basic block in a [`Shader`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(u32);

impl BlockId {
    pub fn new(idx: usize) -> Self {
        BlockId(u32::try_from(idx).expect("too many blocks"))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// The ir3 instruction categories.
///
/// Category drives both encoding legality (which operand slots accept
/// constants or immediates) and scheduling classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Category {
    /// Control flow: jumps, branches, kill/demote.
    Flow,
    /// Moves, conversions and special-register writes.
    Mov,
    /// Two-source ALU.
    Alu,
    /// Three-source ALU (mad and friends).
    Mad,
    /// Special-function unit (transcendentals).
    Sfu,
    /// Texture sampling.
    Tex,
    /// Global/local memory.
    Mem,
    /// Pseudo-instructions that never reach the hardware.
    Meta,
}

/// An ir3 opcode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    // Flow (cat0)
    Jump,
    Br,
    Kill,
    Demote,
    // Moves (cat1)
    Mov,
    Cov,
    MovA0,
    MovA1,
    MovP,
    // ALU (cat2)
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    AbsNeg,
    Cmp,
    Bary,
    // Three-source ALU (cat3)
    Mad,
    Sel,
    // SFU (cat4)
    Rcp,
    Rsq,
    Sin,
    Cos,
    Log2,
    Exp2,
    Sqrt,
    // Texture (cat5)
    Sam,
    SamB,
    GetSize,
    GetLod,
    // Memory (cat6)
    LdG,
    StG,
    LdL,
    StL,
    Atomic,
    // Meta
    MetaInput,
    MetaPhi,
    MetaCollect,
    MetaSplit,
    MetaTexPrefetch,
    /// Push-constant load macro, expanded after scheduling.
    PushConst,
}

impl Opcode {
    pub fn category(self) -> Category {
        use Opcode::*;
        match self {
            Jump | Br | Kill | Demote => Category::Flow,
            Mov | Cov | MovA0 | MovA1 | MovP => Category::Mov,
            Add | Sub | Mul | And | Or | Xor | Shl | Shr | AbsNeg | Cmp
            | Bary => Category::Alu,
            Mad | Sel => Category::Mad,
            Rcp | Rsq | Sin | Cos | Log2 | Exp2 | Sqrt => Category::Sfu,
            Sam | SamB | GetSize | GetLod => Category::Tex,
            LdG | StG | LdL | StL | Atomic => Category::Mem,
            MetaInput | MetaPhi | MetaCollect | MetaSplit
            | MetaTexPrefetch | PushConst => Category::Meta,
        }
    }

    pub fn is_meta(self) -> bool {
        self.category() == Category::Meta
    }

    /// True for the plain and converting moves that copy propagation may
    /// fold away.  The special-register writes are moves too but are never
    /// propagated.
    pub fn is_move(self) -> bool {
        matches!(self, Opcode::Mov | Opcode::Cov)
    }

    pub fn is_mad_like(self) -> bool {
        matches!(self, Opcode::Mad | Opcode::Sel)
    }

    pub fn is_tex(self) -> bool {
        self.category() == Category::Tex
    }

    pub fn is_mem(self) -> bool {
        self.category() == Category::Mem
    }

    pub fn is_kill(self) -> bool {
        matches!(self, Opcode::Kill | Opcode::Demote)
    }

    pub fn is_sfu(self) -> bool {
        self.category() == Category::Sfu
    }

    /// Results need an (ss) sync before use.
    pub fn is_ss_producer(self) -> bool {
        self.is_sfu()
    }

    /// Results need a (sy) sync before use.  Global loads and atomics go
    /// through the same return queue as texture fetches.
    pub fn is_sy_producer(self) -> bool {
        self.is_tex() || matches!(self, Opcode::LdG | Opcode::Atomic)
    }

    pub fn writes_addr0(self) -> bool {
        self == Opcode::MovA0
    }

    pub fn writes_addr1(self) -> bool {
        self == Opcode::MovA1
    }

    pub fn writes_pred(self) -> bool {
        self == Opcode::MovP
    }

    /// Block-entry values that must be scheduled before anything else.
    pub fn is_input(self) -> bool {
        matches!(self, Opcode::MetaInput | Opcode::MetaPhi)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Jump => "jump",
            Opcode::Br => "br",
            Opcode::Kill => "kill",
            Opcode::Demote => "demote",
            Opcode::Mov => "mov",
            Opcode::Cov => "cov",
            Opcode::MovA0 => "mova",
            Opcode::MovA1 => "mova1",
            Opcode::MovP => "movp",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::AbsNeg => "absneg",
            Opcode::Cmp => "cmps",
            Opcode::Bary => "bary.f",
            Opcode::Mad => "mad",
            Opcode::Sel => "sel",
            Opcode::Rcp => "rcp",
            Opcode::Rsq => "rsq",
            Opcode::Sin => "sin",
            Opcode::Cos => "cos",
            Opcode::Log2 => "log2",
            Opcode::Exp2 => "exp2",
            Opcode::Sqrt => "sqrt",
            Opcode::Sam => "sam",
            Opcode::SamB => "samb",
            Opcode::GetSize => "getsize",
            Opcode::GetLod => "getlod",
            Opcode::LdG => "ldg",
            Opcode::StG => "stg",
            Opcode::LdL => "ldl",
            Opcode::StL => "stl",
            Opcode::Atomic => "atomic",
            Opcode::MetaInput => "_meta.input",
            Opcode::MetaPhi => "_meta.phi",
            Opcode::MetaCollect => "_meta.collect",
            Opcode::MetaSplit => "_meta.split",
            Opcode::MetaTexPrefetch => "_meta.tex_prefetch",
            Opcode::PushConst => "push_const",
        };
        f.write_str(name)
    }
}

/// The declared type of a value, which picks the numeric semantics used when
/// folding abs/neg/not into constants.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegType {
    F32,
    F16,
    U32,
    U16,
    S32,
    S16,
}

impl RegType {
    pub fn is_float(self) -> bool {
        matches!(self, RegType::F32 | RegType::F16)
    }

    pub fn is_half(self) -> bool {
        matches!(self, RegType::F16 | RegType::U16 | RegType::S16)
    }
}

/// Source modifier flags.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct SrcMods {
    bits: u8,
}

impl SrcMods {
    pub const NONE: SrcMods = SrcMods { bits: 0 };
    pub const ABS: SrcMods = SrcMods { bits: 1 };
    pub const NEG: SrcMods = SrcMods { bits: 2 };
    pub const BNOT: SrcMods = SrcMods { bits: 4 };
    pub const HALF: SrcMods = SrcMods { bits: 8 };

    pub fn is_none(self) -> bool {
        self.bits == 0
    }

    pub fn contains(self, other: SrcMods) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn intersects(self, other: SrcMods) -> bool {
        self.bits & other.bits != 0
    }
}

impl BitOr for SrcMods {
    type Output = SrcMods;

    fn bitor(self, rhs: SrcMods) -> SrcMods {
        SrcMods {
            bits: self.bits | rhs.bits,
        }
    }
}

/// What a source operand refers to.  Exactly one variant applies at a time;
/// the enum enforces that.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SrcRef {
    /// An SSA definition: producing instruction plus output component.
    Ssa { instr: InstrId, comp: u8 },
    /// A constant-buffer word.
    Const { slot: u16 },
    /// An embedded immediate.
    Imm(u32),
}

/// A source operand: a reference plus modifier flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Src {
    pub rf: SrcRef,
    pub mods: SrcMods,
}

impl Src {
    pub fn ssa(instr: InstrId, comp: u8) -> Src {
        Src {
            rf: SrcRef::Ssa { instr, comp },
            mods: SrcMods::NONE,
        }
    }

    pub fn const_slot(slot: u16) -> Src {
        Src {
            rf: SrcRef::Const { slot },
            mods: SrcMods::NONE,
        }
    }

    pub fn imm(v: u32) -> Src {
        Src {
            rf: SrcRef::Imm(v),
            mods: SrcMods::NONE,
        }
    }

    pub fn with_mods(mut self, mods: SrcMods) -> Src {
        self.mods = mods;
        self
    }

    pub fn as_ssa(&self) -> Option<InstrId> {
        match self.rf {
            SrcRef::Ssa { instr, .. } => Some(instr),
            _ => None,
        }
    }
}

/// A destination: how many components the instruction writes, and their type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Dst {
    pub comps: u8,
    pub typ: RegType,
}

impl Dst {
    pub fn new(comps: u8, typ: RegType) -> Dst {
        Dst { comps, typ }
    }
}

/// Barrier classes, used to compute false dependencies between instructions
/// with memory/ordering side effects.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BarrierClass {
    bits: u16,
}

impl BarrierClass {
    pub const NONE: BarrierClass = BarrierClass { bits: 0 };
    /// The wildcard class carried by full barriers; every conflict mask
    /// includes it.
    pub const EVERYTHING: BarrierClass = BarrierClass { bits: 1 << 6 };
    pub const ARRAY_R: BarrierClass = BarrierClass { bits: 1 << 0 };
    pub const ARRAY_W: BarrierClass = BarrierClass { bits: 1 << 1 };
    pub const BUFFER_R: BarrierClass = BarrierClass { bits: 1 << 2 };
    pub const BUFFER_W: BarrierClass = BarrierClass { bits: 1 << 3 };
    pub const IMAGE_R: BarrierClass = BarrierClass { bits: 1 << 4 };
    pub const IMAGE_W: BarrierClass = BarrierClass { bits: 1 << 5 };

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn intersects(self, other: BarrierClass) -> bool {
        self.bits & other.bits != 0
    }

    /// True when the overlap with `other` is entirely array reads/writes, so
    /// the disjoint-array-id exemption may apply.
    pub fn only_array(self, other: BarrierClass) -> bool {
        let common = self.bits & other.bits;
        common != 0
            && common & !(Self::ARRAY_R.bits | Self::ARRAY_W.bits) == 0
    }
}

impl BitOr for BarrierClass {
    type Output = BarrierClass;

    fn bitor(self, rhs: BarrierClass) -> BarrierClass {
        BarrierClass {
            bits: self.bits | rhs.bits,
        }
    }
}

/// A GPU micro-op.
#[derive(Clone, Debug)]
pub struct Instr {
    pub opc: Opcode,
    pub dst: Option<Dst>,
    pub srcs: SmallVec<[Src; 4]>,
    /// Replicated-lane repeat count; issue cost is `1 + repeat` cycles.
    pub repeat: u8,
    /// The instruction's operating type.  For `Cov` this is the destination
    /// type; `src_type` carries the source side.
    pub typ: RegType,
    pub src_type: RegType,
    pub barrier_class: BarrierClass,
    pub barrier_conflict: BarrierClass,
    /// Array accessed, when the barrier class is an array read/write.  Two
    /// instructions touching provably different arrays never alias.
    pub array_id: Option<u16>,
    /// The address-register writer this instruction's relative addressing
    /// depends on, if any.
    pub address: Option<InstrId>,
    /// The predicate-register writer guarding this instruction, if any.
    pub predicate: Option<InstrId>,
    /// False dependencies recorded by the barrier pass; scheduled-before
    /// constraints with no data flowing along them.
    pub deps: Vec<InstrId>,
    /// One-shot marker for the cat3 operand swap so copy propagation does
    /// not oscillate.
    pub swapped: bool,
    /// Immediate sampler/texture indices after the S2EN-to-immediate fold.
    pub tex_imm: Option<(u16, u16)>,
}

impl Instr {
    pub fn new(opc: Opcode, dst: Option<Dst>, typ: RegType) -> Instr {
        Instr {
            opc,
            dst,
            srcs: SmallVec::new(),
            repeat: 0,
            typ,
            src_type: typ,
            barrier_class: BarrierClass::NONE,
            barrier_conflict: BarrierClass::NONE,
            array_id: None,
            address: None,
            predicate: None,
            deps: Vec::new(),
            swapped: false,
            tex_imm: None,
        }
    }

    pub fn dst_comps(&self) -> u32 {
        self.dst.map_or(0, |d| u32::from(d.comps))
    }

    /// A type-preserving move with no conversion, the only kind copy
    /// propagation may see through.  A `Cov` whose source and destination
    /// types agree degenerates to one.
    pub fn is_same_type_mov(&self) -> bool {
        match self.opc {
            Opcode::Mov => true,
            Opcode::Cov => self.typ == self.src_type,
            _ => false,
        }
    }
}

/// A basic block: an ordered instruction sequence plus the roots that anchor
/// liveness (keeps and the branch condition).
#[derive(Default, Debug)]
pub struct Block {
    pub instrs: Vec<InstrId>,
    /// Instructions that must survive with no consumers (stores, kills,
    /// barriers).
    pub keeps: Vec<InstrId>,
    /// The branch condition instruction, if this block ends in a conditional
    /// branch.
    pub brcond: Option<InstrId>,
}

/// The per-shader immediates table: immediate values that did not fit an
/// instruction's immediate encoding, lowered into constant-buffer slots.
///
/// Space is claimed four words at a time (the constant file is vec4
/// addressed), clamped to the remaining constant-buffer budget.
#[derive(Debug)]
pub struct ImmTable {
    vals: Vec<u32>,
    base: u16,
    /// Words claimed so far; advances in vec4 steps.
    claimed: usize,
    max_words: usize,
}

impl ImmTable {
    pub fn new(base: u16, max_words: usize) -> ImmTable {
        ImmTable {
            vals: Vec::new(),
            base,
            claimed: 0,
            max_words,
        }
    }

    /// Place `v` in the table, reusing an existing entry when one matches.
    /// Returns the constant slot, or `None` when the budget is exhausted.
    pub fn lower(&mut self, v: u32) -> Option<u16> {
        if let Some(i) = self.vals.iter().position(|&x| x == v) {
            return Some(self.base + i as u16);
        }
        if self.vals.len() == self.claimed {
            let grown = (self.claimed + 4).min(self.max_words);
            if grown == self.claimed {
                return None;
            }
            self.claimed = grown;
        }
        let slot = self.base + self.vals.len() as u16;
        self.vals.push(v);
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }
}

/// One shader variant's instruction graph: the arena, its blocks, and the
/// shader-level output references.
#[derive(Debug)]
pub struct Shader {
    arena: Vec<Instr>,
    pub blocks: Vec<Block>,
    /// Shader outputs; root uses with no consuming instruction.
    pub outputs: Vec<InstrId>,
    pub imms: ImmTable,
}

impl Shader {
    pub fn new(imm_base: u16, max_const_words: usize) -> Shader {
        Shader {
            arena: Vec::new(),
            blocks: Vec::new(),
            outputs: Vec::new(),
            imms: ImmTable::new(imm_base, max_const_words),
        }
    }

    pub fn add_instr(&mut self, instr: Instr) -> InstrId {
        let id = InstrId(u32::try_from(self.arena.len()).expect("arena full"));
        self.arena.push(instr);
        id
    }

    /// Clone `id` into a fresh arena slot.  Used by the scheduler's
    /// deadlock-breaking split.
    pub fn clone_instr(&mut self, id: InstrId) -> InstrId {
        let mut copy = self.arena[id.index()].clone();
        copy.deps.clear();
        self.add_instr(copy)
    }

    pub fn num_instrs(&self) -> usize {
        self.arena.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }
}

impl Index<InstrId> for Shader {
    type Output = Instr;

    fn index(&self, id: InstrId) -> &Instr {
        &self.arena[id.index()]
    }
}

impl IndexMut<InstrId> for Shader {
    fn index_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.arena[id.index()]
    }
}

/// SSA use counts, computed as a standalone analysis over a block list
/// rather than maintained as refcount fields inside instructions.
#[derive(Debug)]
pub struct UseCounts {
    counts: FxHashMap<InstrId, u32>,
}

impl UseCounts {
    /// Count every SSA operand site, address-writer reference and predicate
    /// reference reachable from the blocks' instruction lists.
    pub fn compute(shader: &Shader) -> UseCounts {
        let mut counts = FxHashMap::default();
        let mut bump = |id: InstrId| *counts.entry(id).or_insert(0) += 1;
        for block in &shader.blocks {
            for &id in &block.instrs {
                let instr = &shader[id];
                for src in &instr.srcs {
                    if let Some(p) = src.as_ssa() {
                        bump(p);
                    }
                }
                if let Some(a) = instr.address {
                    bump(a);
                }
                if let Some(p) = instr.predicate {
                    bump(p);
                }
            }
        }
        for &id in &shader.outputs {
            bump(id);
        }
        UseCounts { counts }
    }

    pub fn get(&self, id: InstrId) -> u32 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn inc(&mut self, id: InstrId) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    pub fn dec(&mut self, id: InstrId) -> u32 {
        let c = self.counts.entry(id).or_insert(0);
        debug_assert!(*c > 0, "use count underflow for {id}");
        *c = c.saturating_sub(1);
        *c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imm_table_reuses_entries() {
        let mut t = ImmTable::new(16, 8);
        let a = t.lower(42).unwrap();
        let b = t.lower(7).unwrap();
        assert_eq!(t.lower(42), Some(a));
        assert_eq!(a, 16);
        assert_eq!(b, 17);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn imm_table_respects_budget() {
        let mut t = ImmTable::new(0, 4);
        for i in 0..4 {
            assert!(t.lower(i).is_some());
        }
        // A fifth distinct value needs another vec4 beyond the budget.
        assert_eq!(t.lower(100), None);
        // Reuse still works at capacity.
        assert_eq!(t.lower(3), Some(3));
    }

    #[test]
    fn imm_table_budget_below_one_vec4() {
        // A budget smaller than one vec4 still admits entries up to it.
        let mut t = ImmTable::new(8, 2);
        assert_eq!(t.lower(1), Some(8));
        assert_eq!(t.lower(2), Some(9));
        assert_eq!(t.lower(3), None);
        assert_eq!(t.lower(2), Some(9));
    }

    #[test]
    fn barrier_overlap_queries() {
        let rw = BarrierClass::ARRAY_R | BarrierClass::ARRAY_W;
        assert!(rw.only_array(BarrierClass::ARRAY_W));
        assert!(!BarrierClass::EVERYTHING.only_array(rw | BarrierClass::BUFFER_W));
        // A conflict mask carrying the wildcard catches full barriers.
        let conflict = BarrierClass::BUFFER_W | BarrierClass::EVERYTHING;
        assert!(conflict.intersects(BarrierClass::EVERYTHING));
        assert!(!BarrierClass::BUFFER_R.intersects(BarrierClass::BUFFER_W));
    }

    #[test]
    fn same_type_mov_classification() {
        let mut m = Instr::new(Opcode::Mov, Some(Dst::new(1, RegType::F32)), RegType::F32);
        assert!(m.is_same_type_mov());
        m.opc = Opcode::Cov;
        m.src_type = RegType::U32;
        assert!(!m.is_same_type_mov());
        m.src_type = RegType::F32;
        assert!(m.is_same_type_mov());
    }
}
