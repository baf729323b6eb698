//! Barrier ordering dependencies.
//!
//! Instructions with memory/ordering side effects carry a barrier class and
//! a conflict mask.  Before the DAG is built, this pass walks each block and
//! records explicit false dependencies so the scheduler cannot reorder
//! conflicting operations, while leaving independent ones free to move.

use crate::ir::{BlockId, InstrId, Shader};
use log::trace;

/// Record barrier-ordering dependencies for one block in each involved
/// instruction's `deps` list.
pub fn add_barrier_deps(shader: &mut Shader, block: BlockId) {
    let order: Vec<InstrId> = shader.block(block).instrs.clone();
    let mut new_deps: Vec<(InstrId, InstrId)> = Vec::new();

    for (pos, &id) in order.iter().enumerate() {
        let class = shader[id].barrier_class;
        if class.is_empty() {
            continue;
        }

        // Nearest conflicting predecessors, stopping at the first
        // same-class instruction: that one transitively orders everything
        // before it.
        for &prev in order[..pos].iter().rev() {
            match classify(shader, prev, id) {
                Scan::Skip => {}
                Scan::Conflict => new_deps.push((id, prev)),
                Scan::SameClassStop => {
                    new_deps.push((id, prev));
                    break;
                }
            }
        }

        // And conflicting successors, which must wait for us.
        for &next in &order[pos + 1..] {
            match classify(shader, id, next) {
                Scan::Skip => {}
                Scan::Conflict => new_deps.push((next, id)),
                Scan::SameClassStop => {
                    new_deps.push((next, id));
                    break;
                }
            }
        }
    }

    for (consumer, dep) in new_deps {
        let deps = &mut shader[consumer].deps;
        if !deps.contains(&dep) {
            trace!("barrier dep: {consumer} after {dep}");
            deps.push(dep);
        }
    }
}

enum Scan {
    Skip,
    Conflict,
    SameClassStop,
}

/// How does `earlier` relate to the scanning instruction `later`?
fn classify(shader: &Shader, earlier: InstrId, later: InstrId) -> Scan {
    let e = &shader[earlier];
    let l = &shader[later];
    if e.opc.is_meta() {
        return Scan::Skip;
    }
    if !e.barrier_class.is_empty() && e.barrier_class == l.barrier_class {
        return Scan::SameClassStop;
    }
    if !l.barrier_conflict.intersects(e.barrier_class) {
        return Scan::Skip;
    }
    // A pure array-vs-array conflict on provably different arrays cannot
    // alias.
    if l.barrier_conflict.only_array(e.barrier_class) {
        if let (Some(a), Some(b)) = (e.array_id, l.array_id) {
            if a != b {
                return Scan::Skip;
            }
        }
    }
    Scan::Conflict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ShaderBuilder;
    use crate::ir::{RegType::*, Src};

    #[test]
    fn store_orders_after_loads() {
        let mut b = ShaderBuilder::new();
        let a = b.input(U32);
        let ld0 = b.ldg(Src::ssa(a, 0));
        let ld1 = b.ldg(Src::ssa(a, 0));
        let st = b.stg(Src::ssa(a, 0), Src::ssa(ld0, 0));
        let mut shader = b.finish();

        add_barrier_deps(&mut shader, BlockId::new(0));

        assert!(shader[st].deps.contains(&ld0));
        assert!(shader[st].deps.contains(&ld1));
        // Loads don't conflict with each other.
        assert!(shader[ld1].deps.is_empty());
        assert!(shader[ld0].deps.is_empty());
    }

    #[test]
    fn scan_stops_at_same_class() {
        let mut b = ShaderBuilder::new();
        let a = b.input(U32);
        let v = b.input(U32);
        let st0 = b.stg(Src::ssa(a, 0), Src::ssa(v, 0));
        let st1 = b.stg(Src::ssa(a, 0), Src::ssa(v, 0));
        let st2 = b.stg(Src::ssa(a, 0), Src::ssa(v, 0));
        let mut shader = b.finish();

        add_barrier_deps(&mut shader, BlockId::new(0));

        // Each store depends on its predecessor only; transitivity covers
        // the rest.
        assert_eq!(shader[st1].deps, vec![st0]);
        assert_eq!(shader[st2].deps, vec![st1]);
        assert!(shader[st0].deps.is_empty());
    }

    #[test]
    fn disjoint_array_ids_do_not_alias() {
        let mut b = ShaderBuilder::new();
        let a = b.input(U32);
        let v = b.input(U32);
        let st_a = b.array_store(1, Src::ssa(a, 0), Src::ssa(v, 0));
        let ld_b = b.array_load(2, Src::ssa(a, 0));
        let ld_a = b.array_load(1, Src::ssa(a, 0));
        let mut shader = b.finish();

        add_barrier_deps(&mut shader, BlockId::new(0));

        assert!(shader[ld_b].deps.is_empty());
        assert_eq!(shader[ld_a].deps, vec![st_a]);
    }
}
