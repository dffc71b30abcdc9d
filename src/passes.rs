//! Per-function optimization passes.
//!
//! Each pass rewrites one function body and reports whether it changed anything;
//! `PassManager` repeats the pipeline until it settles.

use super::ir::{BinOp, BlockId, Body, Function, Inst, Operand, SlotId, Terminator, ValueId};
use std::collections::{HashMap, HashSet};

const MAX_ROUNDS: usize = 8;

pub(crate) trait FunctionPass {
    fn name(&self) -> &'static str;
    fn run(&self, body: &mut Body) -> bool;
}

pub(crate) struct PassManager {
    passes: Vec<Box<dyn FunctionPass>>,
}

impl PassManager {
    pub(crate) fn new() -> Self {
        PassManager { passes: Vec::new() }
    }

    pub(crate) fn add(&mut self, pass: Box<dyn FunctionPass>) {
        self.passes.push(pass);
    }

    /// Instruction combining, reassociation, redundant load/store elimination and CFG simplification.
    pub(crate) fn standard() -> Self {
        let mut pm = PassManager::new();
        pm.add(Box::new(InstCombine));
        pm.add(Box::new(Reassociate));
        pm.add(Box::new(LoadStoreElim));
        pm.add(Box::new(SimplifyCfg));
        pm
    }

    pub(crate) fn run(&self, func: &mut Function) {
        let name = &func.name;
        let body = match func.body.as_mut() {
            Some(body) => body,
            None => return,
        };
        for _ in 0..MAX_ROUNDS {
            let mut changed = false;
            for pass in &self.passes {
                if pass.run(body) {
                    tracing::trace!(pass = pass.name(), function = %name, "pass changed function");
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

fn used_values(body: &Body) -> HashSet<ValueId> {
    let mut used = HashSet::new();
    for block in &body.blocks {
        for inst in &block.insts {
            for op in inst.operands() {
                if let Operand::Value(v) = op {
                    used.insert(v);
                }
            }
        }
        match &block.term {
            Some(Terminator::CondBr {
                cond: Operand::Value(v),
                ..
            })
            | Some(Terminator::Ret(Operand::Value(v))) => {
                used.insert(*v);
            }
            _ => {}
        }
    }
    used
}

/// Removes side-effect-free instructions whose result is never used.
fn remove_dead_values(body: &mut Body) -> bool {
    let mut changed = false;
    loop {
        let used = used_values(body);
        let mut removed = false;
        for block in &mut body.blocks {
            let before = block.insts.len();
            block.insts.retain(|inst| {
                inst.has_side_effects() || inst.dst().map_or(true, |d| used.contains(&d))
            });
            removed |= block.insts.len() != before;
        }
        if !removed {
            return changed;
        }
        changed = true;
    }
}

/// Folds constants and trivial identities, then drops dead instructions.
pub(crate) struct InstCombine;

impl InstCombine {
    fn simplify(inst: &Inst) -> Option<(ValueId, Operand)> {
        match *inst {
            Inst::Binary {
                dst,
                op,
                lhs: Operand::Const(l),
                rhs: Operand::Const(r),
            } => Some((dst, Operand::Const(op.apply(l, r)))),
            Inst::Binary {
                dst,
                op: BinOp::Mul,
                lhs,
                rhs: Operand::Const(one),
            } if one == 1.0 => Some((dst, lhs)),
            Inst::Compare {
                dst,
                pred,
                lhs: Operand::Const(l),
                rhs: Operand::Const(r),
            } => Some((dst, Operand::Bool(pred.apply(l, r)))),
            Inst::BoolToDouble {
                dst,
                src: Operand::Bool(b),
            } => Some((dst, Operand::Const(if b { 1.0 } else { 0.0 }))),
            _ => None,
        }
    }
}

impl FunctionPass for InstCombine {
    fn name(&self) -> &'static str {
        "instcombine"
    }

    fn run(&self, body: &mut Body) -> bool {
        let mut changed = false;
        loop {
            let folded: Vec<(ValueId, Operand)> = body
                .blocks
                .iter()
                .flat_map(|b| b.insts.iter())
                .filter_map(InstCombine::simplify)
                .collect();
            if folded.is_empty() {
                break;
            }
            for (dst, replacement) in folded {
                body.replace_all_uses(dst, replacement);
            }
            // the folded instructions are dead now
            remove_dead_values(body);
            changed = true;
        }
        remove_dead_values(body) || changed
    }
}

/// Moves constants to the right-hand side of commutative operations.
pub(crate) struct Reassociate;

impl FunctionPass for Reassociate {
    fn name(&self) -> &'static str {
        "reassociate"
    }

    fn run(&self, body: &mut Body) -> bool {
        let mut changed = false;
        for block in &mut body.blocks {
            for inst in &mut block.insts {
                if let Inst::Binary { op, lhs, rhs, .. } = inst {
                    let lhs_const = matches!(lhs, Operand::Const(_));
                    let rhs_const = matches!(rhs, Operand::Const(_));
                    if op.is_commutative() && lhs_const && !rhs_const {
                        std::mem::swap(lhs, rhs);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}

/// Block-local store-to-load forwarding and dead store removal; slots that are
/// never loaded lose their stores and their `alloca`.
pub(crate) struct LoadStoreElim;

impl LoadStoreElim {
    fn resolve(subst: &HashMap<ValueId, Operand>, op: Operand) -> Operand {
        match op {
            Operand::Value(v) => subst.get(&v).copied().unwrap_or(op),
            other => other,
        }
    }

    fn forward_in_block(body: &mut Body, block: usize) -> bool {
        let mut known: HashMap<SlotId, Operand> = HashMap::new();
        let mut unread_store: HashMap<SlotId, usize> = HashMap::new();
        let mut subst: HashMap<ValueId, Operand> = HashMap::new();
        let mut dead = Vec::new();

        for (i, inst) in body.blocks[block].insts.iter().enumerate() {
            match *inst {
                Inst::Store { slot, src } => {
                    if let Some(j) = unread_store.insert(slot, i) {
                        dead.push(j);
                    }
                    known.insert(slot, LoadStoreElim::resolve(&subst, src));
                }
                Inst::Load { dst, slot } => {
                    unread_store.remove(&slot);
                    match known.get(&slot) {
                        Some(value) => {
                            subst.insert(dst, *value);
                            dead.push(i);
                        }
                        None => {
                            known.insert(slot, Operand::Value(dst));
                        }
                    }
                }
                _ => {}
            }
        }

        if dead.is_empty() {
            return false;
        }
        dead.sort_unstable();
        let insts = &mut body.blocks[block].insts;
        for i in dead.into_iter().rev() {
            insts.remove(i);
        }
        for (from, to) in subst {
            body.replace_all_uses(from, to);
        }
        true
    }

    fn drop_unread_slots(body: &mut Body) -> bool {
        let loaded: HashSet<SlotId> = body
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter_map(|inst| match inst {
                Inst::Load { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();

        let mut changed = false;
        for block in &mut body.blocks {
            let before = block.insts.len();
            block.insts.retain(|inst| match inst {
                Inst::Alloca { slot } | Inst::Store { slot, .. } => loaded.contains(slot),
                _ => true,
            });
            changed |= block.insts.len() != before;
        }
        changed
    }
}

impl FunctionPass for LoadStoreElim {
    fn name(&self) -> &'static str {
        "load-store-elim"
    }

    fn run(&self, body: &mut Body) -> bool {
        let mut changed = false;
        for block in 0..body.blocks.len() {
            changed |= LoadStoreElim::forward_in_block(body, block);
        }
        LoadStoreElim::drop_unread_slots(body) || changed
    }
}

/// Folds constant branches, removes unreachable blocks, collapses trivial phis and
/// merges straight-line block chains.
pub(crate) struct SimplifyCfg;

impl SimplifyCfg {
    fn remove_phi_edge(body: &mut Body, block: BlockId, from: BlockId) {
        if let Some(b) = body.blocks.get_mut(block.0) {
            for inst in &mut b.insts {
                if let Inst::Phi { incoming, .. } = inst {
                    incoming.retain(|(_, pred)| *pred != from);
                }
            }
        }
    }

    fn fold_branches(body: &mut Body) -> bool {
        let mut changed = false;
        for i in 0..body.blocks.len() {
            let folded = match body.blocks[i].term {
                Some(Terminator::CondBr {
                    cond: Operand::Bool(taken),
                    then_bb,
                    else_bb,
                }) => {
                    let (target, dropped) = if taken {
                        (then_bb, else_bb)
                    } else {
                        (else_bb, then_bb)
                    };
                    if target != dropped {
                        SimplifyCfg::remove_phi_edge(body, dropped, BlockId(i));
                    }
                    Some(target)
                }
                Some(Terminator::CondBr {
                    then_bb, else_bb, ..
                }) if then_bb == else_bb => Some(then_bb),
                _ => None,
            };
            if let Some(target) = folded {
                body.blocks[i].term = Some(Terminator::Br(target));
                changed = true;
            }
        }
        changed
    }

    fn remove_unreachable(body: &mut Body) -> bool {
        let mut reachable = vec![false; body.blocks.len()];
        let mut work = vec![BlockId(0)];
        while let Some(b) = work.pop() {
            if b.0 >= reachable.len() || reachable[b.0] {
                continue;
            }
            reachable[b.0] = true;
            if let Some(term) = &body.blocks[b.0].term {
                work.extend(term.successors());
            }
        }
        if reachable.iter().all(|r| *r) {
            return false;
        }
        body.retain_blocks(&reachable);
        true
    }

    fn collapse_trivial_phis(body: &mut Body) -> bool {
        let mut trivial = Vec::new();
        for block in &body.blocks {
            for inst in block.insts.iter().take_while(|i| i.is_phi()) {
                if let Inst::Phi { dst, incoming } = inst {
                    let mut values = incoming
                        .iter()
                        .map(|(v, _)| *v)
                        .filter(|v| *v != Operand::Value(*dst));
                    if let Some(first) = values.next() {
                        if values.all(|v| v == first) {
                            trivial.push((*dst, first));
                        }
                    }
                }
            }
        }
        if trivial.is_empty() {
            return false;
        }
        let subst: HashMap<ValueId, Operand> = trivial.iter().copied().collect();
        for (dst, value) in &trivial {
            // a phi may forward another collapsed phi
            let mut value = *value;
            let mut hops = 0;
            while let Operand::Value(v) = value {
                match subst.get(&v) {
                    Some(next) if hops < subst.len() => value = *next,
                    _ => break,
                }
                hops += 1;
            }
            body.replace_all_uses(*dst, value);
        }
        let gone: HashSet<ValueId> = trivial.into_iter().map(|(d, _)| d).collect();
        for block in &mut body.blocks {
            block
                .insts
                .retain(|inst| !(inst.is_phi() && inst.dst().map_or(false, |d| gone.contains(&d))));
        }
        true
    }

    // Finds a block whose only predecessor ends in an unconditional branch to it.
    fn mergeable(body: &Body) -> Option<(BlockId, BlockId)> {
        let preds = body.predecessors();
        for (b, p) in preds.iter().enumerate().skip(1) {
            if let [pred] = p.as_slice() {
                let jumps_here = body.blocks[pred.0].term == Some(Terminator::Br(BlockId(b)));
                let has_phi = body.blocks[b].insts.iter().any(Inst::is_phi);
                if jumps_here && pred.0 != b && !has_phi {
                    return Some((*pred, BlockId(b)));
                }
            }
        }
        None
    }

    fn merge_blocks(body: &mut Body) -> bool {
        let mut changed = false;
        while let Some((pred, block)) = SimplifyCfg::mergeable(body) {
            let insts = std::mem::take(&mut body.blocks[block.0].insts);
            let term = body.blocks[block.0].term.take();
            if let Some(term) = &term {
                for succ in term.successors() {
                    for inst in &mut body.blocks[succ.0].insts {
                        if let Inst::Phi { incoming, .. } = inst {
                            for (_, from) in incoming.iter_mut() {
                                if *from == block {
                                    *from = pred;
                                }
                            }
                        }
                    }
                }
            }
            let p = &mut body.blocks[pred.0];
            p.insts.extend(insts);
            p.term = term;

            let keep: Vec<bool> = (0..body.blocks.len()).map(|i| i != block.0).collect();
            body.retain_blocks(&keep);
            changed = true;
        }
        changed
    }
}

impl FunctionPass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "simplifycfg"
    }

    fn run(&self, body: &mut Body) -> bool {
        let mut changed = SimplifyCfg::fold_branches(body);
        changed |= SimplifyCfg::remove_unreachable(body);
        changed |= SimplifyCfg::collapse_trivial_phis(body);
        changed |= SimplifyCfg::merge_blocks(body);
        changed
    }
}

#[cfg(test)]
mod test {
    use super::super::ir::{CmpPred, FunctionBuilder, Module};
    use super::super::verify::verify_function;
    use super::*;

    fn optimized(f: Function) -> Function {
        let mut f = f;
        PassManager::standard().run(&mut f);
        let mut m = Module::new("test");
        m.add_function(Function::declaration(f.name.clone(), f.params.clone()));
        verify_function(&m, &f).unwrap();
        f
    }

    fn entry_insts(f: &Function) -> &[Inst] {
        &f.body.as_ref().unwrap().blocks[0].insts
    }

    #[test]
    fn test_constant_folding() {
        let mut b = FunctionBuilder::new("__anon_expr", &[]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let sum = b.binary(BinOp::Add, Operand::Const(4.0), Operand::Const(5.0), "addtmp");
        let prod = b.binary(BinOp::Mul, sum, Operand::Const(2.0), "multmp");
        b.ret(prod);
        let f = optimized(b.finish());
        assert!(entry_insts(&f).is_empty());
        assert_eq!(
            f.body.as_ref().unwrap().blocks[0].term,
            Some(Terminator::Ret(Operand::Const(18.0)))
        );
    }

    #[test]
    fn test_store_forwarding_removes_slots() {
        let mut b = FunctionBuilder::new("id", &["x".to_owned()]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let slot = b.entry_alloca("x");
        b.store(slot, Operand::Param(0));
        let x = b.load(slot, "x");
        let y = b.binary(BinOp::Mul, x, Operand::Const(1.0), "multmp");
        b.ret(y);
        let f = optimized(b.finish());
        assert!(entry_insts(&f).is_empty());
        assert_eq!(
            f.body.as_ref().unwrap().blocks[0].term,
            Some(Terminator::Ret(Operand::Param(0)))
        );
    }

    #[test]
    fn test_reassociate_moves_constant_right() {
        let mut b = FunctionBuilder::new("f", &["x".to_owned()]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let v = b.binary(BinOp::Add, Operand::Const(2.0), Operand::Param(0), "addtmp");
        b.ret(v);
        let f = optimized(b.finish());
        assert!(matches!(
            entry_insts(&f)[0],
            Inst::Binary {
                op: BinOp::Add,
                lhs: Operand::Param(0),
                rhs: Operand::Const(_),
                ..
            }
        ));
    }

    #[test]
    fn test_constant_branch_collapses_to_one_block() {
        let mut b = FunctionBuilder::new("f", &[]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let cond = b.compare(CmpPred::One, Operand::Const(1.0), Operand::Const(0.0), "ifcond");
        let then_bb = b.append_block("then");
        let else_bb = b.append_block("else");
        let merge = b.append_block("ifcont");
        b.cond_br(cond, then_bb, else_bb);
        b.position_at_end(then_bb);
        b.br(merge);
        b.position_at_end(else_bb);
        b.br(merge);
        b.position_at_end(merge);
        let v = b.phi(
            vec![
                (Operand::Const(10.0), then_bb),
                (Operand::Const(20.0), else_bb),
            ],
            "iftmp",
        );
        b.ret(v);
        let f = optimized(b.finish());
        let body = f.body.as_ref().unwrap();
        assert_eq!(body.blocks.len(), 1);
        assert_eq!(body.blocks[0].term, Some(Terminator::Ret(Operand::Const(10.0))));
    }

    #[test]
    fn test_calls_are_kept() {
        let mut b = FunctionBuilder::new("f", &[]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        b.call("f", vec![]);
        b.ret(Operand::Const(0.0));
        let f = optimized(b.finish());
        assert!(matches!(entry_insts(&f)[0], Inst::Call { .. }));
    }

    #[test]
    fn test_loads_across_blocks_are_kept() {
        let mut b = FunctionBuilder::new("f", &["c".to_owned()]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let slot = b.entry_alloca("v");
        b.store(slot, Operand::Const(1.0));
        let cond = b.compare(CmpPred::One, Operand::Param(0), Operand::Const(0.0), "c");
        let set = b.append_block("set");
        let done = b.append_block("done");
        b.cond_br(cond, set, done);
        b.position_at_end(set);
        b.store(slot, Operand::Const(2.0));
        b.br(done);
        b.position_at_end(done);
        let v = b.load(slot, "v");
        b.ret(v);
        let f = optimized(b.finish());
        let body = f.body.as_ref().unwrap();
        let loads = body
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|i| matches!(i, Inst::Load { .. }))
            .count();
        assert_eq!(loads, 1);
    }
}
