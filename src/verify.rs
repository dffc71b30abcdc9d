use super::error::{Error, ErrorKind};
use super::ir::{Body, BlockId, Function, Inst, Module, Operand, Terminator, ValueId};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Double,
    Bool,
}

fn invalid(func: &Function, msg: String) -> Error {
    Error::from(ErrorKind::Verify(format!("{}: {}", func.name, msg)))
}

struct Verifier<'a> {
    module: &'a Module,
    func: &'a Function,
    body: &'a Body,
    // type of each defined value, and the block that defines it
    defs: Vec<Option<(Ty, BlockId)>>,
}

impl<'a> Verifier<'a> {
    fn fail<T>(&self, msg: String) -> Result<T, Error> {
        Err(invalid(self.func, msg))
    }

    fn collect_defs(&mut self) -> Result<(), Error> {
        let mut defs = vec![None; self.body.value_count()];
        for (b, block) in self.body.blocks.iter().enumerate() {
            for inst in &block.insts {
                let dst = match inst.dst() {
                    Some(dst) => dst,
                    None => continue,
                };
                let ty = match inst {
                    Inst::Compare { .. } => Ty::Bool,
                    _ => Ty::Double,
                };
                match defs.get_mut(dst.0) {
                    Some(slot) if slot.is_none() => *slot = Some((ty, BlockId(b))),
                    Some(_) => return self.fail(format!("value {} defined twice", dst.0)),
                    None => return self.fail(format!("value {} out of range", dst.0)),
                }
            }
        }
        self.defs = defs;
        Ok(())
    }

    fn type_of(&self, op: &Operand, seen: &HashSet<ValueId>, block: BlockId) -> Result<Ty, Error> {
        match op {
            Operand::Const(_) => Ok(Ty::Double),
            Operand::Bool(_) => Ok(Ty::Bool),
            Operand::Param(i) if *i < self.func.params.len() => Ok(Ty::Double),
            Operand::Param(i) => self.fail(format!("parameter {} out of range", i)),
            Operand::Value(v) => match self.defs.get(v.0).copied().flatten() {
                Some((_, def_block)) if def_block == block && !seen.contains(v) => {
                    self.fail(format!("value {} used before its definition", v.0))
                }
                Some((ty, _)) => Ok(ty),
                None => self.fail(format!("use of undefined value {}", v.0)),
            },
        }
    }

    fn expect(
        &self,
        op: &Operand,
        want: Ty,
        seen: &HashSet<ValueId>,
        block: BlockId,
    ) -> Result<(), Error> {
        let ty = self.type_of(op, seen, block)?;
        if ty != want {
            return self.fail(format!("operand has type {:?}, expected {:?}", ty, want));
        }
        Ok(())
    }

    fn check_block(&self, id: BlockId, preds: &[BlockId]) -> Result<(), Error> {
        let block = &self.body.blocks[id.0];
        let mut seen = HashSet::new();
        let mut in_phi_prefix = true;

        for inst in &block.insts {
            if !inst.is_phi() {
                in_phi_prefix = false;
            }
            match inst {
                Inst::Phi { incoming, .. } => {
                    if !in_phi_prefix {
                        return self.fail(format!("phi not at head of {}", block.label));
                    }
                    let mut from: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
                    from.sort();
                    let mut expected = preds.to_vec();
                    expected.sort();
                    if from != expected {
                        return self.fail(format!(
                            "phi in {} does not match its predecessors",
                            block.label
                        ));
                    }
                    // incoming values flow along edges, so they are checked by type only
                    for (v, _) in incoming {
                        let ty = match v {
                            Operand::Value(v) => self.defs.get(v.0).copied().flatten().map(|d| d.0),
                            other => self.type_of(other, &seen, id).ok(),
                        };
                        if ty != Some(Ty::Double) {
                            return self.fail(format!("bad phi operand in {}", block.label));
                        }
                    }
                }
                Inst::Alloca { slot } => {
                    if id.0 != 0 {
                        return self.fail("alloca outside the entry block".to_owned());
                    }
                    if slot.0 >= self.body.slots.len() {
                        return self.fail(format!("slot {} out of range", slot.0));
                    }
                }
                Inst::Load { slot, .. } => {
                    if slot.0 >= self.body.slots.len() {
                        return self.fail(format!("slot {} out of range", slot.0));
                    }
                }
                Inst::Store { slot, src } => {
                    if slot.0 >= self.body.slots.len() {
                        return self.fail(format!("slot {} out of range", slot.0));
                    }
                    self.expect(src, Ty::Double, &seen, id)?;
                }
                Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => {
                    self.expect(lhs, Ty::Double, &seen, id)?;
                    self.expect(rhs, Ty::Double, &seen, id)?;
                }
                Inst::BoolToDouble { src, .. } => self.expect(src, Ty::Bool, &seen, id)?,
                Inst::Call { callee, args, .. } => {
                    let arity = match self.module.get_function(callee) {
                        Some(f) => f.arity(),
                        None if *callee == self.func.name => self.func.arity(),
                        None => return self.fail(format!("call to undeclared @{}", callee)),
                    };
                    if arity != args.len() {
                        return self.fail(format!("call to @{} has wrong arity", callee));
                    }
                    for arg in args {
                        self.expect(arg, Ty::Double, &seen, id)?;
                    }
                }
            }
            if let Some(dst) = inst.dst() {
                seen.insert(dst);
            }
        }

        match &block.term {
            None => self.fail(format!("block {} has no terminator", block.label)),
            Some(term) => {
                for succ in term.successors() {
                    if succ.0 >= self.body.blocks.len() {
                        return self.fail(format!("branch to missing block {}", succ.0));
                    }
                }
                match term {
                    Terminator::Br(_) => Ok(()),
                    Terminator::CondBr { cond, .. } => self.expect(cond, Ty::Bool, &seen, id),
                    Terminator::Ret(v) => self.expect(v, Ty::Double, &seen, id),
                }
            }
        }
    }
}

/// Checks that `func` is structurally well formed against the declarations in `module`.
pub(crate) fn verify_function(module: &Module, func: &Function) -> Result<(), Error> {
    let body = match &func.body {
        Some(body) => body,
        None => return Ok(()),
    };
    if body.blocks.is_empty() {
        return Err(invalid(func, "function body has no blocks".to_owned()));
    }

    let mut verifier = Verifier {
        module,
        func,
        body,
        defs: Vec::new(),
    };
    verifier.collect_defs()?;

    let preds = body.predecessors();
    for (i, p) in preds.iter().enumerate() {
        verifier.check_block(BlockId(i), p)?;
    }
    Ok(())
}
