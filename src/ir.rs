//! In-memory IR: a module of functions made of basic blocks.
//!
//! Locals live in stack slots (`alloca`/`load`/`store`); control-flow joins use `phi`.
//! Every value is a double except comparison results, which are bools until widened.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ValueId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BlockId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Operand {
    Const(f64),
    Bool(bool),
    Value(ValueId),
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
}

impl BinOp {
    pub(crate) fn apply(self, l: f64, r: f64) -> f64 {
        match self {
            BinOp::Add => l + r,
            BinOp::Sub => l - r,
            BinOp::Mul => l * r,
        }
    }

    pub(crate) fn is_commutative(self) -> bool {
        self != BinOp::Sub
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpPred {
    /// unordered or less than
    Ult,
    /// ordered and not equal
    One,
}

impl CmpPred {
    pub(crate) fn apply(self, l: f64, r: f64) -> bool {
        let unordered = l.is_nan() || r.is_nan();
        match self {
            CmpPred::Ult => unordered || l < r,
            CmpPred::One => !unordered && l != r,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inst {
    Alloca {
        slot: SlotId,
    },
    Load {
        dst: ValueId,
        slot: SlotId,
    },
    Store {
        slot: SlotId,
        src: Operand,
    },
    Binary {
        dst: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Compare {
        dst: ValueId,
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
    },
    BoolToDouble {
        dst: ValueId,
        src: Operand,
    },
    Call {
        dst: ValueId,
        callee: String,
        args: Vec<Operand>,
    },
    Phi {
        dst: ValueId,
        incoming: Vec<(Operand, BlockId)>,
    },
}

impl Inst {
    pub(crate) fn dst(&self) -> Option<ValueId> {
        match self {
            Inst::Alloca { .. } | Inst::Store { .. } => None,
            Inst::Load { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::Compare { dst, .. }
            | Inst::BoolToDouble { dst, .. }
            | Inst::Call { dst, .. }
            | Inst::Phi { dst, .. } => Some(*dst),
        }
    }

    pub(crate) fn operands(&self) -> Vec<Operand> {
        match self {
            Inst::Alloca { .. } | Inst::Load { .. } => vec![],
            Inst::Store { src, .. } | Inst::BoolToDouble { src, .. } => vec![*src],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Call { args, .. } => args.clone(),
            Inst::Phi { incoming, .. } => incoming.iter().map(|(v, _)| *v).collect(),
        }
    }

    pub(crate) fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            Inst::Alloca { .. } | Inst::Load { .. } => vec![],
            Inst::Store { src, .. } | Inst::BoolToDouble { src, .. } => vec![src],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Call { args, .. } => args.iter_mut().collect(),
            Inst::Phi { incoming, .. } => incoming.iter_mut().map(|(v, _)| v).collect(),
        }
    }

    /// Whether removing this instruction could change behaviour even if its result is unused.
    pub(crate) fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Inst::Alloca { .. } | Inst::Store { .. } | Inst::Call { .. }
        )
    }

    pub(crate) fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Ret(Operand),
}

impl Terminator {
    pub(crate) fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            Terminator::Ret(_) => vec![],
        }
    }

    fn operand_mut(&mut self) -> Option<&mut Operand> {
        match self {
            Terminator::Br(_) => None,
            Terminator::CondBr { cond, .. } => Some(cond),
            Terminator::Ret(v) => Some(v),
        }
    }

    fn targets_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            Terminator::Br(target) => vec![target],
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => vec![then_bb, else_bb],
            Terminator::Ret(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Block {
    pub(crate) label: String,
    pub(crate) insts: Vec<Inst>,
    pub(crate) term: Option<Terminator>,
}

/// Blocks, stack slots and value names of a defined function. Block 0 is the entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Body {
    pub(crate) blocks: Vec<Block>,
    pub(crate) slots: Vec<String>,
    pub(crate) value_names: Vec<String>,
}

impl Body {
    pub(crate) fn value_count(&self) -> usize {
        self.value_names.len()
    }

    pub(crate) fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(term) = &block.term {
                for succ in term.successors() {
                    if let Some(p) = preds.get_mut(succ.0) {
                        if !p.contains(&BlockId(i)) {
                            p.push(BlockId(i));
                        }
                    }
                }
            }
        }
        preds
    }

    pub(crate) fn replace_all_uses(&mut self, from: ValueId, to: Operand) {
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                for op in inst.operands_mut() {
                    if *op == Operand::Value(from) {
                        *op = to;
                    }
                }
            }
            if let Some(op) = block.term.as_mut().and_then(Terminator::operand_mut) {
                if *op == Operand::Value(from) {
                    *op = to;
                }
            }
        }
    }

    /// Drops every block whose `keep` flag is false and renumbers the rest.
    pub(crate) fn retain_blocks(&mut self, keep: &[bool]) {
        let mut remap = vec![None; self.blocks.len()];
        let mut next = 0;
        for (i, k) in keep.iter().enumerate() {
            if *k {
                remap[i] = Some(BlockId(next));
                next += 1;
            }
        }

        let blocks = std::mem::take(&mut self.blocks);
        for (i, mut block) in blocks.into_iter().enumerate() {
            if !keep[i] {
                continue;
            }
            if let Some(term) = block.term.as_mut() {
                for target in term.targets_mut() {
                    if let Some(Some(new)) = remap.get(target.0) {
                        *target = *new;
                    }
                }
            }
            for inst in &mut block.insts {
                if let Inst::Phi { incoming, .. } = inst {
                    incoming.retain(|(_, from)| matches!(remap.get(from.0), Some(Some(_))));
                    for (_, from) in incoming.iter_mut() {
                        if let Some(Some(new)) = remap.get(from.0) {
                            *from = *new;
                        }
                    }
                }
            }
            self.blocks.push(block);
        }
    }

    pub(crate) fn block_name(&self, id: BlockId) -> String {
        match self.blocks.get(id.0) {
            Some(block) if id.0 == 0 => block.label.clone(),
            Some(block) => format!("{}{}", block.label, id.0),
            None => format!("<bad block {}>", id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
    pub(crate) body: Option<Body>,
}

impl Function {
    pub(crate) fn declaration(name: String, params: Vec<String>) -> Self {
        Function {
            name,
            params,
            body: None,
        }
    }

    pub(crate) fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub(crate) fn arity(&self) -> usize {
        self.params.len()
    }
}

/// A compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Module {
    pub(crate) name: String,
    functions: Vec<Function>,
}

impl Module {
    pub(crate) fn new(name: &str) -> Self {
        Module {
            name: name.to_owned(),
            functions: Vec::new(),
        }
    }

    pub(crate) fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub(crate) fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Adds `func`, replacing a function of the same name in place.
    pub(crate) fn add_function(&mut self, func: Function) -> &Function {
        let idx = match self.functions.iter().position(|f| f.name == func.name) {
            Some(idx) => {
                self.functions[idx] = func;
                idx
            }
            None => {
                self.functions.push(func);
                self.functions.len() - 1
            }
        };
        &self.functions[idx]
    }

    /// Forgets every function added after the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.functions.truncate(len);
    }
}

/// Appends instructions to the function under construction.
pub(crate) struct FunctionBuilder {
    name: String,
    params: Vec<String>,
    body: Body,
    current: BlockId,
}

impl FunctionBuilder {
    pub(crate) fn new(name: &str, params: &[String]) -> Self {
        FunctionBuilder {
            name: name.to_owned(),
            params: params.to_vec(),
            body: Body {
                blocks: Vec::new(),
                slots: Vec::new(),
                value_names: Vec::new(),
            },
            current: BlockId(0),
        }
    }

    pub(crate) fn append_block(&mut self, label: &str) -> BlockId {
        self.body.blocks.push(Block {
            label: label.to_owned(),
            insts: Vec::new(),
            term: None,
        });
        BlockId(self.body.blocks.len() - 1)
    }

    pub(crate) fn position_at_end(&mut self, block: BlockId) {
        self.current = block;
    }

    pub(crate) fn insert_block(&self) -> BlockId {
        self.current
    }

    /// Allocates a stack slot at the head of the entry block.
    pub(crate) fn entry_alloca(&mut self, name: &str) -> SlotId {
        let slot = SlotId(self.body.slots.len());
        self.body.slots.push(name.to_owned());
        if let Some(entry) = self.body.blocks.first_mut() {
            let at = entry
                .insts
                .iter()
                .take_while(|i| matches!(i, Inst::Alloca { .. }))
                .count();
            entry.insts.insert(at, Inst::Alloca { slot });
        }
        slot
    }

    fn fresh(&mut self, hint: &str) -> ValueId {
        self.body.value_names.push(hint.to_owned());
        ValueId(self.body.value_names.len() - 1)
    }

    fn push(&mut self, inst: Inst) {
        if let Some(block) = self.body.blocks.get_mut(self.current.0) {
            block.insts.push(inst);
        }
    }

    fn terminate(&mut self, term: Terminator) {
        if let Some(block) = self.body.blocks.get_mut(self.current.0) {
            block.term = Some(term);
        }
    }

    pub(crate) fn load(&mut self, slot: SlotId, hint: &str) -> Operand {
        let dst = self.fresh(hint);
        self.push(Inst::Load { dst, slot });
        Operand::Value(dst)
    }

    pub(crate) fn store(&mut self, slot: SlotId, src: Operand) {
        self.push(Inst::Store { slot, src });
    }

    pub(crate) fn binary(&mut self, op: BinOp, lhs: Operand, rhs: Operand, hint: &str) -> Operand {
        let dst = self.fresh(hint);
        self.push(Inst::Binary { dst, op, lhs, rhs });
        Operand::Value(dst)
    }

    pub(crate) fn compare(
        &mut self,
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
        hint: &str,
    ) -> Operand {
        let dst = self.fresh(hint);
        self.push(Inst::Compare {
            dst,
            pred,
            lhs,
            rhs,
        });
        Operand::Value(dst)
    }

    pub(crate) fn bool_to_double(&mut self, src: Operand, hint: &str) -> Operand {
        let dst = self.fresh(hint);
        self.push(Inst::BoolToDouble { dst, src });
        Operand::Value(dst)
    }

    pub(crate) fn call(&mut self, callee: &str, args: Vec<Operand>) -> Operand {
        let dst = self.fresh("calltmp");
        self.push(Inst::Call {
            dst,
            callee: callee.to_owned(),
            args,
        });
        Operand::Value(dst)
    }

    pub(crate) fn phi(&mut self, incoming: Vec<(Operand, BlockId)>, hint: &str) -> Operand {
        let dst = self.fresh(hint);
        self.push(Inst::Phi { dst, incoming });
        Operand::Value(dst)
    }

    pub(crate) fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    pub(crate) fn cond_br(&mut self, cond: Operand, then_bb: BlockId, else_bb: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_bb,
            else_bb,
        });
    }

    pub(crate) fn ret(&mut self, value: Operand) {
        self.terminate(Terminator::Ret(value));
    }

    pub(crate) fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            body: Some(self.body),
        }
    }
}

struct Printer<'a> {
    func: &'a Function,
    body: &'a Body,
}

impl<'a> Printer<'a> {
    fn operand(&self, op: &Operand) -> String {
        match op {
            Operand::Const(c) => format!("{:?}", c),
            Operand::Bool(b) => b.to_string(),
            Operand::Value(v) => self.value(*v),
            Operand::Param(i) => match self.func.params.get(*i) {
                Some(name) => format!("%{}", name),
                None => format!("%arg{}", i),
            },
        }
    }

    fn value(&self, v: ValueId) -> String {
        let hint = self.body.value_names.get(v.0).map_or("v", String::as_str);
        format!("%{}{}", hint, v.0)
    }

    fn slot(&self, s: SlotId) -> String {
        let name = self.body.slots.get(s.0).map_or("slot", String::as_str);
        format!("%{}.addr{}", name, s.0)
    }

    fn label(&self, b: BlockId) -> String {
        format!("%{}", self.body.block_name(b))
    }

    fn inst(&self, inst: &Inst) -> String {
        match inst {
            Inst::Alloca { slot } => format!("{} = alloca double", self.slot(*slot)),
            Inst::Load { dst, slot } => format!(
                "{} = load double, double* {}",
                self.value(*dst),
                self.slot(*slot)
            ),
            Inst::Store { slot, src } => format!(
                "store double {}, double* {}",
                self.operand(src),
                self.slot(*slot)
            ),
            Inst::Binary { dst, op, lhs, rhs } => {
                let name = match op {
                    BinOp::Add => "fadd",
                    BinOp::Sub => "fsub",
                    BinOp::Mul => "fmul",
                };
                format!(
                    "{} = {} double {}, {}",
                    self.value(*dst),
                    name,
                    self.operand(lhs),
                    self.operand(rhs)
                )
            }
            Inst::Compare {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let name = match pred {
                    CmpPred::Ult => "ult",
                    CmpPred::One => "one",
                };
                format!(
                    "{} = fcmp {} double {}, {}",
                    self.value(*dst),
                    name,
                    self.operand(lhs),
                    self.operand(rhs)
                )
            }
            Inst::BoolToDouble { dst, src } => format!(
                "{} = uitofp i1 {} to double",
                self.value(*dst),
                self.operand(src)
            ),
            Inst::Call { dst, callee, args } => {
                let args: Vec<String> = args
                    .iter()
                    .map(|a| format!("double {}", self.operand(a)))
                    .collect();
                format!(
                    "{} = call double @{}({})",
                    self.value(*dst),
                    callee,
                    args.join(", ")
                )
            }
            Inst::Phi { dst, incoming } => {
                let incoming: Vec<String> = incoming
                    .iter()
                    .map(|(v, b)| format!("[ {}, {} ]", self.operand(v), self.label(*b)))
                    .collect();
                format!("{} = phi double {}", self.value(*dst), incoming.join(", "))
            }
        }
    }

    fn term(&self, term: &Terminator) -> String {
        match term {
            Terminator::Br(target) => format!("br label {}", self.label(*target)),
            Terminator::CondBr {
                cond,
                then_bb,
                else_bb,
            } => format!(
                "br i1 {}, label {}, label {}",
                self.operand(cond),
                self.label(*then_bb),
                self.label(*else_bb)
            ),
            Terminator::Ret(v) => format!("ret double {}", self.operand(v)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect();
        let body = match &self.body {
            None => return writeln!(f, "declare double @{}({})", self.name, params.join(", ")),
            Some(body) => body,
        };

        writeln!(f, "define double @{}({}) {{", self.name, params.join(", "))?;
        let printer = Printer { func: self, body };
        for (i, block) in body.blocks.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", body.block_name(BlockId(i)))?;
            for inst in &block.insts {
                writeln!(f, "  {}", printer.inst(inst))?;
            }
            match &block.term {
                Some(term) => writeln!(f, "  {}", printer.term(term))?,
                None => writeln!(f, "  <no terminator>")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
