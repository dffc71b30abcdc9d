//! Execution engine: owns handed-off units, resolves symbols by name and runs
//! functions by walking their IR.

use super::error::{Error, ErrorKind};
use super::ir::{BlockId, Body, Function, Inst, Module, Operand, Terminator};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

/// Nested calls allowed before a call fails with an execution error.
///
/// Every level of Kaleidoscope recursion costs three native frames (`invoke`,
/// `Frame::run`, `Frame::step`). 1024 levels fit the 8 MiB stack of the main
/// thread but not the 2 MiB default of spawned threads, so an engine driven from
/// a thread with a smaller stack must lower `max_depth` to match.
const MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ModuleHandle(usize);

/// A callable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Symbol {
    Compiled { module: usize, function: usize },
    Native(String),
}

struct Native {
    arity: usize,
    f: Rc<dyn Fn(&[f64]) -> f64>,
}

pub(crate) struct ExecutionEngine {
    modules: Vec<Option<Module>>,
    natives: HashMap<String, Native>,
    max_depth: usize,
}

fn failure(msg: String) -> Error {
    Error::from(ErrorKind::Execution(msg))
}

// unbuffered single byte, retried on EINTR
fn write_byte(fd: libc::c_int, byte: u8) -> io::Result<()> {
    loop {
        let written = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        match written {
            1 => return Ok(()),
            0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote no bytes")),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

fn putchard(args: &[f64]) -> f64 {
    let byte = args.first().copied().unwrap_or(0.0) as u8;
    if let Err(e) = write_byte(libc::STDERR_FILENO, byte) {
        tracing::warn!(error = %e, byte, "putchard failed to write");
    }
    0.0
}

fn printd(args: &[f64]) -> f64 {
    eprintln!("{:.6}", args.first().copied().unwrap_or(0.0));
    0.0
}

impl ExecutionEngine {
    /// An engine with the `putchard` and `printd` builtins.
    pub(crate) fn new() -> Self {
        let mut engine = ExecutionEngine {
            modules: Vec::new(),
            natives: HashMap::new(),
            max_depth: MAX_CALL_DEPTH,
        };
        engine.register_native("putchard", 1, putchard);
        engine.register_native("printd", 1, printd);
        engine
    }

    pub(crate) fn register_native<F>(&mut self, name: &str, arity: usize, f: F)
    where
        F: Fn(&[f64]) -> f64 + 'static,
    {
        self.natives.insert(
            name.to_owned(),
            Native {
                arity,
                f: Rc::new(f),
            },
        );
    }

    pub(crate) fn add_module(&mut self, module: Module) -> ModuleHandle {
        tracing::debug!(functions = module.functions().len(), "module added");
        self.modules.push(Some(module));
        ModuleHandle(self.modules.len() - 1)
    }

    pub(crate) fn remove_module(&mut self, handle: ModuleHandle) -> Option<Module> {
        self.modules.get_mut(handle.0).and_then(Option::take)
    }

    /// Looks `name` up among compiled bodies, latest unit first, then among natives.
    pub(crate) fn find_symbol(&self, name: &str) -> Option<Symbol> {
        for (m, module) in self.modules.iter().enumerate().rev() {
            let module = match module {
                Some(module) => module,
                None => continue,
            };
            let found = module
                .functions()
                .iter()
                .position(|f| f.name == name && !f.is_declaration());
            if let Some(function) = found {
                return Some(Symbol::Compiled {
                    module: m,
                    function,
                });
            }
        }
        if self.natives.contains_key(name) {
            return Some(Symbol::Native(name.to_owned()));
        }
        None
    }

    pub(crate) fn call(&self, symbol: &Symbol, args: &[f64]) -> Result<f64, Error> {
        self.invoke(symbol, args, 0)
    }

    fn function(&self, module: usize, function: usize) -> Option<&Function> {
        self.modules
            .get(module)
            .and_then(Option::as_ref)
            .and_then(|m| m.functions().get(function))
    }

    fn invoke(&self, symbol: &Symbol, args: &[f64], depth: usize) -> Result<f64, Error> {
        if depth >= self.max_depth {
            return Err(failure(format!("call depth exceeded {}", self.max_depth)));
        }
        match symbol {
            Symbol::Native(name) => {
                let native = self
                    .natives
                    .get(name)
                    .ok_or_else(|| failure(format!("unresolved symbol '{}'", name)))?;
                if native.arity != args.len() {
                    return Err(failure(format!("'{}' takes {} arguments", name, native.arity)));
                }
                Ok((native.f)(args))
            }
            Symbol::Compiled { module, function } => {
                let func = self
                    .function(*module, *function)
                    .ok_or_else(|| failure("call into a removed module".to_owned()))?;
                let body = match &func.body {
                    Some(body) if func.arity() == args.len() => body,
                    Some(_) => {
                        return Err(failure(format!(
                            "'{}' takes {} arguments",
                            func.name,
                            func.arity()
                        )))
                    }
                    None => return Err(failure(format!("'{}' has no body", func.name))),
                };
                Frame::new(self, body, args, depth).run()
            }
        }
    }
}

/// One activation of a compiled function.
struct Frame<'a> {
    engine: &'a ExecutionEngine,
    body: &'a Body,
    args: &'a [f64],
    depth: usize,
    values: Vec<f64>,
    slots: Vec<f64>,
}

impl<'a> Frame<'a> {
    fn new(engine: &'a ExecutionEngine, body: &'a Body, args: &'a [f64], depth: usize) -> Self {
        Frame {
            engine,
            body,
            args,
            depth,
            values: vec![0.0; body.value_count()],
            slots: vec![0.0; body.slots.len()],
        }
    }

    // bools are carried as 1.0 and 0.0
    fn operand(&self, op: &Operand) -> f64 {
        match *op {
            Operand::Const(c) => c,
            Operand::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Operand::Value(v) => self.values[v.0],
            Operand::Param(i) => self.args[i],
        }
    }

    fn run(mut self) -> Result<f64, Error> {
        let body = self.body;
        let mut current = BlockId(0);
        let mut previous: Option<BlockId> = None;
        loop {
            let block = body
                .blocks
                .get(current.0)
                .ok_or_else(|| failure(format!("jump to missing block {}", current.0)))?;

            // phis read the values live on entry, so evaluate them together
            let mut joined = Vec::new();
            for inst in block.insts.iter().take_while(|i| i.is_phi()) {
                if let Inst::Phi { dst, incoming } = inst {
                    let value = previous
                        .and_then(|p| incoming.iter().find(|(_, from)| *from == p))
                        .map(|(v, _)| self.operand(v))
                        .ok_or_else(|| failure("phi without a matching edge".to_owned()))?;
                    joined.push((*dst, value));
                }
            }
            for (dst, value) in joined {
                self.values[dst.0] = value;
            }

            for inst in block.insts.iter().skip_while(|i| i.is_phi()) {
                self.step(inst)?;
            }

            match &block.term {
                Some(Terminator::Br(target)) => {
                    previous = Some(current);
                    current = *target;
                }
                Some(Terminator::CondBr {
                    cond,
                    then_bb,
                    else_bb,
                }) => {
                    previous = Some(current);
                    current = if self.operand(cond) != 0.0 {
                        *then_bb
                    } else {
                        *else_bb
                    };
                }
                Some(Terminator::Ret(v)) => return Ok(self.operand(v)),
                None => return Err(failure(format!("block {} falls off its end", block.label))),
            }
        }
    }

    fn step(&mut self, inst: &Inst) -> Result<(), Error> {
        match inst {
            Inst::Alloca { .. } | Inst::Phi { .. } => {}
            Inst::Load { dst, slot } => self.values[dst.0] = self.slots[slot.0],
            Inst::Store { slot, src } => self.slots[slot.0] = self.operand(src),
            Inst::Binary { dst, op, lhs, rhs } => {
                self.values[dst.0] = op.apply(self.operand(lhs), self.operand(rhs));
            }
            Inst::Compare {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let holds = pred.apply(self.operand(lhs), self.operand(rhs));
                self.values[dst.0] = if holds { 1.0 } else { 0.0 };
            }
            Inst::BoolToDouble { dst, src } => self.values[dst.0] = self.operand(src),
            Inst::Call { dst, callee, args } => {
                let args: Vec<f64> = args.iter().map(|a| self.operand(a)).collect();
                let symbol = self
                    .engine
                    .find_symbol(callee)
                    .ok_or_else(|| failure(format!("unresolved symbol '{}'", callee)))?;
                self.values[dst.0] = self.engine.invoke(&symbol, &args, self.depth + 1)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::ir::{BinOp, CmpPred, FunctionBuilder};
    use super::*;
    use std::cell::Cell;

    fn module_of(funcs: Vec<Function>) -> Module {
        let mut m = Module::new("test");
        for f in funcs {
            m.add_function(f);
        }
        m
    }

    // def fact(n) if n < 2 then 1 else n * fact(n - 1)
    fn fact() -> Function {
        let mut b = FunctionBuilder::new("fact", &["n".to_owned()]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let lt = b.compare(CmpPred::Ult, Operand::Param(0), Operand::Const(2.0), "cmptmp");
        let base = b.append_block("then");
        let rec = b.append_block("else");
        let merge = b.append_block("ifcont");
        b.cond_br(lt, base, rec);
        b.position_at_end(base);
        b.br(merge);
        b.position_at_end(rec);
        let m1 = b.binary(BinOp::Sub, Operand::Param(0), Operand::Const(1.0), "subtmp");
        let r = b.call("fact", vec![m1]);
        let prod = b.binary(BinOp::Mul, Operand::Param(0), r, "multmp");
        b.br(merge);
        b.position_at_end(merge);
        let v = b.phi(vec![(Operand::Const(1.0), base), (prod, rec)], "iftmp");
        b.ret(v);
        b.finish()
    }

    #[test]
    fn test_recursive_call() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(module_of(vec![fact()]));
        let sym = engine.find_symbol("fact").unwrap();
        assert_eq!(engine.call(&sym, &[5.0]).unwrap(), 120.0);
    }

    #[test]
    fn test_latest_module_wins_and_removal() {
        let mut engine = ExecutionEngine::new();
        let constant = |name: &str, v: f64| {
            let mut b = FunctionBuilder::new(name, &[]);
            let entry = b.append_block("entry");
            b.position_at_end(entry);
            b.ret(Operand::Const(v));
            b.finish()
        };
        engine.add_module(module_of(vec![constant("k", 1.0)]));
        let second = engine.add_module(module_of(vec![constant("k", 2.0)]));
        let sym = engine.find_symbol("k").unwrap();
        assert_eq!(engine.call(&sym, &[]).unwrap(), 2.0);

        assert!(engine.remove_module(second).is_some());
        assert!(engine.remove_module(second).is_none());
        let sym = engine.find_symbol("k").unwrap();
        assert_eq!(engine.call(&sym, &[]).unwrap(), 1.0);
        assert!(engine.find_symbol("missing").is_none());
    }

    #[test]
    fn test_native_calls_and_slots() {
        let mut engine = ExecutionEngine::new();
        let seen = Rc::new(Cell::new(0.0));
        let sink = seen.clone();
        engine.register_native("record", 1, move |args| {
            sink.set(sink.get() + args[0]);
            0.0
        });

        // var x in record(x); x = 4 in record(x)
        let mut b = FunctionBuilder::new("run", &[]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let slot = b.entry_alloca("x");
        let x = b.load(slot, "x");
        b.call("record", vec![x]);
        b.store(slot, Operand::Const(4.0));
        let x = b.load(slot, "x");
        b.call("record", vec![x]);
        b.ret(Operand::Const(0.0));
        engine.add_module(module_of(vec![
            Function::declaration("record".to_owned(), vec!["v".to_owned()]),
            b.finish(),
        ]));

        let sym = engine.find_symbol("run").unwrap();
        assert_eq!(engine.call(&sym, &[]).unwrap(), 0.0);
        assert_eq!(seen.get(), 4.0);
    }

    #[test]
    fn test_errors_are_reported() {
        let mut engine = ExecutionEngine::new();
        let sym = engine.find_symbol("putchard").unwrap();
        let err = engine.call(&sym, &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Execution(_)));

        let mut b = FunctionBuilder::new("forever", &[]);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let v = b.call("forever", vec![]);
        b.ret(v);
        engine.add_module(module_of(vec![b.finish()]));
        engine.max_depth = 16;
        let sym = engine.find_symbol("forever").unwrap();
        let err = engine.call(&sym, &[]).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Execution("call depth exceeded 16".to_owned())
        );
    }

    #[test]
    fn test_write_byte_reports_failure() {
        assert!(write_byte(libc::STDERR_FILENO, b'\n').is_ok());
        let err = write_byte(-1, b'x').unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_default_depth_cap_is_reported() {
        // test threads get 2 MiB, below what the default cap assumes
        let run = std::thread::Builder::new()
            .stack_size(16 << 20)
            .spawn(|| {
                let mut engine = ExecutionEngine::new();
                let mut b = FunctionBuilder::new("forever", &[]);
                let entry = b.append_block("entry");
                b.position_at_end(entry);
                let v = b.call("forever", vec![]);
                b.ret(v);
                engine.add_module(module_of(vec![b.finish()]));
                let sym = engine.find_symbol("forever").unwrap();
                engine.call(&sym, &[]).unwrap_err().kind().clone()
            })
            .unwrap();
        assert_eq!(
            run.join().unwrap(),
            ErrorKind::Execution(format!("call depth exceeded {}", MAX_CALL_DEPTH))
        );
    }
}
