use super::ast::{Expr, Function, Prototype};
use super::error::{Error, ErrorKind};
use super::ir::{self, BinOp, CmpPred, FunctionBuilder, Module, Operand};
use super::parser::ANON_FN_NAME;
use super::passes::PassManager;
use super::precedence::OperatorTable;
use super::scope::ScopeMap;
use super::verify::verify_function;
use std::collections::{HashMap, HashSet};

const MODULE_NAME: &str = "my cool jit";

/// A compiler session: the operator table, the prototype registry, the scope map of
/// the function being lowered and the unit under construction.
///
/// Sessions share nothing, so two of them lowering the same text produce the same unit.
pub(crate) struct Compiler {
    pub(crate) ops: OperatorTable,
    protos: HashMap<String, Prototype>,
    module: Module,
    scope: ScopeMap,
    // functions with a body in units already handed to the engine
    emitted: HashSet<String>,
    passes: Option<PassManager>,
}

impl Compiler {
    pub(crate) fn new(optimize: bool) -> Self {
        Compiler {
            ops: OperatorTable::with_builtins(),
            protos: HashMap::new(),
            module: Module::new(MODULE_NAME),
            scope: ScopeMap::new(),
            emitted: HashSet::new(),
            passes: if optimize {
                Some(PassManager::standard())
            } else {
                None
            },
        }
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }

    /// Hands off the current unit and starts an empty one.
    pub(crate) fn take_module(&mut self) -> Module {
        let module = std::mem::replace(&mut self.module, Module::new(MODULE_NAME));
        for func in module.functions() {
            if !func.is_declaration() && func.name != ANON_FN_NAME {
                self.emitted.insert(func.name.clone());
            }
        }
        tracing::debug!(functions = module.functions().len(), "unit handed off");
        module
    }

    fn is_defined(&self, name: &str) -> bool {
        let in_unit = self
            .module
            .get_function(name)
            .map_or(false, |f| !f.is_declaration());
        in_unit || self.emitted.contains(name)
    }

    /// Arity of `name` in the current unit, declaring it from the registry if needed.
    fn resolve_function(&mut self, name: &str) -> Option<usize> {
        if let Some(func) = self.module.get_function(name) {
            return Some(func.arity());
        }
        let proto = self.protos.get(name)?;
        let decl = ir::Function::declaration(proto.name.clone(), proto.args.clone());
        Some(self.module.add_function(decl).arity())
    }

    /// Declares an external function and records its prototype.
    pub(crate) fn codegen_proto(&mut self, proto: Prototype) -> Result<ir::Function, Error> {
        let decl = ir::Function::declaration(proto.name.clone(), proto.args.clone());
        match self.module.get_function(&proto.name).map(ir::Function::arity) {
            Some(arity) if arity != decl.arity() => {
                return Err(Error::from(ErrorKind::ConflictingDeclaration(proto.name)));
            }
            Some(_) => {}
            None => {
                self.module.add_function(decl.clone());
            }
        }
        tracing::debug!(name = %proto.name, "declared");
        self.protos.insert(proto.name.clone(), proto);
        Ok(decl)
    }

    /// Lowers a function definition into the current unit.
    ///
    /// On failure the unit, the registry and the operator table are left as they were.
    pub(crate) fn codegen_func(&mut self, f: Function) -> Result<&ir::Function, Error> {
        let name = f.proto.name.clone();
        if self.is_defined(&name) {
            return Err(Error::from(ErrorKind::Redefinition(name)));
        }

        let operator = f.proto.binary_operator();
        let previous = self.protos.insert(name.clone(), f.proto.clone());
        let unit_len = self.module.functions().len();

        match self.define(f) {
            Ok(func) => {
                if let Some((op, precedence)) = operator {
                    self.ops.install(op, precedence);
                }
                tracing::debug!(name = %name, "defined");
                Ok(self.module.add_function(func))
            }
            Err(e) => {
                self.module.truncate(unit_len);
                match previous {
                    Some(proto) => self.protos.insert(name, proto),
                    None => self.protos.remove(&name),
                };
                Err(e)
            }
        }
    }

    fn define(&mut self, f: Function) -> Result<ir::Function, Error> {
        let Function { proto, body } = f;
        match self.resolve_function(&proto.name) {
            Some(arity) if arity != proto.args.len() => {
                return Err(Error::from(ErrorKind::ConflictingDeclaration(proto.name)));
            }
            _ => {}
        }

        let mut b = FunctionBuilder::new(&proto.name, &proto.args);
        let entry = b.append_block("entry");
        b.position_at_end(entry);

        self.scope.clear();
        for (i, arg) in proto.args.iter().enumerate() {
            let slot = b.entry_alloca(arg);
            b.store(slot, Operand::Param(i));
            self.scope.bind(arg, slot);
        }
        let ret = self.codegen_expr(&mut b, body);
        self.scope.clear();
        b.ret(ret?);

        let mut func = b.finish();
        verify_function(&self.module, &func)?;
        if let Some(passes) = &self.passes {
            passes.run(&mut func);
        }
        Ok(func)
    }

    /// Runs `f` and then drops every binding it made, whether it failed or not.
    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let mark = self.scope.mark();
        let result = f(self);
        self.scope.unwind(mark);
        result
    }

    fn call_operator(
        &mut self,
        b: &mut FunctionBuilder,
        name: String,
        args: Vec<Operand>,
    ) -> Result<Operand, Error> {
        match self.resolve_function(&name) {
            None => Err(Error::from(ErrorKind::UnknownOperator(name))),
            Some(arity) if arity != args.len() => Err(Error::from(ErrorKind::ArgumentCount {
                name,
                expected: arity,
                found: args.len(),
            })),
            Some(_) => Ok(b.call(&name, args)),
        }
    }

    fn codegen_expr(&mut self, b: &mut FunctionBuilder, e: Expr) -> Result<Operand, Error> {
        match e {
            Expr::Number(n) => Ok(Operand::Const(n)),
            Expr::Variable(name) => match self.scope.lookup(&name) {
                Some(slot) => Ok(b.load(slot, &name)),
                None => Err(Error::from(ErrorKind::UnknownVariable(name))),
            },
            Expr::Unary(op, operand) => {
                let v = self.codegen_expr(b, *operand)?;
                self.call_operator(b, format!("unary{}", op), vec![v])
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.codegen_expr(b, *lhs)?;
                let r = self.codegen_expr(b, *rhs)?;
                match op {
                    '+' => Ok(b.binary(BinOp::Add, l, r, "addtmp")),
                    '-' => Ok(b.binary(BinOp::Sub, l, r, "subtmp")),
                    '*' => Ok(b.binary(BinOp::Mul, l, r, "multmp")),
                    '<' => {
                        let cmp = b.compare(CmpPred::Ult, l, r, "cmptmp");
                        Ok(b.bool_to_double(cmp, "booltmp"))
                    }
                    _ => self.call_operator(b, format!("binary{}", op), vec![l, r]),
                }
            }
            Expr::Call(callee, args) => {
                let arity = self
                    .resolve_function(&callee)
                    .ok_or_else(|| Error::from(ErrorKind::UnknownFunction(callee.clone())))?;
                if arity != args.len() {
                    return Err(Error::from(ErrorKind::ArgumentCount {
                        name: callee,
                        expected: arity,
                        found: args.len(),
                    }));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.codegen_expr(b, arg)?);
                }
                Ok(b.call(&callee, values))
            }
            Expr::If(cond, then, otherwise) => {
                let cond = self.codegen_expr(b, *cond)?;
                let cond = b.compare(CmpPred::One, cond, Operand::Const(0.0), "ifcond");

                let then_bb = b.append_block("then");
                let else_bb = b.append_block("else");
                let merge_bb = b.append_block("ifcont");
                b.cond_br(cond, then_bb, else_bb);

                b.position_at_end(then_bb);
                let then_v = self.codegen_expr(b, *then)?;
                b.br(merge_bb);
                // lowering the arm may have moved us to another block
                let then_end = b.insert_block();

                b.position_at_end(else_bb);
                let else_v = self.codegen_expr(b, *otherwise)?;
                b.br(merge_bb);
                let else_end = b.insert_block();

                b.position_at_end(merge_bb);
                Ok(b.phi(vec![(then_v, then_end), (else_v, else_end)], "iftmp"))
            }
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let slot = b.entry_alloca(&var);
                let start = self.codegen_expr(b, *start)?;
                b.store(slot, start);

                let loop_bb = b.append_block("loop");
                b.br(loop_bb);
                b.position_at_end(loop_bb);

                self.scoped(|this| {
                    this.scope.bind(&var, slot);
                    this.codegen_expr(b, *body)?;

                    let step = match step {
                        Some(step) => this.codegen_expr(b, *step)?,
                        None => Operand::Const(1.0),
                    };
                    let current = b.load(slot, &var);
                    let next = b.binary(BinOp::Add, current, step, "nextvar");
                    b.store(slot, next);

                    let end = this.codegen_expr(b, *end)?;
                    let end = b.compare(CmpPred::One, end, Operand::Const(0.0), "loopcond");
                    let after_bb = b.append_block("afterloop");
                    b.cond_br(end, loop_bb, after_bb);
                    b.position_at_end(after_bb);
                    Ok(())
                })?;
                Ok(Operand::Const(0.0))
            }
            Expr::Var { bindings, body } => self.scoped(|this| {
                for (name, init) in bindings {
                    // the initializer does not see its own binding
                    let init = match init {
                        Some(init) => Some(this.codegen_expr(b, init)?),
                        None => None,
                    };
                    let slot = b.entry_alloca(&name);
                    if let Some(v) = init {
                        b.store(slot, v);
                    }
                    this.scope.bind(&name, slot);
                }
                this.codegen_expr(b, *body)
            }),
        }
    }
}
