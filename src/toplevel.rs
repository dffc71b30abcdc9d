use super::codegen::Compiler;
use super::engine::ExecutionEngine;
use super::error::{Error, ErrorKind};
use super::lexer::Lexer;
use super::parser::{Parser, TokenCursor, ANON_FN_NAME};
use super::token::Token;
use std::fs;
use std::io::{self, stdin, stdout, BufRead, Write};
use std::path::Path;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) prompt: String,
    /// Print every lowered function and declaration to stderr.
    pub(crate) dump_ir: bool,
    pub(crate) optimize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prompt: "ready> ".to_owned(),
            dump_ir: false,
            optimize: true,
        }
    }
}

/// What happened to one top-level item.
#[derive(Debug)]
pub(crate) enum Outcome {
    Definition(String),
    Extern(String),
    Evaluated(f64),
    Failed(Error),
}

type Tokens<'a> = TokenCursor<Lexer<'a>>;

pub(crate) struct Driver {
    config: Config,
    compiler: Compiler,
    engine: ExecutionEngine,
}

impl Driver {
    pub(crate) fn new(config: Config) -> Self {
        let compiler = Compiler::new(config.optimize);
        Driver {
            config,
            compiler,
            engine: ExecutionEngine::new(),
        }
    }

    /// Compiles and runs every top-level item in `src`, reporting each failure on stderr.
    pub(crate) fn handle_source(&mut self, src: &str) -> Vec<Outcome> {
        let mut tokens = TokenCursor::new(Lexer::new(src));
        let mut outcomes = Vec::new();
        loop {
            let outcome = match tokens.current().clone() {
                Token::Eof => break,
                Token::Kwd(';') => {
                    tokens.next();
                    continue;
                }
                Token::Def => self.handle_definition(&mut tokens),
                Token::Extern => self.handle_extern(&mut tokens),
                _ => self.handle_toplevel_expr(&mut tokens),
            };
            match &outcome {
                Outcome::Definition(name) => tracing::debug!(%name, "defined"),
                Outcome::Extern(name) => tracing::debug!(%name, "declared"),
                Outcome::Evaluated(value) => tracing::debug!(value, "evaluated"),
                Outcome::Failed(e) => {
                    tracing::debug!(kind = ?e.kind(), "item failed");
                    eprintln!("Error: {}", e);
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    fn handle_definition(&mut self, tokens: &mut Tokens) -> Outcome {
        let parsed = Parser::new(tokens, &self.compiler.ops).parse_definition();
        let f = match parsed {
            Ok(f) => f,
            Err(e) => return skip_token(tokens, e),
        };
        tracing::debug!(name = %f.proto.name, "parsed a function definition");

        let name = match self.compiler.codegen_func(f) {
            Ok(func) => {
                if self.config.dump_ir {
                    eprint!("{}", func);
                }
                func.name.clone()
            }
            Err(e) => return Outcome::Failed(e),
        };
        let module = self.compiler.take_module();
        self.engine.add_module(module);
        Outcome::Definition(name)
    }

    fn handle_extern(&mut self, tokens: &mut Tokens) -> Outcome {
        let parsed = Parser::new(tokens, &self.compiler.ops).parse_extern();
        let proto = match parsed {
            Ok(proto) => proto,
            Err(e) => return skip_token(tokens, e),
        };
        tracing::debug!(name = %proto.name, "parsed an extern");

        match self.compiler.codegen_proto(proto) {
            Ok(decl) => {
                if self.config.dump_ir {
                    eprint!("{}", decl);
                }
                Outcome::Extern(decl.name)
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    fn handle_toplevel_expr(&mut self, tokens: &mut Tokens) -> Outcome {
        let parsed = Parser::new(tokens, &self.compiler.ops).parse_toplevel_expr();
        let f = match parsed {
            Ok(f) => f,
            Err(e) => return skip_token(tokens, e),
        };
        tracing::debug!("parsed a top-level expression");

        match self.compiler.codegen_func(f) {
            Ok(func) => {
                if self.config.dump_ir {
                    eprint!("{}", func);
                }
            }
            Err(e) => return Outcome::Failed(e),
        }

        let handle = self.engine.add_module(self.compiler.take_module());
        let result = match self.engine.find_symbol(ANON_FN_NAME) {
            Some(symbol) => self.engine.call(&symbol, &[]),
            None => Err(Error::from(ErrorKind::Execution(format!(
                "unresolved symbol '{}'",
                ANON_FN_NAME
            )))),
        };
        self.engine.remove_module(handle);

        match result {
            Ok(v) => {
                println!("Evaluated to {:.6}", v);
                Outcome::Evaluated(v)
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Reads `input` line by line, holding lines back until the buffered text ends
    /// with `;` so that an item may span several lines. Whatever is left at end of
    /// input is compiled as is.
    pub(crate) fn interact<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        out: &mut W,
    ) -> io::Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        let mut pending = String::new();
        let mut line = String::new();
        loop {
            if pending.is_empty() {
                write!(out, "{}", self.config.prompt)?;
                out.flush()?;
            }
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            pending.push_str(&line);
            if pending.trim().is_empty() {
                pending.clear();
            } else if ends_item(&pending) {
                outcomes.extend(self.handle_source(&pending));
                pending.clear();
            }
        }
        if !pending.trim().is_empty() {
            outcomes.extend(self.handle_source(&pending));
        }
        Ok(outcomes)
    }
}

// resynchronize by dropping the token the parser stopped at
fn skip_token(tokens: &mut Tokens, e: Error) -> Outcome {
    tokens.next();
    Outcome::Failed(e)
}

// true when the last line, comment stripped, ends with `;`
fn ends_item(text: &str) -> bool {
    let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    let code = match last.find('#') {
        Some(at) => &last[..at],
        None => last,
    };
    code.trim_end().ends_with(';')
}

/// Runs the interactive loop on stdin until end of input.
pub(crate) fn main_loop(config: Config) -> io::Result<()> {
    let mut driver = Driver::new(config);
    let stdin = stdin();
    driver.interact(stdin.lock(), &mut stdout())?;
    if driver.config.dump_ir {
        eprint!("{}", driver.compiler.module());
    }
    Ok(())
}

/// Compiles a whole file as one token stream.
pub(crate) fn run_file(config: Config, path: &Path) -> io::Result<()> {
    let src = fs::read_to_string(path)?;
    let mut driver = Driver::new(config);
    driver.handle_source(&src);
    Ok(())
}
