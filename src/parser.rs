use super::ast::{Expr, Function, ProtoKind, Prototype};
use super::error::Error;
use super::lexer::TokenStream;
use super::precedence::OperatorTable;
use super::token::Token;

/// Name of the zero-argument function wrapping a top-level expression.
pub(crate) const ANON_FN_NAME: &str = "__anon_expr";

const DEFAULT_BINARY_PRECEDENCE: i32 = 30;

/// One token of lookahead over a `TokenStream`.
pub(crate) struct TokenCursor<S> {
    stream: S,
    current: Token,
}

impl<S: TokenStream> TokenCursor<S> {
    pub(crate) fn new(mut stream: S) -> Self {
        let current = stream.advance();
        TokenCursor { stream, current }
    }

    pub(crate) fn current(&self) -> &Token {
        &self.current
    }

    pub(crate) fn next(&mut self) -> &Token {
        self.current = self.stream.advance();
        &self.current
    }
}

/// Recursive-descent parser for one top-level item.
///
/// Binary operators are parsed by precedence climbing against `ops`, so operators
/// defined earlier in the session take part in later parses.
pub(crate) struct Parser<'a, S> {
    tokens: &'a mut TokenCursor<S>,
    ops: &'a OperatorTable,
}

impl<'a, S: TokenStream> Parser<'a, S> {
    pub(crate) fn new(tokens: &'a mut TokenCursor<S>, ops: &'a OperatorTable) -> Self {
        Parser { tokens, ops }
    }

    fn current(&self) -> &Token {
        self.tokens.current()
    }

    fn bump(&mut self) {
        self.tokens.next();
    }

    fn is_kwd(&self, c: char) -> bool {
        *self.current() == Token::Kwd(c)
    }

    fn expect_kwd(&mut self, c: char, msg: &str) -> Result<(), Error> {
        if !self.is_kwd(c) {
            return Err(Error::parse(msg));
        }
        self.bump();
        Ok(())
    }

    fn expect(&mut self, token: Token, msg: &str) -> Result<(), Error> {
        if *self.current() != token {
            return Err(Error::parse(msg));
        }
        self.bump();
        Ok(())
    }

    fn expect_ident(&mut self, msg: &str) -> Result<String, Error> {
        match self.current() {
            Token::Ident(id) => {
                let id = id.clone();
                self.bump();
                Ok(id)
            }
            _ => Err(Error::parse(msg)),
        }
    }

    // parenexpr ::= '(' expr ')'
    fn parse_paren_expr(&mut self) -> Result<Expr, Error> {
        self.bump();
        let inner = self.parse_expr()?;
        self.expect_kwd(')', "expected ')'")?;
        Ok(inner)
    }

    // identexpr ::= ident | ident '(' (expr (',' expr)*)? ')'
    fn parse_identifier_expr(&mut self, name: String) -> Result<Expr, Error> {
        self.bump();
        if !self.is_kwd('(') {
            return Ok(Expr::Variable(name));
        }
        self.bump();

        let mut args = Vec::new();
        if !self.is_kwd(')') {
            loop {
                args.push(self.parse_expr()?);
                if self.is_kwd(')') {
                    break;
                }
                self.expect_kwd(',', "expected ')' or ',' in argument list")?;
            }
        }
        self.bump();
        Ok(Expr::Call(name, args))
    }

    fn parse_if(&mut self) -> Result<Expr, Error> {
        self.bump();
        let cond = self.parse_expr()?;
        self.expect(Token::Then, "expected then")?;
        let then = self.parse_expr()?;
        self.expect(Token::Else, "expected else")?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    // forexpr ::= 'for' ident '=' expr ',' expr (',' expr)? 'in' expr
    fn parse_for(&mut self) -> Result<Expr, Error> {
        self.bump();
        let var = self.expect_ident("expected identifier after for")?;
        self.expect_kwd('=', "expected '=' after for")?;
        let start = self.parse_expr()?;
        self.expect_kwd(',', "expected ',' after for start value")?;
        let end = self.parse_expr()?;

        let step = if self.is_kwd(',') {
            self.bump();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        self.expect(Token::In, "expected 'in' after for")?;
        let body = self.parse_expr()?;
        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    // varexpr ::= 'var' ident ('=' expr)? (',' ident ('=' expr)?)* 'in' expr
    fn parse_var(&mut self) -> Result<Expr, Error> {
        self.bump();
        let mut bindings = Vec::new();
        let mut name = self.expect_ident("expected identifier after var")?;
        loop {
            let init = if self.is_kwd('=') {
                self.bump();
                Some(self.parse_expr()?)
            } else {
                None
            };
            bindings.push((name, init));

            if !self.is_kwd(',') {
                break;
            }
            self.bump();
            name = self.expect_ident("expected identifier list after var")?;
        }

        self.expect(Token::In, "expected 'in' keyword after 'var'")?;
        let body = self.parse_expr()?;
        Ok(Expr::Var {
            bindings,
            body: Box::new(body),
        })
    }

    pub(crate) fn parse_primary(&mut self) -> Result<Expr, Error> {
        match self.current() {
            Token::Number(n) => {
                let n = *n;
                self.bump();
                Ok(Expr::Number(n))
            }
            Token::Ident(id) => {
                let id = id.clone();
                self.parse_identifier_expr(id)
            }
            Token::Kwd('(') => self.parse_paren_expr(),
            Token::If => self.parse_if(),
            Token::For => self.parse_for(),
            Token::Var => self.parse_var(),
            _ => Err(Error::parse("unknown token when expecting an expression")),
        }
    }

    // unary ::= SYM unary | primary
    pub(crate) fn parse_unary(&mut self) -> Result<Expr, Error> {
        let op = match self.current().ascii_symbol() {
            Some(c) if c != '(' && c != ',' => c,
            _ => return self.parse_primary(),
        };
        self.bump();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_bin_op_rhs(&mut self, min_precedence: i32, mut lhs: Expr) -> Result<Expr, Error> {
        loop {
            let precedence = self.ops.token_precedence(self.current());
            if precedence < min_precedence {
                return Ok(lhs);
            }
            let op = match self.current().ascii_symbol() {
                Some(op) => op,
                None => return Ok(lhs),
            };
            self.bump();

            let mut rhs = self.parse_unary()?;
            if precedence < self.ops.token_precedence(self.current()) {
                rhs = self.parse_bin_op_rhs(precedence + 1, rhs)?;
            }
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, Error> {
        let lhs = self.parse_unary()?;
        self.parse_bin_op_rhs(0, lhs)
    }

    fn operator_symbol(&mut self, msg: &str) -> Result<char, Error> {
        let op = self.current().ascii_symbol().ok_or_else(|| Error::parse(msg))?;
        self.bump();
        Ok(op)
    }

    // prototype ::= ident '(' ident* ')'
    //             | 'unary' SYM '(' ident ')'
    //             | 'binary' SYM NUMBER? '(' ident ident ')'
    pub(crate) fn parse_prototype(&mut self) -> Result<Prototype, Error> {
        let (name, op, kind) = match self.current() {
            Token::Ident(id) => {
                let id = id.clone();
                self.bump();
                (id, None, ProtoKind::Function)
            }
            Token::Unary => {
                self.bump();
                let op = self.operator_symbol("expected unary operator")?;
                (String::new(), Some(op), ProtoKind::Unary)
            }
            Token::Binary => {
                self.bump();
                let op = self.operator_symbol("expected binary operator")?;
                let mut precedence = DEFAULT_BINARY_PRECEDENCE;
                if let Token::Number(n) = *self.current() {
                    if n < 1.0 || n > 100.0 {
                        return Err(Error::parse("invalid precedence: must be 1..100"));
                    }
                    precedence = n as i32;
                    self.bump();
                }
                (String::new(), Some(op), ProtoKind::Binary(precedence))
            }
            _ => return Err(Error::parse("expected function name in prototype")),
        };

        if !self.is_kwd('(') {
            return Err(Error::parse("expected '(' in prototype"));
        }
        let mut args = Vec::new();
        while let Token::Ident(arg) = self.tokens.next() {
            args.push(arg.clone());
        }
        self.expect_kwd(')', "expected ')' in prototype")?;

        let arity = match kind {
            ProtoKind::Function => None,
            ProtoKind::Unary => Some(1),
            ProtoKind::Binary(_) => Some(2),
        };
        if arity.map_or(false, |n| n != args.len()) {
            return Err(Error::parse("invalid number of operands for operator"));
        }

        Ok(match op {
            Some(op) => Prototype::operator(kind, op, args),
            None => Prototype::new(name, args),
        })
    }

    // definition ::= 'def' prototype expr
    pub(crate) fn parse_definition(&mut self) -> Result<Function, Error> {
        self.bump();
        let proto = self.parse_prototype()?;
        let body = self.parse_expr()?;
        Ok(Function { proto, body })
    }

    // external ::= 'extern' prototype
    pub(crate) fn parse_extern(&mut self) -> Result<Prototype, Error> {
        self.bump();
        self.parse_prototype()
    }

    pub(crate) fn parse_toplevel_expr(&mut self) -> Result<Function, Error> {
        let body = self.parse_expr()?;
        Ok(Function {
            proto: Prototype::new(ANON_FN_NAME.to_owned(), vec![]),
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use super::super::error::ErrorKind;
    use super::super::lexer::Lexer;
    use super::*;

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Number(n))
    }

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Variable(name.to_owned()))
    }

    fn expr_with(src: &str, ops: &OperatorTable) -> Result<Expr, Error> {
        let mut cursor = TokenCursor::new(Lexer::new(src));
        Parser::new(&mut cursor, ops).parse_expr()
    }

    fn expr(src: &str) -> Result<Expr, Error> {
        expr_with(src, &OperatorTable::with_builtins())
    }

    fn proto(src: &str) -> Result<Prototype, Error> {
        let ops = OperatorTable::with_builtins();
        let mut cursor = TokenCursor::new(Lexer::new(src));
        Parser::new(&mut cursor, &ops).parse_prototype()
    }

    fn parse_error(msg: &str) -> ErrorKind {
        ErrorKind::Parse(msg.to_owned())
    }

    #[test]
    fn test_primary() {
        assert_eq!(expr("1.0").unwrap(), Expr::Number(1.0));
        assert_eq!(expr("y").unwrap(), Expr::Variable("y".to_owned()));
        assert_eq!(expr("(y)").unwrap(), Expr::Variable("y".to_owned()));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            expr("1+2*3").unwrap(),
            Expr::Binary('+', num(1.0), Box::new(Expr::Binary('*', num(2.0), num(3.0))))
        );
        assert_eq!(
            expr("1*2+3").unwrap(),
            Expr::Binary('+', Box::new(Expr::Binary('*', num(1.0), num(2.0))), num(3.0))
        );
        assert_eq!(
            expr("(1+2)*3").unwrap(),
            Expr::Binary('*', Box::new(Expr::Binary('+', num(1.0), num(2.0))), num(3.0))
        );
    }

    #[test]
    fn test_left_associative() {
        assert_eq!(
            expr("1-2-3").unwrap(),
            Expr::Binary('-', Box::new(Expr::Binary('-', num(1.0), num(2.0))), num(3.0))
        );
        assert_eq!(
            expr("1+2*3-4").unwrap(),
            Expr::Binary(
                '-',
                Box::new(Expr::Binary(
                    '+',
                    num(1.0),
                    Box::new(Expr::Binary('*', num(2.0), num(3.0)))
                )),
                num(4.0)
            )
        );
    }

    #[test]
    fn test_user_defined_precedence() {
        let mut ops = OperatorTable::with_builtins();
        ops.install('|', 5);
        // '<' binds tighter than '|'
        assert_eq!(
            expr_with("a | b < c", &ops).unwrap(),
            Expr::Binary('|', var("a"), Box::new(Expr::Binary('<', var("b"), var("c"))))
        );
        // an unregistered symbol ends the expression
        assert_eq!(expr("a | b").unwrap(), Expr::Variable("a".to_owned()));
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            expr("!-x").unwrap(),
            Expr::Unary('!', Box::new(Expr::Unary('-', var("x"))))
        );
        assert_eq!(
            expr("-x*2").unwrap(),
            Expr::Binary('*', Box::new(Expr::Unary('-', var("x"))), num(2.0))
        );
    }

    #[test]
    fn test_call() {
        assert_eq!(
            expr("foo(y, 4.0)").unwrap(),
            Expr::Call(
                "foo".to_owned(),
                vec![Expr::Variable("y".to_owned()), Expr::Number(4.0)]
            )
        );
        assert_eq!(expr("foo()").unwrap(), Expr::Call("foo".to_owned(), vec![]));
        assert_eq!(
            expr("foo(1,)").unwrap_err().kind(),
            &parse_error("unknown token when expecting an expression")
        );
        assert_eq!(
            expr("foo(1 2)").unwrap_err().kind(),
            &parse_error("expected ')' or ',' in argument list")
        );
    }

    #[test]
    fn test_if() {
        assert_eq!(
            expr("if x < 3 then 1 else 2").unwrap(),
            Expr::If(
                Box::new(Expr::Binary('<', var("x"), num(3.0))),
                num(1.0),
                num(2.0)
            )
        );
        assert_eq!(
            expr("if x 1 else 2").unwrap_err().kind(),
            &parse_error("expected then")
        );
        assert_eq!(
            expr("if x then 1").unwrap_err().kind(),
            &parse_error("expected else")
        );
    }

    #[test]
    fn test_for() {
        assert_eq!(
            expr("for i=1, 3 in 3").unwrap(),
            Expr::For {
                var: "i".to_owned(),
                start: num(1.0),
                end: num(3.0),
                step: None,
                body: num(3.0),
            }
        );
        assert_eq!(
            expr("for i=1, 3,2 in 3").unwrap(),
            Expr::For {
                var: "i".to_owned(),
                start: num(1.0),
                end: num(3.0),
                step: Some(num(2.0)),
                body: num(3.0),
            }
        );
        assert_eq!(
            expr("for 1 = 1, 3 in 3").unwrap_err().kind(),
            &parse_error("expected identifier after for")
        );
        assert_eq!(
            expr("for i = 1, 3 3").unwrap_err().kind(),
            &parse_error("expected 'in' after for")
        );
    }

    #[test]
    fn test_var() {
        assert_eq!(
            expr("var a = 1, b in a + b").unwrap(),
            Expr::Var {
                bindings: vec![
                    ("a".to_owned(), Some(Expr::Number(1.0))),
                    ("b".to_owned(), None)
                ],
                body: Box::new(Expr::Binary('+', var("a"), var("b"))),
            }
        );
        assert_eq!(
            expr("var in 1").unwrap_err().kind(),
            &parse_error("expected identifier after var")
        );
        assert_eq!(
            expr("var a, in 1").unwrap_err().kind(),
            &parse_error("expected identifier list after var")
        );
        assert_eq!(
            expr("var a = 1 a").unwrap_err().kind(),
            &parse_error("expected 'in' keyword after 'var'")
        );
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(
            expr("then").unwrap_err().kind(),
            &parse_error("unknown token when expecting an expression")
        );
        assert_eq!(
            expr("(1").unwrap_err().kind(),
            &parse_error("expected ')'")
        );
    }

    #[test]
    fn test_prototype() {
        assert_eq!(proto("f()").unwrap(), Prototype::new("f".to_owned(), vec![]));
        assert_eq!(
            proto("f(a b)").unwrap(),
            Prototype::new("f".to_owned(), vec!["a".to_owned(), "b".to_owned()])
        );
        assert_eq!(
            proto("binary| 5 (a b)").unwrap(),
            Prototype {
                name: "binary|".to_owned(),
                args: vec!["a".to_owned(), "b".to_owned()],
                kind: ProtoKind::Binary(5),
            }
        );
        assert_eq!(proto("binary| 1 (a b)").unwrap().kind, ProtoKind::Binary(1));
        assert_eq!(
            proto("binary| 100 (a b)").unwrap().kind,
            ProtoKind::Binary(100)
        );
        assert_eq!(
            proto("binary& (a b)").unwrap().kind,
            ProtoKind::Binary(DEFAULT_BINARY_PRECEDENCE)
        );
        assert_eq!(
            proto("unary!(v)").unwrap(),
            Prototype {
                name: "unary!".to_owned(),
                args: vec!["v".to_owned()],
                kind: ProtoKind::Unary,
            }
        );
    }

    #[test]
    fn test_prototype_errors() {
        assert_eq!(
            proto("binary| 0 (a b)").unwrap_err().kind(),
            &parse_error("invalid precedence: must be 1..100")
        );
        assert_eq!(
            proto("binary| 101 (a b)").unwrap_err().kind(),
            &parse_error("invalid precedence: must be 1..100")
        );
        assert_eq!(
            proto("binary| (a)").unwrap_err().kind(),
            &parse_error("invalid number of operands for operator")
        );
        assert_eq!(
            proto("unary!(a b)").unwrap_err().kind(),
            &parse_error("invalid number of operands for operator")
        );
        assert_eq!(
            proto("f(a, b)").unwrap_err().kind(),
            &parse_error("expected ')' in prototype")
        );
        assert_eq!(
            proto("f a").unwrap_err().kind(),
            &parse_error("expected '(' in prototype")
        );
        assert_eq!(
            proto("1(a)").unwrap_err().kind(),
            &parse_error("expected function name in prototype")
        );
    }

    #[test]
    fn test_toplevel() {
        let ops = OperatorTable::with_builtins();
        let mut cursor = TokenCursor::new(Lexer::new("4+5"));
        let f = Parser::new(&mut cursor, &ops).parse_toplevel_expr().unwrap();
        assert_eq!(f.proto, Prototype::new(ANON_FN_NAME.to_owned(), vec![]));
        assert_eq!(f.body, Expr::Binary('+', num(4.0), num(5.0)));
        assert_eq!(*cursor.current(), Token::Eof);
    }

    #[test]
    fn test_definition_and_extern() {
        let ops = OperatorTable::with_builtins();
        let mut cursor = TokenCursor::new(Lexer::new("def foo(x) x*2 extern sin(a)"));
        let f = Parser::new(&mut cursor, &ops).parse_definition().unwrap();
        assert_eq!(f.proto, Prototype::new("foo".to_owned(), vec!["x".to_owned()]));
        assert_eq!(f.body, Expr::Binary('*', var("x"), num(2.0)));
        assert_eq!(*cursor.current(), Token::Extern);

        let p = Parser::new(&mut cursor, &ops).parse_extern().unwrap();
        assert_eq!(p, Prototype::new("sin".to_owned(), vec!["a".to_owned()]));
    }
}
