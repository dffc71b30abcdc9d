#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Unary(char, Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `for var = start, end, step in body`
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
    /// `var a = init, b in body`
    Var {
        bindings: Vec<(String, Option<Expr>)>,
        body: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ProtoKind {
    Function,
    Unary,
    Binary(i32),
}

/// Name and argument names of a function; operators get synthesized names such as `binary|`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub(crate) name: String,
    pub(crate) args: Vec<String>,
    pub(crate) kind: ProtoKind,
}

impl Prototype {
    pub(crate) fn new(name: String, args: Vec<String>) -> Self {
        Prototype {
            name,
            args,
            kind: ProtoKind::Function,
        }
    }

    pub(crate) fn operator(kind: ProtoKind, op: char, args: Vec<String>) -> Self {
        let prefix = match kind {
            ProtoKind::Unary => "unary",
            ProtoKind::Binary(_) => "binary",
            ProtoKind::Function => "",
        };
        Prototype {
            name: format!("{}{}", prefix, op),
            args,
            kind,
        }
    }

    /// The operator character and precedence, if this declares a binary operator.
    pub(crate) fn binary_operator(&self) -> Option<(char, i32)> {
        match self.kind {
            ProtoKind::Binary(precedence) => self.name.chars().last().map(|op| (op, precedence)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) proto: Prototype,
    pub(crate) body: Expr,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_operator_names() {
        let p = Prototype::operator(
            ProtoKind::Binary(5),
            '|',
            vec!["a".to_owned(), "b".to_owned()],
        );
        assert_eq!(p.name, "binary|");
        assert_eq!(p.binary_operator(), Some(('|', 5)));

        let u = Prototype::operator(ProtoKind::Unary, '!', vec!["v".to_owned()]);
        assert_eq!(u.name, "unary!");
        assert_eq!(u.binary_operator(), None);
    }
}
