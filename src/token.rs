#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Binary,
    Unary,
    Var,
    Ident(String),
    Number(f64),
    Kwd(char),
    Eof,
}

impl Token {
    /// The operator character carried by this token, if it is a plain ASCII symbol.
    pub(crate) fn ascii_symbol(&self) -> Option<char> {
        match self {
            Token::Kwd(c) if c.is_ascii() => Some(*c),
            _ => None,
        }
    }
}
