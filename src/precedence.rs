use super::token::Token;
use std::collections::HashMap;

/// Binary operator precedences. 1 is the lowest; anything `<= 0` is not an infix operator.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OperatorTable {
    precedence: HashMap<char, i32>,
}

impl OperatorTable {
    pub(crate) fn empty() -> Self {
        OperatorTable {
            precedence: HashMap::new(),
        }
    }

    /// The standard operators: `<` 10, `+` 20, `-` 20, `*` 40.
    pub(crate) fn with_builtins() -> Self {
        let mut table = OperatorTable::empty();
        table.install('<', 10);
        table.install('+', 20);
        table.install('-', 20);
        table.install('*', 40);
        table
    }

    pub(crate) fn install(&mut self, op: char, precedence: i32) {
        self.precedence.insert(op, precedence);
    }

    /// Precedence of `token` as a pending binary operator, or -1.
    pub(crate) fn token_precedence(&self, token: &Token) -> i32 {
        token
            .ascii_symbol()
            .and_then(|c| self.precedence.get(&c).copied())
            .filter(|p| *p > 0)
            .unwrap_or(-1)
    }
}

impl Default for OperatorTable {
    fn default() -> Self {
        OperatorTable::with_builtins()
    }
}
