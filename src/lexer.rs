use super::token::Token;
use combine::error::ParseError;
use combine::parser::char::{alpha_num, digit, letter, space};
use combine::parser::choice::or;
use combine::parser::repeat::take_until;
use combine::parser::Parser;
use combine::stream::Stream;
use combine::{any, choice, eof, many, many1, parser, satisfy, skip_many, skip_many1, token};

/// Source of tokens for the parser. Each call yields the next token; there is no rewind.
pub(crate) trait TokenStream {
    fn advance(&mut self) -> Token;
}

// Longest numeric prefix, the way strtod reads "1.2.3" as 1.2.
fn strtod(s: &str) -> f64 {
    (1..=s.len())
        .rev()
        .find_map(|end| s[..end].parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.')))).map(|ns: String| Token::Number(strtod(&ns)))
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (letter(), many(alpha_num())).map(|(first, rest): (char, String)| {
        let mut s = String::with_capacity(rest.len() + 1);
        s.push(first);
        s.push_str(&rest);
        match s.as_ref() {
            "def" => Token::Def,
            "extern" => Token::Extern,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            "binary" => Token::Binary,
            "unary" => Token::Unary,
            "var" => Token::Var,
            _ => Token::Ident(s),
        }
    })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many1((
        token('#'),
        take_until::<String, _, _>(or(
            satisfy(|c| c == '\n' || c == '\r').map(|_| ()),
            eof(),
        )),
    ))
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(space()).with(choice((
        number().map(Some),
        ident().map(Some),
        comment().with(lex()),
        eof().map(|_| None),
        any().map(|c| Some(Token::Kwd(c))),
    )))
}

parser! {
    pub(crate) fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}

/// Lexes a borrowed source string one token at a time.
pub(crate) struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Lexer { rest: src }
    }
}

impl<'a> TokenStream for Lexer<'a> {
    fn advance(&mut self) -> Token {
        match lex().parse(self.rest) {
            Ok((Some(token), rest)) => {
                self.rest = rest;
                token
            }
            Ok((None, rest)) => {
                self.rest = rest;
                Token::Eof
            }
            Err(e) => {
                tracing::warn!("lexer stopped: {}", e);
                self.rest = "";
                Token::Eof
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::token::Token::*;
    use super::*;
    use combine::parser::EasyParser;

    fn lex_all(s: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(s);
        let mut tokens = Vec::new();
        loop {
            match lexer.advance() {
                Eof => break,
                t => tokens.push(t),
            }
        }
        tokens
    }

    #[test]
    fn test_number() {
        assert_eq!(number().easy_parse("1.0").map(|x| x.0), Ok(Number(1.0)));
        assert_eq!(number().easy_parse(".5").map(|x| x.0), Ok(Number(0.5)));
        assert_eq!(number().easy_parse("1.2.3").map(|x| x.0), Ok(Number(1.2)));
    }

    #[test]
    fn test_ident() {
        assert_eq!(
            ident().easy_parse("test").map(|x| x.0),
            Ok(Ident("test".to_owned()))
        );
        assert_eq!(
            ident().easy_parse("x1y").map(|x| x.0),
            Ok(Ident("x1y".to_owned()))
        );

        assert_eq!(ident().easy_parse("def").map(|x| x.0), Ok(Def));
        assert_eq!(ident().easy_parse("binary").map(|x| x.0), Ok(Binary));
        assert_eq!(ident().easy_parse("var").map(|x| x.0), Ok(Var));
    }

    #[test]
    fn test_comment() {
        assert_eq!(comment().easy_parse("#hoge").map(|x| x.0), Ok(()));
    }

    #[test]
    fn test_lex() {
        assert_eq!(
            lex()
                .easy_parse(
                    r#"#comment
1.0
"#
                )
                .map(|x| x.0),
            Ok(Some(Number(1.0)))
        );
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            lex_all("def binary| 5 (a b) if a then 1 else b;"),
            vec![
                Def,
                Binary,
                Kwd('|'),
                Number(5.0),
                Kwd('('),
                Ident("a".to_owned()),
                Ident("b".to_owned()),
                Kwd(')'),
                If,
                Ident("a".to_owned()),
                Then,
                Number(1.0),
                Else,
                Ident("b".to_owned()),
                Kwd(';'),
            ]
        );
    }

    #[test]
    fn test_stream_ends_with_eof() {
        let mut lexer = Lexer::new("  x # trailing comment");
        assert_eq!(lexer.advance(), Ident("x".to_owned()));
        assert_eq!(lexer.advance(), Eof);
        assert_eq!(lexer.advance(), Eof);
    }
}
