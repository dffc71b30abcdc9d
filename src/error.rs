use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "parse error: {}", _0)]
    Parse(String),
    #[fail(display = "unknown variable name '{}'", _0)]
    UnknownVariable(String),
    #[fail(display = "unknown function referenced '{}'", _0)]
    UnknownFunction(String),
    #[fail(
        display = "incorrect number of arguments passed to '{}': expected {}, found {}",
        name, expected, found
    )]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[fail(display = "function cannot be redefined: '{}'", _0)]
    Redefinition(String),
    #[fail(display = "unknown operator '{}'", _0)]
    UnknownOperator(String),
    #[fail(display = "conflicting declaration of '{}'", _0)]
    ConflictingDeclaration(String),
    #[fail(display = "invalid function: {}", _0)]
    Verify(String),
    #[fail(display = "execution error: {}", _0)]
    Execution(String),
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    pub(crate) fn parse<S: Into<String>>(msg: S) -> Error {
        Error::from(ErrorKind::Parse(msg.into()))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}
