use std::{fmt, io};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    InvalidArgument = 1,
    Overflow = 2,
    NotElf = 3,
    ElfFormat = 4,
    DwarfFormat = 5,
    MissingDebug = 6,
    TruncatedDebugInfo = 7,
    Lookup = 8,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ResultWithClonableError<T> { fn as_ref_clone_error(&self) -> Result<&T>; }
impl<T> ResultWithClonableError<T> for Result<T> { fn as_ref_clone_error(&self) -> Result<&T> { match self { Ok(t) => Ok(t), Err(e) => Err(e.clone()) } } }

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn code(&self) -> Option<ErrorCode> { match self.error { ErrorEnum::Code(c) => Some(c), _ => None } }

    pub fn is_invalid_argument(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::InvalidArgument)) }
    pub fn is_overflow(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::Overflow)) }
    pub fn is_not_elf(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::NotElf)) }
    pub fn is_elf_format(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::ElfFormat)) }
    pub fn is_dwarf_format(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::DwarfFormat)) }
    pub fn is_missing_debug(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::MissingDebug)) }
    pub fn is_truncated(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::TruncatedDebugInfo)) }
    pub fn is_lookup(&self) -> bool { matches!(self.error, ErrorEnum::Code(ErrorCode::Lookup)) }
    pub fn is_io(&self) -> bool { matches!(self.error, ErrorEnum::IO(_)) }
    pub fn is_io_not_found(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::NotFound => true, _ => false } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::ElfFormat), message: format!("{}", error)}
    }
}

impl From<gimli::Error> for Error {
    fn from(error: gimli::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::DwarfFormat), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(*c),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}
