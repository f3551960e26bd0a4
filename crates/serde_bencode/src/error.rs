#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub position: Option<usize>,
}

impl Error {
    pub fn set_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(pos) => write!(f, "bencode error at byte {}: {}", pos, self.kind),
            None => write!(f, "bencode error: {}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        ErrorKind::Custom(msg.to_string()).into()
    }
}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        ErrorKind::Custom(msg.to_string()).into()
    }
}

impl From<ErrorKind> for Error {
    fn from(value: ErrorKind) -> Self {
        Error {
            kind: value,
            position: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        ErrorKind::Io(value).into()
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    Custom(String),
    Io(std::io::Error),
    UnexpectedEof(&'static str),
    BadInputData(&'static str),
    Unsupported(&'static str),
    TrailingBytes(usize),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Custom(msg) => write!(f, "{}", msg),
            ErrorKind::Io(e) => write!(f, "failed to write output: {}", e),
            ErrorKind::UnexpectedEof(expected) => {
                write!(f, "unexpected end of input, expected {}", expected)
            }
            ErrorKind::BadInputData(msg) => write!(f, "malformed input: {}", msg),
            ErrorKind::Unsupported(msg) => write!(f, "bencode doesn't support {}", msg),
            ErrorKind::TrailingBytes(n) => write!(f, "{} trailing bytes after the top-level value", n),
        }
    }
}
