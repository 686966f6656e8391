use std::io;

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Parser(String),
    /// File extension not among the supported cloud formats.
    UnknownFormat(String),
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        LoadError::Io(err)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "IO error: {err}"),
            LoadError::Parser(err) => write!(f, "parser error: {err}"),
            LoadError::UnknownFormat(ext) => write!(f, "unknown point cloud format: {ext}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(err) => Some(err),
            _ => None,
        }
    }
}
