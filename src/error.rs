use std::path::PathBuf;

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::io::LoadError;

/// Fatal pipeline errors. Recoverable conditions (empty frames, implausible
/// registrations, non-convergent optimization) are reported through status
/// values instead.
#[derive(Debug)]
pub enum Error {
    /// The input directory does not exist or holds no point cloud files.
    InputMissing(PathBuf),
    /// The pipeline received no frames at all.
    EmptyInput,
    Load(LoadError),
    Config(ConfigError),
    Graph(GraphError),
    Io(std::io::Error),
    /// The run was cancelled; no artifacts were produced.
    Cancelled,
}

impl Error {
    /// Process exit code for the CLI: 1 input, 2 configuration, 3 pipeline.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InputMissing(_) | Error::EmptyInput | Error::Load(_) => 1,
            Error::Config(_) => 2,
            Error::Graph(_) | Error::Io(_) | Error::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InputMissing(path) => {
                write!(f, "input not found or empty: {}", path.display())
            }
            Error::EmptyInput => write!(f, "no input frames"),
            Error::Load(err) => write!(f, "load error: {err}"),
            Error::Config(err) => write!(f, "{err}"),
            Error::Graph(err) => write!(f, "pose graph error: {err}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Load(err) => Some(err),
            Error::Config(err) => Some(err),
            Error::Graph(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::Load(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<GraphError> for Error {
    fn from(err: GraphError) -> Self {
        Error::Graph(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
