use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("set_in called with an empty path")]
    EmptyPath,
    #[error("set_in cannot be called on an element node")]
    SetInOnElement,
    #[error("bad set_in index {index} (should be between [0, {len}])")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("no child at index {0} to descend into")]
    MissingParent(usize),
    #[error("invalid delta path {0:?}: expected a container index followed by a child path")]
    InvalidDeltaPath(Vec<usize>),
    #[error("unknown root container {0} (expected 0 for main or 1 for sidebar)")]
    UnknownContainer(usize),
    #[error("can't add rows: no element at delta path {0:?}")]
    NoElementAtPath(Vec<usize>),
    #[error("unsupported element kind for add_rows: {kind}")]
    UnsupportedAddRows { kind: &'static str },
    #[error("row data mismatch: {0}")]
    SchemaMismatch(String),
    #[error("malformed app root: {0}")]
    MalformedRoot(String),
}

pub type TreeResult<T> = Result<T, TreeError>;
