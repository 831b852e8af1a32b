use std::path::PathBuf;
use thiserror::Error;

use super::event::EventCode;
use super::histogram::HistogramId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("Could not parse field path \"{0}\"")]
    BadPath(String),
    #[error("Record {record} has no field named \"{field}\"")]
    UnknownField { record: String, field: String },
    #[error("Field \"{0}\" is not an array and cannot be indexed")]
    NotIndexable(String),
    #[error("Field \"{field}\" has {expected} dimension(s) but {found} index(es) were given")]
    WrongIndexCount {
        field: String,
        expected: usize,
        found: usize,
    },
    #[error("Index {index} is out of bounds for field \"{field}\" (extent {extent})")]
    IndexOutOfBounds {
        field: String,
        index: usize,
        extent: usize,
    },
    #[error("Field \"{0}\" is a record, not a numeric value")]
    NotNumeric(String),
    #[error("Field \"{0}\" is a vector and needs an element index")]
    MissingElementIndex(String),
    #[error("Field \"{0}\" is a vector element and cannot be written")]
    ReadOnly(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Could not parse expression \"{expression}\": {reason}")]
    Parse { expression: String, reason: String },
    #[error("Expression \"{expression}\" refers to unknown variable \"{variable}\"")]
    UnknownVariable {
        expression: String,
        variable: String,
    },
    #[error("Expression \"{expression}\" calls unknown function \"{function}\"")]
    UnknownFunction {
        expression: String,
        function: String,
    },
    #[error("Function \"{function}\" takes {expected} argument(s), {found} given")]
    BadArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistogramError {
    #[error("Invalid parameter specification \"{params}\" for a {expected}-dimensional histogram")]
    BadParameterCount { params: String, expected: usize },
    #[error("Invalid axis: {0}")]
    BadAxis(String),
    #[error("Gamma histogram parameter groups in \"{0}\" do not have equal cardinality")]
    MismatchedGroups(String),
    #[error("Bitmask histograms support 1 to 64 bits, {0} requested")]
    BadBitCount(u32),
    #[error("Histogram failed due to formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Histogram failed due to field resolution error: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("No histogram with id {0} exists")]
    NotFound(HistogramId),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Buffer source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not open {0:?} because the file does not exist")]
    BadFilePath(PathBuf),
    #[error("Could not connect to online source {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },
    #[error("Buffer source does not support {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
#[error("List entry {path:?} skipped: {source}")]
pub struct ListEntryError {
    pub path: PathBuf,
    #[source]
    pub source: SourceError,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Attach failed due to buffer source error: {0}")]
    SourceError(#[from] SourceError),
    #[error("Attach failed because list file {0:?} could not be read: {1}")]
    BadListFile(PathBuf, std::io::Error),
    #[error("Attach failed because list file {0:?} contains no entries")]
    EmptyList(PathBuf),
    #[error("Attach failed because the acquisition thread could not be spawned: {0}")]
    SpawnError(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnpackError {
    #[error("Buffer too short: needed {needed} bytes, found {found}")]
    ShortBuffer { needed: usize, found: usize },
    #[error("Bad event: {0}")]
    BadEvent(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No event type is registered with code {0}")]
    UnknownEvent(EventCode),
    #[error("Engine failed due to histogram error: {0}")]
    HistogramError(#[from] HistogramError),
    #[error("Engine failed due to attach error: {0}")]
    AttachError(#[from] AttachError),
    #[error("Engine failed due to field resolution error: {0}")]
    ResolutionError(#[from] ResolutionError),
}
