use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown operator `{operator}` on property `{property}`")]
    UnknownOperator { operator: String, property: String },
    #[error("invalid property path `{path}`: {reason}")]
    InvalidPropertyPath { path: String, reason: String },
    #[error("invalid filter expression: {0}")]
    InvalidExpressionShape(String),
    #[error("eager path `{0}` is not allowed")]
    DisallowedEagerPath(String),
    #[error("invalid operator name `{0}`")]
    InvalidOperatorName(String),
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("count requested before build")]
    CountBeforeBuild,
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Error::InvalidExpressionShape(reason.into())
    }

    pub(crate) fn path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPropertyPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input rather than by the database.
    /// These are raised before any query runs and map onto a client-facing
    /// validation failure.
    pub fn is_validation(&self) -> bool {
        match self {
            Error::UnknownOperator { .. }
            | Error::InvalidPropertyPath { .. }
            | Error::InvalidExpressionShape(_)
            | Error::DisallowedEagerPath(_)
            | Error::InvalidOperatorName(_)
            | Error::UnknownEntity(_) => true,
            Error::Context { source, .. } => source.is_validation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
