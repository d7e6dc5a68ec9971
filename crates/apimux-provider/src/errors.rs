use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    Unsupported(&'static str),
    InvalidEndpoint(String),
    MissingKeyField(&'static str),
    Upstream(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported(what) => write!(f, "unsupported: {what}"),
            ProviderError::InvalidEndpoint(msg) => write!(f, "invalid endpoint: {msg}"),
            ProviderError::MissingKeyField(field) => write!(f, "missing key field: {field}"),
            ProviderError::Upstream(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ProviderError {}
