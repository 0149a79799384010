use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type of the dataset layer.
///
/// Every variant is fatal at the point raised; there is no retry or
/// partial-success path. Messages always name the offending file, part
/// number, or field.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid constructor arguments.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An expected shard, manifest, or session file is absent.
    #[error("missing file <{}>", .0.display())]
    MissingFile(PathBuf),

    /// Structural mismatch in parsed or on-disk data.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// API misuse: bad part number, stream selector, or a session
    /// operation without an attached session.
    #[error("usage: {0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Npz(#[from] ndarray_npy::ReadNpzError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::Error::Config(format!($($arg)*)));
        }
    };
}

macro_rules! ensure_data {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::Error::DataIntegrity(format!($($arg)*)));
        }
    };
}

macro_rules! ensure_usage {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::Error::Usage(format!($($arg)*)));
        }
    };
}

pub(crate) use {ensure_config, ensure_data, ensure_usage};
