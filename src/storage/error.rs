use thiserror::Error;

/// Dataset backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown dataset handle: {0}")]
    UnknownDataset(i32),

    #[error("Unknown variable {var_id} in dataset {file_id}")]
    UnknownVariable { file_id: i32, var_id: i32 },

    #[error("Unknown dimension {dim_id} in dataset {file_id}")]
    UnknownDimension { file_id: i32, dim_id: i32 },

    #[error("Dataset {0} is not in define mode")]
    NotInDefineMode(i32),

    #[error("Dataset {0} is not in data mode")]
    NotInDataMode(i32),

    #[error("Sub-array out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Header serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
