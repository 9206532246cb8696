use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB serialization error: {0}")]
    MongoBsonSer(#[from] mongodb::bson::ser::Error),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB deserialization error: {0}")]
    MongoBsonDe(#[from] mongodb::bson::de::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("File storage is disabled")]
    FileWriteDisabled,

    #[error("Could not create a unique file in {0}")]
    NoUniqueFile(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
