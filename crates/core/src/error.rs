use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is not set (add it to the environment or a .env file)")]
    MissingApiKey,

    #[error("invalid value for {key}: {details}")]
    InvalidValue { key: String, details: String },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("file is not valid utf-8: {0}")]
    Encoding(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("cannot build an index from an empty chunk list")]
    EmptyInput,

    #[error("index is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum QaError {
    #[error("no documents loaded, upload documents first")]
    NoDocuments,

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] StoreError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    Upstream { backend: String, details: String },
}
