pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod models;
pub mod processor;
pub mod qa;
pub mod traits;
pub mod vector_store;

pub use chunking::{ChunkingConfig, RecursiveSplitter};
pub use config::{EmbeddingProvider, Settings};
pub use embeddings::{
    build_embedder, CharacterNgramEmbedder, OpenAiEmbeddings, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, IngestError, QaError, StoreError};
pub use extractor::{LopdfExtractor, PageText, PdfExtractor};
pub use llm::OpenAiChat;
pub use models::{
    Chunk, ChunkMetadata, ConversationMessage, DocumentCount, DocumentKind, DocumentStats, Role,
    UploadedFile, VectorStoreStats, WireMessage,
};
pub use processor::{
    discover_documents, document_stats, load_uploaded_file, BatchReport, DocumentProcessor,
    FileOutcome, FileReport, FileStatus,
};
pub use qa::{history_from_wire, Answer, AskOptions, QaService, DEFAULT_SYSTEM_PROMPT};
pub use traits::{ChatModel, CompletionRequest, Embedder, PromptMessage, PromptRole, Retriever};
pub use vector_store::{VectorIndex, VectorStoreManager};
