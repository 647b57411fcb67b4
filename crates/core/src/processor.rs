use crate::chunking::{
    ChunkingConfig, RecursiveSplitter, MARKDOWN_SEPARATORS, PDF_SEPARATORS, TEXT_SEPARATORS,
};
use crate::error::IngestError;
use crate::extractor::{extract_pages_from_bytes, LopdfExtractor, PdfExtractor};
use crate::models::{Chunk, ChunkMetadata, DocumentKind, DocumentStats, UploadedFile};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What happened to one file of a batch.
#[derive(Debug)]
pub enum FileOutcome {
    Processed(Vec<Chunk>),
    Skipped(String),
    Failed(IngestError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Processed { chunks: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileReport {
    pub name: String,
    #[serde(flatten)]
    pub status: FileStatus,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub chunks: Vec<Chunk>,
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn processed_files(&self) -> usize {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Processed { .. }))
            .count()
    }

    pub fn problems(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|file| !matches!(file.status, FileStatus::Processed { .. }))
    }
}

/// Turns uploaded files into chunks, dispatching on the file extension.
pub struct DocumentProcessor {
    config: ChunkingConfig,
    extractor: Box<dyn PdfExtractor>,
}

impl DocumentProcessor {
    pub fn new(config: ChunkingConfig) -> Self {
        Self::with_extractor(config, Box::new(LopdfExtractor))
    }

    pub fn with_extractor(config: ChunkingConfig, extractor: Box<dyn PdfExtractor>) -> Self {
        Self { config, extractor }
    }

    pub fn process_file(&self, file: &UploadedFile) -> FileOutcome {
        let result = match file.kind() {
            Some(DocumentKind::Pdf) => self.process_pdf(file),
            Some(DocumentKind::Txt) => self.process_text(file),
            Some(DocumentKind::Markdown) => self.process_markdown(file),
            None => {
                warn!(file = %file.name, "unsupported file type, skipping");
                return FileOutcome::Skipped(format!("unsupported file type: {}", file.name));
            }
        };

        match result {
            Ok(chunks) => FileOutcome::Processed(chunks),
            Err(error) => {
                warn!(file = %file.name, %error, "failed to process file");
                FileOutcome::Failed(error)
            }
        }
    }

    /// Processes every file in order. A failing or unsupported file is recorded
    /// in the report and never aborts the rest of the batch.
    pub fn process_files(&self, files: &[UploadedFile]) -> BatchReport {
        let mut report = BatchReport::default();

        for file in files {
            let status = match self.process_file(file) {
                FileOutcome::Processed(chunks) => {
                    let count = chunks.len();
                    report.chunks.extend(chunks);
                    FileStatus::Processed { chunks: count }
                }
                FileOutcome::Skipped(reason) => FileStatus::Skipped { reason },
                FileOutcome::Failed(error) => FileStatus::Failed {
                    error: error.to_string(),
                },
            };
            report.files.push(FileReport {
                name: file.name.clone(),
                status,
            });
        }

        info!(
            files = files.len(),
            processed = report.processed_files(),
            chunks = report.chunks.len(),
            "batch processed"
        );
        report
    }

    /// PDF-only, all-or-nothing processing used by the REST upload endpoint.
    pub fn process_pdf_uploads(&self, files: &[UploadedFile]) -> Result<Vec<Chunk>, IngestError> {
        if let Some(rejected) = files
            .iter()
            .find(|file| !file.has_pdf_suffix())
        {
            return Err(IngestError::InvalidArgument(format!(
                "{} is not a pdf",
                rejected.name
            )));
        }

        let mut chunks = Vec::new();
        for file in files {
            chunks.extend(self.process_pdf(file)?);
        }
        Ok(chunks)
    }

    pub fn process_pdf(&self, file: &UploadedFile) -> Result<Vec<Chunk>, IngestError> {
        let pages = extract_pages_from_bytes(self.extractor.as_ref(), &file.bytes)?;
        let splitter = RecursiveSplitter::new(self.config, PDF_SEPARATORS);
        let document_id = document_id(&file.name, &file.bytes);

        let mut chunks = Vec::new();
        for page in pages {
            for text in splitter.split(&page.text) {
                let chunk_index = chunks.len() as u64;
                chunks.push(Chunk {
                    text,
                    metadata: ChunkMetadata {
                        source: file.name.clone(),
                        document_id: document_id.clone(),
                        kind: DocumentKind::Pdf,
                        page: Some(page.number.saturating_sub(1)),
                        chunk_index,
                        section: None,
                    },
                });
            }
        }

        debug!(file = %file.name, chunks = chunks.len(), "pdf split");
        Ok(chunks)
    }

    pub fn process_text(&self, file: &UploadedFile) -> Result<Vec<Chunk>, IngestError> {
        let content = decode_utf8(file)?;
        let splitter = RecursiveSplitter::new(self.config, TEXT_SEPARATORS);
        let document_id = document_id(&file.name, &file.bytes);

        let chunks = splitter
            .split(content)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                text,
                metadata: ChunkMetadata {
                    source: file.name.clone(),
                    document_id: document_id.clone(),
                    kind: DocumentKind::Txt,
                    page: None,
                    chunk_index: index as u64,
                    section: None,
                },
            })
            .collect();

        Ok(chunks)
    }

    pub fn process_markdown(&self, file: &UploadedFile) -> Result<Vec<Chunk>, IngestError> {
        let content = decode_utf8(file)?;
        let splitter = RecursiveSplitter::new(self.config, MARKDOWN_SEPARATORS);
        let document_id = document_id(&file.name, &file.bytes);
        let heading_re = heading_regex()?;

        let mut current_section: Option<String> = None;
        let mut chunks = Vec::new();

        for (index, text) in splitter.split(content).into_iter().enumerate() {
            let headings: Vec<String> = heading_re
                .captures_iter(&text)
                .filter_map(|capture| capture.get(1))
                .map(|title| title.as_str().trim().to_string())
                .collect();

            let section = headings.first().cloned().or_else(|| current_section.clone());
            if let Some(last) = headings.last() {
                current_section = Some(last.clone());
            }

            chunks.push(Chunk {
                text,
                metadata: ChunkMetadata {
                    source: file.name.clone(),
                    document_id: document_id.clone(),
                    kind: DocumentKind::Markdown,
                    page: None,
                    chunk_index: index as u64,
                    section,
                },
            });
        }

        Ok(chunks)
    }
}

pub fn document_stats(chunks: &[Chunk]) -> DocumentStats {
    let total_characters: usize = chunks.iter().map(Chunk::char_len).sum();
    let total_chunks = chunks.len();

    DocumentStats {
        total_chunks,
        total_characters,
        avg_chunk_size: total_characters.checked_div(total_chunks).unwrap_or(0),
    }
}

/// Recursively lists the supported documents under `folder`, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .file_name()
            .to_str()
            .and_then(DocumentKind::from_file_name)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn load_uploaded_file(path: &Path) -> Result<UploadedFile, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
    let bytes = fs::read(path)?;
    Ok(UploadedFile::new(name, bytes))
}

fn decode_utf8(file: &UploadedFile) -> Result<&str, IngestError> {
    std::str::from_utf8(&file.bytes)
        .map_err(|error| IngestError::Encoding(format!("{}: {error}", file.name)))
}

fn document_id(name: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn heading_regex() -> Result<&'static Regex, IngestError> {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = HEADING.get() {
        return Ok(regex);
    }
    let compiled = Regex::new(r"(?m)^#{1,6}\s+(.+)$")?;
    Ok(HEADING.get_or_init(|| compiled))
}
