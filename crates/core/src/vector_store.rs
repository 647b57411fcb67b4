//! Persistent embedding index backed by a single SQLite file.
//!
//! `manifest` holds one row describing the collection, `records` holds one
//! embedded chunk per row with the vector stored as little-endian `f32` bytes.
//! Every write runs in one transaction. Removing the directory is a full reset.

use crate::error::StoreError;
use crate::models::{Chunk, ChunkMetadata, DocumentCount, VectorStoreStats};
use crate::traits::{Embedder, Retriever};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATABASE_FILE: &str = "index.sqlite3";
const COLLECTION_NAME: &str = "documents";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS manifest (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        collection TEXT NOT NULL,
        embedding_model TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        text TEXT NOT NULL,
        metadata TEXT NOT NULL,
        embedding BLOB NOT NULL
    );
";

#[derive(Debug, Clone)]
struct Manifest {
    collection: String,
    embedding_model: String,
    dimensions: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    id: Uuid,
    text: String,
    metadata: ChunkMetadata,
    embedding: Vec<f32>,
}

impl StoredRecord {
    fn to_chunk(&self) -> Chunk {
        Chunk {
            text: self.text.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect())
}

/// Opens an existing database without creating it.
fn connect(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Ok(Connection::open_with_flags(path, flags)?)
}

fn insert_records(tx: &Transaction<'_>, records: &[StoredRecord]) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        "INSERT INTO records (id, text, metadata, embedding) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for record in records {
        stmt.execute(params![
            record.id.to_string(),
            record.text,
            serde_json::to_string(&record.metadata)?,
            embedding_to_bytes(&record.embedding),
        ])?;
    }
    Ok(())
}

fn read_manifest(conn: &Connection) -> Result<Manifest, StoreError> {
    let (collection, embedding_model, dimensions, created_at) = conn.query_row(
        "SELECT collection, embedding_model, dimensions, created_at FROM manifest WHERE id = 1",
        [],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        },
    )?;

    let dimensions = usize::try_from(dimensions)
        .map_err(|_| StoreError::Corrupt(format!("negative dimension count {dimensions}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|error| StoreError::Corrupt(format!("manifest timestamp: {error}")))?
        .with_timezone(&Utc);

    Ok(Manifest {
        collection,
        embedding_model,
        dimensions,
        created_at,
    })
}

fn read_records(conn: &Connection, dimensions: usize) -> Result<Vec<StoredRecord>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, text, metadata, embedding FROM records ORDER BY seq")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (id, text, metadata, blob) in rows {
        let id = Uuid::parse_str(&id)
            .map_err(|error| StoreError::Corrupt(format!("record id {id}: {error}")))?;
        let embedding = bytes_to_embedding(&blob)?;
        if embedding.len() != dimensions {
            return Err(StoreError::Dimension {
                expected: dimensions,
                actual: embedding.len(),
            });
        }
        records.push(StoredRecord {
            id,
            text,
            metadata: serde_json::from_str(&metadata)?,
            embedding,
        });
    }
    Ok(records)
}

/// Handle to an opened index. Records are mirrored in memory for search.
pub struct VectorIndex {
    dir: PathBuf,
    manifest: Manifest,
    records: Vec<StoredRecord>,
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dir", &self.dir)
            .field("collection", &self.manifest.collection)
            .field("created_at", &self.manifest.created_at)
            .field("records", &self.records.len())
            .finish()
    }
}

impl VectorIndex {
    fn open(dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, StoreError> {
        let conn = connect(&dir.join(DATABASE_FILE))?;
        let manifest = read_manifest(&conn)?;
        let records = read_records(&conn, manifest.dimensions)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            records,
            embedder,
        })
    }

    fn database_path(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn embedding_model(&self) -> &str {
        &self.manifest.embedding_model
    }

    /// Counts the records persisted on disk.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = connect(&self.database_path())?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        usize::try_from(count)
            .map_err(|_| StoreError::Corrupt(format!("negative record count {count}")))
    }

    /// Embeds and appends chunks in one transaction. Nothing is written when
    /// embedding or the insert fails.
    pub async fn add_chunks(&mut self, chunks: &[Chunk]) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = embed_chunks(self.embedder.as_ref(), chunks).await?;
        let new_records = build_records(chunks, embeddings, self.manifest.dimensions)?;

        let mut conn = connect(&self.database_path())?;
        let tx = conn.transaction()?;
        insert_records(&tx, &new_records)?;
        tx.commit()?;

        let added = new_records.len();
        self.records.extend(new_records);
        debug!(added, total = self.records.len(), "records appended");
        Ok(added)
    }

    /// Top-k chunks by cosine similarity, best first.
    pub async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Chunk, f32)>, StoreError> {
        if k == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_query(query).await?;
        if query_vector.len() != self.manifest.dimensions {
            return Err(StoreError::Dimension {
                expected: self.manifest.dimensions,
                actual: query_vector.len(),
            });
        }

        let mut scored: Vec<(&StoredRecord, f32)> = self
            .records
            .iter()
            .map(|record| (record, cosine_similarity(&query_vector, &record.embedding)))
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(record, score)| (record.to_chunk(), score))
            .collect())
    }
}

#[async_trait]
impl Retriever for VectorIndex {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Chunk>, StoreError> {
        let hits = self.similarity_search(query, k).await?;
        Ok(hits.into_iter().map(|(chunk, _)| chunk).collect())
    }
}

async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: &[Chunk],
) -> Result<Vec<Vec<f32>>, StoreError> {
    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let embeddings = embedder.embed_documents(&texts).await?;
    if embeddings.len() != chunks.len() {
        return Err(StoreError::BackendResponse {
            backend: embedder.model_name().to_string(),
            details: format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            ),
        });
    }
    Ok(embeddings)
}

fn build_records(
    chunks: &[Chunk],
    embeddings: Vec<Vec<f32>>,
    dimensions: usize,
) -> Result<Vec<StoredRecord>, StoreError> {
    chunks
        .iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| {
            if embedding.len() != dimensions {
                return Err(StoreError::Dimension {
                    expected: dimensions,
                    actual: embedding.len(),
                });
            }
            Ok(StoredRecord {
                id: Uuid::new_v4(),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                embedding,
            })
        })
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Owns the persistence directory and hands out [`VectorIndex`] handles.
#[derive(Clone)]
pub struct VectorStoreManager {
    persist_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl VectorStoreManager {
    pub fn new(persist_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            persist_dir: persist_dir.into(),
            embedder,
        }
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.persist_dir.join(DATABASE_FILE)
    }

    /// Opens the persisted index if it holds at least one record. Any failure
    /// is logged and reported as "no index".
    pub fn load(&self) -> Option<VectorIndex> {
        if !self.database_path().is_file() {
            return None;
        }

        match VectorIndex::open(&self.persist_dir, Arc::clone(&self.embedder)) {
            Ok(index) if index.is_empty() => {
                info!(path = %self.persist_dir.display(), "vector store has no records");
                None
            }
            Ok(index) => {
                info!(
                    path = %self.persist_dir.display(),
                    records = index.len(),
                    embedding_model = index.embedding_model(),
                    "vector store loaded"
                );
                Some(index)
            }
            Err(error) => {
                warn!(path = %self.persist_dir.display(), %error, "failed to load vector store");
                None
            }
        }
    }

    /// Builds a fresh index from a non-empty chunk list. The manifest and
    /// every record are written in a single transaction.
    pub async fn create(&self, chunks: &[Chunk]) -> Result<VectorIndex, StoreError> {
        if chunks.is_empty() {
            return Err(StoreError::EmptyInput);
        }

        let embeddings = embed_chunks(self.embedder.as_ref(), chunks).await?;
        let dimensions = embeddings.first().map(Vec::len).unwrap_or_default();
        let records = build_records(chunks, embeddings, dimensions)?;
        let manifest = Manifest {
            collection: COLLECTION_NAME.to_string(),
            embedding_model: self.embedder.model_name().to_string(),
            dimensions,
            created_at: Utc::now(),
        };

        fs::create_dir_all(&self.persist_dir)?;
        let mut conn = Connection::open(self.database_path())?;
        conn.execute_batch(SCHEMA)?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM manifest", [])?;
        tx.execute(
            "INSERT INTO manifest (id, collection, embedding_model, dimensions, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                manifest.collection,
                manifest.embedding_model,
                dimensions as i64,
                manifest.created_at.to_rfc3339(),
            ],
        )?;
        insert_records(&tx, &records)?;
        tx.commit()?;

        let index = VectorIndex {
            dir: self.persist_dir.clone(),
            manifest,
            records,
            embedder: Arc::clone(&self.embedder),
        };
        info!(
            path = %self.persist_dir.display(),
            records = index.len(),
            "vector store created"
        );
        Ok(index)
    }

    /// Appends to `existing` when given, otherwise creates a new index.
    pub async fn add(
        &self,
        chunks: &[Chunk],
        existing: Option<VectorIndex>,
    ) -> Result<VectorIndex, StoreError> {
        match existing {
            Some(mut index) => {
                index.add_chunks(chunks).await?;
                Ok(index)
            }
            None => self.create(chunks).await,
        }
    }

    /// Removes the persisted directory tree. Absent directory is a no-op.
    pub fn delete(&self) -> Result<(), StoreError> {
        if self.persist_dir.exists() {
            fs::remove_dir_all(&self.persist_dir)?;
            info!(path = %self.persist_dir.display(), "vector store removed");
        }
        Ok(())
    }

    pub fn stats(&self, index: Option<&VectorIndex>) -> VectorStoreStats {
        let persist_directory = self.persist_dir.display().to_string();

        let Some(index) = index else {
            return VectorStoreStats {
                exists: false,
                total_documents: DocumentCount::Known(0),
                persist_directory,
                error: None,
            };
        };

        match index.count() {
            Ok(count) => VectorStoreStats {
                exists: true,
                total_documents: DocumentCount::Known(count),
                persist_directory,
                error: None,
            },
            Err(error) => VectorStoreStats {
                exists: true,
                total_documents: DocumentCount::Unknown,
                persist_directory,
                error: Some(error.to_string()),
            },
        }
    }
}
