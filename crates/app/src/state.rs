use docchat_core::{
    build_embedder, Answer, AskOptions, Chunk, ChunkingConfig, DocumentProcessor, OpenAiChat,
    QaError, QaService, Retriever, Settings, StoreError, VectorIndex, VectorStoreManager,
    VectorStoreStats,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Everything a front-end needs. The index handle is the only mutable part:
/// uploads and resets hold the write lock, questions and stats the read lock.
pub struct AppState {
    pub settings: Settings,
    pub processor: Arc<DocumentProcessor>,
    pub manager: VectorStoreManager,
    pub qa: QaService,
    pub index: Arc<RwLock<Option<VectorIndex>>>,
}

impl AppState {
    /// Wires the components together and opens any persisted index.
    pub fn new(
        settings: Settings,
        processor: DocumentProcessor,
        manager: VectorStoreManager,
        qa: QaService,
    ) -> Self {
        let index = manager.load();
        Self {
            settings,
            processor: Arc::new(processor),
            manager,
            qa,
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let config = ChunkingConfig::try_from(&settings)?;
        let processor = DocumentProcessor::new(config);
        let manager = VectorStoreManager::new(settings.persist_dir.clone(), build_embedder(&settings));
        let chat = Arc::new(OpenAiChat::new(
            settings.openai_base_url.clone(),
            settings.api_key(),
        ));
        let qa = QaService::new(chat, &settings);
        Ok(Self::new(settings, processor, manager, qa))
    }

    pub async fn is_loaded(&self) -> bool {
        self.index.read().await.is_some()
    }

    /// Appends chunks to the current index, creating it when absent.
    pub async fn index_chunks(&self, chunks: &[Chunk]) -> Result<usize, StoreError> {
        let mut guard = self.index.write().await;
        let current = guard.take();
        match self.manager.add(chunks, current).await {
            Ok(index) => {
                let total = index.len();
                *guard = Some(index);
                info!(added = chunks.len(), total, "index updated");
                Ok(total)
            }
            Err(error) => {
                warn!(%error, "indexing failed, reopening persisted index");
                *guard = self.manager.load();
                Err(error)
            }
        }
    }

    /// Deletes the persisted index, then drops the handle. A failed delete
    /// keeps the handle so it still matches what is on disk.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut guard = self.index.write().await;
        self.manager.delete()?;
        *guard = None;
        Ok(())
    }

    pub async fn stats(&self) -> VectorStoreStats {
        let guard = self.index.read().await;
        self.manager.stats(guard.as_ref())
    }

    /// Answers against the current index. Sources are only collected when asked for.
    pub async fn ask(
        &self,
        query: &str,
        options: &AskOptions,
        with_sources: bool,
    ) -> Result<Answer, QaError> {
        let guard = self.index.read().await;
        let retriever = guard
            .as_ref()
            .filter(|index| !index.is_empty())
            .map(|index| index as &dyn Retriever);

        if with_sources {
            return self
                .qa
                .ask_with_sources(query, retriever, options, self.settings.retrieval_k)
                .await;
        }

        let answer = self.qa.ask(query, retriever, options).await?;
        Ok(Answer {
            answer,
            model: self.qa.model_for(options).to_string(),
            sources: Vec::new(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{offline_state, EchoChat};
    use super::*;
    use docchat_core::{ChunkMetadata, DocumentCount, DocumentKind};
    use tempfile::tempdir;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: "a.txt".to_string(),
                document_id: "doc".to_string(),
                kind: DocumentKind::Txt,
                page: None,
                chunk_index: 0,
                section: None,
            },
        }
    }

    #[tokio::test]
    async fn indexing_twice_accumulates_records() {
        let dir = tempdir().unwrap();
        let state = offline_state(dir.path(), Arc::new(EchoChat::default()));

        assert!(!state.is_loaded().await);
        state.index_chunks(&[chunk("one")]).await.unwrap();
        let total = state.index_chunks(&[chunk("two"), chunk("three")]).await.unwrap();

        assert_eq!(total, 3);
        assert_eq!(state.stats().await.total_documents, DocumentCount::Known(3));
    }

    #[tokio::test]
    async fn persisted_index_is_picked_up_on_startup() {
        let dir = tempdir().unwrap();
        let first = offline_state(dir.path(), Arc::new(EchoChat::default()));
        first.index_chunks(&[chunk("kept")]).await.unwrap();
        drop(first);

        let second = offline_state(dir.path(), Arc::new(EchoChat::default()));
        assert!(second.is_loaded().await);
    }

    #[tokio::test]
    async fn reset_clears_handle_and_disk() {
        let dir = tempdir().unwrap();
        let state = offline_state(dir.path(), Arc::new(EchoChat::default()));
        state.index_chunks(&[chunk("one")]).await.unwrap();

        state.reset().await.unwrap();

        let stats = state.stats().await;
        assert!(!stats.exists);
        assert_eq!(stats.total_documents, DocumentCount::Known(0));
        assert!(!state.settings.persist_dir.exists());
    }

    #[tokio::test]
    async fn failed_reset_keeps_the_loaded_index() {
        let dir = tempdir().unwrap();
        let state = offline_state(dir.path(), Arc::new(EchoChat::default()));
        state.index_chunks(&[chunk("one")]).await.unwrap();

        let persist_dir = state.settings.persist_dir.clone();
        std::fs::remove_dir_all(&persist_dir).unwrap();
        std::fs::write(&persist_dir, b"not a directory").unwrap();

        assert!(state.reset().await.is_err());
        assert!(state.is_loaded().await);
        assert!(persist_dir.is_file());
    }

    #[tokio::test]
    async fn index_emptied_on_disk_counts_as_no_documents() {
        let dir = tempdir().unwrap();
        let first = offline_state(dir.path(), Arc::new(EchoChat::default()));
        first.index_chunks(&[chunk("one"), chunk("two")]).await.unwrap();
        let database = first.manager.database_path();
        drop(first);

        let conn = rusqlite::Connection::open(&database).unwrap();
        conn.execute("DELETE FROM records", []).unwrap();
        drop(conn);

        let chat = Arc::new(EchoChat::default());
        let state = offline_state(dir.path(), Arc::clone(&chat));
        assert!(!state.is_loaded().await);

        let result = state.ask("hello", &AskOptions::default(), true).await;
        assert!(matches!(result, Err(QaError::NoDocuments)));
        assert!(chat.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ask_without_documents_is_rejected() {
        let dir = tempdir().unwrap();
        let chat = Arc::new(EchoChat::default());
        let state = offline_state(dir.path(), Arc::clone(&chat));

        let result = state.ask("hello", &AskOptions::default(), false).await;

        assert!(matches!(result, Err(QaError::NoDocuments)));
        assert!(chat.requests.lock().unwrap().is_empty());
    }
}
