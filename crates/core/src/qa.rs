use crate::config::Settings;
use crate::error::QaError;
use crate::models::{Chunk, ConversationMessage, Role, WireMessage};
use crate::traits::{ChatModel, CompletionRequest, PromptMessage, PromptRole, Retriever};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant that answers questions based on the provided context.

Use the context below to answer questions accurately and objectively.

Context: {context}

Rules:
- If the answer is in the context, give a clear and direct answer
- If the context does not contain enough information, say plainly that the information is not available
- Do not make up information that is not in the context
- Quote relevant passages from the context when appropriate
- Keep a professional and friendly tone
";

const CONTEXT_PLACEHOLDER: &str = "{context}";

/// Per-call overrides. Unset fields fall back to [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub history: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub answer: String,
    pub model: String,
    pub sources: Vec<String>,
}

pub fn format_context(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System prompt with context, then history in order, then the query.
pub fn build_messages(
    system_prompt: &str,
    context: &str,
    history: &[ConversationMessage],
    query: &str,
) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(PromptMessage::new(
        PromptRole::System,
        system_prompt.replace(CONTEXT_PLACEHOLDER, context),
    ));
    for message in history {
        let role = match message.role {
            Role::User => PromptRole::Human,
            Role::Assistant => PromptRole::Assistant,
        };
        messages.push(PromptMessage::new(role, message.content.clone()));
    }
    messages.push(PromptMessage::new(PromptRole::Human, query));
    messages
}

/// Converts raw history entries, dropping any with an unrecognised role.
pub fn history_from_wire(messages: &[WireMessage]) -> Vec<ConversationMessage> {
    messages
        .iter()
        .filter_map(|message| match Role::parse(&message.role) {
            Some(role) => Some(ConversationMessage {
                role,
                content: message.content.clone(),
            }),
            None => {
                debug!(role = %message.role, "dropping history entry with unknown role");
                None
            }
        })
        .collect()
}

pub struct QaService {
    chat: Arc<dyn ChatModel>,
    default_model: String,
    temperature: f32,
    retrieval_k: usize,
}

impl QaService {
    pub fn new(chat: Arc<dyn ChatModel>, settings: &Settings) -> Self {
        Self {
            chat,
            default_model: settings.default_model.clone(),
            temperature: settings.temperature,
            retrieval_k: settings.retrieval_k,
        }
    }

    pub fn model_for<'a>(&'a self, options: &'a AskOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.default_model)
    }

    pub async fn ask(
        &self,
        query: &str,
        retriever: Option<&dyn Retriever>,
        options: &AskOptions,
    ) -> Result<String, QaError> {
        let retriever = retriever.ok_or(QaError::NoDocuments)?;
        let chunks = retriever.retrieve(query, self.retrieval_k).await?;
        self.generate(query, &chunks, options).await
    }

    /// Like [`QaService::ask`], retrieving `k` chunks and returning their snippets.
    pub async fn ask_with_sources(
        &self,
        query: &str,
        retriever: Option<&dyn Retriever>,
        options: &AskOptions,
        k: usize,
    ) -> Result<Answer, QaError> {
        let retriever = retriever.ok_or(QaError::NoDocuments)?;
        let chunks = retriever.retrieve(query, k).await?;
        let answer = self.generate(query, &chunks, options).await?;

        Ok(Answer {
            answer,
            model: self.model_for(options).to_string(),
            sources: chunks.iter().map(Chunk::snippet).collect(),
        })
    }

    async fn generate(
        &self,
        query: &str,
        chunks: &[Chunk],
        options: &AskOptions,
    ) -> Result<String, QaError> {
        let system_prompt = options
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let request = CompletionRequest {
            model: self.model_for(options).to_string(),
            temperature: options.temperature.unwrap_or(self.temperature),
            messages: build_messages(
                system_prompt,
                &format_context(chunks),
                &options.history,
                query,
            ),
        };

        info!(
            model = %request.model,
            context_chunks = chunks.len(),
            history = options.history.len(),
            "answering question"
        );
        self.chat.complete(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{ChunkMetadata, DocumentKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChat {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingChat {
        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last(&self) -> CompletionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for RecordingChat {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, QaError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok("an answer".to_string())
        }
    }

    struct FixedRetriever {
        chunks: Vec<Chunk>,
        requested_k: Mutex<Option<usize>>,
    }

    impl FixedRetriever {
        fn new(texts: &[&str]) -> Self {
            let chunks = texts
                .iter()
                .enumerate()
                .map(|(index, text)| Chunk {
                    text: text.to_string(),
                    metadata: ChunkMetadata {
                        source: "guide.txt".to_string(),
                        document_id: "doc".to_string(),
                        kind: DocumentKind::Txt,
                        page: None,
                        chunk_index: index as u64,
                        section: None,
                    },
                })
                .collect();
            Self {
                chunks,
                requested_k: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<Chunk>, StoreError> {
            *self.requested_k.lock().unwrap() = Some(k);
            Ok(self.chunks.iter().take(k).cloned().collect())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(&self, _query: &str, _k: usize) -> Result<Vec<Chunk>, StoreError> {
            Err(StoreError::Corrupt("records unreadable".to_string()))
        }
    }

    fn service(chat: Arc<RecordingChat>) -> QaService {
        QaService::new(chat, &Settings::default())
    }

    #[test]
    fn messages_follow_system_history_query_order() {
        let history = vec![
            ConversationMessage::user("A"),
            ConversationMessage::assistant("B"),
        ];
        let messages = build_messages("ctx: {context}", "facts", &history, "C");

        let roles: Vec<PromptRole> = messages.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![
                PromptRole::System,
                PromptRole::Human,
                PromptRole::Assistant,
                PromptRole::Human
            ]
        );
        assert_eq!(messages[0].content, "ctx: facts");
        assert_eq!(messages[1].content, "A");
        assert_eq!(messages[2].content, "B");
        assert_eq!(messages[3].content, "C");
    }

    #[test]
    fn every_context_placeholder_is_filled() {
        let messages = build_messages("{context} / {context}", "X", &[], "q");
        assert_eq!(messages[0].content, "X / X");
    }

    #[test]
    fn unknown_wire_roles_are_dropped_in_order() {
        let wire = vec![
            WireMessage {
                role: "user".to_string(),
                content: "first".to_string(),
            },
            WireMessage {
                role: "system".to_string(),
                content: "ignored".to_string(),
            },
            WireMessage {
                role: "ai".to_string(),
                content: "second".to_string(),
            },
            WireMessage {
                role: "assistant".to_string(),
                content: "dropped".to_string(),
            },
        ];

        let history = history_from_wire(&wire);
        assert_eq!(
            history,
            vec![
                ConversationMessage::user("first"),
                ConversationMessage::assistant("second"),
            ]
        );
    }

    #[tokio::test]
    async fn asking_without_an_index_never_calls_the_model() {
        let chat = Arc::new(RecordingChat::default());
        let qa = service(Arc::clone(&chat));

        let result = qa.ask("anything", None, &AskOptions::default()).await;

        assert!(matches!(result, Err(QaError::NoDocuments)));
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn ask_uses_settings_defaults_and_joins_context() {
        let chat = Arc::new(RecordingChat::default());
        let qa = service(Arc::clone(&chat));
        let retriever = FixedRetriever::new(&["one", "two", "three", "four", "five"]);

        let answer = qa
            .ask("question", Some(&retriever), &AskOptions::default())
            .await
            .unwrap();

        assert_eq!(answer, "an answer");
        assert_eq!(*retriever.requested_k.lock().unwrap(), Some(4));
        let request = chat.last();
        assert_eq!(request.model, "gpt-3.5-turbo");
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert!(request.messages[0]
            .content
            .contains("Context: one\n\ntwo\n\nthree\n\nfour\n"));
    }

    #[tokio::test]
    async fn options_override_model_temperature_and_prompt() {
        let chat = Arc::new(RecordingChat::default());
        let qa = service(Arc::clone(&chat));
        let retriever = FixedRetriever::new(&["policy text"]);
        let options = AskOptions {
            model: Some("gpt-4o".to_string()),
            temperature: Some(0.1),
            system_prompt: Some("Only this: {context}".to_string()),
            history: vec![ConversationMessage::user("earlier")],
        };

        qa.ask("now", Some(&retriever), &options).await.unwrap();

        let request = chat.last();
        assert_eq!(request.model, "gpt-4o");
        assert!((request.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(request.messages[0].content, "Only this: policy text");
        assert_eq!(request.messages.len(), 3);
    }

    #[tokio::test]
    async fn sources_are_truncated_snippets_of_retrieved_chunks() {
        let chat = Arc::new(RecordingChat::default());
        let qa = service(chat);
        let long = "x".repeat(250);
        let retriever = FixedRetriever::new(&[long.as_str(), "short", "unused"]);

        let answer = qa
            .ask_with_sources("q", Some(&retriever), &AskOptions::default(), 2)
            .await
            .unwrap();

        assert_eq!(answer.model, "gpt-3.5-turbo");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[0], format!("{}...", "x".repeat(200)));
        assert_eq!(answer.sources[1], "short...");
    }

    #[tokio::test]
    async fn retrieval_failures_surface_as_retrieval_errors() {
        let chat = Arc::new(RecordingChat::default());
        let qa = service(Arc::clone(&chat));

        let result = qa
            .ask("q", Some(&FailingRetriever), &AskOptions::default())
            .await;

        assert!(matches!(result, Err(QaError::Retrieval(_))));
        assert_eq!(chat.calls(), 0);
    }
}
