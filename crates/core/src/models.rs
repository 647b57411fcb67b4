use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Txt,
    Markdown,
}

impl DocumentKind {
    /// Resolves the kind from the text after the last `.` of a file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, extension) = name.rsplit_once('.')?;
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pdf => "pdf",
            Self::Txt => "txt",
            Self::Markdown => "markdown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub document_id: String,
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub chunk_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// First 200 characters followed by an ellipsis, for citation display.
    pub fn snippet(&self) -> String {
        const SNIPPET_CHARS: usize = 200;
        let head: String = self.text.chars().take(SNIPPET_CHARS).collect();
        format!("{head}...")
    }
}

/// A file as received from a front-end: a name and its raw bytes.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn kind(&self) -> Option<DocumentKind> {
        DocumentKind::from_file_name(&self.name)
    }

    /// Upload endpoints take only names ending in lower-case `.pdf`.
    pub fn has_pdf_suffix(&self) -> bool {
        self.name.ends_with(".pdf")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DocumentStats {
    pub total_chunks: usize,
    pub total_characters: usize,
    pub avg_chunk_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "ai")]
    Assistant,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "ai" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// History entry as it arrives over the wire, before role validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl From<&ConversationMessage> for WireMessage {
    fn from(message: &ConversationMessage) -> Self {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "ai",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

/// Document count reported by index introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentCount {
    Known(usize),
    Unknown,
}

impl Serialize for DocumentCount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Known(count) => serializer.serialize_u64(*count as u64),
            Self::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for DocumentCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Label(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(count) => Ok(Self::Known(count as usize)),
            Raw::Label(_) => Ok(Self::Unknown),
        }
    }
}

impl fmt::Display for DocumentCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(count) => write!(f, "{count}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorStoreStats {
    pub exists: bool,
    pub total_documents: DocumentCount,
    pub persist_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_resolve_from_last_extension() {
        assert_eq!(DocumentKind::from_file_name("a.PDF"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_file_name("notes.v2.md"), Some(DocumentKind::Markdown));
        assert_eq!(DocumentKind::from_file_name("x.markdown"), Some(DocumentKind::Markdown));
        assert_eq!(DocumentKind::from_file_name("x.txt"), Some(DocumentKind::Txt));
        assert_eq!(DocumentKind::from_file_name("image.png"), None);
        assert_eq!(DocumentKind::from_file_name("README"), None);
    }

    #[test]
    fn snippet_truncates_by_characters() {
        let chunk = Chunk {
            text: "é".repeat(300),
            metadata: ChunkMetadata {
                source: "a.txt".to_string(),
                document_id: "doc".to_string(),
                kind: DocumentKind::Txt,
                page: None,
                chunk_index: 0,
                section: None,
            },
        };
        let snippet = chunk.snippet();
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.chars().count(), 203);
    }

    #[test]
    fn roles_use_wire_names() {
        let message = ConversationMessage::assistant("hi");
        let json = serde_json::to_string(&message).expect("serialize");
        assert_eq!(json, r#"{"role":"ai","content":"hi"}"#);

        let parsed: ConversationMessage =
            serde_json::from_str(r#"{"role":"ai","content":"x"}"#).expect("ai role");
        assert_eq!(parsed.role, Role::Assistant);
        let rejected =
            serde_json::from_str::<ConversationMessage>(r#"{"role":"assistant","content":"x"}"#);
        assert!(rejected.is_err());
        assert_eq!(Role::parse("assistant"), None);
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn unknown_document_count_serializes_as_label() {
        let stats = VectorStoreStats {
            exists: true,
            total_documents: DocumentCount::Unknown,
            persist_directory: "db".to_string(),
            error: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&stats).expect("serialize");
        assert_eq!(value["total_documents"], "unknown");

        let back: VectorStoreStats = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.total_documents, DocumentCount::Unknown);
    }
}
