use crate::error::IngestError;
use lopdf::Document;
use std::io::Write;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based page number as stored in the PDF page tree.
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Writes the bytes to a temporary `.pdf` file and extracts its pages.
///
/// The temporary file is removed when it goes out of scope, on success and on
/// every error path alike.
pub fn extract_pages_from_bytes(
    extractor: &dyn PdfExtractor,
    bytes: &[u8],
) -> Result<Vec<PageText>, IngestError> {
    let mut staged = tempfile::Builder::new()
        .prefix("docchat-upload-")
        .suffix(".pdf")
        .tempfile()?;
    staged.write_all(bytes)?;
    staged.flush()?;

    debug!(path = %staged.path().display(), size = bytes.len(), "staged pdf upload");
    extractor.extract_pages(staged.path())
}
