use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use lopdf::content::Content;
use lopdf::{Document, Object};
use tracing::{info, warn};
use veil_sync::{LockManager, LockPriority, TimeoutLock};
use veil_types::{BoundingBox, RedactionMapping, VeilError};

use crate::config::PdfConfig;
use crate::content::{rect_fill_operations, strip_text_operators};
use crate::extractor::PageImage;

/// Info-dictionary keys cleared on every redacted document.
const SCRUBBED_INFO_KEYS: [&[u8]; 6] = [
    b"Title",
    b"Author",
    b"Subject",
    b"Keywords",
    b"Creator",
    b"Producer",
];

/// Applies a redaction mapping to a PDF: removes the text operators that
/// show redacted strings, paints opaque rectangles over the sensitive
/// boxes, and scrubs identifying document metadata. Byte and file outputs
/// share one serialization path, so both are scrubbed identically.
pub struct PdfRedactor {
    document: StdMutex<Document>,
    instance_lock: TimeoutLock,
}

impl PdfRedactor {
    pub fn from_bytes(
        data: &[u8],
        config: &PdfConfig,
        lock_manager: Arc<LockManager>,
    ) -> veil_types::Result<Self> {
        if !data.starts_with(b"%PDF-") {
            return Err(VeilError::pdf("invalid PDF header, missing %PDF- signature"));
        }
        let document = Document::load_mem(data)
            .map_err(|e| VeilError::pdf(format!("failed to load PDF document: {e}")))?;
        let instance_lock = TimeoutLock::new_instance(
            "pdf_redactor",
            LockPriority::Medium,
            config.lock_timeout,
            lock_manager,
        );
        Ok(Self {
            document: StdMutex::new(document),
            instance_lock,
        })
    }

    /// Redacts and returns the rewritten document as bytes.
    ///
    /// `image_boxes` lists additional per-page image regions to mask (from
    /// [`crate::PdfExtractor::images_on_page`]) when image redaction was
    /// requested.
    pub async fn apply(
        &self,
        mapping: &RedactionMapping,
        image_boxes: &[(u32, Vec<PageImage>)],
    ) -> veil_types::Result<Vec<u8>> {
        let Some(_guard) = self.instance_lock.acquire(None).await else {
            return Err(VeilError::LockTimeout {
                name: "pdf_redactor".to_string(),
                timeout_secs: 60,
            });
        };

        let mut mapping = mapping.clone();
        mapping.normalize();

        let mut document = self.document.lock().expect("document mutex poisoned");
        let pages = document.get_pages();
        let mut masked_regions = 0usize;
        let mut removed_operators = 0usize;

        for page_redaction in &mapping.pages {
            let Some(page_id) = pages.get(&page_redaction.page).copied() else {
                warn!(page = page_redaction.page, "Redaction mapping names a missing page");
                continue;
            };
            if page_redaction.sensitive.is_empty() {
                continue;
            }

            let raw = match document.get_page_content(page_id) {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(page = page_redaction.page, error = %error, "Page content unavailable, skipping");
                    continue;
                }
            };
            let content = match Content::decode(&raw) {
                Ok(content) => content,
                Err(error) => {
                    warn!(page = page_redaction.page, error = %error, "Content stream undecodable, skipping");
                    continue;
                }
            };

            let targets: Vec<String> = page_redaction
                .sensitive
                .iter()
                .filter_map(|s| s.original_text.clone())
                .filter(|t| !t.trim().is_empty())
                .collect();
            let (mut stripped, removed) = strip_text_operators(&content, &targets);
            removed_operators += removed;

            let mut boxes: Vec<BoundingBox> =
                page_redaction.sensitive.iter().map(|s| s.bbox).collect();
            if let Some((_, images)) = image_boxes
                .iter()
                .find(|(page, _)| *page == page_redaction.page)
            {
                boxes.extend(images.iter().map(|i| i.bbox));
            }
            stripped.operations.extend(rect_fill_operations(&boxes));
            masked_regions += boxes.len();

            let encoded = stripped
                .encode()
                .map_err(|e| VeilError::pdf(format!("content re-encode failed: {e}")))?;
            document
                .change_page_content(page_id, encoded)
                .map_err(|e| VeilError::pdf(format!("page rewrite failed: {e}")))?;
        }

        scrub_info_dictionary(&mut document);

        let mut output = Vec::new();
        document
            .save_to(&mut output)
            .map_err(|e| VeilError::pdf(format!("document serialization failed: {e}")))?;

        info!(
            pages = mapping.pages.len(),
            masked_regions,
            removed_operators,
            bytes = output.len(),
            "Redaction applied"
        );
        Ok(output)
    }

    /// Redacts and writes the document to `path`; same pipeline as
    /// [`Self::apply`].
    pub async fn apply_to_file(
        &self,
        mapping: &RedactionMapping,
        image_boxes: &[(u32, Vec<PageImage>)],
        path: &Path,
    ) -> veil_types::Result<()> {
        let bytes = self.apply(mapping, image_boxes).await?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| VeilError::pdf(format!("writing redacted file failed: {e}")))
    }
}

fn scrub_info_dictionary(document: &mut Document) {
    let info_id = match document.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };
    if let Some(id) = info_id {
        if let Ok(object) = document.get_object_mut(id) {
            if let Ok(dict) = object.as_dict_mut() {
                for key in SCRUBBED_INFO_KEYS {
                    if dict.has(key) {
                        dict.set(key, Object::string_literal(""));
                    }
                }
            }
        }
    }
}
