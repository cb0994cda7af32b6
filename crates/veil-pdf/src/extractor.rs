use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use veil_compliance::{sanitize_document_metadata, SanitizeOptions};
use veil_sync::{LockManager, LockPriority, TimeoutLock};
use veil_types::{BoundingBox, ExtractedData, Page};

use crate::config::PdfConfig;
use crate::content::{positioned_fragments, words_from_fragments};

/// An image placement on a page: the XObject reference plus the box its
/// unit square maps to under the current transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    pub xref: String,
    pub bbox: BoundingBox,
}

/// Positional text extractor for one PDF document.
///
/// The document handle is owned by the extractor and all work runs under
/// its instance lock, so a given document is never processed by two tasks
/// concurrently.
pub struct PdfExtractor {
    document: Document,
    config: PdfConfig,
    instance_lock: TimeoutLock,
}

impl PdfExtractor {
    pub fn from_bytes(
        data: &[u8],
        config: PdfConfig,
        lock_manager: Arc<LockManager>,
    ) -> veil_types::Result<Self> {
        if data.len() < 10 {
            return Err(veil_types::VeilError::pdf(
                "PDF data too small (minimum 10 bytes required)",
            ));
        }
        if !data.starts_with(b"%PDF-") {
            return Err(veil_types::VeilError::pdf(
                "invalid PDF header, missing %PDF- signature",
            ));
        }
        if data.len() as u64 > config.max_size_bytes {
            return Err(veil_types::VeilError::validation(format!(
                "PDF exceeds the {} byte limit",
                config.max_size_bytes
            )));
        }
        let document = Document::load_mem(data)
            .map_err(|e| veil_types::VeilError::pdf(format!("failed to load PDF document: {e}")))?;
        Ok(Self::new(document, config, lock_manager))
    }

    pub fn from_file(
        path: &Path,
        config: PdfConfig,
        lock_manager: Arc<LockManager>,
    ) -> veil_types::Result<Self> {
        let document = Document::load(path)
            .map_err(|e| veil_types::VeilError::pdf(format!("failed to load PDF file: {e}")))?;
        Ok(Self::new(document, config, lock_manager))
    }

    fn new(document: Document, config: PdfConfig, lock_manager: Arc<LockManager>) -> Self {
        let instance_lock = TimeoutLock::new_instance(
            "pdf_extractor",
            LockPriority::Medium,
            config.lock_timeout,
            lock_manager,
        );
        Self {
            document,
            config,
            instance_lock,
        }
    }

    /// Extracts positional text for every page.
    ///
    /// Large documents are processed in page batches; a batch that exceeds
    /// its time budget is abandoned (its remaining pages become empty
    /// pages) and extraction continues with the next batch. Failure to take
    /// the instance lock yields a structured timeout result instead of an
    /// error.
    pub async fn extract_text(&self) -> ExtractedData {
        let Some(_guard) = self.instance_lock.acquire(None).await else {
            warn!("Extraction lock acquisition timed out");
            return ExtractedData {
                error: Some("document busy: extraction lock timed out".to_string()),
                timeout: true,
                ..ExtractedData::default()
            };
        };

        let started = Instant::now();
        let page_ids: Vec<(u32, ObjectId)> = self.document.get_pages().into_iter().collect();
        let total = page_ids.len();

        let mut pages: Vec<Page> = Vec::new();
        let mut empty_pages: Vec<u32> = Vec::new();

        let batch_size = if total > self.config.batch_threshold {
            self.config.page_batch_size
        } else {
            total.max(1)
        };

        for batch in page_ids.chunks(batch_size) {
            let batch_started = Instant::now();
            for (index, (page_number, page_id)) in batch.iter().enumerate() {
                if batch_started.elapsed() > self.config.batch_time_budget {
                    warn!(
                        page = page_number,
                        elapsed_ms = batch_started.elapsed().as_millis() as u64,
                        "Batch time budget exhausted, abandoning remaining pages in batch"
                    );
                    for (skipped, _) in &batch[index..] {
                        empty_pages.push(*skipped);
                    }
                    break;
                }
                let page_started = Instant::now();
                match self.extract_page(*page_number, *page_id) {
                    Ok(page) if !page.words.is_empty() => pages.push(page),
                    Ok(_) => empty_pages.push(*page_number),
                    Err(error) => {
                        warn!(page = page_number, error = %error, "Page extraction failed");
                        empty_pages.push(*page_number);
                    }
                }
                if page_started.elapsed() > self.config.page_time_budget {
                    warn!(
                        page = page_number,
                        elapsed_ms = page_started.elapsed().as_millis() as u64,
                        "Page exceeded its time budget"
                    );
                }
            }
        }

        empty_pages.sort_unstable();
        let content_pages = pages.len();
        info!(
            total_pages = total,
            content_pages,
            empty_pages = empty_pages.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extraction complete"
        );

        ExtractedData {
            pages,
            empty_pages,
            content_pages,
            total_document_pages: total,
            metadata: self.sanitized_metadata(total),
            error: None,
            timeout: false,
        }
    }

    fn extract_page(&self, page_number: u32, page_id: ObjectId) -> veil_types::Result<Page> {
        let raw = self
            .document
            .get_page_content(page_id)
            .map_err(|e| veil_types::VeilError::pdf(format!("page content unavailable: {e}")))?;
        let content = Content::decode(&raw)
            .map_err(|e| veil_types::VeilError::pdf(format!("content stream undecodable: {e}")))?;
        let words = words_from_fragments(&positioned_fragments(&content));
        debug!(page = page_number, words = words.len(), "Page extracted");
        Ok(Page {
            page: page_number,
            words,
            error: None,
        })
    }

    fn sanitized_metadata(&self, page_count: usize) -> BTreeMap<String, serde_json::Value> {
        let mut metadata = BTreeMap::new();
        if let Some(info) = self.info_dictionary() {
            for (key, label) in [
                (b"Title".as_slice(), "title"),
                (b"Author".as_slice(), "author"),
                (b"Subject".as_slice(), "subject"),
                (b"Keywords".as_slice(), "keywords"),
                (b"Creator".as_slice(), "creator"),
                (b"Producer".as_slice(), "producer"),
                (b"CreationDate".as_slice(), "creation_date"),
                (b"ModDate".as_slice(), "modification_date"),
            ] {
                if let Ok(Object::String(bytes, _)) = info.get(key) {
                    metadata.insert(
                        label.to_string(),
                        serde_json::Value::String(crate::content::decode_pdf_string(bytes)),
                    );
                }
            }
        }
        metadata.insert("page_count".to_string(), serde_json::json!(page_count));
        metadata.insert(
            "pdf_version".to_string(),
            serde_json::json!(self.document.version.clone()),
        );
        metadata.insert(
            "encrypted".to_string(),
            serde_json::json!(self.document.is_encrypted()),
        );
        sanitize_document_metadata(
            metadata,
            &SanitizeOptions {
                preserve_fields: vec![
                    "page_count".to_string(),
                    "pdf_version".to_string(),
                    "encrypted".to_string(),
                ],
                apply_patterns: true,
            },
        )
    }

    fn info_dictionary(&self) -> Option<&Dictionary> {
        match self.document.trailer.get(b"Info").ok()? {
            Object::Reference(id) => self.document.get_object(*id).ok()?.as_dict().ok(),
            Object::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    /// Lists image placements on one page: each image XObject drawn by a
    /// `Do` operator, with the box its unit square maps to under the
    /// accumulated transform (rotation ignored).
    pub fn images_on_page(&self, page_number: u32) -> Vec<PageImage> {
        let pages = self.document.get_pages();
        let Some(page_id) = pages.get(&page_number).copied() else {
            return Vec::new();
        };
        let Ok(raw) = self.document.get_page_content(page_id) else {
            return Vec::new();
        };
        let Ok(content) = Content::decode(&raw) else {
            return Vec::new();
        };

        // Simplified CTM: scale + translation only, as (sx, sy, tx, ty).
        let mut ctm = (1.0f64, 1.0f64, 0.0f64, 0.0f64);
        let mut stack: Vec<(f64, f64, f64, f64)> = Vec::new();
        let mut images = Vec::new();

        for op in &content.operations {
            match op.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => {
                    if let Some(prev) = stack.pop() {
                        ctm = prev;
                    }
                }
                "cm" => {
                    if op.operands.len() >= 6 {
                        let nums: Vec<f64> = op
                            .operands
                            .iter()
                            .take(6)
                            .filter_map(crate::content::as_number)
                            .collect();
                        if nums.len() == 6 {
                            let (sx, sy, tx, ty) = ctm;
                            ctm = (
                                sx * nums[0],
                                sy * nums[3],
                                tx + nums[4] * sx,
                                ty + nums[5] * sy,
                            );
                        }
                    }
                }
                "Do" => {
                    if let Some(Object::Name(name)) = op.operands.first() {
                        if let Some(xref) = self.image_xobject_ref(page_id, name) {
                            let (sx, sy, tx, ty) = ctm;
                            images.push(PageImage {
                                xref,
                                bbox: BoundingBox::new(
                                    tx.min(tx + sx),
                                    ty.min(ty + sy),
                                    tx.max(tx + sx),
                                    ty.max(ty + sy),
                                ),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        images
    }

    fn image_xobject_ref(&self, page_id: ObjectId, name: &[u8]) -> Option<String> {
        let (resources, resource_ids) = self.document.get_page_resources(page_id).ok()?;
        let resources: &Dictionary = match resources {
            Some(dict) => dict,
            None => self
                .document
                .get_object(*resource_ids.first()?)
                .ok()?
                .as_dict()
                .ok()?,
        };
        let xobjects = match resources.get(b"XObject").ok()? {
            Object::Dictionary(dict) => dict,
            Object::Reference(id) => self.document.get_object(*id).ok()?.as_dict().ok()?,
            _ => return None,
        };
        let id = match xobjects.get(name).ok()? {
            Object::Reference(id) => *id,
            _ => return None,
        };
        let stream = self.document.get_object(id).ok()?.as_stream().ok()?;
        match stream.dict.get(b"Subtype").ok()? {
            Object::Name(subtype) if subtype == b"Image" => Some(format!("{} {} R", id.0, id.1)),
            _ => None,
        }
    }
}
