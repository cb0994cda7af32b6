use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in PDF points.
///
/// Coordinates follow the PDF convention: origin bottom-left, `x0 < x1` and
/// `y0 < y1` for any non-degenerate box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Smallest rectangle covering both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Union over a non-empty set of boxes. Returns `None` for an empty set.
    pub fn union_all<'a, I: IntoIterator<Item = &'a BoundingBox>>(boxes: I) -> Option<BoundingBox> {
        let mut iter = boxes.into_iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, b| acc.union(b)))
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// One detected sensitive region on a page, ready to drive redaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveSpan {
    pub entity_type: String,
    pub score: f64,
    pub bbox: BoundingBox,
    /// Character offsets into the page's reconstructed full text.
    pub start: usize,
    pub end: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
}

/// All sensitive regions found on one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRedaction {
    /// 1-based page number.
    pub page: u32,
    pub sensitive: Vec<SensitiveSpan>,
}

/// Per-page redaction plan for a whole document, ordered by page number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionMapping {
    pub pages: Vec<PageRedaction>,
}

impl RedactionMapping {
    /// Sorts pages ascending and, within each page, spans by start offset
    /// then entity type so merged mappings are deterministic.
    pub fn normalize(&mut self) {
        self.pages.sort_by_key(|p| p.page);
        for page in &mut self.pages {
            page.sensitive
                .sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.entity_type.cmp(&b.entity_type)));
        }
    }

    pub fn total_spans(&self) -> usize {
        self.pages.iter().map(|p| p.sensitive.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_union() {
        let a = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        let b = BoundingBox::new(15.0, 5.0, 30.0, 18.0);
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(10.0, 5.0, 30.0, 20.0));
    }

    #[test]
    fn test_bbox_union_all_empty() {
        assert!(BoundingBox::union_all([].iter()).is_none());
    }

    #[test]
    fn test_mapping_normalize_orders_pages_and_spans() {
        let span = |start: usize, ty: &str| SensitiveSpan {
            entity_type: ty.to_string(),
            score: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            start,
            end: start + 1,
            original_text: None,
        };
        let mut mapping = RedactionMapping {
            pages: vec![
                PageRedaction {
                    page: 3,
                    sensitive: vec![span(5, "EMAIL"), span(5, "PERSON"), span(1, "PHONE")],
                },
                PageRedaction {
                    page: 1,
                    sensitive: vec![],
                },
            ],
        };
        mapping.normalize();
        assert_eq!(mapping.pages[0].page, 1);
        assert_eq!(mapping.pages[1].page, 3);
        let types: Vec<_> = mapping.pages[1]
            .sensitive
            .iter()
            .map(|s| (s.start, s.entity_type.as_str()))
            .collect();
        assert_eq!(types, vec![(1, "PHONE"), (5, "EMAIL"), (5, "PERSON")]);
    }
}
