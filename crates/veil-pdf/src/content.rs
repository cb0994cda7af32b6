//! Content-stream level text handling.
//!
//! Positions come from walking the page's operator stream and tracking the
//! text matrix; glyph widths are estimated from the active font size. The
//! resulting boxes are approximate but consistent between extraction and
//! redaction, which is what coordinate-driven masking needs.

use lopdf::content::{Content, Operation};
use lopdf::Object;
use veil_types::{BoundingBox, Word};

/// Average glyph advance as a fraction of the font size. Monospace-ish
/// estimate; matches what the redactor uses so boxes line up.
const AVG_GLYPH_WIDTH_FACTOR: f64 = 0.5;

/// A run of text shown by one operator, positioned at its baseline origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub font_size: f64,
}

#[derive(Debug, Clone)]
struct TextState {
    x: f64,
    y: f64,
    line_x: f64,
    line_y: f64,
    font_size: f64,
    leading: f64,
    in_text: bool,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            line_x: 0.0,
            line_y: 0.0,
            font_size: 12.0,
            leading: 0.0,
            in_text: false,
        }
    }
}

/// Numeric operand as f64, for integer and real objects alike.
pub fn as_number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Decodes a PDF string object's bytes: UTF-16BE when BOM-prefixed,
/// otherwise byte-per-char (covers ASCII and Latin-1 literals).
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn estimated_advance(text: &str, font_size: f64) -> f64 {
    text.chars().count() as f64 * font_size * AVG_GLYPH_WIDTH_FACTOR
}

/// Walks the operator stream and yields every shown text run with its
/// position. Rotation and shear in text matrices are ignored; only the
/// translation and the font size feed the geometry.
pub fn positioned_fragments(content: &Content) -> Vec<Fragment> {
    let mut state = TextState::default();
    let mut fragments = Vec::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "BT" => {
                state = TextState {
                    font_size: state.font_size,
                    leading: state.leading,
                    in_text: true,
                    ..TextState::default()
                };
            }
            "ET" => state.in_text = false,
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(as_number) {
                    state.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = op.operands.first().and_then(as_number) {
                    state.leading = leading;
                }
            }
            "Tm" => {
                if op.operands.len() >= 6 {
                    if let (Some(e), Some(f)) =
                        (as_number(&op.operands[4]), as_number(&op.operands[5]))
                    {
                        state.x = e;
                        state.y = f;
                        state.line_x = e;
                        state.line_y = f;
                    }
                }
            }
            "Td" | "TD" => {
                if let (Some(tx), Some(ty)) = (
                    op.operands.first().and_then(as_number),
                    op.operands.get(1).and_then(as_number),
                ) {
                    state.line_x += tx;
                    state.line_y += ty;
                    state.x = state.line_x;
                    state.y = state.line_y;
                    if op.operator == "TD" {
                        state.leading = -ty;
                    }
                }
            }
            "T*" => {
                state.line_y -= state.leading;
                state.x = state.line_x;
                state.y = state.line_y;
            }
            "Tj" => {
                if state.in_text {
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        show_text(&mut state, &decode_pdf_string(bytes), &mut fragments);
                    }
                }
            }
            "'" => {
                if state.in_text {
                    state.line_y -= state.leading;
                    state.x = state.line_x;
                    state.y = state.line_y;
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        show_text(&mut state, &decode_pdf_string(bytes), &mut fragments);
                    }
                }
            }
            "\"" => {
                if state.in_text {
                    state.line_y -= state.leading;
                    state.x = state.line_x;
                    state.y = state.line_y;
                    if let Some(Object::String(bytes, _)) = op.operands.get(2) {
                        show_text(&mut state, &decode_pdf_string(bytes), &mut fragments);
                    }
                }
            }
            "TJ" => {
                if state.in_text {
                    if let Some(Object::Array(elements)) = op.operands.first() {
                        for element in elements {
                            match element {
                                Object::String(bytes, _) => {
                                    show_text(
                                        &mut state,
                                        &decode_pdf_string(bytes),
                                        &mut fragments,
                                    );
                                }
                                other => {
                                    if let Some(adjust) = as_number(other) {
                                        // TJ numbers subtract thousandths of
                                        // the font size from the advance.
                                        state.x -= adjust / 1000.0 * state.font_size;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fragments
}

fn show_text(state: &mut TextState, text: &str, fragments: &mut Vec<Fragment>) {
    if !text.is_empty() {
        fragments.push(Fragment {
            text: text.to_string(),
            x: state.x,
            y: state.y,
            font_size: state.font_size,
        });
        state.x += estimated_advance(text, state.font_size);
    }
}

/// Splits fragments into whitespace-delimited words, giving each word the
/// slice of the fragment's box its characters occupy. Words that trim to
/// nothing are discarded.
pub fn words_from_fragments(fragments: &[Fragment]) -> Vec<Word> {
    let mut words = Vec::new();
    for fragment in fragments {
        let char_width = fragment.font_size * AVG_GLYPH_WIDTH_FACTOR;
        let chars: Vec<char> = fragment.text.chars().collect();
        let mut start: Option<usize> = None;
        for index in 0..=chars.len() {
            let boundary = index == chars.len() || chars[index].is_whitespace();
            match (start, boundary) {
                (None, false) => start = Some(index),
                (Some(from), true) => {
                    let text: String = chars[from..index].iter().collect();
                    if !text.trim().is_empty() {
                        words.push(Word::new(
                            text,
                            BoundingBox::new(
                                fragment.x + from as f64 * char_width,
                                fragment.y,
                                fragment.x + index as f64 * char_width,
                                fragment.y + fragment.font_size,
                            ),
                        ));
                    }
                    start = None;
                }
                _ => {}
            }
        }
    }
    words
}

/// Returns a copy of the content with every text-showing operator whose
/// decoded text contains any of `targets` removed.
pub fn strip_text_operators(content: &Content, targets: &[String]) -> (Content, usize) {
    if targets.is_empty() {
        return (content.clone(), 0);
    }
    let mut removed = 0;
    let operations = content
        .operations
        .iter()
        .filter(|op| {
            let shown = shown_text(op);
            match shown {
                Some(text) if targets.iter().any(|t| !t.is_empty() && text.contains(t)) => {
                    removed += 1;
                    false
                }
                _ => true,
            }
        })
        .cloned()
        .collect();
    (Content { operations }, removed)
}

fn shown_text(op: &Operation) -> Option<String> {
    match op.operator.as_str() {
        "Tj" | "'" => match op.operands.first() {
            Some(Object::String(bytes, _)) => Some(decode_pdf_string(bytes)),
            _ => None,
        },
        "\"" => match op.operands.get(2) {
            Some(Object::String(bytes, _)) => Some(decode_pdf_string(bytes)),
            _ => None,
        },
        "TJ" => match op.operands.first() {
            Some(Object::Array(elements)) => {
                let mut text = String::new();
                for element in elements {
                    if let Object::String(bytes, _) = element {
                        text.push_str(&decode_pdf_string(bytes));
                    }
                }
                Some(text)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Opaque black rectangles covering the given boxes, wrapped in their own
/// graphics state.
pub fn rect_fill_operations(boxes: &[BoundingBox]) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(boxes.len() * 4 + 2);
    ops.push(Operation::new("q", vec![]));
    ops.push(Operation::new(
        "rg",
        vec![Object::Integer(0), Object::Integer(0), Object::Integer(0)],
    ));
    for b in boxes {
        ops.push(Operation::new(
            "re",
            vec![
                Object::Real(b.x0 as f32),
                Object::Real(b.y0 as f32),
                Object::Real(b.width() as f32),
                Object::Real(b.height() as f32),
            ],
        ));
        ops.push(Operation::new("f", vec![]));
    }
    ops.push(Operation::new("Q", vec![]));
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_stream(ops: Vec<Operation>) -> Content {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
            ),
        ];
        operations.extend(ops);
        operations.push(Operation::new("ET", vec![]));
        Content { operations }
    }

    fn show_at(x: i64, y: i64, text: &str) -> Vec<Operation> {
        vec![
            Operation::new(
                "Tm",
                vec![
                    Object::Integer(1),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(1),
                    Object::Integer(x),
                    Object::Integer(y),
                ],
            ),
            Operation::new("Tj", vec![Object::string_literal(text)]),
        ]
    }

    #[test]
    fn test_fragments_track_text_matrix() {
        let content = text_stream(show_at(100, 700, "Hello world"));
        let fragments = positioned_fragments(&content);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "Hello world");
        assert_eq!(fragments[0].x, 100.0);
        assert_eq!(fragments[0].y, 700.0);
        assert_eq!(fragments[0].font_size, 12.0);
    }

    #[test]
    fn test_td_moves_lines() {
        let content = text_stream(vec![
            Operation::new("Td", vec![Object::Integer(50), Object::Integer(600)]),
            Operation::new("Tj", vec![Object::string_literal("first")]),
            Operation::new("Td", vec![Object::Integer(0), Object::Integer(-20)]),
            Operation::new("Tj", vec![Object::string_literal("second")]),
        ]);
        let fragments = positioned_fragments(&content);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].y, 600.0);
        assert_eq!(fragments[1].y, 580.0);
        assert_eq!(fragments[1].x, 50.0);
    }

    #[test]
    fn test_tj_array_concatenates_with_kerning() {
        let content = text_stream(vec![
            Operation::new("Tm", vec![Object::Integer(1), Object::Integer(0), Object::Integer(0), Object::Integer(1), Object::Integer(10), Object::Integer(10)]),
            Operation::new(
                "TJ",
                vec![Object::Array(vec![
                    Object::string_literal("Se"),
                    Object::Integer(-100),
                    Object::string_literal("cret"),
                ])],
            ),
        ]);
        let fragments = positioned_fragments(&content);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].text, "Se");
        assert_eq!(fragments[1].text, "cret");
        // Kerning widens the gap beyond the plain advance.
        assert!(fragments[1].x > fragments[0].x);
    }

    #[test]
    fn test_words_split_with_proportional_boxes() {
        let content = text_stream(show_at(100, 700, "John lives"));
        let words = words_from_fragments(&positioned_fragments(&content));
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "John");
        assert_eq!(words[1].text, "lives");
        assert_eq!(words[0].bbox.x0, 100.0);
        // "lives" starts after "John " (5 chars at 6pt each).
        assert_eq!(words[1].bbox.x0, 130.0);
        assert_eq!(words[0].bbox.y1 - words[0].bbox.y0, 12.0);
        assert!(words[0].bbox.x1 <= words[1].bbox.x0);
    }

    #[test]
    fn test_strip_removes_matching_operators_only() {
        let mut ops = show_at(100, 700, "public line");
        ops.extend(show_at(100, 650, "the secret line"));
        let content = text_stream(ops);

        let (stripped, removed) = strip_text_operators(&content, &["secret".to_string()]);
        assert_eq!(removed, 1);
        let remaining_text: Vec<String> = positioned_fragments(&stripped)
            .into_iter()
            .map(|f| f.text)
            .collect();
        assert_eq!(remaining_text, vec!["public line".to_string()]);
    }

    #[test]
    fn test_strip_matches_inside_tj_arrays() {
        let content = text_stream(vec![Operation::new(
            "TJ",
            vec![Object::Array(vec![
                Object::string_literal("sec"),
                Object::Integer(-10),
                Object::string_literal("ret"),
            ])],
        )]);
        let (stripped, removed) = strip_text_operators(&content, &["secret".to_string()]);
        assert_eq!(removed, 1);
        assert!(positioned_fragments(&stripped).is_empty());
    }

    #[test]
    fn test_rect_fill_operations_shape() {
        let ops = rect_fill_operations(&[BoundingBox::new(100.0, 100.0, 250.0, 120.0)]);
        let names: Vec<&str> = ops.iter().map(|o| o.operator.as_str()).collect();
        assert_eq!(names, vec!["q", "rg", "re", "f", "Q"]);
    }

    #[test]
    fn test_decode_utf16_string() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in "Navn".encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_pdf_string(&bytes), "Navn");
    }
}
