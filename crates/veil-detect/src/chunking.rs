//! Sentence-aware text chunking for span-model input.
//!
//! Model calls are bounded to groups of whole sentences no longer than
//! [`MAX_GROUP_CHARS`] characters. Chunks are slices of the original text
//! and carry their absolute character offset, so span offsets returned by
//! the model translate exactly back into page coordinates.

/// Maximum characters per model input chunk.
pub const MAX_GROUP_CHARS: usize = 800;

/// A contiguous slice of the original text, with its absolute character
/// offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    /// Character offset of `text` within the full input.
    pub offset: usize,
}

/// A sentence with its character span in the paragraph it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sentence {
    start: usize,
    end: usize,
}

/// Splits a paragraph into sentences on terminal punctuation (`.`, `!`,
/// `?`) followed by whitespace. Offsets are character-based and relative
/// to the paragraph.
fn sentence_spans(paragraph: &[char]) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    let len = paragraph.len();
    while index < len {
        let c = paragraph[index];
        if matches!(c, '.' | '!' | '?') {
            let boundary = index + 1 >= len || paragraph[index + 1].is_whitespace();
            if boundary {
                sentences.push(Sentence { start, end: index + 1 });
                index += 1;
                while index < len && paragraph[index].is_whitespace() {
                    index += 1;
                }
                start = index;
                continue;
            }
        }
        index += 1;
    }
    if start < len {
        sentences.push(Sentence { start, end: len });
    }
    sentences
        .into_iter()
        .filter(|s| paragraph[s.start..s.end].iter().any(|c| !c.is_whitespace()))
        .collect()
}

/// Splits one oversized sentence into word-bounded chunks of at most
/// `max_chars` characters each.
fn chunk_long_sentence(
    chars: &[char],
    sentence: &Sentence,
    max_chars: usize,
    base_offset: usize,
    out: &mut Vec<TextChunk>,
) {
    let mut chunk_start = sentence.start;
    let mut last_space: Option<usize> = None;
    let mut index = sentence.start;
    while index < sentence.end {
        if chars[index].is_whitespace() {
            last_space = Some(index);
        }
        if index - chunk_start + 1 > max_chars {
            // Break at the last word boundary, or hard-split a single
            // overlong word.
            let split = match last_space {
                Some(space) if space > chunk_start => space,
                _ => index,
            };
            push_chunk(chars, chunk_start, split, base_offset, out);
            chunk_start = split;
            while chunk_start < sentence.end && chars[chunk_start].is_whitespace() {
                chunk_start += 1;
            }
            last_space = None;
            index = chunk_start;
            continue;
        }
        index += 1;
    }
    if chunk_start < sentence.end {
        push_chunk(chars, chunk_start, sentence.end, base_offset, out);
    }
}

fn push_chunk(chars: &[char], start: usize, end: usize, base_offset: usize, out: &mut Vec<TextChunk>) {
    let text: String = chars[start..end].iter().collect();
    if !text.trim().is_empty() {
        out.push(TextChunk {
            text,
            offset: base_offset + start,
        });
    }
}

/// Chunks `text` into model inputs: paragraphs split on newlines,
/// sentences grouped greedily up to `max_chars`, oversized sentences split
/// on word boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut paragraph_start = 0usize;

    for boundary in 0..=chars.len() {
        let at_newline = boundary == chars.len() || chars[boundary] == '\n';
        if !at_newline {
            continue;
        }
        let paragraph = &chars[paragraph_start..boundary];
        let base = paragraph_start;
        paragraph_start = boundary + 1;
        if paragraph.iter().all(|c| c.is_whitespace()) {
            continue;
        }

        let sentences = sentence_spans(paragraph);
        let mut group_start: Option<usize> = None;
        let mut group_end = 0usize;
        for sentence in &sentences {
            let length = sentence.end - sentence.start;
            if length > max_chars {
                if let Some(start) = group_start.take() {
                    push_chunk(paragraph, start, group_end, base, &mut chunks);
                }
                chunk_long_sentence(paragraph, sentence, max_chars, base, &mut chunks);
                continue;
            }
            match group_start {
                None => {
                    group_start = Some(sentence.start);
                    group_end = sentence.end;
                }
                Some(start) => {
                    if sentence.end - start > max_chars {
                        push_chunk(paragraph, start, group_end, base, &mut chunks);
                        group_start = Some(sentence.start);
                        group_end = sentence.end;
                    } else {
                        group_end = sentence.end;
                    }
                }
            }
        }
        if let Some(start) = group_start {
            push_chunk(paragraph, start, group_end, base, &mut chunks);
        }
    }

    chunks
}
