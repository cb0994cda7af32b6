//! Norwegian pronoun filtering.
//!
//! Span models tuned for Norwegian text routinely tag bare pronouns as
//! person names. Any person-typed entity whose text consists only of known
//! pronouns is dropped before results leave the engine.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use veil_types::Entity;

/// Entity types subject to the pronoun filter.
const PERSON_TYPES: [&str; 3] = ["person", "per", "person-h"];

static NORWEGIAN_PRONOUNS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "jeg", "du", "han", "hun", "vi", "dere", "de",
        "meg", "deg", "ham", "henne", "den", "det", "oss", "dem",
        "min", "mi", "mitt", "mine", "din", "di", "ditt", "dine",
        "hans", "hennes", "dens", "dets", "vår", "vårt", "våre",
        "deres", "sin", "si", "sitt", "sine",
        "seg", "selv",
        "denne", "dette", "disse",
        "hvem", "hva", "hvilken", "hvilket", "hvilke",
        "noen", "noe", "ingen", "ingenting", "alle", "enhver", "ethvert",
        "hver", "hvert", "som",
    ]
    .into_iter()
    .collect()
});

fn is_person_type(entity_type: &str) -> bool {
    PERSON_TYPES.contains(&entity_type.to_ascii_lowercase().as_str())
}

fn is_pronoun_only(text: &str) -> bool {
    let mut tokens = text.split_whitespace().peekable();
    if tokens.peek().is_none() {
        return false;
    }
    tokens.all(|token| NORWEGIAN_PRONOUNS.contains(token.to_lowercase().as_str()))
}

/// Drops person-typed entities whose trimmed text is nothing but
/// Norwegian pronouns. Other entity types pass through untouched.
pub fn filter_pronoun_false_positives(entities: Vec<Entity>) -> Vec<Entity> {
    entities
        .into_iter()
        .filter(|entity| {
            !(is_person_type(&entity.entity_type) && is_pronoun_only(entity.original_text.trim()))
        })
        .collect()
}
