//! Instructions sent with each work unit.
//!
//! Keeping every prompt here means changing what gets extracted is a one-file
//! edit, and tests can inspect prompts without a live model.
//!
//! Callers can override the default via
//! [`crate::config::ExtractionConfig::instruction`].

use crate::config::{RecordSchema, UnitStrategy};

/// Whole-page vision prompt for a two-column bilingual dictionary.
pub const DICTIONARY_PAGE_PROMPT: &str = r#"You are extracting entries from a scanned page of a Shipibo-Spanish dictionary.

## How to identify dictionary entries

Each entry starts with a bold headword: a single Shipibo word, sometimes prefixed with a dash for suffixes like "-a". The headword is followed by a part-of-speech abbreviation (s., v. t., v. i., adj., adv., sf., interj., prep.) and then the Spanish definition(s).

Do NOT treat these as entries:
- Example sentences in angle brackets «». They illustrate the preceding headword.
- Phrases that follow "-Úsase" usage notes.
- Column headers (single words centered at the top of a column) and page headers.
- Cross-references inside an entry (e.g. "Véase Bosquejo gramatical...").

A multi-word phrase is an example sentence, not a headword.

## Fields to extract per entry

- headword: the Shipibo word (lowercase, preserve accents)
- part_of_speech: one of "noun", "transitive verb", "intransitive verb", "adjective", "adverb", "interjection", "preposition", "suffix", "postposition", or null
- variant_forms: alternate spellings (after "tb." or "conj."), or []
- etymology: bracketed text like "[del cast.]", or null
- scientific_name: Latin name for flora/fauna terms if known, or null
- definitions_spanish: ALL Spanish senses (numbered senses 1:, 2: included)
- definitions_english: English translations, same order and count
- examples: objects with "shipibo", "spanish" and "english" fields
- synonyms: words after "sinón.", or []
- cross_references: words after "Véase" or "Véase bajo", or []
- grammatical_notes: combined "-Úsase" notes translated to English, or null

## Rules

- Return ONLY a valid JSON array of entry objects, no markdown, no explanation
- Include every distinct headword entry visible on the page
- The page has two columns: read the left column fully, then the right

Return the JSON array:"#;

/// Per-chunk text prompt used with the segmentation strategy.
///
/// The chunk text is appended by the inference client, fenced by `---` lines.
pub const ENTRY_TEXT_PROMPT: &str = r#"Parse this Shipibo-Spanish dictionary entry into structured JSON.

The text comes from OCR and may have errors. Common OCR mistakes:
- "v. £." or "v. ¿." usually means "v. t." (transitive verb)
- "». i." or "v. 1." usually means "v. i." (intransitive verb)
- "5." might mean "s." (noun)
- Angle brackets «» may appear as < > or other variants

Extract these fields:
- headword: the Shipibo word being defined (lowercase)
- part_of_speech: "s.", "v. t.", "v. i.", "adj.", "adv.", "interj.", "prep.", "sf.", or null
- variant_forms: alternate spellings or conjugations (after "tb." or "conj.")
- etymology: bracketed etymology like "[del ship. X + Y]", or null
- definitions_spanish: Spanish definitions (may be numbered 1:, 2:)
- examples: objects with "shipibo" and "spanish" fields, from «» or <>
- synonyms: words after "sinón."
- cross_references: words after "Véase" or "Véase bajo"
- grammatical_notes: notes starting with "-Úsase", or null

Return ONLY a valid JSON array containing one or more entry objects. If the text
lists sub-entries (compounds under a main entry), include each as its own object."#;

/// Vocabulary prompt for course material pages.
pub const VOCABULARY_PROMPT: &str = r#"You are extracting Shipibo-Konibo vocabulary from a course page.

The page may contain a vocabulary table, song lyrics with translations,
suffix/prefix explanations, or grammar notes.

For each WORD: "shipibo" (lowercase), "part_of_speech" ("noun", "verb",
"transitive verb", "intransitive verb", "adjective", "adverb", "pronoun",
"conjunction", "interjection", "particle", or null), "meaning" (English).

For each SUFFIX: "form" (with leading dash, e.g. "-ya"), "meaning", "usage",
"examples" (array).

For each PREFIX: "form", "meaning", "usage", "examples" (array).

Return JSON:
{
  "words": [...],
  "suffixes": [...],
  "prefixes": [],
  "page_description": "brief description of what this page contains"
}

If the page has no extractable vocabulary, return empty arrays.
Return ONLY valid JSON."#;

/// Default instruction for a strategy/schema pair.
pub fn default_instruction(strategy: UnitStrategy, schema: RecordSchema) -> &'static str {
    match (strategy, schema) {
        (UnitStrategy::Pages, RecordSchema::DictionaryEntries) => DICTIONARY_PAGE_PROMPT,
        (UnitStrategy::Segments, RecordSchema::DictionaryEntries) => ENTRY_TEXT_PROMPT,
        (_, RecordSchema::Vocabulary) => VOCABULARY_PROMPT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_matching_prompt() {
        assert!(default_instruction(UnitStrategy::Pages, RecordSchema::DictionaryEntries)
            .contains("scanned page"));
        assert!(default_instruction(UnitStrategy::Segments, RecordSchema::DictionaryEntries)
            .contains("OCR"));
        assert!(default_instruction(UnitStrategy::Segments, RecordSchema::Vocabulary)
            .contains("\"words\""));
    }

    #[test]
    fn array_prompts_ask_for_json_only() {
        for p in [DICTIONARY_PAGE_PROMPT, ENTRY_TEXT_PROMPT] {
            assert!(p.contains("ONLY a valid JSON array"));
        }
    }
}
