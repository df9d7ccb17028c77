//! Text-layer segmentation: split the run's page text into entry-sized chunks.
//!
//! Cleaning, applied to each page before splitting:
//!
//! 1. Line-break hyphenation is undone (`dise-\nño` → `diseño`).
//! 2. Standalone page numbers (a line of one to three digits) are blanked.
//! 3. Page furniture is blanked: a single-token line with a blank line (or
//!    the page edge) on both sides, unless it starts an entry.
//!
//! A new chunk starts at every line that matches the entry-start pattern: a
//! headword followed by a part-of-speech marker, a `Véase` cross-reference
//! or a bracketed etymology. Text before the first match becomes its own
//! chunk, and a text with no match at all is a single chunk.
//!
//! Chunk keys are `(page where the chunk starts, index within that page)`.

use crate::unit::UnitKey;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// `-` at end of line followed by a lowercase continuation.
static HYPHEN_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\n\s*([a-záéíóúñ])").expect("valid regex"));

/// Headword + part-of-speech marker (OCR variants of `s.` and `v. t.` included),
/// `Véase`, or `[del `.
static ENTRY_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[-—]?[A-ZÁÉÍÓÚa-záéíóúñ][\wáéíóúñ]*\s+(?:(?:tb\.\s+\S+\s+)?(?:s\.|[$5]\.|v\.\s*[tií£]|adj\.|adv\.|sf\.|sí\.|interj\.|prep\.)|Véase\b|\[del\s)",
    )
    .expect("valid regex")
});

/// One chunk of entry text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub key: UnitKey,
    pub text: String,
}

/// True when `line` opens a new entry.
pub fn starts_entry(line: &str) -> bool {
    ENTRY_START.is_match(line)
}

fn is_page_number(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty() && t.len() <= 3 && t.bytes().all(|b| b.is_ascii_digit())
}

/// Clean one page of text-layer output.
pub fn clean_page_text(text: &str) -> String {
    // pdfium separates text-layer lines with CRLF.
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let joined = HYPHEN_BREAK.replace_all(&text, "$1");

    let lines: Vec<&str> = joined
        .lines()
        .map(|l| if is_page_number(l) { "" } else { l })
        .collect();

    let blank_at = |i: Option<usize>| match i {
        None => true,
        Some(i) => lines.get(i).map_or(true, |l| l.trim().is_empty()),
    };

    let kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let t = line.trim();
            let single_token = !t.is_empty() && !t.contains(char::is_whitespace);
            let isolated = blank_at(i.checked_sub(1)) && blank_at(Some(i + 1));
            if single_token && isolated && !starts_entry(line) {
                ""
            } else {
                line
            }
        })
        .collect();

    kept.join("\n")
}

/// Clean and split the text of `pages` (1-indexed page, text) into chunks.
///
/// Pages are processed in the order given; chunks may span page boundaries
/// and take the key of the page they start on.
pub fn segment_pages(pages: &[(usize, String)]) -> Vec<Segment> {
    let mut full = String::new();
    // (byte offset where the page starts, page number)
    let mut starts: Vec<(usize, usize)> = Vec::with_capacity(pages.len());
    for (page, text) in pages {
        starts.push((full.len(), *page));
        full.push_str(&clean_page_text(text));
        full.push('\n');
    }

    let page_at = |offset: usize| {
        let idx = starts.partition_point(|(start, _)| *start <= offset);
        starts[idx.saturating_sub(1)].1
    };

    let mut bounds: Vec<usize> = ENTRY_START.find_iter(&full).map(|m| m.start()).collect();
    if bounds.first() != Some(&0) {
        bounds.insert(0, 0);
    }
    bounds.push(full.len());

    let mut per_page: HashMap<usize, usize> = HashMap::new();
    let mut segments = Vec::new();
    for window in bounds.windows(2) {
        let (start, end) = (window[0], window[1]);
        let text = full[start..end].trim();
        if text.is_empty() {
            continue;
        }
        // Leading whitespace belongs to the previous page's tail.
        let lead = full[start..end].len() - full[start..end].trim_start().len();
        let page = page_at(start + lead);
        let chunk = per_page.entry(page).or_insert(0);
        segments.push(Segment {
            key: UnitKey::chunk(page, *chunk),
            text: text.to_string(),
        });
        *chunk += 1;
    }

    segments
}
