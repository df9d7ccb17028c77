//! Response parsing: model text → zero or more JSON records.
//!
//! Models wrap JSON in markdown fences or add a sentence of preamble despite
//! being told not to. Both parsers cut from the first opening bracket to the
//! last closing one before handing the slice to `serde_json`; anything that
//! still fails to decode is a [`MalformedResponse`], which the worker never
//! retries.

use crate::config::RecordSchema;
use crate::error::MalformedResponse;
use serde_json::Value;
use std::sync::Arc;

/// Turns one inference response into record values.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Vec<Value>, MalformedResponse>;
}

/// Parser matching a record schema.
pub fn parser_for(schema: RecordSchema) -> Arc<dyn ResponseParser> {
    match schema {
        RecordSchema::DictionaryEntries => Arc::new(JsonArrayParser),
        RecordSchema::Vocabulary => Arc::new(VocabularyParser),
    }
}

/// Slice `text` from the first `open` to the last `close`, inclusive.
fn bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(80) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Expects a JSON array; each element becomes one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArrayParser;

impl ResponseParser for JsonArrayParser {
    fn parse(&self, text: &str) -> Result<Vec<Value>, MalformedResponse> {
        let slice = bracketed(text, '[', ']').ok_or_else(|| {
            MalformedResponse(format!("no JSON array in response: {:?}", preview(text)))
        })?;
        serde_json::from_str::<Vec<Value>>(slice)
            .map_err(|e| MalformedResponse(format!("invalid JSON array: {}", e)))
    }
}

/// Expects `{"words": [...], "suffixes": [...], "prefixes": [...]}`.
///
/// Every element of the three lists becomes a record; objects get a `kind`
/// field (`word`, `suffix` or `prefix`). Missing lists count as empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct VocabularyParser;

const VOCABULARY_SECTIONS: [(&str, &str); 3] =
    [("words", "word"), ("suffixes", "suffix"), ("prefixes", "prefix")];

impl ResponseParser for VocabularyParser {
    fn parse(&self, text: &str) -> Result<Vec<Value>, MalformedResponse> {
        let slice = bracketed(text, '{', '}').ok_or_else(|| {
            MalformedResponse(format!("no JSON object in response: {:?}", preview(text)))
        })?;
        let mut object = match serde_json::from_str::<Value>(slice) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(MalformedResponse("expected a JSON object".into())),
            Err(e) => return Err(MalformedResponse(format!("invalid JSON object: {}", e))),
        };

        let mut records = Vec::new();
        for (section, kind) in VOCABULARY_SECTIONS {
            match object.remove(section) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for mut item in items {
                        if let Value::Object(map) = &mut item {
                            map.insert("kind".into(), Value::from(kind));
                        }
                        records.push(item);
                    }
                }
                Some(_) => {
                    return Err(MalformedResponse(format!("'{}' is not an array", section)))
                }
            }
        }
        Ok(records)
    }
}
