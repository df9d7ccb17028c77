//! Pipeline stages for one extraction run.
//!
//! Each submodule implements one step, so each can be tested on its own and
//! swapped behind its trait (renderer, inference client, parser).
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ render ──▶ producer ══channel══▶ worker ──▶ llm ──▶ parse
//! (%PDF)     (pdfium)   (segment)  (bounded)  (retry)    (call)   (JSON)
//! ```
//!
//! 1. [`source`]: validate the input document before anything else runs
//! 2. [`render`]: page image or text layer; runs in `spawn_blocking`
//! 3. [`segment`]: clean text-layer output and split it into entry chunks
//! 4. [`producer`]: plan unit keys and feed the bounded work channel
//! 5. [`worker`]: pool of concurrent units with timeout and backoff
//! 6. [`llm`]: one inference call per attempt; the only network I/O
//! 7. [`encode`]: PNG and base64 for image payloads
//! 8. [`parse`]: model text into JSON records

pub mod encode;
pub mod llm;
pub mod parse;
pub mod producer;
pub mod render;
pub mod segment;
pub mod source;
pub mod worker;
