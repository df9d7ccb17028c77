//! Unit producers: plan the run's keys, then feed work units into the channel.
//!
//! The producer is the only stage that touches the source document after
//! setup. It runs on its own task and sends in key order; the bounded
//! channel applies backpressure so at most `capacity` rendered payloads
//! wait for a worker at any time. When the receiving side goes away (run
//! cancelled or failed), `send` errors and the producer stops.

use crate::config::PageRange;
use crate::error::{ExtractError, RenderError};
use crate::pipeline::render::PageRenderer;
use crate::pipeline::segment::{self, Segment};
use crate::unit::{Payload, UnitKey, WorkUnit};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// One item on the work channel.
#[derive(Debug)]
pub enum Dispatch {
    /// A unit ready for inference.
    Unit(WorkUnit),
    /// The unit's payload could not be produced; recorded as a failure.
    RenderFailed { key: UnitKey, error: RenderError },
}

impl Dispatch {
    pub fn key(&self) -> UnitKey {
        match self {
            Dispatch::Unit(unit) => unit.key,
            Dispatch::RenderFailed { key, .. } => *key,
        }
    }
}

/// Plans and produces the work units of a run.
#[async_trait]
pub trait UnitProducer: Send + Sync {
    /// All unit keys the run requests, in dispatch order.
    async fn plan(&self) -> Result<Vec<UnitKey>, ExtractError>;

    /// Send a [`Dispatch`] for each of `keys`, in order.
    ///
    /// Returns when every key was sent or the receiver was dropped. Dropping
    /// `tx` on return closes the channel.
    async fn produce(&self, keys: Vec<UnitKey>, tx: mpsc::Sender<Dispatch>);
}

/// One unit per page, rendered on demand.
pub struct PageProducer {
    renderer: Arc<dyn PageRenderer>,
    pages: PageRange,
    instruction: String,
}

impl PageProducer {
    pub fn new(renderer: Arc<dyn PageRenderer>, pages: PageRange, instruction: String) -> Self {
        Self {
            renderer,
            pages,
            instruction,
        }
    }
}

fn plan_pages(pages: &PageRange, total: usize) -> Result<Vec<usize>, ExtractError> {
    let selected = pages.to_pages(total);
    if selected.is_empty() {
        return Err(ExtractError::EmptyPageRange {
            start: pages.start,
            end: pages.end.unwrap_or(total),
            total,
        });
    }
    Ok(selected)
}

#[async_trait]
impl UnitProducer for PageProducer {
    async fn plan(&self) -> Result<Vec<UnitKey>, ExtractError> {
        let pages = plan_pages(&self.pages, self.renderer.page_count())?;
        info!("Planned {} page units ({})", pages.len(), self.pages);
        Ok(pages.into_iter().map(UnitKey::page).collect())
    }

    async fn produce(&self, keys: Vec<UnitKey>, tx: mpsc::Sender<Dispatch>) {
        for key in keys {
            let item = match self.renderer.render(key.page).await {
                Ok(payload) => Dispatch::Unit(WorkUnit {
                    key,
                    payload,
                    instruction: self.instruction.clone(),
                }),
                Err(error) => {
                    warn!("{}", error);
                    Dispatch::RenderFailed { key, error }
                }
            };
            if tx.send(item).await.is_err() {
                debug!("Work channel closed; producer stopping before {}", key);
                return;
            }
        }
        debug!("Producer finished; closing work channel");
    }
}

/// One unit per entry-sized chunk of the page range's text layer.
///
/// Segmentation needs the text of every page before the first key is known,
/// so the chunks are computed once in [`UnitProducer::plan`] and reused by
/// [`UnitProducer::produce`].
pub struct SegmentProducer {
    renderer: Arc<dyn PageRenderer>,
    pages: PageRange,
    instruction: String,
    segments: OnceCell<BTreeMap<UnitKey, String>>,
}

impl SegmentProducer {
    pub fn new(renderer: Arc<dyn PageRenderer>, pages: PageRange, instruction: String) -> Self {
        Self {
            renderer,
            pages,
            instruction,
            segments: OnceCell::new(),
        }
    }

    async fn load_segments(&self) -> Result<BTreeMap<UnitKey, String>, ExtractError> {
        let pages = plan_pages(&self.pages, self.renderer.page_count())?;

        let mut texts = Vec::with_capacity(pages.len());
        for page in pages {
            match self.renderer.render(page).await {
                Ok(Payload::Text(text)) => texts.push((page, text)),
                Ok(other) => {
                    return Err(ExtractError::TextPayloadRequired {
                        page,
                        found: other.kind(),
                    })
                }
                Err(e) => {
                    return Err(ExtractError::TextExtractionFailed {
                        page,
                        detail: e.detail,
                    })
                }
            }
        }

        let segments = segment::segment_pages(&texts);
        info!(
            "Segmented {} pages into {} chunks ({})",
            texts.len(),
            segments.len(),
            self.pages
        );
        Ok(segments
            .into_iter()
            .map(|Segment { key, text }| (key, text))
            .collect())
    }
}

#[async_trait]
impl UnitProducer for SegmentProducer {
    async fn plan(&self) -> Result<Vec<UnitKey>, ExtractError> {
        let segments = self
            .segments
            .get_or_try_init(|| self.load_segments())
            .await?;
        Ok(segments.keys().copied().collect())
    }

    async fn produce(&self, keys: Vec<UnitKey>, tx: mpsc::Sender<Dispatch>) {
        let Some(segments) = self.segments.get() else {
            warn!("Segment producer used before planning; nothing to send");
            return;
        };

        for key in keys {
            let item = match segments.get(&key) {
                Some(text) => Dispatch::Unit(WorkUnit {
                    key,
                    payload: Payload::Text(text.clone()),
                    instruction: self.instruction.clone(),
                }),
                None => Dispatch::RenderFailed {
                    key,
                    error: RenderError {
                        page: key.page,
                        detail: format!("no segment {}", key),
                    },
                },
            };
            if tx.send(item).await.is_err() {
                debug!("Work channel closed; producer stopping before {}", key);
                return;
            }
        }
        debug!("Producer finished; closing work channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeRenderer {
        pages: HashMap<usize, Result<Payload, String>>,
        count: usize,
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        fn page_count(&self) -> usize {
            self.count
        }

        async fn render(&self, page: usize) -> Result<Payload, RenderError> {
            match self.pages.get(&page) {
                Some(Ok(p)) => Ok(p.clone()),
                Some(Err(detail)) => Err(RenderError {
                    page,
                    detail: detail.clone(),
                }),
                None => Err(RenderError {
                    page,
                    detail: "missing".into(),
                }),
            }
        }
    }

    fn text_renderer(texts: &[(usize, &str)], count: usize) -> Arc<dyn PageRenderer> {
        Arc::new(FakeRenderer {
            pages: texts
                .iter()
                .map(|(p, t)| (*p, Ok(Payload::Text(t.to_string()))))
                .collect(),
            count,
        })
    }

    #[tokio::test]
    async fn page_plan_clips_to_document() {
        let producer = PageProducer::new(
            text_renderer(&[], 4),
            PageRange::new(3, 10),
            "go".into(),
        );
        let keys = producer.plan().await.unwrap();
        assert_eq!(keys, vec![UnitKey::page(3), UnitKey::page(4)]);
    }

    #[tokio::test]
    async fn page_plan_past_end_is_error() {
        let producer = PageProducer::new(text_renderer(&[], 4), PageRange::starting_at(9), "go".into());
        let err = producer.plan().await.unwrap_err();
        assert!(matches!(err, ExtractError::EmptyPageRange { total: 4, .. }));
    }

    #[tokio::test]
    async fn render_failure_is_forwarded_not_fatal() {
        let renderer: Arc<dyn PageRenderer> = Arc::new(FakeRenderer {
            pages: HashMap::from([
                (1, Ok(Payload::Text("one".into()))),
                (2, Err("corrupt xref".to_string())),
            ]),
            count: 2,
        });
        let producer = PageProducer::new(renderer, PageRange::default(), "go".into());
        let keys = producer.plan().await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        producer.produce(keys, tx).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Dispatch::Unit(ref u) if u.key == UnitKey::page(1)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Dispatch::RenderFailed { key, .. } if key == UnitKey::page(2)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn producer_stops_when_receiver_dropped() {
        let producer = PageProducer::new(
            text_renderer(&[(1, "a"), (2, "b"), (3, "c")], 3),
            PageRange::default(),
            "go".into(),
        );
        let keys = producer.plan().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Must return rather than block on a full channel.
        producer.produce(keys, tx).await;
    }

    #[tokio::test]
    async fn segment_producer_plans_chunks_and_sends_text() {
        let producer = SegmentProducer::new(
            text_renderer(
                &[
                    (1, "abaquiti s. abuelo.\n\n23\n\nkené s. design; pattern."),
                    (2, "joni v. t. ver."),
                ],
                2,
            ),
            PageRange::default(),
            "parse".into(),
        );
        let keys = producer.plan().await.unwrap();
        assert_eq!(
            keys,
            vec![UnitKey::chunk(1, 0), UnitKey::chunk(1, 1), UnitKey::chunk(2, 0)]
        );

        let (tx, mut rx) = mpsc::channel(8);
        producer.produce(vec![UnitKey::chunk(1, 1)], tx).await;
        match rx.recv().await.unwrap() {
            Dispatch::Unit(unit) => {
                assert_eq!(unit.payload, Payload::Text("kené s. design; pattern.".into()));
                assert_eq!(unit.instruction, "parse");
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[tokio::test]
    async fn segment_producer_requires_text() {
        let renderer: Arc<dyn PageRenderer> = Arc::new(FakeRenderer {
            pages: HashMap::from([(
                1,
                Ok(Payload::Image {
                    bytes: vec![1, 2, 3],
                    mime: "image/png".into(),
                }),
            )]),
            count: 1,
        });
        let producer = SegmentProducer::new(renderer, PageRange::default(), "parse".into());
        let err = producer.plan().await.unwrap_err();
        assert!(matches!(err, ExtractError::TextPayloadRequired { page: 1, .. }));
    }
}
