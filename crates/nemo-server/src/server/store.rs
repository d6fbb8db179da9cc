//! The result store: id -> latest known result view.
//!
//! Guarded by a single read/write lock over the whole map, so inserts from
//! concurrent Stage-1 workers, reconciliation and `clear` are atomic with
//! respect to each other and readers never observe a partially written
//! record. Ids are time-ordered ULIDs, so iterating the `BTreeMap` yields
//! results in submission order.

use nemo_core::{BasicResult, ProcessedOverlay, ProcessedResult, ResultView};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct ResultStore {
    results: RwLock<BTreeMap<String, ResultView>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a Stage-1 result. Each id is produced once; a repeated id
    /// replaces the earlier view.
    pub fn insert(&self, result: BasicResult) {
        self.results
            .write()
            .insert(result.id.clone(), ResultView::new(result));
    }

    pub fn get(&self, id: &str) -> Option<ResultView> {
        self.results.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ResultView> {
        self.results.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every result. Idempotent.
    pub fn clear(&self) {
        self.results.write().clear();
    }

    /// Persists a Stage-2 overlay onto its basic result.
    ///
    /// Returns `false` when the id is unknown (e.g. cleared in the meantime),
    /// in which case the processed result is discarded.
    pub fn apply_processed(&self, processed: ProcessedResult) -> bool {
        match self.results.write().get_mut(&processed.id) {
            Some(view) => {
                view.processed = Some(ProcessedOverlay {
                    text: processed.processed_text,
                    processor_id: processed.processor_id,
                });
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nemo_core::Performance;
    use std::sync::Arc;

    fn basic(id: &str) -> BasicResult {
        BasicResult {
            id: id.to_string(),
            prompt: "p".to_string(),
            response: format!("text {id}"),
            worker_name: "worker-1".to_string(),
            timestamp: "00:00:00".to_string(),
            has_image: false,
            image_data: None,
            performance: Performance::default(),
            error: false,
        }
    }

    #[test]
    fn clear_then_all_is_empty() {
        let store = ResultStore::new();
        store.insert(basic("01A"));
        store.insert(basic("01B"));
        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.all().is_empty());
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn all_is_ordered_by_id() {
        let store = ResultStore::new();
        for id in ["01C", "01A", "01B"] {
            store.insert(basic(id));
        }
        let ids: Vec<_> = store.all().into_iter().map(|v| v.basic.id).collect();
        assert_eq!(ids, ["01A", "01B", "01C"]);
    }

    #[test]
    fn apply_processed_persists_overlay() {
        let store = ResultStore::new();
        store.insert(basic("01A"));

        let applied = store.apply_processed(ProcessedResult {
            id: "01A".to_string(),
            prompt: "p".to_string(),
            processed_text: "Question: p\n\ntext 01A".to_string(),
            processor_id: 1,
        });
        assert!(applied);

        let view = store.get("01A").unwrap();
        assert!(view.is_processed());
        assert_eq!(view.merged().basic.response, "Question: p\n\ntext 01A");
    }

    #[test]
    fn apply_processed_for_unknown_id_is_dropped() {
        let store = ResultStore::new();
        assert!(!store.apply_processed(ProcessedResult {
            id: "missing".to_string(),
            prompt: "p".to_string(),
            processed_text: "x".to_string(),
            processor_id: 0,
        }));
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let store = Arc::new(ResultStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.insert(basic(&format!("{t:02}-{i:03}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
