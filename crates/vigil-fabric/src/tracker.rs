//! Pending-request table: correlation ID → callback + deadline.
//!
//! Every API request with a callback lands here. An entry leaves the
//! table exactly once — either a response with a matching ID arrives
//! (callback fires with `timed_out = false`) or the deadline passes
//! (callback fires with `timed_out = true` and an empty response).
//! Callbacks are always invoked with the table lock released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::debug;
use vigil_wire::{RequestMessage, ResponseMessage};

use crate::endpoint::Endpoint;

/// Completion callback for an API request.
///
/// Arguments: the responding endpoint (`None` on timeout), the original
/// request, the response (empty on timeout), and the timeout flag.
pub type ApiCallback =
    Box<dyn FnOnce(Option<Arc<Endpoint>>, &RequestMessage, &ResponseMessage, bool) + Send>;

struct PendingRequest {
    request: RequestMessage,
    callback: ApiCallback,
    deadline: Instant,
}

/// Table of in-flight requests awaiting responses.
#[derive(Default)]
pub struct RequestTracker {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request.
    pub fn insert(
        &self,
        id: impl Into<String>,
        request: RequestMessage,
        callback: ApiCallback,
        deadline: Instant,
    ) {
        let mut requests = self.lock();
        requests.insert(
            id.into(),
            PendingRequest {
                request,
                callback,
                deadline,
            },
        );
    }

    /// Complete the request with `id`, if still pending.
    ///
    /// Returns true if a callback fired. Unknown IDs are ignored — the
    /// request may already have timed out.
    pub fn complete(
        &self,
        id: &str,
        sender: Option<Arc<Endpoint>>,
        response: &ResponseMessage,
    ) -> bool {
        let entry = {
            let mut requests = self.lock();
            requests.remove(id)
        };
        match entry {
            Some(entry) => {
                (entry.callback)(sender, &entry.request, response, false);
                true
            }
            None => {
                debug!(id = %id, "Response for unknown or expired request");
                false
            }
        }
    }

    /// Time out every entry whose deadline has passed. Returns the number
    /// of callbacks fired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut requests = self.lock();
            let ids: Vec<String> = requests
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| requests.remove(&id))
                .collect()
        };

        let count = expired.len();
        let empty = ResponseMessage::empty();
        for entry in expired {
            (entry.callback)(None, &entry.request, &empty, true);
        }
        count
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_callback(
        hits: &Arc<AtomicUsize>,
        timeouts: &Arc<AtomicUsize>,
    ) -> ApiCallback {
        let hits = Arc::clone(hits);
        let timeouts = Arc::clone(timeouts);
        Box::new(move |_, _, _, timed_out| {
            hits.fetch_add(1, Ordering::SeqCst);
            if timed_out {
                timeouts.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn test_complete_fires_callback_once() {
        let tracker = RequestTracker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));

        tracker.insert(
            "1",
            RequestMessage::new("ping").with_id("1"),
            counting_callback(&hits, &timeouts),
            Instant::now() + Duration::from_secs(60),
        );

        let response = ResponseMessage::reply_to("1", serde_json::Value::Null);
        assert!(tracker.complete("1", None, &response));
        assert!(!tracker.complete("1", None, &response));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_complete_unknown_id_is_a_noop() {
        let tracker = RequestTracker::new();
        let response = ResponseMessage::reply_to("9", serde_json::Value::Null);
        assert!(!tracker.complete("9", None, &response));
    }

    #[test]
    fn test_sweep_times_out_all_expired_entries() {
        let tracker = RequestTracker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        for id in ["1", "2", "3"] {
            tracker.insert(
                id,
                RequestMessage::new("ping").with_id(id),
                counting_callback(&hits, &timeouts),
                now,
            );
        }
        tracker.insert(
            "4",
            RequestMessage::new("ping").with_id("4"),
            counting_callback(&hits, &timeouts),
            now + Duration::from_secs(60),
        );

        assert_eq!(tracker.sweep(now + Duration::from_millis(1)), 3);
        assert_eq!(timeouts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_sweep_then_complete_does_not_double_fire() {
        let tracker = RequestTracker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        tracker.insert(
            "1",
            RequestMessage::new("ping").with_id("1"),
            counting_callback(&hits, &timeouts),
            now,
        );

        assert_eq!(tracker.sweep(now), 1);
        let response = ResponseMessage::reply_to("1", serde_json::Value::Null);
        assert!(!tracker.complete("1", None, &response));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_before_deadline_fires_nothing() {
        let tracker = RequestTracker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        tracker.insert(
            "1",
            RequestMessage::new("ping").with_id("1"),
            counting_callback(&hits, &timeouts),
            now + Duration::from_secs(60),
        );

        assert_eq!(tracker.sweep(now), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.len(), 1);
    }
}
