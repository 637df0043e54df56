//! Matches inbound stanzas to callers waiting for a reply.
//!
//! Waiters are kept in registration order behind one mutex, so `offer` and
//! `create_pending` can never race each other into losing a stanza. Every
//! waiter resolves exactly once: with the matching stanza, with a timeout, or
//! with "connection closed" when the connection terminates.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RequestError;
use crate::stanza::Stanza;

/// Predicate deciding whether an inbound stanza answers a pending request.
pub trait StanzaFilter: Send + Sync {
    fn matches(&self, stanza: &Stanza) -> bool;
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync,
{
    fn matches(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }
}

/// Matches the `result`/`error` reply to an IQ request.
#[derive(Debug, Clone)]
pub struct IqReplyFilter {
    id: String,
    from: Option<String>,
}

impl IqReplyFilter {
    /// Filter for replies to `request`. If the request was addressed, the reply
    /// must come from that address.
    pub fn for_request(request: &Stanza) -> Self {
        Self {
            id: request.id().unwrap_or_default().to_string(),
            from: request.to().map(str::to_string),
        }
    }
}

impl StanzaFilter for IqReplyFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        if !stanza.is_iq_response() || stanza.id() != Some(self.id.as_str()) {
            return false;
        }
        match &self.from {
            Some(expected) => stanza.from() == Some(expected.as_str()),
            None => true,
        }
    }
}

type Outcome = Result<Stanza, RequestError>;

struct Waiter {
    id: u64,
    filter: Box<dyn StanzaFilter>,
    timeout: Duration,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct Waiters {
    list: Vec<Waiter>,
    next_id: u64,
    /// Set once the connection has terminated; new waiters fail immediately.
    closed: Option<String>,
}

/// Handle returned by [`Correlator::create_pending`].
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<Waiters>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter. Must be called before the request is sent, so the
    /// reply cannot arrive before anyone is listening.
    pub fn create_pending(&self, filter: impl StanzaFilter + 'static, timeout: Duration) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        let waiters = &mut *guard;
        let id = waiters.next_id;
        waiters.next_id += 1;
        match &waiters.closed {
            Some(reason) => {
                let _ = tx.send(Err(RequestError::ConnectionClosed(reason.clone())));
            }
            None => waiters.list.push(Waiter {
                id,
                filter: Box::new(filter),
                timeout,
                deadline,
                tx,
            }),
        }
        PendingRequest {
            id,
            timeout,
            deadline,
            rx,
        }
    }

    /// Hand an inbound stanza to the first registered waiter that matches.
    ///
    /// Returns whether the stanza was consumed.
    pub fn offer(&self, stanza: &Stanza) -> bool {
        let now = Instant::now();
        let mut waiters = self.lock();

        // Expired waiters never receive a stanza, and abandoned ones (handle
        // dropped) must not swallow a reply meant for a live waiter.
        let mut i = 0;
        while i < waiters.list.len() {
            if waiters.list[i].tx.is_closed() {
                let abandoned = waiters.list.remove(i);
                debug!(waiter = abandoned.id, "Dropping abandoned pending request");
            } else if waiters.list[i].deadline <= now {
                let expired = waiters.list.remove(i);
                let _ = expired.tx.send(Err(RequestError::Timeout(expired.timeout)));
            } else {
                i += 1;
            }
        }

        let Some(pos) = waiters.list.iter().position(|w| w.filter.matches(stanza)) else {
            return false;
        };
        let waiter = waiters.list.remove(pos);
        debug!(waiter = waiter.id, id = ?stanza.id(), "Reply matched pending request");
        waiter.tx.send(Ok(stanza.clone())).is_ok()
    }

    /// Wait for the outcome of a pending request.
    pub async fn wait(&self, mut pending: PendingRequest) -> Result<Stanza, RequestError> {
        match tokio::time::timeout_at(pending.deadline, &mut pending.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed("correlator dropped".to_string())),
            Err(_) => {
                if self.remove(pending.id) {
                    return Err(RequestError::Timeout(pending.timeout));
                }
                // Already resolved by offer/close just before the deadline fired.
                match pending.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RequestError::Timeout(pending.timeout)),
                }
            }
        }
    }

    /// Withdraw a request whose stanza could not be sent.
    pub fn cancel(&self, pending: PendingRequest) {
        self.remove(pending.id);
    }

    fn remove(&self, id: u64) -> bool {
        let mut waiters = self.lock();
        match waiters.list.iter().position(|w| w.id == id) {
            Some(pos) => {
                waiters.list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Release every waiter with a connection-closed outcome and refuse new ones.
    pub fn close(&self, reason: &str) {
        let mut waiters = self.lock();
        waiters.closed = Some(reason.to_string());
        let released = waiters.list.len();
        for waiter in waiters.list.drain(..) {
            let _ = waiter.tx.send(Err(RequestError::ConnectionClosed(reason.to_string())));
        }
        if released > 0 {
            debug!(released, reason, "Released pending requests");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CodecRegistry;

    fn reply(id: &str, from: Option<&str>) -> Stanza {
        let from = from.map(|f| format!(" from='{}'", f)).unwrap_or_default();
        Stanza::parse(
            &format!("<iq xmlns='jabber:client' type='result' id='{}'{}/>", id, from),
            &CodecRegistry::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reply_fulfils_pending_request() {
        let correlator = Correlator::new();
        let request = Stanza::iq("get").with_attr("to", "capulet.lit");
        let pending = correlator.create_pending(IqReplyFilter::for_request(&request), Duration::from_secs(5));

        let id = request.id().unwrap();
        assert!(!correlator.offer(&reply(id, Some("montague.lit"))));
        assert!(correlator.offer(&reply(id, Some("capulet.lit"))));

        let stanza = correlator.wait(pending).await.unwrap();
        assert_eq!(stanza.id(), Some(id));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_never_matching_request_times_out_once() {
        let correlator = Correlator::new();
        let pending = correlator.create_pending(|_: &Stanza| false, Duration::from_millis(50));

        assert!(!correlator.offer(&reply("x", None)));
        let started = std::time::Instant::now();
        let result = correlator.wait(pending).await;
        assert_eq!(result.unwrap_err(), RequestError::Timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(40));

        // Nothing left that could fire a second time.
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.offer(&reply("x", None)));
    }

    #[tokio::test]
    async fn test_expired_waiter_is_not_fulfilled() {
        let correlator = Correlator::new();
        let pending = correlator.create_pending(|_: &Stanza| true, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!correlator.offer(&reply("late", None)));
        assert!(matches!(correlator.wait(pending).await, Err(RequestError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_first_registered_first_matched() {
        let correlator = Correlator::new();
        let first = correlator.create_pending(|_: &Stanza| true, Duration::from_secs(5));
        let second = correlator.create_pending(|_: &Stanza| true, Duration::from_secs(5));

        assert!(correlator.offer(&reply("a", None)));
        assert_eq!(correlator.wait(first).await.unwrap().id(), Some("a"));
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.offer(&reply("b", None)));
        assert_eq!(correlator.wait(second).await.unwrap().id(), Some("b"));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let correlator = Correlator::new();
        let pending = correlator.create_pending(|_: &Stanza| false, Duration::from_secs(60));

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.wait(pending).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        correlator.close("shutdown");

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), RequestError::ConnectionClosed("shutdown".to_string()));

        let late = correlator.create_pending(|_: &Stanza| true, Duration::from_secs(60));
        assert!(matches!(correlator.wait(late).await, Err(RequestError::ConnectionClosed(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_swallow_reply() {
        let correlator = Correlator::new();
        let abandoned = correlator.create_pending(|s: &Stanza| s.id() == Some("r1"), Duration::from_secs(5));
        drop(abandoned);
        let live = correlator.create_pending(|s: &Stanza| s.id() == Some("r1"), Duration::from_secs(5));

        assert!(correlator.offer(&reply("r1", None)));
        assert_eq!(correlator.wait(live).await.unwrap().id(), Some("r1"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_for_abandoned_waiter_only_is_not_consumed() {
        let correlator = Correlator::new();
        drop(correlator.create_pending(|_: &Stanza| true, Duration::from_secs(5)));

        assert!(!correlator.offer(&reply("r2", None)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_independent() {
        let correlator = Correlator::new();
        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..16 {
            let request = Stanza::iq("get");
            let id = request.id().unwrap().to_string();
            let pending = correlator.create_pending(IqReplyFilter::for_request(&request), Duration::from_secs(5));
            let correlator = correlator.clone();
            let expected = id.clone();
            tasks.push(tokio::spawn(async move {
                let stanza = correlator.wait(pending).await.unwrap();
                assert_eq!(stanza.id(), Some(expected.as_str()));
            }));
            ids.push(id);
        }
        for id in ids.iter().rev() {
            assert!(correlator.offer(&reply(id, None)));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
