//! Notification subsystem for published and reverted proposals.
//!
//! The [`Notifier`] fans a release out to the configured HTTP collaborators
//! (search index, content analysis) and to the in-process [`EventBus`].
//! HTTP deliveries run as spawned tasks with bounded retry; failures are
//! logged and never reach the caller of the versioning operation.
//!
//! Search-index deliveries for one proposal go out in the order they were
//! announced: each waits for the previous one (retries included) to finish,
//! so a retried upsert can never land after a later delete.

pub mod analysis;
pub mod events;
pub mod search;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::{DbId, ProposalSnapshot};

pub use events::{EventBus, ProposalEvent, ProposalEventKind};

/// Header carrying the per-delivery id, reused across retries.
pub(crate) const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// How often and how patiently a delivery is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`; doubles each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Run `op` until it succeeds or the policy gives up.
pub async fn with_retry<F, Fut>(
    target: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<(), NotificationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), NotificationError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(NotificationError::RetriesExhausted {
                    target: target.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                warn!(collaborator = target, attempt, error = %e, "delivery attempt failed, retrying");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }
    }
}

/// Per-proposal delivery queues. Each entry holds the completion signal of
/// the latest delivery queued for that proposal.
#[derive(Default)]
struct DeliveryLanes {
    next_seq: AtomicU64,
    tails: Mutex<HashMap<DbId, (u64, oneshot::Receiver<()>)>>,
}

/// A place in a proposal's lane.
struct Turn {
    lanes: Arc<DeliveryLanes>,
    proposal_id: DbId,
    seq: u64,
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

impl DeliveryLanes {
    fn join(self: &Arc<Self>, proposal_id: DbId) -> Turn {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done, tail) = oneshot::channel();
        let previous = lock_or_recover(&self.tails)
            .insert(proposal_id, (seq, tail))
            .map(|(_, rx)| rx);
        Turn {
            lanes: Arc::clone(self),
            proposal_id,
            seq,
            previous,
            done,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_or_recover(&self.tails).len()
    }
}

impl Turn {
    /// Wait until every earlier delivery in the lane has finished.
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // A dropped sender means the earlier task is gone; go ahead.
            let _ = previous.await;
        }
    }

    fn finish(self) {
        let mut tails = lock_or_recover(&self.lanes.tails);
        if tails
            .get(&self.proposal_id)
            .is_some_and(|(seq, _)| *seq == self.seq)
        {
            tails.remove(&self.proposal_id);
        }
        drop(tails);
        let _ = self.done.send(());
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("notifier lane table was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Unified notifier. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    search: Option<Arc<search::SearchIndexClient>>,
    analysis: Option<Arc<analysis::AnalysisClient>>,
    policy: RetryPolicy,
    bus: Arc<EventBus>,
    lanes: Arc<DeliveryLanes>,
}

impl Notifier {
    /// Create a notifier from the notification configuration.
    pub fn new(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let search = config.search_index_url.as_ref().map(|url| {
            info!("search index notifications enabled");
            Arc::new(search::SearchIndexClient::new(
                url,
                &config.search_index_name,
                http.clone(),
            ))
        });
        let analysis = config.analysis_url.as_ref().map(|url| {
            info!("content analysis notifications enabled");
            Arc::new(analysis::AnalysisClient::new(
                url,
                config.analysis_token.clone(),
                http.clone(),
            ))
        });

        Ok(Self {
            search,
            analysis,
            policy: RetryPolicy::from(config),
            bus: Arc::new(EventBus::default()),
            lanes: Arc::new(DeliveryLanes::default()),
        })
    }

    /// Whether any HTTP collaborator is configured.
    pub fn is_configured(&self) -> bool {
        self.search.is_some() || self.analysis.is_some()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProposalEvent> {
        self.bus.subscribe()
    }

    /// Announce a publish: analysis and search upsert.
    ///
    /// The returned handles finish when the deliveries do; callers that exit
    /// right afterwards (the CLI) await them, long-lived callers drop them.
    pub fn on_published(&self, snapshot: ProposalSnapshot, actor: DbId) -> Vec<JoinHandle<()>> {
        self.bus.publish(
            ProposalEvent::new(ProposalEventKind::Published, snapshot.clone()).with_actor(actor),
        );

        let mut handles = Vec::new();
        if let Some(client) = self.analysis.clone() {
            let snapshot = snapshot.clone();
            handles.push(self.spawn_delivery("analysis", None, move |id| {
                let client = client.clone();
                let snapshot = snapshot.clone();
                async move { client.submit(&snapshot, id).await }
            }));
        }
        if let Some(handle) = self.spawn_index_upsert(snapshot) {
            handles.push(handle);
        }
        handles
    }

    /// Announce a revert: upsert the restored version, or delete the
    /// document when the proposal went back to draft.
    pub fn on_reverted(
        &self,
        snapshot: ProposalSnapshot,
        back_to_draft: bool,
        actor: DbId,
    ) -> Vec<JoinHandle<()>> {
        let kind = if back_to_draft {
            ProposalEventKind::Withdrawn
        } else {
            ProposalEventKind::Reverted
        };
        self.bus
            .publish(ProposalEvent::new(kind, snapshot.clone()).with_actor(actor));

        if !back_to_draft {
            return self.spawn_index_upsert(snapshot).into_iter().collect();
        }
        let Some(client) = self.search.clone() else {
            return Vec::new();
        };
        let proposal_id = snapshot.proposal_id;
        vec![self.spawn_delivery("search_index", Some(proposal_id), move |id| {
            let client = client.clone();
            async move { client.delete(proposal_id, id).await }
        })]
    }

    fn spawn_index_upsert(&self, snapshot: ProposalSnapshot) -> Option<JoinHandle<()>> {
        let client = self.search.clone()?;
        let lane = Some(snapshot.proposal_id);
        Some(self.spawn_delivery("search_index", lane, move |id| {
            let client = client.clone();
            let snapshot = snapshot.clone();
            async move { client.upsert(&snapshot, id).await }
        }))
    }

    /// Spawn one delivery. The same delivery id goes out on every attempt.
    /// Deliveries sharing a `lane` run one after another in call order.
    fn spawn_delivery<F, Fut>(
        &self,
        target: &'static str,
        lane: Option<DbId>,
        send: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Uuid) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), NotificationError>> + Send + 'static,
    {
        let policy = self.policy;
        let delivery_id = Uuid::new_v4();
        let mut turn = lane.map(|proposal_id| self.lanes.join(proposal_id));
        tokio::spawn(async move {
            if let Some(turn) = turn.as_mut() {
                turn.wait().await;
            }
            match with_retry(target, policy, move || send(delivery_id)).await {
                Ok(()) => info!(collaborator = target, %delivery_id, "notification delivered"),
                Err(e) => error!(collaborator = target, %delivery_id, error = %e, "notification dropped"),
            }
            if let Some(turn) = turn {
                turn.finish();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::models::ProposalStatus;

    fn snapshot() -> ProposalSnapshot {
        ProposalSnapshot {
            proposal_id: 8,
            title: "Library hours".into(),
            content: "Open on Sundays".into(),
            version: "0.0.1".into(),
            status: ProposalStatus::Published,
            commit_id: "e".repeat(40),
            fingerprint: "ff".into(),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy(4);
        assert_eq!(p.delay(1), Duration::from_millis(10));
        assert_eq!(p.delay(2), Duration::from_millis(20));
        assert_eq!(p.delay(3), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(NotificationError::SearchIndexError("503".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let err = with_retry("analysis", policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(NotificationError::AnalysisError("500".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err,
            NotificationError::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_notifier_only_uses_bus() {
        let notifier = Notifier::new(&NotificationConfig::default()).unwrap();
        assert!(!notifier.is_configured());
        let mut rx = notifier.subscribe();

        assert!(notifier.on_published(snapshot(), 1).is_empty());
        assert!(notifier.on_reverted(snapshot(), true, 1).is_empty());

        assert_eq!(rx.recv().await.unwrap().kind, ProposalEventKind::Published);
        assert_eq!(rx.recv().await.unwrap().kind, ProposalEventKind::Withdrawn);
    }

    /// Read one request and return its method.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let body_len = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < head_end + body_len {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
        head.split_whitespace().next().unwrap().to_string()
    }

    /// Search index that answers the first PUT with a 503 and everything
    /// else with a 200. Returns its URL and the methods it accepted, in order.
    async fn flaky_index() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut put_failed = false;
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let method = read_request(&mut socket).await;
                let status = if method == "PUT" && !put_failed {
                    put_failed = true;
                    "503 Service Unavailable"
                } else {
                    log.lock().unwrap().push(method);
                    "200 OK"
                };
                let response =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });
        (format!("http://{addr}"), accepted)
    }

    #[tokio::test]
    async fn test_retried_upsert_lands_before_later_delete() {
        let (url, accepted) = flaky_index().await;
        let config = NotificationConfig {
            search_index_url: Some(url),
            max_attempts: 3,
            retry_backoff_ms: 50,
            ..NotificationConfig::default()
        };
        let notifier = Notifier::new(&config).unwrap();

        let mut handles = notifier.on_published(snapshot(), 1);
        let mut withdrawn = snapshot();
        withdrawn.status = ProposalStatus::Draft;
        handles.extend(notifier.on_reverted(withdrawn, true, 1));
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*accepted.lock().unwrap(), vec!["PUT", "DELETE"]);
        assert_eq!(notifier.lanes.len(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_collaborator_is_swallowed() {
        let config = NotificationConfig {
            search_index_url: Some("http://127.0.0.1:1".into()),
            max_attempts: 2,
            retry_backoff_ms: 5,
            ..NotificationConfig::default()
        };
        let notifier = Notifier::new(&config).unwrap();
        let handles = notifier.on_published(snapshot(), 1);
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
