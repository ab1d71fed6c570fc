//! Dispatch engine for storage requests.
//!
//! Requests are spawned onto a [`JoinSet`], at most `n_request` at a time;
//! the rest wait in a FIFO queue. Each request carries a caller-defined tag
//! that comes back with its [`Completion`]. Failures are reported as they
//! happen: retrying is the caller's decision.

use bcv_storage::{
    CloudStorage, ContinuationToken, FetchCondition, Fetched, ListingPage, PutCondition,
    StorageError, StorageResult,
};
use bytes::Bytes;
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One storage operation.
#[derive(Debug, Clone)]
pub enum Request {
    Fetch {
        key: String,
        condition: FetchCondition,
    },
    Put {
        key: String,
        data: Bytes,
        condition: PutCondition,
    },
    Delete {
        key: String,
        etag: Option<String>,
    },
    List {
        prefix: String,
        marker: Option<ContinuationToken>,
    },
    Create,
    Destroy,
}

impl Request {
    /// Short operation name for log fields.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
            Self::List { .. } => "list",
            Self::Create => "create",
            Self::Destroy => "destroy",
        }
    }

    /// Object key or prefix the request targets, empty for container-wide
    /// operations.
    pub fn key(&self) -> &str {
        match self {
            Self::Fetch { key, .. } | Self::Put { key, .. } | Self::Delete { key, .. } => key,
            Self::List { prefix, .. } => prefix,
            Self::Create | Self::Destroy => "",
        }
    }

    async fn execute(&self, storage: &dyn CloudStorage) -> StorageResult<Response> {
        match self {
            Self::Fetch { key, condition } => storage
                .fetch(key, condition.clone())
                .await
                .map(Response::Fetched),
            Self::Put {
                key,
                data,
                condition,
            } => storage
                .put(key, data.clone(), condition.clone())
                .await
                .map(|etag| Response::Stored { etag }),
            Self::Delete { key, etag } => storage
                .delete(key, etag.as_deref())
                .await
                .map(|()| Response::Deleted),
            Self::List { prefix, marker } => storage
                .list(prefix, marker.clone())
                .await
                .map(Response::Listed),
            Self::Create => storage.create().await.map(|()| Response::Created),
            Self::Destroy => storage.destroy().await.map(|()| Response::Destroyed),
        }
    }
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone)]
pub enum Response {
    Fetched(Fetched),
    Stored { etag: String },
    Deleted,
    Listed(ListingPage),
    Created,
    Destroyed,
}

/// A request ready to be dispatched.
pub struct Job<T> {
    pub tag: T,
    pub storage: Arc<dyn CloudStorage>,
    pub request: Request,
    /// Wait this long before issuing the request.
    pub delay: Duration,
    /// Number of transient-failure retries already made.
    pub attempt: u32,
    /// Number of re-authentication retries already made.
    pub auth_retries: u32,
}

impl<T> Job<T> {
    /// A first attempt at `request`.
    pub fn new(tag: T, storage: Arc<dyn CloudStorage>, request: Request) -> Self {
        Self {
            tag,
            storage,
            request,
            delay: Duration::ZERO,
            attempt: 0,
            auth_retries: 0,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("tag", &self.tag)
            .field("container", &self.storage.container())
            .field("op", &self.request.op())
            .field("key", &self.request.key())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

struct Ticket<T> {
    tag: T,
    storage: Arc<dyn CloudStorage>,
    attempt: u32,
    auth_retries: u32,
}

/// Outcome of a dispatched request.
pub struct Completion<T> {
    pub tag: T,
    pub storage: Arc<dyn CloudStorage>,
    pub attempt: u32,
    pub auth_retries: u32,
    /// The request, handed back so it can be re-issued.
    pub request: Request,
    pub result: StorageResult<Response>,
}

impl<T> Completion<T> {
    /// A job re-issuing this request after `delay`, counting one more
    /// transient retry.
    pub fn into_retry(self, delay: Duration) -> Job<T> {
        Job {
            tag: self.tag,
            storage: self.storage,
            request: self.request,
            delay,
            attempt: self.attempt + 1,
            auth_retries: self.auth_retries,
        }
    }

    /// A job re-issuing this request immediately, counting one more
    /// re-authentication retry.
    pub fn into_auth_retry(self) -> Job<T> {
        Job {
            tag: self.tag,
            storage: self.storage,
            request: self.request,
            delay: Duration::ZERO,
            attempt: self.attempt,
            auth_retries: self.auth_retries + 1,
        }
    }
}

/// Bounded-concurrency request multiplexer.
pub struct Dispatcher<T> {
    n_request: usize,
    timeout: Duration,
    running: JoinSet<(Ticket<T>, Request, StorageResult<Response>)>,
    pending: VecDeque<Job<T>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Create a dispatcher running at most `n_request` requests at once,
    /// each bounded by `timeout`.
    pub fn new(n_request: usize, timeout: Duration) -> Self {
        Self {
            n_request: n_request.max(1),
            timeout,
            running: JoinSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// Queue a request, starting it at once if below the concurrency limit.
    pub fn submit(&mut self, job: Job<T>) {
        if self.running.len() < self.n_request {
            self.spawn(job);
        } else {
            self.pending.push_back(job);
        }
    }

    fn spawn(&mut self, job: Job<T>) {
        let Job {
            tag,
            storage,
            request,
            delay,
            attempt,
            auth_retries,
        } = job;
        debug!(
            op = request.op(),
            key = request.key(),
            container = storage.container(),
            attempt,
            "issuing request"
        );
        let ticket = Ticket {
            tag,
            storage,
            attempt,
            auth_retries,
        };
        let timeout = self.timeout;
        self.running.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let call = AssertUnwindSafe(request.execute(ticket.storage.as_ref())).catch_unwind();
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(StorageError::Io(std::io::Error::other(format!(
                    "{} {} panicked",
                    request.op(),
                    request.key()
                )))),
                Err(_) => Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{} {} timed out after {timeout:?}", request.op(), request.key()),
                ))),
            };
            (ticket, request, result)
        });
    }

    fn refill(&mut self) {
        while self.running.len() < self.n_request {
            match self.pending.pop_front() {
                Some(job) => self.spawn(job),
                None => break,
            }
        }
    }

    /// Requests running or queued.
    pub fn outstanding(&self) -> usize {
        self.running.len() + self.pending.len()
    }

    /// Requests currently running.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// True when nothing is running or queued.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    /// Wait for the next request to complete. Returns `None` when idle.
    ///
    /// Cancel safe: dropping the future loses no completion.
    pub async fn next(&mut self) -> Option<Completion<T>> {
        loop {
            let joined = self.running.join_next().await?;
            self.refill();
            let (ticket, request, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "request task cancelled");
                    continue;
                }
            };
            if let Err(e) = &result {
                debug!(status = ?e.status(), error = %e, "request failed");
            }
            return Some(Completion {
                tag: ticket.tag,
                storage: ticket.storage,
                attempt: ticket.attempt,
                auth_retries: ticket.auth_retries,
                request,
                result,
            });
        }
    }

    /// Collect completions until `timeout` elapses or nothing is left.
    pub async fn run(&mut self, timeout: Duration) -> Vec<Completion<T>> {
        let deadline = Instant::now() + timeout;
        let mut done = Vec::new();
        while !self.is_idle() {
            match tokio::time::timeout_at(deadline, self.next()).await {
                Ok(Some(completion)) => done.push(completion),
                Ok(None) | Err(_) => break,
            }
        }
        done
    }

    /// Collect completions until nothing is left.
    pub async fn run_all(&mut self) -> Vec<Completion<T>> {
        let mut done = Vec::new();
        while let Some(completion) = self.next().await {
            done.push(completion);
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcv_storage::{MemoryAccount, MemoryBackend, StorageOp};

    async fn storage() -> (Arc<MemoryAccount>, Arc<dyn CloudStorage>) {
        let account = MemoryAccount::new("acct");
        let backend: Arc<dyn CloudStorage> =
            Arc::new(MemoryBackend::new(account.clone(), "cont", None));
        backend.create().await.unwrap();
        (account, backend)
    }

    fn put(key: &str) -> Request {
        Request::Put {
            key: key.to_string(),
            data: Bytes::from_static(b"x"),
            condition: PutCondition::None,
        }
    }

    #[tokio::test]
    async fn test_bounded_concurrency_and_tags() {
        let (account, storage) = storage().await;
        let mut disp = Dispatcher::new(2, Duration::from_secs(5));
        for i in 0..5u32 {
            disp.submit(Job::new(i, storage.clone(), put(&format!("k{i}.bcv"))));
            assert!(disp.in_flight() <= 2);
        }
        assert_eq!(disp.outstanding(), 5);

        let mut tags: Vec<u32> = disp
            .run_all()
            .await
            .into_iter()
            .map(|c| {
                assert!(matches!(c.result, Ok(Response::Stored { .. })));
                c.tag
            })
            .collect();
        tags.sort();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert!(disp.is_idle());
        assert_eq!(account.request_count(StorageOp::Put), 5);
    }

    #[tokio::test]
    async fn test_failures_pass_status_through_without_retry() {
        let (account, storage) = storage().await;
        account.fail_next(StorageOp::Fetch, 503);
        let mut disp = Dispatcher::new(4, Duration::from_secs(5));
        disp.submit(Job::new(
            "missing",
            storage.clone(),
            Request::Fetch {
                key: "nothing.bcv".to_string(),
                condition: FetchCondition::None,
            },
        ));
        let done = disp.run_all().await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result.as_ref().unwrap_err().status(), Some(503));
        assert_eq!(account.request_count(StorageOp::Fetch), 1);

        let retry = done.into_iter().next().unwrap().into_retry(Duration::ZERO);
        assert_eq!(retry.attempt, 1);
        disp.submit(retry);
        let done = disp.run_all().await;
        assert_eq!(done[0].result.as_ref().unwrap_err().status(), Some(404));
    }

    #[tokio::test]
    async fn test_run_stops_at_timeout() {
        let (_account, storage) = storage().await;
        let mut disp = Dispatcher::new(1, Duration::from_secs(5));
        let mut job = Job::new((), storage, put("slow.bcv"));
        job.delay = Duration::from_secs(30);
        disp.submit(job);
        let done = disp.run(Duration::from_millis(20)).await;
        assert!(done.is_empty());
        assert_eq!(disp.outstanding(), 1);
    }
}
