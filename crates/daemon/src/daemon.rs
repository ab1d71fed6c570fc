//! The daemon: one task owning the [`Engine`], serving local clients over
//! TCP.
//!
//! Each connection runs in its own task that decodes frames and forwards
//! them to the daemon task over a channel. The daemon task processes
//! messages one at a time, in arrival order per client, and alternates
//! between client messages and dispatcher completions. Storage requests never
//! run inline: a `READ` for a block that is being downloaded, an `ATTACH`, a
//! poll, a `DETACH` of a busy container and a `bcv_kv` query are answered when
//! the engine reports the work done. Every other message is answered before
//! the next one is taken.

use crate::cache::CacheKey;
use crate::engine::{Engine, EngineEvent};
use crate::error::{BcvError, BcvResult, ErrorInfo};
use crate::lifecycle::Attaching;
use crate::protocol::{BcvCodec, CMD_POLL, Message};
use crate::vtab;
use bcv_core::{BlockId, DbId, Manifest};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

type ClientId = u64;

/// Messages from connection tasks to the daemon task.
#[derive(Debug)]
enum DaemonEvent {
    Connected {
        client: ClientId,
        peer: SocketAddr,
        tx: mpsc::UnboundedSender<Message>,
    },
    Message {
        client: ClientId,
        msg: Message,
    },
    Disconnected {
        client: ClientId,
    },
}

/// An open read transaction: the manifest it started with and the cache
/// slots pinned on the client's behalf, one per block.
struct Txn {
    manifest: Arc<Manifest>,
    db: usize,
    pins: Vec<Option<u32>>,
}

impl Txn {
    fn blocks(&self) -> &[BlockId] {
        &self.manifest.dbs[self.db].local
    }
}

struct PendingPrefetch {
    deadline: Instant,
    slots: HashSet<u32>,
}

struct Client {
    tx: mpsc::UnboundedSender<Message>,
    peer: SocketAddr,
    alias: Option<Arc<str>>,
    db_id: Option<DbId>,
    txn: Option<Txn>,
    /// Slot of the block a deferred `READ` is waiting for.
    waiting: Option<u32>,
    prefetch: Option<PendingPrefetch>,
}

impl Client {
    fn send(&self, msg: Message) {
        // The connection task is gone; its Disconnected event follows.
        let _ = self.tx.send(msg);
    }
}

/// Handle to a running daemon.
pub struct DaemonHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<BcvResult<()>>,
}

impl DaemonHandle {
    /// Address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting clients and wait for the daemon task to finish.
    pub async fn shutdown(self) -> BcvResult<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| BcvError::Internal(format!("daemon task failed: {e}")))?
    }
}

/// Bind `engine.config().bind` and run the daemon in a background task.
pub async fn spawn(engine: Engine) -> BcvResult<DaemonHandle> {
    let listener = TcpListener::bind(&engine.config().bind).await?;
    let addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(engine, listener, shutdown_rx));
    Ok(DaemonHandle {
        addr,
        shutdown,
        task,
    })
}

/// Serve clients on `listener` until `shutdown` turns true.
pub async fn run(
    engine: Engine,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> BcvResult<()> {
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let accept = tokio::spawn(accept_loop(listener, events_tx, shutdown.clone()));

    let config = engine.config().clone();
    let mut daemon = Daemon {
        engine,
        clients: HashMap::new(),
        block_waiters: HashMap::new(),
        poll_waiters: HashMap::new(),
        attach_waiters: HashMap::new(),
        detach_waiters: HashMap::new(),
        kv_waiters: HashMap::new(),
    };
    let mut poll_timer = interval(config.poll_secs);
    let mut gc_timer = interval(config.gc_secs);
    let retain = Duration::from_secs(config.delete_secs);
    info!(
        poll_secs = config.poll_secs,
        gc_secs = config.gc_secs,
        n_request = config.n_request,
        "daemon running"
    );

    loop {
        let deadline = daemon.next_prefetch_deadline();
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events_rx.recv() => match event {
                Some(event) => daemon.on_event(event).await,
                None => break,
            },
            Some(completion) = daemon.engine.next_completion(), if !daemon.engine.is_idle() => {
                daemon.engine.on_completion(completion).await;
            }
            _ = poll_timer.tick(), if config.poll_secs > 0 => daemon.poll_all(),
            _ = gc_timer.tick(), if config.gc_secs > 0 => daemon.cleanup_all(retain),
            _ = sleep_until(deadline), if deadline.is_some() => daemon.expire_prefetches(),
        }
        daemon.drain_engine_events();
    }

    accept.abort();
    info!(clients = daemon.clients.len(), "daemon stopped");
    Ok(())
}

fn interval(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<DaemonEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id: ClientId = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    tokio::spawn(connection(next_id, stream, peer, events.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

/// Shuttle frames between one socket and the daemon task.
async fn connection(
    client: ClientId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<DaemonEvent>,
) {
    let _ = stream.set_nodelay(true);
    let (tx, mut replies) = mpsc::unbounded_channel();
    let mut framed = Framed::new(stream, BcvCodec);
    if events
        .send(DaemonEvent::Connected { client, peer, tx })
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(msg)) => {
                    if events.send(DaemonEvent::Message { client, msg }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(client, %peer, error = %e, "malformed frame; disconnecting");
                    break;
                }
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        debug!(client, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = events.send(DaemonEvent::Disconnected { client }).await;
}

struct Daemon {
    engine: Engine,
    clients: HashMap<ClientId, Client>,
    /// Clients with a deferred `READ`, by cache slot.
    block_waiters: HashMap<u32, Vec<ClientId>>,
    /// Clients waiting for a poll to finish, by container alias.
    poll_waiters: HashMap<Arc<str>, Vec<ClientId>>,
    attach_waiters: HashMap<Arc<str>, Vec<ClientId>>,
    detach_waiters: HashMap<Arc<str>, Vec<ClientId>>,
    /// Clients waiting for a `bcv_kv` query, with the columns they asked for.
    kv_waiters: HashMap<Arc<str>, Vec<(ClientId, u64)>>,
}

impl Daemon {
    async fn on_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Connected { client, peer, tx } => {
                info!(client, %peer, "client connected");
                self.clients.insert(
                    client,
                    Client {
                        tx,
                        peer,
                        alias: None,
                        db_id: None,
                        txn: None,
                        waiting: None,
                        prefetch: None,
                    },
                );
            }
            DaemonEvent::Message { client, msg } => {
                debug!(client, msg = msg.name(), "message");
                let reply_to = msg.clone();
                match self.on_message(client, msg).await {
                    Ok(Some(reply)) => self.send(client, reply),
                    Ok(None) => {}
                    Err(e) => {
                        debug!(client, msg = reply_to.name(), error = %e, "request failed");
                        if let Some(reply) = reply_to.error_reply(e.code(), e.to_string()) {
                            self.send(client, reply);
                        }
                    }
                }
            }
            DaemonEvent::Disconnected { client } => self.disconnect(client).await,
        }
    }

    fn send(&self, client: ClientId, msg: Message) {
        if let Some(c) = self.clients.get(&client) {
            c.send(msg);
        }
    }

    fn client_mut(&mut self, client: ClientId) -> BcvResult<&mut Client> {
        self.clients
            .get_mut(&client)
            .ok_or_else(|| BcvError::Internal(format!("unknown client {client}")))
    }

    /// Alias and database the client said HELLO to.
    fn bound(&self, client: ClientId) -> BcvResult<(Arc<str>, Option<DbId>)> {
        let c = self
            .clients
            .get(&client)
            .ok_or_else(|| BcvError::Internal(format!("unknown client {client}")))?;
        let alias = c
            .alias
            .clone()
            .ok_or_else(|| BcvError::Misuse("HELLO required first".to_string()))?;
        Ok((alias, c.db_id))
    }

    fn set_auth(&self, alias: &str, auth: Option<String>) -> BcvResult<()> {
        if let Some(token) = auth {
            self.engine.container(alias)?.handle.set_auth(Some(token));
        }
        Ok(())
    }

    /// Handle one message. `Ok(None)` means no reply now: the message gets
    /// none, or it is answered later.
    async fn on_message(&mut self, client: ClientId, msg: Message) -> BcvResult<Option<Message>> {
        match msg {
            Message::Hello {
                container,
                database,
            } => self
                .hello(client, &container, database.as_deref())
                .await
                .map(Some),
            Message::Attach {
                storage,
                account,
                container,
                alias,
                auth,
                flags,
            } => {
                let started = self
                    .engine
                    .start_attach(&storage, &account, &container, alias.as_deref(), auth, flags)
                    .await?;
                match started {
                    Attaching::Done(_) => Ok(Some(ok_reply())),
                    Attaching::Started(alias) => {
                        self.attach_waiters.entry(alias).or_default().push(client);
                        Ok(None)
                    }
                }
            }
            Message::Detach { alias } => {
                if self.engine.request_detach(&alias).await? {
                    return Ok(Some(ok_reply()));
                }
                self.detach_waiters
                    .entry(Arc::from(alias))
                    .or_default()
                    .push(client);
                Ok(None)
            }
            Message::Read { block, auth, mru } => self.read(client, block, auth, &mru).await,
            Message::End { mru } => {
                self.touch_mru(client, &mru);
                self.end_txn(client);
                Ok(None)
            }
            Message::Cmd { cmd, auth } => {
                if cmd != CMD_POLL {
                    return Err(BcvError::Misuse(format!("unknown command {cmd}")));
                }
                let (alias, _) = self.bound(client)?;
                self.set_auth(&alias, auth)?;
                self.engine.start_poll(&alias)?;
                self.poll_waiters.entry(alias).or_default().push(client);
                Ok(None)
            }
            Message::Pass { auth } => {
                let (alias, _) = self.bound(client)?;
                self.set_auth(&alias, auth)?;
                let key = self.engine.encryption_key(&alias)?;
                Ok(Some(Message::PassReply {
                    err_code: 0,
                    err_msg: None,
                    key: key.map(|k| k.to_vec()).unwrap_or_default(),
                }))
            }
            Message::Prefetch {
                auth,
                n_request,
                timeout_ms,
            } => self.prefetch(client, auth, n_request, timeout_ms).await,
            Message::Vtab {
                table,
                container,
                database,
                col_used,
            } => {
                if table == vtab::BCV_KV {
                    let alias = match container {
                        Some(alias) => Arc::from(alias),
                        None => self.bound(client)?.0,
                    };
                    self.engine.start_kv_load(&alias)?;
                    self.kv_waiters
                        .entry(alias)
                        .or_default()
                        .push((client, col_used));
                    return Ok(None);
                }
                let rows = vtab::rows(
                    &self.engine,
                    &table,
                    container.as_deref(),
                    database.as_deref(),
                    col_used,
                )?;
                Ok(Some(Message::VtabReply {
                    err_code: 0,
                    err_msg: None,
                    rows,
                }))
            }
            other => Err(BcvError::Protocol(format!(
                "unexpected {} from client",
                other.name()
            ))),
        }
    }

    async fn hello(
        &mut self,
        client: ClientId,
        alias: &str,
        database: Option<&str>,
    ) -> BcvResult<Message> {
        let (shared, db_id, reply) = {
            let container = self.engine.container(alias)?;
            if container.detach_pending {
                return Err(BcvError::Busy(format!("{alias} is being detached")));
            }
            let db_id = match database {
                Some(name) => Some(container.manifest.db(name)?.id),
                None => None,
            };
            let reply = Message::HelloReply {
                err_code: 0,
                err_msg: None,
                storage: Some(container.storage.clone()),
                account: Some(container.account.clone()),
                container: Some(container.remote.clone()),
                db_id,
                block_size: container.manifest.block_size,
                encrypted: container.is_secure(),
            };
            (container.alias.clone(), db_id, reply)
        };
        self.engine.container_mut(alias)?.n_client += 1;
        self.end_txn(client);
        self.release_container(client).await;
        let c = self.client_mut(client)?;
        c.alias = Some(shared);
        c.db_id = db_id;
        Ok(reply)
    }

    async fn read(
        &mut self,
        client: ClientId,
        block: u32,
        auth: Option<String>,
        mru: &[u32],
    ) -> BcvResult<Option<Message>> {
        let (alias, db_id) = self.bound(client)?;
        let db_id = db_id.ok_or_else(|| BcvError::Misuse("no database selected".to_string()))?;
        self.set_auth(&alias, auth)?;
        self.touch_mru(client, mru);

        if self.clients.get(&client).is_some_and(|c| c.txn.is_none()) {
            let manifest = self.engine.container(&alias)?.manifest.clone();
            let db = manifest.find_db_by_id(&db_id).ok_or_else(|| {
                bcv_core::Error::NoSuchDatabase(format!("{db_id} in {alias}"))
            })?;
            let pins = vec![None; manifest.dbs[db].local.len()];
            self.client_mut(client)?.txn = Some(Txn { manifest, db, pins });
        }

        let id = {
            let c = self.client_mut(client)?;
            let Some(txn) = &c.txn else {
                return Err(BcvError::Internal("transaction vanished".to_string()));
            };
            let blocks = txn.blocks();
            match blocks.get(block as usize) {
                Some(id) => *id,
                None => {
                    return Err(bcv_core::Error::BlockOutOfRange {
                        name: txn.manifest.dbs[txn.db].name.clone(),
                        index: block,
                        count: blocks.len() as u32,
                    }
                    .into());
                }
            }
        };

        let slot = self.engine.start_fetch(&alias, id).await?;
        if self.engine.cache().entry(slot).valid {
            return self.read_reply(client).map(Some);
        }
        debug!(client, block, slot, id = %id, "waiting for download");
        self.client_mut(client)?.waiting = Some(slot);
        self.block_waiters.entry(slot).or_default().push(client);
        Ok(None)
    }

    /// Pin every cached block of the transaction and describe where each is.
    fn read_reply(&mut self, client: ClientId) -> BcvResult<Message> {
        let Self {
            engine, clients, ..
        } = self;
        let c = clients
            .get_mut(&client)
            .ok_or_else(|| BcvError::Internal(format!("unknown client {client}")))?;
        let Some(txn) = c.txn.as_mut() else {
            return Err(BcvError::Misuse("no open transaction".to_string()));
        };
        let blocks = txn.manifest.dbs[txn.db].local.clone();
        let mut map = Vec::with_capacity(blocks.len());
        for (i, id) in blocks.iter().enumerate() {
            if txn.pins[i].is_none()
                && let Some(slot) = engine.cache().find(&CacheKey::Clean(*id))
                && engine.cache().entry(slot).valid
            {
                engine.cache.pin(slot);
                txn.pins[i] = Some(slot);
            }
            map.push(txn.pins[i].map_or(0, |slot| slot + 1));
        }
        Ok(Message::ReadReply {
            err_code: 0,
            err_msg: None,
            blocks: map,
        })
    }

    fn touch_mru(&mut self, client: ClientId, mru: &[u32]) {
        let Some(txn) = self.clients.get(&client).and_then(|c| c.txn.as_ref()) else {
            return;
        };
        let slots: Vec<u32> = mru
            .iter()
            .filter_map(|&i| txn.pins.get(i as usize).copied().flatten())
            .collect();
        for slot in slots {
            self.engine.cache.touch(slot);
        }
    }

    fn end_txn(&mut self, client: ClientId) {
        let Some(txn) = self.clients.get_mut(&client).and_then(|c| c.txn.take()) else {
            return;
        };
        for slot in txn.pins.into_iter().flatten() {
            self.engine.cache.unpin(slot);
        }
    }

    /// Unbind the client from its container. A detach waiting for the
    /// last client completes here.
    async fn release_container(&mut self, client: ClientId) {
        let Some(alias) = self.clients.get_mut(&client).and_then(|c| c.alias.take()) else {
            return;
        };
        self.engine.release_client(&alias).await;
    }

    async fn disconnect(&mut self, client: ClientId) {
        self.end_txn(client);
        self.release_container(client).await;
        for waiters in self.block_waiters.values_mut() {
            waiters.retain(|c| *c != client);
        }
        for waiters in self
            .poll_waiters
            .values_mut()
            .chain(self.attach_waiters.values_mut())
            .chain(self.detach_waiters.values_mut())
        {
            waiters.retain(|c| *c != client);
        }
        for waiters in self.kv_waiters.values_mut() {
            waiters.retain(|(c, _)| *c != client);
        }
        if let Some(c) = self.clients.remove(&client) {
            info!(client, peer = %c.peer, "client disconnected");
        }
    }

    /// Blocks of the client's database that are not cached, and the
    /// downloads running for it.
    fn prefetch_status(&self, alias: &str, db_id: &DbId) -> BcvResult<(Vec<BlockId>, Vec<u32>)> {
        let container = self.engine.container(alias)?;
        let db = container
            .manifest
            .find_db_by_id(db_id)
            .map(|i| &container.manifest.dbs[i])
            .ok_or_else(|| bcv_core::Error::NoSuchDatabase(format!("{db_id} in {alias}")))?;
        let cache = self.engine.cache();
        let mut missing = Vec::new();
        let mut downloading = Vec::new();
        let mut seen = HashSet::new();
        for id in db.local.iter().filter(|id| seen.insert(**id)) {
            match cache.find(&CacheKey::Clean(*id)) {
                Some(slot) if cache.entry(slot).valid => {}
                Some(slot) => downloading.push(slot),
                None => missing.push(*id),
            }
        }
        Ok((missing, downloading))
    }

    async fn prefetch(
        &mut self,
        client: ClientId,
        auth: Option<String>,
        n_request: u32,
        timeout_ms: u32,
    ) -> BcvResult<Option<Message>> {
        let (alias, db_id) = self.bound(client)?;
        let db_id = db_id.ok_or_else(|| BcvError::Misuse("no database selected".to_string()))?;
        self.set_auth(&alias, auth)?;
        let (missing, mut downloading) = self.prefetch_status(&alias, &db_id)?;

        let limit = (n_request as usize).clamp(1, self.engine.config().n_request);
        for id in missing {
            if downloading.len() >= limit {
                break;
            }
            downloading.push(self.engine.start_fetch(&alias, id).await?);
        }
        if downloading.is_empty() {
            return Ok(Some(Message::PrefetchReply {
                err_code: 0,
                err_msg: None,
                n_on_demand: 0,
                n_outstanding: 0,
            }));
        }
        self.client_mut(client)?.prefetch = Some(PendingPrefetch {
            deadline: Instant::now() + Duration::from_millis(u64::from(timeout_ms)),
            slots: downloading.into_iter().collect(),
        });
        Ok(None)
    }

    fn prefetch_reply(&self, client: ClientId, error: Option<ErrorInfo>) -> Message {
        if let Some(info) = error {
            return Message::PrefetchReply {
                err_code: info.code,
                err_msg: Some(info.message),
                n_on_demand: 0,
                n_outstanding: 0,
            };
        }
        let status = self
            .bound(client)
            .and_then(|(alias, db)| match db {
                Some(db) => self.prefetch_status(&alias, &db),
                None => Ok((Vec::new(), Vec::new())),
            });
        match status {
            Ok((missing, downloading)) => Message::PrefetchReply {
                err_code: 0,
                err_msg: None,
                n_on_demand: missing.len() as u32,
                n_outstanding: downloading.len() as u32,
            },
            Err(e) => Message::PrefetchReply {
                err_code: e.code(),
                err_msg: Some(e.to_string()),
                n_on_demand: 0,
                n_outstanding: 0,
            },
        }
    }

    fn next_prefetch_deadline(&self) -> Option<Instant> {
        self.clients
            .values()
            .filter_map(|c| c.prefetch.as_ref().map(|p| p.deadline))
            .min()
    }

    fn expire_prefetches(&mut self) {
        let now = Instant::now();
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.prefetch.as_ref().is_some_and(|p| p.deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for client in expired {
            if let Some(c) = self.clients.get_mut(&client) {
                c.prefetch = None;
            }
            let reply = self.prefetch_reply(client, None);
            self.send(client, reply);
        }
    }

    /// Start a poll of every container. Busy containers poll once their
    /// running operation ends.
    fn poll_all(&mut self) {
        let aliases: Vec<String> = self
            .engine
            .containers()
            .filter(|c| !c.detach_pending)
            .map(|c| c.alias.to_string())
            .collect();
        for alias in aliases {
            if let Err(e) = self.engine.start_poll(&alias) {
                warn!(alias, error = %e, "periodic poll not started");
            }
        }
    }

    /// Start a cleanup of every writable container. The outcome arrives as
    /// [`EngineEvent::Cleaned`].
    fn cleanup_all(&mut self, retain: Duration) {
        let writable: Vec<String> = self
            .engine
            .containers()
            .filter(|c| !c.is_readonly() && !c.detach_pending)
            .map(|c| c.alias.to_string())
            .collect();
        for alias in writable {
            if let Err(e) = self.engine.start_cleanup(&alias, retain) {
                warn!(alias, error = %e, "periodic cleanup not started");
            }
        }
    }

    /// Fan engine events out to the clients waiting on them.
    #[instrument(level = "trace", skip(self))]
    fn drain_engine_events(&mut self) {
        for event in self.engine.take_events() {
            match event {
                EngineEvent::BlockReady { slot, result } => self.on_block_ready(slot, result),
                EngineEvent::Polled { alias, result } => {
                    let waiters = self.poll_waiters.remove(&alias);
                    self.reply_all(waiters, status_reply(result.map(|_| ())));
                }
                EngineEvent::Attached { alias, result } => {
                    let waiters = self.attach_waiters.remove(&alias);
                    self.reply_all(waiters, status_reply(result));
                }
                EngineEvent::Detached { alias, result } => {
                    let waiters = self.detach_waiters.remove(&alias);
                    self.reply_all(waiters, status_reply(result));
                }
                EngineEvent::Cleaned { alias, result } => {
                    debug!(container = %alias, ok = result.is_ok(), "background cleanup done");
                }
                EngineEvent::KvLoaded { alias, result } => self.on_kv_loaded(&alias, result),
            }
        }
    }

    fn reply_all(&self, waiters: Option<Vec<ClientId>>, reply: Message) {
        for client in waiters.unwrap_or_default() {
            self.send(client, reply.clone());
        }
    }

    fn on_kv_loaded(&mut self, alias: &Arc<str>, result: Result<(), ErrorInfo>) {
        for (client, col_used) in self.kv_waiters.remove(alias).unwrap_or_default() {
            let rows = match &result {
                Ok(()) => vtab::rows(&self.engine, vtab::BCV_KV, Some(&**alias), None, col_used)
                    .map_err(|e| ErrorInfo::from(&e)),
                Err(info) => Err(info.clone()),
            };
            let reply = match rows {
                Ok(rows) => Message::VtabReply {
                    err_code: 0,
                    err_msg: None,
                    rows,
                },
                Err(info) => Message::VtabReply {
                    err_code: info.code,
                    err_msg: Some(info.message),
                    rows: "[]".to_string(),
                },
            };
            self.send(client, reply);
        }
    }

    fn on_block_ready(&mut self, slot: u32, result: Result<(), ErrorInfo>) {
        for client in self.block_waiters.remove(&slot).unwrap_or_default() {
            let Some(c) = self.clients.get_mut(&client) else {
                continue;
            };
            if c.waiting != Some(slot) {
                continue;
            }
            c.waiting = None;
            let reply = match &result {
                Ok(()) => self.read_reply(client).unwrap_or_else(|e| Message::ReadReply {
                    err_code: e.code(),
                    err_msg: Some(e.to_string()),
                    blocks: Vec::new(),
                }),
                Err(info) => Message::ReadReply {
                    err_code: info.code,
                    err_msg: Some(info.message.clone()),
                    blocks: Vec::new(),
                },
            };
            self.send(client, reply);
        }

        let prefetching: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.prefetch.as_ref().is_some_and(|p| p.slots.contains(&slot)))
            .map(|(id, _)| *id)
            .collect();
        for client in prefetching {
            if let Some(c) = self.clients.get_mut(&client) {
                c.prefetch = None;
            }
            let reply = self.prefetch_reply(client, result.clone().err());
            self.send(client, reply);
        }
    }
}

fn ok_reply() -> Message {
    Message::Reply {
        err_code: 0,
        err_msg: None,
    }
}

fn status_reply(result: Result<(), ErrorInfo>) -> Message {
    match result {
        Ok(()) => ok_reply(),
        Err(info) => Message::Reply {
            err_code: info.code,
            err_msg: Some(info.message),
        },
    }
}
