//! Client side of the daemon protocol.

use crate::auth::{AuthProvider, AuthTarget};
use crate::error::{BcvError, BcvResult};
use crate::protocol::{BcvCodec, CMD_POLL, Message};
use bcv_core::DbId;
use bcv_core::retry::HTTP_AUTH_ERROR;
use futures::{SinkExt, StreamExt};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// What the daemon reports about the container a client said HELLO to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub storage: String,
    pub account: String,
    pub container: String,
    pub db_id: Option<DbId>,
    pub block_size: u32,
    pub encrypted: bool,
}

/// Progress of a daemon-side prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchStatus {
    /// Blocks neither cached nor being downloaded.
    pub n_on_demand: u32,
    /// Downloads still running.
    pub n_outstanding: u32,
}

/// A connection to a running daemon.
///
/// Requests are not pipelined: each call sends one message and waits for
/// its reply.
pub struct DaemonClient {
    framed: Framed<TcpStream, BcvCodec>,
    auth: Option<Arc<dyn AuthProvider>>,
    target: Option<AuthTarget>,
    token: Option<String>,
}

impl DaemonClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> BcvResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, BcvCodec),
            auth: None,
            target: None,
            token: None,
        })
    }

    /// Refresh credentials through `provider` when the daemon reports `403`.
    pub fn with_auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    async fn send(&mut self, msg: Message) -> BcvResult<()> {
        self.framed.send(msg).await
    }

    async fn request(&mut self, msg: Message) -> BcvResult<Message> {
        self.send(msg).await?;
        match self.framed.next().await {
            Some(reply) => reply,
            None => Err(BcvError::Protocol("daemon closed the connection".to_string())),
        }
    }

    /// Ask the provider for a new token. Returns false if none was issued.
    async fn refresh_auth(&mut self) -> bool {
        let (Some(provider), Some(target)) = (&self.auth, &self.target) else {
            return false;
        };
        match provider.refresh(target).await {
            Some(token) => {
                info!(container = %target.container, "retrying with refreshed credential");
                self.token = Some(token);
                true
            }
            None => false,
        }
    }

    pub async fn hello(&mut self, container: &str, database: Option<&str>) -> BcvResult<HelloInfo> {
        let reply = self
            .request(Message::Hello {
                container: container.to_string(),
                database: database.map(str::to_string),
            })
            .await?;
        let Message::HelloReply {
            err_code,
            err_msg,
            storage,
            account,
            container: remote,
            db_id,
            block_size,
            encrypted,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        check(err_code, err_msg)?;
        let info = HelloInfo {
            storage: storage.unwrap_or_default(),
            account: account.unwrap_or_default(),
            container: remote.unwrap_or_default(),
            db_id,
            block_size,
            encrypted,
        };
        self.target = Some(AuthTarget {
            storage: info.storage.clone(),
            account: info.account.clone(),
            container: info.container.clone(),
        });
        Ok(info)
    }

    pub async fn attach(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        alias: Option<&str>,
        auth: Option<&str>,
        flags: u32,
    ) -> BcvResult<()> {
        let reply = self
            .request(Message::Attach {
                storage: storage.to_string(),
                account: account.to_string(),
                container: container.to_string(),
                alias: alias.map(str::to_string),
                auth: auth.map(str::to_string),
                flags,
            })
            .await?;
        expect_reply(reply)
    }

    pub async fn detach(&mut self, alias: &str) -> BcvResult<()> {
        let reply = self
            .request(Message::Detach {
                alias: alias.to_string(),
            })
            .await?;
        expect_reply(reply)
    }

    /// Read block `block`, opening a transaction if none is open.
    ///
    /// Returns one entry per block of the database: `slot + 1` for cached
    /// blocks pinned until [`DaemonClient::end`], `0` for the rest.
    pub async fn read(&mut self, block: u32, mru: &[u32]) -> BcvResult<Vec<u32>> {
        let mut refreshed = false;
        loop {
            let reply = self
                .request(Message::Read {
                    block,
                    auth: self.token.clone(),
                    mru: mru.to_vec(),
                })
                .await?;
            let Message::ReadReply {
                err_code,
                err_msg,
                blocks,
            } = reply
            else {
                return Err(unexpected(&reply));
            };
            if err_code == u32::from(HTTP_AUTH_ERROR) && !refreshed && self.refresh_auth().await {
                refreshed = true;
                continue;
            }
            check(err_code, err_msg)?;
            if blocks.get(block as usize).copied().unwrap_or(0) == 0 {
                return Err(bcv_core::Error::corrupt(format!(
                    "daemon reply does not locate block {block}"
                ))
                .into());
            }
            debug!(block, slot = blocks[block as usize] - 1, "block located");
            return Ok(blocks);
        }
    }

    /// Close the read transaction, releasing its pins.
    pub async fn end(&mut self, mru: &[u32]) -> BcvResult<()> {
        self.send(Message::End { mru: mru.to_vec() }).await
    }

    /// Refresh the manifest of the container.
    pub async fn poll(&mut self) -> BcvResult<()> {
        let reply = self
            .request(Message::Cmd {
                cmd: CMD_POLL,
                auth: self.token.clone(),
            })
            .await?;
        expect_reply(reply)
    }

    /// The container's encryption key, if it was attached with `SECURE`.
    pub async fn pass(&mut self) -> BcvResult<Option<[u8; 16]>> {
        let reply = self
            .request(Message::Pass {
                auth: self.token.clone(),
            })
            .await?;
        let Message::PassReply {
            err_code,
            err_msg,
            key,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        check(err_code, err_msg)?;
        if key.is_empty() {
            return Ok(None);
        }
        <[u8; 16]>::try_from(key.as_slice())
            .map(Some)
            .map_err(|_| BcvError::Protocol(format!("encryption key of {} bytes", key.len())))
    }

    /// Start downloading uncached blocks of the database, waiting at most
    /// `timeout_ms` for progress.
    pub async fn prefetch(&mut self, n_request: u32, timeout_ms: u32) -> BcvResult<PrefetchStatus> {
        let reply = self
            .request(Message::Prefetch {
                auth: self.token.clone(),
                n_request,
                timeout_ms,
            })
            .await?;
        let Message::PrefetchReply {
            err_code,
            err_msg,
            n_on_demand,
            n_outstanding,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        check(err_code, err_msg)?;
        Ok(PrefetchStatus {
            n_on_demand,
            n_outstanding,
        })
    }

    /// Query a virtual table. Columns whose bit is clear in `col_used` come
    /// back as `null`.
    pub async fn vtab(
        &mut self,
        table: &str,
        container: Option<&str>,
        database: Option<&str>,
        col_used: u64,
    ) -> BcvResult<serde_json::Value> {
        let reply = self
            .request(Message::Vtab {
                table: table.to_string(),
                container: container.map(str::to_string),
                database: database.map(str::to_string),
                col_used,
            })
            .await?;
        let Message::VtabReply {
            err_code,
            err_msg,
            rows,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        check(err_code, err_msg)?;
        serde_json::from_str(&rows).map_err(|e| BcvError::Protocol(format!("bad vtab rows: {e}")))
    }
}

/// Read the data of a block located by [`DaemonClient::read`] from the
/// daemon's cache file. `entry` is the value from the block map.
pub async fn read_cached(cache_file: &Path, block_size: u32, entry: u32) -> BcvResult<Vec<u8>> {
    let slot = entry
        .checked_sub(1)
        .ok_or_else(|| BcvError::Misuse("block is not cached".to_string()))?;
    let mut file = tokio::fs::File::open(cache_file).await?;
    file.seek(SeekFrom::Start(u64::from(slot) * u64::from(block_size)))
        .await?;
    let mut buf = vec![0u8; block_size as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn check(err_code: u32, err_msg: Option<String>) -> BcvResult<()> {
    if err_code == 0 {
        Ok(())
    } else {
        Err(BcvError::from_wire(err_code, err_msg))
    }
}

fn expect_reply(reply: Message) -> BcvResult<()> {
    match reply {
        Message::Reply { err_code, err_msg } => check(err_code, err_msg),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &Message) -> BcvError {
    BcvError::Protocol(format!("unexpected {} from daemon", reply.name()))
}
