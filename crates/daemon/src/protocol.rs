//! Client/daemon wire protocol.
//!
//! Every frame starts with a one-byte message type and a big-endian u32
//! holding the total frame length, header included. Payload fields use the
//! primitives below, all big-endian:
//!
//! ```text
//! u32 / u64     fixed width
//! string        u32 length including a trailing NUL, 0 for null
//! blob          u32 length + bytes
//! u32 array     u32 count + entries
//! ```

use crate::error::BcvError;
use bcv_core::{DBID_SIZE, DbId};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame header.
pub const HEADER_SIZE: usize = 5;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Attach flag: refuse local writes.
pub const ATTACH_READONLY: u32 = 0x01;
/// Attach flag: give the container a local encryption key.
pub const ATTACH_SECURE: u32 = 0x02;
/// Attach flag: succeed quietly if the alias is already attached.
pub const ATTACH_IFNOT: u32 = 0x04;

/// `CMD` code: refresh the container's manifest.
pub const CMD_POLL: u32 = 1;

mod msg_type {
    pub const HELLO: u8 = 0x01;
    pub const HELLO_REPLY: u8 = 0x02;
    pub const ATTACH: u8 = 0x03;
    pub const REPLY: u8 = 0x04;
    pub const DETACH: u8 = 0x05;
    pub const READ: u8 = 0x06;
    pub const READ_REPLY: u8 = 0x07;
    pub const END: u8 = 0x08;
    pub const CMD: u8 = 0x09;
    pub const PASS: u8 = 0x0A;
    pub const PASS_REPLY: u8 = 0x0B;
    pub const PREFETCH: u8 = 0x0C;
    pub const PREFETCH_REPLY: u8 = 0x0D;
    pub const VTAB: u8 = 0x0E;
    pub const VTAB_REPLY: u8 = 0x0F;
}

/// A protocol message. The same type serves both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Bind the connection to a container and, optionally, a database.
    Hello {
        container: String,
        database: Option<String>,
    },
    HelloReply {
        err_code: u32,
        err_msg: Option<String>,
        storage: Option<String>,
        account: Option<String>,
        container: Option<String>,
        db_id: Option<DbId>,
        block_size: u32,
        encrypted: bool,
    },
    Attach {
        storage: String,
        account: String,
        container: String,
        alias: Option<String>,
        auth: Option<String>,
        flags: u32,
    },
    /// Generic reply to `ATTACH`, `DETACH` and `CMD`.
    Reply {
        err_code: u32,
        err_msg: Option<String>,
    },
    Detach {
        alias: String,
    },
    /// Open or extend a read transaction and make block `block` available.
    Read {
        block: u32,
        auth: Option<String>,
        /// Block numbers used since the previous message, most recent first.
        mru: Vec<u32>,
    },
    ReadReply {
        err_code: u32,
        err_msg: Option<String>,
        /// One entry per block of the database: cache slot + 1, or 0.
        blocks: Vec<u32>,
    },
    /// Close the read transaction. No reply.
    End {
        mru: Vec<u32>,
    },
    Cmd {
        cmd: u32,
        auth: Option<String>,
    },
    /// Ask for the container's encryption key.
    Pass {
        auth: Option<String>,
    },
    PassReply {
        err_code: u32,
        err_msg: Option<String>,
        key: Vec<u8>,
    },
    Prefetch {
        auth: Option<String>,
        n_request: u32,
        timeout_ms: u32,
    },
    PrefetchReply {
        err_code: u32,
        err_msg: Option<String>,
        n_on_demand: u32,
        n_outstanding: u32,
    },
    Vtab {
        table: String,
        container: Option<String>,
        database: Option<String>,
        col_used: u64,
    },
    VtabReply {
        err_code: u32,
        err_msg: Option<String>,
        /// JSON array of row objects.
        rows: String,
    },
}

impl Message {
    /// Name of the message type, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::HelloReply { .. } => "HELLO_REPLY",
            Self::Attach { .. } => "ATTACH",
            Self::Reply { .. } => "REPLY",
            Self::Detach { .. } => "DETACH",
            Self::Read { .. } => "READ",
            Self::ReadReply { .. } => "READ_REPLY",
            Self::End { .. } => "END",
            Self::Cmd { .. } => "CMD",
            Self::Pass { .. } => "PASS",
            Self::PassReply { .. } => "PASS_REPLY",
            Self::Prefetch { .. } => "PREFETCH",
            Self::PrefetchReply { .. } => "PREFETCH_REPLY",
            Self::Vtab { .. } => "VTAB",
            Self::VtabReply { .. } => "VTAB_REPLY",
        }
    }

    /// Reply of the right type carrying only an error.
    ///
    /// Returns `None` for messages that get no reply.
    pub fn error_reply(&self, err_code: u32, err_msg: String) -> Option<Message> {
        let err_msg = Some(err_msg);
        Some(match self {
            Self::Hello { .. } => Self::HelloReply {
                err_code,
                err_msg,
                storage: None,
                account: None,
                container: None,
                db_id: None,
                block_size: 0,
                encrypted: false,
            },
            Self::Attach { .. } | Self::Detach { .. } | Self::Cmd { .. } => {
                Self::Reply { err_code, err_msg }
            }
            Self::Read { .. } => Self::ReadReply {
                err_code,
                err_msg,
                blocks: Vec::new(),
            },
            Self::Pass { .. } => Self::PassReply {
                err_code,
                err_msg,
                key: Vec::new(),
            },
            Self::Prefetch { .. } => Self::PrefetchReply {
                err_code,
                err_msg,
                n_on_demand: 0,
                n_outstanding: 0,
            },
            Self::Vtab { .. } => Self::VtabReply {
                err_code,
                err_msg,
                rows: "[]".to_string(),
            },
            _ => return None,
        })
    }

    fn encode_payload(&self, out: &mut BytesMut) -> u8 {
        match self {
            Self::Hello {
                container,
                database,
            } => {
                put_str(out, Some(container));
                put_str(out, database.as_deref());
                msg_type::HELLO
            }
            Self::HelloReply {
                err_code,
                err_msg,
                storage,
                account,
                container,
                db_id,
                block_size,
                encrypted,
            } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                put_str(out, storage.as_deref());
                put_str(out, account.as_deref());
                put_str(out, container.as_deref());
                put_blob(out, db_id.as_ref().map(|id| &id.as_bytes()[..]).unwrap_or(&[]));
                out.put_u32(*block_size);
                out.put_u32(u32::from(*encrypted));
                msg_type::HELLO_REPLY
            }
            Self::Attach {
                storage,
                account,
                container,
                alias,
                auth,
                flags,
            } => {
                put_str(out, Some(storage));
                put_str(out, Some(account));
                put_str(out, Some(container));
                put_str(out, alias.as_deref());
                put_str(out, auth.as_deref());
                out.put_u32(*flags);
                msg_type::ATTACH
            }
            Self::Reply { err_code, err_msg } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                msg_type::REPLY
            }
            Self::Detach { alias } => {
                put_str(out, Some(alias));
                msg_type::DETACH
            }
            Self::Read { block, auth, mru } => {
                out.put_u32(*block);
                put_str(out, auth.as_deref());
                put_u32_array(out, mru);
                msg_type::READ
            }
            Self::ReadReply {
                err_code,
                err_msg,
                blocks,
            } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                put_u32_array(out, blocks);
                msg_type::READ_REPLY
            }
            Self::End { mru } => {
                put_u32_array(out, mru);
                msg_type::END
            }
            Self::Cmd { cmd, auth } => {
                out.put_u32(*cmd);
                put_str(out, auth.as_deref());
                msg_type::CMD
            }
            Self::Pass { auth } => {
                put_str(out, auth.as_deref());
                msg_type::PASS
            }
            Self::PassReply {
                err_code,
                err_msg,
                key,
            } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                put_blob(out, key);
                msg_type::PASS_REPLY
            }
            Self::Prefetch {
                auth,
                n_request,
                timeout_ms,
            } => {
                put_str(out, auth.as_deref());
                out.put_u32(*n_request);
                out.put_u32(*timeout_ms);
                msg_type::PREFETCH
            }
            Self::PrefetchReply {
                err_code,
                err_msg,
                n_on_demand,
                n_outstanding,
            } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                out.put_u32(*n_on_demand);
                out.put_u32(*n_outstanding);
                msg_type::PREFETCH_REPLY
            }
            Self::Vtab {
                table,
                container,
                database,
                col_used,
            } => {
                put_str(out, Some(table));
                put_str(out, container.as_deref());
                put_str(out, database.as_deref());
                out.put_u64(*col_used);
                msg_type::VTAB
            }
            Self::VtabReply {
                err_code,
                err_msg,
                rows,
            } => {
                out.put_u32(*err_code);
                put_str(out, err_msg.as_deref());
                put_str(out, Some(rows));
                msg_type::VTAB_REPLY
            }
        }
    }

    fn decode_payload(kind: u8, rd: &mut Reader<'_>) -> Result<Self, BcvError> {
        let msg = match kind {
            msg_type::HELLO => Self::Hello {
                container: rd.required_str("container")?,
                database: rd.str()?,
            },
            msg_type::HELLO_REPLY => Self::HelloReply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
                storage: rd.str()?,
                account: rd.str()?,
                container: rd.str()?,
                db_id: rd.db_id()?,
                block_size: rd.u32()?,
                encrypted: rd.u32()? != 0,
            },
            msg_type::ATTACH => Self::Attach {
                storage: rd.required_str("storage")?,
                account: rd.required_str("account")?,
                container: rd.required_str("container")?,
                alias: rd.str()?,
                auth: rd.str()?,
                flags: rd.u32()?,
            },
            msg_type::REPLY => Self::Reply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
            },
            msg_type::DETACH => Self::Detach {
                alias: rd.required_str("alias")?,
            },
            msg_type::READ => Self::Read {
                block: rd.u32()?,
                auth: rd.str()?,
                mru: rd.u32_array()?,
            },
            msg_type::READ_REPLY => Self::ReadReply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
                blocks: rd.u32_array()?,
            },
            msg_type::END => Self::End {
                mru: rd.u32_array()?,
            },
            msg_type::CMD => Self::Cmd {
                cmd: rd.u32()?,
                auth: rd.str()?,
            },
            msg_type::PASS => Self::Pass { auth: rd.str()? },
            msg_type::PASS_REPLY => Self::PassReply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
                key: rd.blob()?.to_vec(),
            },
            msg_type::PREFETCH => Self::Prefetch {
                auth: rd.str()?,
                n_request: rd.u32()?,
                timeout_ms: rd.u32()?,
            },
            msg_type::PREFETCH_REPLY => Self::PrefetchReply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
                n_on_demand: rd.u32()?,
                n_outstanding: rd.u32()?,
            },
            msg_type::VTAB => Self::Vtab {
                table: rd.required_str("table")?,
                container: rd.str()?,
                database: rd.str()?,
                col_used: rd.u64()?,
            },
            msg_type::VTAB_REPLY => Self::VtabReply {
                err_code: rd.u32()?,
                err_msg: rd.str()?,
                rows: rd.required_str("rows")?,
            },
            other => {
                return Err(BcvError::Protocol(format!(
                    "unknown message type 0x{other:02x}"
                )));
            }
        };
        if !rd.is_empty() {
            return Err(BcvError::Protocol(format!(
                "{} bytes of trailing data in {}",
                rd.remaining(),
                msg.name()
            )));
        }
        Ok(msg)
    }
}

fn put_str(out: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            out.put_u32(s.len() as u32 + 1);
            out.put_slice(s.as_bytes());
            out.put_u8(0);
        }
        None => out.put_u32(0),
    }
}

fn put_blob(out: &mut BytesMut, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

fn put_u32_array(out: &mut BytesMut, values: &[u32]) {
    out.put_u32(values.len() as u32);
    for v in values {
        out.put_u32(*v);
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BcvError> {
        if n > self.data.len() {
            return Err(BcvError::Protocol(format!(
                "truncated message: need {n} bytes, have {}",
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, BcvError> {
        let mut b = self.take(4)?;
        Ok(b.get_u32())
    }

    fn u64(&mut self) -> Result<u64, BcvError> {
        let mut b = self.take(8)?;
        Ok(b.get_u64())
    }

    fn blob(&mut self) -> Result<&'a [u8], BcvError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn str(&mut self) -> Result<Option<String>, BcvError> {
        let n = self.u32()? as usize;
        if n == 0 {
            return Ok(None);
        }
        let raw = self.take(n)?;
        let (body, nul) = raw.split_at(n - 1);
        if nul != [0] || body.contains(&0) {
            return Err(BcvError::Protocol("string not NUL-terminated".to_string()));
        }
        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|e| BcvError::Protocol(format!("string is not utf-8: {e}")))
    }

    fn required_str(&mut self, field: &str) -> Result<String, BcvError> {
        self.str()?
            .ok_or_else(|| BcvError::Protocol(format!("missing {field}")))
    }

    fn db_id(&mut self) -> Result<Option<DbId>, BcvError> {
        let raw = self.blob()?;
        match raw.len() {
            0 => Ok(None),
            DBID_SIZE => Ok(Some(DbId::from_slice(raw)?)),
            n => Err(BcvError::Protocol(format!("database id of {n} bytes"))),
        }
    }

    fn u32_array(&mut self) -> Result<Vec<u32>, BcvError> {
        let n = self.u32()? as usize;
        if n > self.data.len() / 4 {
            return Err(BcvError::Protocol(format!("array of {n} entries overruns frame")));
        }
        (0..n).map(|_| self.u32()).collect()
    }
}

/// Frame codec for [`Message`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BcvCodec;

impl Decoder for BcvCodec {
    type Item = Message;
    type Error = BcvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, BcvError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&len) {
            return Err(BcvError::Protocol(format!("bad frame length {len}")));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(len);
        let mut rd = Reader {
            data: &frame[HEADER_SIZE..],
        };
        Message::decode_payload(kind, &mut rd).map(Some)
    }
}

impl Encoder<Message> for BcvCodec {
    type Error = BcvError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), BcvError> {
        let start = dst.len();
        dst.put_u8(0);
        dst.put_u32(0);
        let kind = msg.encode_payload(dst);
        let len = dst.len() - start;
        if len > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(BcvError::Protocol(format!(
                "{} frame of {len} bytes exceeds limit",
                msg.name()
            )));
        }
        dst[start] = kind;
        dst[start + 1..start + HEADER_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}
