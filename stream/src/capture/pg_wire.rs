//! Minimal PostgreSQL frontend for replication work: startup with
//! `replication=database`, trust/cleartext/md5 auth, simple queries, and
//! the COPY-both stream underneath `START_REPLICATION`. SCRAM is out of
//! scope; operators point Kasho at an md5/password HBA rule.

use std::time::{Duration, SystemTime};

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use common::err::{KResult, KashoError};
use dialect::Dsn;

/// Microseconds between the Unix and Postgres (2000-01-01) epochs.
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

pub struct PgWireConnection {
    stream: BufStream<TcpStream>,
}

/// One frame of the replication COPY stream.
#[derive(Debug)]
pub enum CopyFrame {
    /// `w`: a WAL payload starting at `start`.
    XLogData { start: u64, payload: Vec<u8> },
    /// `k`: sender keepalive; `must_reply` asks for an immediate status
    /// update.
    Keepalive { end: u64, must_reply: bool },
}

impl PgWireConnection {
    pub async fn connect(dsn: &Dsn, replication: bool) -> KResult<Self> {
        let addr = format!("{}:{}", dsn.host, dsn.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| KashoError::Connection(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        let mut conn = PgWireConnection {
            stream: BufStream::new(tcp),
        };
        conn.startup(dsn, replication).await?;
        Ok(conn)
    }

    async fn startup(&mut self, dsn: &Dsn, replication: bool) -> KResult<()> {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", dsn.user.as_str()),
            ("database", dsn.database.as_str()),
            ("application_name", "kasho"),
        ];
        if replication {
            params.push(("replication", "database"));
        }

        let mut body = Vec::with_capacity(128);
        body.extend_from_slice(&196_608i32.to_be_bytes()); // protocol 3.0
        for (k, v) in &params {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);

        self.stream
            .write_i32((body.len() + 4) as i32)
            .await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;

        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'R' => self.authenticate(&body, dsn).await?,
                b'S' | b'K' => {
                    // run-time parameter / backend key data
                    trace!(tag = %(tag as char), "startup message");
                }
                b'N' => {
                    debug!("server notice during startup");
                }
                b'Z' => return Ok(()),
                b'E' => return Err(backend_error(&body)),
                other => {
                    return Err(KashoError::Protocol(format!(
                        "unexpected startup message {:?}",
                        other as char
                    )))
                }
            }
        }
    }

    async fn authenticate(&mut self, body: &[u8], dsn: &Dsn) -> KResult<()> {
        if body.len() < 4 {
            return Err(KashoError::Protocol("short authentication message".into()));
        }
        match BigEndian::read_i32(&body[0..4]) {
            0 => Ok(()), // AuthenticationOk
            3 => self.send_password(dsn.password.as_bytes()).await,
            5 => {
                if body.len() < 8 {
                    return Err(KashoError::Protocol("md5 auth without salt".into()));
                }
                let salt = &body[4..8];
                let inner = md5_hex(&[dsn.password.as_bytes(), dsn.user.as_bytes()]);
                let outer = md5_hex(&[inner.as_bytes(), salt]);
                self.send_password(format!("md5{}", outer).as_bytes()).await
            }
            method => Err(KashoError::Connection(format!(
                "unsupported auth method {} (configure password or md5 for the kasho role)",
                method
            ))),
        }
    }

    async fn send_password(&mut self, payload: &[u8]) -> KResult<()> {
        self.stream.write_u8(b'p').await?;
        self.stream.write_i32((payload.len() + 4 + 1) as i32).await?;
        self.stream.write_all(payload).await?;
        self.stream.write_u8(0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Text-protocol query; rows come back as optional strings.
    pub async fn simple_query(&mut self, sql: &str) -> KResult<Vec<Vec<Option<String>>>> {
        self.stream.write_u8(b'Q').await?;
        self.stream.write_i32((sql.len() + 4 + 1) as i32).await?;
        self.stream.write_all(sql.as_bytes()).await?;
        self.stream.write_u8(0).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        let mut error: Option<KashoError> = None;
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'T' | b'C' | b'I' | b'N' => {}
                b'D' => rows.push(parse_data_row(&body)?),
                b'E' => error = Some(backend_error(&body)),
                b'Z' => break,
                other => {
                    return Err(KashoError::Protocol(format!(
                        "unexpected query response {:?}",
                        other as char
                    )))
                }
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Primary's current WAL write position, from `IDENTIFY_SYSTEM`.
    pub async fn identify_system(&mut self) -> KResult<Option<String>> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        Ok(rows.first().and_then(|row| row.get(2).cloned().flatten()))
    }

    /// `START_REPLICATION SLOT <slot> LOGICAL <lsn> (<options>)`; leaves
    /// the connection in COPY-both mode.
    pub async fn start_replication(
        &mut self,
        slot: &str,
        lsn: &str,
        options: &[(&str, &str)],
    ) -> KResult<()> {
        let opts = options
            .iter()
            .map(|(k, v)| format!("\"{}\" '{}'", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        let command = format!("START_REPLICATION SLOT {} LOGICAL {} ({})", slot, lsn, opts);
        debug!(%command, "starting replication");

        self.stream.write_u8(b'Q').await?;
        self.stream
            .write_i32((command.len() + 4 + 1) as i32)
            .await?;
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_u8(0).await?;
        self.stream.flush().await?;

        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'W' => return Ok(()), // CopyBothResponse
                b'N' => {}
                b'E' => return Err(backend_error(&body)),
                other => {
                    return Err(KashoError::Protocol(format!(
                        "unexpected response {:?} to START_REPLICATION",
                        other as char
                    )))
                }
            }
        }
    }

    /// Next frame of the COPY stream.
    pub async fn read_copy_frame(&mut self) -> KResult<CopyFrame> {
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'd' => {
                    if body.is_empty() {
                        return Err(KashoError::Protocol("empty CopyData frame".into()));
                    }
                    match body[0] {
                        b'w' => {
                            if body.len() < 25 {
                                return Err(KashoError::Protocol("short XLogData frame".into()));
                            }
                            let start = BigEndian::read_u64(&body[1..9]);
                            // skip wal_end + server clock
                            return Ok(CopyFrame::XLogData {
                                start,
                                payload: body[25..].to_vec(),
                            });
                        }
                        b'k' => {
                            if body.len() < 18 {
                                return Err(KashoError::Protocol("short keepalive frame".into()));
                            }
                            let end = BigEndian::read_u64(&body[1..9]);
                            let must_reply = body[17] == 1;
                            return Ok(CopyFrame::Keepalive { end, must_reply });
                        }
                        other => {
                            return Err(KashoError::Protocol(format!(
                                "unexpected CopyData payload {:?}",
                                other as char
                            )))
                        }
                    }
                }
                b'N' => {}
                b'E' => return Err(backend_error(&body)),
                b'c' | b'C' | b'Z' => {
                    // server ended the copy stream; surface as transient
                    // so the capture loop reconnects
                    warn!("replication copy stream ended by server");
                    return Err(KashoError::TransientIo("replication stream closed".into()));
                }
                other => {
                    return Err(KashoError::Protocol(format!(
                        "unexpected replication message {:?}",
                        other as char
                    )))
                }
            }
        }
    }

    /// Standby status update: all three positions confirm durability up
    /// to `flushed`.
    pub async fn standby_status_update(&mut self, flushed: u64) -> KResult<()> {
        let clock = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS))
            .unwrap_or(Duration::ZERO)
            .as_micros() as i64;

        self.stream.write_u8(b'd').await?;
        self.stream.write_i32(4 + 1 + 8 + 8 + 8 + 8 + 1).await?;
        self.stream.write_u8(b'r').await?;
        self.stream.write_u64(flushed).await?;
        self.stream.write_u64(flushed).await?;
        self.stream.write_u64(flushed).await?;
        self.stream.write_i64(clock).await?;
        self.stream.write_u8(0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> KResult<(u8, Vec<u8>)> {
        let tag = self.stream.read_u8().await?;
        let len = self.stream.read_i32().await?;
        if len < 4 {
            return Err(KashoError::Protocol(format!("frame length {} too small", len)));
        }
        let mut body = vec![0u8; (len - 4) as usize];
        self.stream.read_exact(&mut body).await?;
        Ok((tag, body))
    }
}

fn parse_data_row(body: &[u8]) -> KResult<Vec<Option<String>>> {
    if body.len() < 2 {
        return Err(KashoError::Protocol("short DataRow".into()));
    }
    let ncols = BigEndian::read_i16(&body[0..2]);
    let mut at = 2usize;
    let mut row = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        if body.len() < at + 4 {
            return Err(KashoError::Protocol("truncated DataRow".into()));
        }
        let len = BigEndian::read_i32(&body[at..at + 4]);
        at += 4;
        if len < 0 {
            row.push(None);
            continue;
        }
        let len = len as usize;
        if body.len() < at + len {
            return Err(KashoError::Protocol("truncated DataRow".into()));
        }
        row.push(Some(String::from_utf8_lossy(&body[at..at + len]).into_owned()));
        at += len;
    }
    Ok(row)
}

fn backend_error(body: &[u8]) -> KashoError {
    let mut severity = String::new();
    let mut message = String::new();
    let mut code = String::new();
    let mut at = 0usize;
    while at < body.len() && body[at] != 0 {
        let field = body[at];
        at += 1;
        let end = body[at..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| at + p)
            .unwrap_or(body.len());
        let value = String::from_utf8_lossy(&body[at..end]).into_owned();
        at = end + 1;
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    KashoError::Connection(format!("{} {}: {}", severity, code, message))
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
