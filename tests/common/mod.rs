//! Scripted PostgreSQL server for integration tests.
//!
//! Speaks enough of the v3 protocol for the driver: trust startup, simple
//! and extended queries, LISTEN/NOTIFY, CancelRequest and prepared
//! transactions. Statements are answered by pattern:
//!
//! - `SELECT pg_sleep(n)` blocks for `n` seconds or until cancelled, in
//!   which case it fails with 57014
//! - `SELECT <literal>` returns one row with the literal
//! - anything mentioning `nope` fails with 42P01
//! - `BEGIN`, `COMMIT`, `ROLLBACK`, savepoints and `PREPARE TRANSACTION`
//!   update the transaction status like the real server does

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const CANCEL_CODE: i32 = 80877102;
const SSL_CODE: i32 = 80877103;
const SLEEP_LIMIT: Duration = Duration::from_secs(10);

pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    next_pid: AtomicU32,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    log: Mutex<Vec<String>>,
    prepared: Mutex<Vec<String>>,
    prepared_disabled: AtomicBool,
}

struct Session {
    writer: Mutex<TcpStream>,
    canceled: Mutex<bool>,
    wake: Condvar,
    listening: Mutex<Vec<String>>,
}

impl Session {
    fn send(&self, bytes: &[u8]) {
        let _ = self.writer.lock().unwrap().write_all(bytes);
    }
}

impl FakeServer {
    pub fn start() -> Self {
        Self::launch(usize::MAX)
    }

    /// A server that accepts a single connection and then closes its
    /// listening socket, so cancel requests are refused.
    pub fn start_refusing_cancel() -> Self {
        Self::launch(1)
    }

    fn launch(connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            next_pid: AtomicU32::new(1000),
            ..Shared::default()
        });
        let accept_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let Ok(stream) = stream else { break };
                let shared = Arc::clone(&accept_shared);
                std::thread::spawn(move || serve(stream, &shared));
            }
        });
        Self { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("postgres://tester@{}/test", self.addr)
    }

    pub fn autocommit_url(&self) -> String {
        format!("{}?autocommit=on", self.url())
    }

    /// Every statement received so far, across sessions.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().unwrap().clear();
    }

    pub fn disable_prepared(&self) {
        self.shared.prepared_disabled.store(true, Ordering::SeqCst);
    }

    pub fn prepared(&self) -> Vec<String> {
        self.shared.prepared.lock().unwrap().clone()
    }

    pub fn add_prepared(&self, gid: &str) {
        self.shared.prepared.lock().unwrap().push(gid.to_string());
    }
}

pub fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![type_byte];
    out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn error_frame(code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    cstr(&mut payload, "ERROR");
    payload.push(b'C');
    cstr(&mut payload, code);
    payload.push(b'M');
    cstr(&mut payload, message);
    payload.push(0);
    frame(b'E', &payload)
}

fn ready_frame(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

fn row_description(columns: &[String]) -> Vec<u8> {
    let mut payload = (columns.len() as i16).to_be_bytes().to_vec();
    for column in columns {
        cstr(&mut payload, column);
        payload.extend_from_slice(&0_i32.to_be_bytes());
        payload.extend_from_slice(&0_i16.to_be_bytes());
        payload.extend_from_slice(&25_i32.to_be_bytes());
        payload.extend_from_slice(&(-1_i16).to_be_bytes());
        payload.extend_from_slice(&(-1_i32).to_be_bytes());
        payload.extend_from_slice(&0_i16.to_be_bytes());
    }
    frame(b'T', &payload)
}

fn data_row(values: &[Option<String>]) -> Vec<u8> {
    let mut payload = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(v) => {
                payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                payload.extend_from_slice(v.as_bytes());
            }
            None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
    }
    frame(b'D', &payload)
}

fn complete(tag: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    cstr(&mut payload, tag);
    frame(b'C', &payload)
}

fn read_i32(stream: &mut TcpStream) -> Option<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).ok()?;
    Some(i32::from_be_bytes(buf))
}

fn read_message(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte).ok()?;
    let len = read_i32(stream)?;
    let mut payload = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut payload).ok()?;
    Some((type_byte[0], payload))
}

fn read_cstr(payload: &[u8]) -> (String, &[u8]) {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let s = String::from_utf8_lossy(&payload[..end]).into_owned();
    (s, payload.get(end + 1..).unwrap_or_default())
}

/// Rows of a successful statement.
struct Reply {
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Option<String>>>,
    tag: String,
}

impl Reply {
    fn tag(tag: &str) -> Self {
        Self {
            columns: None,
            rows: Vec::new(),
            tag: tag.to_string(),
        }
    }

    fn encode_rows(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for row in &self.rows {
            out.extend(data_row(row));
        }
        out.extend(complete(&self.tag));
        out
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = match &self.columns {
            Some(columns) => row_description(columns),
            None => Vec::new(),
        };
        out.extend(self.encode_rows());
        out
    }
}

type Outcome = Result<Reply, (&'static str, String)>;

struct Conn<'a> {
    pid: u32,
    session: Arc<Session>,
    shared: &'a Shared,
    status: u8,
}

fn serve(mut stream: TcpStream, shared: &Shared) {
    let pid = loop {
        let Some(len) = read_i32(&mut stream) else { return };
        let mut body = vec![0u8; (len - 4) as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        match code {
            CANCEL_CODE => {
                let target = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                let session = shared.sessions.lock().unwrap().get(&target).cloned();
                if let Some(session) = session {
                    *session.canceled.lock().unwrap() = true;
                    session.wake.notify_all();
                }
                return;
            }
            SSL_CODE => {
                if stream.write_all(b"N").is_err() {
                    return;
                }
            }
            _ => break shared.next_pid.fetch_add(1, Ordering::SeqCst),
        }
    };

    let session = Arc::new(Session {
        writer: Mutex::new(stream.try_clone().unwrap()),
        canceled: Mutex::new(false),
        wake: Condvar::new(),
        listening: Mutex::new(Vec::new()),
    });
    shared.sessions.lock().unwrap().insert(pid, Arc::clone(&session));

    let mut hello = frame(b'R', &0_i32.to_be_bytes());
    let mut param = Vec::new();
    cstr(&mut param, "server_version");
    cstr(&mut param, "16.0");
    hello.extend(frame(b'S', &param));
    let mut key = pid.to_be_bytes().to_vec();
    key.extend_from_slice(&(pid * 7).to_be_bytes());
    hello.extend(frame(b'K', &key));
    hello.extend(ready_frame(b'I'));
    session.send(&hello);

    let mut conn = Conn {
        pid,
        session,
        shared,
        status: b'I',
    };
    conn.run(&mut stream);
    shared.sessions.lock().unwrap().remove(&pid);
}

impl Conn<'_> {
    fn run(&mut self, stream: &mut TcpStream) {
        let mut skipping = false;
        let mut pending: Option<Outcome> = None;
        let mut sql = String::new();
        while let Some((type_byte, payload)) = read_message(stream) {
            match type_byte {
                b'Q' => {
                    let (query, _) = read_cstr(&payload);
                    let mut out = Vec::new();
                    let statements: Vec<&str> = query
                        .split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect();
                    if statements.is_empty() {
                        out.extend(frame(b'I', b""));
                    }
                    for statement in statements {
                        match self.statement(statement) {
                            Ok(reply) => out.extend(reply.encode()),
                            Err((code, message)) => {
                                out.extend(error_frame(code, &message));
                                break;
                            }
                        }
                    }
                    out.extend(ready_frame(self.status));
                    self.session.send(&out);
                }
                b'P' if !skipping => {
                    let (_, rest) = read_cstr(&payload);
                    sql = read_cstr(rest).0;
                    self.session.send(&frame(b'1', b""));
                }
                b'B' if !skipping => self.session.send(&frame(b'2', b"")),
                b'D' if !skipping => {
                    let outcome = self.statement(&sql);
                    match &outcome {
                        Ok(Reply {
                            columns: Some(columns),
                            ..
                        }) => self.session.send(&row_description(columns)),
                        Ok(_) => self.session.send(&frame(b'n', b"")),
                        Err((code, message)) => {
                            self.session.send(&error_frame(code, message));
                            skipping = true;
                        }
                    }
                    pending = Some(outcome);
                }
                b'E' if !skipping => {
                    if let Some(Ok(reply)) = pending.take() {
                        self.session.send(&reply.encode_rows());
                    }
                }
                b'S' => {
                    skipping = false;
                    pending = None;
                    self.session.send(&ready_frame(self.status));
                }
                b'X' => return,
                _ => {}
            }
        }
    }

    fn statement(&mut self, sql: &str) -> Outcome {
        self.shared.log.lock().unwrap().push(sql.to_string());
        let outcome = self.answer(sql);
        if outcome.is_err() && self.status == b'T' {
            self.status = b'E';
        }
        outcome
    }

    fn answer(&mut self, sql: &str) -> Outcome {
        let upper = sql.to_ascii_uppercase();
        let word = |prefix: &str| upper.starts_with(prefix);

        if self.status == b'E' && !word("ROLLBACK") && !word("COMMIT") {
            return Err((
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block".into(),
            ));
        }
        if upper.contains("NOPE") {
            return Err(("42P01", "relation \"nope\" does not exist".into()));
        }
        if word("SELECT PG_SLEEP") {
            let seconds = upper
                .split(['(', ')'])
                .nth(1)
                .and_then(|n| n.trim().parse::<f64>().ok())
                .map_or(SLEEP_LIMIT, Duration::from_secs_f64);
            return self.sleep(seconds.min(SLEEP_LIMIT));
        }
        if word("SELECT GID, PREPARED") {
            let rows = self
                .shared
                .prepared
                .lock()
                .unwrap()
                .iter()
                .map(|gid| {
                    vec![
                        Some(gid.clone()),
                        Some("2026-01-01 00:00:00+00".into()),
                        Some("tester".into()),
                        Some("test".into()),
                    ]
                })
                .collect::<Vec<_>>();
            return Ok(Reply {
                columns: Some(["gid", "prepared", "owner", "database"].map(String::from).to_vec()),
                tag: format!("SELECT {}", rows.len()),
                rows,
            });
        }
        if word("BEGIN") {
            self.status = b'T';
            return Ok(Reply::tag("BEGIN"));
        }
        if word("PREPARE TRANSACTION") {
            if self.shared.prepared_disabled.load(Ordering::SeqCst) {
                return Err(("55000", "prepared transactions are disabled".into()));
            }
            self.shared.prepared.lock().unwrap().push(quoted(sql));
            self.status = b'I';
            return Ok(Reply::tag("PREPARE TRANSACTION"));
        }
        if word("COMMIT PREPARED") || word("ROLLBACK PREPARED") {
            let gid = quoted(sql);
            let mut prepared = self.shared.prepared.lock().unwrap();
            let before = prepared.len();
            prepared.retain(|g| *g != gid);
            if prepared.len() == before {
                return Err(("42704", format!("prepared transaction with identifier \"{gid}\" does not exist")));
            }
            return Ok(Reply::tag(if word("COMMIT") { "COMMIT PREPARED" } else { "ROLLBACK PREPARED" }));
        }
        if word("COMMIT") {
            let tag = if self.status == b'E' { "ROLLBACK" } else { "COMMIT" };
            self.status = b'I';
            return Ok(Reply::tag(tag));
        }
        if word("ROLLBACK TO SAVEPOINT") {
            self.status = b'T';
            return Ok(Reply::tag("ROLLBACK"));
        }
        if word("ROLLBACK") {
            self.status = b'I';
            return Ok(Reply::tag("ROLLBACK"));
        }
        if word("SAVEPOINT") {
            return Ok(Reply::tag("SAVEPOINT"));
        }
        if word("RELEASE") {
            return Ok(Reply::tag("RELEASE"));
        }
        if word("LISTEN ") {
            let channel = sql["LISTEN ".len()..].trim().to_string();
            self.session.listening.lock().unwrap().push(channel);
            return Ok(Reply::tag("LISTEN"));
        }
        if word("NOTIFY ") {
            let rest = &sql["NOTIFY ".len()..];
            let (channel, payload) = rest.split_once(',').unwrap_or((rest, ""));
            self.notify(channel.trim(), payload.trim().trim_matches('\''));
            return Ok(Reply::tag("NOTIFY"));
        }
        if word("SELECT ") {
            let value = sql["SELECT ".len()..].trim().trim_matches('\'').to_string();
            return Ok(Reply {
                columns: Some(vec!["?column?".into()]),
                rows: vec![vec![Some(value)]],
                tag: "SELECT 1".into(),
            });
        }
        if word("INSERT") {
            return Ok(Reply::tag("INSERT 0 1"));
        }
        let tag = upper.split_whitespace().next().unwrap_or_default().to_string();
        Ok(Reply::tag(&tag))
    }

    fn sleep(&mut self, limit: Duration) -> Outcome {
        let mut canceled = self.session.canceled.lock().unwrap();
        let (guard, _) = self
            .session
            .wake
            .wait_timeout_while(canceled, limit, |c| !*c)
            .unwrap();
        canceled = guard;
        if *canceled {
            *canceled = false;
            return Err(("57014", "canceling statement due to user request".into()));
        }
        Ok(Reply {
            columns: Some(vec!["pg_sleep".into()]),
            rows: vec![vec![Some(String::new())]],
            tag: "SELECT 1".into(),
        })
    }

    fn notify(&self, channel: &str, payload: &str) {
        let mut body = self.pid.to_be_bytes().to_vec();
        cstr(&mut body, channel);
        cstr(&mut body, payload);
        let message = frame(b'A', &body);
        let sessions: Vec<_> = self.shared.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            if session.listening.lock().unwrap().iter().any(|c| c == channel) {
                session.send(&message);
            }
        }
    }
}

fn quoted(sql: &str) -> String {
    sql.split('\'').nth(1).unwrap_or_default().to_string()
}
