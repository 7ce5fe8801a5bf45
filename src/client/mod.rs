//! Connection core: lifecycle, token multiplexing and the run pipeline.

mod builder;
mod cursor;
mod feed;
mod handler;
mod reader;

pub mod feeds;
pub mod repl;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;

pub use builder::ConnectionBuilder;
pub use cursor::Cursor;
pub use feed::FeedHandle;
pub use handler::{Handler, HandlerResult};

use crate::protocol::{
    encode_query, handshake_preamble, DriverError, FormatOptions, QueryType, Response,
    ResponseType, RunOptions, HANDSHAKE_SUCCESS,
};

/// How many recently STOPped tokens the reader tolerates late responses for.
const STOPPED_TOKEN_WINDOW: usize = 128;

/// Options for `close_with` / `reconnect_with`.
#[derive(Debug, Clone, Copy)]
pub struct CloseOptions {
    /// Drain outstanding noreply queries before tearing down. Default true.
    pub noreply_wait: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        CloseOptions { noreply_wait: true }
    }
}

/// The shaped result of a synchronous `run`.
#[derive(Debug)]
pub enum RunResult {
    /// Single value from a SUCCESS_ATOM response.
    Atom(Value),
    /// Lazy sequence backed by server-side continuation.
    Cursor(Cursor),
    /// The response carried a profile; `value` holds the shaped result.
    Profiled { profile: Value, value: Box<RunResult> },
    /// The query was sent with `noreply`; the server answers nothing.
    Noreply,
}

impl RunResult {
    /// Unwrap to the atom value, looking through a profile wrapper.
    pub fn into_atom(self) -> Option<Value> {
        match self {
            RunResult::Atom(value) => Some(value),
            RunResult::Profiled { value, .. } => value.into_atom(),
            _ => None,
        }
    }

    /// Unwrap to the cursor, looking through a profile wrapper.
    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            RunResult::Cursor(cursor) => Some(cursor),
            RunResult::Profiled { value, .. } => value.into_cursor(),
            _ => None,
        }
    }
}

pub(crate) struct Config {
    pub host: String,
    pub port: u16,
    pub auth_key: String,
    pub timeout: Duration,
    pub reconnect_on_run: bool,
}

/// A waiter registered for one token.
pub(crate) enum Waiter {
    /// A caller parked in `wait`; the reader stores the response in the
    /// pending map and signals.
    Slot(Arc<Notify>),
    /// A handler dispatcher; the reader forwards responses down the channel.
    Feed(mpsc::UnboundedSender<FeedEvent>),
}

/// What a feed dispatcher receives from the reader or from teardown.
pub(crate) enum FeedEvent {
    Response(Response),
    /// Connection teardown; fires `on_close` only.
    Closed,
}

#[derive(Default)]
pub(crate) struct ConnState {
    socket_present: bool,
    reader_alive: bool,
    waiters: HashMap<u64, Waiter>,
    pending: HashMap<u64, Response>,
    formats: HashMap<u64, FormatOptions>,
    stopped: VecDeque<u64>,
}

pub(crate) struct ConnInner {
    config: Config,
    default_db: Mutex<Option<String>>,
    state: Mutex<ConnState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_token: AtomicU64,
    conn_id: AtomicU64,
}

/// A connection to a RillDB server. Cheap to clone; all clones share the
/// same socket, reader task and waiter table.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn new(config: Config, db: Option<String>) -> Self {
        Connection {
            inner: Arc::new(ConnInner {
                config,
                default_db: Mutex::new(db),
                state: Mutex::new(ConnState::default()),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                next_token: AtomicU64::new(1),
                conn_id: AtomicU64::new(0),
            }),
        }
    }

    /// True while the socket is present and the reader task is alive.
    pub fn is_open(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.socket_present && state.reader_alive
    }

    /// The connection epoch. Incremented on every successful (re)connect;
    /// cursors snapshot it to detect staleness.
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id.load(Ordering::SeqCst)
    }

    /// Set the default database injected into every subsequent query.
    pub fn use_db(&self, db: impl Into<String>) {
        *self.inner.default_db.lock().unwrap() = Some(db.into());
    }

    /// Install this connection as the process-wide default.
    pub fn repl(&self) -> Connection {
        repl::set_default(self);
        self.clone()
    }

    fn default_db(&self) -> Option<String> {
        self.inner.default_db.lock().unwrap().clone()
    }

    /// Open the TCP socket, perform the handshake and start the reader.
    /// The connection must be closed when this is called.
    pub async fn connect(&self) -> Result<(), DriverError> {
        if self.inner.state.lock().unwrap().socket_present {
            return Err(DriverError::Argument(
                "connection is already open; close it before connecting".to_string(),
            ));
        }

        let config = &self.inner.config;
        let addr = (config.host.as_str(), config.port);
        let stream = time::timeout(config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DriverError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut stream = stream;
        stream.write_all(&handshake_preamble(&config.auth_key)).await?;
        stream.flush().await?;

        let reply = time::timeout(config.timeout, read_nul_terminated(&mut stream))
            .await
            .map_err(|_| DriverError::Timeout)??;
        if reply != HANDSHAKE_SUCCESS {
            return Err(DriverError::Handshake(reply));
        }

        let (read_half, write_half) = stream.into_split();
        self.inner.next_token.store(1, Ordering::SeqCst);
        let conn_id = self.inner.conn_id.fetch_add(1, Ordering::SeqCst) + 1;

        *self.inner.writer.lock().await = Some(write_half);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.waiters.clear();
            state.pending.clear();
            state.formats.clear();
            state.stopped.clear();
            state.socket_present = true;
            state.reader_alive = true;
        }
        let handle = tokio::spawn(reader::reader_loop(Arc::clone(&self.inner), read_half));
        *self.inner.reader.lock().unwrap() = Some(handle);

        tracing::debug!(
            host = %config.host,
            port = config.port,
            conn_id,
            "connection established"
        );
        repl::note_last(self);
        Ok(())
    }

    /// Close the connection, draining outstanding noreply queries first.
    pub async fn close(&self) -> Result<(), DriverError> {
        self.close_with(CloseOptions::default()).await
    }

    /// Close the connection. Stops the reader, closes the socket and wakes
    /// every outstanding waiter with a closed-connection error.
    pub async fn close_with(&self, opts: CloseOptions) -> Result<(), DriverError> {
        if opts.noreply_wait && self.is_open() {
            if let Err(err) = self.noreply_wait().await {
                tracing::warn!(error = %err, "noreply_wait failed during close");
            }
        }

        if let Some(handle) = self.inner.reader.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let mut state = self.inner.state.lock().unwrap();
        state.socket_present = false;
        state.reader_alive = false;
        state.pending.clear();
        state.formats.clear();
        state.stopped.clear();
        for (_, waiter) in state.waiters.drain() {
            match waiter {
                Waiter::Slot(notify) => notify.notify_one(),
                Waiter::Feed(tx) => {
                    let _ = tx.send(FeedEvent::Closed);
                }
            }
        }
        tracing::debug!(conn_id = self.conn_id(), "connection closed");
        Ok(())
    }

    /// `close` followed by `connect`. Bumps the connection epoch, so
    /// cursors created before the reconnect fail as stale.
    pub async fn reconnect(&self) -> Result<(), DriverError> {
        self.reconnect_with(CloseOptions::default()).await
    }

    pub async fn reconnect_with(&self, opts: CloseOptions) -> Result<(), DriverError> {
        self.close_with(opts).await?;
        self.connect().await
    }

    /// The abort path: tear down without draining, then reconnect.
    /// Intended for callers racing an interrupt while blocked in a wait.
    pub async fn reset(&self) -> Result<(), DriverError> {
        self.reconnect_with(CloseOptions { noreply_wait: false }).await
    }

    /// Run a query and shape the response: an atom, a cursor, or a
    /// profile-wrapped value. With `noreply` set the server answers
    /// nothing and `RunResult::Noreply` is returned immediately.
    pub async fn run(&self, query: Value, opts: RunOptions) -> Result<RunResult, DriverError> {
        self.ensure_open().await?;

        let formats = opts.formats();
        let noreply = opts.noreply;
        let global = opts.to_global_optargs(self.default_db().as_deref());
        let token = self.next_token();
        let frame = encode_query(token, QueryType::Start, Some(&query), Some(&global))?;

        if noreply {
            self.dispatch(frame).await?;
            return Ok(RunResult::Noreply);
        }

        // Register before dispatching so the response cannot race the waiter.
        self.register_slot(token, formats)?;
        if let Err(err) = self.dispatch(frame).await {
            self.retire_token(token);
            return Err(err);
        }
        let response = match self.wait(token, None).await {
            Ok(response) => response,
            Err(err) => {
                self.retire_token(token);
                return Err(err);
            }
        };
        self.shape_response(token, response, formats).await
    }

    /// Run a query in fire-and-forget mode.
    pub async fn run_noreply(&self, query: Value, opts: RunOptions) -> Result<(), DriverError> {
        self.run(query, opts.noreply(true)).await.map(|_| ())
    }

    /// Run a query, hand the result to `f`, and close the cursor (if one
    /// was produced) once `f` returns.
    pub async fn run_with<F, T>(
        &self,
        query: Value,
        opts: RunOptions,
        f: F,
    ) -> Result<T, DriverError>
    where
        F: FnOnce(&mut RunResult) -> T,
    {
        let mut result = self.run(query, opts).await?;
        let out = f(&mut result);
        // Close through one level of profile wrapping.
        match &mut result {
            RunResult::Cursor(cursor) => {
                cursor.close().await?;
            }
            RunResult::Profiled { value, .. } => {
                if let RunResult::Cursor(cursor) = value.as_mut() {
                    cursor.close().await?;
                }
            }
            _ => {}
        }
        Ok(out)
    }

    /// Synchronously drain all outstanding noreply queries on the server.
    pub async fn noreply_wait(&self) -> Result<(), DriverError> {
        if !self.is_open() {
            return Err(DriverError::ConnectionClosed(
                "cannot drain a closed connection".to_string(),
            ));
        }
        let token = self.next_token();
        let frame = encode_query(token, QueryType::NoreplyWait, None, None)?;
        self.register_slot(token, FormatOptions::default())?;
        if let Err(err) = self.dispatch(frame).await {
            self.retire_token(token);
            return Err(err);
        }
        let response = self.wait(token, None).await;
        self.retire_token(token);
        let response = response?;
        match response.rtype {
            ResponseType::WaitComplete => Ok(()),
            rtype => Err(response.to_error().unwrap_or_else(|| {
                DriverError::Protocol(format!("expected WAIT_COMPLETE, got {:?}", rtype))
            })),
        }
    }

    async fn ensure_open(&self) -> Result<(), DriverError> {
        if !self.is_open() && self.inner.config.reconnect_on_run {
            self.reconnect_with(CloseOptions { noreply_wait: false }).await?;
        }
        if !self.is_open() {
            return Err(DriverError::ConnectionClosed(
                "cannot run a query on a closed connection".to_string(),
            ));
        }
        Ok(())
    }

    async fn shape_response(
        &self,
        token: u64,
        response: Response,
        formats: FormatOptions,
    ) -> Result<RunResult, DriverError> {
        let profile = response.profile.clone();
        let value = match response.rtype {
            ResponseType::SuccessAtom => {
                self.retire_token(token);
                let atom = response.rows.into_iter().next().unwrap_or(Value::Null);
                RunResult::Atom(atom)
            }
            ResponseType::SuccessSequence => {
                self.retire_token(token);
                RunResult::Cursor(Cursor::from_response(
                    self.clone(),
                    token,
                    response,
                    formats,
                    false,
                ))
            }
            ResponseType::SuccessPartial => {
                let mut cursor =
                    Cursor::from_response(self.clone(), token, response, formats, true);
                cursor.prefetch().await?;
                RunResult::Cursor(cursor)
            }
            ResponseType::WaitComplete => {
                self.retire_token(token);
                return Err(DriverError::Protocol(
                    "unexpected WAIT_COMPLETE for a START query".to_string(),
                ));
            }
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
                self.retire_token(token);
                return Err(response.to_error().unwrap_or_else(|| {
                    DriverError::Internal("error response without a message".to_string())
                }));
            }
        };
        match profile {
            Some(profile) => Ok(RunResult::Profiled {
                profile,
                value: Box::new(value),
            }),
            None => Ok(value),
        }
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a blocking waiter. Fails if the token is already present;
    /// a duplicate token is a driver bug.
    pub(crate) fn register_slot(
        &self,
        token: u64,
        formats: FormatOptions,
    ) -> Result<Arc<Notify>, DriverError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.waiters.contains_key(&token) || state.pending.contains_key(&token) {
            return Err(DriverError::Internal(format!(
                "token {} is already registered",
                token
            )));
        }
        let notify = Arc::new(Notify::new());
        state.waiters.insert(token, Waiter::Slot(Arc::clone(&notify)));
        state.formats.insert(token, formats);
        Ok(notify)
    }

    pub(crate) fn register_feed(
        &self,
        token: u64,
        formats: FormatOptions,
        tx: mpsc::UnboundedSender<FeedEvent>,
    ) -> Result<(), DriverError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.waiters.contains_key(&token) || state.pending.contains_key(&token) {
            return Err(DriverError::Internal(format!(
                "token {} is already registered",
                token
            )));
        }
        state.waiters.insert(token, Waiter::Feed(tx));
        state.formats.insert(token, formats);
        Ok(())
    }

    /// Park until the reader delivers a response for `token`. Re-checks the
    /// pending map after every wakeup; a timed-out waiter stays registered
    /// so a later wait still receives the response.
    pub(crate) async fn wait(
        &self,
        token: u64,
        timeout: Option<Duration>,
    ) -> Result<Response, DriverError> {
        loop {
            let notify = {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(response) = state.pending.remove(&token) {
                    state.waiters.remove(&token);
                    return Ok(response);
                }
                match state.waiters.get(&token) {
                    Some(Waiter::Slot(notify)) => Arc::clone(notify),
                    Some(Waiter::Feed(_)) => {
                        return Err(DriverError::Internal(format!(
                            "token {} belongs to a handler",
                            token
                        )))
                    }
                    // Teardown removed the waiter.
                    None => {
                        return Err(DriverError::ConnectionClosed(
                            "connection closed while waiting for a response".to_string(),
                        ))
                    }
                }
            };
            match timeout {
                Some(dur) => {
                    if time::timeout(dur, notify.notified()).await.is_err() {
                        return Err(DriverError::Timeout);
                    }
                }
                None => notify.notified().await,
            }
        }
    }

    /// Forget a token entirely: waiter, pending response and format opts.
    pub(crate) fn retire_token(&self, token: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.waiters.remove(&token);
        state.pending.remove(&token);
        state.formats.remove(&token);
    }

    /// Retire a token after a STOP, remembering it so the reader drops any
    /// late CONTINUE response instead of treating it as a protocol error.
    pub(crate) fn abandon_token(&self, token: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.waiters.remove(&token);
        state.pending.remove(&token);
        state.formats.remove(&token);
        state.stopped.push_back(token);
        if state.stopped.len() > STOPPED_TOKEN_WINDOW {
            state.stopped.pop_front();
        }
    }

    /// Write one frame. Writes from concurrent dispatchers are serialized
    /// under the write lock; each frame is one contiguous write.
    pub(crate) async fn dispatch(&self, frame: Vec<u8>) -> Result<(), DriverError> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(stream) => {
                stream.write_all(&frame).await?;
                stream.flush().await?;
                Ok(())
            }
            None => Err(DriverError::ConnectionClosed(
                "cannot send on a closed connection".to_string(),
            )),
        }
    }
}

impl ConnInner {
    pub(crate) fn formats_for(&self, token: u64) -> FormatOptions {
        let state = self.state.lock().unwrap();
        state.formats.get(&token).copied().unwrap_or_default()
    }

    /// Deliver a decoded response to its waiter. Called by the reader.
    pub(crate) fn note_data(&self, token: u64, response: Response) -> Result<(), DriverError> {
        enum Kind {
            Slot(Arc<Notify>),
            Feed,
            Missing,
        }

        let mut state = self.state.lock().unwrap();
        let kind = match state.waiters.get(&token) {
            Some(Waiter::Slot(notify)) => Kind::Slot(Arc::clone(notify)),
            Some(Waiter::Feed(_)) => Kind::Feed,
            None => Kind::Missing,
        };
        match kind {
            Kind::Slot(notify) => {
                // The token lives in exactly one of the waiter table and
                // the pending map; delivery moves it.
                state.waiters.remove(&token);
                state.pending.insert(token, response);
                notify.notify_one();
                Ok(())
            }
            Kind::Feed => {
                let terminal = response.rtype != ResponseType::SuccessPartial;
                let delivered = match state.waiters.get(&token) {
                    Some(Waiter::Feed(tx)) => tx.send(FeedEvent::Response(response)).is_ok(),
                    _ => false,
                };
                if terminal || !delivered {
                    state.waiters.remove(&token);
                    state.formats.remove(&token);
                }
                Ok(())
            }
            Kind::Missing => {
                if state.stopped.contains(&token) {
                    tracing::trace!(token, "dropping response for a stopped token");
                    Ok(())
                } else {
                    Err(DriverError::Internal(format!(
                        "response for unknown token {}",
                        token
                    )))
                }
            }
        }
    }

    /// Fatal reader error: wake every outstanding waiter with a synthetic
    /// CLIENT_ERROR, then mark the reader dead. The socket stays; `close`
    /// completes the teardown.
    pub(crate) fn reader_failed(&self, reason: &str) {
        let msg = format!("Connection closed: {}", reason);
        tracing::warn!(reason, "reader terminated, failing outstanding queries");
        let mut state = self.state.lock().unwrap();
        state.reader_alive = false;
        let waiters: Vec<(u64, Waiter)> = state.waiters.drain().collect();
        for (token, waiter) in waiters {
            match waiter {
                Waiter::Slot(notify) => {
                    state
                        .pending
                        .insert(token, Response::synthetic_client_error(&msg));
                    notify.notify_one();
                }
                Waiter::Feed(tx) => {
                    let _ = tx.send(FeedEvent::Response(Response::synthetic_client_error(&msg)));
                }
            }
        }
    }

    /// Strip feed waiters so late responses are dropped, not dispatched.
    /// Used by the feed guard registry at reactor shutdown.
    pub(crate) fn drop_feed_waiters(&self) {
        let mut state = self.state.lock().unwrap();
        let feed_tokens: Vec<u64> = state
            .waiters
            .iter()
            .filter_map(|(token, waiter)| match waiter {
                Waiter::Feed(_) => Some(*token),
                _ => None,
            })
            .collect();
        for token in feed_tokens {
            state.waiters.remove(&token);
            state.formats.remove(&token);
            state.stopped.push_back(token);
            if state.stopped.len() > STOPPED_TOKEN_WINDOW {
                state.stopped.pop_front();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("conn_id", &self.conn_id())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Read the server's NUL-terminated handshake reply.
async fn read_nul_terminated(stream: &mut TcpStream) -> Result<String, DriverError> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        if buf.len() >= 4096 {
            return Err(DriverError::Handshake(
                "handshake reply exceeded 4096 bytes".to_string(),
            ));
        }
        buf.push(byte);
    }
    String::from_utf8(buf)
        .map_err(|_| DriverError::Handshake("handshake reply was not valid UTF-8".to_string()))
}
