//! Dispatcher for the reactive path: classifies response frames and routes
//! them to handler callbacks on a dedicated task, never under the
//! connection lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{encode_query, DriverError, QueryType, Response, ResponseType, RunOptions};

use super::handler::{Handler, HandlerResult};
use super::{feeds, Connection, FeedEvent};

impl Connection {
    /// Run a query on the reactive path: responses are classified and
    /// delivered to `handler` on a dedicated dispatcher task. Returns as
    /// soon as the query is on the wire.
    pub async fn run_with_handler<H: Handler>(
        &self,
        query: Value,
        mut opts: RunOptions,
        handler: H,
    ) -> Result<FeedHandle, DriverError> {
        if opts.noreply {
            return Err(DriverError::Argument(
                "noreply cannot be combined with a handler".to_string(),
            ));
        }
        self.ensure_open().await?;
        if handler.wants_states() {
            opts.include_states = true;
        }

        let formats = opts.formats();
        let global = opts.to_global_optargs(self.default_db().as_deref());
        let token = self.next_token();
        let frame = encode_query(token, QueryType::Start, Some(&query), Some(&global))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.register_feed(token, formats, tx)?;
        if let Err(err) = self.dispatch(frame).await {
            self.retire_token(token);
            return Err(err);
        }
        feeds::register(self);

        let stop = Arc::new(AtomicBool::new(false));
        tokio::spawn(dispatch_feed(
            self.clone(),
            token,
            rx,
            handler,
            Arc::clone(&stop),
        ));
        Ok(FeedHandle {
            conn: self.clone(),
            token,
            stop,
        })
    }
}

/// Handle to a running feed, for stopping it from outside the handler.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    conn: Connection,
    token: u64,
    stop: Arc<AtomicBool>,
}

impl FeedHandle {
    /// Stop the feed: suppress further dispatch, drop the waiter and send
    /// STOP for the token. Late responses are dropped by the reader.
    pub async fn stop(&self) -> Result<(), DriverError> {
        self.stop.store(true, Ordering::SeqCst);
        self.conn.abandon_token(self.token);
        if self.conn.is_open() {
            let frame = encode_query(self.token, QueryType::Stop, None, None)?;
            self.conn.dispatch(frame).await?;
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

async fn dispatch_feed<H: Handler>(
    conn: Connection,
    token: u64,
    mut rx: mpsc::UnboundedReceiver<FeedEvent>,
    mut handler: H,
    stop: Arc<AtomicBool>,
) {
    let mut opened = false;
    let mut closed = false;

    while let Some(event) = rx.recv().await {
        if stop.load(Ordering::SeqCst) || handler.stopped() {
            halt(&conn, token).await;
            return;
        }
        match event {
            FeedEvent::Closed => {
                close_once(&mut handler, &mut closed);
                return;
            }
            FeedEvent::Response(response) => {
                let terminal = deliver(
                    &conn,
                    token,
                    response,
                    &mut handler,
                    &mut opened,
                    &mut closed,
                    &stop,
                )
                .await;
                if terminal {
                    return;
                }
            }
        }
    }

    // Channel closed without a terminal event: the waiter was stripped by
    // a stop or by the feed guard shutdown.
    if !(stop.load(Ordering::SeqCst) || handler.stopped()) {
        close_once(&mut handler, &mut closed);
    }
}

/// Deliver one response. Returns true when the feed is finished.
async fn deliver<H: Handler>(
    conn: &Connection,
    token: u64,
    response: Response,
    handler: &mut H,
    opened: &mut bool,
    closed: &mut bool,
    stop: &Arc<AtomicBool>,
) -> bool {
    match response.rtype {
        ResponseType::SuccessPartial | ResponseType::SuccessSequence => {
            let terminal = response.rtype == ResponseType::SuccessSequence;
            if !terminal {
                // Keep the next fetch in flight before touching user code.
                if let Err(err) = send_continue(conn, token).await {
                    fail(conn, token, err, handler, opened, closed).await;
                    return true;
                }
            }
            if let Err(err) = open_once(handler, opened) {
                fail(conn, token, err, handler, opened, closed).await;
                return true;
            }
            let feed = response.is_feed();
            for row in response.rows {
                if stop.load(Ordering::SeqCst) || handler.stopped() {
                    halt(conn, token).await;
                    return true;
                }
                let routed = if feed {
                    route_change(handler, row)
                } else {
                    handler.on_stream_val(row)
                };
                if let Err(err) = routed {
                    fail(conn, token, err, handler, opened, closed).await;
                    return true;
                }
            }
            if terminal {
                close_once(handler, closed);
            }
            terminal
        }
        ResponseType::SuccessAtom => {
            if let Err(err) = open_once(handler, opened) {
                fail(conn, token, err, handler, opened, closed).await;
                return true;
            }
            let atom = response.rows.into_iter().next().unwrap_or(Value::Null);
            let result = match atom {
                Value::Array(items) => handler.on_array(items),
                value => handler.on_atom(value),
            };
            if let Err(err) = result {
                fail(conn, token, err, handler, opened, closed).await;
                return true;
            }
            close_once(handler, closed);
            true
        }
        ResponseType::WaitComplete => {
            if let Err(err) = open_once(handler, opened) {
                fail(conn, token, err, handler, opened, closed).await;
                return true;
            }
            if let Err(err) = handler.on_wait_complete() {
                fail(conn, token, err, handler, opened, closed).await;
                return true;
            }
            close_once(handler, closed);
            true
        }
        ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
            let err = response.to_error().unwrap_or_else(|| {
                DriverError::Internal("error response without a message".to_string())
            });
            let _ = open_once(handler, opened);
            handler.on_error(err);
            close_once(handler, closed);
            true
        }
    }
}

/// Classify one changefeed row by key presence and route it.
fn route_change<H: Handler>(handler: &mut H, row: Value) -> HandlerResult {
    let mut obj = match row {
        Value::Object(obj) => obj,
        other => return handler.on_unrecognized_change(other),
    };
    let has_new = obj.contains_key("new_val");
    let has_old = obj.contains_key("old_val");
    if has_new && has_old {
        let old = obj.remove("old_val").unwrap_or(Value::Null);
        let new = obj.remove("new_val").unwrap_or(Value::Null);
        handler.on_change(old, new)
    } else if has_new {
        let new = obj.remove("new_val").unwrap_or(Value::Null);
        handler.on_initial_val(new)
    } else if let Some(err) = obj.remove("error") {
        handler.on_change_error(stringify(err))
    } else if let Some(state) = obj.remove("state") {
        handler.on_state(stringify(state))
    } else {
        handler.on_unrecognized_change(Value::Object(obj))
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn open_once<H: Handler>(handler: &mut H, opened: &mut bool) -> HandlerResult {
    if *opened {
        return Ok(());
    }
    *opened = true;
    handler.on_open()
}

fn close_once<H: Handler>(handler: &mut H, closed: &mut bool) {
    if !*closed {
        *closed = true;
        handler.on_close();
    }
}

/// A callback (or the dispatcher itself) failed: hand the captured error
/// to `on_error`, close the handler, and stop the server-side stream.
async fn fail<H: Handler>(
    conn: &Connection,
    token: u64,
    err: DriverError,
    handler: &mut H,
    opened: &mut bool,
    closed: &mut bool,
) {
    let _ = open_once(handler, opened);
    handler.on_error(err);
    close_once(handler, closed);
    halt(conn, token).await;
}

/// Abandon the token and best-effort STOP the server-side stream.
async fn halt(conn: &Connection, token: u64) {
    conn.abandon_token(token);
    if conn.is_open() {
        if let Ok(frame) = encode_query(token, QueryType::Stop, None, None) {
            let _ = conn.dispatch(frame).await;
        }
    }
}

async fn send_continue(conn: &Connection, token: u64) -> Result<(), DriverError> {
    let frame = encode_query(token, QueryType::Continue, None, None)?;
    conn.dispatch(frame).await
}
