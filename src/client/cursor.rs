//! Lazy, restartable-on-demand view of a server-side result sequence.

use std::collections::VecDeque;
use std::time::Duration;

use futures::Stream;
use serde_json::Value;

use crate::protocol::{encode_query, DriverError, FormatOptions, QueryType, Response, ResponseType};

use super::Connection;

/// A lazy sequence backed by server-side continuation. Yields buffered
/// rows in order and transparently fetches the next batch while `more`
/// is set. One fetch is kept in flight at all times so the next batch
/// overlaps consumption.
#[derive(Debug)]
pub struct Cursor {
    conn: Connection,
    conn_id: u64,
    token: u64,
    formats: FormatOptions,
    buffer: VecDeque<Value>,
    more: bool,
    consumed: bool,
}

impl Cursor {
    pub(crate) fn from_response(
        conn: Connection,
        token: u64,
        response: Response,
        formats: FormatOptions,
        more: bool,
    ) -> Self {
        Cursor {
            conn_id: conn.conn_id(),
            conn,
            token,
            formats,
            buffer: response.rows.into(),
            more,
            consumed: false,
        }
    }

    /// Re-register the token and send CONTINUE, keeping one fetch in
    /// flight. Called right after construction and after every batch
    /// handoff while the server reports more data.
    pub(crate) async fn prefetch(&mut self) -> Result<(), DriverError> {
        if !self.more {
            return Ok(());
        }
        self.conn.register_slot(self.token, self.formats)?;
        let frame = encode_query(self.token, QueryType::Continue, None, None)?;
        if let Err(err) = self.conn.dispatch(frame).await {
            self.conn.retire_token(self.token);
            return Err(err);
        }
        Ok(())
    }

    /// True once the owning connection was reconnected or closed. A stale
    /// cursor fails every further batch wait.
    pub fn is_stale(&self) -> bool {
        self.conn_id != self.conn.conn_id() || !self.conn.is_open()
    }

    /// Next row, waiting indefinitely for the batch when the buffer is
    /// drained. `Ok(None)` once the sequence is exhausted.
    pub async fn next(&mut self) -> Result<Option<Value>, DriverError> {
        self.advance(None).await
    }

    /// Next row with a bounded wait. `Duration::ZERO` yields only already
    /// buffered rows. Expiry fails with `Timeout` and leaves the cursor
    /// usable; the awaited batch is not lost.
    pub async fn try_next(&mut self, timeout: Duration) -> Result<Option<Value>, DriverError> {
        self.advance(Some(timeout)).await
    }

    async fn advance(&mut self, timeout: Option<Duration>) -> Result<Option<Value>, DriverError> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if !self.more {
                self.consumed = true;
                return Ok(None);
            }
            self.wait_for_batch(timeout).await?;
        }
    }

    async fn wait_for_batch(&mut self, timeout: Option<Duration>) -> Result<(), DriverError> {
        if self.is_stale() {
            self.more = false;
            return Err(DriverError::ConnectionClosed(
                "cursor outlived its connection".to_string(),
            ));
        }
        let response = self.conn.wait(self.token, timeout).await?;
        match response.rtype {
            ResponseType::SuccessPartial => {
                self.buffer.extend(response.rows);
                self.prefetch().await
            }
            ResponseType::SuccessSequence => {
                self.more = false;
                self.conn.retire_token(self.token);
                self.buffer.extend(response.rows);
                Ok(())
            }
            rtype => {
                self.more = false;
                self.conn.retire_token(self.token);
                Err(response.to_error().unwrap_or_else(|| {
                    DriverError::Protocol(format!("unexpected response type {:?} for CONTINUE", rtype))
                }))
            }
        }
    }

    /// Drain the remaining rows into a vector. Fails with
    /// `CursorConsumed` when the cursor was already fully iterated.
    pub async fn to_vec(&mut self) -> Result<Vec<Value>, DriverError> {
        self.claim()?;
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Invoke `f` for every remaining row. Fails with `CursorConsumed`
    /// when the cursor was already fully iterated.
    pub async fn for_each<F>(&mut self, mut f: F) -> Result<(), DriverError>
    where
        F: FnMut(Value),
    {
        self.claim()?;
        while let Some(row) = self.next().await? {
            f(row);
        }
        Ok(())
    }

    fn claim(&self) -> Result<(), DriverError> {
        if self.consumed {
            return Err(DriverError::CursorConsumed);
        }
        Ok(())
    }

    /// Adapt the cursor to a `futures::Stream` of rows.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, DriverError>> {
        let poisoned = self.consumed;
        futures::stream::try_unfold((self, poisoned), |(mut cursor, poisoned)| async move {
            if poisoned {
                return Err(DriverError::CursorConsumed);
            }
            match cursor.next().await? {
                Some(row) => Ok(Some((row, (cursor, false)))),
                None => Ok(None),
            }
        })
    }

    /// Stop the server-side stream. Sends STOP (fire-and-forget) when the
    /// sequence was still open and returns whether anything was stopped.
    /// A late response for the abandoned token is silently dropped by the
    /// reader.
    pub async fn close(&mut self) -> Result<bool, DriverError> {
        if !self.more {
            return Ok(false);
        }
        self.more = false;
        self.conn.abandon_token(self.token);
        if self.conn.is_open() && self.conn_id == self.conn.conn_id() {
            let frame = encode_query(self.token, QueryType::Stop, None, None)?;
            self.conn.dispatch(frame).await?;
        }
        Ok(true)
    }
}
