//! Event sink for the reactive path.

use serde_json::{json, Value};

use crate::protocol::DriverError;

/// Outcome of a single handler callback. An `Err` ends the feed: it is
/// re-delivered to `on_error` and followed by `on_close`.
pub type HandlerResult = Result<(), DriverError>;

/// Caller-supplied sink for streamed results and changefeed events.
///
/// Every method has a default, so a handler implements only what it cares
/// about. The value-carrying defaults funnel into [`Handler::on_val`].
/// `on_open` / `on_close` are invoked at most once per feed; the
/// dispatcher enforces the idempotency.
pub trait Handler: Send + 'static {
    /// First event of the feed.
    fn on_open(&mut self) -> HandlerResult {
        Ok(())
    }

    /// Last event of the feed, also fired on connection teardown.
    fn on_close(&mut self) {}

    fn on_wait_complete(&mut self) -> HandlerResult {
        Ok(())
    }

    /// Catch-all value sink the other defaults delegate to.
    fn on_val(&mut self, _val: Value) -> HandlerResult {
        Ok(())
    }

    fn on_atom(&mut self, val: Value) -> HandlerResult {
        self.on_val(val)
    }

    fn on_array(&mut self, vals: Vec<Value>) -> HandlerResult {
        for val in vals {
            self.on_atom(val)?;
        }
        Ok(())
    }

    /// One row of a plain (non-feed) streamed sequence.
    fn on_stream_val(&mut self, val: Value) -> HandlerResult {
        self.on_val(val)
    }

    /// Changefeed row carrying only a `new_val`.
    fn on_initial_val(&mut self, val: Value) -> HandlerResult {
        self.on_val(val)
    }

    /// Changefeed row carrying both `old_val` and `new_val`.
    fn on_change(&mut self, old: Value, new: Value) -> HandlerResult {
        self.on_val(json!({ "old_val": old, "new_val": new }))
    }

    /// Changefeed row carrying an `error` field.
    fn on_change_error(&mut self, msg: String) -> HandlerResult {
        Err(DriverError::Runtime {
            msg,
            backtrace: None,
        })
    }

    /// Changefeed state row (`{state: "ready"}` and friends). Override
    /// this together with [`Handler::wants_states`].
    fn on_state(&mut self, _state: String) -> HandlerResult {
        Ok(())
    }

    /// Changefeed row matching none of the known shapes.
    fn on_unrecognized_change(&mut self, row: Value) -> HandlerResult {
        Err(DriverError::Protocol(format!(
            "unrecognized change row: {}",
            row
        )))
    }

    /// Terminal error sink. Receives server errors, dispatch errors and
    /// errors returned by the other callbacks.
    fn on_error(&mut self, err: DriverError) {
        tracing::error!(error = %err, "unhandled feed error");
    }

    /// Return true to have `include_states: true` merged into the query
    /// options, so `on_state` actually sees state rows.
    fn wants_states(&self) -> bool {
        false
    }

    /// Checked before every delivery; once true, all further dispatch for
    /// this feed is suppressed.
    fn stopped(&self) -> bool {
        false
    }
}
