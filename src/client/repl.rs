//! Process-wide connection slots for interactive use.
//!
//! Both slots live behind locks and are only set explicitly:
//! [`Connection::repl`](super::Connection::repl) installs the default
//! connection, and every successful connect records the last connection.

use std::sync::Mutex;

use super::Connection;

static DEFAULT: Mutex<Option<Connection>> = Mutex::new(None);
static LAST: Mutex<Option<Connection>> = Mutex::new(None);

/// Install `conn` as the process-wide default connection.
pub fn set_default(conn: &Connection) {
    *DEFAULT.lock().unwrap() = Some(conn.clone());
}

/// The process-wide default connection, if one was installed.
pub fn default() -> Option<Connection> {
    DEFAULT.lock().unwrap().clone()
}

/// Drop the process-wide default connection.
pub fn clear_default() {
    *DEFAULT.lock().unwrap() = None;
}

/// The most recently connected connection in this process.
pub fn last() -> Option<Connection> {
    LAST.lock().unwrap().clone()
}

pub(crate) fn note_last(conn: &Connection) {
    *LAST.lock().unwrap() = Some(conn.clone());
}
