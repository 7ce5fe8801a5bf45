//! The reader task: sole consumer of the socket's read side.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::protocol::{decode_header, Response, HEADER_SIZE};

use super::ConnInner;

/// Read frames until the socket or the payload decoder fails, delivering
/// each response to its waiter. Any failure is fatal: every outstanding
/// waiter is fed a synthetic CLIENT_ERROR and the task ends.
pub(crate) async fn reader_loop(inner: Arc<ConnInner>, mut socket: OwnedReadHalf) {
    let failure = loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(err) = socket.read_exact(&mut header).await {
            break err.to_string();
        }
        let (token, len) = match decode_header(&header) {
            Ok(pair) => pair,
            Err(err) => break err.to_string(),
        };

        let mut payload = vec![0u8; len];
        if let Err(err) = socket.read_exact(&mut payload).await {
            break err.to_string();
        }

        let formats = inner.formats_for(token);
        let response = match Response::from_payload(&payload, formats) {
            Ok(response) => response,
            Err(err) => break err.to_string(),
        };
        tracing::trace!(
            token,
            rtype = ?response.rtype,
            rows = response.rows.len(),
            "response frame received"
        );

        if let Err(err) = inner.note_data(token, response) {
            break err.to_string();
        }
    };
    inner.reader_failed(&failure);
}
