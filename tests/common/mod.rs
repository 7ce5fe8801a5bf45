//! Common test utilities for driver tests
//!
//! Provides an in-process stub server: it accepts driver connections over
//! real TCP, performs the handshake, and answers query frames from a
//! scripted behavior closure.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const HANDSHAKE_OK: &[u8] = b"SUCCESS\0";

/// What the stub does with one received query frame.
pub enum StubReply {
    /// Answer on the same token.
    Json(Value),
    /// Answer after sleeping.
    Delayed(Value, Duration),
    /// Answer with the frame split across two writes.
    Split(Value),
    /// Answer nothing.
    Silent,
    /// Drop the connection.
    Hangup,
}

/// Spawn a stub that accepts connections in a loop and feeds every query
/// frame to `behavior`. Returns the address to connect to.
pub async fn spawn_stub<F>(behavior: F) -> SocketAddr
where
    F: FnMut(u64, Value) -> StubReply + Send + 'static,
{
    spawn_stub_with_handshake(HANDSHAKE_OK.to_vec(), behavior).await
}

/// Same as [`spawn_stub`], with a custom handshake reply.
pub async fn spawn_stub_with_handshake<F>(handshake_reply: Vec<u8>, mut behavior: F) -> SocketAddr
where
    F: FnMut(u64, Value) -> StubReply + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            if read_handshake(&mut socket).await.is_err() {
                continue;
            }
            if socket.write_all(&handshake_reply).await.is_err() {
                continue;
            }
            serve_connection(&mut socket, &mut behavior).await;
        }
    });
    addr
}

async fn serve_connection<F>(socket: &mut TcpStream, behavior: &mut F)
where
    F: FnMut(u64, Value) -> StubReply,
{
    loop {
        let mut header = [0u8; 12];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let token = u64::from_le_bytes(header[..8].try_into().unwrap());
        let len = u32::from_le_bytes(header[8..].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }
        let query: Value = match serde_json::from_slice(&payload) {
            Ok(query) => query,
            Err(_) => return,
        };

        match behavior(token, query) {
            StubReply::Json(body) => {
                if write_frame(socket, token, &body).await.is_err() {
                    return;
                }
            }
            StubReply::Delayed(body, delay) => {
                tokio::time::sleep(delay).await;
                if write_frame(socket, token, &body).await.is_err() {
                    return;
                }
            }
            StubReply::Split(body) => {
                if write_frame_split(socket, token, &body).await.is_err() {
                    return;
                }
            }
            StubReply::Silent => {}
            StubReply::Hangup => return,
        }
    }
}

/// Consume the client preamble: magic, auth key length, auth key, wire.
async fn read_handshake(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut magic = [0u8; 4];
    socket.read_exact(&mut magic).await?;
    let mut key_len = [0u8; 4];
    socket.read_exact(&mut key_len).await?;
    let mut key = vec![0u8; u32::from_le_bytes(key_len) as usize];
    socket.read_exact(&mut key).await?;
    let mut wire = [0u8; 4];
    socket.read_exact(&mut wire).await?;
    Ok(())
}

pub async fn write_frame(
    socket: &mut TcpStream,
    token: u64,
    body: &Value,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap();
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&token.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    socket.write_all(&frame).await?;
    socket.flush().await
}

/// Write a frame in two chunks with a pause in between, exercising
/// reassembly on the client side.
async fn write_frame_split(
    socket: &mut TcpStream,
    token: u64,
    body: &Value,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap();
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&token.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);

    let mid = frame.len() / 2;
    socket.write_all(&frame[..mid]).await?;
    socket.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    socket.write_all(&frame[mid..]).await?;
    socket.flush().await
}

/// Poll `predicate` until it holds or the timeout elapses.
pub async fn wait_until<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
