//! RillDB Rust Client
//!
//! Native TCP driver for RillDB. Many in-flight queries are multiplexed
//! over one connection by 64-bit tokens: a single reader task delivers
//! response frames to blocking callers or to handler callbacks, paged
//! sequences come back as lazy [`Cursor`]s that fetch further batches on
//! demand, and changefeeds are routed event-by-event to a [`Handler`].
//!
//! # Synchronous path
//!
//! ```rust,no_run
//! use rilldb_client::{Connection, RunOptions, RunResult};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rilldb_client::DriverError> {
//!     let conn = Connection::builder()
//!         .host("localhost")
//!         .db("marina")
//!         .connect()
//!         .await?;
//!
//!     match conn.run(json!([15, ["boats"]]), RunOptions::new()).await? {
//!         RunResult::Atom(value) => println!("atom: {}", value),
//!         RunResult::Cursor(mut cursor) => {
//!             while let Some(row) = cursor.next().await? {
//!                 println!("row: {}", row);
//!             }
//!         }
//!         other => println!("{:?}", other),
//!     }
//!     conn.close().await
//! }
//! ```
//!
//! # Reactive path
//!
//! ```rust,no_run
//! use rilldb_client::{Connection, Handler, HandlerResult, RunOptions};
//! use serde_json::{json, Value};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_change(&mut self, old: Value, new: Value) -> HandlerResult {
//!         println!("{} -> {}", old, new);
//!         Ok(())
//!     }
//! }
//!
//! # async fn feed(conn: Connection) -> Result<(), rilldb_client::DriverError> {
//! let feed = conn
//!     .run_with_handler(json!([152, [[15, ["boats"]]]]), RunOptions::new(), Printer)
//!     .await?;
//! // ... later:
//! feed.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;

pub use client::{
    feeds, repl, CloseOptions, Connection, ConnectionBuilder, Cursor, FeedHandle, Handler,
    HandlerResult, RunResult,
};
pub use protocol::{DriverError, Format, RunOptions};
