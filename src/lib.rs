//! PostgreSQL frontend protocol client with SQL preparsing.
//!
//! The two halves of this crate:
//!
//! - [`sql`] — a preparser that lexes SQL into fragments, understands
//!   positional (`$N`) and named (`:name`) parameters, renders server-ready
//!   query strings, and mines key/value extra data out of leading comments;
//! - [`Connection`] — a non-blocking implementation of the frontend side of
//!   the PostgreSQL v3 wire protocol: session lifecycle, request queue,
//!   prepared statement registry, row streaming, notices and
//!   `LISTEN`/`NOTIFY` notifications.
//!
//! # Examples
//!
//! ```no_run
//! use prequel::{Connection, Config, Params, sql::Statement};
//!
//! # async fn app() -> prequel::Result<()> {
//! let mut conn = Connection::connect_with(Config::from_env()).await?;
//!
//! let stmt = Statement::new("SELECT name FROM users WHERE id = :id")?;
//! let mut params = Params::from_statement(&stmt);
//! params.bind_named("id", &42);
//!
//! conn.execute(&stmt, &params).await?;
//! conn.for_each(|row| {
//!     let name: String = row.try_get("name").unwrap();
//!     println!("{name}");
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything blocking is a thin deadline wrapper over the non-blocking
//! core; see the [`connection`] module for the model.

pub mod common;
mod ext;

// Protocol
pub mod postgres;

// Codec
mod data;
mod encode;
mod decode;

// Component
pub mod sql;
mod params;
mod row;

// Connection
#[cfg(feature = "tokio")]
mod io;
#[cfg(feature = "tokio")]
pub mod net;
#[cfg(feature = "tokio")]
pub mod connection;

mod error;

pub use data::Data;
pub use encode::Encode;
pub use decode::{Decode, DecodeError};
pub use params::Params;
pub use row::{Column, Index, Row};
pub use sql::Statement;

pub use postgres::{PgFormat, ProtocolError, ServerError};

#[cfg(feature = "tokio")]
pub use connection::{
    CommunicationStatus, Completion, Config, Connection, Notice, Notification,
    PreparedStatement, TlsMode, TransactionBlockStatus,
};
#[cfg(feature = "tokio")]
pub use net::Readiness;

pub use error::{
    Error, ErrorKind, InvalidArgument, MissingParameter, Result, TimedOut, UnsupportedAuth,
};
