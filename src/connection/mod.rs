//! Postgres Connection.
//!
//! [`Connection`] implements the frontend side of the protocol as a
//! non-blocking state machine: requests queue frontend messages, the pump
//! decodes whatever the socket delivers and routes it into the response
//! slot, the signal queues and the prepared statement registry. The
//! blocking methods are the same machine driven through the socket poller
//! with an optional deadline, so a timed out wait can simply be retried.
//!
//! ```no_run
//! use prequel::{Connection, Config, sql::Statement};
//!
//! # async fn app() -> prequel::Result<()> {
//! let mut conn = Connection::connect_with(Config::from_env()).await?;
//!
//! let stmt = Statement::new("SELECT $1::int + 1")?;
//! let ps = conn.prepare_statement(&stmt, "incr").await?;
//! let mut params = ps.params();
//! params.bind(0, &41);
//!
//! conn.execute_statement("incr", &params).await?;
//! conn.for_each(|row| {
//!     let n: i32 = row.try_get(0usize).unwrap();
//!     assert_eq!(n, 42);
//! }).await?;
//! # Ok(())
//! # }
//! ```
use bytes::{Buf, Bytes, BytesMut};
use std::{
    collections::{HashMap, VecDeque},
    io,
    task::{Context, Poll, Waker, ready},
    time::{Duration, SystemTime},
};

use crate::{
    common::{ByteStr, debug},
    data::Data,
    error::{Error, Result, TimedOut, UnsupportedAuth},
    net::{Readiness, Socket, timed},
    params::Params,
    postgres::{
        BackendProtocol, PgFormat, ProtocolError, ServerError, ServerFields, backend, frontend,
        frontend::FrontendProtocol,
    },
    row::Row,
    sql::Statement,
};

mod config;
mod prepared;
mod signal;

pub use config::{Config, ConfigError, TlsMode};
pub use prepared::PreparedStatement;
pub use signal::{Notice, NoticeHandler, Notification, NotificationHandler};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Communication state of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunicationStatus {
    /// No session and no socket; the initial state, and the state after
    /// [`disconnect`][Connection::disconnect].
    Disconnected,
    /// Session establishment: waiting for handshake bytes from the server.
    EstablishmentReading,
    /// Session establishment: handshake bytes queued for the server.
    EstablishmentWriting,
    /// The session is up.
    Connected,
    /// Unrecoverable I/O or protocol failure; connect again to recover.
    Failure,
}

/// Server transaction block status, from `ReadyForQuery`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionBlockStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    Uncommitted,
    /// In a failed transaction block, queries are rejected until the block
    /// is ended.
    Failed,
}

/// Successful completion of a command, from `CommandComplete`.
pub struct Completion {
    tag: ByteStr,
}

impl Completion {
    fn new(tag: ByteStr) -> Self {
        Self { tag }
    }

    /// The response to an empty query string.
    fn empty_query() -> Self {
        Self { tag: ByteStr::default() }
    }

    fn unprepare() -> Self {
        Self { tag: ByteStr::from_static("UNPREPARE") }
    }

    /// Returns the full command tag, e.g. `INSERT 0 5`.
    ///
    /// Empty for the completion of an empty query string.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the tag with the trailing counters removed, e.g. `INSERT`.
    pub fn operation_name(&self) -> &str {
        let mut name = self.tag.trim_end();
        while let Some((rest, last)) = name.rsplit_once(' ') {
            if last.parse::<u64>().is_err() {
                break;
            }
            name = rest.trim_end();
        }
        name
    }

    /// Returns the rows reported by the tag, e.g. `5` for `INSERT 0 5`.
    pub fn rows_affected(&self) -> Option<u64> {
        self.tag.trim_end().rsplit(' ').next()?.parse().ok()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Completion").field(&self.tag.as_str()).finish()
    }
}

/// The single visible response of the current request.
#[derive(Debug)]
enum Response {
    Error(ServerError),
    Row(Row),
    Completion(Completion),
    PreparedStatement(String),
}

/// A submitted request, head of the queue first.
#[derive(Debug)]
enum Request {
    Perform,
    Prepare {
        name: String,
        positional: usize,
        names: Vec<String>,
        preparsed: bool,
    },
    Describe {
        name: String,
    },
    Execute,
    Unprepare {
        name: String,
    },
}

/// A connection to a PostgreSQL server.
///
/// See the [module documentation][self] for an overview.
pub struct Connection {
    config: Config,
    status: CommunicationStatus,
    socket: Option<Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,

    requests: VecDeque<Request>,
    response: Option<Response>,
    row_template: Option<Row>,

    statements: HashMap<String, PreparedStatement>,

    notices: VecDeque<Notice>,
    notifications: VecDeque<Notification>,
    notice_handler: Option<NoticeHandler>,
    notification_handler: Option<NotificationHandler>,

    server_params: HashMap<ByteStr, ByteStr>,
    backend_key: Option<backend::BackendKeyData>,
    tx_status: Option<TransactionBlockStatus>,
    session_start: Option<SystemTime>,
    result_format: PgFormat,
}

// ===== Lifecycle =====

impl Connection {
    /// A disconnected connection holding `config`. No I/O happens here.
    pub fn new(config: Config) -> Connection {
        Connection {
            config,
            status: CommunicationStatus::Disconnected,
            socket: None,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            requests: VecDeque::new(),
            response: None,
            row_template: None,
            statements: HashMap::new(),
            notices: VecDeque::new(),
            notifications: VecDeque::new(),
            notice_handler: None,
            notification_handler: None,
            server_params: HashMap::new(),
            backend_key: None,
            tx_status: None,
            session_start: None,
            result_format: PgFormat::Text,
        }
    }

    /// A disconnected connection configured from the environment.
    ///
    /// See [`Config::from_env`].
    pub fn from_env() -> Connection {
        Self::new(Config::from_env())
    }

    /// Connect with the provided config.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        let mut conn = Self::new(config);
        conn.connect(None).await?;
        Ok(conn)
    }

    /// Establish the session without waiting beyond the next suspension
    /// point.
    ///
    /// The establishment state machine lives on the connection: a dropped
    /// or timed out call loses no progress, calling again resumes where it
    /// stopped. Track the progress through
    /// [`communication_status`][Connection::communication_status] and
    /// [`socket_readiness`][Connection::socket_readiness].
    ///
    /// When called in the `Failure` state, all unhandled server messages
    /// are dismissed and the establishment restarts from scratch.
    pub async fn connect_async(&mut self) -> Result<()> {
        match self.status {
            CommunicationStatus::Connected => return Ok(()),
            CommunicationStatus::Failure => self.reset(),
            _ => {}
        }
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    /// Establish the session, waiting up to `timeout`.
    ///
    /// [`None`] falls back to the configured
    /// [`connect_timeout`][Config::connect_timeout], which itself defaults
    /// to eternity.
    pub async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.or(self.config.connect_timeout);
        match timed(timeout, self.connect_async()).await {
            Ok(result) => result,
            Err(TimedOut) => Err(TimedOut.into()),
        }
    }

    async fn establish(&mut self) -> Result<()> {
        if self.socket.is_none() {
            if self.config.tls_mode == TlsMode::Require {
                return Err(ConfigError::new(
                    "tls_mode requires TLS, but no TLS agent is available",
                )
                .into());
            }

            self.status = CommunicationStatus::EstablishmentWriting;
            let socket = match &self.config.socket {
                Some(path) => Socket::connect_socket(path).await?,
                // prefer the well known local socket, the way psql does
                None if self.config.host == "localhost" => {
                    let path = format!("/run/postgresql/.s.PGSQL.{}", self.config.port);
                    match Socket::connect_socket(&path).await {
                        Ok(socket) => socket,
                        Err(_) => {
                            Socket::connect_tcp(
                                &self.config.host,
                                self.config.port,
                                self.config.keepalive,
                            )
                            .await?
                        }
                    }
                }
                None => {
                    Socket::connect_tcp(&self.config.host, self.config.port, self.config.keepalive)
                        .await?
                }
            };
            self.socket = Some(socket);

            frontend::Startup {
                user: self.config.user.as_str(),
                database: Some(self.config.dbname.as_str()),
                application_name: self.config.application_name.as_deref(),
                client_encoding: Some(self.config.client_encoding.as_str()),
                session_read_only: self.config.session_read_only,
                replication: None,
            }
            .write(&mut self.write_buf);
        }

        loop {
            if !self.write_buf.is_empty() {
                self.status = CommunicationStatus::EstablishmentWriting;
                self.flush().await?;
            }
            self.status = CommunicationStatus::EstablishmentReading;

            let (msgtype, body) = self.recv_raw().await?;
            match msgtype {
                backend::Authentication::MSGTYPE => {
                    use backend::Authentication::*;
                    match backend::Authentication::decode(msgtype, body)? {
                        Ok => {}
                        CleartextPassword => {
                            let password = self.config.resolve_password();
                            self.send(frontend::PasswordMessage { password: &password });
                        }
                        _ => return Err(UnsupportedAuth.into()),
                    }
                }
                backend::ParameterStatus::MSGTYPE => {
                    let param = backend::ParameterStatus::decode(msgtype, body)?;
                    self.server_params.insert(param.name, param.value);
                }
                backend::BackendKeyData::MSGTYPE => {
                    self.backend_key = Some(backend::BackendKeyData::decode(msgtype, body)?);
                }
                backend::NoticeResponse::MSGTYPE => {
                    self.notices.push_back(Notice::new(ServerFields::parse(body)?));
                }
                backend::ErrorResponse::MSGTYPE => {
                    return Err(ServerError::new(ServerFields::parse(body)?).into());
                }
                backend::NegotiateProtocolVersion::MSGTYPE => {
                    let _negotiate = backend::NegotiateProtocolVersion::decode(msgtype, body)?;
                    debug!("server negotiated protocol minor version {}", _negotiate.minor);
                }
                backend::ReadyForQuery::MSGTYPE => {
                    let ready = backend::ReadyForQuery::decode(msgtype, body)?;
                    self.tx_status = Some(transaction_status(ready.tx_status)?);
                    break;
                }
                _ => {
                    return Err(
                        ProtocolError::unexpected_phase(msgtype, "session establishment").into()
                    );
                }
            }
        }

        self.status = CommunicationStatus::Connected;
        self.session_start = Some(SystemTime::now());
        debug!("session established as {:?}", self.config.user.as_str());
        Ok(())
    }

    /// Drop the session immediately.
    ///
    /// A `Terminate` message is attempted without waiting, then the socket
    /// and every pending item (responses, signals, registry entries) are
    /// released.
    pub fn disconnect(&mut self) {
        if self.status == CommunicationStatus::Connected {
            if let Some(socket) = &self.socket {
                let mut bye = BytesMut::new();
                frontend::write(frontend::Terminate, &mut bye);
                let _ = socket.try_write(&bye);
            }
        }
        self.reset();
    }

    /// Close the session cleanly: send `Terminate`, flush, shut the socket
    /// down.
    pub async fn close(mut self) -> io::Result<()> {
        self.send(frontend::Terminate);
        let _ = std::future::poll_fn(|cx| self.poll_flush(cx)).await;
        match &mut self.socket {
            Some(socket) => socket.shutdown().await,
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.socket = None;
        self.status = CommunicationStatus::Disconnected;
        self.read_buf.clear();
        self.write_buf.clear();
        self.requests.clear();
        self.response = None;
        self.row_template = None;
        self.statements.clear();
        self.notices.clear();
        self.notifications.clear();
        self.server_params.clear();
        self.backend_key = None;
        self.tx_status = None;
        self.session_start = None;
    }

    fn fail(&mut self) {
        self.socket = None;
        self.status = CommunicationStatus::Failure;
    }
}

// ===== Observers =====

impl Connection {
    /// Returns the communication status.
    pub fn communication_status(&self) -> CommunicationStatus {
        self.status
    }

    /// Returns `true` when the session is up.
    pub fn is_connected(&self) -> bool {
        self.status == CommunicationStatus::Connected
    }

    /// Returns the connection options.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the last reported transaction block status.
    pub fn transaction_block_status(&self) -> Option<TransactionBlockStatus> {
        self.tx_status
    }

    /// Returns `true` when the session is inside an open transaction block.
    pub fn is_transaction_block_uncommitted(&self) -> bool {
        self.tx_status == Some(TransactionBlockStatus::Uncommitted)
    }

    /// Returns when the current session reached
    /// [`Connected`][CommunicationStatus::Connected].
    pub fn session_start_time(&self) -> Option<SystemTime> {
        self.session_start
    }

    /// Returns the server process id of the session backend.
    pub fn server_pid(&self) -> Option<u32> {
        self.backend_key.as_ref().map(|key| key.process_id)
    }

    /// Returns the last reported value of the run-time parameter `name`,
    /// e.g. `server_version` or `client_encoding`.
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(ByteStr::as_str)
    }

    /// Result format for the next statement execution.
    pub fn result_format(&self) -> PgFormat {
        self.result_format
    }

    /// Set the result format for the next statement execution.
    pub fn set_result_format(&mut self, format: PgFormat) {
        self.result_format = format;
    }
}

// ===== Socket poller =====

impl Connection {
    /// Wait until the socket reaches any readiness condition of `mask`,
    /// up to `timeout` ([`None`] is eternity).
    pub async fn wait_socket_readiness(
        &self,
        mask: Readiness,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let socket = self.pollable_socket()?;
        match timed(timeout, std::future::poll_fn(|cx| socket.poll_readiness(cx, mask))).await {
            Ok(readiness) => Ok(readiness?),
            Err(TimedOut) => Err(TimedOut.into()),
        }
    }

    /// The readiness conditions of `mask` holding right now.
    pub fn socket_readiness(&self, mask: Readiness) -> Result<Readiness> {
        let socket = self.pollable_socket()?;
        let mut cx = Context::from_waker(Waker::noop());
        match socket.poll_readiness(&mut cx, mask) {
            Poll::Ready(readiness) => Ok(readiness?),
            Poll::Pending => Ok(Readiness::NONE),
        }
    }

    fn pollable_socket(&self) -> Result<&Socket> {
        match self.status {
            CommunicationStatus::Disconnected | CommunicationStatus::Failure => {
                Err(Error::invalid_argument("no socket to poll in this state"))
            }
            _ => self
                .socket
                .as_ref()
                .ok_or_else(|| Error::invalid_argument("no socket to poll in this state")),
        }
    }
}

// ===== Message pump =====

/// Take one complete message off `buf`, type byte and length stripped.
fn take_message(buf: &mut BytesMut) -> Option<(u8, Bytes)> {
    let mut header = buf.get(..5)?;
    let msgtype = header.get_u8();
    let len = header.get_i32() as usize;
    if buf.len() - 1 < len {
        return None;
    }
    buf.advance(5);
    let body = buf.split_to(len - 4).freeze();
    Some((msgtype, body))
}

fn transaction_status(code: u8) -> Result<TransactionBlockStatus, ProtocolError> {
    match code {
        b'I' => Ok(TransactionBlockStatus::Idle),
        b'T' => Ok(TransactionBlockStatus::Uncommitted),
        b'E' => Ok(TransactionBlockStatus::Failed),
        _ => Err(ProtocolError::unknown(code)),
    }
}

impl Connection {
    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut self.socket {
            Some(socket) => crate::io::poll_write_all(socket, &mut self.write_buf, cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await?;
        Ok(())
    }

    fn poll_fill(&mut self, cx: &mut Context) -> Poll<io::Result<usize>> {
        if let Some(mut header) = self.read_buf.get(..5) {
            let _ = header.get_u8();
            let len = header.get_i32() as usize;
            self.read_buf.reserve(1 + len);
        } else {
            self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
        }
        match &mut self.socket {
            Some(socket) => {
                let n = ready!(crate::io::poll_read(socket, &mut self.read_buf, cx))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                Poll::Ready(Ok(n))
            }
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    /// Receive one message of any type, used during establishment.
    async fn recv_raw(&mut self) -> Result<(u8, Bytes)> {
        std::future::poll_fn(|cx| {
            loop {
                if let Some(message) = take_message(&mut self.read_buf) {
                    return Poll::Ready(Ok::<_, Error>(message));
                }
                ready!(self.poll_fill(cx))?;
            }
        })
        .await
    }

    /// Decode and route everything complete in the read buffer.
    ///
    /// Stops as soon as a response becomes visible: the next message is
    /// decoded only once the caller drained the current one.
    fn drain_buffered(&mut self) -> Result<()> {
        while self.response.is_none() {
            match take_message(&mut self.read_buf) {
                Some((msgtype, body)) => self.route_message(msgtype, body)?,
                None => break,
            }
        }
        Ok(())
    }

    fn route_message(&mut self, msgtype: u8, body: Bytes) -> Result<()> {
        use backend::*;

        match msgtype {
            NoticeResponse::MSGTYPE => {
                self.notices.push_back(Notice::new(ServerFields::parse(body)?));
            }
            NotificationResponse::MSGTYPE => {
                let notification = NotificationResponse::decode(msgtype, body)?;
                self.notifications.push_back(notification.into());
            }
            ParameterStatus::MSGTYPE => {
                let param = ParameterStatus::decode(msgtype, body)?;
                self.server_params.insert(param.name, param.value);
            }
            BackendKeyData::MSGTYPE => {
                self.backend_key = Some(BackendKeyData::decode(msgtype, body)?);
            }
            ReadyForQuery::MSGTYPE => {
                let ready = ReadyForQuery::decode(msgtype, body)?;
                self.tx_status = Some(transaction_status(ready.tx_status)?);
                self.requests.pop_front();
                self.row_template = None;
            }
            ErrorResponse::MSGTYPE => {
                self.response = Some(Response::Error(ServerError::new(ServerFields::parse(body)?)));
                self.row_template = None;
            }
            RowDescription::MSGTYPE => match self.requests.front() {
                Some(Request::Describe { name }) => {
                    let name = name.clone();
                    let row = Row::new(body);
                    self.statements
                        .entry(name.clone())
                        .or_insert_with(|| PreparedStatement::untracked(name.clone()))
                        .set_described(Some(row));
                    self.response = Some(Response::PreparedStatement(name));
                }
                _ => self.row_template = Some(Row::new(body)),
            },
            DataRow::MSGTYPE => match &self.row_template {
                Some(template) => {
                    self.response = Some(Response::Row(template.inner_clone(body)));
                }
                None => return Err(ProtocolError::unexpected_phase(msgtype, "no row flow").into()),
            },
            CommandComplete::MSGTYPE => {
                let complete = CommandComplete::decode(msgtype, body)?;
                self.response = Some(Response::Completion(Completion::new(complete.tag)));
            }
            EmptyQueryResponse::MSGTYPE => {
                self.response = Some(Response::Completion(Completion::empty_query()));
            }
            ParseComplete::MSGTYPE => match self.requests.front() {
                Some(Request::Prepare { name, positional, names, preparsed }) => {
                    let name = name.clone();
                    let entry = match preparsed {
                        true => PreparedStatement::preparsed(name.clone(), *positional, names.clone()),
                        false => PreparedStatement::untracked(name.clone()),
                    };
                    self.statements.insert(name.clone(), entry);
                    self.response = Some(Response::PreparedStatement(name));
                }
                _ => return Err(ProtocolError::unexpected_phase(msgtype, "no prepare flow").into()),
            },
            ParameterDescription::MSGTYPE => match self.requests.front() {
                Some(Request::Describe { name }) => {
                    let name = name.clone();
                    let description = ParameterDescription::decode(msgtype, body)?;
                    let mut oids = Vec::with_capacity(description.param_len as usize);
                    let mut raw = description.oids;
                    for _ in 0..description.param_len {
                        oids.push(raw.get_u32());
                    }
                    self.statements
                        .entry(name.clone())
                        .or_insert_with(|| PreparedStatement::untracked(name))
                        .set_parameter_oids(oids);
                }
                _ => return Err(ProtocolError::unexpected_phase(msgtype, "no describe flow").into()),
            },
            NoData::MSGTYPE => match self.requests.front() {
                Some(Request::Describe { name }) => {
                    let name = name.clone();
                    self.statements
                        .entry(name.clone())
                        .or_insert_with(|| PreparedStatement::untracked(name.clone()))
                        .set_described(None);
                    self.response = Some(Response::PreparedStatement(name));
                }
                _ => self.row_template = None,
            },
            BindComplete::MSGTYPE => {}
            CloseComplete::MSGTYPE => match self.requests.front() {
                Some(Request::Unprepare { name }) => {
                    let name = name.clone();
                    self.statements.remove(&name);
                    self.response = Some(Response::Completion(Completion::unprepare()));
                }
                _ => return Err(ProtocolError::unexpected_phase(msgtype, "no unprepare flow").into()),
            },
            PortalSuspended::MSGTYPE
            | CopyInResponse::MSGTYPE
            | CopyOutResponse::MSGTYPE
            | CopyBothResponse::MSGTYPE
            | CopyData::MSGTYPE
            | CopyDone::MSGTYPE => {
                return Err(ProtocolError::unexpected_phase(msgtype, "query cycle").into());
            }
            _ => return Err(ProtocolError::unknown(msgtype).into()),
        }

        Ok(())
    }

    fn poll_response(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            if let Err(err) = self.drain_buffered() {
                self.fail();
                return Poll::Ready(Err(err));
            }
            if self.response.is_some() || self.requests.is_empty() {
                return Poll::Ready(Ok(()));
            }
            if let Err(err) = ready!(self.poll_flush(cx)) {
                self.fail();
                return Poll::Ready(Err(err.into()));
            }
            if let Err(err) = ready!(self.poll_fill(cx)) {
                self.fail();
                return Poll::Ready(Err(err.into()));
            }
        }
    }

    /// Queue everything the server has sent so far without waiting.
    ///
    /// Possibly makes [`is_server_message_available`][Connection::is_server_message_available].
    pub fn collect_server_messages(&mut self) -> Result<()> {
        self.ensure_connected()?;
        match self.try_pump() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    fn try_pump(&mut self) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };

        while !self.write_buf.is_empty() {
            match socket.try_write(&self.write_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        let mut eof = false;
        loop {
            self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            match socket.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        // route what arrived before reporting a lost peer
        self.drain_buffered()?;
        match eof {
            true => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            false => Ok(()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.is_connected() {
            true => Ok(()),
            false => Err(Error::invalid_argument("connection is not established")),
        }
    }
}

// ===== Signals =====

impl Connection {
    /// Returns `true` when a notice or a notification is queued.
    pub fn is_signal_available(&self) -> bool {
        !self.notices.is_empty() || !self.notifications.is_empty()
    }

    /// Returns the queued notice at the head, keeping it queued.
    pub fn notice(&self) -> Option<&Notice> {
        self.notices.front()
    }

    /// Take the queued notice at the head.
    pub fn pop_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    /// Drop the queued notice at the head.
    pub fn dismiss_notice(&mut self) {
        self.notices.pop_front();
    }

    /// Returns the queued notification at the head, keeping it queued.
    pub fn notification(&self) -> Option<&Notification> {
        self.notifications.front()
    }

    /// Take the queued notification at the head.
    pub fn pop_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Drop the queued notification at the head.
    pub fn dismiss_notification(&mut self) {
        self.notifications.pop_front();
    }

    /// Replace the notice handler.
    ///
    /// The default handler writes a one line summary to the diagnostic
    /// sink and never fails.
    pub fn set_notice_handler(&mut self, handler: NoticeHandler) {
        self.notice_handler = Some(handler);
    }

    /// Set the notification handler, unset by default.
    pub fn set_notification_handler(&mut self, handler: NotificationHandler) {
        self.notification_handler = Some(handler);
    }

    /// Run the signal handlers over the queued signals.
    ///
    /// Notices always drain, through the set handler or the default one.
    /// Notifications drain only when a handler is set, otherwise they stay
    /// queued for [`pop_notification`][Connection::pop_notification].
    ///
    /// The blocking waits call this on every pass.
    pub fn handle_signals(&mut self) {
        while let Some(notice) = self.notices.pop_front() {
            match &mut self.notice_handler {
                Some(handler) => handler(notice),
                None => signal::default_notice_handler(&notice),
            }
        }
        if let Some(handler) = &mut self.notification_handler {
            while let Some(notification) = self.notifications.pop_front() {
                handler(notification);
            }
        }
    }
}

// ===== Responses =====

impl Connection {
    /// Returns `true` while a submitted request has responses left.
    pub fn is_awaiting_response(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Returns `true` when a response is visible.
    pub fn is_response_available(&self) -> bool {
        self.response.is_some()
    }

    /// Returns `(is_signal_available() || is_response_available())`.
    pub fn is_server_message_available(&self) -> bool {
        self.is_signal_available() || self.is_response_available()
    }

    /// Drop the visible response, making room for the next one.
    pub fn dismiss_response(&mut self) {
        self.response = None;
    }

    /// Returns the visible server error, if any.
    pub fn error(&self) -> Option<&ServerError> {
        match &self.response {
            Some(Response::Error(err)) => Some(err),
            _ => None,
        }
    }

    /// Take the visible server error, if any.
    pub fn release_error(&mut self) -> Option<ServerError> {
        match self.response.take() {
            Some(Response::Error(err)) => Some(err),
            other => {
                self.response = other;
                None
            }
        }
    }

    /// Returns the visible row, if any.
    ///
    /// Exactly one row is visible at a time: the next row of the stream
    /// arrives after this one is released or dismissed.
    pub fn row(&self) -> Option<&Row> {
        match &self.response {
            Some(Response::Row(row)) => Some(row),
            _ => None,
        }
    }

    /// Take the visible row, if any.
    pub fn release_row(&mut self) -> Option<Row> {
        match self.response.take() {
            Some(Response::Row(row)) => Some(row),
            other => {
                self.response = other;
                None
            }
        }
    }

    /// Returns the visible completion, if any.
    pub fn completion(&self) -> Option<&Completion> {
        match &self.response {
            Some(Response::Completion(completion)) => Some(completion),
            _ => None,
        }
    }

    /// Take the visible completion, if any.
    pub fn release_completion(&mut self) -> Option<Completion> {
        match self.response.take() {
            Some(Response::Completion(completion)) => Some(completion),
            other => {
                self.response = other;
                None
            }
        }
    }

    /// Returns the prepared statement produced by the current request,
    /// if any.
    pub fn prepared_statement(&self) -> Option<&PreparedStatement> {
        match &self.response {
            Some(Response::PreparedStatement(name)) => self.statements.get(name.as_str()),
            _ => None,
        }
    }

    /// Returns the registry entry of the prepared statement `name`.
    ///
    /// Unknown names include statements prepared through the SQL `PREPARE`
    /// command that were never described on this connection.
    pub fn find_prepared_statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.get(name)
    }

    /// Wait until a response is visible or the request queue drains,
    /// up to `timeout` ([`None`] is eternity).
    ///
    /// Signals retrieved along the way are handled by
    /// [`handle_signals`][Connection::handle_signals]. Reaching the
    /// deadline alters no protocol state, the wait can be retried.
    pub async fn wait_response(&mut self, timeout: Option<Duration>) -> Result<()> {
        if !self.is_awaiting_response() {
            return Ok(());
        }
        self.ensure_connected()?;
        let result = timed(timeout, std::future::poll_fn(|cx| self.poll_response(cx))).await;
        self.handle_signals();
        match result {
            Ok(result) => result,
            Err(TimedOut) => Err(TimedOut.into()),
        }
    }

    /// Like [`wait_response`][Connection::wait_response], but a visible
    /// server error is taken and returned as [`Err`].
    pub async fn wait_response_throw(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.wait_response(timeout).await?;
        self.throw_if_error()
    }

    /// Wait until a completion or an error is visible, dismissing
    /// everything else along the way.
    pub async fn wait_last_response(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
            self.wait_response(remaining).await?;
            match &self.response {
                Some(Response::Completion(_) | Response::Error(_)) => return Ok(()),
                Some(_) => self.dismiss_response(),
                None if !self.is_awaiting_response() => return Ok(()),
                None => {}
            }
        }
    }

    /// Like [`wait_last_response`][Connection::wait_last_response], but a
    /// visible server error is taken and returned as [`Err`].
    pub async fn wait_last_response_throw(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.wait_last_response(timeout).await?;
        self.throw_if_error()
    }

    fn throw_if_error(&mut self) -> Result<()> {
        match self.response.take() {
            Some(Response::Error(err)) => Err(err.into()),
            other => {
                self.response = other;
                Ok(())
            }
        }
    }
}

// ===== Requests =====

impl Connection {
    /// Returns `true` when a request can be submitted without queueing
    /// behind anything: connected, no request in flight, no response
    /// visible.
    pub fn is_ready_for_async_request(&self) -> bool {
        self.is_connected() && self.requests.is_empty() && self.response.is_none()
    }

    /// Returns `true` when a request can be submitted at all. Blocking
    /// callers may stack requests, the waits drain them in order.
    pub fn is_ready_for_request(&self) -> bool {
        self.is_connected()
    }

    fn ensure_async_ready(&self) -> Result<()> {
        self.ensure_connected()?;
        match self.requests.is_empty() && self.response.is_none() {
            true => Ok(()),
            false => Err(Error::invalid_argument(
                "a request is in flight, drain its responses first",
            )),
        }
    }

    /// Submit one or more `;`-separated queries through the simple query
    /// protocol.
    ///
    /// The queries run in a single transaction unless the string itself
    /// says otherwise; each produces its own flow of rows and completion.
    pub fn perform_async(&mut self, queries: &str) -> Result<()> {
        self.ensure_async_ready()?;
        self.send(frontend::Query { sql: queries });
        self.requests.push_back(Request::Perform);
        Ok(())
    }

    /// Submit queries and wait for the first response.
    pub async fn perform(&mut self, queries: &str) -> Result<()> {
        self.ensure_connected()?;
        self.send(frontend::Query { sql: queries });
        self.requests.push_back(Request::Perform);
        self.wait_response_throw(None).await
    }

    /// Submit a request to prepare `statement` under `name`.
    ///
    /// The statement is rendered with
    /// [`to_query_string`][Statement::to_query_string]; named parameters
    /// become positional on the wire. Positional gaps are rejected here:
    /// the server would fail the `Parse` anyway.
    pub fn prepare_statement_async(&mut self, statement: &Statement, name: &str) -> Result<()> {
        self.ensure_async_ready()?;
        self.submit_prepare(statement, name)
    }

    fn submit_prepare(&mut self, statement: &Statement, name: &str) -> Result<()> {
        if let Some(index) = (0..statement.positional_parameter_count())
            .find(|i| statement.is_parameter_missing(*i))
        {
            return Err(Error::missing_parameter(index));
        }
        let sql = statement.to_query_string();
        self.send(frontend::Parse { prepare_name: name, sql: &sql, oids: &[] });
        self.send(frontend::Sync);

        let positional = statement.positional_parameter_count();
        let names = (0..statement.named_parameter_count())
            .map(|i| statement.parameter_name(positional + i).to_string())
            .collect();
        self.requests.push_back(Request::Prepare {
            name: name.to_string(),
            positional,
            names,
            preparsed: true,
        });
        Ok(())
    }

    /// Prepare `statement` under `name` and wait for the server to
    /// acknowledge it.
    pub async fn prepare_statement(
        &mut self,
        statement: &Statement,
        name: &str,
    ) -> Result<&PreparedStatement> {
        self.ensure_connected()?;
        self.submit_prepare(statement, name)?;
        self.finish_statement_request(name).await
    }

    /// Submit a request to prepare the SQL text `statement` as-is, with no
    /// preparsing: only `$N` parameters are meaningful in it.
    pub fn prepare_raw_async(&mut self, statement: &str, name: &str) -> Result<()> {
        self.ensure_async_ready()?;
        self.submit_prepare_raw(statement, name);
        Ok(())
    }

    fn submit_prepare_raw(&mut self, statement: &str, name: &str) {
        self.send(frontend::Parse { prepare_name: name, sql: statement, oids: &[] });
        self.send(frontend::Sync);
        self.requests.push_back(Request::Prepare {
            name: name.to_string(),
            positional: 0,
            names: Vec::new(),
            preparsed: false,
        });
    }

    /// Prepare the SQL text `statement` as-is under `name` and wait for
    /// the server to acknowledge it.
    pub async fn prepare_raw(&mut self, statement: &str, name: &str) -> Result<&PreparedStatement> {
        self.ensure_connected()?;
        self.submit_prepare_raw(statement, name);
        self.finish_statement_request(name).await
    }

    /// Submit a request to describe the prepared statement `name`:
    /// parameter types and row description.
    pub fn describe_statement_async(&mut self, name: &str) -> Result<()> {
        self.ensure_async_ready()?;
        self.submit_describe(name);
        Ok(())
    }

    fn submit_describe(&mut self, name: &str) {
        self.send(frontend::Describe { kind: b'S', name });
        self.send(frontend::Sync);
        self.requests.push_back(Request::Describe { name: name.to_string() });
    }

    /// Describe the prepared statement `name` and wait for the result.
    pub async fn describe_statement(&mut self, name: &str) -> Result<&PreparedStatement> {
        self.ensure_connected()?;
        self.submit_describe(name);
        self.finish_statement_request(name).await
    }

    /// Submit a request to execute the prepared statement `name` with
    /// `params`.
    ///
    /// Every parameter slot must be bound, and the slot count must match
    /// what the statement expects.
    pub fn execute_statement_async(&mut self, name: &str, params: &Params) -> Result<()> {
        self.ensure_async_ready()?;
        self.submit_execute(name, params)
    }

    fn submit_execute(&mut self, name: &str, params: &Params) -> Result<()> {
        let Some(statement) = self.statements.get(name) else {
            return Err(Error::invalid_argument(
                "unknown prepared statement, prepare or describe it first",
            ));
        };
        if params.len() != statement.parameter_count() {
            return Err(Error::invalid_argument(
                "parameter slot count does not match the statement",
            ));
        }
        let values = match params.values() {
            Ok(values) => values,
            Err(index) => return Err(Error::missing_parameter(index)),
        };

        self.send(frontend::Bind {
            portal_name: "",
            stmt_name: name,
            params: &values,
            result_format: self.result_format,
        });
        self.send(frontend::Describe { kind: b'P', name: "" });
        self.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.send(frontend::Sync);
        self.requests.push_back(Request::Execute);
        Ok(())
    }

    /// Execute the prepared statement `name` and wait for the first
    /// response: a row, a completion, or an error.
    pub async fn execute_statement(&mut self, name: &str, params: &Params) -> Result<()> {
        self.ensure_connected()?;
        self.submit_execute(name, params)?;
        self.wait_response_throw(None).await
    }

    /// Prepare the unnamed statement from `statement`, execute it with
    /// `params`, and wait for the first response.
    pub async fn execute(&mut self, statement: &Statement, params: &Params) -> Result<()> {
        self.prepare_statement(statement, "").await?;
        self.execute_statement("", params).await
    }

    /// Submit a request to close the prepared statement `name`.
    ///
    /// The unnamed statement cannot be unprepared.
    pub fn unprepare_statement_async(&mut self, name: &str) -> Result<()> {
        self.ensure_async_ready()?;
        self.submit_unprepare(name)
    }

    fn submit_unprepare(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("the unnamed statement cannot be unprepared"));
        }
        self.send(frontend::Close { variant: b'S', name });
        self.send(frontend::Sync);
        self.requests.push_back(Request::Unprepare { name: name.to_string() });
        Ok(())
    }

    /// Close the prepared statement `name` and wait until it is gone.
    pub async fn unprepare_statement(&mut self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        self.submit_unprepare(name)?;
        self.wait_response_throw(None).await?;
        self.finish_request().await
    }

    /// Wait for the single response of a prepare/describe request, then
    /// drain the trailing `ReadyForQuery` so the connection is ready
    /// again.
    async fn finish_statement_request(&mut self, name: &str) -> Result<&PreparedStatement> {
        self.wait_response_throw(None).await?;
        self.finish_request().await?;
        // routed above; a vanished entry would be a logic error here
        self.statements
            .get(name)
            .ok_or_else(|| Error::invalid_argument("prepared statement is not known"))
    }

    async fn finish_request(&mut self) -> Result<()> {
        self.dismiss_response();
        while self.is_awaiting_response() && self.response.is_none() {
            self.wait_response_throw(None).await?;
        }
        Ok(())
    }
}

// ===== Utilities =====

impl Connection {
    /// Wait for each row of the current request in turn, then stop at the
    /// completion, which stays visible.
    pub async fn for_each(&mut self, mut body: impl FnMut(Row)) -> Result<()> {
        loop {
            self.wait_response_throw(None).await?;
            if let Some(row) = self.release_row() {
                body(row);
                continue;
            }
            if self.completion().is_some() {
                return Ok(());
            }
            if !self.is_awaiting_response() && self.response.is_none() {
                return Ok(());
            }
            self.dismiss_response();
        }
    }

    /// Wait for the completion of the current statement, dismissing its
    /// remaining rows, and drain the request when it has nothing further.
    pub async fn complete(&mut self) -> Result<Completion> {
        self.wait_last_response_throw(None).await?;
        let completion = self
            .release_completion()
            .ok_or_else(|| Error::invalid_argument("no completion to wait for"))?;
        while self.is_awaiting_response() && self.response.is_none() {
            self.wait_response_throw(None).await?;
        }
        Ok(completion)
    }

    /// The rows of the current request as a [`Stream`][futures_core::Stream].
    ///
    /// The stream ends right before the completion, which stays visible
    /// for [`complete`][Connection::complete].
    pub fn rows(&mut self) -> Rows<'_> {
        Rows { conn: self }
    }

    /// Quote `literal` to be used as a string literal in SQL text.
    ///
    /// The quoting depends on negotiated session parameters, so the
    /// session must be up. Prefer binding parameters over splicing quoted
    /// data into queries.
    pub fn to_quoted_literal(&self, literal: &str) -> Result<String> {
        self.ensure_connected()?;
        let standard_conforming = self
            .server_parameter("standard_conforming_strings")
            .map(|value| value == "on")
            .unwrap_or(true);
        let escape_backslash = !standard_conforming && literal.contains('\\');

        let mut out = String::with_capacity(literal.len() + 3);
        if escape_backslash {
            out.push('E');
        }
        out.push('\'');
        for c in literal.chars() {
            match c {
                '\'' => out.push_str("''"),
                '\\' if !standard_conforming => out.push_str("\\\\"),
                _ => out.push(c),
            }
        }
        out.push('\'');
        Ok(out)
    }

    /// Quote `identifier` to be used as an identifier in SQL text.
    pub fn to_quoted_identifier(&self, identifier: &str) -> Result<String> {
        self.ensure_connected()?;
        let mut out = String::with_capacity(identifier.len() + 2);
        out.push('"');
        for c in identifier.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        Ok(out)
    }

    /// Render binary data in the bytea hex format, `\x` followed by hex
    /// digits.
    pub fn to_hex_string(&self, data: &Data) -> Result<String> {
        self.ensure_connected()?;
        if data.format() != PgFormat::Binary {
            return Err(Error::invalid_argument("hex encoding takes binary data"));
        }
        Ok(crate::encode::to_hex(data.bytes()))
    }

    /// Like [`to_hex_string`][Connection::to_hex_string], carried as text
    /// [`Data`].
    pub fn to_hex_data(&self, data: &Data) -> Result<Data> {
        Ok(Data::text(self.to_hex_string(data)?))
    }
}

/// Row stream of the current request, see [`Connection::rows`].
pub struct Rows<'c> {
    conn: &'c mut Connection,
}

impl futures_core::Stream for Rows<'_> {
    type Item = Result<Row>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let conn = &mut *self.get_mut().conn;
        loop {
            if let Some(row) = conn.release_row() {
                return Poll::Ready(Some(Ok(row)));
            }
            if let Some(err) = conn.release_error() {
                return Poll::Ready(Some(Err(err.into())));
            }
            if conn.completion().is_some() || !conn.is_awaiting_response() {
                return Poll::Ready(None);
            }
            if conn.prepared_statement().is_some() {
                conn.dismiss_response();
            }
            if let Err(err) = ready!(conn.poll_response(cx)) {
                return Poll::Ready(Some(Err(err)));
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status)
            .field("socket", &self.socket)
            .field("requests", &self.requests.len())
            .field("response", &self.response)
            .field("statements", &self.statements.len())
            .field("notices", &self.notices.len())
            .field("notifications", &self.notifications.len())
            .field("tx_status", &self.tx_status)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn completion_tag_parsing() {
        let completion = Completion::new(ByteStr::from_static("INSERT 0 5"));
        assert_eq!(completion.operation_name(), "INSERT");
        assert_eq!(completion.rows_affected(), Some(5));

        let completion = Completion::new(ByteStr::from_static("CREATE TABLE"));
        assert_eq!(completion.operation_name(), "CREATE TABLE");
        assert_eq!(completion.rows_affected(), None);

        let completion = Completion::empty_query();
        assert_eq!(completion.tag(), "");
        assert_eq!(completion.rows_affected(), None);
    }

    #[test]
    fn take_message_framing() {
        let mut buf = BytesMut::new();
        frontend::write(frontend::Query { sql: "SELECT 1" }, &mut buf);

        // incomplete header
        let mut partial = BytesMut::from(&buf[..3]);
        assert!(take_message(&mut partial).is_none());

        // incomplete body
        let mut partial = BytesMut::from(&buf[..7]);
        assert!(take_message(&mut partial).is_none());

        let (msgtype, body) = take_message(&mut buf).unwrap();
        assert_eq!(msgtype, b'Q');
        assert_eq!(&body[..], b"SELECT 1\0");
        assert!(buf.is_empty());
    }

    #[test]
    fn new_connection_is_disconnected() {
        let conn = Connection::new(Config::default());
        assert_eq!(conn.communication_status(), CommunicationStatus::Disconnected);
        assert!(!conn.is_connected());
        assert!(!conn.is_ready_for_request());
        assert!(!conn.is_ready_for_async_request());
        assert!(!conn.is_awaiting_response());
        assert!(conn.session_start_time().is_none());
        assert!(conn.server_pid().is_none());
    }

    #[test]
    fn requests_rejected_while_disconnected() {
        let mut conn = Connection::new(Config::default());
        assert!(conn.perform_async("SELECT 1").is_err());
        assert!(conn.describe_statement_async("x").is_err());
        assert!(conn.unprepare_statement_async("x").is_err());
        assert!(conn.to_quoted_literal("x").is_err());
        assert!(conn.collect_server_messages().is_err());
    }
}
