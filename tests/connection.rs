//! Connection tests against a scripted in-process backend.
//!
//! The fake backend speaks just enough of the v3 protocol to run each
//! scenario: it accepts one session, answers the startup handshake, then
//! follows a per-test script.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use prequel::{
    Config, Connection, Readiness,
    sql::Statement,
};

// ===== fake backend plumbing =====

struct Backend {
    stream: TcpStream,
    buf: BytesMut,
}

impl Backend {
    /// Accept one session and complete the startup handshake.
    async fn handshake(listener: TcpListener) -> Backend {
        let (stream, _) = listener.accept().await.unwrap();
        let mut backend = Backend { stream, buf: BytesMut::new() };

        // startup message: length (including itself), then the payload
        let len = backend.stream.read_i32().await.unwrap() as usize;
        let mut startup = vec![0u8; len - 4];
        backend.stream.read_exact(&mut startup).await.unwrap();
        let protocol = (&startup[..4]).get_u32();
        assert_eq!(protocol, 196_608);

        backend.put_auth_ok();
        backend.put_parameter_status("server_version", "16.3");
        backend.put_parameter_status("standard_conforming_strings", "on");
        backend.put_backend_key(4242, 1);
        backend.put_ready(b'I');
        backend.flush().await;
        backend
    }

    /// Read one tagged frontend message, returning `(tag, body)`.
    async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    async fn flush(&mut self) {
        self.stream.write_all(&self.buf.split()).await.unwrap();
    }

    fn put(&mut self, tag: u8, body: &[u8]) {
        self.buf.put_u8(tag);
        self.buf.put_u32(4 + body.len() as u32);
        self.buf.put(body);
    }

    fn put_auth_ok(&mut self) {
        self.put(b'R', &0u32.to_be_bytes());
    }

    fn put_parameter_status(&mut self, name: &str, value: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
        self.put(b'S', &body);
    }

    fn put_backend_key(&mut self, pid: u32, secret: u32) {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        body.extend_from_slice(&secret.to_be_bytes());
        self.put(b'K', &body);
    }

    fn put_ready(&mut self, status: u8) {
        self.put(b'Z', &[status]);
    }

    fn put_parse_complete(&mut self) {
        self.put(b'1', &[]);
    }

    fn put_bind_complete(&mut self) {
        self.put(b'2', &[]);
    }

    fn put_close_complete(&mut self) {
        self.put(b'3', &[]);
    }

    fn put_no_data(&mut self) {
        self.put(b'n', &[]);
    }

    fn put_parameter_description(&mut self, oids: &[u32]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(oids.len() as u16).to_be_bytes());
        for oid in oids {
            body.extend_from_slice(&oid.to_be_bytes());
        }
        self.put(b't', &body);
    }

    fn put_row_description(&mut self, columns: &[(&str, u32)]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(columns.len() as u16).to_be_bytes());
        for (name, oid) in columns {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&0u32.to_be_bytes()); // table oid
            body.extend_from_slice(&0u16.to_be_bytes()); // attribute
            body.extend_from_slice(&oid.to_be_bytes());
            body.extend_from_slice(&4i16.to_be_bytes()); // type size
            body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
            body.extend_from_slice(&0u16.to_be_bytes()); // text format
        }
        self.put(b'T', &body);
    }

    fn put_data_row(&mut self, values: &[Option<&str>]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for value in values {
            match value {
                Some(value) => {
                    body.extend_from_slice(&(value.len() as i32).to_be_bytes());
                    body.extend_from_slice(value.as_bytes());
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        self.put(b'D', &body);
    }

    fn put_command_complete(&mut self, tag: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(tag.as_bytes());
        body.push(0);
        self.put(b'C', &body);
    }

    fn put_fields(&mut self, msgtype: u8, severity: &str, code: &str, message: &str) {
        let mut body = Vec::new();
        for (field, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
            body.push(field);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        self.put(msgtype, &body);
    }

    fn put_error(&mut self, code: &str, message: &str) {
        self.put_fields(b'E', "ERROR", code, message);
    }

    fn put_notice(&mut self, message: &str) {
        self.put_fields(b'N', "NOTICE", "00000", message);
    }

    fn put_notification(&mut self, pid: u32, channel: &str, payload: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        body.extend_from_slice(channel.as_bytes());
        body.push(0);
        body.extend_from_slice(payload.as_bytes());
        body.push(0);
        self.put(b'A', &body);
    }
}

/// Bind a listener and a client config pointing at it.
async fn setup() -> (TcpListener, Config) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = Config::default()
        .host("127.0.0.1")
        .port(port)
        .user("tester")
        .database("testdb");
    (listener, config)
}

// ===== scenarios =====

#[tokio::test]
async fn session_establishment() {
    let (listener, config) = setup().await;
    let server = tokio::spawn(Backend::handshake(listener));

    let conn = Connection::connect_with(config).await.unwrap();

    assert!(conn.is_connected());
    assert!(conn.is_ready_for_async_request());
    assert_eq!(conn.server_pid(), Some(4242));
    assert_eq!(conn.server_parameter("server_version"), Some("16.3"));
    assert!(conn.session_start_time().is_some());
    assert!(!conn.is_transaction_block_uncommitted());

    server.await.unwrap();
}

#[tokio::test]
async fn prepare_bind_execute_round() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;

        // Parse("p", "SELECT $1::int", 0 oids) + Sync
        let (tag, body) = backend.read_message().await;
        assert_eq!(tag, b'P');
        assert_eq!(&body[..2], b"p\0");
        assert!(body.windows(14).any(|w| w == b"SELECT $1::int"));
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'S');
        backend.put_parse_complete();
        backend.put_ready(b'I');
        backend.flush().await;

        // Bind + Describe('P') + Execute + Sync
        let (tag, body) = backend.read_message().await;
        assert_eq!(tag, b'B');
        assert!(body.windows(2).any(|w| w == b"42"));
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'D');
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'E');
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'S');

        backend.put_bind_complete();
        backend.put_row_description(&[("int4", 23)]);
        backend.put_data_row(&[Some("42")]);
        backend.put_command_complete("SELECT 1");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    let stmt = Statement::new("SELECT $1::int").unwrap();
    let ps = conn.prepare_statement(&stmt, "p").await.unwrap();
    assert_eq!(ps.name(), "p");
    assert!(ps.is_preparsed());
    assert_eq!(ps.parameter_count(), 1);
    let mut params = ps.params();

    assert!(conn.is_ready_for_async_request());
    params.bind(0, &42);
    conn.execute_statement("p", &params).await.unwrap();

    let row = conn.release_row().expect("one row");
    let value: String = row.try_get(0usize).unwrap();
    assert_eq!(value, "42");

    let completion = conn.complete().await.unwrap();
    assert_eq!(completion.tag(), "SELECT 1");
    assert_eq!(completion.rows_affected(), Some(1));
    assert!(conn.is_ready_for_async_request());

    server.await.unwrap();
}

#[tokio::test]
async fn simple_query_streams_rows_and_signals() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;

        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');

        backend.put_row_description(&[("id", 23), ("name", 25)]);
        backend.put_data_row(&[Some("1"), Some("ada")]);
        backend.put_notice("this one interleaves");
        backend.put_data_row(&[Some("2"), None]);
        backend.put_command_complete("SELECT 2");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notices);
    conn.set_notice_handler(Box::new(move |notice| {
        sink.lock().unwrap().push(notice.message().to_string());
    }));

    conn.perform_async("SELECT id, name FROM users").unwrap();
    assert!(conn.is_awaiting_response());

    let mut rows = Vec::new();
    conn.for_each(|row| {
        let id: i32 = row.try_get("id").unwrap();
        let name: Option<String> = row.try_get("name").unwrap();
        rows.push((id, name));
    })
    .await
    .unwrap();

    assert_eq!(rows, [(1, Some("ada".into())), (2, None)]);

    let completion = conn.complete().await.unwrap();
    assert_eq!(completion.tag(), "SELECT 2");

    assert_eq!(*notices.lock().unwrap(), vec!["this one interleaves".to_string()]);

    server.await.unwrap();
}

#[tokio::test]
async fn server_error_fills_the_response_slot() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;

        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');
        backend.put_error("42601", "syntax error at or near \"boom\"");
        backend.put_ready(b'E');
        backend.flush().await;

        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');
        backend.put_command_complete("ROLLBACK");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    conn.perform_async("boom").unwrap();
    conn.wait_response(None).await.unwrap();

    let err = conn.release_error().expect("server error");
    assert_eq!(err.code(), "42601");
    assert!(conn.is_connected(), "server errors do not fail the session");

    // drain the request, the transaction block is reported failed
    conn.wait_response(None).await.unwrap();
    assert!(!conn.is_awaiting_response());
    assert_eq!(
        conn.transaction_block_status(),
        Some(prequel::TransactionBlockStatus::Failed),
    );

    // the throwing variant surfaces the error as Err
    conn.perform_async("ROLLBACK").unwrap();
    let result = conn.wait_response_throw(None).await;
    assert!(result.is_ok());
    assert_eq!(conn.release_completion().unwrap().tag(), "ROLLBACK");

    server.await.unwrap();
}

#[tokio::test]
async fn blocking_requests_stack_in_order() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');

        backend.put_command_complete("CREATE TABLE");
        backend.put_ready(b'I');
        backend.put_command_complete("DROP TABLE");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    conn.perform_async("CREATE TABLE t (x int)").unwrap();
    assert!(!conn.is_ready_for_async_request());
    assert!(conn.is_ready_for_request(), "blocking callers may stack");

    // queues behind the first request, then waits for the earliest response
    conn.perform("DROP TABLE t").await.unwrap();
    assert_eq!(conn.release_completion().unwrap().tag(), "CREATE TABLE");

    conn.wait_response(None).await.unwrap();
    assert_eq!(conn.release_completion().unwrap().tag(), "DROP TABLE");

    conn.wait_response(None).await.unwrap();
    assert!(!conn.is_awaiting_response());
    assert!(conn.is_ready_for_async_request());

    server.await.unwrap();
}

#[tokio::test]
async fn describe_and_unprepare() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;

        // Describe('S', "q") + Sync
        let (tag, body) = backend.read_message().await;
        assert_eq!(tag, b'D');
        assert_eq!(body[0], b'S');
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'S');
        backend.put_parameter_description(&[23, 25]);
        backend.put_no_data();
        backend.put_ready(b'I');
        backend.flush().await;

        // Close('S', "q") + Sync
        let (tag, body) = backend.read_message().await;
        assert_eq!(tag, b'C');
        assert_eq!(body[0], b'S');
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'S');
        backend.put_close_complete();
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    let ps = conn.describe_statement("q").await.unwrap();
    assert!(ps.is_described());
    assert!(!ps.is_preparsed());
    assert_eq!(ps.parameter_count(), 2);
    assert_eq!(ps.parameter_oids(), Some(&[23u32, 25][..]));
    assert!(ps.row_description().is_none());

    conn.unprepare_statement("q").await.unwrap();
    assert!(conn.find_prepared_statement("q").is_none());
    assert!(conn.is_ready_for_async_request());

    // the unnamed statement cannot be unprepared, no I/O involved
    assert!(conn.unprepare_statement_async("").is_err());

    server.await.unwrap();
}

#[tokio::test]
async fn notifications_queue_until_popped() {
    let (listener, config) = setup().await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;
        backend.put_notification(7, "events", "hello");
        backend.put_notification(7, "events", "again");
        backend.flush().await;
        // stay alive until the client drained the queue
        done_rx.await.unwrap();
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    // notifications arrive outside of any request
    let ready = conn
        .wait_socket_readiness(Readiness::READABLE, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(ready.is_readable());

    conn.collect_server_messages().unwrap();
    assert!(conn.is_signal_available());

    let first = conn.pop_notification().unwrap();
    assert_eq!(first.channel(), "events");
    assert_eq!(first.payload(), "hello");
    assert_eq!(first.server_pid(), 7);

    assert_eq!(conn.notification().unwrap().payload(), "again");
    conn.dismiss_notification();
    assert!(!conn.is_signal_available());

    done_tx.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn timed_out_wait_can_be_retried() {
    let (listener, config) = setup().await;

    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');

        // hold the response back until the client timed out once
        gate.await.unwrap();
        backend.put_command_complete("SELECT 0");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    conn.perform_async("SELECT pg_sleep(10)").unwrap();

    let err = conn.wait_response(Some(Duration::from_millis(50))).await.unwrap_err();
    assert!(err.is_timed_out());
    assert!(conn.is_connected(), "a timeout alters no protocol state");
    assert!(conn.is_awaiting_response());

    release.send(()).unwrap();

    conn.wait_response(None).await.unwrap();
    assert_eq!(conn.release_completion().unwrap().tag(), "SELECT 0");

    server.await.unwrap();
}

#[tokio::test]
async fn row_backpressure_exposes_one_row_at_a_time() {
    let (listener, config) = setup().await;

    let server = tokio::spawn(async move {
        let mut backend = Backend::handshake(listener).await;
        let (tag, _) = backend.read_message().await;
        assert_eq!(tag, b'Q');

        backend.put_row_description(&[("n", 23)]);
        for n in 0..3 {
            let value = n.to_string();
            backend.put_data_row(&[Some(value.as_str())]);
        }
        backend.put_command_complete("SELECT 3");
        backend.put_ready(b'I');
        backend.flush().await;
    });

    let mut conn = Connection::connect_with(config).await.unwrap();

    conn.perform_async("SELECT n FROM generate_series(0, 2) n").unwrap();

    for expect in 0..3 {
        conn.wait_response(None).await.unwrap();
        // the next row stays invisible until this one is drained
        let row = conn.row().expect("a row is visible");
        let n: i32 = row.try_get(0usize).unwrap();
        assert_eq!(n, expect);
        assert!(conn.release_row().is_some());
    }

    conn.wait_response(None).await.unwrap();
    assert_eq!(conn.release_completion().unwrap().tag(), "SELECT 3");

    conn.wait_response(None).await.unwrap();
    assert!(!conn.is_awaiting_response());

    server.await.unwrap();
}

#[tokio::test]
async fn quoting_requires_negotiated_session() {
    let (listener, config) = setup().await;
    let server = tokio::spawn(Backend::handshake(listener));

    let mut conn = Connection::connect_with(config).await.unwrap();
    server.await.unwrap();

    assert_eq!(conn.to_quoted_literal("it's").unwrap(), "'it''s'");
    // standard_conforming_strings is on, backslashes stay literal
    assert_eq!(conn.to_quoted_literal("a\\b").unwrap(), "'a\\b'");
    assert_eq!(conn.to_quoted_identifier("we\"ird").unwrap(), "\"we\"\"ird\"");

    let data = prequel::Data::binary(&b"\x01\xff"[..]);
    assert_eq!(conn.to_hex_string(&data).unwrap(), "\\x01ff");
    let hex = conn.to_hex_data(&data).unwrap();
    assert_eq!(hex.as_str(), Some("\\x01ff"));

    // text data cannot be hex encoded
    assert!(conn.to_hex_string(&prequel::Data::text("x")).is_err());

    conn.disconnect();
    assert!(conn.to_quoted_literal("x").is_err());
}
