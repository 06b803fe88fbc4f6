//! High-level client API.

use crate::connection::{self, Connection, Stats, Status};
use crate::error::ClientError;
use crate::options::{Options, ServerAddr, SubscribeOptions};
use courier_protocol::{Message, ServerInfo};
use std::sync::Arc;
use std::time::Duration;

/// High-level client for a courier server pool.
///
/// Cheap to clone; clones share the same connection. Construct with
/// [`Client::new`] and call [`Client::connect`] before publishing.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration (not yet connected).
    pub fn new(options: Options) -> Self {
        Self {
            conn: Arc::new(Connection::new(options)),
        }
    }

    /// Connects to the first reachable configured endpoint and completes the
    /// handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Publishes `payload` to `subject`.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.conn.publish(subject, None, payload).await
    }

    /// Publishes `payload` to `subject` with a reply subject attached.
    pub async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.conn.publish(subject, Some(reply), payload).await
    }

    /// Subscribes `handler` to `subject`. Every delivery receives the same
    /// fixed-shape [`Message`] value; per-subscription delivery order follows
    /// arrival order. Returns the subscription id.
    pub async fn subscribe<F>(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<u64, ClientError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.conn.subscribe(subject, options, Box::new(handler)).await
    }

    /// Removes a subscription, or caps it at `max` total deliveries when the
    /// cap has not been reached yet.
    pub async fn unsubscribe(&self, sid: u64, max: Option<u64>) -> Result<(), ClientError> {
        self.conn.unsubscribe(sid, max).await
    }

    /// Publishes a request and waits for the single reply on a unique inbox.
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Message, ClientError> {
        let timeout = timeout.unwrap_or(self.conn.options().request_timeout);
        self.conn.request(subject, payload, timeout).await
    }

    /// Round trip to the server, bounding the wait by `timeout` (defaults to
    /// the configured request timeout).
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let timeout = timeout.unwrap_or(self.conn.options().request_timeout);
        self.conn.flush(timeout).await
    }

    /// Closes the connection. Terminal; a closed client cannot reconnect.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns a unique subject usable as a disposable reply-to address.
    pub fn new_inbox(&self) -> String {
        connection::new_inbox()
    }

    pub fn status(&self) -> Status {
        self.conn.status()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Message and byte counters for observability.
    pub fn stats(&self) -> Stats {
        self.conn.stats()
    }

    /// The most recent fatal error, retained until the next connect attempt.
    pub fn last_error(&self) -> Option<Arc<ClientError>> {
        self.conn.last_error()
    }

    /// The INFO body of the current server, if connected.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.conn.server_info()
    }

    /// Address of the current endpoint.
    pub fn connected_server(&self) -> Option<ServerAddr> {
        self.conn.connected_server()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    const INFO_LINE: &[u8] = b"INFO {\"server_id\":\"mock\",\"max_payload\":1048576}\r\n";

    struct MockConn {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl MockConn {
        async fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn serve_handshake(&mut self) {
            self.send(INFO_LINE).await;
            let connect = self.read_line().await;
            assert!(connect.starts_with("CONNECT {"));
            assert_eq!(self.read_line().await, "PING\r\n");
            self.send(b"PONG\r\n").await;
        }
    }

    async fn accept(listener: &TcpListener) -> MockConn {
        let (sock, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = sock.into_split();
        MockConn {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("courier://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn test_client(url: &str) -> Client {
        Client::new(
            Options::new()
                .with_servers(&[url])
                .with_dont_randomize_servers(true)
                .with_reconnect(false)
                .with_ping_interval(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_client_creation() {
        let client = test_client("courier://127.0.0.1:4222");
        assert!(!client.is_connected());
        assert_eq!(client.status(), Status::Disconnected);
        assert_eq!(client.stats(), Stats::default());
    }

    #[test]
    fn test_new_inbox_unique() {
        let client = test_client("courier://127.0.0.1:4222");
        let a = client.new_inbox();
        let b = client.new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert!(b.starts_with("_INBOX."));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_publish_request_wire_format() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            conn.serve_handshake().await;
            let header = conn.read_line().await;
            let payload = conn.read_line().await;
            (header, payload)
        });

        let client = test_client(&url);
        assert_ok!(client.connect().await);
        assert_ok!(client.publish_request("help", "_INBOX.reply", b"hi").await);

        let (header, payload) = server.await.unwrap();
        assert_eq!(header, "PUB help _INBOX.reply 2\r\n");
        assert_eq!(payload, "hi\r\n");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_with_queue_group() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            conn.serve_handshake().await;
            conn.read_line().await
        });

        let client = test_client(&url);
        client.connect().await.unwrap();
        let sid = client
            .subscribe("jobs", SubscribeOptions::new().with_queue("workers"), |_| {})
            .await
            .unwrap();

        let sub_line = server.await.unwrap();
        assert_eq!(sub_line, format!("SUB jobs workers {sid}\r\n"));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            conn.serve_handshake().await;

            let sub = conn.read_line().await;
            let parts: Vec<&str> = sub.split_whitespace().collect();
            assert_eq!(parts[0], "SUB");
            let inbox = parts[1].to_string();
            let sid = parts[2].to_string();

            let unsub = conn.read_line().await;
            assert_eq!(unsub, format!("UNSUB {sid} 1\r\n"));

            let pub_header = conn.read_line().await;
            assert_eq!(pub_header, format!("PUB help {inbox} 4\r\n"));
            let payload = conn.read_line().await;
            assert_eq!(payload, "ping\r\n");

            let reply = format!("MSG {inbox} {sid} 4\r\npong\r\n");
            conn.send(reply.as_bytes()).await;
            conn
        });

        let client = test_client(&url);
        client.connect().await.unwrap();

        let reply = client
            .request("help", b"ping", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"pong");
        assert!(reply.subject.starts_with("_INBOX."));

        let _mock = server.await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_removes_ephemeral_subscription() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            conn.serve_handshake().await;
            let _sub = conn.read_line().await;
            let _unsub_max = conn.read_line().await;
            let _pub_header = conn.read_line().await;
            let _payload = conn.read_line().await;
            // never reply; the client should clean up with a bare UNSUB
            let cleanup = conn.read_line().await;
            cleanup
        });

        let client = test_client(&url);
        client.connect().await.unwrap();

        let started = std::time::Instant::now();
        let result = client
            .request("help", b"ping", Some(Duration::from_millis(200)))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let cleanup = server.await.unwrap();
        assert!(cleanup.starts_with("UNSUB "));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_receives_fixed_shape_message() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            conn.serve_handshake().await;
            let _sub = conn.read_line().await;
            conn.send(b"MSG telemetry 1 _INBOX.from 5\r\n").await;
            // header form with a reply subject; payload in a second write
            conn.send(b"hello\r\n").await;
            conn
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let client = test_client(&url);
        client.connect().await.unwrap();
        client
            .subscribe("telemetry", SubscribeOptions::new(), move |msg| {
                sink.lock().unwrap().push(msg);
            })
            .await
            .unwrap();

        let _mock = server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].subject, "telemetry");
        assert_eq!(seen[0].reply.as_deref(), Some("_INBOX.from"));
        assert_eq!(&seen[0].payload[..], b"hello");
        assert!(seen[0].headers.is_none());

        client.close().await.unwrap();
    }
}
