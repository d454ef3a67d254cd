//! Client-facing websocket surface.
//!
//! Every server listens one port above its transport port. A request to
//! `ws://host:port+1/<service>/<handler>` is one binary frame; the reply is
//! one binary frame. Failures close the connection with a code in the
//! 4000..=4999 window and the error message as reason.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_metrics::Traffic;
use canopy_network::{Message, ServerIdentity, ServerIdentityId};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_websockets::{ClientBuilder, CloseCode, ServerBuilder, WebSocketStream};

use crate::roster::Roster;
use crate::service::{ServiceManager, RESERVED_OK};
use crate::{ClientError, OverlayError};

/// Connection attempts before a client gives up.
pub const MAX_RETRY_CONNECT: usize = 5;
/// Pause between two connection attempts.
pub const WAIT_RETRY: Duration = Duration::from_millis(20);
/// Time in-flight requests get to finish when the server stops.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(100);

/// Longest close reason a control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

// ── Server ───────────────────────────────────────────────────────────────

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The websocket listener of one server.
pub struct WebSocket {
    manager: Arc<ServiceManager>,
    bind_address: String,
    grace: Duration,
    running: Mutex<Option<Running>>,
}

impl WebSocket {
    /// Listener for `si`, on all interfaces, one port above its transport.
    pub fn new(si: &ServerIdentity, manager: Arc<ServiceManager>, grace: Duration) -> Result<Self, OverlayError> {
        let bind_address = si.address.websocket_address(true)?;
        Ok(Self {
            manager,
            bind_address,
            grace,
            running: Mutex::new(None),
        })
    }

    /// Bind and start accepting. Returns the bound address; a second call
    /// returns the same address.
    pub async fn start(&self) -> Result<SocketAddr, OverlayError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| OverlayError::WebSocket(format!("bind {}: {e}", self.bind_address)))?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.manager.clone(),
            cancel.clone(),
            self.grace,
        ));
        tracing::info!("websocket listening on {local_addr}");

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(other) = running.as_ref() {
            // Lost a race with a concurrent start.
            cancel.cancel();
            return Ok(other.local_addr);
        }
        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.local_addr)
    }

    pub fn is_started(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Stop accepting, give open requests the grace period, then drop them.
    /// Stopping a server that is not running does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return;
        };
        tracing::debug!("stopping websocket on {}", running.local_addr);
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::warn!("websocket accept loop failed: {e}");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<ServiceManager>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    conns.spawn(serve_connection(stream, peer, manager.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!("websocket accept failed: {e}"),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
    drop(listener);
    let drained = tokio::time::timeout(grace, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!("dropping {} websocket connections after grace period", conns.len());
        conns.abort_all();
    }
}

/// Where a connection's requests go.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Ok,
    Service { service: String, handler: String },
    NotFound,
}

impl Route {
    fn parse(path: &str) -> Self {
        let path = path.trim_start_matches('/');
        if path.trim_end_matches('/') == RESERVED_OK {
            return Route::Ok;
        }
        match path.split_once('/') {
            Some((service, handler)) if !service.is_empty() => Route::Service {
                service: service.to_string(),
                handler: handler.to_string(),
            },
            _ => Route::NotFound,
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<ServiceManager>,
    cancel: CancellationToken,
) {
    if is_plain_ok_request(&stream).await {
        answer_plain_ok(stream).await;
        return;
    }
    let (request, mut ws) = match ServerBuilder::new().accept(stream).await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::debug!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    let path = request.uri().path().to_string();
    let mut route = Route::parse(&path);
    if let Route::Service { service, .. } = &route {
        if manager.service_by_name(service).is_none() {
            route = Route::NotFound;
        }
    }

    let (mut n, mut rx, mut tx) = (0usize, 0usize, 0usize);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws.next() => next,
        };
        let msg = match next {
            None => break,
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                close_with(&mut ws, &ClientError::new(ClientError::READ_ERROR, e.to_string())).await;
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_binary() && !msg.is_text() {
            continue;
        }
        let buf = msg.as_payload().to_vec();
        n += 1;
        rx += buf.len();

        let reply = match &route {
            Route::Service { service, handler } => {
                tracing::debug!("ws request {peer} {service}/{handler}");
                manager.process_client_request(service, handler, &buf).await
            }
            Route::Ok => Ok(b"ok\n".to_vec()),
            Route::NotFound => Err(ClientError::new(
                ClientError::PATH_NOT_FOUND,
                format!("no service at {path}"),
            )),
        };
        match reply {
            Ok(reply) => {
                tx += reply.len();
                if let Err(e) = ws.send(tokio_websockets::Message::binary(reply)).await {
                    tracing::warn!("ws reply to {peer} failed: {e}");
                    break;
                }
            }
            Err(err) => {
                tracing::debug!("ws request {peer} failed: {err}");
                close_with(&mut ws, &err).await;
                break;
            }
        }
    }
    tracing::debug!("ws close {peer} n={n} rx={rx} tx={tx}");
}

async fn close_with<S>(ws: &mut WebSocketStream<S>, err: &ClientError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let code = CloseCode::try_from(err.wire_code()).ok();
    let reason = truncate(&err.message, MAX_CLOSE_REASON);
    if let Err(e) = ws.send(tokio_websockets::Message::close(code, reason)).await {
        tracing::debug!("sending close frame failed: {e}");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A plain HTTP `GET /ok`, as sent by load balancers and curl.
async fn is_plain_ok_request(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    let n = match stream.peek(&mut buf).await {
        Ok(n) => n,
        Err(_) => return false,
    };
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    let is_ok = head.starts_with("get /ok ") || head.starts_with("get /ok/ ");
    is_ok && !head.contains("upgrade: websocket")
}

async fn answer_plain_ok(mut stream: TcpStream) {
    let mut head = [0u8; 1024];
    if let Err(e) = stream.read(&mut head).await {
        tracing::debug!("reading /ok request failed: {e}");
        return;
    }
    let response = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 3\r\nConnection: close\r\n\r\nok\n";
    if let Err(e) = stream.write_all(response).await {
        tracing::debug!("answering /ok failed: {e}");
    }
    if let Err(e) = stream.shutdown().await {
        tracing::debug!("closing /ok connection failed: {e}");
    }
}

// ── Client ───────────────────────────────────────────────────────────────

type Conn = WebSocketStream<TcpStream>;

/// Talks to one service on any number of servers.
///
/// A client made with [`Client::new_keep`] keeps each connection open for
/// the next request to the same server and path.
pub struct Client {
    service: String,
    keep: bool,
    connections: tokio::sync::Mutex<HashMap<(ServerIdentityId, String), Conn>>,
    traffic: Traffic,
}

impl Client {
    pub fn new(service: &str) -> Self {
        Self::with_keep(service, false)
    }

    pub fn new_keep(service: &str) -> Self {
        Self::with_keep(service, true)
    }

    fn with_keep(service: &str, keep: bool) -> Self {
        Self {
            service: service.to_string(),
            keep,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            traffic: Traffic::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send `buf` to `/<service>/<path>` on `dst` and wait for the reply.
    pub async fn send(&self, dst: &ServerIdentity, path: &str, buf: &[u8]) -> Result<Vec<u8>, OverlayError> {
        let mut connections = self.connections.lock().await;
        let key = (dst.id, path.to_string());
        let mut conn = match connections.remove(&key) {
            Some(conn) => conn,
            None => self.connect(dst, path).await?,
        };

        let reply = exchange(&mut conn, buf).await;
        match &reply {
            Ok(reply) => {
                self.traffic.record_tx(buf.len());
                self.traffic.record_rx(reply.len());
                if self.keep {
                    connections.insert(key, conn);
                } else {
                    close_conn(conn).await;
                }
            }
            Err(e) => tracing::debug!("request to {dst} {path} failed: {e}"),
        }
        reply
    }

    /// Typed request to the handler named after `Req`.
    pub async fn send_message<Req: Message, Resp: Message>(
        &self,
        dst: &ServerIdentity,
        req: &Req,
    ) -> Result<Resp, OverlayError> {
        let buf = canopy_network::encode(req)?;
        let reply = self.send(dst, Req::NAME, &buf).await?;
        Ok(canopy_network::decode(&reply)?)
    }

    /// Send `buf` to every member of `roster`, in order.
    ///
    /// A member that failed has `None` in the returned list; its error is
    /// part of the joined error.
    pub async fn send_to_all(
        &self,
        roster: &Roster,
        path: &str,
        buf: &[u8],
    ) -> (Vec<Option<Vec<u8>>>, Result<(), OverlayError>) {
        let mut replies = Vec::with_capacity(roster.len());
        let mut errors = Vec::new();
        for si in &roster.list {
            match self.send(si, path, buf).await {
                Ok(reply) => replies.push(Some(reply)),
                Err(e) => {
                    errors.push(format!("{si} {e}"));
                    replies.push(None);
                }
            }
        }
        let result = if errors.is_empty() {
            Ok(())
        } else {
            Err(OverlayError::WebSocket(errors.join("\n")))
        };
        (replies, result)
    }

    /// Close every kept connection.
    pub async fn close(&self) {
        let conns: Vec<Conn> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in conns {
            close_conn(conn).await;
        }
    }

    /// Number of connections currently kept open.
    pub async fn open_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub fn tx(&self) -> u64 {
        self.traffic.tx()
    }

    pub fn rx(&self) -> u64 {
        self.traffic.rx()
    }

    async fn connect(&self, dst: &ServerIdentity, path: &str) -> Result<Conn, OverlayError> {
        let addr = dst.address.websocket_address(false)?;
        let uri: http::Uri = format!("ws://{addr}/{}/{path}", self.service)
            .parse()
            .map_err(|e| OverlayError::WebSocket(format!("invalid uri for {dst}: {e}")))?;

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRY_CONNECT {
            if attempt > 0 {
                tokio::time::sleep(WAIT_RETRY).await;
            }
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            match ClientBuilder::from_uri(uri.clone()).connect_on(stream).await {
                Ok((conn, _)) => return Ok(conn),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(OverlayError::WebSocket(format!("connecting to {uri}: {last_error}")))
    }
}

/// One request frame out, one reply frame back.
async fn exchange(conn: &mut Conn, buf: &[u8]) -> Result<Vec<u8>, OverlayError> {
    conn.send(tokio_websockets::Message::binary(buf.to_vec()))
        .await
        .map_err(|e| OverlayError::WebSocket(e.to_string()))?;
    loop {
        let msg = match conn.next().await {
            None => return Err(OverlayError::WebSocket("connection closed".into())),
            Some(Err(e)) => return Err(OverlayError::WebSocket(e.to_string())),
            Some(Ok(msg)) => msg,
        };
        if let Some((code, reason)) = msg.as_close() {
            return Err(ClientError::new(u16::from(code), reason).into());
        }
        if msg.is_binary() || msg.is_text() {
            return Ok(msg.as_payload().to_vec());
        }
    }
}

async fn close_conn(mut conn: Conn) {
    if let Err(e) = conn.close().await {
        tracing::debug!("closing websocket failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes() {
        assert_eq!(Route::parse("/ok"), Route::Ok);
        assert_eq!(Route::parse("/ok/"), Route::Ok);
        assert_eq!(
            Route::parse("/Status/Request"),
            Route::Service {
                service: "Status".into(),
                handler: "Request".into()
            }
        );
        assert_eq!(
            Route::parse("/Status/"),
            Route::Service {
                service: "Status".into(),
                handler: String::new()
            }
        );
        assert_eq!(Route::parse("/Status"), Route::NotFound);
        assert_eq!(Route::parse("/"), Route::NotFound);
    }

    #[test]
    fn close_reason_fits_a_control_frame() {
        let long = "é".repeat(100);
        let cut = truncate(&long, MAX_CLOSE_REASON);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(cut));
        assert_eq!(truncate("short", MAX_CLOSE_REASON), "short");
    }
}
