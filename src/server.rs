//! Serving side: a UDP listener fanning datagrams out to per-peer
//! sessions.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use log::debug;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::params::Params;
use crate::registry::Table;
use crate::request::Request;
use crate::response::Response;
use crate::session::{Handler, Observer, Session};
use crate::transport::SharedUdp;

/// A CoAP server. Sessions are created on the first datagram from a
/// peer and reclaimed once idle past the configured horizon.
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    sessions: Arc<Table<Session>>,
    handler: Option<Arc<dyn Handler>>,
    observer: Option<Arc<dyn Observer>>,
    params: Params,
    enable_cache: bool,
    cancel: CancellationToken,
}

impl Server {
    /// Binds the listening socket. Set a handler before calling
    /// [`Server::serve`].
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Server> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Server {
            socket: Arc::new(socket),
            local_addr,
            sessions: Arc::new(Table::new()),
            handler: None,
            observer: None,
            params: Params::default(),
            enable_cache: false,
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_handler(&mut self, handler: impl Handler) {
        self.handler = Some(Arc::new(handler));
    }

    pub fn set_observer(&mut self, observer: impl Observer) {
        self.observer = Some(Arc::new(observer));
    }

    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Enables the response cache for requests this server initiates.
    pub fn set_cache(&mut self, enabled: bool) {
        self.enable_cache = enabled;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives datagrams until shut down, dispatching each to its
    /// peer's session.
    pub async fn serve(&self) -> Result<()> {
        let mut buf = BytesMut::zeroed(1500);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, peer)) => {
                            self.session(peer).recv_datagram(buf[..n].to_vec());
                        }
                        Err(e) => {
                            debug!("listener recv: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Sends a request to a peer this server already has a session
    /// with. The URL's authority selects the session.
    pub async fn send_request(&self, req: &Request) -> Result<Response> {
        let authority = req
            .authority()
            .ok_or_else(|| Error::InvalidUrl("request has no url".to_string()))?;
        let peer = tokio::net::lookup_host(authority.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::InvalidUrl(format!("no address for {}", authority)))?;
        let session = self
            .sessions
            .get(&peer.to_string())
            .ok_or(Error::SessionNotFound(peer))?;
        session.send_request(req).await
    }

    /// Stops the serve loop and closes every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.drain();
    }

    fn session(&self, peer: SocketAddr) -> Session {
        self.sessions.get_or_insert_with(&peer.to_string(), || {
            Session::new(
                Arc::new(SharedUdp::new(self.socket.clone(), peer)),
                self.handler.clone(),
                self.observer.clone(),
                self.local_addr,
                peer,
                "coap",
                self.enable_cache,
                self.params.clone(),
            )
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds a listener and serves requests with the handler; the CoAP
/// equivalent of the classic HTTP one-liner.
pub async fn listen_and_serve<A: ToSocketAddrs>(addr: A, handler: impl Handler) -> Result<()> {
    let mut server = Server::bind(addr).await?;
    server.set_handler(handler);
    server.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::message::Code;
    use crate::session::ResponseWriter;
    use std::io::Write;

    async fn spawn_echo_server() -> (SocketAddr, Arc<Server>) {
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        server.set_handler(|w: &mut ResponseWriter, req: &Request| {
            let _ = w.write_all(&req.payload);
        });
        let server = Arc::new(server);
        let addr = server.local_addr();
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.serve().await;
        });
        (addr, server)
    }

    fn quiet_client() -> Client {
        let mut client = Client::new();
        client.set_cache(false);
        client
    }

    #[tokio::test]
    async fn echo_over_udp() {
        let (addr, _server) = spawn_echo_server().await;
        let url = format!("coap://{}/echo", addr);

        let conn = quiet_client().dial(&url).await.unwrap();
        let mut req = Request::new(true, Code::POST, &url, b"test-echo".to_vec()).unwrap();
        req.token = Some(vec![0x51, 0x55, 0x77, 0xe8]);
        let resp = conn.send_request(&req).await.unwrap();
        assert_eq!(resp.status, Code::CONTENT);
        assert_eq!(resp.payload, b"test-echo");
        assert_eq!(resp.token, vec![0x51, 0x55, 0x77, 0xe8]);
    }

    #[tokio::test]
    async fn non_confirmable_echo_over_udp() {
        let (addr, _server) = spawn_echo_server().await;
        let url = format!("coap://{}/echo", addr);

        let conn = quiet_client().dial(&url).await.unwrap();
        let req = Request::new(false, Code::POST, &url, b"best effort".to_vec()).unwrap();
        let resp = conn.send_request(&req).await.unwrap();
        assert!(!resp.ack);
        assert_eq!(resp.payload, b"best effort");
    }

    #[tokio::test]
    async fn one_shot_client_request() {
        let (addr, _server) = spawn_echo_server().await;
        let url = format!("coap://{}/once", addr);
        let req = Request::new(true, Code::PUT, &url, b"fire".to_vec()).unwrap();
        let resp = quiet_client().send_request(&req).await.unwrap();
        assert_eq!(resp.payload, b"fire");
    }

    #[tokio::test]
    async fn conn_rejects_foreign_authority() {
        let (addr, _server) = spawn_echo_server().await;
        let conn = quiet_client().dial(&format!("coap://{}/a", addr)).await.unwrap();

        let req = Request::new(true, Code::GET, "coap://127.0.0.1:9/a", vec![]).unwrap();
        assert!(matches!(
            conn.send_request(&req).await,
            Err(Error::HostMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn server_initiated_request_reaches_the_client() {
        let (addr, server) = spawn_echo_server().await;
        let url = format!("coap://{}/hello", addr);

        let mut client = quiet_client();
        client.set_handler(|w: &mut ResponseWriter, _req: &Request| {
            let _ = w.write_all(b"client echo");
        });
        let conn = client.dial(&url).await.unwrap();

        // Prime the server's session table.
        let req = Request::new(true, Code::GET, &url, vec![]).unwrap();
        conn.send_request(&req).await.unwrap();

        // The client bound a wildcard address; over loopback the server
        // sees it as 127.0.0.1 with the same port.
        let client_port = conn.session().local_addr().port();
        let back = Request::new(
            true,
            Code::GET,
            &format!("coap://127.0.0.1:{}/hi", client_port),
            b"hi".to_vec(),
        )
        .unwrap();
        let resp = server.send_request(&back).await.unwrap();
        assert_eq!(resp.payload, b"client echo");
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let (_addr, server) = spawn_echo_server().await;
        let req =
            Request::new(true, Code::GET, "coap://127.0.0.1:9/nobody", vec![]).unwrap();
        assert!(matches!(
            server.send_request(&req).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn block1_upload_over_udp() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        server.set_handler(move |w: &mut ResponseWriter, req: &Request| {
            *sink.lock().unwrap() = req.payload.clone();
            w.write_code(Code::CHANGED);
        });
        let server = Arc::new(server);
        let addr = server.local_addr();
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.serve().await;
        });

        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let url = format!("coap://{}/upload", addr);
        let conn = quiet_client().dial(&url).await.unwrap();
        let req = Request::new(true, Code::PUT, &url, payload.clone()).unwrap();
        let resp = conn.send_request(&req).await.unwrap();

        assert_eq!(resp.status, Code::CHANGED);
        assert_eq!(*received.lock().unwrap(), payload);
    }
}
