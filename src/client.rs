//! Dialing side: a connection to one CoAP server.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use log::debug;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::params::{Params, DEFAULT_PORT, DEFAULT_SECURE_PORT};
use crate::request::Request;
use crate::response::Response;
use crate::session::{Handler, Observer, Session};
use crate::transport::ConnectedUdp;

/// Configuration for dialing CoAP servers.
///
/// A client may itself carry a handler and an observer: over a dialed
/// connection the server can push requests and observe notifications
/// back at any time.
pub struct Client {
    params: Params,
    enable_cache: bool,
    handler: Option<Arc<dyn Handler>>,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Client {
        Client {
            params: Params::default(),
            enable_cache: true,
            handler: None,
            observer: None,
        }
    }

    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Enables or disables the GET response cache; enabled by default.
    pub fn set_cache(&mut self, enabled: bool) {
        self.enable_cache = enabled;
    }

    pub fn set_handler(&mut self, handler: impl Handler) {
        self.handler = Some(Arc::new(handler));
    }

    pub fn set_observer(&mut self, observer: impl Observer) {
        self.observer = Some(Arc::new(observer));
    }

    /// Opens a connection to the authority of a `coap://` or
    /// `coaps://` URL.
    pub async fn dial(&self, url: &str) -> Result<Conn> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        let (scheme, default_port) = match url.scheme() {
            "coap" => ("coap", DEFAULT_PORT),
            "coaps" => ("coaps", DEFAULT_SECURE_PORT),
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        let raw_host = match url.host_str() {
            None | Some("") => return Err(Error::InvalidUrl("missing host".to_string())),
            Some(host) => host.to_string(),
        };
        // Bracketed IPv6 literals become bare addresses for resolution.
        let host = Regex::new(r"^\[(.*?)\]$").unwrap().replace(&raw_host, "$1").to_string();
        let port = url.port().unwrap_or(default_port);

        let peer = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidUrl(format!("no address for {}", host)))?;

        let bind_addr = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(peer).await?;
        let local_addr = socket.local_addr()?;

        let session = Session::new(
            Arc::new(ConnectedUdp::new(socket.clone())),
            self.handler.clone(),
            self.observer.clone(),
            local_addr,
            peer,
            scheme,
            self.enable_cache,
            self.params.clone(),
        );

        let cancel = CancellationToken::new();
        let reader = Reader { socket, session: session.clone(), cancel: cancel.clone() };
        tokio::spawn(reader.run());

        Ok(Conn { authority: format!("{}:{}", raw_host, port), session, cancel })
    }

    /// Dials, sends one request and tears the connection down again.
    pub async fn send_request(&self, req: &Request) -> Result<Response> {
        let url = req
            .url
            .as_ref()
            .ok_or_else(|| Error::InvalidUrl("request has no url".to_string()))?;
        let conn = self.dial(url.as_str()).await?;
        conn.session.send_request(req).await
    }
}

struct Reader {
    socket: Arc<UdpSocket>,
    session: Session,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(self) {
        let mut buf = BytesMut::zeroed(1500);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.socket.recv(&mut buf) => match res {
                    Ok(n) => self.session.recv_datagram(buf[..n].to_vec()),
                    Err(e) => {
                        debug!("socket recv: {}", e);
                    }
                },
            }
        }
    }
}

/// An open connection. Dropping it closes the session.
pub struct Conn {
    authority: String,
    session: Session,
    cancel: CancellationToken,
}

impl Conn {
    /// Sends a request over this connection. The request URL must name
    /// the authority the connection was dialed for.
    pub async fn send_request(&self, req: &Request) -> Result<Response> {
        if let Some(authority) = req.authority() {
            if authority != self.authority {
                return Err(Error::HostMismatch {
                    request: authority,
                    conn: self.authority.clone(),
                });
            }
        }
        self.session.send_request(req).await
    }

    /// The session behind this connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.session.close();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
