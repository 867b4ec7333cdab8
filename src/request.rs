//! The user-facing request type.

use std::time::Duration;

use url::{Host, Url};

use crate::error::Error;
use crate::message::{options, Code, Options};
use crate::params::{DEFAULT_PORT, DEFAULT_SECURE_PORT};

/// An outgoing request, or an incoming one as handed to the handler.
#[derive(Clone, Debug)]
pub struct Request {
    /// Confirmable requests are retransmitted until acknowledged.
    pub confirmable: bool,
    /// The method code (class 0).
    pub method: Code,
    pub options: Options,
    /// The request URL. Populated by [`Request::new`] and when a
    /// received request is reconstructed from its options.
    pub url: Option<Url>,
    /// Exchange correlator. Left `None`, the session generates eight
    /// random bytes.
    pub token: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Overrides the session's default response wait.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Builds a request from a `coap://` or `coaps://` URL, mapping the
    /// authority, path and query onto options.
    ///
    /// Uri-Host is set only when the host is a name rather than a
    /// literal address, Uri-Port only when the port is not the
    /// scheme default. Fragments are rejected.
    pub fn new(
        confirmable: bool,
        method: Code,
        url: &str,
        payload: Vec<u8>,
    ) -> Result<Request, Error> {
        let mut url =
            Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;

        let default_port = match url.scheme() {
            "coap" => DEFAULT_PORT,
            "coaps" => DEFAULT_SECURE_PORT,
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        if url.fragment().is_some() {
            return Err(Error::InvalidUrl("fragment not allowed".to_string()));
        }
        let host = match url.host() {
            None | Some(Host::Domain("")) => {
                return Err(Error::InvalidUrl("missing host".to_string()))
            }
            Some(h) => h.to_owned(),
        };

        let port = url.port().unwrap_or(default_port);
        url.set_port(Some(port)).map_err(|_| Error::InvalidUrl("cannot set port".to_string()))?;

        let mut opts = Options::new();
        if let Host::Domain(name) = &host {
            opts.add(options::URI_HOST, name.as_str());
        }
        if port != default_port {
            opts.add(options::URI_PORT, u32::from(port));
        }
        opts.set_path(url.path());
        if let Some(query) = url.query() {
            opts.set_query(query);
        }

        Ok(Request {
            confirmable,
            method,
            options: opts,
            url: Some(url),
            token: None,
            payload,
            timeout: None,
        })
    }

    /// `host:port` of the request URL, used to pin dialed connections.
    pub(crate) fn authority(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        let host = url.host_str()?;
        let port = url.port()?;
        Some(format!("{}:{}", host, port))
    }
}
