//! A CoAP ([RFC 7252]) client/server endpoint core.
//!
//! The crate implements the per-peer message-processing stack of the
//! protocol: the binary codec, confirmable-message retransmission,
//! message-id deduplication, block-wise transfers ([RFC 7959]) in both
//! directions, observe notifications ([RFC 7641]), a response cache,
//! and the session state machine gluing them together over any
//! datagram transport. Plain-UDP dial and listen wrappers are
//! included; DTLS or other transports plug in through the
//! [`transport::Transport`] trait.
//!
//! # Server
//!
//! ```no_run
//! use std::io::Write;
//!
//! use coap_endpoint::{listen_and_serve, Request, ResponseWriter};
//!
//! #[tokio::main]
//! async fn main() -> coap_endpoint::Result<()> {
//!     listen_and_serve("0.0.0.0:5683", |w: &mut ResponseWriter, req: &Request| {
//!         let _ = w.write_all(&req.payload);
//!     })
//!     .await
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use coap_endpoint::{Client, Code, Request};
//!
//! #[tokio::main]
//! async fn main() -> coap_endpoint::Result<()> {
//!     let req = Request::new(true, Code::GET, "coap://127.0.0.1/hello", Vec::new())?;
//!     let resp = Client::new().send_request(&req).await?;
//!     println!("{}", String::from_utf8_lossy(&resp.payload));
//!     Ok(())
//! }
//! ```
//!
//! [RFC 7252]: https://tools.ietf.org/html/rfc7252
//! [RFC 7959]: https://tools.ietf.org/html/rfc7959
//! [RFC 7641]: https://tools.ietf.org/html/rfc7641

pub mod client;
pub mod error;
pub mod message;
pub mod params;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
pub mod transport;

mod cache;
mod error_handler;
mod registry;
mod stack;
mod waiter;

pub use client::{Client, Conn};
pub use error::{Error, Result};
pub use message::{Code, Message, MessageType, OptionValue, Options};
pub use params::Params;
pub use request::Request;
pub use response::Response;
pub use server::{listen_and_serve, Server};
pub use session::{Handler, Observer, ResponseWriter, Session};
