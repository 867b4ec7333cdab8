//! The per-peer session: the state machine that ties the codec, the
//! layer stack, the waiter tables and the user callbacks together.
//!
//! A session runs two cooperative queues. The *running* queue owns
//! every piece of protocol state (the layer stack, the waiter tables,
//! the message-id counter), so none of it is locked. The *serving*
//! queue delivers parsed requests to the user handler and notifications
//! to the user observer; those callbacks may block for as long as they
//! like without stalling the protocol.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::ResponseCache;
use crate::error::{Error, Result, StackError, StackErrorKind};
use crate::error_handler;
use crate::message::{options, Code, Message, MessageType, Options};
use crate::params::Params;
use crate::registry::GcObject;
use crate::request::Request;
use crate::response::Response;
use crate::stack::{Stack, StackOutput};
use crate::transport::Transport;
use crate::waiter::{AckWaiter, ResponseWaiter};

/// Serves requests arriving over a session.
///
/// Invocations for requests from the same peer are serialized in
/// arrival order; the callback may block freely.
pub trait Handler: Send + Sync + 'static {
    fn serve(&self, w: &mut ResponseWriter, req: &Request);
}

impl<F> Handler for F
where
    F: Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
{
    fn serve(&self, w: &mut ResponseWriter, req: &Request) {
        self(w, req)
    }
}

/// Receives unsolicited responses carrying the Observe option.
pub trait Observer: Send + Sync + 'static {
    fn serve_observe(&self, resp: &Response);
}

impl<F> Observer for F
where
    F: Fn(&Response) + Send + Sync + 'static,
{
    fn serve_observe(&self, resp: &Response) {
        self(resp)
    }
}

/// Builds the response to one request.
///
/// Left untouched, the handler's return produces a piggybacked
/// `2.05 Content` acknowledgement with whatever was written. Calling
/// [`ResponseWriter::ack`] first switches to the separate-response
/// pattern; [`ResponseWriter::set_confirmable`] makes the separate
/// response confirmable.
pub struct ResponseWriter {
    running: mpsc::UnboundedSender<RunCmd>,
    confirmable: bool,
    need_ack: bool,
    acked: bool,
    message_id: u16,
    token: Vec<u8>,
    code: Code,
    options: Options,
    buffer: Vec<u8>,
}

impl ResponseWriter {
    /// Emits an immediate acknowledgement so the response body can
    /// follow later as a separate message. Only meaningful for
    /// confirmable requests; otherwise a no-op.
    pub fn ack(&mut self, code: Code) {
        if !self.need_ack || self.acked {
            return;
        }
        self.acked = true;
        let mut m = Message::ack(self.message_id);
        m.code = code;
        let _ = self.running.send(RunCmd::SendMessage(m));
    }

    /// Sends the separate response as a confirmable message.
    pub fn set_confirmable(&mut self) {
        self.confirmable = true;
    }

    pub fn options(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Sets the status code; defaults to `2.05 Content`.
    pub fn write_code(&mut self, code: Code) {
        self.code = code;
    }

    fn finish(self) -> PendingReply {
        PendingReply {
            confirmable: self.confirmable,
            need_ack: self.need_ack,
            acked: self.acked,
            message_id: self.message_id,
            token: self.token,
            code: self.code,
            options: self.options,
            payload: self.buffer,
        }
    }
}

impl io::Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The handler's finished response, shipped back to the running queue.
struct PendingReply {
    confirmable: bool,
    need_ack: bool,
    acked: bool,
    message_id: u16,
    token: Vec<u8>,
    code: Code,
    options: Options,
    payload: Vec<u8>,
}

enum RunCmd {
    Datagram(Vec<u8>),
    SendMessage(Message),
    Request { req: Request, reply: oneshot::Sender<Result<Response>> },
    RequestAck { req: Request, reply: oneshot::Sender<Result<()>> },
    Reply(PendingReply),
}

enum ServeJob {
    Request { req: Request, writer: ResponseWriter },
    Observe(Response),
}

struct Shared {
    running_tx: mpsc::UnboundedSender<RunCmd>,
    serving_tx: mpsc::UnboundedSender<ServeJob>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    scheme: String,
    params: Params,
    cache_enabled: bool,
    cache: Mutex<ResponseCache>,
    last_recv: Mutex<Instant>,
}

/// Handle to one peer session. Cheap to clone; the session lives until
/// [`Session::close`] or garbage collection after the idle horizon.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Creates a session bound to a transport and spawns its two
    /// queues.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn Handler>>,
        observer: Option<Arc<dyn Observer>>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        scheme: &str,
        cache_enabled: bool,
        params: Params,
    ) -> Session {
        let (running_tx, running_rx) = mpsc::unbounded_channel();
        let (serving_tx, serving_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            running_tx,
            serving_tx,
            cancel: CancellationToken::new(),
            local_addr,
            remote_addr,
            scheme: scheme.to_string(),
            params: params.clone(),
            cache_enabled,
            cache: Mutex::new(ResponseCache::new()),
            last_recv: Mutex::new(Instant::now()),
        });

        let runner = Runner {
            shared: shared.clone(),
            transport,
            handler_present: handler.is_some(),
            observer_present: observer.is_some(),
            stack: Stack::new(&params),
            seq: rand::random::<u16>(),
            ack_waiters: HashMap::new(),
            resp_waiters: HashMap::new(),
        };
        tokio::spawn(runner.run(running_rx));
        tokio::spawn(serving(shared.clone(), handler, observer, serving_rx));

        Session { shared }
    }

    /// Feeds one received datagram into the session.
    pub fn recv_datagram(&self, data: Vec<u8>) {
        *self.shared.last_recv.lock().unwrap() = Instant::now();
        let _ = self.shared.running_tx.send(RunCmd::Datagram(data));
    }

    /// Sends a request and waits for its response.
    ///
    /// With caching enabled, an unexpired cached response to an
    /// identical GET short-circuits the send and a fresh cacheable
    /// response is stored on the way out.
    pub async fn send_request(&self, req: &Request) -> Result<Response> {
        let use_cache = self.shared.cache_enabled && req.method == Code::GET;
        if use_cache {
            let cached = self.shared.cache.lock().unwrap().get(req, Instant::now());
            if let Some(resp) = cached {
                return Ok(resp);
            }
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .running_tx
            .send(RunCmd::Request { req: req.clone(), reply: tx })
            .map_err(|_| Error::SessionClosed)?;
        let resp = rx.await.map_err(|_| Error::SessionClosed)??;

        if use_cache {
            self.shared.cache.lock().unwrap().add(req, &resp, Instant::now());
        }
        Ok(resp)
    }

    /// Sends a confirmable request and waits only for its
    /// acknowledgement, not a response.
    pub async fn send_request_wait_ack(&self, req: &Request) -> Result<()> {
        if !req.confirmable {
            return Err(Error::Stack(StackError::new(
                "session",
                StackErrorKind::AckForNonConfirmable,
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .running_tx
            .send(RunCmd::RequestAck { req: req.clone(), reply: tx })
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Terminates both queues. Outstanding waiters complete with
    /// [`Error::SessionClosed`]; in-flight confirmable messages are
    /// abandoned without further retransmits.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }
}

impl GcObject for Session {
    fn can_gc(&self) -> bool {
        let last = *self.shared.last_recv.lock().unwrap();
        Instant::now() - last > self.shared.params.idle_timeout
    }

    fn execute_gc(&self) {
        self.close();
    }
}

async fn serving(
    shared: Arc<Shared>,
    handler: Option<Arc<dyn Handler>>,
    observer: Option<Arc<dyn Observer>>,
    mut rx: mpsc::UnboundedReceiver<ServeJob>,
) {
    loop {
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        match job {
            ServeJob::Request { req, mut writer } => {
                if let Some(h) = &handler {
                    h.serve(&mut writer, &req);
                    let _ = shared.running_tx.send(RunCmd::Reply(writer.finish()));
                }
            }
            ServeJob::Observe(resp) => {
                if let Some(o) = &observer {
                    o.serve_observe(&resp);
                }
            }
        }
    }
}

/// Owner of all protocol state; lives on the running task.
struct Runner {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    handler_present: bool,
    observer_present: bool,
    stack: Stack,
    seq: u16,
    ack_waiters: HashMap<u16, AckWaiter>,
    resp_waiters: HashMap<Vec<u8>, ResponseWaiter>,
}

impl Runner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RunCmd>) {
        let mut tick = interval(self.shared.params.ack_timeout);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tick.tick() => self.update(),
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for (_, w) in self.ack_waiters.drain() {
            w.done(Err(Error::SessionClosed));
        }
        for (_, w) in self.resp_waiters.drain() {
            w.done(Err(Error::SessionClosed));
        }
    }

    fn handle(&mut self, cmd: RunCmd) {
        match cmd {
            RunCmd::Datagram(data) => self.recv_data(&data),
            RunCmd::SendMessage(m) => {
                if let Err(e) = self.send_message(m) {
                    warn!("send message: {}", e);
                }
            }
            RunCmd::Request { req, reply } => self.send_request_cmd(req, reply),
            RunCmd::RequestAck { req, reply } => self.send_request_ack_cmd(req, reply),
            RunCmd::Reply(reply) => {
                if let Err(e) = self.send_reply(reply) {
                    warn!("send response: {}", e);
                }
            }
        }
    }

    fn update(&mut self) {
        let now = Instant::now();
        let mut out = StackOutput::default();
        self.stack.update(&mut self.seq, now, &mut out);
        self.process(out);

        let expired: Vec<Vec<u8>> = self
            .resp_waiters
            .iter()
            .filter(|(_, w)| w.timed_out(now))
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(w) = self.resp_waiters.remove(&token) {
                w.done(Err(Error::Timeout));
            }
        }
    }

    /// Serializes a message and writes it to the transport, bypassing
    /// the stack. Only the decode-error policy uses this.
    fn transmit(&self, m: &Message) {
        match m.to_bytes() {
            Ok(data) => {
                if let Err(e) = self.transport.send(&data) {
                    warn!("transport send: {}", e);
                }
            }
            Err(e) => warn!("encode {}: {}", m, e),
        }
    }

    fn recv_data(&mut self, data: &[u8]) {
        let m = match Message::from_bytes(data) {
            Ok(m) => m,
            Err(err) => {
                debug!("message decode: {}", err);
                if let Some(reply) = error_handler::error_reply(&err) {
                    self.transmit(&reply);
                }
                return;
            }
        };
        debug!("recv: {}", m);
        let mut out = StackOutput::default();
        if let Err(e) = self.stack.recv(m, &mut self.seq, Instant::now(), &mut out) {
            warn!("stack recv: {}", e);
        }
        self.process(out);
    }

    fn send_message(&mut self, m: Message) -> Result<()> {
        debug!("send: {}", m);
        let mut out = StackOutput::default();
        let res = self.stack.send(m, &mut self.seq, Instant::now(), &mut out);
        self.process(out);
        res.map_err(Error::from)
    }

    fn process(&mut self, out: StackOutput) {
        for m in out.transmit {
            self.transmit(&m);
        }
        for m in out.timeouts {
            self.on_ack_timeout(m);
        }
        for m in out.deliver {
            self.dispatch(m);
        }
    }

    fn on_ack_timeout(&mut self, m: Message) {
        if let Some(w) = self.ack_waiters.remove(&m.message_id) {
            w.done(Err(Error::AckTimeout));
        }
        if !m.token.is_empty() {
            if let Some(w) = self.resp_waiters.remove(&m.token) {
                w.done(Err(Error::AckTimeout));
            }
        }
    }

    fn dispatch(&mut self, m: Message) {
        match m.message_type {
            MessageType::Confirmable | MessageType::NonConfirmable => self.handle_msg(m),
            MessageType::Acknowledgement => self.handle_ack(m),
            MessageType::Reset => self.handle_rst(m),
        }
    }

    fn handle_msg(&mut self, m: Message) {
        if m.code.is_empty() {
            return;
        }
        if m.code.is_request() {
            self.handle_request(m);
        } else if m.code.is_response() {
            self.handle_response(m);
        } else {
            debug!("reserved code: {}.{:02}", m.code.class(), m.code.detail());
        }
    }

    fn handle_request(&mut self, m: Message) {
        if !self.handler_present {
            warn!("no handler, resetting {}", m);
            self.send_rst(m.message_id);
            return;
        }
        let url = match self.url_from_options(&m.options) {
            Ok(url) => url,
            Err(e) => {
                warn!("request url: {}", e);
                self.send_rst(m.message_id);
                return;
            }
        };

        let confirmable = m.message_type == MessageType::Confirmable;
        let writer = ResponseWriter {
            running: self.shared.running_tx.clone(),
            confirmable,
            need_ack: confirmable,
            acked: false,
            message_id: m.message_id,
            token: m.token.clone(),
            code: Code::CONTENT,
            options: Options::new(),
            buffer: Vec::new(),
        };
        let req = Request {
            confirmable,
            method: m.code,
            options: m.options,
            url: Some(url),
            token: Some(m.token),
            payload: m.payload,
            timeout: None,
        };
        let _ = self.shared.serving_tx.send(ServeJob::Request { req, writer });
    }

    fn handle_response(&mut self, m: Message) {
        if m.options.contains(options::OBSERVE) {
            self.handle_observe_response(m);
        } else {
            self.handle_normal_response(m);
        }
    }

    fn handle_observe_response(&mut self, m: Message) {
        if !self.observer_present {
            warn!("no observer, resetting {}", m);
            self.send_rst(m.message_id);
            return;
        }
        let confirmable = m.message_type == MessageType::Confirmable;
        let message_id = m.message_id;
        let _ = self.shared.serving_tx.send(ServeJob::Observe(Response::from_message(m)));
        if confirmable {
            self.send_ack(message_id);
        }
    }

    fn handle_normal_response(&mut self, m: Message) {
        let confirmable = m.message_type == MessageType::Confirmable;
        let message_id = m.message_id;
        if let Some(w) = self.resp_waiters.remove(&m.token) {
            w.done(Ok(m));
        }
        if confirmable {
            self.send_ack(message_id);
        }
    }

    fn handle_ack(&mut self, m: Message) {
        if let Some(w) = self.ack_waiters.remove(&m.message_id) {
            w.done(Ok(()));
        }
        if m.options.contains(options::OBSERVE) {
            if self.observer_present {
                let _ = self
                    .shared
                    .serving_tx
                    .send(ServeJob::Observe(Response::from_message(m.clone())));
            } else {
                warn!("no observer for {}", m);
            }
        }
        if !m.token.is_empty() {
            if let Some(w) = self.resp_waiters.remove(&m.token) {
                w.done(Ok(m));
            }
        }
    }

    fn handle_rst(&mut self, m: Message) {
        if let Some(w) = self.ack_waiters.remove(&m.message_id) {
            w.done(Err(Error::Reset));
        }
        let token = self
            .resp_waiters
            .iter()
            .find(|(_, w)| w.message_id == m.message_id)
            .map(|(token, _)| token.clone());
        if let Some(token) = token {
            if let Some(w) = self.resp_waiters.remove(&token) {
                w.done(Err(Error::Reset));
            }
        }
    }

    fn send_request_cmd(&mut self, req: Request, reply: oneshot::Sender<Result<Response>>) {
        let m = self.make_request_message(&req);
        if self.resp_waiters.contains_key(&m.token) {
            let _ = reply.send(Err(Error::DuplicateToken));
            return;
        }

        let mut timeout = req.timeout.unwrap_or(self.shared.params.response_timeout);
        if req.confirmable && timeout < self.shared.params.exchange_lifetime {
            timeout = self.shared.params.exchange_lifetime;
        }
        let token = m.token.clone();
        let message_id = m.message_id;
        if let Err(e) = self.send_message(m) {
            let _ = reply.send(Err(e));
            return;
        }
        self.resp_waiters
            .insert(token, ResponseWaiter::new(reply, timeout, message_id, Instant::now()));
    }

    fn send_request_ack_cmd(&mut self, req: Request, reply: oneshot::Sender<Result<()>>) {
        let m = self.make_request_message(&req);
        if self.ack_waiters.contains_key(&m.message_id) {
            let _ = reply.send(Err(Error::DuplicateMessageId(m.message_id)));
            return;
        }
        let message_id = m.message_id;
        if let Err(e) = self.send_message(m) {
            let _ = reply.send(Err(e));
            return;
        }
        self.ack_waiters.insert(message_id, AckWaiter::new(reply));
    }

    fn send_reply(&mut self, r: PendingReply) -> Result<()> {
        if !r.need_ack {
            // Response to a non-confirmable request.
            let message_id = self.gen_message_id();
            return self.send_message(Message {
                message_type: if r.confirmable {
                    MessageType::Confirmable
                } else {
                    MessageType::NonConfirmable
                },
                code: r.code,
                message_id,
                token: r.token,
                options: r.options,
                payload: r.payload,
            });
        }

        if r.acked {
            // Separate response; an untouched writer after an early ack
            // means there is nothing left to say.
            if r.code != Code::CONTENT || !r.options.is_empty() || !r.payload.is_empty() {
                let message_id = self.gen_message_id();
                return self.send_message(Message {
                    message_type: if r.confirmable {
                        MessageType::Confirmable
                    } else {
                        MessageType::NonConfirmable
                    },
                    code: r.code,
                    message_id,
                    token: r.token,
                    options: r.options,
                    payload: r.payload,
                });
            }
            Ok(())
        } else {
            // Piggybacked response.
            self.send_message(Message {
                message_type: MessageType::Acknowledgement,
                code: r.code,
                message_id: r.message_id,
                token: r.token,
                options: r.options,
                payload: r.payload,
            })
        }
    }

    fn make_request_message(&mut self, req: &Request) -> Message {
        Message {
            message_type: if req.confirmable {
                MessageType::Confirmable
            } else {
                MessageType::NonConfirmable
            },
            code: req.method,
            message_id: self.gen_message_id(),
            token: req.token.clone().unwrap_or_else(gen_token),
            options: req.options.clone(),
            payload: req.payload.clone(),
        }
    }

    fn gen_message_id(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_ack(&mut self, message_id: u16) {
        if let Err(e) = self.send_message(Message::ack(message_id)) {
            warn!("send ack: {}", e);
        }
    }

    fn send_rst(&mut self, message_id: u16) {
        if let Err(e) = self.send_message(Message::rst(message_id)) {
            warn!("send rst: {}", e);
        }
    }

    /// Rebuilds the request URL from its options, falling back to the
    /// session's local endpoint for a missing host or port.
    fn url_from_options(&self, opts: &Options) -> Result<Url> {
        let host = match opts.get(options::URI_HOST).and_then(|v| v.as_str()) {
            Some(host) => host.to_string(),
            None => match self.shared.local_addr.ip() {
                std::net::IpAddr::V6(ip) => format!("[{}]", ip),
                ip => ip.to_string(),
            },
        };
        let port = opts
            .get_uint(options::URI_PORT)
            .unwrap_or_else(|| u32::from(self.shared.local_addr.port()));
        let mut urlstr =
            format!("{}://{}:{}/{}", self.shared.scheme, host, port, opts.get_path());
        let query = opts.get_query();
        if !query.is_empty() {
            urlstr.push('?');
            urlstr.push_str(&query);
        }
        Url::parse(&urlstr).map_err(|e| Error::InvalidUrl(format!("{}: {}", urlstr, e)))
    }
}

fn gen_token() -> Vec<u8> {
    rand::random::<[u8; 8]>().to_vec()
}
