use std::time::Duration;

/// Transmission parameters from RFC 7252 section 4.8, plus the derived
/// lifetimes of section 4.8.2 and the endpoint-local knobs built on top
/// of them.
///
/// Every session copies the parameters it needs at construction, so two
/// endpoints in one process can run with different timings (tests
/// tighten these to run retransmission scenarios in milliseconds).
#[derive(Clone, Debug)]
pub struct Params {
    /// Initial retransmission timeout for confirmable messages.
    pub ack_timeout: Duration,
    /// The first timeout is multiplied by a random factor in
    /// `[1, ack_random_factor]`.
    pub ack_random_factor: f64,
    /// Maximum number of retransmissions of a confirmable message.
    pub max_retransmit: u32,
    /// Maximum time from first to last transmission of a confirmable
    /// message.
    pub max_transmit_span: Duration,
    /// Maximum time a sender waits for an acknowledgement.
    pub max_transmit_wait: Duration,
    /// Lifetime of a confirmable exchange; bounds deduplication state
    /// and block-wise assembly state.
    pub exchange_lifetime: Duration,
    /// Lifetime of non-confirmable deduplication state.
    pub non_lifetime: Duration,
    /// Default wait for a response when the caller supplies none.
    pub response_timeout: Duration,
    /// Largest block-wise transfer block this endpoint produces.
    pub max_block_size: u32,
    /// A session that has not received a datagram for this long is
    /// eligible for garbage collection.
    pub idle_timeout: Duration,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_transmit_span: Duration::from_secs(45),
            max_transmit_wait: Duration::from_secs(93),
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            response_timeout: Duration::from_secs(20),
            max_block_size: 1024,
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Default port for the `coap` scheme.
pub const DEFAULT_PORT: u16 = 5683;
/// Default port for the `coaps` scheme.
pub const DEFAULT_SECURE_PORT: u16 = 5684;
