//! Response cache for outgoing requests (RFC 7252 section 5.9).
//!
//! Keyed by method, canonical URL and the request options that are not
//! flagged no-cache-key. Successful `2.05 Content` responses and
//! error-class responses are admitted; everything else bypasses the
//! cache. Entries live for the response's Max-Age, sixty seconds when
//! absent.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{option_def, options, Code};
use crate::message::options::OptionValue;
use crate::request::Request;
use crate::response::Response;

const DEFAULT_MAX_AGE: u64 = 60;

#[derive(PartialEq, Eq, Hash)]
struct CacheKey {
    method: Code,
    url: String,
    options: Vec<(u16, OptionValue)>,
}

impl CacheKey {
    fn from_request(req: &Request) -> Option<CacheKey> {
        let url = req.url.as_ref()?.to_string();
        let mut options: Vec<(u16, OptionValue)> = req
            .options
            .iter()
            .filter(|o| !option_def::no_cache_key(o.id))
            .map(|o| (o.id, o.value.clone()))
            .collect();
        options.sort_by_key(|(id, _)| *id);
        Some(CacheKey { method: req.method, url, options })
    }
}

struct CacheEntry {
    response: Response,
    start: Instant,
    ttl: Duration,
}

#[derive(Default)]
pub(crate) struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

fn cacheable(status: Code) -> bool {
    status == Code::CONTENT || matches!(status.class(), 4 | 5)
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        ResponseCache::default()
    }

    pub fn get(&mut self, req: &Request, now: Instant) -> Option<Response> {
        let key = CacheKey::from_request(req)?;
        let entry = self.entries.get(&key)?;
        if now - entry.start > entry.ttl {
            self.entries.remove(&key);
            return None;
        }
        Some(entry.response.clone())
    }

    pub fn add(&mut self, req: &Request, resp: &Response, now: Instant) {
        if !cacheable(resp.status) {
            return;
        }
        let Some(key) = CacheKey::from_request(req) else {
            return;
        };
        let age = resp.options.get_uint(options::MAX_AGE).map(u64::from).unwrap_or(DEFAULT_MAX_AGE);
        if age == 0 {
            self.entries.remove(&key);
            return;
        }
        self.entries.insert(
            key,
            CacheEntry { response: resp.clone(), start: now, ttl: Duration::from_secs(age) },
        );
    }
}
