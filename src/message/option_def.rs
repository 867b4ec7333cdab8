//! The option definition table.
//!
//! ```text
//! +-----+---+---+---+---+----------------+--------+--------+
//! | No. | C | U | N | R | Name           | Format | Length |
//! +-----+---+---+---+---+----------------+--------+--------+
//! |   1 | x |   |   | x | If-Match       | opaque | 0-8    |
//! |   3 | x | x | - |   | Uri-Host       | string | 1-255  |
//! |   4 |   |   |   | x | ETag           | opaque | 1-8    |
//! |   5 | x |   |   |   | If-None-Match  | empty  | 0      |
//! |   6 |   | x | - |   | Observe        | uint   | 0-3    |
//! |   7 | x | x | - |   | Uri-Port       | uint   | 0-2    |
//! |   8 |   |   |   | x | Location-Path  | string | 0-255  |
//! |  11 | x | x | - | x | Uri-Path       | string | 0-255  |
//! |  12 |   |   |   |   | Content-Format | uint   | 0-2    |
//! |  14 |   | x | - |   | Max-Age        | uint   | 0-4    |
//! |  15 | x | x | - | x | Uri-Query      | string | 0-255  |
//! |  17 | x |   |   |   | Accept         | uint   | 0-2    |
//! |  20 |   |   |   | x | Location-Query | string | 0-255  |
//! |  23 | x | x | - |   | Block2         | uint   | 0-3    |
//! |  27 | x | x | - |   | Block1         | uint   | 0-3    |
//! |  28 |   |   | x |   | Size2          | uint   | 0-4    |
//! |  35 | x | x | - |   | Proxy-Uri      | string | 1-1034 |
//! |  39 | x | x | - |   | Proxy-Scheme   | string | 1-255  |
//! |  60 |   |   | x |   | Size1          | uint   | 0-4    |
//! +-----+---+---+---+---+----------------+--------+--------+
//!
//! C=Critical, U=Unsafe, N=No-Cache-Key, R=Repeatable
//! ```
//!
//! The C, U and N columns are not stored: they follow from the option
//! number itself (RFC 7252 section 5.4.6).

/// On-wire representation of an option value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptionFormat {
    Empty,
    Uint,
    String,
    Opaque,
}

/// One row of the option definition table.
#[derive(Debug)]
pub struct OptionDef {
    pub id: u16,
    pub name: &'static str,
    pub format: OptionFormat,
    /// Maximum number of occurrences in one message; 0 means unlimited.
    pub repeat: usize,
    pub min_len: usize,
    pub max_len: usize,
}

static DEFS: &[OptionDef] = &[
    def(super::options::IF_MATCH, "If-Match", OptionFormat::Opaque, 0, 0, 8),
    def(super::options::URI_HOST, "Uri-Host", OptionFormat::String, 1, 1, 255),
    def(super::options::ETAG, "ETag", OptionFormat::Opaque, 0, 1, 8),
    def(super::options::IF_NONE_MATCH, "If-None-Match", OptionFormat::Empty, 1, 0, 0),
    def(super::options::OBSERVE, "Observe", OptionFormat::Uint, 1, 0, 3),
    def(super::options::URI_PORT, "Uri-Port", OptionFormat::Uint, 1, 0, 2),
    def(super::options::LOCATION_PATH, "Location-Path", OptionFormat::String, 0, 0, 255),
    def(super::options::URI_PATH, "Uri-Path", OptionFormat::String, 0, 0, 255),
    def(super::options::CONTENT_FORMAT, "Content-Format", OptionFormat::Uint, 1, 0, 2),
    def(super::options::MAX_AGE, "Max-Age", OptionFormat::Uint, 1, 0, 4),
    def(super::options::URI_QUERY, "Uri-Query", OptionFormat::String, 0, 0, 255),
    def(super::options::ACCEPT, "Accept", OptionFormat::Uint, 1, 0, 2),
    def(super::options::LOCATION_QUERY, "Location-Query", OptionFormat::String, 0, 0, 255),
    def(super::options::BLOCK2, "Block2", OptionFormat::Uint, 1, 0, 3),
    def(super::options::BLOCK1, "Block1", OptionFormat::Uint, 1, 0, 3),
    def(super::options::SIZE2, "Size2", OptionFormat::Uint, 1, 0, 4),
    def(super::options::PROXY_URI, "Proxy-Uri", OptionFormat::String, 1, 1, 1034),
    def(super::options::PROXY_SCHEME, "Proxy-Scheme", OptionFormat::String, 1, 1, 255),
    def(super::options::SIZE1, "Size1", OptionFormat::Uint, 1, 0, 4),
];

const fn def(
    id: u16,
    name: &'static str,
    format: OptionFormat,
    repeat: usize,
    min_len: usize,
    max_len: usize,
) -> OptionDef {
    OptionDef { id, name, format, repeat, min_len, max_len }
}

/// Looks up the definition of a recognized option number.
pub fn lookup(id: u16) -> Option<&'static OptionDef> {
    DEFS.iter().find(|d| d.id == id)
}

/// Returns the registered option name, or the bare number for options
/// this endpoint does not recognize.
pub fn name(id: u16) -> String {
    match lookup(id) {
        Some(d) => d.name.to_string(),
        None => id.to_string(),
    }
}

/// An unrecognized critical option in a confirmable request fails the
/// exchange; elective options are skipped silently.
pub fn critical(id: u16) -> bool {
    id & 0x1 == 1
}

/// Unsafe-to-forward options must be understood by proxies.
pub fn unsafe_to_forward(id: u16) -> bool {
    id & 0x2 == 2
}

/// No-cache-key options do not participate in the response cache key.
pub fn no_cache_key(id: u16) -> bool {
    id & 0x1e == 0x1c
}

/// An option instance is recognized iff its number is defined, its
/// length is within the declared range and its repeat count does not
/// exceed the declared cap.
pub fn recognize(id: u16, len: usize, repeat: usize) -> bool {
    let Some(d) = lookup(id) else {
        return false;
    };
    if len < d.min_len || len > d.max_len {
        return false;
    }
    if d.repeat > 0 && repeat > d.repeat {
        return false;
    }
    true
}
