//! Server configuration.
//!
//! [`Options`] carries the tunable knobs of the hub. Every knob has a
//! production default; zero disables the limits and timers that accept it.
//! Values can be changed at runtime through the facade setters, which apply
//! valid values and silently keep the prior value otherwise.

use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;

use crate::Error;

/// Origin admission policy for the handshake.
///
/// With [`AllowOrigin::SameHost`] (the default) an upgrade is accepted only
/// when the `Origin` header contains the request `Host`. A wildcard accepts
/// everything, including requests without an `Origin` header; a host list
/// accepts same-host requests plus the exact origins listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AllowOrigin {
    /// Only same-host origins are accepted.
    #[default]
    SameHost,
    /// Any origin is accepted.
    Any,
    /// Same-host origins plus this exact list.
    List(Vec<String>),
}

impl AllowOrigin {
    pub(crate) fn is_any(&self) -> bool {
        matches!(self, AllowOrigin::Any)
    }

    pub(crate) fn contains(&self, origin: &str) -> bool {
        match self {
            AllowOrigin::SameHost => false,
            AllowOrigin::Any => true,
            AllowOrigin::List(list) => list.iter().any(|allowed| allowed == origin),
        }
    }
}

/// Text encoding applied to inbound text payloads before they are emitted,
/// and to outbound text before it is framed.
///
/// These mirror the byte-string encodings of the runtime the protocol was
/// designed around: decoding never fails (invalid sequences are replaced or
/// re-spelled), encoding fails only for malformed `base64`/`hex` input.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Base64,
    Hex,
    Binary,
    Utf16Le,
    Ucs2,
}

impl Encoding {
    /// Parses a configuration name. Unknown names return `None` so the
    /// caller can keep the previous value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "utf8" => Some(Self::Utf8),
            "ascii" => Some(Self::Ascii),
            "base64" => Some(Self::Base64),
            "hex" => Some(Self::Hex),
            "binary" | "latin1" => Some(Self::Binary),
            "utf16le" => Some(Self::Utf16Le),
            "ucs2" => Some(Self::Ucs2),
            _ => None,
        }
    }

    /// Decodes payload bytes into text.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii => bytes.iter().map(|b| (b & 0x7F) as char).collect(),
            Encoding::Base64 => BASE64_STANDARD.encode(bytes),
            Encoding::Hex => {
                use std::fmt::Write;
                bytes.iter().fold(
                    String::with_capacity(bytes.len() * 2),
                    |mut out, byte| {
                        let _ = write!(out, "{byte:02x}");
                        out
                    },
                )
            }
            Encoding::Binary => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Utf16Le | Encoding::Ucs2 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }

    /// Encodes text into payload bytes.
    pub fn encode(&self, text: &str) -> Result<Bytes, Error> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Ascii | Encoding::Binary => {
                Ok(text.chars().map(|c| c as u8).collect::<Vec<_>>().into())
            }
            Encoding::Base64 => BASE64_STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|_| Error::InvalidTextPayload),
            Encoding::Hex => {
                if text.len() % 2 != 0 {
                    return Err(Error::InvalidTextPayload);
                }
                text.as_bytes()
                    .chunks_exact(2)
                    .map(|pair| {
                        let hi = (pair[0] as char).to_digit(16)?;
                        let lo = (pair[1] as char).to_digit(16)?;
                        Some((hi * 16 + lo) as u8)
                    })
                    .collect::<Option<Vec<u8>>>()
                    .map(Bytes::from)
                    .ok_or(Error::InvalidTextPayload)
            }
            Encoding::Utf16Le | Encoding::Ucs2 => {
                let mut out = Vec::with_capacity(text.len() * 2);
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                Ok(out.into())
            }
        }
    }
}

/// Tunable configuration of the hub.
///
/// The zero value of each limit or timer disables it.
#[derive(Debug, Clone)]
pub struct Options {
    /// Origin admission policy.
    pub(crate) allow_origin: AllowOrigin,
    /// Text decoding for inbound text payloads.
    pub(crate) encoding: Encoding,
    /// Maximum simultaneous connections per peer IP.
    pub(crate) limit_by_ip: usize,
    /// Maximum message payload in bytes, cumulative across fragments.
    pub(crate) max_payload: usize,
    /// Interval between server-wide liveness pings.
    pub(crate) ping_delay: Duration,
    /// Deadline for the pong answering each liveness ping.
    pub(crate) pong_timeout: Duration,
    /// How long a released client id stays reusable via the session cookie.
    pub(crate) session_expires: Duration,
    /// Reject frames with RSV bits set instead of ignoring them.
    pub(crate) reject_reserved_bits: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            allow_origin: AllowOrigin::SameHost,
            encoding: Encoding::Utf8,
            limit_by_ip: 256,
            max_payload: 2_621_440,
            ping_delay: Duration::from_millis(180_000),
            pong_timeout: Duration::from_millis(5_000),
            session_expires: Duration::from_millis(43_200_000),
            reject_reserved_bits: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_origin(mut self, allow_origin: AllowOrigin) -> Self {
        self.allow_origin = allow_origin;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_limit_by_ip(mut self, limit: usize) -> Self {
        self.limit_by_ip = limit;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_ping_delay(mut self, ping_delay: Duration) -> Self {
        self.ping_delay = ping_delay;
        self
    }

    pub fn with_pong_timeout(mut self, pong_timeout: Duration) -> Self {
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_session_expires(mut self, session_expires: Duration) -> Self {
        self.session_expires = session_expires;
        self
    }

    pub fn with_reject_reserved_bits(mut self, reject: bool) -> Self {
        self.reject_reserved_bits = reject;
        self
    }
}
