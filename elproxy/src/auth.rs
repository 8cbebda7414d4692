use crate::error::{Denial, ProtocolError, ProxyError, ProxyResult};
use crate::logging;
use md5::{Digest, Md5};
use rand::Rng;
use regex::Regex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::str;

/// Longest callsign accepted during the handshake.
pub const MAX_CALLSIGN_LEN: usize = 10;
/// Length of the hex-rendered nonce sent to a connecting client.
pub const NONCE_LEN: usize = 8;

const DIGEST_LEN: usize = 16;

/// SYSTEM frame reporting a failed password check.
pub const SYSTEM_BAD_PASSWORD: [u8; 10] =
    [0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
/// SYSTEM frame reporting a callsign the proxy will not serve.
pub const SYSTEM_ACCESS_DENIED: [u8; 10] =
    [0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02];

/// Render a 32 bit nonce as the 8 lowercase hex characters sent on the
/// wire.
#[inline]
pub fn format_nonce(nonce: u32) -> String {
    format!("{:08x}", nonce)
}

/// Draw a fresh nonce for one handshake.
#[inline]
pub fn generate_nonce() -> String {
    format_nonce(rand::thread_rng().gen())
}

/// Expected MD5 response for `password` salted with the hex `nonce`: ASCII
/// lowercase in the password is folded to uppercase, every other byte
/// passes through untouched, and the nonce characters are appended.
pub fn expected_response(password: &str, nonce: &str) -> [u8; 16] {
    let folded: Vec<u8> = password.bytes().map(|b| b.to_ascii_uppercase()).collect();

    let mut hasher = Md5::new();
    hasher.update(&folded);
    hasher.update(nonce.as_bytes());
    hasher.finalize().into()
}

/// Callsign admission policy compiled from the configured allow/deny
/// expressions.
pub struct CallsignPolicy {
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl CallsignPolicy {
    pub fn new(allow: Option<&str>, deny: Option<&str>) -> ProxyResult<CallsignPolicy> {
        Ok(CallsignPolicy {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    /// Policy without any restrictions.
    pub fn open() -> CallsignPolicy {
        CallsignPolicy {
            allow: None,
            deny: None,
        }
    }

    /// A callsign passes iff the deny expression, when present, does not
    /// match and the allow expression, when present, matches.
    pub fn allows(&self, callsign: &str) -> bool {
        if let Some(deny) = &self.deny {
            if deny.is_match(callsign) {
                return false;
            }
        }

        match &self.allow {
            Some(allow) => allow.is_match(callsign),
            None => true,
        }
    }
}

fn compile(pattern: Option<&str>) -> ProxyResult<Option<Regex>> {
    match pattern {
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|err| {
            ProxyError::Config(format!("invalid callsign pattern '{}': {}", pattern, err))
        }),
        None => Ok(None),
    }
}

/// Runs the challenge/response handshake over freshly accepted client
/// sockets and applies the callsign policy.
pub struct Authorizer {
    password: String,
    policy: CallsignPolicy,
    log: logging::Logger,
}

impl Authorizer {
    pub fn new(password: String, policy: CallsignPolicy, log: &logging::Logger) -> Authorizer {
        Authorizer {
            password,
            policy,
            log: log.new(logging::o!("component" => "auth")),
        }
    }

    /// Challenge the client and verify its reply. Returns the authorized
    /// callsign; on policy failures the matching SYSTEM frame has already
    /// been sent when the error is returned. The caller closes the socket.
    pub fn handshake(&self, stream: &mut TcpStream) -> ProxyResult<String> {
        let nonce = generate_nonce();
        stream.write_all(nonce.as_bytes())?;

        // The reply starts with "CALLSIGN\n"; the newline must fall within
        // the first 11 bytes. The 16 bytes after it are the MD5 response,
        // so after the initial 16-byte read exactly idx + 1 more bytes
        // remain outstanding.
        let mut head = [0u8; DIGEST_LEN];
        stream.read_exact(&mut head)?;

        let newline = head[..MAX_CALLSIGN_LEN + 1]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ProxyError::Protocol(ProtocolError::MalformedAuth))?;

        let callsign = str::from_utf8(&head[..newline])
            .map_err(|_| ProxyError::Protocol(ProtocolError::MalformedAuth))?
            .to_string();

        let mut tail = vec![0u8; newline + 1];
        stream.read_exact(&mut tail)?;

        let mut reply = [0u8; DIGEST_LEN];
        reply[..DIGEST_LEN - (newline + 1)].copy_from_slice(&head[newline + 1..]);
        reply[DIGEST_LEN - (newline + 1)..].copy_from_slice(&tail);

        if reply != expected_response(&self.password, &nonce) {
            logging::info!(self.log, "password check failed";
                           "callsign" => &callsign,
                           "remote" => remote_addr(stream));
            stream.write_all(&SYSTEM_BAD_PASSWORD)?;
            return Err(ProxyError::Denied(Denial::BadPassword));
        }

        if !self.policy.allows(&callsign) {
            logging::info!(self.log, "callsign not authorized";
                           "callsign" => &callsign,
                           "remote" => remote_addr(stream));
            stream.write_all(&SYSTEM_ACCESS_DENIED)?;
            return Err(ProxyError::Denied(Denial::CallsignNotAuthorized));
        }

        Ok(callsign)
    }
}

fn remote_addr(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
