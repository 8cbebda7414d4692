use std::io;
use std::net;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Eq, PartialEq)]
pub enum ProxyError {
    /// The transport went away: reset, broken pipe, interrupted, timed out.
    /// Terminates the affected session only.
    Transport(io::ErrorKind),
    /// The remote violated the wire protocol. Closes the client socket.
    Protocol(ProtocolError),
    /// The client failed a policy check. The matching SYSTEM frame has been
    /// sent before this error is surfaced.
    Denied(Denial),
    /// No slot was available for an authorized client.
    NoFreeSlot,
    /// Invalid configuration; fatal at open.
    Config(String),
    /// The orderly termination signal.
    Shutdown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    /// Frame payload size above the ceiling.
    OversizeFrame,
    /// Opcode outside the defined range.
    UnknownOpcode,
    /// A proxy-to-client opcode arriving from the client.
    UnexpectedOpcode,
    /// Authorization message that cannot be parsed.
    MalformedAuth,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Denial {
    BadPassword,
    CallsignNotAuthorized,
}

impl ProxyError {
    /// True for errors that mean the connection went away, as opposed to a
    /// misbehaving or unauthorized remote.
    pub fn is_transport(&self) -> bool {
        match self {
            ProxyError::Transport(_) => true,
            ProxyError::Shutdown => true,
            _ => false,
        }
    }
}

impl From<io::Error> for ProxyError {
    #[inline]
    fn from(err: io::Error) -> Self {
        ProxyError::Transport(err.kind())
    }
}

impl From<net::AddrParseError> for ProxyError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        ProxyError::Config("invalid network address".to_string())
    }
}
