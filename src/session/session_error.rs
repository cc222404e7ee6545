use std::net::IpAddr;

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::codec_error::EncodeError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("no session is active")]
    NotActive,
    #[error("the session has no members")]
    EmptyRoster,
    #[error("member index {0} is assigned more than once")]
    DuplicateMemberIndex(u8),
    #[error("this node's member index {0} is not part of the roster")]
    OwnIndexMissing(u8),
    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(IpAddr),
    #[error("only the reference node sends sensor frames")]
    NotReference,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("data plane error: {0:#}")]
    DataPlane(anyhow::Error),
}

impl SessionError {
    /// Errors that end the session. All others reject a single operation and leave the session
    ///  running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::DataPlane(_))
    }
}
