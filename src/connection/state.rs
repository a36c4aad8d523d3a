use crate::colored::Colorize;
use crate::{Error, Result};

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (*self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Handshaking) | (Handshaking, Established) | (Established, Draining) => true,
            _ => false,
        }
    }

    /// Moves to `next`, failing with a protocol violation when the move is not allowed.
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition(next) {
            return Err(Error::ProtocolViolation("illegal connection state transition"));
        }
        *self = next;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting".normal(),
            ConnectionState::Handshaking => "handshaking".cyan(),
            ConnectionState::Established => "established".green(),
            ConnectionState::Draining => "draining".yellow(),
            ConnectionState::Closed => "closed".red(),
        };
        write!(f, "{}", s)
    }
}
