//! Per-connection lifecycle.
//!
//! ```text
//! Connecting -> Authenticating -> Authenticated -> SessionActive
//!      \              \                 \               \
//!       +--------------+-----------------+---------------+--> Closed
//! ```

use std::fmt;
use std::net::SocketAddr;

use tracing::debug;

use super::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, handshake not started.
    Connecting,
    /// Credentials are being exchanged.
    Authenticating,
    /// Peer authenticated, no file-transfer channel yet.
    Authenticated,
    /// At least one file-transfer channel is running.
    SessionActive,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::SessionActive => "session-active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticated, SessionActive)
                | (SessionActive, SessionActive)
                | (Connecting | Authenticating | Authenticated | SessionActive, Closed)
        )
    }
}

/// State and authentication attempt count of one connection.
#[derive(Debug)]
pub struct ConnectionTracker {
    peer: SocketAddr,
    state: ConnectionState,
    auth_attempts: u32,
    max_auth_attempts: u32,
}

impl ConnectionTracker {
    pub fn new(peer: SocketAddr, max_auth_attempts: u32) -> Self {
        Self {
            peer,
            state: ConnectionState::Connecting,
            auth_attempts: 0,
            max_auth_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if self.state != next {
            debug!(peer = %self.peer, from = %self.state, to = %next, "Connection state change");
        }
        self.state = next;
        Ok(())
    }

    /// Count one credential attempt against the hard ceiling.
    ///
    /// Exceeding the ceiling closes the connection.
    pub fn begin_auth_attempt(&mut self) -> Result<u32, SessionError> {
        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionState::Authenticating)?;
        }
        if self.state != ConnectionState::Authenticating {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Authenticating,
            });
        }

        self.auth_attempts += 1;
        if self.auth_attempts > self.max_auth_attempts {
            self.close();
            return Err(SessionError::TooManyAuthAttempts(self.max_auth_attempts));
        }
        Ok(self.auth_attempts)
    }

    /// Move to `Closed`. Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(peer = %self.peer, from = %self.state, "Connection closed");
            self.state = ConnectionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: u32) -> ConnectionTracker {
        ConnectionTracker::new("127.0.0.1:40000".parse().unwrap(), max)
    }

    #[test]
    fn test_happy_path() {
        let mut t = tracker(6);
        assert_eq!(t.state(), ConnectionState::Connecting);
        assert_eq!(t.begin_auth_attempt().unwrap(), 1);
        assert_eq!(t.state(), ConnectionState::Authenticating);
        t.transition(ConnectionState::Authenticated).unwrap();
        t.transition(ConnectionState::SessionActive).unwrap();
        t.transition(ConnectionState::SessionActive).unwrap();
        t.close();
        assert_eq!(t.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_cannot_skip_authentication() {
        let mut t = tracker(6);
        assert!(t.transition(ConnectionState::Authenticated).is_err());
        assert!(t.transition(ConnectionState::SessionActive).is_err());
        assert_eq!(t.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut t = tracker(6);
        t.close();
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Authenticated,
            ConnectionState::SessionActive,
            ConnectionState::Closed,
        ] {
            assert!(t.transition(next).is_err(), "{}", next);
        }
        assert!(t.begin_auth_attempt().is_err());
    }

    #[test]
    fn test_attempt_ceiling_closes() {
        let mut t = tracker(6);
        for expected in 1..=6 {
            assert_eq!(t.begin_auth_attempt().unwrap(), expected);
        }
        assert_eq!(t.auth_attempts(), 6);
        assert!(matches!(
            t.begin_auth_attempt(),
            Err(SessionError::TooManyAuthAttempts(6))
        ));
        assert_eq!(t.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_no_attempts_after_authenticated() {
        let mut t = tracker(6);
        t.begin_auth_attempt().unwrap();
        t.transition(ConnectionState::Authenticated).unwrap();
        assert!(t.begin_auth_attempt().is_err());
    }
}
