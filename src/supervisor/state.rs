use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the single broker connection.
///
/// `Connecting → Connected → Reconnecting → Connected … → Closed`;
/// `Closed` is terminal.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Reconnecting = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Reconnecting,
            _ => ConnState::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
            ConnState::Reconnecting => write!(f, "reconnecting"),
            ConnState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state held as an atomic word, padded against false
/// sharing with the hot publish-path atomics around it.
pub(crate) struct AtomicConnState(CachePadded<AtomicU8>);

impl AtomicConnState {
    pub fn new(initial: ConnState) -> Self {
        Self(CachePadded::new(AtomicU8::new(initial as u8)))
    }

    #[inline]
    pub fn load(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `next` unless the terminal `Closed` state was already
    /// reached. Returns whether the store happened.
    pub fn set(&self, next: ConnState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (ConnState::from_u8(cur) != ConnState::Closed).then_some(next as u8)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        let state = AtomicConnState::new(ConnState::Connecting);
        assert!(state.set(ConnState::Connected));
        assert!(state.set(ConnState::Reconnecting));
        assert!(state.set(ConnState::Closed));
        assert!(!state.set(ConnState::Connected));
        assert_eq!(state.load(), ConnState::Closed);
    }
}
