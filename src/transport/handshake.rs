//! Handshake descriptor exchanged between a client and its server.
//!
//! The descriptor is a single-slot mailbox: the producer publishes a span and
//! raises the signal, the consumer takes the span and lowers it again. The
//! producer may not publish another span until it has seen the lowered value.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{IofwdError, IofwdResult};

/// Size of [`HandshakeDescriptor`] in a mailbox region.
pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<HandshakeDescriptor>();

/// Mailbox signal values. Producers raise 1 or 11, consumers lower to 0 or 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Signal {
    Idle = 0,
    DataReady = 1,
    PhaseEnd = 10,
    StreamEnd = 11,
}

impl Signal {
    /// The value the consumer writes back after taking a span published
    /// with this signal.
    pub fn acknowledgment(self) -> IofwdResult<Signal> {
        match self {
            Signal::DataReady => Ok(Signal::Idle),
            Signal::StreamEnd => Ok(Signal::PhaseEnd),
            other => Err(IofwdError::ProtocolViolation(format!(
                "{:?} is not a producer signal",
                other
            ))),
        }
    }

    pub fn is_producer(self) -> bool {
        matches!(self, Signal::DataReady | Signal::StreamEnd)
    }
}

impl TryFrom<u32> for Signal {
    type Error = IofwdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Signal::Idle),
            1 => Ok(Signal::DataReady),
            10 => Ok(Signal::PhaseEnd),
            11 => Ok(Signal::StreamEnd),
            other => Err(IofwdError::ProtocolViolation(format!(
                "handshake signal {} is not defined",
                other
            ))),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct HandshakeDescriptor {
    signal: U32,
    _reserved: U32,
    start: U64,
    end: U64,
    free: U64,
    used: U64,
}

impl HandshakeDescriptor {
    pub fn idle() -> Self {
        Self::new(Signal::Idle, 0, 0, 0, 0)
    }

    pub fn new(signal: Signal, start: usize, end: usize, free: usize, used: usize) -> Self {
        Self {
            signal: U32::new(signal as u32),
            _reserved: U32::ZERO,
            start: U64::new(start as u64),
            end: U64::new(end as u64),
            free: U64::new(free as u64),
            used: U64::new(used as u64),
        }
    }

    /// Parse a descriptor from mailbox bytes.
    pub fn read(bytes: &[u8]) -> IofwdResult<Self> {
        HandshakeDescriptor::read_from_bytes(bytes).map_err(|_| {
            IofwdError::ProtocolViolation(format!(
                "handshake descriptor needs {} bytes, got {}",
                DESCRIPTOR_SIZE,
                bytes.len()
            ))
        })
    }

    pub fn signal(&self) -> IofwdResult<Signal> {
        Signal::try_from(self.signal.get())
    }

    pub fn start(&self) -> usize {
        self.start.get() as usize
    }

    pub fn end(&self) -> usize {
        self.end.get() as usize
    }

    pub fn free(&self) -> usize {
        self.free.get() as usize
    }

    pub fn used(&self) -> usize {
        self.used.get() as usize
    }

    /// Length of the published span.
    pub fn span_len(&self) -> usize {
        self.end().saturating_sub(self.start())
    }

    /// Same cursors, different signal.
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = U32::new(signal as u32);
        self
    }

    /// Check that a producer descriptor describes a non-empty span inside a
    /// ring of `capacity` bytes.
    pub fn validate_span(&self, capacity: usize) -> IofwdResult<Signal> {
        let signal = self.signal()?;
        if !signal.is_producer() {
            return Err(IofwdError::ProtocolViolation(format!(
                "expected a published span, mailbox holds {:?}",
                signal
            )));
        }
        if self.start() >= self.end() || self.end() > capacity {
            return Err(IofwdError::ProtocolViolation(format!(
                "span [{}, {}) invalid for a ring of {} bytes",
                self.start(),
                self.end(),
                capacity
            )));
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        assert_eq!(DESCRIPTOR_SIZE, 40);
        let desc = HandshakeDescriptor::new(Signal::DataReady, 16, 48, 48, 16);
        let bytes = desc.as_bytes();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &16u64.to_le_bytes());
        assert_eq!(HandshakeDescriptor::read(bytes).unwrap(), desc);
    }

    #[test]
    fn test_acknowledgment_pairs() {
        assert_eq!(Signal::DataReady.acknowledgment().unwrap(), Signal::Idle);
        assert_eq!(Signal::StreamEnd.acknowledgment().unwrap(), Signal::PhaseEnd);
        assert!(Signal::Idle.acknowledgment().is_err());
    }

    #[test]
    fn test_validate_span() {
        let ok = HandshakeDescriptor::new(Signal::StreamEnd, 0, 64, 64, 0);
        assert_eq!(ok.validate_span(64).unwrap(), Signal::StreamEnd);

        let empty = HandshakeDescriptor::new(Signal::DataReady, 8, 8, 8, 8);
        assert!(empty.validate_span(64).is_err());

        let past_end = HandshakeDescriptor::new(Signal::DataReady, 32, 80, 80, 32);
        assert!(past_end.validate_span(64).is_err());

        let idle = HandshakeDescriptor::idle();
        assert!(matches!(
            idle.validate_span(64),
            Err(IofwdError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_undefined_signal() {
        let mut bytes = HandshakeDescriptor::idle().as_bytes().to_vec();
        bytes[0] = 7;
        let desc = HandshakeDescriptor::read(&bytes).unwrap();
        assert!(desc.signal().is_err());
    }
}
