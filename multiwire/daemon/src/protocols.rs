//! Wire messages spoken by the daemon

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use multiwire_core::protocol::{
    Protocol, ProtocolError, ProtocolReader, ProtocolRegistry, ProtocolType, ProtocolWriter,
};

/// Probe sent by `ping`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ping {
    pub seq: u64,
    pub sent_at_ms: u64,
}

/// Echo of a [`Ping`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pong {
    pub seq: u64,
    pub sent_at_ms: u64,
}

impl Ping {
    pub fn now(seq: u64) -> Self {
        Self {
            seq,
            sent_at_ms: now_ms(),
        }
    }
}

impl Pong {
    pub fn answer(ping: &Ping) -> Self {
        Self {
            seq: ping.seq,
            sent_at_ms: ping.sent_at_ms,
        }
    }

    /// Round trip since the matching ping was sent
    pub fn rtt(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.sent_at_ms))
    }
}

macro_rules! probe_protocol {
    ($ty:ident, $id:expr) => {
        impl Protocol for $ty {
            fn protocol_id(&self) -> u32 {
                Self::ID
            }

            fn read(&mut self, reader: &mut ProtocolReader) -> Result<(), ProtocolError> {
                self.seq = reader.read_u64()?;
                self.sent_at_ms = reader.read_u64()?;
                Ok(())
            }

            fn write(&self, writer: &mut ProtocolWriter) {
                writer.write_u64(self.seq);
                writer.write_u64(self.sent_at_ms);
            }
        }

        impl ProtocolType for $ty {
            const ID: u32 = $id;
        }
    };
}

probe_protocol!(Ping, 1);
probe_protocol!(Pong, 2);

/// Registry with every daemon message
pub fn registry() -> Result<ProtocolRegistry, ProtocolError> {
    ProtocolRegistry::new().with_type::<Ping>()?.with_type::<Pong>()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_both_probes() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.create(Ping::ID).unwrap().is::<Ping>());
        assert!(registry.create(Pong::ID).unwrap().is::<Pong>());
    }

    #[test]
    fn test_pong_echoes_ping() {
        let ping = Ping::now(9);
        let pong = Pong::answer(&ping);
        assert_eq!(pong.seq, 9);
        assert_eq!(pong.sent_at_ms, ping.sent_at_ms);
        assert!(pong.rtt() < Duration::from_secs(5));
    }
}
