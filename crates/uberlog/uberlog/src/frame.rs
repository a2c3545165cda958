//! The message frame carried through the ring.
//!
//! Wire layout, native-endian, 16 bytes of header followed by the payload:
//!
//! ```text
//! offset 0:  u32    command      (0 = Null, 1 = Close, 2 = LogMsg)
//! offset 4:  u32    padding      (always zero)
//! offset 8:  usize  payload_len  (native word)
//! offset 16: u8[payload_len]
//! ```
//!
//! Both processes are the same binary word size by construction (the writer
//! is spawned from the producer's own directory), so native-endian native
//! words are safe here and keep the codec to a pair of array copies.

/// Commands understood by the writer slave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Never sent; a zero command in the stream means corruption.
    Null = 0,
    /// End of stream. The writer drains and exits.
    Close = 1,
    /// One log message follows in the payload.
    LogMsg = 2,
}

impl Command {
    pub fn from_wire(raw: u32) -> Option<Command> {
        match raw {
            0 => Some(Command::Null),
            1 => Some(Command::Close),
            2 => Some(Command::LogMsg),
            _ => None,
        }
    }
}

pub const HEADER_SIZE: usize = 16;

const WORD: usize = std::mem::size_of::<usize>();

// The padding keeps payload_len at offset 8 on every target we build for.
const _: () = assert!(8 + WORD <= HEADER_SIZE);

#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    pub command: Command,
    pub payload_len: usize,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.command as u32).to_ne_bytes());
        buf[8..8 + WORD].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    /// Decodes the raw command word and payload length. The command is left
    /// raw so the consumer can treat unknown values as stream corruption.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> (u32, usize) {
        let mut cmd = [0u8; 4];
        cmd.copy_from_slice(&buf[0..4]);
        let mut len = [0u8; WORD];
        len.copy_from_slice(&buf[8..8 + WORD]);
        (u32::from_ne_bytes(cmd), usize::from_ne_bytes(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader {
            command: Command::LogMsg,
            payload_len: 0x1234_5678,
        };
        let wire = header.encode();
        let (cmd, len) = MessageHeader::decode(&wire);
        assert_eq!(cmd, Command::LogMsg as u32);
        assert_eq!(len, 0x1234_5678);
        assert_eq!(&wire[4..8], &[0, 0, 0, 0], "padding stays zero");
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(Command::from_wire(0), Some(Command::Null));
        assert_eq!(Command::from_wire(1), Some(Command::Close));
        assert_eq!(Command::from_wire(2), Some(Command::LogMsg));
        assert_eq!(Command::from_wire(3), None);
        assert_eq!(Command::from_wire(u32::MAX), None);
    }
}
