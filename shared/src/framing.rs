//! Per-connection reassembly of inbound frames and bookkeeping for the single
//! outbound frame a connection may have in flight.

use crate::codec::{self, declared_length, PacketError, HEADER_LEN, MAX_PACKET_LEN};
use crate::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitingHeader,
    AwaitingBody,
    Complete,
}

#[derive(Debug, Default)]
pub struct PacketBuffer {
    chunks: Vec<Vec<u8>>,
    received: usize,
    declared: Option<usize>,
    outbound: Option<Vec<u8>>,
    written: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FrameState {
        match self.declared {
            None => FrameState::AwaitingHeader,
            Some(declared) if self.received >= declared => FrameState::Complete,
            Some(_) => FrameState::AwaitingBody,
        }
    }

    /// Appends bytes read from the stream.
    ///
    /// Returns `true` once a whole frame is buffered. Bytes past the end of
    /// the frame are kept and become the start of the next one. A header
    /// declaring fewer than 4 or more than [`MAX_PACKET_LEN`] bytes is
    /// rejected; the stream cannot be resynchronized after that.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<bool, PacketError> {
        if !chunk.is_empty() {
            self.received += chunk.len();
            self.chunks.push(chunk.to_vec());
        }

        if self.declared.is_none() && self.received >= HEADER_LEN {
            let header = self.leading_bytes(HEADER_LEN);
            let declared = declared_length(&header);
            if !(HEADER_LEN..=MAX_PACKET_LEN).contains(&declared) {
                return Err(PacketError::InvalidLength(declared));
            }
            self.declared = Some(declared);
        }

        Ok(self.state() == FrameState::Complete)
    }

    /// Bytes still needed to reach the end of the header or the frame.
    pub fn wanted(&self) -> usize {
        match self.declared {
            None => HEADER_LEN.saturating_sub(self.received),
            Some(declared) => declared.saturating_sub(self.received),
        }
    }

    /// Decodes the buffered frame and resets for the next one.
    ///
    /// Surplus bytes stay buffered unparsed; call `add_chunk(&[])` to learn
    /// whether they already hold the next frame. Only valid in [`FrameState::Complete`]; earlier calls report a length
    /// mismatch and leave the buffer untouched.
    pub fn build_packet(&mut self) -> Result<Packet, PacketError> {
        let declared = match self.declared {
            Some(declared) if self.received >= declared => declared,
            declared => {
                return Err(PacketError::LengthMismatch {
                    declared: declared.unwrap_or(HEADER_LEN),
                    actual: self.received,
                })
            }
        };

        let mut frame = self.leading_bytes(self.received);
        let surplus = frame.split_off(declared);
        self.reset_inbound();
        if !surplus.is_empty() {
            // Parsed by the next add_chunk, so a bad header there cannot
            // cost us this packet
            self.received = surplus.len();
            self.chunks.push(surplus);
        }
        codec::decode_frame(&frame)
    }

    pub fn reset_inbound(&mut self) {
        self.chunks.clear();
        self.received = 0;
        self.declared = None;
    }

    /// Replaces the outbound frame. `None` clears it.
    ///
    /// A frame already partly written cannot be dropped without corrupting
    /// the stream, so its unwritten tail is kept in front of the new frame.
    pub fn set_outbound(&mut self, packet: Option<&Packet>) -> Result<(), PacketError> {
        let Some(packet) = packet else {
            self.outbound = None;
            self.written = 0;
            return Ok(());
        };

        let frame = codec::encode(packet)?;
        self.outbound = match self.outbound.take() {
            Some(mut current) if self.written > 0 => {
                current.drain(..self.written);
                current.extend_from_slice(&frame);
                Some(current)
            }
            _ => Some(frame),
        };
        self.written = 0;
        Ok(())
    }

    /// Unwritten tail of the outbound frame.
    pub fn pending_outbound(&self) -> Option<&[u8]> {
        self.outbound.as_deref().map(|frame| &frame[self.written..])
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Records `n` bytes as written. Returns `true` when the frame is fully
    /// flushed, at which point it is dropped.
    pub fn advance_outbound(&mut self, n: usize) -> bool {
        let Some(frame) = &self.outbound else {
            return true;
        };
        self.written = (self.written + n).min(frame.len());
        if self.written == frame.len() {
            self.outbound = None;
            self.written = 0;
            return true;
        }
        false
    }

    fn leading_bytes(&self, n: usize) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .take(n)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode, Operation};

    #[test]
    fn test_byte_by_byte_reassembly() {
        let packet = Packet::add_friend("carol");
        let frame = encode(&packet).unwrap();
        let mut buffer = PacketBuffer::new();

        for (i, byte) in frame.iter().enumerate() {
            let complete = buffer.add_chunk(&[*byte]).unwrap();
            assert_eq!(complete, i == frame.len() - 1);
        }

        assert_eq!(buffer.state(), FrameState::Complete);
        assert_eq!(buffer.build_packet().unwrap(), packet);
        assert_eq!(buffer.state(), FrameState::AwaitingHeader);
    }

    #[test]
    fn test_state_transitions_and_wanted() {
        let frame = encode(&Packet::request(Operation::GetFriends)).unwrap();
        let mut buffer = PacketBuffer::new();
        assert_eq!(buffer.wanted(), HEADER_LEN);

        buffer.add_chunk(&frame[..3]).unwrap();
        assert_eq!(buffer.state(), FrameState::AwaitingHeader);
        assert_eq!(buffer.wanted(), 1);

        buffer.add_chunk(&frame[3..4]).unwrap();
        assert_eq!(buffer.state(), FrameState::AwaitingBody);
        assert_eq!(buffer.wanted(), frame.len() - HEADER_LEN);

        assert!(buffer.add_chunk(&frame[4..]).unwrap());
        assert_eq!(buffer.wanted(), 0);
    }

    #[test]
    fn test_build_before_complete_fails() {
        let frame = encode(&Packet::request(Operation::Logout)).unwrap();
        let mut buffer = PacketBuffer::new();
        buffer.add_chunk(&frame[..6]).unwrap();

        assert!(buffer.build_packet().is_err());
        // Nothing was consumed by the failed attempt
        assert!(buffer.add_chunk(&frame[6..]).unwrap());
        assert!(buffer.build_packet().is_ok());
    }

    #[test]
    fn test_pipelined_frames_keep_surplus() {
        let first = Packet::request(Operation::GetScore);
        let second = Packet::request_challenge("dave");
        let mut bytes = encode(&first).unwrap();
        bytes.extend(encode(&second).unwrap());

        let mut buffer = PacketBuffer::new();
        assert!(buffer.add_chunk(&bytes).unwrap());
        assert_eq!(buffer.build_packet().unwrap(), first);
        assert!(buffer.add_chunk(&[]).unwrap());
        assert_eq!(buffer.state(), FrameState::Complete);
        assert_eq!(buffer.build_packet().unwrap(), second);
        assert_eq!(buffer.state(), FrameState::AwaitingHeader);
    }

    #[test]
    fn test_header_split_across_chunks_with_surplus() {
        let first = Packet::add_friend("carol");
        let second = Packet::word_answer("gatto");
        let third = Packet::request(Operation::Logout);
        let first_frame = encode(&first).unwrap();
        let mut bytes = first_frame.clone();
        bytes.extend(encode(&second).unwrap());
        bytes.extend(encode(&third).unwrap());

        let mut buffer = PacketBuffer::new();
        // Two header bytes, then the rest of the frame plus part of the next
        // frame's header
        assert!(!buffer.add_chunk(&bytes[..2]).unwrap());
        assert_eq!(buffer.state(), FrameState::AwaitingHeader);
        let cut = first_frame.len() + 2;
        assert!(buffer.add_chunk(&bytes[2..cut]).unwrap());
        assert_eq!(buffer.build_packet().unwrap(), first);

        assert!(!buffer.add_chunk(&[]).unwrap());
        assert_eq!(buffer.state(), FrameState::AwaitingHeader);
        assert_eq!(buffer.wanted(), HEADER_LEN - 2);

        // The second header completes, its body and the whole third frame follow
        assert!(buffer.add_chunk(&bytes[cut..]).unwrap());
        assert_eq!(buffer.build_packet().unwrap(), second);
        assert!(buffer.add_chunk(&[]).unwrap());
        assert_eq!(buffer.build_packet().unwrap(), third);
        assert!(!buffer.add_chunk(&[]).unwrap());
        assert_eq!(buffer.wanted(), HEADER_LEN);
    }

    #[test]
    fn test_bad_header_after_frame_surfaces_on_next_chunk() {
        let packet = Packet::request(Operation::GetFriends);
        let mut bytes = encode(&packet).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 1]);

        let mut buffer = PacketBuffer::new();
        assert!(buffer.add_chunk(&bytes).unwrap());
        assert_eq!(buffer.build_packet().unwrap(), packet);
        assert!(matches!(
            buffer.add_chunk(&[]),
            Err(PacketError::InvalidLength(1))
        ));
    }

    #[test]
    fn test_declared_length_out_of_range() {
        let mut buffer = PacketBuffer::new();
        assert!(matches!(
            buffer.add_chunk(&[0, 0, 0, 2]),
            Err(PacketError::InvalidLength(2))
        ));

        let mut buffer = PacketBuffer::new();
        let huge = ((MAX_PACKET_LEN + 1) as u32).to_be_bytes();
        assert!(buffer.add_chunk(&huge).unwrap_err().breaks_framing());
    }

    #[test]
    fn test_outbound_partial_writes() {
        let packet = Packet::ok(Operation::Login);
        let frame = encode(&packet).unwrap();
        let mut buffer = PacketBuffer::new();
        assert!(!buffer.has_outbound());

        buffer.set_outbound(Some(&packet)).unwrap();
        assert_eq!(buffer.pending_outbound().unwrap(), &frame[..]);

        assert!(!buffer.advance_outbound(5));
        assert_eq!(buffer.pending_outbound().unwrap(), &frame[5..]);

        assert!(buffer.advance_outbound(frame.len() - 5));
        assert!(buffer.pending_outbound().is_none());
    }

    #[test]
    fn test_replacing_in_flight_frame_keeps_tail() {
        let first = Packet::ask_word("cat");
        let second = Packet::error(Operation::StopChallenge);
        let first_frame = encode(&first).unwrap();
        let second_frame = encode(&second).unwrap();

        let mut buffer = PacketBuffer::new();
        buffer.set_outbound(Some(&first)).unwrap();
        buffer.advance_outbound(3);
        buffer.set_outbound(Some(&second)).unwrap();

        let mut expected = first_frame[3..].to_vec();
        expected.extend_from_slice(&second_frame);
        assert_eq!(buffer.pending_outbound().unwrap(), &expected[..]);

        // An unstarted frame is simply replaced
        let mut buffer = PacketBuffer::new();
        buffer.set_outbound(Some(&first)).unwrap();
        buffer.set_outbound(Some(&second)).unwrap();
        assert_eq!(buffer.pending_outbound().unwrap(), &second_frame[..]);
    }

    #[test]
    fn test_clear_outbound() {
        let mut buffer = PacketBuffer::new();
        buffer.set_outbound(Some(&Packet::setup_ack())).unwrap();
        buffer.set_outbound(None).unwrap();

        assert!(!buffer.has_outbound());
        assert!(buffer.advance_outbound(0));
    }
}
