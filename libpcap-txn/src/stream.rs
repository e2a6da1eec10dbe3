//! Per-direction byte accumulation for stream parsers

/// Result of one parsing step over a stream
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseStep {
    /// A complete message is available in the stream
    Complete,
    /// More data is needed. Buffered data must be kept
    NeedMore,
    /// Unrecoverable parse error: pending message and state must be discarded
    Invalid,
}

/// Direction of a packet, relative to the first packet seen on the connection
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Original = 0,
    Reverse = 1,
}

impl Direction {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn other(self) -> Direction {
        match self {
            Direction::Original => Direction::Reverse,
            Direction::Reverse => Direction::Original,
        }
    }
}

/// Buffered data for one direction of a connection, with the state of the
/// message being parsed
///
/// `S` is the parser state, `M` the message type of the protocol.
#[derive(Debug)]
pub struct Stream<S, M> {
    pub data: Vec<u8>,
    /// Offset of the next byte to parse in `data`
    pub parse_offset: usize,
    pub state: S,
    /// In-progress message, if any
    pub message: Option<M>,
}

impl<S: Default, M> Stream<S, M> {
    pub fn new() -> Self {
        Stream {
            data: Vec::new(),
            parse_offset: 0,
            state: S::default(),
            message: None,
        }
    }

    /// Append data to the stream
    ///
    /// Returns false (and resets the stream) if the buffered data would exceed `max_size`.
    pub fn append(&mut self, data: &[u8], max_size: usize) -> bool {
        if self.data.len() + data.len() > max_size {
            self.reset();
            return false;
        }
        self.data.extend_from_slice(data);
        true
    }

    /// Data not yet parsed
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.parse_offset.min(self.data.len())..]
    }

    #[inline]
    pub fn remaining_len(&self) -> usize {
        self.data.len().saturating_sub(self.parse_offset)
    }

    /// Slide the buffer past the consumed bytes (up to `parse_offset`), and reset parser state
    pub fn prepare_for_new_message(&mut self) {
        let end = self.parse_offset.min(self.data.len());
        self.data.drain(..end);
        self.parse_offset = 0;
        self.state = S::default();
        self.message = None;
    }

    /// Discard all buffered data and state
    pub fn reset(&mut self) {
        self.data.clear();
        self.parse_offset = 0;
        self.state = S::default();
        self.message = None;
    }
}

impl<S: Default, M> Default for Stream<S, M> {
    fn default() -> Self {
        Stream::new()
    }
}
