use crate::duration::Duration;
use crate::five_tuple::FiveTuple;
use pcap_parser::Linktype;

/// A captured frame, as read from the capture source
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    /// Capture timestamp
    pub ts: Duration,
    /// Data link type, describing the format of `data`
    pub link_type: Linktype,
    pub data: &'a [u8],
    /// Index of the frame in the capture
    pub index: usize,
}

/// An application-layer payload, with its flow identifier
///
/// Created for each decoded frame and consumed synchronously.
#[derive(Debug)]
pub struct Packet<'a> {
    pub ts: Duration,
    pub tuple: FiveTuple,
    pub payload: &'a [u8],
}
