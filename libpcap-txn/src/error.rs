use thiserror::Error;

/// Errors raised while reassembling IPv4 fragments
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DefragError {
    #[error("truncated or invalid IPv4 fragment header")]
    InvalidHeader,
    #[error("non-final fragment length {0} is not a multiple of 8")]
    Misaligned(usize),
    #[error("reassembled datagram would exceed 65535 bytes")]
    TooLarge,
    #[error("fragment conflicts with the end of the datagram")]
    ConflictingEnd,
    #[error("too many fragments for one datagram")]
    TooManyFragments,
}

/// Errors raised by the layer decoder. All of them result in the packet being dropped.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("truncated {0} layer")]
    Truncated(&'static str),
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
    #[error("unsupported ethertype 0x{0:04x}")]
    UnsupportedEtherType(u16),
    #[error("invalid IP header: {0}")]
    InvalidIpHeader(&'static str),
    #[error("unsupported transport protocol {0}")]
    UnsupportedTransport(u8),
    #[error("defragmentation failed: {0}")]
    Defrag(#[from] DefragError),
}
