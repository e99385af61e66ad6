//! TPM 2.0 wire constants and the one piece of the wire format the broker
//! interprets: the buffer length carried in every command/response header.
//!
//! Everything past the header is opaque to the daemon and travels
//! untouched between the client and the transport.

/// Command and response buffers share a 10 byte header: tag (u16), total
/// buffer size (u32), command/response code (u32), all big-endian.
pub const HEADER_SIZE: usize = 10;

/// Byte offset of the big-endian size field within the header.
pub const SIZE_OFFSET: usize = 2;

/// Default cap on accepted command/response buffers, matching the common
/// TPM2 maximum command buffer.
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 4096;

/// TPM_ST_NO_SESSIONS.
pub const TAG_NO_SESSIONS: u16 = 0x8001;

/// TPM_RC_CANCELED: RC_WARN + 0x023.
pub const RC_CANCELLED: u32 = 0x0923;

/// Extracts the total buffer size a header claims.
///
/// Returns `None` when fewer than `HEADER_SIZE` bytes are supplied; the
/// claimed size itself is validated by the caller against its configured
/// maximum.
pub fn frame_size(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_SIZE {
        return None;
    }
    let size = u32::from_be_bytes(
        header[SIZE_OFFSET..SIZE_OFFSET + 4]
            .try_into()
            .expect("slice is exactly four bytes"),
    );
    Some(size as usize)
}

/// Builds the response frame delivered to a client whose queued command was
/// cancelled before it reached the TPM.
pub fn cancelled_response() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&TAG_NO_SESSIONS.to_be_bytes());
    buf.extend_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
    buf.extend_from_slice(&RC_CANCELLED.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    // TPM2_CC_GetRandom with no payload: tag 0x8001, size 12, cc 0x144.
    const GET_RANDOM: [u8; 12] = [
        0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x44, 0x00, 0x00,
    ];

    #[test]
    fn frame_size_reads_the_header_length_field() {
        assert_eq!(frame_size(&GET_RANDOM[..HEADER_SIZE]), Some(12));
        assert_eq!(frame_size(&GET_RANDOM), Some(12));
    }

    #[test]
    fn frame_size_requires_a_full_header() {
        assert_eq!(frame_size(&GET_RANDOM[..HEADER_SIZE - 1]), None);
        assert_eq!(frame_size(&[]), None);
    }

    #[test]
    fn cancelled_response_is_a_bare_header() {
        let resp = cancelled_response();
        assert_eq!(resp.len(), HEADER_SIZE);
        assert_eq!(frame_size(&resp), Some(HEADER_SIZE));
        assert_eq!(&resp[..2], &TAG_NO_SESSIONS.to_be_bytes());
        assert_eq!(&resp[6..10], &RC_CANCELLED.to_be_bytes());
    }
}
