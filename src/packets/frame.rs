//! Packet framing: the 16-byte segment header, the CRC trailer slot, the
//! escape encoding applied to every outbound packet, and the layout of
//! pre-framed PAK images.

use bitflags::bitflags;

use super::{FOOTER_SIZE, HEADER_SIZE, MSG_ESCAPE, TOTAL_PAYLOAD_SIZE};

bitflags! {
    /// Flag bits of the packet header's type byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketType: u8 {
        /// Set on every data packet.
        const DATA = 0x20;
        /// Set on the first segment of an image.
        const FIRST = 0x81;
        /// Set on the final segment of an image.
        const LAST = 0x10;
    }
}

/// Escape-encodes `buf` into `out`, replacing its previous contents. Each
/// occurrence of [`MSG_ESCAPE`] is doubled; the result is between `len` and
/// `2 * len` bytes long.
pub fn escape_into(out: &mut Vec<u8>, buf: &[u8]) {
    out.clear();
    out.reserve(buf.len() * 2);
    for &b in buf {
        if b == MSG_ESCAPE {
            out.push(MSG_ESCAPE);
        }
        out.push(b);
    }
}

/// Inverse of [`escape_into`]: collapses doubled escape bytes. Emulator-side
/// tooling uses this to recover the framed packet from the wire bytes.
pub fn unescape(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    let mut iter = buf.iter();
    while let Some(&b) = iter.next() {
        if b == MSG_ESCAPE {
            iter.next();
        }
        out.push(b);
    }
    out
}

/// Writes the 16-byte packet header into the front of `buf` and returns the
/// number of bytes written.
///
/// Layout: image id (24-bit big-endian), segment LSB, owner, tier, two
/// mystery bytes, the type byte, the full segment number (little-endian),
/// and the payload offset (big-endian).
pub fn init_pkthdr(buf: &mut [u8], image: u32, segment: u16, offset: u16, last: bool) -> usize {
    let mut ty = PacketType::DATA;
    if segment == 0 {
        ty |= PacketType::FIRST;
    }
    if last {
        ty |= PacketType::LAST;
    }

    buf[0] = (image >> 16) as u8;
    buf[1] = (image >> 8) as u8;
    buf[2] = image as u8;
    buf[3] = segment as u8;
    buf[4] = 0x01; /* owner */
    buf[5..9].copy_from_slice(&[0x7F, 0xFF, 0xFF, 0xFF]); /* tier */
    buf[9..11].copy_from_slice(&[0x7F, 0x80]);
    buf[11] = ty.bits();
    buf[12..14].copy_from_slice(&segment.to_le_bytes());
    buf[14..16].copy_from_slice(&offset.to_be_bytes());

    HEADER_SIZE
}

/// Stores the CRC trailer big-endian into the front of `buf` and returns the
/// number of bytes written.
pub fn set_crc(buf: &mut [u8], crc: u16) -> usize {
    buf[..FOOTER_SIZE].copy_from_slice(&crc.to_be_bytes());
    FOOTER_SIZE
}

/// Byte offset of `segment` inside a PAK image. Each stored segment is
/// preceded by a 2-byte length tag, hence the `2s + 2` term.
pub fn pak_offset(segment: u16) -> usize {
    segment as usize * TOTAL_PAYLOAD_SIZE + 2 * segment as usize + 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::NABU_CRC16;
    use crate::packets::{IMAGE_TIME, MAX_PAYLOAD_SIZE};

    #[test]
    fn escape_doubles_sentinel() {
        let mut out = Vec::new();
        escape_into(&mut out, &[0x01, 0x10, 0x02, 0x10]);
        assert_eq!(out, [0x01, 0x10, 0x10, 0x02, 0x10, 0x10]);
    }

    #[test]
    fn escape_round_trip() {
        let bufs: [&[u8]; 4] = [
            &[],
            &[0x10; 7],
            &[0x00, 0x10, 0xFF, 0x10, 0x10, 0x42],
            b"no escapes at all",
        ];
        for buf in bufs {
            let mut escaped = Vec::new();
            escape_into(&mut escaped, buf);
            assert!(escaped.len() >= buf.len());
            assert!(escaped.len() <= buf.len() * 2);
            assert_eq!(unescape(&escaped), buf);

            // Escaping is stable over a decode/encode cycle.
            let mut again = Vec::new();
            escape_into(&mut again, &unescape(&escaped));
            assert_eq!(again, escaped);
        }
    }

    #[test]
    fn header_layout() {
        let mut buf = [0u8; HEADER_SIZE];
        assert_eq!(init_pkthdr(&mut buf, 0x000001, 0, 0, false), HEADER_SIZE);
        assert_eq!(
            buf,
            [
                0x00, 0x00, 0x01, 0x00, 0x01, 0x7F, 0xFF, 0xFF, 0xFF, 0x7F, 0x80, 0xA1, 0x00,
                0x00, 0x00, 0x00
            ]
        );

        init_pkthdr(&mut buf, IMAGE_TIME, 0, 0, true);
        assert_eq!(&buf[0..3], &[0x7F, 0xFF, 0xFF]);
        assert_eq!(buf[11], 0xB1);

        init_pkthdr(&mut buf, 0x000001, 2, (2 * MAX_PAYLOAD_SIZE) as u16, true);
        assert_eq!(buf[3], 2);
        assert_eq!(buf[11], 0x30);
        assert_eq!(&buf[12..14], &[0x02, 0x00]);
        assert_eq!(&buf[14..16], &(1982u16).to_be_bytes());
    }

    #[test]
    fn crc_trailer_is_big_endian() {
        let mut buf = [0u8; FOOTER_SIZE];
        assert_eq!(set_crc(&mut buf, 0xD64E), FOOTER_SIZE);
        assert_eq!(buf, [0xD6, 0x4E]);
    }

    #[test]
    fn framed_packet_verifies() {
        let payload = b"rise and shine";
        let mut pkt = vec![0u8; HEADER_SIZE + payload.len() + FOOTER_SIZE];
        let mut i = init_pkthdr(&mut pkt, 0x000123, 0, 0, true);
        pkt[i..i + payload.len()].copy_from_slice(payload);
        i += payload.len();
        let crc = NABU_CRC16.checksum(&pkt[..i]);
        i += set_crc(&mut pkt[i..], crc);
        assert_eq!(i, pkt.len());

        let stored = u16::from_be_bytes([pkt[i - 2], pkt[i - 1]]);
        assert_eq!(NABU_CRC16.checksum(&pkt[..i - 2]), stored);
    }

    #[test]
    fn pak_offsets() {
        assert_eq!(pak_offset(0), 2);
        assert_eq!(pak_offset(1), 1013);
        assert_eq!(pak_offset(2), 2024);
    }
}
