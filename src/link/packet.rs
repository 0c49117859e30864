use crc::{Algorithm, Crc, Table};

/// Marks the start of every frame.
pub const INTRO: u8 = 0x07;
pub const HDR_LEN: usize = 6;
pub const TRAILER_LEN: usize = 4;
/// The length field is 12 bits wide.
pub const MAX_PAYLOAD: usize = 0x0fff;
/// Smallest packet size a peer may be forced down to when send slot
/// allocation fails.
pub const MIN_PACKET: usize = 200;

/// Payload checksum: the reflected 0xEDB88320 polynomial seeded with all
/// ones and, unlike the IEEE variant, no final XOR. Accumulating a digest
/// over the two ring spans of a wrapped payload matches a one-shot
/// computation over the joined bytes.
const CRC_ALG: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x340b_c6d9,
    residue: 0,
};

pub const PAYLOAD_CRC: Crc<u32, Table<16>> = Crc::<u32, Table<16>>::new(&CRC_ALG);

pub fn crc_spans(head: &[u8], tail: &[u8]) -> u32 {
    let mut digest = PAYLOAD_CRC.digest();
    digest.update(head);
    digest.update(tail);
    digest.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Sync = 1,
    Ack = 2,
    Nak = 3,
    Spos = 4,
    Close = 5,
}

impl PacketType {
    pub fn from_bits(bits: u8) -> Option<PacketType> {
        use PacketType::*;
        match bits {
            0 => Some(Data),
            1 => Some(Sync),
            2 => Some(Ack),
            3 => Some(Nak),
            4 => Some(Spos),
            5 => Some(Close),
            _ => None,
        }
    }

    /// Whether the local field carries a flow-controlled sequence number.
    pub fn sequenced(self) -> bool {
        matches!(self, PacketType::Data | PacketType::Spos | PacketType::Close)
    }
}

/// The six header bytes, unpacked.
///
/// ```text
/// offset 0   0x07
/// offset 1   llll lccc   local sequence, local channel
/// offset 2   rrrr rccc   remote sequence (piggybacked ack), remote channel
/// offset 3   ttts nnnn   type, caller bit, length high nibble
/// offset 4   nnnn nnnn   length low byte
/// offset 5   XOR of bytes 1..=4
/// ```
///
/// DATA, SPOS and CLOSE put their own sequence in the local field; NAK
/// puts the sequence it wants resent there; SYNC and ACK put 0. The
/// remote field of every packet acknowledges the latest contiguously
/// received sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub local: u8,
    pub local_chan: u8,
    pub remote: u8,
    pub remote_chan: u8,
    /// Raw three type bits; reserved values survive decoding.
    pub ptype: u8,
    pub caller: bool,
    pub len: usize,
}

impl Header {
    pub fn new(ptype: PacketType, local: u8, remote: u8, caller: bool, len: usize) -> Header {
        debug_assert!(len <= MAX_PAYLOAD);
        Header {
            local,
            local_chan: 0,
            remote,
            remote_chan: 0,
            ptype: ptype as u8,
            caller,
            len,
        }
    }

    pub fn encode(&self) -> [u8; HDR_LEN] {
        let mut ab = [0u8; HDR_LEN];
        ab[0] = INTRO;
        ab[1] = (self.local << 3) | (self.local_chan & 0x07);
        ab[2] = (self.remote << 3) | (self.remote_chan & 0x07);
        ab[3] = (self.ptype << 5)
            | if self.caller { 0x10 } else { 0 }
            | ((self.len >> 8) as u8 & 0x0f);
        ab[4] = self.len as u8;
        ab[5] = ab[1] ^ ab[2] ^ ab[3] ^ ab[4];
        ab
    }

    /// Unpack a header that already passed `check_ok`.
    pub fn decode(ab: &[u8; HDR_LEN]) -> Header {
        Header {
            local: ab[1] >> 3,
            local_chan: ab[1] & 0x07,
            remote: ab[2] >> 3,
            remote_chan: ab[2] & 0x07,
            ptype: ab[3] >> 5,
            caller: ab[3] & 0x10 != 0,
            len: ((ab[3] as usize & 0x0f) << 8) | ab[4] as usize,
        }
    }

    pub fn check_ok(ab: &[u8; HDR_LEN]) -> bool {
        ab[1] ^ ab[2] ^ ab[3] ^ ab[4] == ab[5]
    }
}
