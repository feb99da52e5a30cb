//! Zigbee security: auxiliary header, CCM* (ENC-MIC-32), AES-MMO hashing.
//!
//! Frames are always secured at level 5 (encryption with a 4-byte MIC). On the
//! air the level bits of the security control byte are zero; the real level is
//! substituted when building the nonce and the authenticated data.

use crate::error::{ensure, WireError};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ccm::aead::AeadInPlace;
use ccm::consts::{U13, U4};
use ccm::Ccm;
use serde::{Deserialize, Serialize};

/// Symmetric key size
pub const KEY_SIZE: usize = 16;
/// MIC length at security level 5
pub const MIC_SIZE: usize = 4;
/// CCM nonce length
pub const NONCE_SIZE: usize = 13;
/// ENC-MIC-32
pub const SECURITY_LEVEL: u8 = 5;
/// Default global Trust Center link key ("ZigBeeAlliance09")
pub const WELL_KNOWN_TC_LINK_KEY: [u8; KEY_SIZE] = *b"ZigBeeAlliance09";

/// 128-bit key
pub type Key = [u8; KEY_SIZE];

type ZigbeeCcm = Ccm<Aes128, U4, U13>;

/// Key identifier of the auxiliary header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyIdentifier {
    /// Link key (APS data key)
    Data = 0,
    /// Network key
    Network = 1,
    /// Key-transport key derived from the link key
    KeyTransport = 2,
    /// Key-load key derived from the link key
    KeyLoad = 3,
}

impl From<u8> for KeyIdentifier {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0 => KeyIdentifier::Data,
            1 => KeyIdentifier::Network,
            2 => KeyIdentifier::KeyTransport,
            _ => KeyIdentifier::KeyLoad,
        }
    }
}

/// Security control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityControl {
    /// Security level
    pub level: u8,
    /// Key identifier
    pub key_id: KeyIdentifier,
    /// Source address present in the auxiliary header
    pub extended_nonce: bool,
}

impl SecurityControl {
    /// Pack with the given level
    pub fn pack_with_level(&self, level: u8) -> u8 {
        (level & 0x07) | ((self.key_id as u8) << 3) | ((self.extended_nonce as u8) << 5)
    }

    /// Unpack from the wire
    pub fn unpack(value: u8) -> Self {
        Self {
            level: value & 0x07,
            key_id: KeyIdentifier::from(value >> 3),
            extended_nonce: value & 0x20 != 0,
        }
    }
}

/// Auxiliary security header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxSecurityHeader {
    /// Security control
    pub control: SecurityControl,
    /// Outgoing frame counter of the sender
    pub frame_counter: u32,
    /// Sender address (present with extended nonce)
    pub source64: Option<u64>,
    /// Network key sequence number (network key only)
    pub key_sequence: Option<u8>,
}

impl AuxSecurityHeader {
    /// Header for a frame secured with the network key
    pub fn network(frame_counter: u32, source64: u64, key_sequence: u8) -> Self {
        Self {
            control: SecurityControl {
                level: SECURITY_LEVEL,
                key_id: KeyIdentifier::Network,
                extended_nonce: true,
            },
            frame_counter,
            source64: Some(source64),
            key_sequence: Some(key_sequence),
        }
    }

    /// Header for an APS frame secured with a link key or one of its derivations
    pub fn link(key_id: KeyIdentifier, frame_counter: u32, source64: Option<u64>) -> Self {
        Self {
            control: SecurityControl {
                level: SECURITY_LEVEL,
                key_id,
                extended_nonce: source64.is_some(),
            },
            frame_counter,
            source64,
            key_sequence: None,
        }
    }

    fn encode_with_level(&self, buf: &mut BytesMut, level: u8) {
        let mut control = self.control;
        control.extended_nonce = self.source64.is_some();
        buf.put_u8(control.pack_with_level(level));
        buf.put_u32_le(self.frame_counter);
        if let Some(source64) = self.source64 {
            buf.put_u64_le(source64);
        }
        if self.control.key_id == KeyIdentifier::Network {
            buf.put_u8(self.key_sequence.unwrap_or_default());
        }
    }

    /// Encode as sent over the air (level bits cleared)
    pub fn encode(&self, buf: &mut BytesMut) {
        self.encode_with_level(buf, 0);
    }

    /// Decode from the wire
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 5)?;
        let control = SecurityControl::unpack(buf.get_u8());
        let frame_counter = buf.get_u32_le();
        let source64 = if control.extended_nonce {
            ensure(buf, 8)?;
            Some(buf.get_u64_le())
        } else {
            None
        };
        let key_sequence = if control.key_id == KeyIdentifier::Network {
            ensure(buf, 1)?;
            Some(buf.get_u8())
        } else {
            None
        };

        Ok(Self {
            control,
            frame_counter,
            source64,
            key_sequence,
        })
    }

    /// CCM nonce: source address, frame counter, security control at the real level
    pub fn nonce(&self, source64: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&source64.to_le_bytes());
        nonce[8..12].copy_from_slice(&self.frame_counter.to_le_bytes());
        let mut control = self.control;
        control.extended_nonce = self.source64.is_some();
        nonce[12] = control.pack_with_level(SECURITY_LEVEL);
        nonce
    }

    /// Authenticated data: the layer header followed by this header at the real level
    fn authenticated_data(&self, header: &[u8]) -> BytesMut {
        let mut aad = BytesMut::with_capacity(header.len() + 14);
        aad.put_slice(header);
        self.encode_with_level(&mut aad, SECURITY_LEVEL);
        aad
    }
}

/// Encrypt `payload` and append the MIC
pub fn ccm_encrypt(
    key: &Key,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let cipher = ZigbeeCcm::new(GenericArray::from_slice(key));
    let mut buffer = payload.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, &mut buffer)
        .map_err(|_| WireError::Security("CCM encryption failed"))?;
    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

/// Verify the trailing MIC and decrypt
pub fn ccm_decrypt(
    key: &Key,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    secured: &[u8],
) -> Result<Vec<u8>, WireError> {
    if secured.len() < MIC_SIZE {
        return Err(WireError::Incomplete {
            needed: MIC_SIZE,
            available: secured.len(),
        });
    }
    let (ciphertext, mic) = secured.split_at(secured.len() - MIC_SIZE);
    let cipher = ZigbeeCcm::new(GenericArray::from_slice(key));
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            &mut buffer,
            GenericArray::from_slice(mic),
        )
        .map_err(|_| WireError::Mic)?;
    Ok(buffer)
}

/// Secure a layer payload.
///
/// Returns the auxiliary header (level cleared) followed by the ciphertext and
/// MIC, ready to be appended after `header`.
pub fn secure_payload(
    header: &[u8],
    aux: &AuxSecurityHeader,
    nonce_source64: u64,
    key: &Key,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    let aad = aux.authenticated_data(header);
    let secured = ccm_encrypt(key, &aux.nonce(nonce_source64), &aad, payload)?;

    let mut out = BytesMut::with_capacity(14 + secured.len());
    aux.encode(&mut out);
    out.put_slice(&secured);
    Ok(out.freeze())
}

/// Verify and decrypt a layer payload whose auxiliary header was already decoded
pub fn unsecure_payload(
    header: &[u8],
    aux: &AuxSecurityHeader,
    nonce_source64: u64,
    key: &Key,
    secured: &[u8],
) -> Result<Bytes, WireError> {
    let aad = aux.authenticated_data(header);
    ccm_decrypt(key, &aux.nonce(nonce_source64), &aad, secured).map(Bytes::from)
}

/// Matyas-Meyer-Oseas hash over AES-128 with Zigbee padding (messages under 2^16 bits)
pub fn aes_mmo_hash(data: &[u8]) -> Key {
    debug_assert!(data.len() < 0x2000);
    let bit_len = (data.len() * 8) as u16;

    let mut padded = Vec::with_capacity(data.len() + 18);
    padded.extend_from_slice(data);
    padded.push(0x80);
    while padded.len() % 16 != 14 {
        padded.push(0x00);
    }
    padded.extend_from_slice(&bit_len.to_be_bytes());

    let mut hash = [0u8; KEY_SIZE];
    for block in padded.chunks(16) {
        let cipher = Aes128::new(GenericArray::from_slice(&hash));
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        for (h, (o, m)) in hash.iter_mut().zip(out.iter().zip(block)) {
            *h = o ^ m;
        }
    }
    hash
}

/// Keyed hash (HMAC over AES-MMO) of a single byte
pub fn keyed_hash(key: &Key, input: u8) -> Key {
    let mut inner = Vec::with_capacity(KEY_SIZE + 1);
    inner.extend(key.iter().map(|b| b ^ 0x36));
    inner.push(input);
    let inner_hash = aes_mmo_hash(&inner);

    let mut outer = Vec::with_capacity(KEY_SIZE * 2);
    outer.extend(key.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_hash);
    aes_mmo_hash(&outer)
}

/// Key used for APS frames with the key-transport key identifier
pub fn key_transport_key(link_key: &Key) -> Key {
    keyed_hash(link_key, 0x00)
}

/// Key used for APS frames with the key-load key identifier
pub fn key_load_key(link_key: &Key) -> Key {
    keyed_hash(link_key, 0x02)
}

/// Hash a device returns in VERIFY_KEY for `link_key`
pub fn verify_key_hash(link_key: &Key) -> Key {
    keyed_hash(link_key, 0x03)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aux_header_over_the_air_level_is_zero() {
        let aux = AuxSecurityHeader::network(0x01020304, 0x1122334455667788, 7);
        let mut buf = BytesMut::new();
        aux.encode(&mut buf);
        assert_eq!(buf[0], 0x28);
        assert_eq!(&buf[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf.len(), 14);

        let decoded = AuxSecurityHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.control.level, 0);
        assert_eq!(decoded.control.key_id, KeyIdentifier::Network);
        assert_eq!(decoded.source64, Some(0x1122334455667788));
        assert_eq!(decoded.key_sequence, Some(7));
    }

    #[test]
    fn test_nonce_layout() {
        let aux = AuxSecurityHeader::link(KeyIdentifier::KeyTransport, 1, Some(0xaabb));
        let nonce = aux.nonce(0xaabb);
        assert_eq!(&nonce[..8], &[0xbb, 0xaa, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&nonce[8..12], &[1, 0, 0, 0]);
        assert_eq!(nonce[12], 0x35);
    }

    #[test]
    fn test_secure_and_unsecure_payload() {
        let key = [0x42u8; KEY_SIZE];
        let header = [0x08, 0x02, 0x34, 0x12, 0x00, 0x00, 0x1e, 0x05];
        let aux = AuxSecurityHeader::network(10, 0x0102030405060708, 0);

        let secured = secure_payload(&header, &aux, 0x0102030405060708, &key, b"hello zigbee").unwrap();
        let mut body = secured.clone();
        let decoded = AuxSecurityHeader::decode(&mut body).unwrap();
        assert_eq!(body.len(), 12 + MIC_SIZE);

        let plain = unsecure_payload(&header, &decoded, 0x0102030405060708, &key, &body).unwrap();
        assert_eq!(&plain[..], b"hello zigbee");
    }

    #[test]
    fn test_tampered_header_fails_mic() {
        let key = [0x42u8; KEY_SIZE];
        let header = [0x08, 0x02, 0x34, 0x12];
        let aux = AuxSecurityHeader::network(10, 1, 0);
        let mut body = secure_payload(&header, &aux, 1, &key, b"payload").unwrap();
        let decoded = AuxSecurityHeader::decode(&mut body).unwrap();

        let tampered = [0x08, 0x02, 0x35, 0x12];
        assert_eq!(
            unsecure_payload(&tampered, &decoded, 1, &key, &body).unwrap_err(),
            WireError::Mic
        );
        let wrong_key = [0x43u8; KEY_SIZE];
        assert_eq!(
            unsecure_payload(&header, &decoded, 1, &wrong_key, &body).unwrap_err(),
            WireError::Mic
        );
    }

    #[test]
    fn test_mmo_padding_boundaries() {
        // 14 bytes of data forces a second padding block
        let a = aes_mmo_hash(&[0u8; 13]);
        let b = aes_mmo_hash(&[0u8; 14]);
        assert_ne!(a, b);
        assert_eq!(aes_mmo_hash(&[0u8; 14]), b);
    }

    #[test]
    fn test_derived_keys_are_distinct() {
        let transport = key_transport_key(&WELL_KNOWN_TC_LINK_KEY);
        let load = key_load_key(&WELL_KNOWN_TC_LINK_KEY);
        let verify = verify_key_hash(&WELL_KNOWN_TC_LINK_KEY);
        assert_ne!(transport, load);
        assert_ne!(transport, verify);
        assert_ne!(transport, WELL_KNOWN_TC_LINK_KEY);
        assert_eq!(transport, keyed_hash(&WELL_KNOWN_TC_LINK_KEY, 0x00));
    }
}
