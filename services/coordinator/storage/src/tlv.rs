//! Tag-length-value codec for the persisted state record.
//!
//! ```text
//! +------+----------------------+-------------+
//! | tag  | len (1 or 2 bytes)   | value       |
//! +------+----------------------+-------------+
//! ```
//!
//! Lengths under 128 take one byte; longer values use two bytes with the top
//! bit of the first byte set. A CHECKSUM record carries the CRC-32 of every
//! byte before it and the record is terminated by END.

use crate::{
    NetworkParameters, PersistedDevice, PersistedLinkKey, PersistedRoute, PersistedState,
    StorageError,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use tracing::debug;

/// Current record version
pub const STATE_VERSION: u8 = 1;

const MAX_VALUE_LEN: usize = 0x7fff;

mod tag {
    pub const VERSION: u8 = 0x01;
    pub const EUI64: u8 = 0x02;
    pub const PAN_ID: u8 = 0x03;
    pub const EXTENDED_PAN_ID: u8 = 0x04;
    pub const CHANNEL: u8 = 0x05;
    pub const NWK_UPDATE_ID: u8 = 0x06;
    pub const TX_POWER: u8 = 0x07;
    pub const NETWORK_KEY: u8 = 0x08;
    pub const NETWORK_KEY_FRAME_COUNTER: u8 = 0x09;
    pub const NETWORK_KEY_SEQUENCE: u8 = 0x0a;
    pub const TC_KEY: u8 = 0x0b;
    pub const TC_KEY_FRAME_COUNTER: u8 = 0x0c;
    pub const DEVICE: u8 = 0x0d;
    pub const APP_LINK_KEY: u8 = 0x0e;
    pub const CHECKSUM: u8 = 0xfe;
    pub const END: u8 = 0xff;

    pub mod device {
        pub const ADDRESS64: u8 = 0x01;
        pub const ADDRESS16: u8 = 0x02;
        pub const CAPABILITIES: u8 = 0x03;
        pub const AUTHORIZED: u8 = 0x04;
        pub const NEIGHBOR: u8 = 0x05;
        pub const LAST_KEY_SEQUENCE: u8 = 0x06;
        pub const SOURCE_ROUTE: u8 = 0x07;
        pub const INCOMING_FRAME_COUNTER: u8 = 0x08;
        pub const PARENT: u8 = 0x09;
    }

    pub mod route {
        pub const PATH_COST: u8 = 0x01;
        pub const RELAYS: u8 = 0x02;
        pub const LAST_UPDATED: u8 = 0x03;
    }

    pub mod link_key {
        pub const DEVICE_A: u8 = 0x01;
        pub const DEVICE_B: u8 = 0x02;
        pub const KEY: u8 = 0x03;
    }
}

struct TlvWriter {
    buf: BytesMut,
}

impl TlvWriter {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    fn put(&mut self, tag: u8, value: &[u8]) -> Result<(), StorageError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(StorageError::Invalid(format!(
                "TLV value for tag 0x{:02x} too long: {} bytes",
                tag,
                value.len()
            )));
        }
        self.buf.put_u8(tag);
        if value.len() < 0x80 {
            self.buf.put_u8(value.len() as u8);
        } else {
            self.buf.put_u8(0x80 | (value.len() >> 8) as u8);
            self.buf.put_u8((value.len() & 0xff) as u8);
        }
        self.buf.put_slice(value);
        Ok(())
    }

    fn put_u8(&mut self, tag: u8, value: u8) -> Result<(), StorageError> {
        self.put(tag, &[value])
    }

    fn put_u16(&mut self, tag: u8, value: u16) -> Result<(), StorageError> {
        self.put(tag, &value.to_le_bytes())
    }

    fn put_u32(&mut self, tag: u8, value: u32) -> Result<(), StorageError> {
        self.put(tag, &value.to_le_bytes())
    }

    fn put_u64(&mut self, tag: u8, value: u64) -> Result<(), StorageError> {
        self.put(tag, &value.to_le_bytes())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Read the next `(tag, value)` pair
fn next_tlv(buf: &mut Bytes) -> Result<Option<(u8, Bytes)>, StorageError> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    let tag = buf.get_u8();
    if tag == tag::END {
        return Ok(Some((tag, Bytes::new())));
    }
    if !buf.has_remaining() {
        return Err(StorageError::Corruption(format!(
            "Truncated length for tag 0x{:02x}",
            tag
        )));
    }
    let first = buf.get_u8();
    let len = if first & 0x80 == 0 {
        first as usize
    } else {
        if !buf.has_remaining() {
            return Err(StorageError::Corruption(format!(
                "Truncated length for tag 0x{:02x}",
                tag
            )));
        }
        (((first & 0x7f) as usize) << 8) | buf.get_u8() as usize
    };
    if buf.remaining() < len {
        return Err(StorageError::Corruption(format!(
            "Value for tag 0x{:02x} truncated: need {}, have {}",
            tag,
            len,
            buf.remaining()
        )));
    }
    Ok(Some((tag, buf.split_to(len))))
}

fn fixed<const N: usize>(value: &Bytes, field: &'static str) -> Result<[u8; N], StorageError> {
    value.as_ref().try_into().map_err(|_| {
        StorageError::Corruption(format!(
            "Field {} has length {}, expected {}",
            field,
            value.len(),
            N
        ))
    })
}

fn read_u8(value: &Bytes, field: &'static str) -> Result<u8, StorageError> {
    Ok(fixed::<1>(value, field)?[0])
}

fn read_u16(value: &Bytes, field: &'static str) -> Result<u16, StorageError> {
    Ok(u16::from_le_bytes(fixed(value, field)?))
}

fn read_u32(value: &Bytes, field: &'static str) -> Result<u32, StorageError> {
    Ok(u32::from_le_bytes(fixed(value, field)?))
}

fn read_u64(value: &Bytes, field: &'static str) -> Result<u64, StorageError> {
    Ok(u64::from_le_bytes(fixed(value, field)?))
}

/// Encode the full state, including checksum and end marker
pub fn encode_state(state: &PersistedState) -> Result<Bytes, StorageError> {
    let mut w = TlvWriter::new();
    let network = &state.network;

    w.put_u8(tag::VERSION, STATE_VERSION)?;
    w.put_u64(tag::EUI64, network.eui64)?;
    w.put_u16(tag::PAN_ID, network.pan_id)?;
    w.put_u64(tag::EXTENDED_PAN_ID, network.extended_pan_id)?;
    w.put_u8(tag::CHANNEL, network.channel)?;
    w.put_u8(tag::NWK_UPDATE_ID, network.update_id)?;
    w.put_u8(tag::TX_POWER, network.tx_power as u8)?;
    w.put(tag::NETWORK_KEY, &network.network_key)?;
    w.put_u32(tag::NETWORK_KEY_FRAME_COUNTER, network.network_key_frame_counter)?;
    w.put_u8(tag::NETWORK_KEY_SEQUENCE, network.network_key_sequence)?;
    w.put(tag::TC_KEY, &network.tc_key)?;
    w.put_u32(tag::TC_KEY_FRAME_COUNTER, network.tc_key_frame_counter)?;

    for device in &state.devices {
        let nested = encode_device(device)?;
        w.put(tag::DEVICE, &nested)?;
    }

    for link_key in &state.app_link_keys {
        let mut nested = TlvWriter::new();
        nested.put_u64(tag::link_key::DEVICE_A, link_key.device_a)?;
        nested.put_u64(tag::link_key::DEVICE_B, link_key.device_b)?;
        nested.put(tag::link_key::KEY, &link_key.key)?;
        w.put(tag::APP_LINK_KEY, &nested.finish())?;
    }

    let mut hasher = Hasher::new();
    hasher.update(&w.buf);
    let checksum = hasher.finalize();
    w.put_u32(tag::CHECKSUM, checksum)?;
    w.buf.put_u8(tag::END);

    Ok(w.finish())
}

fn encode_device(device: &PersistedDevice) -> Result<Bytes, StorageError> {
    let mut w = TlvWriter::new();
    w.put_u64(tag::device::ADDRESS64, device.address64)?;
    w.put_u16(tag::device::ADDRESS16, device.address16)?;
    w.put_u8(tag::device::CAPABILITIES, device.capabilities)?;
    w.put_u8(tag::device::AUTHORIZED, device.authorized as u8)?;
    w.put_u8(tag::device::NEIGHBOR, device.neighbor as u8)?;
    if let Some(sequence) = device.last_key_sequence {
        w.put_u8(tag::device::LAST_KEY_SEQUENCE, sequence)?;
    }
    for route in &device.routes {
        let mut nested = TlvWriter::new();
        nested.put_u8(tag::route::PATH_COST, route.path_cost)?;
        let mut relays = BytesMut::with_capacity(route.relays.len() * 2);
        for relay in &route.relays {
            relays.put_u16_le(*relay);
        }
        nested.put(tag::route::RELAYS, &relays)?;
        nested.put_u64(tag::route::LAST_UPDATED, route.last_updated_ms)?;
        w.put(tag::device::SOURCE_ROUTE, &nested.finish())?;
    }
    if let Some(counter) = device.incoming_frame_counter {
        w.put_u32(tag::device::INCOMING_FRAME_COUNTER, counter)?;
    }
    if let Some(parent16) = device.parent16 {
        w.put_u16(tag::device::PARENT, parent16)?;
    }
    Ok(w.finish())
}

/// Decode a state record; unknown tags are skipped
pub fn decode_state(data: Bytes) -> Result<PersistedState, StorageError> {
    let mut buf = data.clone();

    let mut version = None;
    let mut eui64 = None;
    let mut pan_id = None;
    let mut extended_pan_id = None;
    let mut channel = None;
    let mut update_id = 0;
    let mut tx_power = 0i8;
    let mut network_key = None;
    let mut network_key_frame_counter = 0;
    let mut network_key_sequence = 0;
    let mut tc_key = None;
    let mut tc_key_frame_counter = 0;
    let mut devices = Vec::new();
    let mut app_link_keys = Vec::new();
    let mut terminated = false;

    loop {
        let offset = data.len() - buf.remaining();
        let Some((tag, value)) = next_tlv(&mut buf)? else {
            break;
        };

        match tag {
            tag::VERSION => version = Some(read_u8(&value, "version")?),
            tag::EUI64 => eui64 = Some(read_u64(&value, "eui64")?),
            tag::PAN_ID => pan_id = Some(read_u16(&value, "pan_id")?),
            tag::EXTENDED_PAN_ID => extended_pan_id = Some(read_u64(&value, "extended_pan_id")?),
            tag::CHANNEL => channel = Some(read_u8(&value, "channel")?),
            tag::NWK_UPDATE_ID => update_id = read_u8(&value, "update_id")?,
            tag::TX_POWER => tx_power = read_u8(&value, "tx_power")? as i8,
            tag::NETWORK_KEY => network_key = Some(fixed::<16>(&value, "network_key")?),
            tag::NETWORK_KEY_FRAME_COUNTER => {
                network_key_frame_counter = read_u32(&value, "network_key_frame_counter")?
            }
            tag::NETWORK_KEY_SEQUENCE => {
                network_key_sequence = read_u8(&value, "network_key_sequence")?
            }
            tag::TC_KEY => tc_key = Some(fixed::<16>(&value, "tc_key")?),
            tag::TC_KEY_FRAME_COUNTER => {
                tc_key_frame_counter = read_u32(&value, "tc_key_frame_counter")?
            }
            tag::DEVICE => devices.push(decode_device(value)?),
            tag::APP_LINK_KEY => app_link_keys.push(decode_link_key(value)?),
            tag::CHECKSUM => {
                let expected = read_u32(&value, "checksum")?;
                let mut hasher = Hasher::new();
                hasher.update(&data[..offset]);
                let actual = hasher.finalize();
                if actual != expected {
                    return Err(StorageError::Corruption(format!(
                        "Checksum mismatch: stored {:08x}, computed {:08x}",
                        expected, actual
                    )));
                }
            }
            tag::END => {
                terminated = true;
                break;
            }
            other => debug!("Skipping unknown state tag 0x{:02x}", other),
        }
    }

    if !terminated {
        return Err(StorageError::Corruption("Missing end marker".to_string()));
    }

    let version = version.ok_or(StorageError::MissingField("version"))?;
    if version != STATE_VERSION {
        return Err(StorageError::Invalid(format!(
            "Unsupported state version {}",
            version
        )));
    }

    Ok(PersistedState {
        network: NetworkParameters {
            eui64: eui64.ok_or(StorageError::MissingField("eui64"))?,
            pan_id: pan_id.ok_or(StorageError::MissingField("pan_id"))?,
            extended_pan_id: extended_pan_id
                .ok_or(StorageError::MissingField("extended_pan_id"))?,
            channel: channel.ok_or(StorageError::MissingField("channel"))?,
            update_id,
            tx_power,
            network_key: network_key.ok_or(StorageError::MissingField("network_key"))?,
            network_key_frame_counter,
            network_key_sequence,
            tc_key: tc_key.ok_or(StorageError::MissingField("tc_key"))?,
            tc_key_frame_counter,
        },
        devices,
        app_link_keys,
    })
}

fn decode_device(mut buf: Bytes) -> Result<PersistedDevice, StorageError> {
    let mut address64 = None;
    let mut address16 = None;
    let mut device = PersistedDevice {
        address64: 0,
        address16: 0,
        capabilities: 0,
        authorized: false,
        neighbor: false,
        parent16: None,
        last_key_sequence: None,
        incoming_frame_counter: None,
        routes: Vec::new(),
    };

    while let Some((tag, value)) = next_tlv(&mut buf)? {
        match tag {
            tag::device::ADDRESS64 => address64 = Some(read_u64(&value, "device.address64")?),
            tag::device::ADDRESS16 => address16 = Some(read_u16(&value, "device.address16")?),
            tag::device::CAPABILITIES => {
                device.capabilities = read_u8(&value, "device.capabilities")?
            }
            tag::device::AUTHORIZED => device.authorized = read_u8(&value, "device.authorized")? != 0,
            tag::device::NEIGHBOR => device.neighbor = read_u8(&value, "device.neighbor")? != 0,
            tag::device::LAST_KEY_SEQUENCE => {
                device.last_key_sequence = Some(read_u8(&value, "device.last_key_sequence")?)
            }
            tag::device::SOURCE_ROUTE => device.routes.push(decode_route(value)?),
            tag::device::INCOMING_FRAME_COUNTER => {
                device.incoming_frame_counter =
                    Some(read_u32(&value, "device.incoming_frame_counter")?)
            }
            tag::device::PARENT => device.parent16 = Some(read_u16(&value, "device.parent16")?),
            other => debug!("Skipping unknown device tag 0x{:02x}", other),
        }
    }

    device.address64 = address64.ok_or(StorageError::MissingField("device.address64"))?;
    device.address16 = address16.ok_or(StorageError::MissingField("device.address16"))?;
    Ok(device)
}

fn decode_route(mut buf: Bytes) -> Result<PersistedRoute, StorageError> {
    let mut route = PersistedRoute {
        path_cost: 0,
        relays: Vec::new(),
        last_updated_ms: 0,
    };

    while let Some((tag, mut value)) = next_tlv(&mut buf)? {
        match tag {
            tag::route::PATH_COST => route.path_cost = read_u8(&value, "route.path_cost")?,
            tag::route::RELAYS => {
                if value.len() % 2 != 0 {
                    return Err(StorageError::Corruption(
                        "Odd relay list length".to_string(),
                    ));
                }
                while value.has_remaining() {
                    route.relays.push(value.get_u16_le());
                }
            }
            tag::route::LAST_UPDATED => {
                route.last_updated_ms = read_u64(&value, "route.last_updated")?
            }
            other => debug!("Skipping unknown route tag 0x{:02x}", other),
        }
    }

    Ok(route)
}

fn decode_link_key(mut buf: Bytes) -> Result<PersistedLinkKey, StorageError> {
    let mut device_a = None;
    let mut device_b = None;
    let mut key = None;

    while let Some((tag, value)) = next_tlv(&mut buf)? {
        match tag {
            tag::link_key::DEVICE_A => device_a = Some(read_u64(&value, "link_key.device_a")?),
            tag::link_key::DEVICE_B => device_b = Some(read_u64(&value, "link_key.device_b")?),
            tag::link_key::KEY => key = Some(fixed::<16>(&value, "link_key.key")?),
            other => debug!("Skipping unknown link key tag 0x{:02x}", other),
        }
    }

    Ok(PersistedLinkKey {
        device_a: device_a.ok_or(StorageError::MissingField("link_key.device_a"))?,
        device_b: device_b.ok_or(StorageError::MissingField("link_key.device_b"))?,
        key: key.ok_or(StorageError::MissingField("link_key.key"))?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_state() -> PersistedState {
        PersistedState {
            network: NetworkParameters {
                eui64: 0x00124b0001020304,
                pan_id: 0x1a62,
                extended_pan_id: 0xdddddddddddddddd,
                channel: 15,
                update_id: 2,
                tx_power: -3,
                network_key: [0x11; 16],
                network_key_frame_counter: 5000,
                network_key_sequence: 1,
                tc_key: *b"ZigBeeAlliance09",
                tc_key_frame_counter: 70,
            },
            devices: vec![PersistedDevice {
                address64: 0x0017880100aabbcc,
                address16: 0x4f21,
                capabilities: 0x8e,
                authorized: true,
                neighbor: false,
                parent16: Some(0x1111),
                last_key_sequence: Some(1),
                incoming_frame_counter: Some(1234),
                routes: vec![
                    PersistedRoute {
                        path_cost: 3,
                        relays: vec![0x1111, 0x2222],
                        last_updated_ms: 99_000,
                    },
                    PersistedRoute {
                        path_cost: 1,
                        relays: vec![],
                        last_updated_ms: 100_000,
                    },
                    PersistedRoute {
                        path_cost: 5,
                        relays: vec![0x3333, 0x4444, 0x5555],
                        last_updated_ms: 1,
                    },
                ],
            }],
            app_link_keys: vec![PersistedLinkKey {
                device_a: 1,
                device_b: 2,
                key: [0x77; 16],
            }],
        }
    }

    #[test]
    fn test_state_survives_encode_decode() {
        let state = sample_state();
        let encoded = encode_state(&state).unwrap();
        assert_eq!(encoded[encoded.len() - 1], tag::END);
        assert_eq!(decode_state(encoded).unwrap(), state);
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let state = sample_state();
        let device = &state.devices[0];

        let mut nested = TlvWriter::new();
        nested.put_u8(0x55, 9).unwrap();
        nested.buf.put_slice(&encode_device(device).unwrap());
        nested.put(0x66, &[1, 2, 3]).unwrap();

        let mut w = TlvWriter::new();
        w.put_u8(tag::VERSION, STATE_VERSION).unwrap();
        w.put(0x40, &[0xaa; 200]).unwrap();
        w.put_u64(tag::EUI64, state.network.eui64).unwrap();
        w.put_u16(tag::PAN_ID, state.network.pan_id).unwrap();
        w.put_u64(tag::EXTENDED_PAN_ID, state.network.extended_pan_id).unwrap();
        w.put_u8(tag::CHANNEL, state.network.channel).unwrap();
        w.put(tag::NETWORK_KEY, &state.network.network_key).unwrap();
        w.put(tag::TC_KEY, &state.network.tc_key).unwrap();
        w.put(tag::DEVICE, &nested.finish()).unwrap();
        w.put_u8(0x41, 0).unwrap();
        w.buf.put_u8(tag::END);

        let decoded = decode_state(w.finish()).unwrap();
        assert_eq!(decoded.devices, state.devices);
        assert_eq!(decoded.network.channel, 15);
        assert_eq!(decoded.network.network_key_frame_counter, 0);
    }

    #[test]
    fn test_device_parent_round_trip() {
        let mut device = sample_state().devices.remove(0);
        let decoded = decode_device(encode_device(&device).unwrap()).unwrap();
        assert_eq!(decoded.parent16, Some(0x1111));

        // records written before the parent was kept have no parent tag
        device.parent16 = None;
        let encoded = encode_device(&device).unwrap();
        assert_eq!(decode_device(encoded).unwrap().parent16, None);
    }

    #[test]
    fn test_long_values_use_two_byte_length() {
        let mut w = TlvWriter::new();
        w.put(0x40, &[0u8; 300]).unwrap();
        let encoded = w.finish();
        assert_eq!(&encoded[..3], &[0x40, 0x81, 0x2c]);

        let mut buf = encoded;
        let (tag, value) = next_tlv(&mut buf).unwrap().unwrap();
        assert_eq!(tag, 0x40);
        assert_eq!(value.len(), 300);
    }

    #[test]
    fn test_missing_mandatory_field() {
        let mut w = TlvWriter::new();
        w.put_u8(tag::VERSION, STATE_VERSION).unwrap();
        w.put_u64(tag::EUI64, 1).unwrap();
        w.buf.put_u8(tag::END);

        match decode_state(w.finish()) {
            Err(StorageError::MissingField(field)) => assert_eq!(field, "pan_id"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let encoded = encode_state(&sample_state()).unwrap();
        let mut corrupted = BytesMut::from(&encoded[..]);
        // channel value
        let channel_offset = encoded
            .windows(3)
            .position(|w| w == [tag::CHANNEL, 1, 15])
            .unwrap();
        corrupted[channel_offset + 2] = 20;

        assert!(matches!(
            decode_state(corrupted.freeze()),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let encoded = encode_state(&sample_state()).unwrap();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            decode_state(truncated),
            Err(StorageError::Corruption(_))
        ));
    }
}
