use crate::error::{CodecError, ProtocolException};
use byteorder::{BigEndian, ByteOrder};
use crc::{CRC_16_MODBUS, Crc};

pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Header the BLE bridge prepends to every notification. Usually all zero,
/// some firmware echoes the framed request header instead.
pub const NOTIFY_PREAMBLE_LEN: usize = 8;

const FRAMED_HEADER_PREFIX: [u8; 4] = [0xFE, 0xFF, 0x03, 0xFE];

/// ASCII "----" written by the bridge when a request touches an unsupported register.
const REJECT_PATTERN: [u8; 4] = [0x2D; 4];

const EXCEPTION_FLAG: u8 = 0x80;
const MIN_FRAME_LEN: usize = 5;

/// Largest register count a single read request may carry.
pub const MAX_READ_COUNT: u16 = 125;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<FunctionCode> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// A checksummed protocol frame without the notification preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub unit_id: u8,
    pub function_code: FunctionCode,
    pub payload: Vec<u8>,
}

/// Outcome of decoding a frame that passed checksum validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Data(Pdu),
    Exception {
        unit_id: u8,
        function_code: u8,
        exception: ProtocolException,
    },
}

impl Pdu {
    #[must_use]
    pub const fn new(unit_id: u8, function_code: FunctionCode, payload: Vec<u8>) -> Self {
        Self {
            unit_id,
            function_code,
            payload,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.payload.len() + 2);
        frame.push(self.unit_id);
        frame.push(self.function_code as u8);
        frame.extend(&self.payload);
        let crc = MODBUS_CRC.checksum(&frame);
        frame.extend(&crc.to_le_bytes());
        frame
    }

    #[must_use]
    pub fn checksum(&self) -> u16 {
        let mut data = Vec::with_capacity(2 + self.payload.len());
        data.push(self.unit_id);
        data.push(self.function_code as u8);
        data.extend(&self.payload);
        MODBUS_CRC.checksum(&data)
    }

    /// Register values carried by a read-holding-registers response.
    pub fn register_values(&self) -> Result<Vec<u16>, CodecError> {
        let byte_count = *self
            .payload
            .first()
            .ok_or(CodecError::Truncated(self.payload.len()))? as usize;
        let data = self
            .payload
            .get(1..1 + byte_count)
            .ok_or(CodecError::Truncated(self.payload.len()))?;
        Ok(data.chunks_exact(2).map(BigEndian::read_u16).collect())
    }

    /// True when this frame is the echo of a write to `address` by `unit_id`.
    pub fn echoes(&self, unit_id: u8, function_code: FunctionCode, address: u16) -> bool {
        self.unit_id == unit_id
            && self.function_code == function_code
            && self.address_and_word().is_ok_and(|(a, _)| a == address)
    }

    /// `(address, count_or_value)` of a read request or a write echo.
    pub fn address_and_word(&self) -> Result<(u16, u16), CodecError> {
        let words = self
            .payload
            .get(..4)
            .ok_or(CodecError::Truncated(self.payload.len()))?;
        Ok((
            BigEndian::read_u16(&words[..2]),
            BigEndian::read_u16(&words[2..]),
        ))
    }
}

pub fn encode_read(unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    BigEndian::write_u16(&mut payload[..2], address);
    BigEndian::write_u16(&mut payload[2..], count);
    Pdu::new(unit_id, FunctionCode::ReadHoldingRegisters, payload.to_vec()).encode()
}

pub fn encode_write_single(unit_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    BigEndian::write_u16(&mut payload[..2], address);
    BigEndian::write_u16(&mut payload[2..], value);
    Pdu::new(unit_id, FunctionCode::WriteSingleRegister, payload.to_vec()).encode()
}

pub fn encode_write_multiple(unit_id: u8, address: u16, values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    Pdu::new(unit_id, FunctionCode::WriteMultipleRegisters, payload).encode()
}

/// Remove the notification preamble if the buffer carries one.
#[must_use]
pub fn strip_preamble(raw: &[u8]) -> &[u8] {
    if raw.len() <= NOTIFY_PREAMBLE_LEN {
        return raw;
    }
    let header = &raw[..NOTIFY_PREAMBLE_LEN];
    if header.iter().all(|&b| b == 0) || header.starts_with(&FRAMED_HEADER_PREFIX) {
        &raw[NOTIFY_PREAMBLE_LEN..]
    } else {
        raw
    }
}

pub fn decode(raw: &[u8]) -> Result<Decoded, CodecError> {
    let frame = strip_preamble(raw);

    // The reject marker carries no checksum.
    if frame.starts_with(&REJECT_PATTERN) {
        return Err(CodecError::Rejected);
    }

    if frame.len() < MIN_FRAME_LEN {
        return Err(CodecError::Truncated(frame.len()));
    }

    let (data, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = MODBUS_CRC.checksum(data);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let unit_id = data[0];
    let function_code_byte = data[1];

    if function_code_byte & EXCEPTION_FLAG != 0 {
        return Ok(Decoded::Exception {
            unit_id,
            function_code: function_code_byte & !EXCEPTION_FLAG,
            exception: ProtocolException::from_u8(data[2]),
        });
    }

    let function_code = FunctionCode::from_u8(function_code_byte)
        .ok_or(CodecError::UnknownFunction(function_code_byte))?;

    Ok(Decoded::Data(Pdu {
        unit_id,
        function_code,
        payload: data[2..].to_vec(),
    }))
}

/// Build a read response, as the device would send it.
pub fn encode_read_response(unit_id: u8, values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + values.len() * 2);
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    Pdu::new(unit_id, FunctionCode::ReadHoldingRegisters, payload).encode()
}

/// Build an exception response, as the device would send it.
pub fn encode_exception(unit_id: u8, function_code: u8, exception: ProtocolException) -> Vec<u8> {
    let mut frame = vec![unit_id, function_code | EXCEPTION_FLAG, exception.code()];
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend(&crc.to_le_bytes());
    frame
}
