use crate::oer;
use crate::{Address, ErrorCode};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use std::convert::TryFrom;
use std::io::Read;
use std::time::SystemTime;
use thiserror::Error;

const CONDITION_LENGTH: usize = 32;
const FULFILLMENT_LENGTH: usize = 32;
const TIMESTAMP_LENGTH: usize = 17;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] crate::AddressError),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum PacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ParseError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            12 => Ok(PacketType::Prepare),
            13 => Ok(PacketType::Fulfill),
            14 => Ok(PacketType::Reject),
            other => Err(ParseError::UnknownPacketType(other)),
        }
    }
}

/// Any ILP packet.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, ParseError> {
        let mut reader = bytes;
        let type_byte = reader.read_u8()?;
        let contents = oer::read_var_octet_string(&mut reader)?;
        if !reader.is_empty() {
            return Err(ParseError::InvalidPacket(
                "trailing bytes after packet".to_string(),
            ));
        }
        match PacketType::try_from(type_byte)? {
            PacketType::Prepare => Ok(Packet::Prepare(Prepare::from_contents(&contents)?)),
            PacketType::Fulfill => Ok(Packet::Fulfill(Fulfill::from_contents(&contents)?)),
            PacketType::Reject => Ok(Packet::Reject(Reject::from_contents(&contents)?)),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        match self {
            Packet::Prepare(prepare) => prepare.to_bytes(),
            Packet::Fulfill(fulfill) => fulfill.to_bytes(),
            Packet::Reject(reject) => reject.to_bytes(),
        }
    }
}

fn write_envelope(packet_type: PacketType, contents: &[u8]) -> BytesMut {
    let mut buf =
        BytesMut::with_capacity(1 + oer::var_len_size(contents.len()) + contents.len());
    buf.put_u8(packet_type as u8);
    oer::put_var_octet_string(&mut buf, contents);
    buf
}

fn read_timestamp(reader: &mut impl Read) -> Result<SystemTime, ParseError> {
    let mut timestamp = [0u8; TIMESTAMP_LENGTH];
    reader.read_exact(&mut timestamp)?;
    let string = std::str::from_utf8(&timestamp)
        .map_err(|_| ParseError::InvalidPacket("timestamp is not UTF-8".to_string()))?;
    let parsed = Utc
        .datetime_from_str(string, TIMESTAMP_FORMAT)
        .map_err(|err| ParseError::InvalidPacket(format!("bad timestamp: {}", err)))?;
    Ok(parsed.into())
}

fn put_timestamp(buf: &mut BytesMut, time: SystemTime) {
    let datetime: DateTime<Utc> = time.into();
    buf.put_slice(datetime.format(TIMESTAMP_FORMAT).to_string().as_bytes());
}

/// An ILP Prepare packet: the request leg of a payment attempt.
#[derive(PartialEq, Clone)]
pub struct Prepare {
    amount: u64,
    expires_at: SystemTime,
    execution_condition: [u8; 32],
    destination: Address,
    data: Bytes,
}

impl Prepare {
    fn from_contents(contents: &[u8]) -> Result<Self, ParseError> {
        let mut reader = contents;
        let amount = reader.read_u64::<BigEndian>()?;
        let expires_at = read_timestamp(&mut reader)?;
        let mut execution_condition = [0u8; CONDITION_LENGTH];
        reader.read_exact(&mut execution_condition)?;
        let destination = Address::new(&oer::read_var_octet_string(&mut reader)?)?;
        let data = Bytes::from(oer::read_var_octet_string(&mut reader)?);
        Ok(Prepare {
            amount,
            expires_at,
            execution_condition,
            destination,
            data,
        })
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut contents = BytesMut::with_capacity(
            8 + TIMESTAMP_LENGTH + CONDITION_LENGTH + 2 + self.destination.len() + 8 + self.data.len(),
        );
        contents.put_u64(self.amount);
        put_timestamp(&mut contents, self.expires_at);
        contents.put_slice(&self.execution_condition);
        oer::put_var_octet_string(&mut contents, self.destination.as_ref());
        oer::put_var_octet_string(&mut contents, &self.data);
        write_envelope(PacketType::Prepare, &contents)
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn set_amount(&mut self, amount: u64) {
        self.amount = amount;
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn set_expires_at(&mut self, expires_at: SystemTime) {
        self.expires_at = expires_at;
    }

    pub fn execution_condition(&self) -> &[u8] {
        &self.execution_condition
    }

    pub fn destination(&self) -> Address {
        self.destination.clone()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Prepare {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Prepare")
            .field("destination", &self.destination)
            .field("amount", &self.amount)
            .field("expires_at", &DateTime::<Utc>::from(self.expires_at).to_rfc3339())
            .field("execution_condition", &hex::encode(&self.execution_condition))
            .field("data_length", &self.data.len())
            .finish()
    }
}

pub struct PrepareBuilder<'a> {
    pub amount: u64,
    pub expires_at: SystemTime,
    pub execution_condition: &'a [u8; 32],
    pub destination: Address,
    pub data: &'a [u8],
}

impl<'a> PrepareBuilder<'a> {
    pub fn build(&self) -> Prepare {
        Prepare {
            amount: self.amount,
            expires_at: self.expires_at,
            execution_condition: *self.execution_condition,
            destination: self.destination.clone(),
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// An ILP Fulfill packet: proof that the receiver accepted the payment.
#[derive(PartialEq, Clone)]
pub struct Fulfill {
    fulfillment: [u8; 32],
    data: Bytes,
}

impl Fulfill {
    fn from_contents(contents: &[u8]) -> Result<Self, ParseError> {
        let mut reader = contents;
        let mut fulfillment = [0u8; FULFILLMENT_LENGTH];
        reader.read_exact(&mut fulfillment)?;
        let data = Bytes::from(oer::read_var_octet_string(&mut reader)?);
        Ok(Fulfill { fulfillment, data })
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut contents = BytesMut::with_capacity(FULFILLMENT_LENGTH + 8 + self.data.len());
        contents.put_slice(&self.fulfillment);
        oer::put_var_octet_string(&mut contents, &self.data);
        write_envelope(PacketType::Fulfill, &contents)
    }

    pub fn fulfillment(&self) -> &[u8] {
        &self.fulfillment
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Fulfill {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fulfill")
            .field("fulfillment", &hex::encode(&self.fulfillment))
            .field("data_length", &self.data.len())
            .finish()
    }
}

pub struct FulfillBuilder<'a> {
    pub fulfillment: &'a [u8; 32],
    pub data: &'a [u8],
}

impl<'a> FulfillBuilder<'a> {
    pub fn build(&self) -> Fulfill {
        Fulfill {
            fulfillment: *self.fulfillment,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// An ILP Reject packet: a typed refusal from any node on the path.
#[derive(PartialEq, Clone)]
pub struct Reject {
    code: ErrorCode,
    triggered_by: Option<Address>,
    message: Bytes,
    data: Bytes,
}

impl Reject {
    fn from_contents(contents: &[u8]) -> Result<Self, ParseError> {
        let mut reader = contents;
        let mut code = [0u8; 3];
        reader.read_exact(&mut code)?;
        let triggered_by = oer::read_var_octet_string(&mut reader)?;
        let triggered_by = if triggered_by.is_empty() {
            None
        } else {
            Some(Address::new(&triggered_by)?)
        };
        let message = Bytes::from(oer::read_var_octet_string(&mut reader)?);
        let data = Bytes::from(oer::read_var_octet_string(&mut reader)?);
        Ok(Reject {
            code: ErrorCode::new(code),
            triggered_by,
            message,
            data,
        })
    }

    pub fn to_bytes(&self) -> BytesMut {
        let triggered_by = self
            .triggered_by
            .as_ref()
            .map(|address| address.as_ref())
            .unwrap_or(&[]);
        let mut contents =
            BytesMut::with_capacity(3 + 2 + triggered_by.len() + 8 + self.message.len() + 8 + self.data.len());
        contents.put_slice(self.code.as_ref());
        oer::put_var_octet_string(&mut contents, triggered_by);
        oer::put_var_octet_string(&mut contents, &self.message);
        oer::put_var_octet_string(&mut contents, &self.data);
        write_envelope(PacketType::Reject, &contents)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn triggered_by(&self) -> Option<&Address> {
        self.triggered_by.as_ref()
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reject")
            .field("code", &self.code)
            .field("triggered_by", &self.triggered_by)
            .field("message", &String::from_utf8_lossy(&self.message))
            .finish()
    }
}

pub struct RejectBuilder<'a> {
    pub code: ErrorCode,
    pub message: &'a [u8],
    pub triggered_by: Option<&'a Address>,
    pub data: &'a [u8],
}

impl<'a> RejectBuilder<'a> {
    pub fn build(&self) -> Reject {
        Reject {
            code: self.code,
            triggered_by: self.triggered_by.cloned(),
            message: Bytes::copy_from_slice(self.message),
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// The data payload carried by an F08 reject, telling the sender how far over
/// the cap it was.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MaxPacketAmountDetails {
    amount_received: u64,
    max_amount: u64,
}

impl MaxPacketAmountDetails {
    pub fn new(amount_received: u64, max_amount: u64) -> Self {
        MaxPacketAmountDetails {
            amount_received,
            max_amount,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = bytes;
        let amount_received = reader.read_u64::<BigEndian>()?;
        let max_amount = reader.read_u64::<BigEndian>()?;
        Ok(MaxPacketAmountDetails::new(amount_received, max_amount))
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.amount_received.to_be_bytes());
        bytes[8..].copy_from_slice(&self.max_amount.to_be_bytes());
        bytes
    }

    pub fn amount_received(&self) -> u64 {
        self.amount_received
    }

    pub fn max_amount(&self) -> u64 {
        self.max_amount
    }
}
