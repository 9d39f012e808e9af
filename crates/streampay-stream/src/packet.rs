//! The STREAM packet and the frames this engine understands.
//!
//! Frames that are valid on the wire but irrelevant here (data streams, flow
//! control for data) are skipped on parse and never generated.

use crate::crypto::{decrypt, encrypt};
use bytes::BytesMut;
use std::convert::TryFrom;
use std::io::Read;
use streampay_packet::oer;
use streampay_packet::{Address, PacketType as IlpPacketType, ParseError};
use tracing::warn;

const STREAM_VERSION: u8 = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
enum FrameType {
    ConnectionClose = 0x01,
    ConnectionNewAddress = 0x02,
    ConnectionAssetDetails = 0x07,
    StreamClose = 0x10,
    StreamMoney = 0x11,
    StreamMaxMoney = 0x12,
}

/// Error codes carried by close frames.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum StreamErrorCode {
    NoError = 0x01,
    InternalError = 0x02,
    EndpointBusy = 0x03,
    ApplicationError = 0x09,
}

impl From<u8> for StreamErrorCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => StreamErrorCode::NoError,
            0x03 => StreamErrorCode::EndpointBusy,
            0x09 => StreamErrorCode::ApplicationError,
            _ => StreamErrorCode::InternalError,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Frame {
    ConnectionClose(ConnectionCloseFrame),
    ConnectionNewAddress(ConnectionNewAddressFrame),
    ConnectionAssetDetails(ConnectionAssetDetailsFrame),
    StreamClose(StreamCloseFrame),
    StreamMoney(StreamMoneyFrame),
    StreamMaxMoney(StreamMaxMoneyFrame),
    Unknown,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ConnectionCloseFrame {
    pub code: StreamErrorCode,
    pub message: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ConnectionNewAddressFrame {
    pub source_account: Address,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ConnectionAssetDetailsFrame {
    pub source_asset_code: String,
    pub source_asset_scale: u8,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StreamCloseFrame {
    pub stream_id: u64,
    pub code: StreamErrorCode,
    pub message: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StreamMoneyFrame {
    pub stream_id: u64,
    pub shares: u64,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StreamMaxMoneyFrame {
    pub stream_id: u64,
    pub receive_max: u64,
    pub total_received: u64,
}

/// A decrypted STREAM packet.
#[derive(Debug, PartialEq, Clone)]
pub struct StreamPacket {
    sequence: u64,
    ilp_packet_type: IlpPacketType,
    prepare_amount: u64,
    frames: Vec<Frame>,
}

pub struct StreamPacketBuilder<'a> {
    pub sequence: u64,
    pub ilp_packet_type: IlpPacketType,
    pub prepare_amount: u64,
    pub frames: &'a [Frame],
}

impl<'a> StreamPacketBuilder<'a> {
    pub fn build(&self) -> StreamPacket {
        StreamPacket {
            sequence: self.sequence,
            ilp_packet_type: self.ilp_packet_type,
            prepare_amount: self.prepare_amount,
            frames: self.frames.to_vec(),
        }
    }
}

impl StreamPacket {
    pub fn from_encrypted(shared_secret: &[u8], ciphertext: BytesMut) -> Result<Self, ParseError> {
        let decrypted = decrypt(shared_secret, ciphertext).map_err(|_| {
            ParseError::InvalidPacket("unable to decrypt STREAM packet".to_string())
        })?;
        StreamPacket::from_decrypted(&decrypted)
    }

    pub fn into_encrypted(self, shared_secret: &[u8]) -> BytesMut {
        encrypt(shared_secret, self.to_decrypted())
    }

    fn from_decrypted(buffer: &[u8]) -> Result<Self, ParseError> {
        let mut reader = buffer;
        let mut header = [0u8; 2];
        reader.read_exact(&mut header)?;
        if header[0] != STREAM_VERSION {
            return Err(ParseError::InvalidPacket(format!(
                "unsupported STREAM version: {}",
                header[0]
            )));
        }
        let ilp_packet_type = IlpPacketType::try_from(header[1])?;
        let sequence = oer::read_var_uint(&mut reader)?;
        let prepare_amount = oer::read_var_uint(&mut reader)?;
        let num_frames = oer::read_var_uint(&mut reader)?;

        let mut frames = Vec::with_capacity(num_frames as usize);
        for _ in 0..num_frames {
            let mut frame_type = [0u8; 1];
            reader.read_exact(&mut frame_type)?;
            let contents = oer::read_var_octet_string(&mut reader)?;
            frames.push(parse_frame(frame_type[0], &contents)?);
        }

        Ok(StreamPacket {
            sequence,
            ilp_packet_type,
            prepare_amount,
            frames,
        })
    }

    fn to_decrypted(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(64);
        buffer.extend_from_slice(&[STREAM_VERSION, self.ilp_packet_type as u8]);
        oer::put_var_uint(&mut buffer, self.sequence);
        oer::put_var_uint(&mut buffer, self.prepare_amount);
        let serializable = self
            .frames
            .iter()
            .filter(|frame| !matches!(frame, Frame::Unknown))
            .count();
        oer::put_var_uint(&mut buffer, serializable as u64);
        for frame in &self.frames {
            put_frame(&mut buffer, frame);
        }
        buffer
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ilp_packet_type(&self) -> IlpPacketType {
        self.ilp_packet_type
    }

    /// The amount the sender claims arrived (on responses: the amount that
    /// was credited to the receiver).
    pub fn prepare_amount(&self) -> u64 {
        self.prepare_amount
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

fn parse_frame(frame_type: u8, contents: &[u8]) -> Result<Frame, ParseError> {
    let mut reader = contents;
    let frame = match frame_type {
        t if t == FrameType::ConnectionClose as u8 => {
            let mut code = [0u8; 1];
            reader.read_exact(&mut code)?;
            let message = String::from_utf8_lossy(&oer::read_var_octet_string(&mut reader)?).to_string();
            Frame::ConnectionClose(ConnectionCloseFrame {
                code: StreamErrorCode::from(code[0]),
                message,
            })
        }
        t if t == FrameType::ConnectionNewAddress as u8 => {
            let source_account = Address::new(&oer::read_var_octet_string(&mut reader)?)?;
            Frame::ConnectionNewAddress(ConnectionNewAddressFrame { source_account })
        }
        t if t == FrameType::ConnectionAssetDetails as u8 => {
            let source_asset_code =
                String::from_utf8_lossy(&oer::read_var_octet_string(&mut reader)?).to_string();
            let mut scale = [0u8; 1];
            reader.read_exact(&mut scale)?;
            Frame::ConnectionAssetDetails(ConnectionAssetDetailsFrame {
                source_asset_code,
                source_asset_scale: scale[0],
            })
        }
        t if t == FrameType::StreamClose as u8 => {
            let stream_id = oer::read_var_uint(&mut reader)?;
            let mut code = [0u8; 1];
            reader.read_exact(&mut code)?;
            let message = String::from_utf8_lossy(&oer::read_var_octet_string(&mut reader)?).to_string();
            Frame::StreamClose(StreamCloseFrame {
                stream_id,
                code: StreamErrorCode::from(code[0]),
                message,
            })
        }
        t if t == FrameType::StreamMoney as u8 => {
            let stream_id = oer::read_var_uint(&mut reader)?;
            let shares = oer::read_var_uint(&mut reader)?;
            Frame::StreamMoney(StreamMoneyFrame { stream_id, shares })
        }
        t if t == FrameType::StreamMaxMoney as u8 => {
            let stream_id = oer::read_var_uint(&mut reader)?;
            let receive_max = oer::read_var_uint(&mut reader)?;
            let total_received = oer::read_var_uint(&mut reader)?;
            Frame::StreamMaxMoney(StreamMaxMoneyFrame {
                stream_id,
                receive_max,
                total_received,
            })
        }
        other => {
            warn!("Skipping unknown STREAM frame type: {:#04x}", other);
            Frame::Unknown
        }
    };
    Ok(frame)
}

fn put_frame(buffer: &mut BytesMut, frame: &Frame) {
    let mut contents = BytesMut::with_capacity(32);
    match frame {
        Frame::ConnectionClose(frame) => {
            buffer.extend_from_slice(&[FrameType::ConnectionClose as u8]);
            contents.extend_from_slice(&[frame.code as u8]);
            oer::put_var_octet_string(&mut contents, frame.message.as_bytes());
        }
        Frame::ConnectionNewAddress(frame) => {
            buffer.extend_from_slice(&[FrameType::ConnectionNewAddress as u8]);
            oer::put_var_octet_string(&mut contents, frame.source_account.as_ref());
        }
        Frame::ConnectionAssetDetails(frame) => {
            buffer.extend_from_slice(&[FrameType::ConnectionAssetDetails as u8]);
            oer::put_var_octet_string(&mut contents, frame.source_asset_code.as_bytes());
            contents.extend_from_slice(&[frame.source_asset_scale]);
        }
        Frame::StreamClose(frame) => {
            buffer.extend_from_slice(&[FrameType::StreamClose as u8]);
            oer::put_var_uint(&mut contents, frame.stream_id);
            contents.extend_from_slice(&[frame.code as u8]);
            oer::put_var_octet_string(&mut contents, frame.message.as_bytes());
        }
        Frame::StreamMoney(frame) => {
            buffer.extend_from_slice(&[FrameType::StreamMoney as u8]);
            oer::put_var_uint(&mut contents, frame.stream_id);
            oer::put_var_uint(&mut contents, frame.shares);
        }
        Frame::StreamMaxMoney(frame) => {
            buffer.extend_from_slice(&[FrameType::StreamMaxMoney as u8]);
            oer::put_var_uint(&mut contents, frame.stream_id);
            oer::put_var_uint(&mut contents, frame.receive_max);
            oer::put_var_uint(&mut contents, frame.total_received);
        }
        Frame::Unknown => return,
    }
    oer::put_var_octet_string(buffer, &contents);
}
