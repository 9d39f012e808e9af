//! ILDCP: answering a peer's query for its own connection parameters.

use bytes::{BufMut, BytesMut};
use std::io::Read;
use streampay_packet::{oer, Address, Fulfill, FulfillBuilder, ParseError, Prepare};

/// The well-known destination for ILDCP queries.
pub const ILDCP_DESTINATION: &str = "peer.config";

/// ILDCP requests use the all-zero fulfillment, so the condition is fixed.
const PEER_PROTOCOL_FULFILLMENT: [u8; 32] = [0; 32];
static PEER_PROTOCOL_CONDITION: [u8; 32] = [
    102, 104, 122, 173, 248, 98, 189, 119, 108, 143, 193, 139, 142, 159, 142, 32, 8, 151, 20, 133,
    110, 226, 51, 179, 144, 42, 89, 29, 13, 95, 41, 37,
];

pub fn is_ildcp_request(prepare: &Prepare) -> bool {
    prepare.destination().as_str() == ILDCP_DESTINATION
        && prepare.execution_condition() == PEER_PROTOCOL_CONDITION
}

/// What we tell a peer about the account we gave it.
#[derive(Debug, Clone, PartialEq)]
pub struct IldcpResponse {
    pub client_address: Address,
    pub asset_scale: u8,
    pub asset_code: String,
}

impl IldcpResponse {
    pub fn to_fulfill(&self) -> Fulfill {
        let mut data = BytesMut::with_capacity(2 + self.client_address.len() + self.asset_code.len() + 2);
        oer::put_var_octet_string(&mut data, self.client_address.as_ref());
        data.put_u8(self.asset_scale);
        oer::put_var_octet_string(&mut data, self.asset_code.as_bytes());
        FulfillBuilder {
            fulfillment: &PEER_PROTOCOL_FULFILLMENT,
            data: &data,
        }
        .build()
    }

    pub fn from_fulfill(fulfill: &Fulfill) -> Result<Self, ParseError> {
        let mut reader = fulfill.data();
        let client_address = Address::new(&oer::read_var_octet_string(&mut reader)?)?;
        let mut scale = [0u8; 1];
        reader.read_exact(&mut scale)?;
        let asset_code =
            String::from_utf8_lossy(&oer::read_var_octet_string(&mut reader)?).to_string();
        Ok(IldcpResponse {
            client_address,
            asset_scale: scale[0],
            asset_code,
        })
    }
}
