//! Wire-level types for the treasury account's inbound traffic
//!
//! Covers the transactions delivered by the ledger feed, the jetton
//! transfer-notification layout, the forward payload that carries the
//! business request, and the normalized request handed to the application.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cell::{Cell, CellBuilder, MsgAddress};
use crate::error::CellResult;

/// `transfer_notification` sent by a jetton wallet to its owner
pub const OP_TRANSFER_NOTIFICATION: u32 = 0x7362_d09c;

/// Prefix of a bounced message body
pub const BOUNCE_PREFIX: u32 = 0xffff_ffff;

/// Plain text comment
pub const OP_TEXT_COMMENT: u32 = 0;

/// A confirmed transaction on the treasury account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: String,
    /// Logical time, strictly increasing per account
    pub lt: u64,
    pub utime: i64,
    pub in_msg: Option<InboundMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Immediate sender; for jetton deposits this is the treasury's jetton wallet
    pub source: Option<String>,
    /// Native currency attached, in nano units
    pub value: u128,
    /// Serialized BOC of the message body, empty when there is none
    pub body: Vec<u8>,
    pub bounced: bool,
    /// Auxiliary currency id to amount
    pub extra_currencies: BTreeMap<String, String>,
}

/// Request decoded from a transfer notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub op_code: u32,
    /// Jetton amount in base units
    pub amount: u128,
    /// End user who sent the jettons
    pub sender: String,
    /// Base64-decoded forward payload text
    pub payload: Vec<u8>,
    pub query_id: u64,
    /// Treasury jetton wallet that received the tokens
    pub token_wallet: Option<String>,
    pub tx_hash: String,
    pub lt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    CreatePool,
    AddReserve,
    CreateStake,
    PayCommission,
}

impl OperationType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(OperationType::CreatePool),
            2 => Some(OperationType::AddReserve),
            3 => Some(OperationType::CreateStake),
            4 => Some(OperationType::PayCommission),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            OperationType::CreatePool => 1,
            OperationType::AddReserve => 2,
            OperationType::CreateStake => 3,
            OperationType::PayCommission => 4,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::CreatePool => "create_pool",
            OperationType::AddReserve => "add_reserve",
            OperationType::CreateStake => "create_stake",
            OperationType::PayCommission => "pay_commission",
        };
        f.write_str(name)
    }
}

/// Normalized request forwarded to the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTransaction {
    pub operation_type: OperationType,
    pub amount: u128,
    pub payload: Vec<u8>,
    pub sender_addr: String,
    pub token_wallet: Option<String>,
    pub tx_hash: String,
    /// Logical time of the carrying transaction
    pub lt: u64,
}

impl SubmitTransaction {
    pub fn from_request(operation_type: OperationType, request: InboundRequest) -> Self {
        Self {
            operation_type,
            amount: request.amount,
            payload: request.payload,
            sender_addr: request.sender,
            token_wallet: request.token_wallet,
            tx_hash: request.tx_hash,
            lt: request.lt,
        }
    }
}

/// Forward payload: `op_code:uint32 len:uint16 base64_text`
pub fn build_forward_payload(op_code: u32, payload: &[u8]) -> CellResult<Cell> {
    let text = STANDARD.encode(payload);
    let mut builder = CellBuilder::new();
    builder
        .store_uint(op_code as u64, 32)?
        .store_uint(text.len() as u64, 16)?
        .store_snake_bytes(text.as_bytes())?;
    Ok(builder.build())
}

/// Transfer notification body as a jetton wallet would send it
///
/// The forward payload is stored in a reference when `inline` is false.
pub fn build_transfer_notification(
    query_id: u64,
    amount: u128,
    sender: &MsgAddress,
    forward_payload: Cell,
    inline: bool,
) -> CellResult<Cell> {
    let mut builder = CellBuilder::new();
    builder
        .store_uint(OP_TRANSFER_NOTIFICATION as u64, 32)?
        .store_uint(query_id, 64)?
        .store_coins(amount)?
        .store_address(Some(sender))?;

    if inline && forward_payload.bit_len() <= builder.bits_left().saturating_sub(1) {
        builder.store_bit(false)?;
        let mut slice = forward_payload.parse();
        while slice.remaining_bits() > 0 {
            builder.store_bit(slice.load_bit()?)?;
        }
        for child in forward_payload.refs() {
            builder.store_ref(child.as_ref().clone())?;
        }
    } else {
        builder.store_bit(true)?.store_ref(forward_payload)?;
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes() {
        for op in [
            OperationType::CreatePool,
            OperationType::AddReserve,
            OperationType::CreateStake,
            OperationType::PayCommission,
        ] {
            assert_eq!(OperationType::from_code(op.code()), Some(op));
        }
        assert_eq!(OperationType::from_code(0), None);
        assert_eq!(OperationType::from_code(99), None);
        assert_eq!(OperationType::CreateStake.to_string(), "create_stake");
    }

    #[test]
    fn test_forward_payload_layout() {
        let cell = build_forward_payload(3, br#"{"pool_id":7}"#).unwrap();
        let mut slice = cell.parse();
        assert_eq!(slice.load_u32().unwrap(), 3);
        let len = slice.load_uint(16).unwrap() as usize;
        let text = slice.load_snake_bytes().unwrap();
        assert_eq!(text.len(), len);
        assert_eq!(STANDARD.decode(&text).unwrap(), br#"{"pool_id":7}"#);
    }

    #[test]
    fn test_notification_falls_back_to_ref_when_too_large() {
        let sender = MsgAddress::new(0, [1; 32]);
        let forward = build_forward_payload(1, &[b'x'; 200]).unwrap();
        let cell = build_transfer_notification(1, 10, &sender, forward, true).unwrap();

        let mut slice = cell.parse();
        slice.skip_bits(32 + 64).unwrap();
        slice.load_coins().unwrap();
        slice.load_address().unwrap();
        assert!(slice.load_bit().unwrap(), "payload should be referenced");
    }
}
