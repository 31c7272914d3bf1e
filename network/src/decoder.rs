//! Decodes treasury transactions into inbound requests
//!
//! Only jetton transfer notifications with a forward payload turn into
//! requests. Bounces, bare native transfers and comments are logged and
//! skipped; they are not errors.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info};

use crate::cell::{Cell, CellSlice};
use crate::error::{CellError, DecodeError};
use crate::protocol::{
    InboundRequest, LedgerTransaction, BOUNCE_PREFIX, OP_TEXT_COMMENT, OP_TRANSFER_NOTIFICATION,
};

/// Forward payload header: 32-bit op code plus 16-bit length
const PAYLOAD_HEADER_BITS: usize = 32 + 16;

#[derive(Debug, Clone, Default)]
pub struct MessageDecoder;

impl MessageDecoder {
    pub fn new() -> Self {
        Self
    }

    /// `Ok(None)` when the transaction carries nothing actionable
    pub fn decode(&self, tx: &LedgerTransaction) -> Result<Option<InboundRequest>, DecodeError> {
        let Some(msg) = &tx.in_msg else {
            debug!(lt = tx.lt, "No inbound message, skipping");
            return Ok(None);
        };

        if msg.bounced {
            debug!(lt = tx.lt, hash = %tx.hash, "↩️  Bounced message, skipping");
            return Ok(None);
        }

        if !msg.extra_currencies.is_empty() {
            info!(
                lt = tx.lt,
                currencies = ?msg.extra_currencies,
                "🪙 Transaction carries extra currencies"
            );
        }

        if msg.body.is_empty() {
            self.log_native(tx, msg.value);
            return Ok(None);
        }

        let body = Cell::from_boc(&msg.body)?;
        let mut slice = body.parse();
        if slice.remaining_bits() < 32 {
            self.log_native(tx, msg.value);
            return Ok(None);
        }

        match slice.load_u32()? {
            BOUNCE_PREFIX => {
                debug!(lt = tx.lt, "↩️  Bounce body, skipping");
                Ok(None)
            }
            OP_TRANSFER_NOTIFICATION => self.decode_notification(tx, slice),
            op => {
                if msg.value > 0 {
                    self.log_native(tx, msg.value);
                } else {
                    debug!(lt = tx.lt, op = op, "Unrecognized body, skipping");
                }
                Ok(None)
            }
        }
    }

    fn decode_notification(
        &self,
        tx: &LedgerTransaction,
        mut slice: CellSlice<'_>,
    ) -> Result<Option<InboundRequest>, DecodeError> {
        let query_id = slice.load_uint(64)?;
        let amount = slice.load_coins()?;
        let sender = slice
            .load_address()?
            .ok_or_else(|| CellError::InvalidAddress("notification without sender".to_string()))?;

        let mut forward = slice.load_either_ref()?;
        if forward.remaining_bits() < PAYLOAD_HEADER_BITS {
            info!(
                lt = tx.lt,
                sender = %sender,
                amount = amount,
                "📥 Jetton transfer without request payload"
            );
            return Ok(None);
        }

        let op_code = forward.load_u32()?;
        if op_code == OP_TEXT_COMMENT {
            info!(lt = tx.lt, sender = %sender, amount = amount, "📥 Jetton transfer with comment");
            return Ok(None);
        }

        let declared = forward.load_uint(16)? as usize;
        let mut text = forward.load_snake_bytes()?;
        if text.len() < declared {
            return Err(DecodeError::TruncatedPayload {
                declared,
                found: text.len(),
            });
        }
        text.truncate(declared);
        let payload = STANDARD.decode(&text)?;

        let token_wallet = tx.in_msg.as_ref().and_then(|m| m.source.clone());
        debug!(
            lt = tx.lt,
            op_code = op_code,
            sender = %sender,
            amount = amount,
            "Decoded transfer notification"
        );

        Ok(Some(InboundRequest {
            op_code,
            amount,
            sender: sender.to_string(),
            payload,
            query_id,
            token_wallet,
            tx_hash: tx.hash.clone(),
            lt: tx.lt,
        }))
    }

    fn log_native(&self, tx: &LedgerTransaction, value: u128) {
        if value > 0 {
            info!(
                lt = tx.lt,
                hash = %tx.hash,
                value = value,
                "💎 Native transfer received (no action taken)"
            );
        } else {
            debug!(lt = tx.lt, "Empty message, skipping");
        }
    }
}
