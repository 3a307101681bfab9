//! Signed transaction decoding: EIP-2718 envelope → sender, recipient, value.

use alloy_consensus::transaction::SignerRecoverable;
use alloy_consensus::{Transaction as _, TxEnvelope, TxType};
use alloy_eips::eip2718::Decodable2718;

use chainsync_core::{DecodeError, DecodedTransaction};

/// Decode `raw` and recover its signer.
///
/// Transactions without an embedded chain id (pre-EIP-155 legacy) are
/// accepted; any other chain id must equal `chain_id`.
pub fn decode_signed(raw: &[u8], chain_id: u64) -> Result<DecodedTransaction, DecodeError> {
    let Some(&first) = raw.first() else {
        return Err(DecodeError::Malformed("empty payload".into()));
    };
    // Bytes below 0x7f are EIP-2718 type ids; legacy RLP lists start at 0xc0.
    if first < 0x7f && TxType::try_from(first).is_err() {
        return Err(DecodeError::UnsupportedType(first));
    }

    let envelope = TxEnvelope::decode_2718(&mut &raw[..])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if let Some(found) = envelope.chain_id() {
        if found != chain_id {
            return Err(DecodeError::ChainIdMismatch {
                expected: chain_id,
                found,
            });
        }
    }

    let sender = envelope
        .recover_signer()
        .map_err(|e| DecodeError::InvalidSignature(e.to_string()))?;

    Ok(DecodedTransaction {
        sender: hex_prefixed(sender),
        recipient: envelope.to().map(hex_prefixed),
        nonce: envelope.nonce(),
        value: envelope.value().to_string(),
        input: hex_prefixed(envelope.input()),
    })
}

/// Lowercase `0x…` hex.
pub fn hex_prefixed(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::{SignableTransaction, Signed, TxEip1559, TxLegacy};
    use alloy_eips::eip2718::Encodable2718;
    use alloy_primitives::{address, Bytes, Signature, TxKind, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn signer() -> PrivateKeySigner {
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap()
    }

    fn sign_legacy(tx: TxLegacy) -> Vec<u8> {
        let sig = signer().sign_hash_sync(&tx.signature_hash()).unwrap();
        TxEnvelope::from(tx.into_signed(sig)).encoded_2718()
    }

    fn sign_1559(tx: TxEip1559) -> Vec<u8> {
        let sig = signer().sign_hash_sync(&tx.signature_hash()).unwrap();
        TxEnvelope::from(tx.into_signed(sig)).encoded_2718()
    }

    fn expected_sender() -> String {
        hex_prefixed(signer().address())
    }

    #[test]
    fn eip1559_transfer() {
        let raw = sign_1559(TxEip1559 {
            chain_id: 1,
            nonce: 42,
            gas_limit: 21_000,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            value: U256::from(1_500_000_000_000_000_000u128),
            ..Default::default()
        });

        let tx = decode_signed(&raw, 1).unwrap();
        assert_eq!(tx.sender, expected_sender());
        assert_eq!(
            tx.recipient.as_deref(),
            Some("0x00000000000000000000000000000000deadbeef")
        );
        assert_eq!(tx.nonce, 42);
        assert_eq!(tx.value, "1500000000000000000");
        assert_eq!(tx.input, "0x");
    }

    #[test]
    fn value_beyond_u64_is_kept() {
        let big = U256::from(u64::MAX) * U256::from(1_000u64);
        let raw = sign_1559(TxEip1559 {
            chain_id: 1,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            value: big,
            ..Default::default()
        });
        assert_eq!(decode_signed(&raw, 1).unwrap().value, big.to_string());
    }

    #[test]
    fn contract_creation_has_no_recipient() {
        let raw = sign_legacy(TxLegacy {
            chain_id: Some(5),
            nonce: 0,
            gas_price: 1,
            gas_limit: 1_000_000,
            to: TxKind::Create,
            input: Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]),
            ..Default::default()
        });
        let tx = decode_signed(&raw, 5).unwrap();
        assert_eq!(tx.recipient, None);
        assert_eq!(tx.input, "0x60806040");
        assert_eq!(tx.sender, expected_sender());
    }

    #[test]
    fn pre_eip155_legacy_is_accepted() {
        let raw = sign_legacy(TxLegacy {
            chain_id: None,
            gas_price: 1,
            gas_limit: 21_000,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            ..Default::default()
        });
        assert_eq!(decode_signed(&raw, 1).unwrap().sender, expected_sender());
    }

    #[test]
    fn wrong_chain_is_rejected() {
        let raw = sign_1559(TxEip1559 {
            chain_id: 10,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            ..Default::default()
        });
        assert_eq!(
            decode_signed(&raw, 1).unwrap_err(),
            DecodeError::ChainIdMismatch {
                expected: 1,
                found: 10
            }
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_signed(&[0xf8, 0x01, 0x02], 1),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(decode_signed(&[], 1), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn unknown_type_byte() {
        assert_eq!(
            decode_signed(&[0x7e, 0xc0], 1).unwrap_err(),
            DecodeError::UnsupportedType(0x7e)
        );
        assert_eq!(
            decode_signed(&[0x05, 0xc0], 1).unwrap_err(),
            DecodeError::UnsupportedType(0x05)
        );
    }

    #[test]
    fn truncated_known_type_is_malformed() {
        let raw = sign_1559(TxEip1559 {
            chain_id: 1,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            ..Default::default()
        });
        assert!(matches!(
            decode_signed(&raw[..raw.len() / 2], 1),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(decode_signed(&[0x02], 1), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn zero_signature_cannot_be_recovered() {
        let tx = TxEip1559 {
            chain_id: 1,
            to: TxKind::Call(address!("00000000000000000000000000000000deadbeef")),
            ..Default::default()
        };
        let sig = Signature::new(U256::ZERO, U256::ZERO, false);
        let raw = TxEnvelope::from(Signed::new_unchecked(tx, sig, Default::default())).encoded_2718();
        assert!(matches!(
            decode_signed(&raw, 1),
            Err(DecodeError::InvalidSignature(_))
        ));
    }
}
