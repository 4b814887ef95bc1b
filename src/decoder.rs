//! Turns transactions into claim events.
//!
//! Claim scripts prefix an ordinary output script:
//!
//! ```text
//! OP_CLAIM_NAME    <name> <value>            OP_2DROP OP_DROP  <owner>
//! OP_UPDATE_CLAIM  <name> <claim_id> <value> OP_2DROP OP_2DROP <owner>
//! OP_SUPPORT_CLAIM <name> <claim_id>         OP_2DROP OP_DROP  <owner>
//! OP_SUPPORT_CLAIM <name> <claim_id> <value> OP_2DROP OP_2DROP <owner>
//! ```
//!
//! Anything that does not match exactly is a plain payment.
use bitcoin::{
    script::{Instruction, Script},
    OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};

use crate::trie::ClaimHash;

/// Opcode starting a new claim.
pub const OP_CLAIM_NAME: u8 = 0xb5;
/// Opcode starting a support.
pub const OP_SUPPORT_CLAIM: u8 = 0xb6;
/// Opcode starting a claim update.
pub const OP_UPDATE_CLAIM: u8 = 0xb7;
const OP_2DROP: u8 = 0x6d;
const OP_DROP: u8 = 0x75;

/// Claim-relevant effect of a transaction, in input-then-output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    /// An input spending `OutPoint`. Could be a claim, a support, or nothing we track.
    Spend(OutPoint),
    /// New claim.
    Create {
        /// Output holding the claim.
        outpoint: OutPoint,
        /// Claimed name, raw bytes.
        name: Vec<u8>,
        /// Derived from `outpoint`.
        claim_hash: ClaimHash,
        /// Output value in satoshis.
        amount: u64,
        /// Script after the claim prefix.
        owner: ScriptBuf,
    },
    /// Update of an existing claim.
    Update {
        /// New output holding the claim.
        outpoint: OutPoint,
        /// Claimed name, raw bytes.
        name: Vec<u8>,
        /// Claim being updated.
        claim_hash: ClaimHash,
        /// New amount in satoshis.
        amount: u64,
        /// Script after the claim prefix.
        owner: ScriptBuf,
    },
    /// Support for a claim.
    Support {
        /// Output holding the support.
        outpoint: OutPoint,
        /// Supported name, raw bytes.
        name: Vec<u8>,
        /// Claim being supported.
        claim_hash: ClaimHash,
        /// Output value in satoshis.
        amount: u64,
    },
}

/// Events of one transaction plus its place in the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTx {
    /// Transaction id.
    pub txid: Txid,
    /// Position in the block.
    pub tx_index: u32,
    /// Spends first, then claim outputs.
    pub events: Vec<ClaimEvent>,
}

impl DecodedTx {
    /// Outpoints spent by this transaction.
    pub fn spends(&self) -> impl Iterator<Item = &OutPoint> {
        self.events.iter().filter_map(|e| match e {
            ClaimEvent::Spend(op) => Some(op),
            _ => None,
        })
    }
}

/// Parsed claim prefix of an output script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimScript<'a> {
    /// `OP_CLAIM_NAME`.
    Name {
        /// Claimed name.
        name: &'a [u8],
        /// Claim metadata.
        value: &'a [u8],
    },
    /// `OP_UPDATE_CLAIM`.
    Update {
        /// Claimed name.
        name: &'a [u8],
        /// Claim being updated.
        claim_hash: ClaimHash,
        /// New metadata.
        value: &'a [u8],
    },
    /// `OP_SUPPORT_CLAIM`, with or without a value.
    Support {
        /// Supported name.
        name: &'a [u8],
        /// Claim being supported.
        claim_hash: ClaimHash,
        /// Optional payload.
        value: Option<&'a [u8]>,
    },
}

/// Split a script into its claim prefix and the owner script that follows.
pub fn parse_claim_script(script: &Script) -> Option<(ClaimScript<'_>, &Script)> {
    let mut instructions = script.instruction_indices();

    let opcode = match instructions.next()? {
        Ok((_, Instruction::Op(op))) => op.to_u8(),
        _ => return None,
    };
    if !matches!(opcode, OP_CLAIM_NAME | OP_SUPPORT_CLAIM | OP_UPDATE_CLAIM) {
        return None;
    }

    let mut pushes: Vec<&[u8]> = Vec::with_capacity(3);
    let first_drop = loop {
        match instructions.next()?.ok()? {
            (_, Instruction::PushBytes(bytes)) => pushes.push(bytes.as_bytes()),
            (_, Instruction::Op(op)) => break op.to_u8(),
        }
    };
    let (second_drop_at, second_drop) = match instructions.next()?.ok()? {
        (idx, Instruction::Op(op)) => (idx, op.to_u8()),
        _ => return None,
    };
    let expected = match pushes.len() {
        2 => [OP_2DROP, OP_DROP],
        3 => [OP_2DROP, OP_2DROP],
        _ => return None,
    };
    if [first_drop, second_drop] != expected {
        return None;
    }

    let parsed = match (opcode, pushes.as_slice()) {
        (OP_CLAIM_NAME, &[name, value]) => ClaimScript::Name { name, value },
        (OP_UPDATE_CLAIM, &[name, id, value]) => ClaimScript::Update {
            name,
            claim_hash: ClaimHash::from_slice(id)?,
            value,
        },
        (OP_SUPPORT_CLAIM, &[name, id]) => ClaimScript::Support {
            name,
            claim_hash: ClaimHash::from_slice(id)?,
            value: None,
        },
        (OP_SUPPORT_CLAIM, &[name, id, value]) => ClaimScript::Support {
            name,
            claim_hash: ClaimHash::from_slice(id)?,
            value: Some(value),
        },
        _ => return None,
    };

    let owner = Script::from_bytes(&script.as_bytes()[second_drop_at + 1..]);
    Some((parsed, owner))
}

/// Decode a single output into a claim event, if it is one.
pub fn decode_output(outpoint: OutPoint, txout: &TxOut) -> Option<ClaimEvent> {
    let (parsed, owner) = parse_claim_script(&txout.script_pubkey)?;
    let amount = txout.value.to_sat();
    Some(match parsed {
        ClaimScript::Name { name, .. } => ClaimEvent::Create {
            outpoint,
            name: name.to_vec(),
            claim_hash: ClaimHash::from_outpoint(&outpoint),
            amount,
            owner: owner.to_owned(),
        },
        ClaimScript::Update {
            name, claim_hash, ..
        } => ClaimEvent::Update {
            outpoint,
            name: name.to_vec(),
            claim_hash,
            amount,
            owner: owner.to_owned(),
        },
        ClaimScript::Support {
            name, claim_hash, ..
        } => ClaimEvent::Support {
            outpoint,
            name: name.to_vec(),
            claim_hash,
            amount,
        },
    })
}

/// Decode a transaction at position `tx_index` of its block. Pure.
pub fn decode_transaction(tx_index: u32, tx: &Transaction) -> DecodedTx {
    let txid = tx.compute_txid();
    let mut events = Vec::new();

    if !tx.is_coinbase() {
        events.extend(tx.input.iter().map(|i| ClaimEvent::Spend(i.previous_output)));
    }
    for (vout, txout) in tx.output.iter().enumerate() {
        let outpoint = OutPoint {
            txid,
            vout: vout as u32,
        };
        if let Some(event) = decode_output(outpoint, txout) {
            events.push(event);
        }
    }

    DecodedTx {
        txid,
        tx_index,
        events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        hashes::Hash,
        opcodes::{all::OP_RETURN, Opcode},
        script::{Builder, PushBytesBuf},
        Amount, WPubkeyHash,
    };

    fn push(bytes: &[u8]) -> PushBytesBuf {
        PushBytesBuf::try_from(bytes.to_vec()).unwrap()
    }

    fn owner() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([9u8; 20]))
    }

    fn with_owner(prefix: Builder) -> ScriptBuf {
        let mut bytes = prefix.into_script().into_bytes();
        bytes.extend_from_slice(owner().as_bytes());
        ScriptBuf::from_bytes(bytes)
    }

    #[test]
    fn parses_claim_name_and_owner() {
        let script = with_owner(
            Builder::new()
                .push_opcode(Opcode::from(OP_CLAIM_NAME))
                .push_slice(push(b"foo"))
                .push_slice(push(b"metadata"))
                .push_opcode(Opcode::from(OP_2DROP))
                .push_opcode(Opcode::from(OP_DROP)),
        );
        let (parsed, rest) = parse_claim_script(&script).unwrap();
        assert_eq!(
            parsed,
            ClaimScript::Name {
                name: b"foo",
                value: b"metadata"
            }
        );
        assert_eq!(rest, owner().as_script());
    }

    #[test]
    fn parses_support_with_and_without_value() {
        let id = [4u8; 20];
        let bare = with_owner(
            Builder::new()
                .push_opcode(Opcode::from(OP_SUPPORT_CLAIM))
                .push_slice(push(b"foo"))
                .push_slice(push(&id))
                .push_opcode(Opcode::from(OP_2DROP))
                .push_opcode(Opcode::from(OP_DROP)),
        );
        let valued = with_owner(
            Builder::new()
                .push_opcode(Opcode::from(OP_SUPPORT_CLAIM))
                .push_slice(push(b"foo"))
                .push_slice(push(&id))
                .push_slice(push(b"v"))
                .push_opcode(Opcode::from(OP_2DROP))
                .push_opcode(Opcode::from(OP_2DROP)),
        );
        assert!(matches!(
            parse_claim_script(&bare),
            Some((ClaimScript::Support { value: None, .. }, _))
        ));
        assert!(matches!(
            parse_claim_script(&valued),
            Some((ClaimScript::Support { value: Some(b"v"), .. }, _))
        ));
    }

    #[test]
    fn malformed_scripts_are_payments() {
        // wrong drop sequence
        let bad_drops = Builder::new()
            .push_opcode(Opcode::from(OP_CLAIM_NAME))
            .push_slice(push(b"foo"))
            .push_slice(push(b"v"))
            .push_opcode(Opcode::from(OP_DROP))
            .push_opcode(Opcode::from(OP_DROP))
            .into_script();
        // claim id of the wrong length
        let short_id = Builder::new()
            .push_opcode(Opcode::from(OP_UPDATE_CLAIM))
            .push_slice(push(b"foo"))
            .push_slice(push(&[1u8; 19]))
            .push_slice(push(b"v"))
            .push_opcode(Opcode::from(OP_2DROP))
            .push_opcode(Opcode::from(OP_2DROP))
            .into_script();
        let truncated = ScriptBuf::from_bytes(vec![OP_CLAIM_NAME, 0x4c]);
        let op_return = Builder::new().push_opcode(OP_RETURN).into_script();

        for script in [bad_drops, short_id, truncated, owner(), op_return] {
            let out = TxOut {
                value: Amount::from_sat(1),
                script_pubkey: script,
            };
            assert_eq!(decode_output(OutPoint::null(), &out), None);
        }
    }
}
