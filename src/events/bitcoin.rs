//! Bitcoin HTLC classification
//!
//! Lock outputs are recognised either as bare HTLC scripts or as P2WSH programs
//! whose witness script was registered for a tracked order. Spends are
//! recognised from the witness script (P2WSH) or redeem script (P2SH) revealed
//! in the spending input.

use super::script::{as_p2wsh_program, instructions, p2wsh_program, parse_htlc, HtlcScript, Instruction};
use super::{HtlcEvent, HtlcEventKind};
use crate::chain::bitcoin::{RpcInput, RpcTransaction};
use crate::chain::{BlockHeader, Chain, HtlcClassifier};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{Hashlock, Secret};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Witness scripts of P2WSH locks the relayer should recognise
#[derive(Default)]
pub struct ScriptRegistry {
    by_program: DashMap<[u8; 32], Vec<u8>>,
    by_hashlock: DashMap<Hashlock, Vec<u8>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a witness script; it must follow the HTLC template
    pub fn register(&self, witness_script: &[u8]) -> RelayerResult<HtlcScript> {
        let parsed = parse_htlc(witness_script).ok_or_else(|| {
            RelayerError::InvalidOrder("bitcoin_htlc_script is not an HTLC script".to_string())
        })?;

        self.by_program
            .insert(p2wsh_program(witness_script), witness_script.to_vec());
        self.by_hashlock
            .insert(parsed.hashlock, witness_script.to_vec());

        debug!(hashlock = %parsed.hashlock.short(), "Registered bitcoin HTLC script");
        Ok(parsed)
    }

    pub fn by_program(&self, program: &[u8; 32]) -> Option<Vec<u8>> {
        self.by_program.get(program).map(|s| s.clone())
    }

    pub fn by_hashlock(&self, hashlock: &Hashlock) -> Option<Vec<u8>> {
        self.by_hashlock.get(hashlock).map(|s| s.clone())
    }

    pub fn forget(&self, hashlock: &Hashlock) {
        if let Some((_, script)) = self.by_hashlock.remove(hashlock) {
            self.by_program.remove(&p2wsh_program(&script));
        }
    }

    pub fn len(&self) -> usize {
        self.by_hashlock.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hashlock.is_empty()
    }
}

/// Classifies bitcoind verbose transactions into HTLC events
pub struct BitcoinClassifier {
    registry: Arc<ScriptRegistry>,
}

impl BitcoinClassifier {
    pub fn new(registry: Arc<ScriptRegistry>) -> Self {
        Self { registry }
    }

    fn decode_hex(&self, tx: &RpcTransaction, hex_str: &str) -> RelayerResult<Vec<u8>> {
        hex::decode(hex_str).map_err(|e| RelayerError::Decode {
            chain: Chain::Bitcoin,
            message: format!("tx {}: invalid script hex: {}", tx.txid, e),
        })
    }

    /// Match an output script against the bare template or a registered program
    fn lock_script(&self, script_pubkey: &[u8]) -> Option<HtlcScript> {
        if let Some(script) = parse_htlc(script_pubkey) {
            return Some(script);
        }
        let program = as_p2wsh_program(script_pubkey)?;
        let witness_script = self.registry.by_program(&program)?;
        parse_htlc(&witness_script)
    }

    /// Returns the HTLC script being spent and the other stack items
    fn spend_stack(
        &self,
        tx: &RpcTransaction,
        input: &RpcInput,
    ) -> RelayerResult<Option<(HtlcScript, Vec<Vec<u8>>)>> {
        let mut stack: Vec<Vec<u8>> = if !input.txinwitness.is_empty() {
            input
                .txinwitness
                .iter()
                .map(|item| self.decode_hex(tx, item))
                .collect::<RelayerResult<_>>()?
        } else if let Some(script_sig) = &input.script_sig {
            let bytes = self.decode_hex(tx, &script_sig.hex)?;
            match instructions(&bytes) {
                Some(ins) => ins
                    .into_iter()
                    .filter_map(|i| match i {
                        Instruction::Push(data) => Some(data.to_vec()),
                        Instruction::Op(_) => None,
                    })
                    .collect(),
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };

        let Some(script_bytes) = stack.pop() else {
            return Ok(None);
        };

        Ok(parse_htlc(&script_bytes).map(|script| (script, stack)))
    }
}

/// Convert a bitcoind BTC amount to satoshis
pub fn btc_to_sats(value: f64) -> u128 {
    (value * 100_000_000.0).round().max(0.0) as u128
}

impl HtlcClassifier for BitcoinClassifier {
    type Tx = RpcTransaction;

    fn classify(&self, tx: &RpcTransaction, header: &BlockHeader) -> RelayerResult<Vec<HtlcEvent>> {
        let mut events = Vec::new();

        for output in &tx.vout {
            let script_pubkey = self.decode_hex(tx, &output.script_pub_key.hex)?;
            if let Some(htlc) = self.lock_script(&script_pubkey) {
                trace!(txid = %tx.txid, vout = output.n, "HTLC lock output");
                events.push(HtlcEvent {
                    kind: HtlcEventKind::Lock,
                    chain: Chain::Bitcoin,
                    tx_id: tx.txid.clone(),
                    block: header.block.clone(),
                    timestamp: header.timestamp,
                    hashlock: htlc.hashlock,
                    amount: btc_to_sats(output.value),
                    secret: None,
                    counterparty: Some(htlc.recipient.to_hex()),
                    locktime: Some(htlc.locktime),
                    output_index: Some(output.n),
                    position: u64::from(output.n),
                });
            }
        }

        for (index, input) in tx.vin.iter().enumerate() {
            if input.coinbase.is_some() {
                continue;
            }

            let Some((htlc, items)) = self.spend_stack(tx, input)? else {
                continue;
            };

            let secret = items
                .iter()
                .filter(|item| item.len() == 32)
                .map(|item| {
                    let mut bytes = [0u8; 32];
                    bytes.copy_from_slice(item);
                    Secret(bytes)
                })
                .find(|candidate| candidate.matches(&htlc.hashlock));

            let kind = if secret.is_some() {
                HtlcEventKind::Redeem
            } else {
                HtlcEventKind::Refund
            };

            trace!(txid = %tx.txid, kind = %kind, "HTLC spend input");
            events.push(HtlcEvent {
                kind,
                chain: Chain::Bitcoin,
                tx_id: tx.txid.clone(),
                block: header.block.clone(),
                timestamp: header.timestamp,
                hashlock: htlc.hashlock,
                amount: 0,
                secret,
                counterparty: tx
                    .vout
                    .first()
                    .and_then(|o| o.script_pub_key.address.clone()),
                locktime: Some(htlc.locktime),
                output_index: input.vout,
                position: index as u64,
            });
        }

        Ok(events)
    }
}
