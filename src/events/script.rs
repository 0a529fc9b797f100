//! Bitcoin script decoding for HTLC templates
//!
//! Recognised template (P2WSH witness script, P2SH redeem script or bare output):
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <hashlock> OP_EQUALVERIFY <recipient identity>
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <refund identity>
//! OP_ENDIF
//! ```
//!
//! where an identity is either `<pubkey> OP_CHECKSIG` or
//! `OP_DUP OP_HASH160 <pubkey hash> OP_EQUALVERIFY OP_CHECKSIG`.

use crate::types::Hashlock;

use sha2::{Digest, Sha256};

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_IF: u8 = 0x63;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

use opcodes::*;

/// One decoded script element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Split a script into pushes and opcodes; `None` on truncated push data
pub fn instructions(script: &[u8]) -> Option<Vec<Instruction<'_>>> {
    let mut out = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let op = script[i];
        i += 1;

        let len = match op {
            OP_0 => 0,
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(i)? as usize;
                i += 1;
                n
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2)?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(i..i + 4)?;
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                out.push(Instruction::Op(op));
                continue;
            }
        };

        let data = script.get(i..i + len)?;
        i += len;
        out.push(Instruction::Push(data));
    }

    Some(out)
}

/// Who may spend one branch of the HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    PubKey(Vec<u8>),
    PubKeyHash([u8; 20]),
}

impl Identity {
    pub fn to_hex(&self) -> String {
        match self {
            Identity::PubKey(pk) => hex::encode(pk),
            Identity::PubKeyHash(h) => hex::encode(h),
        }
    }
}

/// Decoded HTLC script parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcScript {
    pub hashlock: Hashlock,
    pub recipient: Identity,
    pub refund: Identity,
    pub locktime: u64,
}

struct Matcher<'s, 'a> {
    ins: &'s [Instruction<'a>],
    pos: usize,
}

impl<'s, 'a> Matcher<'s, 'a> {
    fn op(&mut self, expected: u8) -> Option<()> {
        match self.ins.get(self.pos)? {
            Instruction::Op(op) if *op == expected => {
                self.pos += 1;
                Some(())
            }
            _ => None,
        }
    }

    fn push(&mut self) -> Option<&'a [u8]> {
        match self.ins.get(self.pos)? {
            Instruction::Push(data) => {
                self.pos += 1;
                Some(*data)
            }
            _ => None,
        }
    }

    fn peek_op(&self, expected: u8) -> bool {
        matches!(self.ins.get(self.pos), Some(Instruction::Op(op)) if *op == expected)
    }

    fn number(&mut self) -> Option<u64> {
        match self.ins.get(self.pos)? {
            Instruction::Op(op) if (OP_1..=OP_16).contains(op) => {
                self.pos += 1;
                Some((op - OP_1 + 1) as u64)
            }
            Instruction::Push(data) => {
                self.pos += 1;
                decode_script_num(data)
            }
            _ => None,
        }
    }

    fn identity(&mut self) -> Option<Identity> {
        if self.peek_op(OP_DUP) {
            self.op(OP_DUP)?;
            self.op(OP_HASH160)?;
            let hash = self.push()?;
            if hash.len() != 20 {
                return None;
            }
            self.op(OP_EQUALVERIFY)?;
            self.op(OP_CHECKSIG)?;
            let mut out = [0u8; 20];
            out.copy_from_slice(hash);
            Some(Identity::PubKeyHash(out))
        } else {
            let pubkey = self.push()?;
            if pubkey.len() != 33 && pubkey.len() != 65 {
                return None;
            }
            self.op(OP_CHECKSIG)?;
            Some(Identity::PubKey(pubkey.to_vec()))
        }
    }

    fn done(&self) -> bool {
        self.pos == self.ins.len()
    }
}

/// Decode an HTLC script; `None` if the script does not follow the template
pub fn parse_htlc(script: &[u8]) -> Option<HtlcScript> {
    let ins = instructions(script)?;
    let mut m = Matcher { ins: &ins, pos: 0 };

    m.op(OP_IF)?;
    m.op(OP_SHA256)?;
    let hash = m.push()?;
    if hash.len() != 32 {
        return None;
    }
    m.op(OP_EQUALVERIFY)?;
    let recipient = m.identity()?;
    m.op(OP_ELSE)?;
    let locktime = m.number()?;
    m.op(OP_CHECKLOCKTIMEVERIFY)?;
    m.op(OP_DROP)?;
    let refund = m.identity()?;
    m.op(OP_ENDIF)?;

    if !m.done() {
        return None;
    }

    let mut hashlock = [0u8; 32];
    hashlock.copy_from_slice(hash);

    Some(HtlcScript {
        hashlock: Hashlock(hashlock),
        recipient,
        refund,
        locktime,
    })
}

/// Decode a minimally-encoded script number (CLTV operands are at most 5 bytes)
pub fn decode_script_num(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return Some(0);
    }
    if data.len() > 5 {
        return None;
    }

    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        value |= (*byte as u64) << (8 * i);
    }

    let last = data[data.len() - 1];
    if last & 0x80 != 0 {
        // Negative locktimes are never valid for CLTV
        return None;
    }

    Some(value)
}

/// Minimal script number encoding of a non-negative value
pub fn encode_script_num(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while value > 0 {
        out.push((value & 0xff) as u8);
        value >>= 8;
    }
    if let Some(last) = out.last() {
        if last & 0x80 != 0 {
            out.push(0x00);
        }
    }
    out
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        n if n <= 0x4b => {
            script.push(n as u8);
            script.extend_from_slice(data);
        }
        n if n <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(n as u8);
            script.extend_from_slice(data);
        }
        n => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(n as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Build the pubkey form of the HTLC template
pub fn build_htlc_script(
    hashlock: &Hashlock,
    recipient_pubkey: &[u8],
    refund_pubkey: &[u8],
    locktime: u64,
) -> Vec<u8> {
    let mut script = vec![OP_IF, OP_SHA256];
    push_data(&mut script, &hashlock.0);
    script.push(OP_EQUALVERIFY);
    push_data(&mut script, recipient_pubkey);
    script.push(OP_CHECKSIG);
    script.push(OP_ELSE);
    push_data(&mut script, &encode_script_num(locktime));
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    push_data(&mut script, refund_pubkey);
    script.push(OP_CHECKSIG);
    script.push(OP_ENDIF);
    script
}

/// SHA-256 witness program of a P2WSH output
pub fn p2wsh_program(witness_script: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(witness_script);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// `OP_0 <32-byte program>` output script
pub fn p2wsh_script_pubkey(witness_script: &[u8]) -> Vec<u8> {
    let mut out = vec![OP_0, 0x20];
    out.extend_from_slice(&p2wsh_program(witness_script));
    out
}

/// Extract the witness program from a P2WSH output script
pub fn as_p2wsh_program(script_pubkey: &[u8]) -> Option<[u8; 32]> {
    if script_pubkey.len() == 34 && script_pubkey[0] == OP_0 && script_pubkey[1] == 0x20 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&script_pubkey[2..]);
        Some(out)
    } else {
        None
    }
}
