//! Script primitives.
//!
//! Only the parts of the script system that consensus validation consumes
//! live here: opcode constants, verification flags, parsing into
//! instructions, standard-template classification, signature-operation
//! counting, and the framing of the two consensus payloads carried inside
//! output scripts (entangle info and the keeped amount).

use thiserror::Error;

// Push opcodes.
pub const OP_0: u8 = 0x00;
pub const OP_DATA_1: u8 = 0x01;
pub const OP_DATA_75: u8 = 0x4b;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;

// Opcodes consensus validation cares about.
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_CHECKDATASIG: u8 = 0xba;
pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;

/// Marker byte identifying an entangle payload after `OP_RETURN`.
pub const ENTANGLE_MARKER: u8 = 0xc2;
/// Marker byte identifying a keeped-amount payload after `OP_RETURN`.
pub const KEEPED_AMOUNT_MARKER: u8 = 0xc3;

/// Sigops charged for a multisig opcode when the key count is unknown.
pub const MAX_PUB_KEYS_PER_MULTISIG: usize = 20;

/// Script errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    /// A push opcode ran past the end of the script.
    #[error("malformed push at offset {0}")]
    MalformedPush(usize),
}

/// Script verification flags.
///
/// The interpreter itself is external; consensus code only assembles the
/// flag set and forwards it.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub const NONE: ScriptFlags = ScriptFlags(0);
    /// Evaluate P2SH subscripts.
    pub const BIP16: ScriptFlags = ScriptFlags(1 << 0);
    pub const VERIFY_DER_SIGNATURES: ScriptFlags = ScriptFlags(1 << 1);
    pub const VERIFY_CHECK_LOCK_TIME_VERIFY: ScriptFlags = ScriptFlags(1 << 2);
    pub const VERIFY_CHECK_SEQUENCE_VERIFY: ScriptFlags = ScriptFlags(1 << 3);
    pub const VERIFY_STRICT_ENCODING: ScriptFlags = ScriptFlags(1 << 4);
    pub const VERIFY_BIP143_SIG_HASH: ScriptFlags = ScriptFlags(1 << 5);
    pub const VERIFY_LOW_S: ScriptFlags = ScriptFlags(1 << 6);
    pub const VERIFY_NULL_FAIL: ScriptFlags = ScriptFlags(1 << 7);
    pub const VERIFY_SIG_PUSH_ONLY: ScriptFlags = ScriptFlags(1 << 8);
    pub const VERIFY_CLEAN_STACK: ScriptFlags = ScriptFlags(1 << 9);
    pub const VERIFY_CHECK_DATA_SIG: ScriptFlags = ScriptFlags(1 << 10);
    pub const VERIFY_SCHNORR: ScriptFlags = ScriptFlags(1 << 11);
    pub const VERIFY_ALLOW_SEGWIT_RECOVERY: ScriptFlags = ScriptFlags(1 << 12);

    pub fn contains(self, other: ScriptFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ScriptFlags {
    type Output = ScriptFlags;

    fn bitor(self, rhs: ScriptFlags) -> ScriptFlags {
        ScriptFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ScriptFlags {
    fn bitor_assign(&mut self, rhs: ScriptFlags) {
        self.0 |= rhs.0;
    }
}

/// One parsed script instruction: the opcode and its pushed data, if any.
#[derive(Debug, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

/// Iterator over the instructions of a script.
pub struct Instructions<'a> {
    script: &'a [u8],
    offset: usize,
}

/// Parse `script` into an instruction stream.
pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, offset: 0 }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.script.len() {
            return None;
        }
        let start = self.offset;
        let opcode = self.script[self.offset];
        self.offset += 1;

        let data_len = match opcode {
            OP_DATA_1..=OP_DATA_75 => opcode as usize,
            OP_PUSHDATA1 => {
                let Some(&len) = self.script.get(self.offset) else {
                    self.offset = self.script.len();
                    return Some(Err(ScriptError::MalformedPush(start)));
                };
                self.offset += 1;
                len as usize
            }
            OP_PUSHDATA2 => {
                let Some(raw) = self.script.get(self.offset..self.offset + 2) else {
                    self.offset = self.script.len();
                    return Some(Err(ScriptError::MalformedPush(start)));
                };
                self.offset += 2;
                u16::from_le_bytes([raw[0], raw[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let Some(raw) = self.script.get(self.offset..self.offset + 4) else {
                    self.offset = self.script.len();
                    return Some(Err(ScriptError::MalformedPush(start)));
                };
                self.offset += 4;
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            }
            _ => 0,
        };

        let Some(data) = self.script.get(self.offset..self.offset + data_len) else {
            self.offset = self.script.len();
            return Some(Err(ScriptError::MalformedPush(start)));
        };
        self.offset += data_len;
        Some(Ok(Instruction { opcode, data }))
    }
}

/// Fast signature-operation count over a script.
///
/// Multisig opcodes charge [`MAX_PUB_KEYS_PER_MULTISIG`] unless `precise` is
/// set and the preceding opcode is a small integer naming the key count.
/// Counting stops at the first malformed instruction, matching the legacy
/// behavior of charging only what parsed.
pub fn get_sig_op_count(script: &[u8], precise: bool, flags: ScriptFlags) -> usize {
    let mut count = 0usize;
    let mut prev_opcode = 0xff;
    for inst in instructions(script) {
        let Ok(inst) = inst else { break };
        match inst.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                if flags.contains(ScriptFlags::VERIFY_CHECK_DATA_SIG) {
                    count += 1;
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if precise && (OP_1..=OP_16).contains(&prev_opcode) {
                    count += (prev_opcode - (OP_1 - 1)) as usize;
                } else {
                    count += MAX_PUB_KEYS_PER_MULTISIG;
                }
            }
            _ => {}
        }
        prev_opcode = inst.opcode;
    }
    count
}

/// Precise signature-operation count for an input spending `pk_script`.
///
/// For a P2SH output the count is taken over the redeem script, which is the
/// final push of the signature script; a signature script that is not
/// push-only or carries no final push contributes nothing.
pub fn get_precise_sig_op_count(sig_script: &[u8], pk_script: &[u8], flags: ScriptFlags) -> usize {
    if !is_pay_to_script_hash(pk_script) {
        return get_sig_op_count(pk_script, true, flags);
    }

    let mut redeem: Option<&[u8]> = None;
    for inst in instructions(sig_script) {
        let Ok(inst) = inst else { return 0 };
        if inst.opcode > OP_16 {
            return 0;
        }
        redeem = Some(inst.data);
    }
    match redeem {
        Some(script) => get_sig_op_count(script, true, flags),
        None => 0,
    }
}

/// Whether a script is the pay-to-script-hash template.
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23
        && script[0] == OP_HASH160
        && script[1] == 0x14
        && script[22] == OP_EQUAL
}

/// Whether a script is the pay-to-pubkey-hash template.
pub fn is_pay_to_pubkey_hash(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

/// Whether a script is provably unspendable and therefore never enters the
/// utxo set.
pub fn is_unspendable(script: &[u8]) -> bool {
    !script.is_empty() && script[0] == OP_RETURN
}

/// Build the pay-to-pubkey-hash script for a 20-byte hash.
pub fn pay_to_pubkey_hash_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Build the pay-to-script-hash script for a 20-byte hash.
pub fn pay_to_script_hash_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

/// Append a minimal data push of `data` to `script`.
fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() <= OP_DATA_75 as usize {
        script.push(data.len() as u8);
    } else if data.len() <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    } else {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
    }
    script.extend_from_slice(data);
}

fn marked_script(marker: u8, payload: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(payload.len() + 4);
    script.push(OP_RETURN);
    script.push(marker);
    push_data(&mut script, payload);
    script
}

fn marked_payload(marker: u8, script: &[u8]) -> Option<&[u8]> {
    if script.len() < 3 || script[0] != OP_RETURN || script[1] != marker {
        return None;
    }
    let mut iter = instructions(&script[2..]);
    let inst = iter.next()?.ok()?;
    if inst.data.is_empty() || iter.next().is_some() {
        return None;
    }
    Some(inst.data)
}

/// Build an output script carrying a serialized entangle payload.
pub fn entangle_script(payload: &[u8]) -> Vec<u8> {
    marked_script(ENTANGLE_MARKER, payload)
}

/// Extract the entangle payload from an output script, if present.
pub fn entangle_payload(script: &[u8]) -> Option<&[u8]> {
    marked_payload(ENTANGLE_MARKER, script)
}

/// Build an output script carrying a serialized keeped amount.
pub fn keeped_amount_script(payload: &[u8]) -> Vec<u8> {
    marked_script(KEEPED_AMOUNT_MARKER, payload)
}

/// Extract the keeped-amount payload from an output script, if present.
pub fn keeped_amount_payload(script: &[u8]) -> Option<&[u8]> {
    marked_payload(KEEPED_AMOUNT_MARKER, script)
}
