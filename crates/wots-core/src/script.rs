//! Minimal script inspection: opcode iteration and the template checks the
//! chain-state engine depends on. Script execution lives behind
//! [`ScriptEngine`](crate::traits::ScriptEngine).

use crate::constants::opcodes::*;
use crate::error::DecodeError;

/// One parsed script element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes for push opcodes, `None` otherwise.
    pub data: Option<&'a [u8]>,
}

/// Iterator over the instructions of a script. Yields an error once on
/// a truncated push and stops.
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
    failed: bool,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, pos: 0, failed: false }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::UnexpectedEof)?;
        if end > self.script.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.script[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn next_instruction(&mut self, opcode: u8) -> Result<Instruction<'a>, DecodeError> {
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = self.take(4)?;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => return Ok(Instruction { opcode, data: None }),
        };
        Ok(Instruction { opcode, data: Some(self.take(len)?) })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.pos];
        self.pos += 1;
        let item = self.next_instruction(opcode);
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Pay-to-script-hash template: `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Outputs starting with `OP_RETURN` can never be spent.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

/// Data of the last push in a push-only script, if it is push-only.
pub fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut last = None;
    for ins in instructions(script) {
        let ins = ins.ok()?;
        match ins.data {
            Some(data) => last = Some(data),
            None if ins.opcode == OP_0 => last = Some(&[][..]),
            None => return None,
        }
    }
    last
}

/// Build a minimal push of `data`.
pub fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => out.push(OP_0),
        len @ 1..=0x4b => out.push(len as u8),
        len @ 0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
}

/// `OP_HASH160 <hash> OP_EQUAL` for the given 20-byte script hash.
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(23);
    out.push(OP_HASH160);
    push_data(&mut out, script_hash);
    out.push(OP_EQUAL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pushes_and_opcodes() {
        let mut script = vec![OP_0];
        push_data(&mut script, &[1, 2, 3]);
        push_data(&mut script, &[9u8; 80]);
        script.push(OP_CHECKSIG);
        let ins: Vec<_> = instructions(&script).collect::<Result<_, _>>().unwrap();
        assert_eq!(ins.len(), 4);
        assert_eq!(ins[0].opcode, OP_0);
        assert_eq!(ins[1].data, Some(&[1u8, 2, 3][..]));
        assert_eq!(ins[2].opcode, OP_PUSHDATA1);
        assert_eq!(ins[2].data.map(<[u8]>::len), Some(80));
        assert_eq!(ins[3], Instruction { opcode: OP_CHECKSIG, data: None });
    }

    #[test]
    fn truncated_push_fails_once() {
        let script = [0x05, 1, 2];
        let mut it = instructions(&script);
        assert!(matches!(it.next(), Some(Err(DecodeError::UnexpectedEof))));
        assert!(it.next().is_none());
    }

    #[test]
    fn p2sh_template() {
        let script = p2sh_script(&[0x11; 20]);
        assert!(is_p2sh(&script));
        assert!(!is_p2sh(&script[..22]));
    }

    #[test]
    fn op_return_is_unspendable() {
        assert!(is_unspendable(&[OP_RETURN, 0x01, 0x00]));
        assert!(!is_unspendable(&[]));
        assert!(!is_unspendable(&[OP_HASH160]));
    }

    #[test]
    fn last_push_requires_push_only() {
        let mut script = Vec::new();
        push_data(&mut script, b"sig");
        push_data(&mut script, b"redeem");
        assert_eq!(last_push(&script), Some(&b"redeem"[..]));
        script.push(OP_CHECKSIG);
        assert_eq!(last_push(&script), None);
    }
}
