//! Two-pass AVR disassembly with symbolic jump and call targets
//!
//! The first pass decodes the window and collects every control transfer
//! into [`JumpCalls`]. Targets are then classified and numbered so that
//! the second pass can print `Function<N>`/`Label<N>` names both at the
//! target and in the operand of each jump or call.

mod decoder;
mod jumpcall;

use std::collections::HashMap;

pub use decoder::{decode, Insn};
pub use jumpcall::{Edge, JumpCalls};

/// Source of user supplied labels, such as a tag file
pub trait LabelSource {
    /// Label for `addr`, if one is defined
    fn label(&self, addr: u32) -> Option<&str>;

    /// Comment printed next to the label
    fn comment(&self, _addr: u32) -> Option<&str> {
        None
    }
}

impl LabelSource for HashMap<u32, String> {
    fn label(&self, addr: u32) -> Option<&str> {
        self.get(&addr).map(String::as_str)
    }
}

fn words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], *c.get(1).unwrap_or(&0xFF)]))
        .collect()
}

fn walk(bytes: &[u8], base: u32, mut f: impl FnMut(u32, &[u8], Insn)) {
    let w = words(bytes);
    let mut i = 0;
    while i < w.len() {
        let pc = base + 2 * i as u32;
        let insn = decode(pc, w[i], w.get(i + 1).copied());
        let len = match insn {
            Insn::Branch { len, .. } => len as usize,
            Insn::Word(_) => 2,
        };
        let end = (2 * i + len).min(bytes.len());
        f(pc, &bytes[2 * i..end], insn);
        i += len / 2;
    }
}

/// Disassemble `bytes` located at byte address `base`
///
/// Returns the rendered lines: back-references and labels before each
/// jump target, then one line per instruction.
pub fn disassemble(bytes: &[u8], base: u32, tags: &dyn LabelSource) -> Vec<String> {
    let mut jc = JumpCalls::new();
    walk(bytes, base, |pc, _, insn| {
        if let Insn::Branch { mnemonic, target, is_call, .. } = insn {
            jc.register_edge(pc, target, mnemonic, is_call);
        }
    });
    jc.enumerate();

    let mut out = Vec::new();
    walk(bytes, base, |pc, raw, insn| {
        let refs = jc.references(pc, tags);
        if !refs.is_empty() {
            out.push(String::new());
            out.extend(refs);
        }
        let hex: Vec<String> = raw.iter().map(|b| format!("{:02x}", b)).collect();
        let text = match insn {
            Insn::Branch { mnemonic, target, .. } => format!(
                "{:<7} {:<16} ; 0x{:04x}",
                mnemonic,
                jc.label_name(target, tags),
                target
            ),
            Insn::Word(w) => format!(".word   0x{:04x}", w),
        };
        out.push(format!("  {:04x}:  {:<12} {}", pc, hex.join(" "), text));
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_labels_targets() {
        // 0: rcall .+2 -> 4; 2: rjmp .-4 -> 0; 4: ret
        let bytes = [0x01, 0xD0, 0xFE, 0xCF, 0x08, 0x95];
        let lines = disassemble(&bytes, 0, &HashMap::<u32, String>::new());
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "; Referenced from 0x02 by rjmp");
        assert_eq!(lines[2], "Label1:");
        assert!(lines[3].contains("rcall   Function1"));
        assert!(lines[4].contains("rjmp    Label1"));
        assert_eq!(lines[6], "; Referenced from 0x00 by rcall");
        assert_eq!(lines[7], "Function1:");
        assert!(lines[8].ends_with(".word   0x9508"));
    }

    #[test]
    fn test_odd_length_pads_with_ff() {
        let lines = disassemble(&[0x12], 0x100, &HashMap::<u32, String>::new());
        assert_eq!(lines, vec!["  0100:  12           .word   0xff12".to_string()]);
    }
}
