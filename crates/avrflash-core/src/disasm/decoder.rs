//! Decoder for AVR control-flow instructions

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// Relative, absolute or conditional transfer
    Branch {
        /// Mnemonic
        mnemonic: &'static str,
        /// Byte address of the target
        target: u32,
        /// True for `call`/`rcall`
        is_call: bool,
        /// Instruction length in bytes
        len: u32,
    },
    /// Any other word
    Word(u16),
}

const BRBS: [&str; 8] = ["brcs", "breq", "brmi", "brvs", "brlt", "brhs", "brts", "brie"];
const BRBC: [&str; 8] = ["brcc", "brne", "brpl", "brvc", "brge", "brhc", "brtc", "brid"];

fn sign_extend(v: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((i64::from(v)) << shift) >> shift
}

fn relative(pc: u32, words: i64) -> u32 {
    (i64::from(pc) + 2 + 2 * words) as u32
}

/// Decode the instruction at byte address `pc`
///
/// `next` is the following word, needed by the two-word `jmp` and `call`.
/// A two-word instruction without its second word decodes as a plain word.
pub fn decode(pc: u32, op: u16, next: Option<u16>) -> Insn {
    let op32 = u32::from(op);
    match op & 0xF000 {
        0xC000 | 0xD000 => {
            let is_call = op & 0xF000 == 0xD000;
            return Insn::Branch {
                mnemonic: if is_call { "rcall" } else { "rjmp" },
                target: relative(pc, sign_extend(op32 & 0x0FFF, 12)),
                is_call,
                len: 2,
            };
        }
        0xF000 if op & 0x0800 == 0 => {
            let k = sign_extend((op32 >> 3) & 0x7F, 7);
            let s = (op & 7) as usize;
            let mnemonic = if op & 0x0400 == 0 { BRBS[s] } else { BRBC[s] };
            return Insn::Branch {
                mnemonic,
                target: relative(pc, k),
                is_call: false,
                len: 2,
            };
        }
        _ => {}
    }
    // 1001 010k kkkk 11ck
    if op & 0xFE0C == 0x940C {
        if let Some(lo) = next {
            let hi = ((op32 >> 3) & 0x3E) | (op32 & 1);
            let words = (hi << 16) | u32::from(lo);
            let is_call = op & 0x0002 != 0;
            return Insn::Branch {
                mnemonic: if is_call { "call" } else { "jmp" },
                target: words * 2,
                is_call,
                len: 4,
            };
        }
    }
    Insn::Word(op)
}
