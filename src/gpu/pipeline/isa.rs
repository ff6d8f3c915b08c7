//! Dword-level ISA listing.
//!
//! Classifies each instruction dword by its encoding prefix. Operands are
//! not decoded; the raw dword is printed instead.

use std::fmt::Write;

/// Encoding prefixes, longest first so the first match wins.
const ENCODINGS: &[(u32, u32, &str)] = &[
    (0xFF80_0000, 0xBF80_0000, "SOPP"),
    (0xFF80_0000, 0xBE80_0000, "SOP1"),
    (0xFF80_0000, 0xBF00_0000, "SOPC"),
    (0xFC00_0000, 0xC000_0000, "SMEM"),
    (0xFC00_0000, 0xD000_0000, "VOP3"),
    (0xFC00_0000, 0xD800_0000, "DS"),
    (0xFC00_0000, 0xDC00_0000, "FLAT"),
    (0xFC00_0000, 0xE000_0000, "MUBUF"),
    (0xFC00_0000, 0xF800_0000, "EXP"),
    (0xFE00_0000, 0x7E00_0000, "VOP1"),
    (0xFE00_0000, 0x7C00_0000, "VOPC"),
    (0xF000_0000, 0xB000_0000, "SOPK"),
    (0xC000_0000, 0x8000_0000, "SOP2"),
    (0x8000_0000, 0x0000_0000, "VOP2"),
];

fn classify(dword: u32) -> &'static str {
    ENCODINGS
        .iter()
        .find(|(mask, value, _)| dword & mask == *value)
        .map(|(_, _, name)| *name)
        .unwrap_or("???")
}

/// Renders `isa` as one line per dword, or `None` when it is not a whole
/// number of dwords.
pub fn disassemble(isa: &[u8]) -> Option<String> {
    if isa.len() % 4 != 0 {
        return None;
    }

    let mut out = String::with_capacity(isa.len() / 4 * 32);
    for (i, chunk) in isa.chunks_exact(4).enumerate() {
        let dword = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let _ = writeln!(
            out,
            "  {:<6} 0x{:08X} // {:06X}",
            classify(dword),
            dword,
            i * 4
        );
    }
    Some(out)
}
