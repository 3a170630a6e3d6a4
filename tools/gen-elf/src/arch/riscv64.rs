const A0: u32 = 10;
const RET: u32 = 0x0000_8067;
const EBREAK: u32 = 0x0010_0073;

pub(crate) fn return_const(value: u32) -> Vec<u8> {
    let value = value as i64;
    let hi = (value + 0x800) >> 12;
    let lo = value - (hi << 12);
    // lui a0, hi ; addiw a0, a0, lo
    let lui = (((hi as u32) & 0xfffff) << 12) | (A0 << 7) | 0x37;
    let addiw = (((lo as u32) & 0xfff) << 20) | (A0 << 15) | (A0 << 7) | 0x1b;
    [lui, addiw, RET, EBREAK]
        .iter()
        .flat_map(|insn| insn.to_le_bytes())
        .collect()
}
