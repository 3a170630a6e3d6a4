const RET: u32 = 0xd65f_03c0;
const BRK: u32 = 0xd420_0000;

pub(crate) fn return_const(value: u32) -> Vec<u8> {
    // movz w0, #lo16 ; movk w0, #hi16, lsl #16
    let movz = 0x5280_0000 | ((value & 0xffff) << 5);
    let movk = 0x72a0_0000 | ((value >> 16) << 5);
    [movz, movk, RET, BRK]
        .iter()
        .flat_map(|insn| insn.to_le_bytes())
        .collect()
}
