const INT3: u8 = 0xcc;

pub(crate) fn return_const(value: u32) -> Vec<u8> {
    let mut code = Vec::with_capacity(16);
    // mov eax, imm32
    code.push(0xb8);
    code.extend_from_slice(&value.to_le_bytes());
    // ret
    code.push(0xc3);
    code.resize(16, INT3);
    code
}
