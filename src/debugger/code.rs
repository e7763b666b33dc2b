/// x86_64 `int3` encoding. Planting a breakpoint means overwriting the first
/// instruction byte with this value.
pub const TRAP_INSTRUCTION: [u8; 1] = [0xCC];

/// How far past the trap the program counter points when the kernel reports
/// a breakpoint stop on x86_64.
pub const TRAP_PC_OFFSET: u64 = TRAP_INSTRUCTION.len() as u64;
