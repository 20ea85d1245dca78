use thiserror::Error;

/// Fatal conditions the core can hit. Surfaced by the scheduler's drive loop; there is no
/// recovery path for any of these short of resetting the machine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown SPC700 opcode {opcode:02X} at PC={pc:04X}")]
    UnknownOpcode { opcode: u8, pc: u16 },
}
