use capstone::{arch, prelude::*, Capstone, InsnGroupId, InsnGroupType};

use super::{Arch, DecodeError, DecodedInstruction, FlowKind, InstructionDecoder, IsaMode};

/// Capstone-backed single-instruction decoder.
///
/// A `Capstone` handle is not shareable across threads, so parallel callers
/// build one decoder per worker. 32-bit ARM decoders carry a second handle
/// for Thumb code.
pub struct CapstoneDecoder {
    cs: Capstone,
    thumb: Option<Capstone>,
    mode: IsaMode,
    arch: Arch,
}

pub fn capstone_version() -> String {
    let (major, minor) = Capstone::lib_version();
    format!("{major}.{minor}")
}

fn make_cs(target: Arch) -> Result<Capstone, DecodeError> {
    let built = match target {
        Arch::X86_64 => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build()
        }
        Arch::X86 => Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build(),
        Arch::Arm => Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build(),
        Arch::Aarch64 => {
            Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build()
        }
    };
    built.map_err(|e| DecodeError::Backend(format!("capstone init failed for {target}: {e}")))
}

fn make_thumb_cs() -> Result<Capstone, DecodeError> {
    Capstone::new()
        .arm()
        .mode(arch::arm::ArchMode::Thumb)
        .detail(true)
        .build()
        .map_err(|e| DecodeError::Backend(format!("capstone init failed for thumb: {e}")))
}

fn has_group(groups: &[InsnGroupId], group: u8) -> bool {
    groups.iter().any(|g| *g == InsnGroupId(group))
}

/// Last immediate operand; for compare-and-branch forms the destination is
/// the final operand.
fn immediate_target(detail: &capstone::InsnDetail) -> Option<u64> {
    detail
        .arch_detail()
        .operands()
        .iter()
        .filter_map(|op| match op {
            capstone::arch::ArchOperand::X86Operand(op) => {
                if let capstone::arch::x86::X86OperandType::Imm(imm) = op.op_type {
                    Some(imm as u64)
                } else {
                    None
                }
            }
            capstone::arch::ArchOperand::ArmOperand(op) => {
                if let capstone::arch::arm::ArmOperandType::Imm(imm) = op.op_type {
                    Some(imm as u32 as u64)
                } else {
                    None
                }
            }
            capstone::arch::ArchOperand::Arm64Operand(op) => {
                if let capstone::arch::arm64::Arm64OperandType::Imm(imm) = op.op_type {
                    Some(imm as u64)
                } else {
                    None
                }
            }
            _ => None,
        })
        .last()
}

/// Supervisor, hypervisor, and secure-monitor calls. Breakpoints (`int3`,
/// `brk`) and overflow traps are ordinary instructions here.
fn is_supervisor_call(mnemonic: &str) -> bool {
    matches!(mnemonic, "syscall" | "sysenter" | "int" | "svc" | "swi" | "smc" | "hvc")
}

fn is_return_mnemonic(mnemonic: &str, op_str: &str) -> bool {
    match mnemonic {
        "ret" | "retq" | "retf" | "retn" | "iret" | "iretd" | "iretq" | "sysret" | "sysretq"
        | "sysexit" | "eret" | "retaa" | "retab" => true,
        "bx" => op_str.trim() == "lr",
        _ => false,
    }
}

fn is_call_mnemonic(arch: Arch, mnemonic: &str) -> bool {
    match arch {
        Arch::X86 | Arch::X86_64 => mnemonic.starts_with("call") || mnemonic == "lcall",
        Arch::Arm | Arch::Aarch64 => {
            matches!(mnemonic, "bl" | "blx" | "blr" | "blraa" | "blrab" | "blraaz" | "blrabz")
        }
    }
}

impl CapstoneDecoder {
    pub fn new(arch: Arch) -> Result<Self, DecodeError> {
        let thumb = match arch {
            Arch::Arm => Some(make_thumb_cs()?),
            Arch::X86 | Arch::X86_64 | Arch::Aarch64 => None,
        };
        Ok(Self { cs: make_cs(arch)?, thumb, mode: IsaMode::Native, arch })
    }

    pub fn mode(&self) -> IsaMode {
        self.mode
    }

    fn handle(&self) -> &Capstone {
        match (self.mode, &self.thumb) {
            (IsaMode::Thumb, Some(thumb)) => thumb,
            _ => &self.cs,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(&mut self, bytes: &[u8], address: u64) -> Result<DecodedInstruction, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let cs = self.handle();
        let insns = cs
            .disasm_count(bytes, address, 1)
            .map_err(|e| DecodeError::Backend(e.to_string()))?;
        let insn = insns.iter().next().ok_or(DecodeError::InvalidOpcode)?;
        let length = insn.bytes().len() as u32;
        if length == 0 {
            return Err(DecodeError::InvalidOpcode);
        }

        let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
        let op_str = insn.op_str().unwrap_or("");
        let detail = cs.insn_detail(insn).map_err(|e| DecodeError::Backend(e.to_string()))?;
        let groups = detail.groups();

        let flow = if has_group(groups, InsnGroupType::CS_GRP_CALL as u8)
            || is_call_mnemonic(self.arch, &mnemonic)
        {
            FlowKind::Call
        } else if has_group(groups, InsnGroupType::CS_GRP_RET as u8)
            || has_group(groups, InsnGroupType::CS_GRP_IRET as u8)
            || is_return_mnemonic(&mnemonic, op_str)
        {
            FlowKind::Return
        } else if is_supervisor_call(&mnemonic) {
            FlowKind::Trap
        } else if has_group(groups, InsnGroupType::CS_GRP_JUMP as u8) {
            FlowKind::Branch
        } else {
            FlowKind::Other
        };

        let target = match flow {
            FlowKind::Call | FlowKind::Branch => immediate_target(&detail),
            FlowKind::Return | FlowKind::Trap | FlowKind::Other => None,
        };

        Ok(DecodedInstruction { length, flow, target })
    }

    fn set_mode(&mut self, mode: IsaMode) -> Result<(), DecodeError> {
        if mode == IsaMode::Thumb && self.thumb.is_none() {
            return Err(DecodeError::UnsupportedMode(mode));
        }
        self.mode = mode;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}
