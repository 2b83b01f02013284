//! Builds the ELF images the CLI tests run against.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

#[path = "../../../core/tests/common/mod.rs"]
mod common;

pub use common::{Asm, ElfBuilder};

pub const KTEXT: u64 = 0x401000;
pub const TEXT: u64 = 0x402000;

/// User code calling straight into `.ktext`.
pub fn violating_image(dir: &Path) -> PathBuf {
    let mut user = Asm::at(TEXT);
    user.call(KTEXT).ret();
    let mut kernel = Asm::at(KTEXT);
    kernel.nop().ret();
    ElfBuilder::x86_64()
        .text(".ktext", KTEXT, kernel.bytes())
        .text(".text", TEXT, user.bytes())
        .func("k_entry", KTEXT, 2)
        .func("user_main", TEXT, 6)
        .write(dir, "violating.elf")
}

/// User code that only enters the kernel through `syscall`.
pub fn clean_image(dir: &Path) -> PathBuf {
    let mut user = Asm::at(TEXT);
    user.nop().syscall().ret();
    let mut kernel = Asm::at(KTEXT);
    kernel.nop().ret();
    ElfBuilder::x86_64()
        .text(".ktext", KTEXT, kernel.bytes())
        .text(".text", TEXT, user.bytes())
        .func("k_entry", KTEXT, 2)
        .func("user_main", TEXT, 4)
        .func("user_alias", TEXT, 4)
        .write(dir, "clean.elf")
}
