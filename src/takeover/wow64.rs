//! The 32-on-64 transition windows.
//!
//! When a 32-bit thread crosses into the kernel, the emulation layer's cpu
//! stub saves the 32-bit register file into memory and restores it on the
//! way out. A thread suspended *inside* that stub cannot be redirected
//! through the narrow context: whatever we write is overwritten or ignored
//! on resume. Instead, the 32-bit return address the stub is shuffling
//! gets replaced in place, wherever it currently lives. Which place that
//! is depends on the exact instruction the wide instruction pointer sits
//! on, and the instruction sequences are kernel-generation specific.
//!
//! The byte patterns below are consumed verbatim; new kernel generations
//! get a new table here and nothing else changes.

use crate::os_version::KernelGeneration;

/// Where the in-flight 32-bit return address lives right now.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Wow64Rewrite {
    /// In the word at `[esp]`.
    StackSlot,
    /// In the word at `[r14]`.
    R14Slot,
    /// In the low dword of r8.
    R8Reg,
    /// In the low dword of r9.
    R9Reg,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Wow64Window {
    Save,
    Restore,
}

pub struct Wow64Case {
    /// Instruction bytes at the wide instruction pointer. First match
    /// wins, so longer patterns that share a prefix come first.
    pub pattern: &'static [u8],
    pub window: Wow64Window,
    pub rewrite: Wow64Rewrite,
}

// Instruction encodings the patterns are assembled from:
//   4C 87 F4                    xchg rsp, r14
//   45 8B 06                    mov r8d, [r14]
//   45 8B 0E                    mov r9d, [r14]
//   45 89 0E                    mov [r14], r9d
//   44 89 84 24 98 00 00 00     mov [rsp+0x98], r8d
//   67 44 8B 04 24              mov r8d, [esp]
//   41 FF 26                    jmp qword [r14]
//   41 FF E0                    jmp r8

/// Windows 8 / 8.1 stub.
pub static WOW64_CASES_WIN8: [Wow64Case; 4] = [
    // Save window, 1st instruction: return address still at [esp].
    Wow64Case {
        pattern: &[0x4C, 0x87, 0xF4, 0x45, 0x8B, 0x06],
        window: Wow64Window::Save,
        rewrite: Wow64Rewrite::StackSlot,
    },
    // Save window, 2nd instruction: return address about to land in r8d.
    Wow64Case {
        pattern: &[0x45, 0x8B, 0x06],
        window: Wow64Window::Save,
        rewrite: Wow64Rewrite::R8Reg,
    },
    // Restore window, 2nd-to-last: return address in r9d.
    Wow64Case {
        pattern: &[0x45, 0x89, 0x0E],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::R9Reg,
    },
    // Restore window, last: return address already copied to [r14].
    Wow64Case {
        pattern: &[0x41, 0xFF, 0x26],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::R14Slot,
    },
];

/// Windows 10 stub: a different save sequence and two distinct restore
/// paths.
pub static WOW64_CASES_WIN10: [Wow64Case; 7] = [
    // Save window, 1st instruction: return address still at [esp].
    Wow64Case {
        pattern: &[0x4C, 0x87, 0xF4, 0x45, 0x8B, 0x06],
        window: Wow64Window::Save,
        rewrite: Wow64Rewrite::StackSlot,
    },
    // Save window, 2nd instruction: stacks already swapped, return
    // address reachable through [r14].
    Wow64Case {
        pattern: &[0x45, 0x8B, 0x06],
        window: Wow64Window::Save,
        rewrite: Wow64Rewrite::R14Slot,
    },
    // Save window, 3rd instruction: return address held in r8d.
    Wow64Case {
        pattern: &[0x44, 0x89, 0x84, 0x24, 0x98, 0x00, 0x00, 0x00],
        window: Wow64Window::Save,
        rewrite: Wow64Rewrite::R8Reg,
    },
    // Restore path one: return address in r9d, then already in [r14].
    Wow64Case {
        pattern: &[0x45, 0x89, 0x0E],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::R9Reg,
    },
    Wow64Case {
        pattern: &[0x41, 0xFF, 0x26],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::R14Slot,
    },
    // Restore path two: return address at [esp], then in r8d.
    Wow64Case {
        pattern: &[0x67, 0x44, 0x8B, 0x04, 0x24],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::StackSlot,
    },
    Wow64Case {
        pattern: &[0x41, 0xFF, 0xE0],
        window: Wow64Window::Restore,
        rewrite: Wow64Rewrite::R8Reg,
    },
];

/// The tables are chosen explicitly by kernel generation. Pre-Win8
/// emulation layers restore from the canonical saved frame, so the narrow
/// context write works there and no rewrite cases exist.
pub fn wow64_cases(generation: KernelGeneration) -> &'static [Wow64Case] {
    match generation {
        KernelGeneration::PreWin8 => &[],
        KernelGeneration::Win8 => &WOW64_CASES_WIN8,
        KernelGeneration::Win10 => &WOW64_CASES_WIN10,
    }
}

/// First case whose pattern prefixes the bytes at the wide instruction
/// pointer.
pub fn classify(cases: &'static [Wow64Case], code: &[u8]) -> Option<&'static Wow64Case> {
    cases.iter().find(|case| code.starts_with(case.pattern))
}

/// The 32-bit call gate every legitimate kernel transition goes through:
/// `call dword ptr fs:[0xC0]`. A continuation address produced by the
/// rewrite path must be preceded by exactly this sequence.
pub const WOW64_CALL_GATE: [u8; 7] = [0x64, 0xFF, 0x15, 0xC0, 0x00, 0x00, 0x00];
