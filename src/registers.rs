//! Register files as the kernel captures and restores them.
//!
//! Two records exist: the 32-bit and the 64-bit CONTEXT. A context is
//! arch-tagged because a 32-bit runtime handles both: its own threads carry
//! 32-bit contexts, but a thread suspended inside the 32-on-64 emulation
//! layer is only described truthfully by the 64-bit record.

use std::mem;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_pointer_width = "64")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;
#[cfg(not(target_pointer_width = "64"))]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X86;

// CONTEXT flag words. The arch base bit is part of the value the kernel
// checks, so these are full values, not bare bits.
pub const CONTEXT_I386: u32 = 0x0001_0000;
pub const CONTEXT_AMD64: u32 = 0x0010_0000;
const CONTEXT_CONTROL_BIT: u32 = 0x1;
const CONTEXT_INTEGER_BIT: u32 = 0x2;
const CONTEXT_SEGMENTS_BIT: u32 = 0x4;
const CONTEXT_FLOATING_POINT_BIT: u32 = 0x8;

pub fn context_control(arch: SupportedArch) -> u32 {
    arch_base(arch) | CONTEXT_CONTROL_BIT
}

pub fn context_full(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => {
            CONTEXT_I386 | CONTEXT_CONTROL_BIT | CONTEXT_INTEGER_BIT | CONTEXT_SEGMENTS_BIT
        }
        SupportedArch::X64 => {
            CONTEXT_AMD64
                | CONTEXT_CONTROL_BIT
                | CONTEXT_INTEGER_BIT
                | CONTEXT_FLOATING_POINT_BIT
        }
    }
}

fn arch_base(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => CONTEXT_I386,
        SupportedArch::X64 => CONTEXT_AMD64,
    }
}

/// 32-bit CONTEXT, exactly as the kernel lays it out.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Context32 {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: [u8; 112],
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    pub extended_registers: [u8; 512],
}

const_assert_eq!(mem::size_of::<Context32>(), 0x2CC);

/// 64-bit CONTEXT. 16-byte alignment is a kernel requirement, not a hint.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct Context64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub flt_save: [u8; 512],
    pub vector_register: [u8; 416],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

const_assert_eq!(mem::size_of::<Context64>(), 0x4D0);

impl Default for Context32 {
    fn default() -> Context32 {
        // All-zero is a valid (if useless) CONTEXT.
        unsafe { mem::zeroed() }
    }
}

impl Default for Context64 {
    fn default() -> Context64 {
        unsafe { mem::zeroed() }
    }
}

impl Context64 {
    /// Write the low dword of r8 the way a 32-bit register write would:
    /// high dword cleared.
    pub fn set_r8d(&mut self, value: u32) {
        self.r8 = value as u64;
    }

    pub fn set_r9d(&mut self, value: u32) {
        self.r9 = value as u64;
    }

    pub fn r8d(&self) -> u32 {
        self.r8 as u32
    }

    pub fn r9d(&self) -> u32 {
        self.r9 as u32
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union ContextUnion {
    x86: Context32,
    x64: Context64,
}

/// Arch-tagged register file.
#[derive(Copy, Clone)]
pub struct Context {
    arch_: SupportedArch,
    u: ContextUnion,
}

macro_rules! ctx_get_reg {
    ($slf:expr, $x86case:ident, $x64case:ident) => {
        unsafe {
            match $slf.arch_ {
                crate::registers::SupportedArch::X86 => $slf.u.x86.$x86case as usize,
                crate::registers::SupportedArch::X64 => $slf.u.x64.$x64case as usize,
            }
        }
    };
}

macro_rules! ctx_set_reg {
    ($slf:expr, $x86case:ident, $x64case:ident, $val:expr) => {
        unsafe {
            match $slf.arch_ {
                crate::registers::SupportedArch::X86 => {
                    $slf.u.x86.$x86case = $val as u32;
                }
                crate::registers::SupportedArch::X64 => {
                    $slf.u.x64.$x64case = $val as u64;
                }
            }
        }
    };
}

impl Context {
    pub fn new(arch: SupportedArch) -> Context {
        let mut c = Context {
            arch_: arch,
            u: ContextUnion {
                x64: Context64::default(),
            },
        };
        c.set_context_flags(context_full(arch));
        c
    }

    pub fn from_x86(ctx: Context32) -> Context {
        Context {
            arch_: SupportedArch::X86,
            u: ContextUnion { x86: ctx },
        }
    }

    pub fn from_x64(ctx: Context64) -> Context {
        Context {
            arch_: SupportedArch::X64,
            u: ContextUnion { x64: ctx },
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn ip(&self) -> usize {
        ctx_get_reg!(self, eip, rip)
    }

    pub fn set_ip(&mut self, ip: usize) {
        ctx_set_reg!(self, eip, rip, ip)
    }

    pub fn sp(&self) -> usize {
        ctx_get_reg!(self, esp, rsp)
    }

    pub fn set_sp(&mut self, sp: usize) {
        ctx_set_reg!(self, esp, rsp, sp)
    }

    pub fn flags(&self) -> usize {
        unsafe {
            match self.arch_ {
                SupportedArch::X86 => self.u.x86.eflags as usize,
                SupportedArch::X64 => self.u.x64.eflags as usize,
            }
        }
    }

    pub fn context_flags(&self) -> u32 {
        unsafe {
            match self.arch_ {
                SupportedArch::X86 => self.u.x86.context_flags,
                SupportedArch::X64 => self.u.x64.context_flags,
            }
        }
    }

    pub fn set_context_flags(&mut self, flags: u32) {
        unsafe {
            match self.arch_ {
                SupportedArch::X86 => self.u.x86.context_flags = flags,
                SupportedArch::X64 => self.u.x64.context_flags = flags,
            }
        }
    }

    pub fn as_x86(&self) -> &Context32 {
        debug_assert!(self.arch_ == SupportedArch::X86);
        unsafe { &self.u.x86 }
    }

    pub fn as_x86_mut(&mut self) -> &mut Context32 {
        debug_assert!(self.arch_ == SupportedArch::X86);
        unsafe { &mut self.u.x86 }
    }

    pub fn as_x64(&self) -> &Context64 {
        debug_assert!(self.arch_ == SupportedArch::X64);
        unsafe { &self.u.x64 }
    }

    pub fn as_x64_mut(&mut self) -> &mut Context64 {
        debug_assert!(self.arch_ == SupportedArch::X64);
        unsafe { &mut self.u.x64 }
    }
}

fn to_narrow(r32: &mut u32, r64: u64) {
    *r32 = r64 as u32;
}

/// Project the 32-bit register file out of a wide context. What the
/// emulation layer would materialise on kernel exit, minus the segment
/// bases it keeps to itself.
pub fn narrow_from_wide(wide: &Context64) -> Context32 {
    let mut narrow = Context32::default();
    narrow.context_flags = context_full(SupportedArch::X86);
    to_narrow(&mut narrow.eax, wide.rax);
    to_narrow(&mut narrow.ebx, wide.rbx);
    to_narrow(&mut narrow.ecx, wide.rcx);
    to_narrow(&mut narrow.edx, wide.rdx);
    to_narrow(&mut narrow.esi, wide.rsi);
    to_narrow(&mut narrow.edi, wide.rdi);
    to_narrow(&mut narrow.esp, wide.rsp);
    to_narrow(&mut narrow.ebp, wide.rbp);
    to_narrow(&mut narrow.eip, wide.rip);
    narrow.eflags = wide.eflags;
    narrow.seg_cs = wide.seg_cs as u32;
    narrow.seg_ds = wide.seg_ds as u32;
    narrow.seg_es = wide.seg_es as u32;
    narrow.seg_fs = wide.seg_fs as u32;
    narrow.seg_gs = wide.seg_gs as u32;
    narrow.seg_ss = wide.seg_ss as u32;
    narrow
}
