//! Control registers, TLB maintenance, CPUID and MSR access
//!
//! The inline assembly is gated on `target_arch = "x86"`; host builds (used
//! by the unit-test harness) get inert fallbacks that are never exercised
//! by the tests.

use spin::Once;

/// CR4 bit: Page Size Extension (4 MiB pages)
pub const CR4_PSE: u32 = 1 << 4;
/// CR4 bit: Page Global Enable
pub const CR4_PGE: u32 = 1 << 7;

/// CPUID leaf 1 EDX: processor supports PSE
const CPUID_FEAT_EDX_PSE: u32 = 1 << 3;
/// CPUID leaf 0x8000_0001 EDX: processor supports NX via EFER
const CPUID_FEAT_EDX_NX: u32 = 1 << 20;

/// Extended Feature Enable Register
const MSR_EFER: u32 = 0xC000_0080;
/// EFER bit: No-Execute Enable
const EFER_NXE: u64 = 1 << 11;

/// Read CR2 (faulting address of the last page fault)
pub fn read_cr2() -> usize {
    #[cfg(target_arch = "x86")]
    {
        let cr2: u32;
        // SAFETY: Reading CR2 is a privileged no-side-effect operation.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
        }
        cr2 as usize
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// Read CR3 (physical address of the active page directory)
pub fn read_cr3() -> usize {
    #[cfg(target_arch = "x86")]
    {
        let cr3: u32;
        // SAFETY: Reading CR3 is a privileged no-side-effect operation.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
        }
        (cr3 & 0xFFFF_F000) as usize
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// Load CR3, switching the active address space and flushing non-global
/// TLB entries.
///
/// # Safety
///
/// `pd_phys` must be the page-aligned physical address of a valid page
/// directory whose kernel half maps the currently executing code and
/// stack. The caller must have interrupts disabled for the duration of
/// the switch.
pub unsafe fn write_cr3(pd_phys: usize) {
    #[cfg(target_arch = "x86")]
    // SAFETY: contract forwarded to the caller.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pd_phys as u32, options(nostack));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = pd_phys;
}

/// Invalidate the TLB entry covering one virtual page
pub fn invlpg(vaddr: usize) {
    #[cfg(target_arch = "x86")]
    // SAFETY: invlpg only affects TLB caching; it cannot fault.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr as u32, options(nostack));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = vaddr;
}

#[cfg(target_arch = "x86")]
fn read_cr4() -> u32 {
    let cr4: u32;
    // SAFETY: Reading CR4 is a privileged no-side-effect operation.
    unsafe {
        core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack));
    }
    cr4
}

#[cfg(target_arch = "x86")]
unsafe fn write_cr4(value: u32) {
    // SAFETY: the caller only sets architecturally defined feature bits.
    unsafe {
        core::arch::asm!("mov cr4, {}", in(reg) value, options(nostack));
    }
}

/// Execute CPUID. Returns (eax, ebx, ecx, edx).
///
/// EBX is reserved by LLVM on x86, so it is bounced through ESI.
#[cfg(target_arch = "x86")]
fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
    // SAFETY: CPUID is unprivileged and side-effect free on registers we
    // do not declare.
    unsafe {
        core::arch::asm!(
            "xchg esi, ebx",
            "cpuid",
            "xchg esi, ebx",
            inout("eax") leaf => eax,
            out("esi") ebx,
            inout("ecx") 0u32 => ecx,
            out("edx") edx,
            options(nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

#[cfg(target_arch = "x86")]
fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdmsr of an architecturally defined MSR in ring 0.
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

#[cfg(target_arch = "x86")]
unsafe fn wrmsr(msr: u32, value: u64) {
    // SAFETY: the caller writes only architecturally defined MSR bits.
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Halt until the next interrupt
pub fn halt() {
    #[cfg(target_arch = "x86")]
    // SAFETY: hlt in ring 0 simply idles the CPU.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// CPU capabilities the paging engine and ELF loader consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// 4 MiB pages available and CR4.PSE set
    pub pse: bool,
    /// NX reported by CPUID and EFER.NXE set
    pub nx: bool,
}

static CPU_FEATURES: Once<CpuFeatures> = Once::new();

/// Detect PSE and NX, enable them (CR4.PSE, EFER.NXE) where reported, and
/// record the result. Called exactly once during early boot, before the
/// first page directory is built.
pub fn detect_and_enable_features() -> CpuFeatures {
    let features = *CPU_FEATURES.call_once(|| {
        #[cfg(target_arch = "x86")]
        {
            let (_, _, _, edx1) = cpuid(1);
            let pse = edx1 & CPUID_FEAT_EDX_PSE != 0;
            if pse {
                // SAFETY: PSE was reported by CPUID; setting CR4.PSE is
                // the documented enable sequence.
                unsafe { write_cr4(read_cr4() | CR4_PSE) };
            }

            let (max_ext, _, _, _) = cpuid(0x8000_0000);
            let nx = max_ext >= 0x8000_0001 && {
                let (_, _, _, edx) = cpuid(0x8000_0001);
                edx & CPUID_FEAT_EDX_NX != 0
            };
            if nx {
                // SAFETY: NX was reported; EFER.NXE is the documented
                // enable bit.
                unsafe { wrmsr(MSR_EFER, rdmsr(MSR_EFER) | EFER_NXE) };
            }

            CpuFeatures { pse, nx }
        }
        #[cfg(not(target_arch = "x86"))]
        {
            CpuFeatures {
                pse: false,
                nx: false,
            }
        }
    });
    log::info!(target: "cpu", "features: pse={} nx={}", features.pse, features.nx);
    features
}

/// The detected CPU features.
///
/// # Panics
///
/// If called before [`detect_and_enable_features`]; feature state has a
/// strict init-then-read phase.
pub fn features() -> CpuFeatures {
    *CPU_FEATURES
        .get()
        .expect("cpu features read before detection")
}
