//! Architecture support
//!
//! Only 32-bit x86 (non-PAE) is targeted. The module still compiles for
//! other architectures so that unit tests run on the host; every
//! instruction-level operation is `#[cfg(target_arch = "x86")]`-gated with
//! an inert fallback.

pub mod x86;
