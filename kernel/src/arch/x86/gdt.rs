//! GDT selector layout
//!
//! The descriptor table itself is installed by the platform layer; the
//! core only consumes the selector values.
//!
//! Layout:
//! - 0x00: Null descriptor
//! - 0x08: Kernel code segment (Ring 0)
//! - 0x10: Kernel data segment (Ring 0)
//! - 0x18: User code segment (Ring 3, selector 0x1B with RPL)
//! - 0x20: User data segment (Ring 3, selector 0x23 with RPL)
//! - 0x28: TSS

pub const KERNEL_CODE_SELECTOR: u32 = 0x08;
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;
pub const USER_CODE_SELECTOR: u32 = 0x18;
pub const USER_DATA_SELECTOR: u32 = 0x20;
pub const TSS_SELECTOR: u32 = 0x28;

/// Requested privilege level for ring-3 selectors
pub const RPL_USER: u32 = 3;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn user_selectors_carry_rpl3() {
        assert_eq!(USER_CODE_SELECTOR | RPL_USER, 0x1B);
        assert_eq!(USER_DATA_SELECTOR | RPL_USER, 0x23);
    }
}
