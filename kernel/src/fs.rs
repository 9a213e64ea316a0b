//! Filesystem collaborator
//!
//! The memory/process core does not mount or parse filesystems; the
//! platform layer registers a provider and the ELF loader pulls whole
//! files through it. Paths are absolute from the provider's mount root.

extern crate alloc;

use alloc::vec::Vec;

use spin::Once;

use crate::error::{KernelError, KernelResult};

/// Whole-file read interface the platform layer implements.
pub trait FileSystem: Sync {
    /// Read the entire file at `path` into a kernel-heap buffer.
    fn read_file(&self, path: &str) -> KernelResult<Vec<u8>>;
}

static FILESYSTEM: Once<&'static dyn FileSystem> = Once::new();

/// Register the filesystem provider. First registration wins.
pub fn register(fs: &'static dyn FileSystem) {
    FILESYSTEM.call_once(|| fs);
}

/// Read a whole file through the registered provider.
pub fn read_file(path: &str) -> KernelResult<Vec<u8>> {
    match FILESYSTEM.get() {
        Some(fs) => fs.read_file(path),
        None => Err(KernelError::NotInitialized { subsystem: "fs" }),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct OneFile;

    impl FileSystem for OneFile {
        fn read_file(&self, path: &str) -> KernelResult<Vec<u8>> {
            if path == "/init.bin" {
                Ok(Vec::from(&b"\x7FELF"[..]))
            } else {
                Err(KernelError::FileUnavailable)
            }
        }
    }

    #[test]
    fn registration_and_lookup() {
        static FS: OneFile = OneFile;
        register(&FS);
        assert_eq!(read_file("/init.bin").unwrap(), b"\x7FELF");
        assert_eq!(read_file("/missing"), Err(KernelError::FileUnavailable));
    }
}
