//! Executable memory for trampolines
//!
//! `CodeMemory` is the seam between the trampoline pools and the OS. The
//! pools need page-sized, page-aligned blocks that start writable, become
//! read+execute once the code is in place, and are unmapped as a whole.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{ForeignError, ForeignResult};

/// Provider of page-aligned executable blocks
pub trait CodeMemory: Send + Sync {
    /// OS page granularity; every block is this size and alignment
    fn page_size(&self) -> usize;

    /// Map one writable page
    fn allocate(&self) -> ForeignResult<*mut u8>;

    /// Switch a page written through `allocate` to read+execute
    fn make_executable(&self, page: *mut u8) -> ForeignResult<()>;

    /// Unmap a page
    fn free(&self, page: *mut u8) -> ForeignResult<()>;

    /// Make freshly written code visible to every core before it runs
    fn flush_icache(&self, _start: *const u8, _len: usize) {
        // x86-64 keeps instruction fetch coherent with stores; the fence
        // orders the writes before the address is published to other threads
        fence(Ordering::SeqCst);
    }
}

impl<M: CodeMemory + ?Sized> CodeMemory for Arc<M> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn allocate(&self) -> ForeignResult<*mut u8> {
        (**self).allocate()
    }

    fn make_executable(&self, page: *mut u8) -> ForeignResult<()> {
        (**self).make_executable(page)
    }

    fn free(&self, page: *mut u8) -> ForeignResult<()> {
        (**self).free(page)
    }

    fn flush_icache(&self, start: *const u8, len: usize) {
        (**self).flush_icache(start, len)
    }
}

/// OS page size
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

/// Alignment of fresh mappings: the most a pool can be and still be
/// recovered from any slot address by masking
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwAllocationGranularity as usize
    }

    // unix allocations over-map to any power-of-two alignment
    #[cfg(not(windows))]
    {
        usize::MAX
    }
}

/// Executable pages straight from the OS (mmap / VirtualAlloc)
#[derive(Debug, Clone, Copy)]
pub struct OsCodeMemory {
    page_size: usize,
}

impl OsCodeMemory {
    pub fn new() -> Self {
        Self {
            page_size: os_page_size(),
        }
    }

    /// Use `page_size` instead of the OS value. Must be a power of two no
    /// smaller than the OS page; on Windows, no larger than the allocation
    /// granularity.
    pub fn with_page_size(page_size: usize) -> Self {
        Self { page_size }
    }
}

impl Default for OsCodeMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl CodeMemory for OsCodeMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> ForeignResult<*mut u8> {
        // mmap only aligns to the OS page; larger pools over-map and trim
        let os_page = os_page_size();
        let span = if self.page_size > os_page {
            self.page_size * 2
        } else {
            self.page_size
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                span,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ForeignError::ResourceExhausted(format!(
                "mmap of {} bytes failed: {}",
                span,
                std::io::Error::last_os_error()
            )));
        }
        if span == self.page_size {
            return Ok(ptr as *mut u8);
        }

        let start = ptr as usize;
        let aligned = align_up(start, self.page_size);
        let head = aligned - start;
        let tail = span - head - self.page_size;
        unmap_excess(start, head);
        unmap_excess(aligned + self.page_size, tail);
        Ok(aligned as *mut u8)
    }

    fn make_executable(&self, page: *mut u8) -> ForeignResult<()> {
        let rc = unsafe { libc::mprotect(page as *mut _, self.page_size, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(ForeignError::ResourceExhausted(format!(
                "mprotect(PROT_READ|PROT_EXEC) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn free(&self, page: *mut u8) -> ForeignResult<()> {
        if page.is_null() {
            return Ok(());
        }
        let rc = unsafe { libc::munmap(page as *mut _, self.page_size) };
        if rc != 0 {
            return Err(ForeignError::ResourceExhausted(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn align_up(address: usize, align: usize) -> usize {
    (address + align - 1) & !(align - 1)
}

#[cfg(unix)]
fn unmap_excess(start: usize, len: usize) {
    if len == 0 {
        return;
    }
    let rc = unsafe { libc::munmap(start as *mut _, len) };
    if rc != 0 {
        tracing::warn!(
            target: "raya_foreign::memory",
            start = format_args!("0x{:x}", start),
            len,
            error = %std::io::Error::last_os_error(),
            "failed to trim over-mapped code page"
        );
    }
}

#[cfg(windows)]
impl CodeMemory for OsCodeMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> ForeignResult<*mut u8> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe { VirtualAlloc(std::ptr::null(), self.page_size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(ForeignError::ResourceExhausted(format!(
                "VirtualAlloc of {} bytes failed: {}",
                self.page_size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as *mut u8)
    }

    fn make_executable(&self, page: *mut u8) -> ForeignResult<()> {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};

        let mut old = 0;
        let ok = unsafe { VirtualProtect(page as *const _, self.page_size, PAGE_EXECUTE_READ, &mut old) };
        if ok == 0 {
            return Err(ForeignError::ResourceExhausted(format!(
                "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn free(&self, page: *mut u8) -> ForeignResult<()> {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        if page.is_null() {
            return Ok(());
        }
        let ok = unsafe { VirtualFree(page as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(ForeignError::ResourceExhausted(format!(
                "VirtualFree failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn flush_icache(&self, start: *const u8, len: usize) {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        unsafe { FlushInstructionCache(GetCurrentProcess(), start as *const _, len) };
        fence(Ordering::SeqCst);
    }
}
