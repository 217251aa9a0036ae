//! Executable memory management using mmap.
//!
//! Each finished method buffer gets its own page-aligned mapping. The mapping
//! starts read/write, receives the code once, and is then sealed read/execute,
//! so no page is ever writable and executable at the same time. A mapping
//! stays alive as long as the [`PageManager`] or any [`CodeHandle`] pointing
//! into it does, so compiled code never dangles.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed ({0} bytes)")]
    AllocationFailed(usize),
    #[error("invalid memory size")]
    InvalidSize,
    #[error("failed to make code executable")]
    ProtectionFailed,
}

/// One mmap'd region holding the code of a single method.
pub struct Page {
    ptr: NonNull<u8>,
    size: usize,
    sealed: AtomicBool,
}

impl Page {
    /// Map `size` bytes (rounded up to the page size) as read/write.
    fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page_size = page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(aligned_size));
        }
        let ptr =
            NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed(aligned_size))?;

        Ok(Self {
            ptr,
            size: aligned_size,
            sealed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn can_add(&self, len: usize) -> bool {
        len > 0 && !self.is_sealed() && self.size >= len
    }

    /// Copy `code` to the start of the page and flip it to read/execute.
    /// Callers hold the manager lock.
    fn install(&self, code: &[u8]) -> Result<NonNull<u8>, MemoryError> {
        if self.sealed.swap(true, Ordering::AcqRel) || code.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(self.ptr)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// Page owns its mapping; it is written once, under the manager lock, before sealing.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

/// A method's code inside a page. Keeps the page mapped.
pub struct CodeHandle {
    page: Arc<Page>,
    ptr: NonNull<u8>,
    len: usize,
}

impl CodeHandle {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The code bytes as installed.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn page_size(&self) -> usize {
        self.page.size()
    }
}

unsafe impl Send for CodeHandle {}
unsafe impl Sync for CodeHandle {}

/// Hands out one sealed executable page per finished code buffer.
pub struct PageManager {
    pages: Vec<Arc<Page>>,
    page_size: usize,
}

impl PageManager {
    /// Start with `initial` writable pages, the i-th sized `page_size * (i + 1)`.
    pub fn new(initial: usize) -> Result<Self, MemoryError> {
        let page_size = page_size();
        let mut pages = Vec::with_capacity(initial);
        for i in 0..initial {
            pages.push(Arc::new(Page::new(page_size * (i + 1))?));
        }
        Ok(Self { pages, page_size })
    }

    /// Install `code` in the first unsealed page large enough for it, mapping
    /// a new page when none fits.
    pub fn get_page(&mut self, code: &[u8]) -> Result<CodeHandle, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::InvalidSize);
        }

        let page = match self.pages.iter().find(|p| p.can_add(code.len())) {
            Some(page) => Arc::clone(page),
            None => {
                let factor = code.len() / self.page_size + 1;
                let page = Arc::new(Page::new(factor * self.page_size)?);
                log::debug!(
                    "mapped executable page #{} ({} bytes)",
                    self.pages.len(),
                    page.size()
                );
                self.pages.push(Arc::clone(&page));
                page
            }
        };

        let ptr = page.install(code)?;
        Ok(CodeHandle {
            page,
            ptr,
            len: code.len(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Get the page size for the current system.
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_pages() {
        let pm = PageManager::new(4).unwrap();
        assert_eq!(pm.page_count(), 4);
        assert_eq!(pm.pages[3].size(), pm.page_size() * 4);
        assert!(pm.pages.iter().all(|p| !p.is_sealed()));
    }

    #[test]
    fn test_code_is_copied() {
        let mut pm = PageManager::new(1).unwrap();
        let handle = pm.get_page(&[0x48, 0x31, 0xC0, 0xC3]).unwrap();

        assert_eq!(handle.bytes(), &[0x48, 0x31, 0xC0, 0xC3]);
        assert_eq!(handle.as_ptr() as usize % pm.page_size(), 0);
    }

    #[test]
    fn test_sealed_page_not_reused() {
        let mut pm = PageManager::new(1).unwrap();
        let a = pm.get_page(&[0xC3; 10]).unwrap();
        let b = pm.get_page(&[0xC3; 10]).unwrap();

        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pm.page_count(), 2);
        assert!(pm.pages.iter().all(|p| p.is_sealed()));
    }

    #[test]
    fn test_grows_for_large_buffer() {
        let mut pm = PageManager::new(1).unwrap();
        let big = vec![0x90u8; pm.page_size() * 2 + 1];
        let handle = pm.get_page(&big).unwrap();

        assert_eq!(pm.page_count(), 2);
        assert!(handle.page_size() >= big.len());
    }

    #[test]
    fn test_handle_outlives_manager() {
        let handle = {
            let mut pm = PageManager::new(1).unwrap();
            pm.get_page(&[0xC3]).unwrap()
        };
        assert_eq!(handle.bytes(), &[0xC3]);
    }

    #[test]
    fn test_empty_code_rejected() {
        let mut pm = PageManager::new(1).unwrap();
        assert!(pm.get_page(&[]).is_err());
    }

    /// Permissions of the mapping containing `addr`, as listed by the kernel.
    #[cfg(target_os = "linux")]
    fn mapping_perms(addr: usize) -> Option<String> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            let perms = fields.next()?;
            (start <= addr && addr < end).then(|| perms.to_string())
        })
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_installed_code_is_not_writable() {
        let mut pm = PageManager::new(1).unwrap();
        let fresh = pm.pages[0].ptr.as_ptr() as usize;
        let perms = mapping_perms(fresh).expect("fresh page mapping");
        assert!(perms.starts_with("rw-"), "fresh page is {}", perms);

        let handle = pm.get_page(&[0x31, 0xC0, 0xC3]).unwrap();
        let perms = mapping_perms(handle.as_ptr() as usize).expect("code mapping");
        assert!(perms.starts_with("r-x"), "installed code is {}", perms);
    }
}
