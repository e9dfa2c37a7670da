//! Platform Module - OS Shim
//!
//! Virtual memory operations, physical memory probing and small timing
//! helpers. This is the only module that talks to the operating system.
//!
//! Memory lifecycle:
//!
//! ```text
//! Reserve ──► Commit ──► Use ──► Decommit ──► (Release on drop)
//!    │          │         │          │
//!    │          │         │          └── madvise(MADV_DONTNEED) + PROT_NONE
//!    │          │         └── Read/Write operations
//!    │          └── mprotect(PROT_READ | PROT_WRITE)
//!    └── mmap(PROT_NONE, MAP_NORESERVE)
//! ```

pub mod write_watch;

pub use write_watch::WriteWatch;

use crate::error::{GcError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Align a size up to the system page size.
pub fn align_to_page(size: usize) -> usize {
    let page = page_size::get();
    (size + page - 1) & !(page - 1)
}

/// VirtualMemory - one large reserved address range with commit-on-demand.
///
/// The collector reserves the whole region range up front and commits
/// physical pages only as regions grow. Committed ranges are tracked so
/// decommit and accounting stay exact.
///
/// # Thread Safety
///
/// - `committed_ranges` uses an RwLock for concurrent readers
/// - `committed_size` is read with atomics on the accounting paths
pub struct VirtualMemory {
    /// Base address of the reservation
    base: usize,

    /// Total reserved size in bytes
    reserved_size: usize,

    /// Committed ranges: offset -> size
    committed_ranges: RwLock<BTreeMap<usize, usize>>,

    /// Total committed size (cached for accounting)
    committed_size: AtomicUsize,
}

// The mapping is owned exclusively; raw addresses handed out are managed
// by the collector's region discipline.
unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Reserve `size` bytes of address space without committing any
    /// physical memory.
    pub fn reserve(size: usize) -> Result<Self> {
        let aligned_size = align_to_page(size);
        let base = os::reserve(aligned_size)?;

        log::debug!(
            "reserved {} bytes of address space at {:#x}",
            aligned_size,
            base
        );

        Ok(Self {
            base,
            reserved_size: aligned_size,
            committed_ranges: RwLock::new(BTreeMap::new()),
            committed_size: AtomicUsize::new(0),
        })
    }

    /// Base address of the reservation.
    pub fn base(&self) -> usize {
        self.base
    }

    /// End address of the reservation (exclusive).
    pub fn end(&self) -> usize {
        self.base + self.reserved_size
    }

    /// Total reserved bytes.
    pub fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    /// Total committed bytes.
    pub fn committed_size(&self) -> usize {
        self.committed_size.load(Ordering::Relaxed)
    }

    /// Commit physical memory for `[addr, addr + size)`.
    ///
    /// The range must lie inside the reservation. Already-committed pages
    /// inside the range are tolerated.
    pub fn commit(&self, addr: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = addr.checked_add(size).ok_or_else(|| {
            GcError::VirtualMemory(format!("commit range overflow at {:#x}", addr))
        })?;
        if addr < self.base || end > self.end() {
            return Err(GcError::VirtualMemory(format!(
                "commit [{:#x}, {:#x}) outside reservation [{:#x}, {:#x})",
                addr,
                end,
                self.base,
                self.end()
            )));
        }

        let page = page_size::get();
        let lo = (addr - self.base) & !(page - 1);
        let hi = align_to_page(end - self.base);

        os::commit(self.base + lo, hi - lo)?;

        let mut ranges = self.committed_ranges.write().unwrap_or_else(|e| e.into_inner());
        let added = merge_range(&mut ranges, lo, hi - lo);
        self.committed_size.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    /// Return physical memory for `[addr, addr + size)` to the OS.
    ///
    /// The address range stays reserved and may be recommitted later.
    pub fn decommit(&self, addr: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let page = page_size::get();
        let lo = align_to_page(addr - self.base);
        let hi = (addr + size - self.base) & !(page - 1);
        if hi <= lo {
            return Ok(());
        }

        os::decommit(self.base + lo, hi - lo)?;

        let mut ranges = self.committed_ranges.write().unwrap_or_else(|e| e.into_inner());
        let removed = remove_range(&mut ranges, lo, hi - lo);
        self.committed_size.fetch_sub(removed, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        os::release(self.base, self.reserved_size);
    }
}

/// Insert `[offset, offset+size)` into the committed map, coalescing with
/// neighbors. Returns the number of newly-committed bytes.
fn merge_range(ranges: &mut BTreeMap<usize, usize>, offset: usize, size: usize) -> usize {
    let mut lo = offset;
    let mut hi = offset + size;
    let mut already = 0usize;

    // Absorb every existing range overlapping or adjacent to [lo, hi).
    let overlapping: Vec<(usize, usize)> = ranges
        .range(..=hi)
        .rev()
        .take_while(|(start, len)| *start + *len >= lo)
        .map(|(s, l)| (*s, *l))
        .collect();
    for (start, len) in overlapping {
        let o_lo = start.max(lo);
        let o_hi = (start + len).min(hi);
        if o_hi > o_lo {
            already += o_hi - o_lo;
        }
        lo = lo.min(start);
        hi = hi.max(start + len);
        ranges.remove(&start);
    }
    ranges.insert(lo, hi - lo);
    size - already
}

/// Remove `[offset, offset+size)` from the committed map. Returns the
/// number of bytes that were actually committed.
fn remove_range(ranges: &mut BTreeMap<usize, usize>, offset: usize, size: usize) -> usize {
    let lo = offset;
    let hi = offset + size;
    let mut removed = 0usize;

    let overlapping: Vec<(usize, usize)> = ranges
        .range(..hi)
        .rev()
        .take_while(|(start, len)| *start + *len > lo)
        .map(|(s, l)| (*s, *l))
        .collect();
    for (start, len) in overlapping {
        ranges.remove(&start);
        let r_hi = start + len;
        if start < lo {
            ranges.insert(start, lo - start);
        }
        if r_hi > hi {
            ranges.insert(hi, r_hi - hi);
        }
        removed += r_hi.min(hi) - start.max(lo);
    }
    removed
}

/// Snapshot of physical-memory status used by the tuner.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStatus {
    /// Total physical memory in bytes
    pub total_physical: usize,
    /// Available physical memory in bytes
    pub available_physical: usize,
    /// Memory load percentage [0, 100]
    pub load_percent: u32,
}

/// Probe current physical memory status.
pub fn memory_status() -> MemoryStatus {
    os::memory_status()
}

/// Monotonic high-resolution timestamp.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Number of processors usable by the collector.
pub fn processor_count() -> usize {
    num_cpus::get().max(1)
}

#[cfg(unix)]
mod os {
    use crate::error::{GcError, Result};

    pub fn reserve(size: usize) -> Result<usize> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(GcError::VirtualMemory(format!(
                "mmap reserve of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(addr as usize)
    }

    pub fn commit(addr: usize, size: usize) -> Result<()> {
        let rc = unsafe {
            libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE)
        };
        if rc != 0 {
            return Err(GcError::VirtualMemory(format!(
                "mprotect commit at {:#x} ({} bytes) failed: {}",
                addr,
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn decommit(addr: usize, size: usize) -> Result<()> {
        unsafe {
            libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
            let rc = libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE);
            if rc != 0 {
                return Err(GcError::VirtualMemory(format!(
                    "mprotect decommit at {:#x} failed: {}",
                    addr,
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    pub fn release(addr: usize, size: usize) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size);
        }
    }

    pub fn memory_status() -> super::MemoryStatus {
        #[cfg(target_os = "linux")]
        {
            if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
                let mut total = 0usize;
                let mut available = 0usize;
                for line in meminfo.lines() {
                    if let Some(rest) = line.strip_prefix("MemTotal:") {
                        total = parse_kb(rest);
                    } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                        available = parse_kb(rest);
                    }
                }
                if total > 0 {
                    let used = total.saturating_sub(available);
                    return super::MemoryStatus {
                        total_physical: total,
                        available_physical: available,
                        load_percent: ((used as u128 * 100) / total as u128) as u32,
                    };
                }
            }
        }
        super::MemoryStatus {
            total_physical: 8 << 30,
            available_physical: 4 << 30,
            load_percent: 50,
        }
    }

    #[cfg(target_os = "linux")]
    fn parse_kb(rest: &str) -> usize {
        rest.trim()
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    }
}

#[cfg(windows)]
mod os {
    use crate::error::{GcError, Result};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_NOACCESS, PAGE_READWRITE,
    };

    pub fn reserve(size: usize) -> Result<usize> {
        let addr =
            unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };
        if addr.is_null() {
            return Err(GcError::VirtualMemory(format!(
                "VirtualAlloc reserve of {} bytes failed",
                size
            )));
        }
        Ok(addr as usize)
    }

    pub fn commit(addr: usize, size: usize) -> Result<()> {
        let p = unsafe {
            VirtualAlloc(addr as *const std::ffi::c_void, size, MEM_COMMIT, PAGE_READWRITE)
        };
        if p.is_null() {
            return Err(GcError::VirtualMemory(format!(
                "VirtualAlloc commit at {:#x} failed",
                addr
            )));
        }
        Ok(())
    }

    pub fn decommit(addr: usize, size: usize) -> Result<()> {
        let ok = unsafe { VirtualFree(addr as *mut std::ffi::c_void, size, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(GcError::VirtualMemory(format!(
                "VirtualFree decommit at {:#x} failed",
                addr
            )));
        }
        Ok(())
    }

    pub fn release(addr: usize, _size: usize) {
        unsafe {
            VirtualFree(addr as *mut std::ffi::c_void, 0, MEM_RELEASE);
        }
    }

    pub fn memory_status() -> super::MemoryStatus {
        super::MemoryStatus {
            total_physical: 8 << 30,
            available_physical: 4 << 30,
            load_percent: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_decommit() {
        let vm = VirtualMemory::reserve(1 << 20).unwrap();
        assert_eq!(vm.committed_size(), 0);

        vm.commit(vm.base(), 8192).unwrap();
        assert_eq!(vm.committed_size(), 8192);

        // Writing committed memory must not fault.
        unsafe {
            std::ptr::write(vm.base() as *mut usize, 0xDEAD_BEEF);
            assert_eq!(std::ptr::read(vm.base() as *const usize), 0xDEAD_BEEF);
        }

        // Overlapping commit accounts only the new pages.
        vm.commit(vm.base() + 4096, 8192).unwrap();
        assert_eq!(vm.committed_size(), 12288);

        vm.decommit(vm.base(), 12288).unwrap();
        assert_eq!(vm.committed_size(), 0);
    }

    #[test]
    fn test_commit_outside_reservation_fails() {
        let vm = VirtualMemory::reserve(1 << 20).unwrap();
        assert!(vm.commit(vm.end(), 4096).is_err());
    }

    #[test]
    fn test_merge_range_accounting() {
        let mut map = std::collections::BTreeMap::new();
        assert_eq!(merge_range(&mut map, 0, 4096), 4096);
        assert_eq!(merge_range(&mut map, 0, 4096), 0);
        assert_eq!(merge_range(&mut map, 4096, 4096), 4096);
        assert_eq!(map.len(), 1);
        assert_eq!(remove_range(&mut map, 0, 8192), 8192);
        assert!(map.is_empty());
    }
}
