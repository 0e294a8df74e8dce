// =============================================================================
// MinimalOS NextGen — Physical Memory Manager (Bitmap Frame Allocator)
// =============================================================================
//
// The PMM tracks which physical page frames (4 KiB each) are free or in use
// using a single fixed-capacity bitmap: one bit per frame, 1 MiB of bitmap
// storage, so up to 8 Mi frames (32 GiB) can be tracked without any runtime
// sizing decision. Machines with more installed RAM simply leave the frames
// above that ceiling unmanaged — `init()` logs a warning when that happens.
//
// BITMAP LAYOUT:
//   bit = 1 → frame is USED (allocated, reserved, or hardware-mapped)
//   bit = 0 → frame is FREE (available for allocation)
//
// INITIALIZATION ALGORITHM (mirrors the historical 3-pass design):
//   Pass 1: Scan every memory map entry, regardless of type, for the
//           highest `base + length`. This bounds `total_pages`.
//   Pass 2: memset the whole bitmap to 0xFF (everything starts reserved),
//           then clear bits for every page fully contained in a USABLE or
//           BOOTLOADER_RECLAIMABLE entry.
//   Pass 3: Re-reserve the kernel image's own physical range and every
//           page below 1 MiB (real-mode IVT, BDA, legacy BIOS data some
//           firmware still leaves live).
//
// ALLOCATION STRATEGY: first-fit, linear scan over the bitmap from frame 0.
// Good enough at this scale — allocation isn't on any hot path before the
// heap exists, and after that the heap is the thing doing frequent
// allocation, not the PMM directly.
//
// THREAD SAFETY: the global PMM state is protected by a SpinLock.
// =============================================================================

use core::ptr;

use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::sync::spinlock::SpinLock;

/// Bytes of bitmap storage. One bit per frame, so this tracks
/// `PMM_BITMAP_SIZE * 8` frames = 32 GiB of physical address space.
pub const PMM_BITMAP_SIZE: usize = 1024 * 1024;

/// Snapshot of physical memory usage statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_pages: usize,
    pub used_pages: usize,
    pub free_pages: usize,
}

struct BitmapAllocator {
    bitmap: [u8; PMM_BITMAP_SIZE],
    total_pages: usize,
    used_pages: usize,
    free_pages: usize,
}

impl BitmapAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [0xFF; PMM_BITMAP_SIZE],
            total_pages: 0,
            used_pages: 0,
            free_pages: 0,
        }
    }

    #[inline]
    fn get_bit(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    #[inline]
    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    /// Reserves every page in `[start_addr, end_addr)`, rounded outward to
    /// whole pages, counting any page that transitions from free to used.
    fn reserve_range(&mut self, start_addr: u64, end_addr: u64) {
        let start_page = (start_addr / PAGE_SIZE) as usize;
        let end_page = end_addr.div_ceil(PAGE_SIZE) as usize;
        for frame in start_page..end_page.min(self.total_pages) {
            if !self.get_bit(frame) {
                self.set_bit(frame);
                self.used_pages += 1;
                self.free_pages -= 1;
            }
        }
    }

    fn init(&mut self, memory_map: &[&limine::memory_map::Entry], kernel_phys_start: u64, kernel_phys_end: u64) {
        // Pass 1: highest address across every entry, regardless of type.
        let mut highest_addr: u64 = 0;
        for entry in memory_map {
            let top = entry.base + entry.length;
            if top > highest_addr {
                highest_addr = top;
            }
        }

        let mut total_pages = highest_addr.div_ceil(PAGE_SIZE) as usize;
        let capacity = PMM_BITMAP_SIZE * 8;
        if total_pages > capacity {
            kprintln!(
                "[pmm] WARNING: {} pages exceeds bitmap capacity {} — capping, high memory will be unmanaged",
                total_pages, capacity
            );
            total_pages = capacity;
        }

        self.total_pages = total_pages;
        self.bitmap.fill(0xFF);

        // Pass 2: clear USABLE / BOOTLOADER_RECLAIMABLE pages.
        let mut free_pages = 0usize;
        for entry in memory_map {
            let reclaimable = matches!(
                entry.entry_type,
                limine::memory_map::EntryType::USABLE
                    | limine::memory_map::EntryType::BOOTLOADER_RECLAIMABLE
            );
            if !reclaimable {
                continue;
            }
            let start_page = entry.base.div_ceil(PAGE_SIZE) as usize;
            let end_page = ((entry.base + entry.length) / PAGE_SIZE) as usize;
            for frame in start_page..end_page.min(total_pages) {
                if self.get_bit(frame) {
                    self.clear_bit(frame);
                    free_pages += 1;
                }
            }
        }

        self.used_pages = total_pages - free_pages;
        self.free_pages = free_pages;

        // Pass 3: reserve the kernel image and everything below 1 MiB.
        self.reserve_range(kernel_phys_start, kernel_phys_end);
        self.reserve_range(0, 0x100000);

        kprintln!(
            "[pmm] {} total pages, {} free ({} MiB)",
            self.total_pages,
            self.free_pages,
            self.free_pages as u64 * PAGE_SIZE / 1024 / 1024
        );
    }

    /// First-fit scan for a single free frame.
    fn allocate_page(&mut self) -> Option<PhysAddr> {
        for frame in 0..self.total_pages {
            if !self.get_bit(frame) {
                self.set_bit(frame);
                self.used_pages += 1;
                self.free_pages -= 1;
                return Some(PhysAddr::new(frame as u64 * PAGE_SIZE));
            }
        }
        kprintln!("[pmm] ERROR: out of physical memory");
        None
    }

    fn allocate_page_zeroed(&mut self) -> Option<PhysAddr> {
        let frame = self.allocate_page()?;
        unsafe {
            ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        Some(frame)
    }

    /// Frees a page. Misuse (unaligned, out of range, already free) is
    /// logged and otherwise ignored rather than treated as fatal — a
    /// double free here should not take down a running kernel.
    fn free_page(&mut self, addr: PhysAddr) {
        if !addr.is_page_aligned() {
            kprintln!("[pmm] WARNING: free_page({}) is not page-aligned", addr);
            return;
        }
        let frame = (addr.as_u64() / PAGE_SIZE) as usize;
        if frame >= self.total_pages {
            kprintln!("[pmm] WARNING: free_page({}) out of managed range", addr);
            return;
        }
        if !self.get_bit(frame) {
            kprintln!("[pmm] WARNING: double free at {}", addr);
            return;
        }
        self.clear_bit(frame);
        self.used_pages -= 1;
        self.free_pages += 1;
    }

    fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_pages: self.total_pages,
            used_pages: self.used_pages,
            free_pages: self.free_pages,
        }
    }
}

// SAFETY: the bitmap is only ever touched while PMM's lock is held.
unsafe impl Send for BitmapAllocator {}

static PMM: SpinLock<BitmapAllocator> = SpinLock::new(BitmapAllocator::new());

/// Initializes the physical memory manager from the Limine memory map.
///
/// Must be called exactly once, during early boot before any other
/// subsystem allocates a frame.
pub fn init(memory_map: &[&limine::memory_map::Entry], kernel_phys_start: u64, kernel_phys_end: u64) {
    PMM.lock().init(memory_map, kernel_phys_start, kernel_phys_end);
}

/// Allocates a single 4 KiB physical frame. Contents are uninitialized.
pub fn allocate_page() -> Option<PhysAddr> {
    PMM.lock().allocate_page()
}

/// Allocates a single 4 KiB physical frame, zeroed. Used for page tables.
pub fn allocate_page_zeroed() -> Option<PhysAddr> {
    PMM.lock().allocate_page_zeroed()
}

/// Frees a previously allocated physical frame. Logs and ignores misuse
/// rather than panicking.
pub fn free_page(addr: PhysAddr) {
    PMM.lock().free_page(addr);
}

/// Returns a snapshot of current physical memory statistics.
pub fn stats() -> MemoryStats {
    PMM.lock().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_range_rounds_outward() {
        let mut a = BitmapAllocator::new();
        a.total_pages = 16;
        a.free_pages = 16;
        a.reserve_range(0, 1);
        assert!(a.get_bit(0));
        assert_eq!(a.used_pages, 1);
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut a = BitmapAllocator::new();
        a.total_pages = 8;
        a.free_pages = 8;
        let p = a.allocate_page().unwrap();
        assert_eq!(a.free_pages, 7);
        a.free_page(p);
        assert_eq!(a.free_pages, 8);
    }
}
