// =============================================================================
// MinimalOS NextGen — Virtual Memory Manager (Page Table Infrastructure)
// =============================================================================
//
// 4-level x86_64 paging: PML4 → PDPT → PD → PT. Each level is a 4 KiB table
// of 512 entries, accessed through the HHDM (physical memory is never
// touched with raw pointers — always `phys.to_virt()`).
//
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NXE│ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//
// ADDRESS EXTRACTION: bits 51:12 (mask 0x000F_FFFF_FFFF_F000) give the
// page-aligned physical frame.
//
// W^X: a mapped region is either writable or executable, never both.
//   .text          PRESENT | GLOBAL                         (R-X)
//   .rodata        PRESENT | GLOBAL | NO_EXECUTE             (R--)
//   .data/.bss     PRESENT | GLOBAL | WRITABLE | NO_EXECUTE  (RW-)
//
// A single `Pagemap` owns one PML4 and the lock serializing access to it.
// The kernel keeps exactly one live Pagemap (there is no user address
// space in this design) behind the `KERNEL_PAGEMAP` static, installed by
// `init_vmm()`.
// =============================================================================

use bitflags::bitflags;

use crate::arch::cpu;
use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;
use spin::Once;

bitflags! {
    /// x86_64 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    pub const KERNEL_CODE: Self = Self::PRESENT.union(Self::GLOBAL);
    pub const KERNEL_RODATA: Self = Self::PRESENT.union(Self::GLOBAL).union(Self::NO_EXECUTE);
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::GLOBAL)
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE);
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE);
}

/// A single entry in an x86_64 page table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(addr.is_page_aligned());
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 4-level x86_64 page table: 512 entries, 4 KiB, frame-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[derive(Debug)]
pub enum MapError {
    AlreadyMapped,
    OutOfMemory,
    HugePageConflict,
    OutOfRange,
}

#[derive(Debug)]
pub enum UnmapError {
    NotMapped,
    HugePageConflict,
}

/// Owns one PML4 root and the lock serializing walks of it.
pub struct Pagemap {
    top_level: VirtAddr,
    lock: SpinLock<()>,
}

impl Pagemap {
    /// Allocates a fresh, zeroed PML4 and wraps it.
    fn new() -> Option<Self> {
        let phys = pmm::allocate_page_zeroed()?;
        Some(Self {
            top_level: phys.to_virt(),
            lock: SpinLock::new(()),
        })
    }

    fn pml4(&self) -> &mut PageTable {
        unsafe { &mut *self.top_level.as_mut_ptr::<PageTable>() }
    }

    /// Returns the next-level table physical address for `index` in
    /// `table`, allocating and zeroing a new one if `allocate` is true and
    /// none exists yet.
    fn next_level(table: &mut PageTable, index: usize, allocate: bool) -> Option<PhysAddr> {
        let entry = &mut table[index];
        if entry.is_present() {
            return Some(entry.addr());
        }
        if !allocate {
            return None;
        }
        let frame = pmm::allocate_page_zeroed().expect("vmm: out of memory for page table");
        entry.set(frame, PageTableFlags::INTERMEDIATE);
        Some(frame)
    }

    /// Maps a single 4 KiB page, creating intermediate tables as needed.
    pub fn map_page(&self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
        debug_assert!(virt.is_page_aligned());
        debug_assert!(phys.is_page_aligned());
        let _guard = self.lock.lock();

        let idx = virt.page_table_indices(); // [PT, PD, PDPT, PML4]
        let pml4 = self.pml4();

        let pdpt_phys = Self::next_level(pml4, idx[3] as usize, true).ok_or(MapError::OutOfMemory)?;
        let pdpt = unsafe { &mut *pdpt_phys.to_virt().as_mut_ptr::<PageTable>() };
        if pdpt[idx[2] as usize].is_present() && pdpt[idx[2] as usize].is_huge() {
            return Err(MapError::HugePageConflict);
        }

        let pd_phys = Self::next_level(pdpt, idx[2] as usize, true).ok_or(MapError::OutOfMemory)?;
        let pd = unsafe { &mut *pd_phys.to_virt().as_mut_ptr::<PageTable>() };
        if pd[idx[1] as usize].is_present() && pd[idx[1] as usize].is_huge() {
            return Err(MapError::HugePageConflict);
        }

        let pt_phys = Self::next_level(pd, idx[1] as usize, true).ok_or(MapError::OutOfMemory)?;
        let pt = unsafe { &mut *pt_phys.to_virt().as_mut_ptr::<PageTable>() };
        let leaf = &mut pt[idx[0] as usize];
        if leaf.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        leaf.set(phys, flags);
        cpu::invlpg(virt.as_u64());
        Ok(())
    }

    /// Unmaps a single 4 KiB page. Does not free the underlying frame.
    pub fn unmap_page(&self, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
        debug_assert!(virt.is_page_aligned());
        let _guard = self.lock.lock();

        let idx = virt.page_table_indices();
        let pml4 = self.pml4();

        let pdpt_phys = Self::next_level(pml4, idx[3] as usize, false).ok_or(UnmapError::NotMapped)?;
        let pdpt = unsafe { &mut *pdpt_phys.to_virt().as_mut_ptr::<PageTable>() };
        if pdpt[idx[2] as usize].is_huge() {
            return Err(UnmapError::HugePageConflict);
        }

        let pd_phys = Self::next_level(pdpt, idx[2] as usize, false).ok_or(UnmapError::NotMapped)?;
        let pd = unsafe { &mut *pd_phys.to_virt().as_mut_ptr::<PageTable>() };
        if pd[idx[1] as usize].is_huge() {
            return Err(UnmapError::HugePageConflict);
        }

        let pt_phys = Self::next_level(pd, idx[1] as usize, false).ok_or(UnmapError::NotMapped)?;
        let pt = unsafe { &mut *pt_phys.to_virt().as_mut_ptr::<PageTable>() };
        let leaf = &mut pt[idx[0] as usize];
        if !leaf.is_present() {
            return Err(UnmapError::NotMapped);
        }
        let phys = leaf.addr();
        leaf.clear();
        cpu::invlpg(virt.as_u64());
        Ok(phys)
    }

    /// Translates `virt` to a physical address by walking this pagemap.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let _guard = self.lock.lock();
        let idx = virt.page_table_indices();
        let offset = virt.page_offset() as u64;

        let pml4 = self.pml4();
        let pdpt_phys = Self::next_level(pml4, idx[3] as usize, false)?;
        let pdpt = unsafe { &*pdpt_phys.to_virt().as_ptr::<PageTable>() };
        let pd_phys = Self::next_level(pdpt, idx[2] as usize, false)?;
        let pd = unsafe { &*pd_phys.to_virt().as_ptr::<PageTable>() };
        let pt_phys = Self::next_level(pd, idx[1] as usize, false)?;
        let pt = unsafe { &*pt_phys.to_virt().as_ptr::<PageTable>() };
        let leaf = pt[idx[0] as usize];
        if !leaf.is_present() {
            return None;
        }
        Some(PhysAddr::new(leaf.addr().as_u64() + offset))
    }

    /// Loads CR3 with this pagemap's physical root.
    ///
    /// # Safety
    /// Must be called with a pagemap that maps the currently-executing
    /// code and stack, or execution halts the instant this returns.
    pub unsafe fn switch_to(&self) {
        let phys = self.top_level.as_u64() - crate::memory::address::hhdm_offset();
        unsafe { cpu::write_cr3(phys) };
    }
}

static KERNEL_PAGEMAP: Once<Pagemap> = Once::new();

/// `[kernel_virt_base, ALIGN_UP(bss_end, PAGE_SIZE))` — the only virtual
/// range the page-fault handler is allowed to demand-page into. Set once
/// by `init_vmm`; anything outside it (including the HHDM window, which
/// is fully pre-mapped) is never a legitimate demand-paging target.
static KERNEL_RANGE: Once<(u64, u64)> = Once::new();

/// Returns the kernel's pagemap. Panics if `init_vmm` has not run.
pub fn kernel_pagemap() -> &'static Pagemap {
    KERNEL_PAGEMAP.get().expect("vmm: not initialized")
}

/// Returns true if `virt` falls inside the linker-reported kernel image
/// range this kernel is allowed to demand-page.
pub fn is_kernel_range(virt: VirtAddr) -> bool {
    match KERNEL_RANGE.get() {
        Some(&(start, end)) => {
            let a = virt.as_u64();
            a >= start && a < end
        }
        None => false,
    }
}

/// Kernel image layout handed in from the linker script, used to apply
/// per-section W^X flags while mapping the kernel's own physical range.
pub struct KernelLayout {
    pub phys_base: u64,
    pub virt_base: u64,
    pub text_start: u64,
    pub text_end: u64,
    pub rodata_start: u64,
    pub rodata_end: u64,
    pub data_start: u64,
    pub data_end: u64,
}

/// Builds the kernel pagemap: maps the kernel image with per-section W^X
/// flags, maps the HHDM window over every memory map entry (regardless of
/// type — firmware tables and MMIO need to be dereferenceable too), and
/// identity-maps `[0, min(top, 4 GiB))` skipping page 0 (kept unmapped as
/// a null-dereference trap). Finally switches CR3 to the new pagemap.
pub fn init_vmm(memory_map: &[&limine::memory_map::Entry], layout: &KernelLayout) {
    let pagemap = Pagemap::new().expect("vmm: failed to allocate PML4");

    // Map the kernel image section by section with its own W^X flags.
    map_kernel_section(&pagemap, layout.text_start, layout.text_end, layout, PageTableFlags::KERNEL_CODE);
    map_kernel_section(&pagemap, layout.rodata_start, layout.rodata_end, layout, PageTableFlags::KERNEL_RODATA);
    map_kernel_section(&pagemap, layout.data_start, layout.data_end, layout, PageTableFlags::KERNEL_DATA);

    // HHDM: map every memmap entry's physical range at phys + HHDM_OFFSET.
    let hhdm = crate::memory::address::hhdm_offset();
    let mut highest = 0u64;
    for entry in memory_map {
        let top = entry.base + entry.length;
        if top > highest {
            highest = top;
        }
        let start_page = entry.base / PAGE_SIZE;
        let end_page = top.div_ceil(PAGE_SIZE);
        for frame in start_page..end_page {
            let phys = PhysAddr::new(frame * PAGE_SIZE);
            let virt = VirtAddr::new(phys.as_u64() + hhdm);
            let _ = pagemap.map_page(virt, phys, PageTableFlags::KERNEL_DATA);
        }
    }

    // Identity-map [0, min(highest, 4GiB)), skipping page 0.
    let ceiling = highest.min(4 * 1024 * 1024 * 1024);
    let total_pages = ceiling / PAGE_SIZE;
    for frame in 1..total_pages {
        let phys = PhysAddr::new(frame * PAGE_SIZE);
        let virt = VirtAddr::new(phys.as_u64());
        let _ = pagemap.map_page(virt, phys, PageTableFlags::KERNEL_DATA);
    }

    kprintln!("[vmm] kernel pagemap built, switching CR3");
    unsafe { pagemap.switch_to() };

    KERNEL_PAGEMAP.call_once(|| pagemap);
    let range_end = layout.data_end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    KERNEL_RANGE.call_once(|| (layout.virt_base, range_end));
}

fn map_kernel_section(pagemap: &Pagemap, start: u64, end: u64, layout: &KernelLayout, flags: PageTableFlags) {
    if end <= start {
        return;
    }
    let start_page = start / PAGE_SIZE;
    let end_page = end.div_ceil(PAGE_SIZE);
    for page in start_page..end_page {
        let virt = VirtAddr::new(page * PAGE_SIZE);
        let phys = PhysAddr::new(layout.phys_base + (virt.as_u64() - layout.virt_base));
        let _ = pagemap.map_page(virt, phys, flags);
    }
}

/// Maps a page into the kernel pagemap on demand — used by the page fault
/// handler to satisfy faults within the kernel's declared virtual range.
/// Refuses anything outside `[kernel_virt_base, ALIGN_UP(bss_end, PAGE_SIZE))`
/// — callers must treat a fault there as fatal, never demand-paged.
pub fn map_on_fault(virt: VirtAddr) -> Result<(), MapError> {
    if !is_kernel_range(virt) {
        return Err(MapError::OutOfRange);
    }
    let page = VirtAddr::new(virt.page_align_down());
    let frame = pmm::allocate_page_zeroed().ok_or(MapError::OutOfMemory)?;
    kernel_pagemap().map_page(page, frame, PageTableFlags::KERNEL_DATA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_table_entry_round_trips() {
        let mut entry = PageTableEntry::EMPTY;
        let addr = PhysAddr::new(0x1000);
        entry.set(addr, PageTableFlags::KERNEL_DATA);
        assert!(entry.is_present());
        assert_eq!(entry.addr(), addr);
        assert!(entry.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn kernel_range_excludes_hhdm_before_init() {
        // Before init_vmm runs, nothing should be considered in-range —
        // any fault at this point is a bug, not something to demand-page.
        assert!(!is_kernel_range(VirtAddr::new(0xFFFF_8000_0000_1000)));
    }
}
