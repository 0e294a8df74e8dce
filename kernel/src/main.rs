#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

mod arch;
mod drivers;
mod fs;
mod memory;
mod sync;
mod task;
mod traps;
mod util;

use arch::x86_64::boot;
use memory::address;
use memory::vmm::KernelLayout;

/// Linker-provided section boundaries for the running kernel image, used
/// to apply per-section W^X page permissions while building the kernel
/// pagemap. Defined in the linker script, not in this crate.
unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

/// Virtual addresses of the kernel image's section boundaries, read
/// straight from the linker symbols above.
struct SectionBounds {
    text_start: u64,
    text_end: u64,
    rodata_start: u64,
    rodata_end: u64,
    data_start: u64,
    data_end: u64,
}

fn section_bounds() -> SectionBounds {
    unsafe {
        SectionBounds {
            text_start: core::ptr::addr_of!(__text_start) as u64,
            text_end: core::ptr::addr_of!(__text_end) as u64,
            rodata_start: core::ptr::addr_of!(__rodata_start) as u64,
            rodata_end: core::ptr::addr_of!(__rodata_end) as u64,
            data_start: core::ptr::addr_of!(__data_start) as u64,
            data_end: core::ptr::addr_of!(__data_end) as u64,
        }
    }
}

fn kernel_layout(phys_base: u64, virt_base: u64) -> KernelLayout {
    let b = section_bounds();
    KernelLayout {
        phys_base,
        virt_base,
        text_start: b.text_start,
        text_end: b.text_end,
        rodata_start: b.rodata_start,
        rodata_end: b.rodata_end,
        data_start: b.data_start,
        data_end: b.data_end,
    }
}

/// Size in bytes of the loaded kernel image, derived from the virtual
/// extent of its highest section and the virtual load base.
fn kernel_image_size(virt_base: u64) -> u64 {
    let b = section_bounds();
    let highest_end = b.text_end.max(b.rodata_end).max(b.data_end);
    highest_end - virt_base
}

/// Arbitrary APIC timer initial count. Without calibrating against the
/// HPET or PIT, this is a fixed divisor chosen for a roughly 10ms tick on
/// typical APIC base frequencies; not calibrated per-machine.
const APIC_TIMER_INITIAL_COUNT: u32 = 10_000_000;

fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Kernel entry point called by the Limine bootloader.
///
/// Brings every subsystem up in dependency order: the earliest possible
/// output channel first (serial), then memory management, then interrupts,
/// then drivers that need interrupts, then scheduling, then finally hands
/// off to the shell task and becomes the idle loop.
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(boot::base_revision_supported(), "unsupported Limine base revision");

    // 1. Serial first — every later step can now log.
    khal::serial::init();
    klog::init();
    klog::info!("MinimalOS NextGen booting");

    // 2. HHDM offset, needed before any PhysAddr::to_virt() call.
    unsafe { address::init_hhdm(boot::get_hhdm_offset()) };

    // 3. Framebuffer console, if one was set up.
    if let Some(fb) = boot::get_framebuffer_info() {
        unsafe { drivers::framebuffer::init(fb.address, fb.width, fb.height, fb.pitch, fb.bpp) };
        klog::info!("framebuffer console ready ({}x{})", fb.width, fb.height);
    } else {
        klog::warn!("no framebuffer available, serial-only console");
    }

    // 4. Disable the legacy 8259 PIC, bring up the local APIC and I/O APIC.
    khal::pic::disable();
    let (phys_base, virt_base) = boot::get_kernel_address();
    let apic_id = khal::apic::init(address::hhdm_offset());
    let (ioapic_id, _max_entries) = khal::ioapic::init(address::hhdm_offset());
    klog::debug!("local APIC id {}, I/O APIC id {}", apic_id, ioapic_id);

    // 5. GDT, TSS, IDT — must exist before interrupts are unmasked.
    traps::init_idt();

    // 6. Physical memory manager from the Limine memory map.
    let memory_map = boot::get_memory_map();
    let kernel_phys_end = phys_base + kernel_image_size(virt_base);
    memory::pmm::init(memory_map, phys_base, kernel_phys_end);

    // 7. Virtual memory manager: builds the kernel's own pagemap and
    //    switches CR3 to it.
    let layout = kernel_layout(phys_base, virt_base);
    memory::vmm::init_vmm(memory_map, &layout);

    // 8. Kernel heap, backed by the PMM.
    memory::heap::init_heap();

    // 9. PS/2 keyboard, now that the heap and IDT both exist.
    khal::keyboard::init();
    khal::ioapic::enable_irq(1, khal::keyboard::KEYBOARD_VECTOR);

    // 10. Initramfs, if the bootloader supplied a module.
    if let Some((addr, size)) = boot::get_first_module() {
        unsafe { fs::ramdisk::init(addr, size) };
        klog::info!("initramfs mounted ({} bytes)", size);
    } else {
        klog::warn!("no initramfs module supplied");
    }

    // 11. Scheduler: install the boot thread as task 0, then create the
    //     shell task. Must happen before the timer is armed and interrupts
    //     are unmasked below — a timer tick landing before a current task
    //     exists would have nothing to charge the quantum against.
    task::scheduler::init_multitasking();
    task::scheduler::task_create(task::shell::shell_entry, 0, "shell", 1);

    // 12. Local APIC timer — the last interrupt source enabled, since it
    //     starts preemption and everything above must already be ready.
    khal::apic::enable_timer(khal::apic::TIMER_VECTOR, APIC_TIMER_INITIAL_COUNT, khal::apic::TimerDivide::By16);
    enable_interrupts();

    klog::info!("handoff complete, entering idle loop");

    // 13. Idle loop: the boot thread becomes the idle task, woken by every
    //     timer tick to let the scheduler consider other ready tasks.
    loop {
        arch::cpu::halt();
    }
}
