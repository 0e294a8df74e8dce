//! Interrupt and exception handlers.

use crate::memory::address::VirtAddr;
use crate::memory::vmm;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

/// IST index (1-based) used by the double fault handler's dedicated stack.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

/// Breakpoint exception handler (INT 3).
///
/// This is a trap-type exception triggered by the `int3` instruction.
/// It's commonly used for debugging.
///
/// # Safety
///
/// This function must only be called by the CPU as an interrupt handler.
pub extern "x86-interrupt" fn breakpoint_handler(_stack_frame: InterruptStackFrame) {
    klog::info!("breakpoint exception triggered");
}

/// Double fault handler (INT 8). Runs on a dedicated IST stack so a second
/// fault while the normal kernel stack is already corrupt still lands here.
///
/// A double fault always indicates an unrecoverable kernel bug; there is no
/// handler below this one (triple fault resets the machine), so we halt.
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    klog::error!("DOUBLE FAULT (error code {:#x})", error_code);
    klog::error!("{:#?}", stack_frame);
    crate::arch::cpu::halt_forever()
}

/// Page fault handler (INT 14).
///
/// Kernel-range faults are demand-paged: the faulting address is mapped to
/// a freshly zeroed frame and execution resumes. Any other fault (bad
/// permissions, user-range address, or the demand-paging map itself
/// failing) is fatal — there is no user mode in this kernel to blame.
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = crate::arch::cpu::read_cr2();
    let virt = VirtAddr::new(fault_addr);

    if vmm::map_on_fault(virt).is_ok() {
        return;
    }

    klog::error!("PAGE FAULT at {:#018x} ({:?})", fault_addr, error_code);
    klog::error!("{:#?}", stack_frame);
    crate::arch::cpu::halt_forever()
}

/// Timer interrupt handler (local APIC timer, vector 32).
///
/// Advances the tick counter and decrements the current task's quantum;
/// `task_timer_tick` itself calls `schedule()` once the quantum reaches
/// zero. The EOI is sent first so the outgoing task never resumes with
/// the interrupt still un-acknowledged, regardless of whether a switch
/// happens.
pub extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    khal::apic::eoi();
    crate::task::scheduler::task_timer_tick();
}

/// Keyboard interrupt handler (IRQ1, routed through the I/O APIC to
/// vector 33).
///
/// Reads the pending scancode, decodes it through the PS/2 driver, and
/// pushes any resulting character onto the input ring buffer. EOI goes to
/// the Local APIC — the 8259 PIC this IRQ used to route through is masked
/// off for good back in `pic::disable()`.
pub extern "x86-interrupt" fn keyboard_handler(_stack_frame: InterruptStackFrame) {
    let scancode = khal::keyboard::read_scancode();
    if let Some(ch) = khal::keyboard::handle_scancode(scancode) {
        crate::task::input::push_char(ch);
    }
    khal::apic::eoi();
}

/// Spurious interrupt handler (vector 0xFF).
///
/// The local APIC can raise this when an interrupt is withdrawn before the
/// CPU acknowledges it. No EOI is sent for a genuinely spurious vector.
pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}
