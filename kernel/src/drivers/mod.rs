// =============================================================================
// MinimalOS NextGen — Kernel Drivers
// =============================================================================
//
// Drivers that live directly in kernel space because they're needed before
// any other subsystem can do useful work:
//
//   framebuffer.rs — text console rendered onto the Limine framebuffer,
//                    mirrored to the serial port.
// =============================================================================

pub mod framebuffer;
