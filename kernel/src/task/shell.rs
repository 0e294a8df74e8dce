//! Interactive line-command shell task.
//!
//! Runs as an ordinary scheduled task (see `task_create` in the boot
//! sequence). Reads lines from the keyboard input buffer, dispatches a
//! small fixed set of built-in commands, and yields the CPU while idle so
//! it never starves other tasks.

use crate::kprintln;
use crate::memory::{heap, pmm};
use crate::task::{clock, input, scheduler};
use alloc::string::String;
use alloc::vec::Vec;

const PROMPT: &str = "minimalos> ";
const LINE_MAX: usize = 256;

/// Blocks (by yielding) until a line has been read from the input buffer,
/// handling backspace and echoing each character back through the logger.
fn read_line() -> String {
    let mut line = String::with_capacity(LINE_MAX);
    loop {
        if !input::has_input() {
            // Nothing currently wakes a blocked task on keyboard input, so
            // yield cooperatively instead of blocking outright.
            scheduler::schedule();
            continue;
        }
        let byte = input::pop_char();
        match byte {
            b'\n' | b'\r' => {
                kprintln!();
                return line;
            }
            0x08 | 0x7F => {
                if line.pop().is_some() {
                    crate::kprint!("\x08 \x08");
                }
            }
            b if (0x20..=0x7E).contains(&b) && line.len() < LINE_MAX - 1 => {
                line.push(b as char);
                crate::kprint!("{}", b as char);
            }
            _ => {}
        }
    }
}

fn dispatch(line: &str) {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else { return };
    let args: Vec<&str> = words.collect();

    match cmd {
        "help" => {
            kprintln!("available commands:");
            for name in ["help", "echo", "clear", "ls", "cat", "mem", "uptime", "exit"] {
                kprintln!("  {}", name);
            }
        }
        "echo" => kprintln!("{}", args.join(" ")),
        "clear" => {
            // No cursor-addressable terminal control over serial; a
            // handful of blank lines stands in for "clear screen".
            for _ in 0..40 {
                kprintln!();
            }
        }
        "ls" => cmd_ls(),
        "cat" => cmd_cat(&args),
        "mem" => cmd_mem(),
        "uptime" => kprintln!("uptime: {} ticks", clock::now()),
        "exit" => {
            kprintln!("shell exiting");
            scheduler::task_exit();
        }
        _ => kprintln!("unknown command: {}", cmd),
    }
}

fn cmd_ls() {
    let Some(disk) = crate::fs::ramdisk::get() else {
        kprintln!("no initramfs mounted");
        return;
    };
    let mut any = false;
    for name in crate::fs::cpio::list_files(disk) {
        kprintln!("{}", name);
        any = true;
    }
    if !any {
        kprintln!("(empty)");
    }
}

fn cmd_cat(args: &[&str]) {
    let Some(path) = args.first() else {
        kprintln!("usage: cat <filename>");
        return;
    };
    let Some(disk) = crate::fs::ramdisk::get() else {
        kprintln!("no initramfs mounted");
        return;
    };
    match crate::fs::cpio::find_file(disk, path) {
        Some(entry) if entry.is_file() => match core::str::from_utf8(entry.data) {
            Ok(text) => kprintln!("{}", text),
            Err(_) => kprintln!("(binary file, {} bytes)", entry.size),
        },
        Some(_) => kprintln!("{}: not a regular file", path),
        None => kprintln!("{}: not found", path),
    }
}

fn cmd_mem() {
    let stats = pmm::stats();
    kprintln!(
        "physical: {} / {} pages free ({} used)",
        stats.free_pages, stats.total_pages, stats.used_pages
    );
    kprintln!(
        "heap: {} / {} bytes allocated",
        heap::allocated_bytes(), heap::total_bytes()
    );
}

/// Entry point for the shell task, installed via `task_create`.
///
/// Never returns; `task_create`'s trampoline only matters for tasks that
/// can legitimately fall off the end of their entry function, which the
/// shell does not.
pub extern "C" fn shell_entry(_arg: usize) -> ! {
    kprintln!();
    kprintln!("MinimalOS NextGen shell. Type 'help' for a command list.");
    loop {
        crate::kprint!("{}", PROMPT);
        let line = read_line();
        if !line.is_empty() {
            dispatch(&line);
        }
    }
}
