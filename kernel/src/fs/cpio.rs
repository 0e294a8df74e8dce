//! CPIO-newc initramfs archive parser.
//!
//! Parses a `070701` ("newc") format CPIO archive loaded into memory by the
//! bootloader as a boot module. Read-only; sufficient for the shell's `ls`
//! and `cat` commands to find and read files from the boot-time ramdisk.

use khal::ramdisk::RamDisk;

/// Fixed header size: 6-byte magic + 13 eight-hex-digit fields.
const HEADER_SIZE: usize = 110;

/// Sentinel name marking the end of the archive.
const TRAILER: &str = "TRAILER!!!";

/// File mode bits (`st_mode` low 16 bits) identifying a regular file.
const S_IFREG: u32 = 0o100000;
/// File mode bits identifying a directory.
const S_IFDIR: u32 = 0o040000;
const S_IFMT: u32 = 0o170000;

/// A parsed CPIO-newc entry header plus its data slice.
#[derive(Debug)]
pub struct CpioEntry<'a> {
    pub name: &'a str,
    pub size: usize,
    pub mode: u32,
    pub data: &'a [u8],
}

impl<'a> CpioEntry<'a> {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Rounds `offset` up to the next 4-byte boundary, as CPIO-newc pads both
/// the filename and the file data to 4-byte alignment from the start of
/// the archive.
fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Parses one 8-hex-digit ASCII field from a CPIO-newc header.
fn parse_hex_field(field: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in field {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => 0,
        };
        value = (value << 4) | digit as u32;
    }
    value
}

/// Iterator over the entries of a CPIO-newc archive stored in a `RamDisk`.
pub struct CpioIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CpioIter<'a> {
    /// Create a new CPIO iterator from a `RamDisk`.
    ///
    /// # Safety
    /// The `RamDisk`'s backing memory must be valid for the returned lifetime.
    pub unsafe fn new(disk: &'a RamDisk) -> Self {
        Self {
            buf: unsafe { disk.as_slice() },
            offset: 0,
            done: false,
        }
    }

    /// Create a CPIO iterator directly from a byte slice.
    #[allow(dead_code)]
    pub fn from_bytes(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0, done: false }
    }
}

impl<'a> Iterator for CpioIter<'a> {
    type Item = CpioEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.offset + HEADER_SIZE > self.buf.len() {
            self.done = true;
            return None;
        }

        let header = &self.buf[self.offset..self.offset + HEADER_SIZE];
        if &header[0..6] != b"070701" {
            self.done = true;
            return None;
        }

        // Field layout (each 8 ASCII hex digits), offsets from header start:
        //   6  c_ino       14 c_mode      22 c_uid       30 c_gid
        //   38 c_nlink     46 c_mtime     54 c_filesize  62 c_devmajor
        //   70 c_devminor  78 c_rdevmajor 86 c_rdevminor 94 c_namesize
        //   102 c_check
        let mode = parse_hex_field(&header[14..22]);
        let filesize = parse_hex_field(&header[54..62]) as usize;
        let namesize = parse_hex_field(&header[94..102]) as usize;

        let name_start = self.offset + HEADER_SIZE;
        let name_end = name_start + namesize;
        if name_end > self.buf.len() {
            self.done = true;
            return None;
        }
        // namesize includes the trailing NUL.
        let name_bytes = &self.buf[name_start..name_end.saturating_sub(1).max(name_start)];
        let name = core::str::from_utf8(name_bytes).unwrap_or("<invalid>");

        let data_start = align4(name_end);
        let data_end = data_start + filesize;
        if data_end > self.buf.len() {
            self.done = true;
            return None;
        }
        let data = &self.buf[data_start..data_end];

        if name == TRAILER {
            self.done = true;
            return None;
        }

        self.offset = align4(data_end);

        Some(CpioEntry { name, size: filesize, mode, data })
    }
}

fn strip_leading_slash(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name).trim_start_matches('/')
}

/// Find a file by name in the archive and return its entry.
pub fn find_file<'a>(disk: &'a RamDisk, name: &str) -> Option<CpioEntry<'a>> {
    let search_name = strip_leading_slash(name);
    let iter = unsafe { CpioIter::new(disk) };
    for entry in iter {
        if strip_leading_slash(entry.name) == search_name {
            return Some(entry);
        }
    }
    None
}

/// List every regular-file entry's name in the archive.
///
/// Used by the shell's `ls`; callers get a lazy iterator rather than a
/// collected `Vec` since the kernel has no guarantee the heap is large
/// enough for an unbounded archive listing.
pub fn list_files<'a>(disk: &'a RamDisk) -> impl Iterator<Item = &'a str> {
    unsafe { CpioIter::new(disk) }
        .filter(|e| e.is_file())
        .map(|e| e.name)
}
