//! PSF1 framebuffer text console.
//!
//! Renders monospace text onto the Limine-provided linear framebuffer using
//! an embedded PSF1 bitmap font. Scrolls by redrawing rather than shifting
//! framebuffer memory, since the backing store may not be conveniently
//! addressable as a flat byte buffer across bootloaders.
//!
//! This is the visual twin of `khal::serial` / `util::logger` — every
//! character that reaches serial also reaches here once the framebuffer
//! has been discovered, so boot log output is visible with no terminal
//! attached.

use spin::Mutex;

/// Embedded PSF1 font: a 4-byte header (magic, mode, charsize) followed by
/// `charsize` bytes per glyph, one bit per pixel column, 8 pixels wide.
static FONT_DATA: &[u8] = include_bytes!("../../assets/font.psf");

const PSF1_MAGIC: [u8; 2] = [0x36, 0x04];
const GLYPH_WIDTH: usize = 8;

struct Psf1Font {
    charsize: usize,
    glyphs: &'static [u8],
}

impl Psf1Font {
    fn parse(data: &'static [u8]) -> Self {
        assert!(data.len() >= 4, "embedded font truncated");
        assert_eq!([data[0], data[1]], PSF1_MAGIC, "embedded font has bad PSF1 magic");
        let charsize = data[3] as usize;
        let glyph_count = if data[2] & 0x01 != 0 { 512 } else { 256 };
        let glyphs = &data[4..4 + glyph_count * charsize];
        Self { charsize, glyphs }
    }

    fn glyph(&self, ch: u8) -> &[u8] {
        let start = ch as usize * self.charsize;
        &self.glyphs[start..start + self.charsize]
    }

    fn height(&self) -> usize {
        self.charsize
    }
}

/// A linear 32-bit-per-pixel framebuffer owned by the console.
struct Console {
    base: *mut u32,
    width: usize,
    height: usize,
    /// Pixels per row, which may exceed `width` (padding/alignment).
    stride: usize,
    cursor_x: usize,
    cursor_y: usize,
    fg: u32,
    bg: u32,
}

unsafe impl Send for Console {}

impl Console {
    fn put_pixel(&mut self, x: usize, y: usize, color: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        unsafe {
            self.base.add(y * self.stride + x).write_volatile(color);
        }
    }

    fn draw_glyph(&mut self, font: &Psf1Font, ch: u8) {
        let glyph = font.glyph(ch);
        let (ox, oy) = (self.cursor_x, self.cursor_y);
        for (row, byte) in glyph.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                let set = byte & (0x80 >> col) != 0;
                self.put_pixel(ox + col, oy + row, if set { self.fg } else { self.bg });
            }
        }
    }

    fn advance(&mut self, font: &Psf1Font) {
        self.cursor_x += GLYPH_WIDTH;
        if self.cursor_x + GLYPH_WIDTH > self.width {
            self.newline(font);
        }
    }

    fn newline(&mut self, font: &Psf1Font) {
        self.cursor_x = 0;
        self.cursor_y += font.height();
        if self.cursor_y + font.height() > self.height {
            self.scroll(font);
        }
    }

    /// Scrolls the console by one text row, clearing the new bottom row.
    ///
    /// Implemented as a plain pixel copy rather than a single memmove since
    /// `stride` may not equal `width`.
    fn scroll(&mut self, font: &Psf1Font) {
        let row_height = font.height();
        for y in row_height..self.height {
            for x in 0..self.width {
                let color = unsafe { self.base.add(y * self.stride + x).read_volatile() };
                self.put_pixel(x, y - row_height, color);
            }
        }
        for y in (self.height - row_height)..self.height {
            for x in 0..self.width {
                self.put_pixel(x, y, self.bg);
            }
        }
        self.cursor_y -= row_height;
    }

    fn putchar(&mut self, font: &Psf1Font, ch: char) {
        match ch {
            '\n' => self.newline(font),
            '\r' => self.cursor_x = 0,
            '\x08' => {
                if self.cursor_x >= GLYPH_WIDTH {
                    self.cursor_x -= GLYPH_WIDTH;
                    self.draw_glyph(font, b' ');
                }
            }
            c if c.is_ascii() => {
                self.draw_glyph(font, c as u8);
                self.advance(font);
            }
            _ => {}
        }
    }
}

static FONT: spin::Once<Psf1Font> = spin::Once::new();
static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

/// Initializes the framebuffer console from the Limine framebuffer response.
///
/// Idempotent; a second call replaces the console (used if the framebuffer
/// address changes after a VMM remap).
///
/// # Safety
/// `address` must point to a valid, writable linear framebuffer of at least
/// `height * pitch` bytes, mapped for the remainder of the kernel's life.
pub unsafe fn init(address: *mut u8, width: u64, height: u64, pitch: u64, bpp: u16) {
    assert_eq!(bpp, 32, "framebuffer console only supports 32bpp");
    let stride = (pitch / 4) as usize;
    let console = Console {
        base: address as *mut u32,
        width: width as usize,
        height: height as usize,
        stride,
        cursor_x: 0,
        cursor_y: 0,
        fg: 0x00FFFFFF,
        bg: 0x00000000,
    };
    FONT.call_once(|| Psf1Font::parse(FONT_DATA));
    *CONSOLE.lock() = Some(console);
}

/// Returns true once `init()` has installed a framebuffer console.
pub fn is_initialized() -> bool {
    CONSOLE.lock().is_some()
}

/// Fills the console with its background color and resets the cursor to
/// the top-left corner. Used by the panic handler before printing its
/// banner, so a panic is never tangled up with whatever text preceded it.
pub fn clear() {
    let mut guard = CONSOLE.lock();
    let Some(console) = guard.as_mut() else {
        return;
    };
    for y in 0..console.height {
        for x in 0..console.width {
            console.put_pixel(x, y, console.bg);
        }
    }
    console.cursor_x = 0;
    console.cursor_y = 0;
}

/// Writes a string to the framebuffer console. A no-op before `init()`.
pub fn write_str(s: &str) {
    let mut guard = CONSOLE.lock();
    let Some(console) = guard.as_mut() else {
        return;
    };
    let font = FONT.get().expect("framebuffer console font not initialized");
    for ch in s.chars() {
        console.putchar(font, ch);
    }
}
