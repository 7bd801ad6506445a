//! The built-in guest image run when no image is given on the command line.

use crate::emu::pio::SERIAL_PORT;

const HANDLER: u32 = 0x20;
const IDT_DESC: u32 = 0x40;
const IDT: u32 = 0x100;
const IDT_ENTRIES: u32 = 256;
pub const SYSCALL_VECTOR: u8 = 0x80;

fn put32(image: &mut [u8], offset: u32, value: u32) {
    let at = offset as usize;
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Builds the demo image for loading at `base`.
///
/// The program sets up a stack below `base`, loads an IDT, and raises `int 0x80`. The
/// handler writes "A\n" to the serial port and returns with `iret`; the program then halts
/// with eax = 0x41.
pub fn image(base: u32) -> Vec<u8> {
    let mut image = vec![0u8; (IDT + IDT_ENTRIES * 8) as usize];

    #[rustfmt::skip]
    let main = [
        0xbc, 0, 0, 0, 0,               // mov $base, %esp
        0x0f, 0x01, 0x1d, 0, 0, 0, 0,   // lidt base+IDT_DESC
        0xba, 0, 0, 0, 0,               // mov $SERIAL_PORT, %edx
        0xb8, 0x41, 0, 0, 0,            // mov $0x41, %eax
        0xcd, SYSCALL_VECTOR,           // int $0x80
        0xf4,                           // hlt
    ];
    image[..main.len()].copy_from_slice(&main);
    put32(&mut image, 1, base);
    put32(&mut image, 8, base + IDT_DESC);
    put32(&mut image, 13, u32::from(SERIAL_PORT));

    #[rustfmt::skip]
    let handler = [
        0xee,                           // out %al, (%dx)
        0xb0, 0x0a,                     // mov $0xa, %al
        0xee,                           // out %al, (%dx)
        0xb0, 0x41,                     // mov $0x41, %al
        0xcf,                           // iret
    ];
    let at = HANDLER as usize;
    image[at..at + handler.len()].copy_from_slice(&handler);

    let at = IDT_DESC as usize;
    image[at..at + 2].copy_from_slice(&((IDT_ENTRIES * 8 - 1) as u16).to_le_bytes());
    put32(&mut image, IDT_DESC + 2, base + IDT);

    let entry = base + HANDLER;
    let gate = IDT + u32::from(SYSCALL_VECTOR) * 8;
    put32(&mut image, gate, (entry & 0xffff) | (0x8 << 16));
    put32(&mut image, gate + 4, (entry & 0xffff_0000) | 0x8e00);
    image
}
