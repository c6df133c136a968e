//! The simple text output and input protocols.
//!
//! Output strings arrive as little-endian UTF-16; each unit is folded to a single byte for
//! the screen sink, mapping non-ASCII glyphs back through the CP437 table (the box-drawing
//! and shade characters a boot menu draws) and substituting `?` for anything absent.

use super::status::Status;
use super::ServiceCall;
use crate::machine::{Keyboard, Screen};

/// The Unicode code points of CP437 bytes 0x80..=0xFF.
const CP437_HIGH: [u16; 128] = [
    0x00c7, 0x00fc, 0x00e9, 0x00e2, 0x00e4, 0x00e0, 0x00e5, 0x00e7, // 80-87
    0x00ea, 0x00eb, 0x00e8, 0x00ef, 0x00ee, 0x00ec, 0x00c4, 0x00c5, // 88-8F
    0x00c9, 0x00e6, 0x00c6, 0x00f4, 0x00f6, 0x00f2, 0x00fb, 0x00f9, // 90-97
    0x00ff, 0x00d6, 0x00dc, 0x00a2, 0x00a3, 0x00a5, 0x20a7, 0x0192, // 98-9F
    0x00e1, 0x00ed, 0x00f3, 0x00fa, 0x00f1, 0x00d1, 0x00aa, 0x00ba, // A0-A7
    0x00bf, 0x2310, 0x00ac, 0x00bd, 0x00bc, 0x00a1, 0x00ab, 0x00bb, // A8-AF
    0x2591, 0x2592, 0x2593, 0x2502, 0x2524, 0x2561, 0x2562, 0x2556, // B0-B7
    0x2555, 0x2563, 0x2551, 0x2557, 0x255d, 0x255c, 0x255b, 0x2510, // B8-BF
    0x2514, 0x2534, 0x252c, 0x251c, 0x2500, 0x253c, 0x255e, 0x255f, // C0-C7
    0x255a, 0x2554, 0x2569, 0x2566, 0x2560, 0x2550, 0x256c, 0x2567, // C8-CF
    0x2568, 0x2564, 0x2565, 0x2559, 0x2558, 0x2552, 0x2553, 0x256b, // D0-D7
    0x256a, 0x2518, 0x250c, 0x2588, 0x2584, 0x258c, 0x2590, 0x2580, // D8-DF
    0x03b1, 0x00df, 0x0393, 0x03c0, 0x03a3, 0x03c3, 0x00b5, 0x03c4, // E0-E7
    0x03a6, 0x0398, 0x03a9, 0x03b4, 0x221e, 0x03c6, 0x03b5, 0x2229, // E8-EF
    0x2261, 0x00b1, 0x2265, 0x2264, 0x2320, 0x2321, 0x00f7, 0x2248, // F0-F7
    0x00b0, 0x2219, 0x00b7, 0x221a, 0x207f, 0x00b2, 0x25a0, 0x00a0, // F8-FF
];

/// Folds one UTF-16 unit to the byte the screen sink receives.
pub fn cp437_from_utf16(unit: u16) -> u8 {
    if unit < 0x80 {
        return unit as u8;
    }

    match CP437_HIGH.iter().position(|&code| code == unit) {
        Some(index) => 0x80 + index as u8,
        None => b'?',
    }
}

/// OutputString(This, String).
pub(super) fn output_string(call: &mut ServiceCall, screen: &mut dyn Screen) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let mut cursor = args.ptr(call);

    if cursor == 0 {
        return Status::InvalidParameter;
    }

    loop {
        let unit = call.read_u16(cursor);

        if unit == 0 {
            break;
        }

        screen.put(cp437_from_utf16(unit));
        cursor += 2;
    }

    Status::Success
}

/// QueryMode(This, ModeNumber, Columns, Rows): one 80x25 mode.
pub(super) fn query_mode(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let mode = args.ptr(call);
    let columns = args.ptr(call);
    let rows = args.ptr(call);

    if mode != 0 {
        return Status::Unsupported;
    }

    call.write_ptr(columns, 80);
    call.write_ptr(rows, 25);
    Status::Success
}

/// ClearScreen(This): a form feed to the sink.
pub(super) fn clear_screen(call: &mut ServiceCall, screen: &mut dyn Screen) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);

    screen.put(0x0c);
    Status::Success
}

/// ReadKeyStroke(This, Key): pops one scancode/unicode pair or reports NotReady.
pub(super) fn read_key_stroke(call: &mut ServiceCall, keyboard: &mut dyn Keyboard) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let key = args.ptr(call);

    match keyboard.poll_key() {
        Some(stroke) => {
            call.write_u16(key, stroke.scan_code);
            call.write_u16(key + 2, stroke.unicode);
            Status::Success
        }
        None => Status::NotReady,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        assert_eq!(cp437_from_utf16(u16::from(b'H')), b'H');
        assert_eq!(cp437_from_utf16(u16::from(b'\n')), b'\n');
    }

    #[test]
    fn box_drawing_maps_back_to_cp437() {
        assert_eq!(cp437_from_utf16(0x2550), 0xcd); // double horizontal
        assert_eq!(cp437_from_utf16(0x2588), 0xdb); // full block
        assert_eq!(cp437_from_utf16(0x00b0), 0xf8); // degree sign
    }

    #[test]
    fn unmapped_glyphs_become_question_marks() {
        assert_eq!(cp437_from_utf16(0x4e2d), b'?');
        assert_eq!(cp437_from_utf16(0xfffd), b'?');
    }
}
