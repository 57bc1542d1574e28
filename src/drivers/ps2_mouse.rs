//! Mouse packet decoding and the cached cursor state.
//!
//! IRQ 12 delivers one byte of a 3-byte PS/2 packet at a time. The
//! handler feeds bytes through [`PacketDecoder`] and folds finished
//! packets into a cached cursor position and button mask; syscall 5
//! hands that snapshot to user code. The cache is the only state the
//! IRQ path writes, matching the record-and-return rule.

use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

/// Snapshot returned to syscall 5 callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    /// Bit 0 left, bit 1 right, bit 2 middle.
    pub buttons: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MousePacket {
    pub dx: i16,
    pub dy: i16,
    pub buttons: u8,
}

/// Assembles 3-byte PS/2 mouse packets.
pub struct PacketDecoder {
    bytes: [u8; 3],
    index: usize,
}

impl PacketDecoder {
    pub const fn new() -> Self {
        Self {
            bytes: [0; 3],
            index: 0,
        }
    }

    /// Feeds one byte; returns a packet when the third byte lands.
    /// A first byte without the always-set sync bit is discarded.
    pub fn process_byte(&mut self, byte: u8) -> Option<MousePacket> {
        if self.index == 0 && byte & 0x08 == 0 {
            return None;
        }

        self.bytes[self.index] = byte;
        self.index += 1;
        if self.index < 3 {
            return None;
        }
        self.index = 0;

        let status = self.bytes[0];
        Some(MousePacket {
            dx: self.bytes[1] as i8 as i16,
            // PS/2 reports y upward; screen coordinates grow downward.
            dy: -(self.bytes[2] as i8 as i16),
            buttons: status & 0x07,
        })
    }
}

struct MouseShared {
    decoder: PacketDecoder,
    cursor: CursorState,
    bounds: (i32, i32),
}

static SHARED: Mutex<MouseShared> = Mutex::new(MouseShared {
    decoder: PacketDecoder::new(),
    cursor: CursorState {
        x: 0,
        y: 0,
        buttons: 0,
    },
    bounds: (0, 0),
});

/// Folds a finished packet into the cursor cache, clamping to the
/// screen when bounds are known and to non-negative coordinates always.
fn apply_packet(cursor: &mut CursorState, packet: MousePacket, bounds: (i32, i32)) {
    let (width, height) = bounds;
    let max_x = if width > 0 { width - 1 } else { i32::MAX };
    let max_y = if height > 0 { height - 1 } else { i32::MAX };
    cursor.x = (cursor.x + packet.dx as i32).clamp(0, max_x);
    cursor.y = (cursor.y + packet.dy as i32).clamp(0, max_y);
    cursor.buttons = packet.buttons as u32;
}

/// Sets the clamp rectangle, normally the framebuffer dimensions.
pub fn set_bounds(width: usize, height: usize) {
    without_interrupts(|| {
        SHARED.lock().bounds = (width as i32, height as i32);
    });
}

/// Called by the mouse IRQ handler with the byte from port 0x60.
pub fn handle_byte(byte: u8) {
    let mut shared = SHARED.lock();
    if let Some(packet) = shared.decoder.process_byte(byte) {
        let bounds = shared.bounds;
        apply_packet(&mut shared.cursor, packet, bounds);
    }
}

/// Current cursor snapshot, for syscall 5. Task context only; masks
/// interrupts so it cannot deadlock against the IRQ handler.
pub fn cursor_state() -> CursorState {
    without_interrupts(|| SHARED.lock().cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_assembles_three_byte_packets() {
        let mut decoder = PacketDecoder::new();
        assert_eq!(decoder.process_byte(0x09), None);
        assert_eq!(decoder.process_byte(10), None);
        let packet = decoder.process_byte(5).expect("third byte completes");
        assert_eq!(packet.dx, 10);
        assert_eq!(packet.dy, -5, "y axis must be inverted");
        assert_eq!(packet.buttons, 0x01);
    }

    #[test]
    fn decoder_discards_unsynced_first_byte() {
        let mut decoder = PacketDecoder::new();
        // Sync bit clear: not a packet start.
        assert_eq!(decoder.process_byte(0x02), None);
        // The discarded byte must not count toward the packet.
        assert_eq!(decoder.process_byte(0x08), None);
        assert_eq!(decoder.process_byte(1), None);
        assert!(decoder.process_byte(1).is_some());
    }

    #[test]
    fn negative_movement_decodes_via_sign_extension() {
        let mut decoder = PacketDecoder::new();
        decoder.process_byte(0x08);
        decoder.process_byte(0xFF); // dx = -1
        let packet = decoder.process_byte(0xFE).unwrap(); // raw dy = -2
        assert_eq!(packet.dx, -1);
        assert_eq!(packet.dy, 2);
    }

    #[test]
    fn cursor_clamps_to_bounds() {
        let mut cursor = CursorState::default();
        let bounds = (640, 480);

        apply_packet(
            &mut cursor,
            MousePacket {
                dx: -50,
                dy: -50,
                buttons: 0,
            },
            bounds,
        );
        assert_eq!((cursor.x, cursor.y), (0, 0));

        for _ in 0..100 {
            apply_packet(
                &mut cursor,
                MousePacket {
                    dx: 100,
                    dy: 100,
                    buttons: 0x04,
                },
                bounds,
            );
        }
        assert_eq!((cursor.x, cursor.y), (639, 479));
        assert_eq!(cursor.buttons, 0x04);
    }

    #[test]
    fn unknown_bounds_still_keep_coordinates_non_negative() {
        let mut cursor = CursorState::default();
        apply_packet(
            &mut cursor,
            MousePacket {
                dx: -10,
                dy: 7,
                buttons: 0,
            },
            (0, 0),
        );
        assert_eq!((cursor.x, cursor.y), (0, 7));
    }
}
