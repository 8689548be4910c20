//! Client input events and their 28-byte packed wire format.
//!
//! Events arrive over the TCP input channel as fixed-size packets with
//! little-endian multi-byte fields (the format the tablet client emits on
//! x86-64/ARM64):
//!
//! ```text
//!  0: type         u8
//!  1: pointer_id   u8
//!  2: x            f32  normalized [0, 1]
//!  6: y            f32  normalized [0, 1]
//! 10: pressure     f32  [0, 1]
//! 14: tilt_x       f32  radians
//! 18: tilt_y       f32  radians
//! 22: buttons      u16  bit1 secondary, bit2 tertiary, bit5 eraser
//! 24: timestamp    u32  milliseconds
//! ```

use crate::error::{Error, Result};

/// Secondary stylus barrel button.
pub const BUTTON_SECONDARY: u16 = 1 << 1;
/// Tertiary stylus barrel button.
pub const BUTTON_TERTIARY: u16 = 1 << 2;
/// Eraser end of the stylus is in use.
pub const BUTTON_ERASER: u16 = 1 << 5;

// ── InputEventType ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputEventType {
    TouchDown = 0x01,
    TouchMove = 0x02,
    TouchUp = 0x03,
    StylusDown = 0x04,
    StylusMove = 0x05,
    StylusUp = 0x06,
    StylusHover = 0x07,
    KeyDown = 0x08,
    KeyUp = 0x09,
}

impl TryFrom<u8> for InputEventType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::TouchDown),
            0x02 => Ok(Self::TouchMove),
            0x03 => Ok(Self::TouchUp),
            0x04 => Ok(Self::StylusDown),
            0x05 => Ok(Self::StylusMove),
            0x06 => Ok(Self::StylusUp),
            0x07 => Ok(Self::StylusHover),
            0x08 => Ok(Self::KeyDown),
            0x09 => Ok(Self::KeyUp),
            other => Err(Error::protocol(format!("unknown input event type 0x{other:02x}"))),
        }
    }
}

// ── InputEvent ────────────────────────────────────────────────────────────────

/// One decoded input event from the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: InputEventType,
    /// Touch slot (0..4) for touch events; 0 for stylus.
    pub pointer_id: u8,
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub tilt_x: f32,
    pub tilt_y: f32,
    pub buttons: u16,
    pub timestamp_ms: u32,
}

impl InputEvent {
    pub const WIRE_SIZE: usize = 28;

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(Error::protocol(format!(
                "input event too short: {} < {}",
                data.len(),
                Self::WIRE_SIZE
            )));
        }
        let f32_at = |i: usize| f32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Ok(Self {
            kind: InputEventType::try_from(data[0])?,
            pointer_id: data[1],
            x: f32_at(2),
            y: f32_at(6),
            pressure: f32_at(10),
            tilt_x: f32_at(14),
            tilt_y: f32_at(18),
            buttons: u16::from_le_bytes([data[22], data[23]]),
            timestamp_ms: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.pointer_id;
        buf[2..6].copy_from_slice(&self.x.to_le_bytes());
        buf[6..10].copy_from_slice(&self.y.to_le_bytes());
        buf[10..14].copy_from_slice(&self.pressure.to_le_bytes());
        buf[14..18].copy_from_slice(&self.tilt_x.to_le_bytes());
        buf[18..22].copy_from_slice(&self.tilt_y.to_le_bytes());
        buf[22..24].copy_from_slice(&self.buttons.to_le_bytes());
        buf[24..28].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }

    pub fn is_touch(&self) -> bool {
        matches!(
            self.kind,
            InputEventType::TouchDown | InputEventType::TouchMove | InputEventType::TouchUp
        )
    }

    pub fn is_stylus(&self) -> bool {
        matches!(
            self.kind,
            InputEventType::StylusDown
                | InputEventType::StylusMove
                | InputEventType::StylusUp
                | InputEventType::StylusHover
        )
    }

    pub fn eraser(&self) -> bool {
        self.buttons & BUTTON_ERASER != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_is_28() {
        assert_eq!(InputEvent::WIRE_SIZE, 28);
    }

    #[test]
    fn event_roundtrip() {
        let ev = InputEvent {
            kind: InputEventType::StylusMove,
            pointer_id: 0,
            x: 0.25,
            y: 0.75,
            pressure: 0.5,
            tilt_x: -0.3,
            tilt_y: 0.1,
            buttons: BUTTON_ERASER,
            timestamp_ms: 123_456,
        };

        let bytes = ev.encode();
        assert_eq!(bytes.len(), 28);
        let decoded = InputEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, ev);
        assert!(decoded.eraser());
        assert!(decoded.is_stylus());
        assert!(!decoded.is_touch());
    }

    #[test]
    fn rejects_unknown_type_and_short_reads() {
        let mut bytes = [0u8; 28];
        bytes[0] = 0x7F;
        assert!(InputEvent::decode(&bytes).is_err());
        assert!(InputEvent::decode(&bytes[..27]).is_err());
    }
}
