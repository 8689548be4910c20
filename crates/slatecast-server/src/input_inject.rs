//! Virtual input devices and the stylus / multi-touch state machines.
//!
//! # Devices
//!
//! Three uinput devices are created at startup:
//!
//! - **SlateCast Stylus** — BTN_TOOL_PEN / BTN_TOOL_RUBBER / BTN_TOUCH,
//!   absolute X/Y/pressure in 0..65535 and tilt in −90..90;
//! - **SlateCast Pointer** — BTN_LEFT/RIGHT/MIDDLE with absolute X/Y;
//! - **SlateCast Touch** — five multi-touch slots with tracking ids and
//!   the BTN_TOOL_FINGER…QUINTTAP cardinality buttons.
//!
//! # Requirements
//!
//! The process needs write access to `/dev/uinput` (`modprobe uinput`,
//! membership in the `input` group or equivalent udev rule). Creation
//! failure is non-fatal for the server: streaming works, injection is
//! disabled.
//!
//! The state machines are kept separate from the devices so their event
//! sequences can be tested without a kernel.

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputId, Key, UinputAbsSetup};
use tracing::{debug, info, trace};

use slatecast_core::input::{InputEvent, InputEventType};
use slatecast_core::{Error, Result};

use crate::coords::CoordTransform;

/// Absolute axis range shared by all three devices.
const ABS_MAX: i32 = 65535;

const VENDOR_ID: u16 = 0x1A0C;
const PRODUCT_STYLUS: u16 = 0x0001;
const PRODUCT_POINTER: u16 = 0x0002;
const PRODUCT_TOUCH: u16 = 0x0003;

// ── Emitted operations (device-independent) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitOp {
    Key(Key, bool),
    Abs(AbsoluteAxisType, i32),
}

// ── Stylus state machine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Tool {
    #[default]
    None,
    Pen,
    Rubber,
}

/// One prepared stylus report, coordinates already in axis units.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StylusSample {
    pub x: i32,
    pub y: i32,
    pub pressure: i32,
    pub tilt_x: i32,
    pub tilt_y: i32,
    pub tip_down: bool,
    pub eraser: bool,
    pub in_range: bool,
}

/// Tracks which tool button is asserted and whether the tip touches.
///
/// Pressure is only reported while touching; tilt is always reported;
/// leaving range releases pressure, touch and the active tool.
#[derive(Debug, Default)]
pub(crate) struct StylusTracker {
    tool: Tool,
    touching: bool,
}

impl StylusTracker {
    pub(crate) fn apply(&mut self, s: &StylusSample) -> Vec<EmitOp> {
        let mut ops = Vec::with_capacity(8);

        if s.in_range {
            if !s.eraser && self.tool != Tool::Pen {
                ops.push(EmitOp::Key(Key::BTN_TOOL_PEN, true));
                ops.push(EmitOp::Key(Key::BTN_TOOL_RUBBER, false));
                self.tool = Tool::Pen;
            }
            if s.eraser && self.tool != Tool::Rubber {
                ops.push(EmitOp::Key(Key::BTN_TOOL_PEN, false));
                ops.push(EmitOp::Key(Key::BTN_TOOL_RUBBER, true));
                self.tool = Tool::Rubber;
            }

            if s.tip_down && !self.touching {
                ops.push(EmitOp::Key(Key::BTN_TOUCH, true));
                self.touching = true;
            } else if !s.tip_down && self.touching {
                ops.push(EmitOp::Key(Key::BTN_TOUCH, false));
                self.touching = false;
            }

            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_X, s.x));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_Y, s.y));
            ops.push(EmitOp::Abs(
                AbsoluteAxisType::ABS_PRESSURE,
                if self.touching { s.pressure } else { 0 },
            ));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_TILT_X, s.tilt_x));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_TILT_Y, s.tilt_y));
        } else {
            if self.touching {
                ops.push(EmitOp::Key(Key::BTN_TOUCH, false));
                self.touching = false;
            }
            match self.tool {
                Tool::Pen => ops.push(EmitOp::Key(Key::BTN_TOOL_PEN, false)),
                Tool::Rubber => ops.push(EmitOp::Key(Key::BTN_TOOL_RUBBER, false)),
                Tool::None => {}
            }
            self.tool = Tool::None;
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_PRESSURE, 0));
        }

        ops
    }

    pub(crate) fn release(&mut self) -> Vec<EmitOp> {
        self.apply(&StylusSample {
            x: 0,
            y: 0,
            pressure: 0,
            tilt_x: 0,
            tilt_y: 0,
            tip_down: false,
            eraser: false,
            in_range: false,
        })
    }

    #[cfg(test)]
    fn is_touching(&self) -> bool {
        self.touching
    }
}

// ── Multi-touch state machine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TouchSlot {
    pub active: bool,
    pub tracking_id: i32,
}

impl Default for TouchSlot {
    fn default() -> Self {
        Self { active: false, tracking_id: -1 }
    }
}

/// The tool button corresponding to a finger count.
fn tool_button(fingers: usize) -> Key {
    match fingers {
        1 => Key::BTN_TOOL_FINGER,
        2 => Key::BTN_TOOL_DOUBLETAP,
        3 => Key::BTN_TOOL_TRIPLETAP,
        4 => Key::BTN_TOOL_QUADTAP,
        _ => Key::BTN_TOOL_QUINTTAP,
    }
}

/// Five-slot multi-touch bookkeeping.
///
/// Exactly one tool button is asserted while any slot is active, and it
/// always matches the current cardinality; BTN_TOUCH asserts on the
/// first contact and releases with the last.
#[derive(Debug, Default)]
pub(crate) struct TouchTracker {
    slots: [TouchSlot; 5],
}

impl TouchTracker {
    pub(crate) fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    #[cfg(test)]
    pub(crate) fn tracking_ids(&self) -> Vec<i32> {
        self.slots.iter().filter(|s| s.active).map(|s| s.tracking_id).collect()
    }

    pub(crate) fn touch(
        &mut self,
        slot: usize,
        down: bool,
        x: i32,
        y: i32,
        pressure: i32,
    ) -> Vec<EmitOp> {
        if slot >= self.slots.len() {
            return Vec::new();
        }
        let mut ops = Vec::with_capacity(10);
        ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_SLOT, slot as i32));

        if down {
            if !self.slots[slot].active {
                let prev = self.active_count();
                self.slots[slot] = TouchSlot { active: true, tracking_id: slot as i32 };

                ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_TRACKING_ID, slot as i32));
                if prev == 0 {
                    ops.push(EmitOp::Key(Key::BTN_TOUCH, true));
                } else {
                    ops.push(EmitOp::Key(tool_button(prev), false));
                }
                ops.push(EmitOp::Key(tool_button(prev + 1), true));
            }

            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_POSITION_X, x));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_POSITION_Y, y));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_PRESSURE, pressure));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_X, x));
            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_Y, y));
        } else if self.slots[slot].active {
            let prev = self.active_count();
            self.slots[slot] = TouchSlot::default();

            ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_TRACKING_ID, -1));
            ops.push(EmitOp::Key(tool_button(prev), false));
            if prev > 1 {
                ops.push(EmitOp::Key(tool_button(prev - 1), true));
            } else {
                ops.push(EmitOp::Key(Key::BTN_TOUCH, false));
            }
        }

        ops
    }

    /// Release every tracking id and button.
    pub(crate) fn reset(&mut self) -> Vec<EmitOp> {
        let mut ops = Vec::new();
        for (slot, state) in self.slots.iter_mut().enumerate() {
            if state.active {
                ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_SLOT, slot as i32));
                ops.push(EmitOp::Abs(AbsoluteAxisType::ABS_MT_TRACKING_ID, -1));
                *state = TouchSlot::default();
            }
        }
        ops.push(EmitOp::Key(Key::BTN_TOUCH, false));
        for fingers in 1..=5 {
            ops.push(EmitOp::Key(tool_button(fingers), false));
        }
        ops
    }
}

// ── InputSink ─────────────────────────────────────────────────────────────────

/// Owns the three virtual devices and routes decoded client events into
/// them.
pub struct InputSink {
    stylus: VirtualDevice,
    pointer: VirtualDevice,
    touch: VirtualDevice,
    stylus_state: StylusTracker,
    touch_state: TouchTracker,
    screen_width: u32,
    screen_height: u32,
}

impl InputSink {
    pub fn new(screen_width: u32, screen_height: u32) -> Result<Self> {
        let stylus = build_stylus_device()?;
        let pointer = build_pointer_device()?;
        let touch = build_touch_device()?;
        info!("created uinput devices: stylus + pointer + touch");
        Ok(Self {
            stylus,
            pointer,
            touch,
            stylus_state: StylusTracker::default(),
            touch_state: TouchTracker::default(),
            screen_width,
            screen_height,
        })
    }

    /// Translate and inject one client event.
    pub fn handle_event(&mut self, event: &InputEvent, transform: &CoordTransform) -> Result<()> {
        let (sx, sy) = transform.transform(event.x, event.y);
        let x = to_axis(sx, self.screen_width);
        let y = to_axis(sy, self.screen_height);

        match event.kind {
            InputEventType::StylusDown
            | InputEventType::StylusMove
            | InputEventType::StylusUp
            | InputEventType::StylusHover => {
                // An UP keeps the pen in proximity: the tip lifts but the
                // tool stays asserted until the stylus leaves range
                // (session reset) so hover keeps tracking.
                let tip_down = matches!(
                    event.kind,
                    InputEventType::StylusDown | InputEventType::StylusMove
                );
                let sample = StylusSample {
                    x,
                    y,
                    pressure: pressure_axis(event.pressure),
                    tilt_x: event.tilt_x as i32,
                    tilt_y: event.tilt_y as i32,
                    tip_down,
                    eraser: event.eraser(),
                    in_range: true,
                };
                let ops = self.stylus_state.apply(&sample);
                emit(&mut self.stylus, &ops)?;
            }
            InputEventType::TouchDown | InputEventType::TouchMove => {
                let ops = self.touch_state.touch(
                    event.pointer_id as usize,
                    true,
                    x,
                    y,
                    pressure_axis(event.pressure),
                );
                emit(&mut self.touch, &ops)?;
            }
            InputEventType::TouchUp => {
                let ops = self.touch_state.touch(event.pointer_id as usize, false, x, y, 0);
                emit(&mut self.touch, &ops)?;
            }
            InputEventType::KeyDown | InputEventType::KeyUp => {
                // No virtual keyboard; the tablet client does not send
                // these today.
                trace!("ignoring key event");
            }
        }
        Ok(())
    }

    /// Release everything that might still be asserted. Called on
    /// client loss and before the devices are destroyed so the host
    /// never keeps a stuck button or tracking id.
    pub fn reset(&mut self) {
        let ops = self.stylus_state.release();
        if let Err(e) = emit(&mut self.stylus, &ops) {
            debug!("stylus reset: {e}");
        }

        let ops = self.touch_state.reset();
        if let Err(e) = emit(&mut self.touch, &ops) {
            debug!("touch reset: {e}");
        }

        let buttons = [
            EmitOp::Key(Key::BTN_LEFT, false),
            EmitOp::Key(Key::BTN_RIGHT, false),
            EmitOp::Key(Key::BTN_MIDDLE, false),
        ];
        if let Err(e) = emit(&mut self.pointer, &buttons) {
            debug!("pointer reset: {e}");
        }
        debug!("input state reset");
    }
}

impl Drop for InputSink {
    fn drop(&mut self) {
        self.reset();
    }
}

// ── Device construction ───────────────────────────────────────────────────────

fn axis(code: AbsoluteAxisType, min: i32, max: i32, resolution: i32) -> UinputAbsSetup {
    UinputAbsSetup::new(code, AbsInfo::new(0, min, max, 0, 0, resolution))
}

fn uinput_err(what: &str) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::unavailable(format!("{what}: {e} (is /dev/uinput writable?)"))
}

fn build_stylus_device() -> Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    keys.insert(Key::BTN_TOOL_PEN);
    keys.insert(Key::BTN_TOOL_RUBBER);
    keys.insert(Key::BTN_TOUCH);

    VirtualDeviceBuilder::new()
        .map_err(uinput_err("stylus device"))?
        .name("SlateCast Stylus")
        .input_id(InputId::new(BusType::BUS_VIRTUAL, VENDOR_ID, PRODUCT_STYLUS, 1))
        .with_keys(&keys)
        .map_err(uinput_err("stylus keys"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_X, 0, ABS_MAX, 12))
        .map_err(uinput_err("stylus axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_Y, 0, ABS_MAX, 12))
        .map_err(uinput_err("stylus axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_PRESSURE, 0, ABS_MAX, 12))
        .map_err(uinput_err("stylus axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_TILT_X, -90, 90, 12))
        .map_err(uinput_err("stylus axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_TILT_Y, -90, 90, 12))
        .map_err(uinput_err("stylus axes"))?
        .build()
        .map_err(uinput_err("stylus device"))
}

fn build_pointer_device() -> Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    keys.insert(Key::BTN_LEFT);
    keys.insert(Key::BTN_RIGHT);
    keys.insert(Key::BTN_MIDDLE);

    VirtualDeviceBuilder::new()
        .map_err(uinput_err("pointer device"))?
        .name("SlateCast Pointer")
        .input_id(InputId::new(BusType::BUS_VIRTUAL, VENDOR_ID, PRODUCT_POINTER, 1))
        .with_keys(&keys)
        .map_err(uinput_err("pointer keys"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_X, 0, ABS_MAX, 0))
        .map_err(uinput_err("pointer axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_Y, 0, ABS_MAX, 0))
        .map_err(uinput_err("pointer axes"))?
        .build()
        .map_err(uinput_err("pointer device"))
}

fn build_touch_device() -> Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    keys.insert(Key::BTN_TOUCH);
    keys.insert(Key::BTN_TOOL_FINGER);
    keys.insert(Key::BTN_TOOL_DOUBLETAP);
    keys.insert(Key::BTN_TOOL_TRIPLETAP);
    keys.insert(Key::BTN_TOOL_QUADTAP);
    keys.insert(Key::BTN_TOOL_QUINTTAP);

    VirtualDeviceBuilder::new()
        .map_err(uinput_err("touch device"))?
        .name("SlateCast Touch")
        .input_id(InputId::new(BusType::BUS_VIRTUAL, VENDOR_ID, PRODUCT_TOUCH, 1))
        .with_keys(&keys)
        .map_err(uinput_err("touch keys"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_X, 0, ABS_MAX, 200))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_Y, 0, ABS_MAX, 200))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_MT_SLOT, 0, 4, 0))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_MT_TRACKING_ID, 0, 4, 0))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_MT_POSITION_X, 0, ABS_MAX, 200))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_MT_POSITION_Y, 0, ABS_MAX, 200))
        .map_err(uinput_err("touch axes"))?
        .with_absolute_axis(&axis(AbsoluteAxisType::ABS_MT_PRESSURE, 0, ABS_MAX, 0))
        .map_err(uinput_err("touch axes"))?
        .build()
        .map_err(uinput_err("touch device"))
}

// ── Emission helpers ──────────────────────────────────────────────────────────

/// Rescale a screen pixel coordinate into the 0..65535 axis range.
fn to_axis(value: i32, dimension: u32) -> i32 {
    ((value as f32 / dimension as f32) * ABS_MAX as f32) as i32
}

fn pressure_axis(pressure: f32) -> i32 {
    (pressure.clamp(0.0, 1.0) * ABS_MAX as f32) as i32
}

fn emit(device: &mut VirtualDevice, ops: &[EmitOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    let mut events: Vec<evdev::InputEvent> = ops
        .iter()
        .map(|op| match *op {
            EmitOp::Key(key, pressed) => {
                evdev::InputEvent::new(EventType::KEY, key.code(), pressed as i32)
            }
            EmitOp::Abs(code, value) => evdev::InputEvent::new(EventType::ABSOLUTE, code.0, value),
        })
        .collect();
    events.push(evdev::InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
    device
        .emit(&events)
        .map_err(|e| Error::unavailable(format!("uinput emit: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
