//! Controller input shared between caller threads and the stepping thread.
//!
//! Every field a step reads is a single atomic word, so a reader never sees
//! a torn value: buttons are one `u16`, a pointer position is packed into one
//! `u32`, and the pointer buttons into one `u8`.

use crate::error::SessionError;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::types::{PointerState, PortState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};

/// Ports accepting a button mask.
pub const BUTTON_PORTS: usize = 8;
/// Ports accepting a pointer device (mouse, light gun).
pub const POINTER_PORTS: usize = 2;

/// A named pad button in the 16-bit controller layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    A,
    B,
    X,
    Y,
    L,
    R,
    Start,
    Select,
    Up,
    Down,
    Left,
    Right,
}

impl Button {
    pub const ALL: [Button; 12] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::L,
        Button::R,
        Button::Start,
        Button::Select,
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
    ];

    /// Bit of this button in a port's button mask.
    pub fn mask(self) -> u16 {
        match self {
            Button::A => 0x0080,
            Button::B => 0x8000,
            Button::X => 0x0040,
            Button::Y => 0x4000,
            Button::L => 0x0020,
            Button::R => 0x0010,
            Button::Start => 0x1000,
            Button::Select => 0x2000,
            Button::Up => 0x0800,
            Button::Down => 0x0400,
            Button::Left => 0x0200,
            Button::Right => 0x0100,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Button::A => "a",
            Button::B => "b",
            Button::X => "x",
            Button::Y => "y",
            Button::L => "l",
            Button::R => "r",
            Button::Start => "start",
            Button::Select => "select",
            Button::Up => "up",
            Button::Down => "down",
            Button::Left => "left",
            Button::Right => "right",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown button `{0}`")]
pub struct ParseButtonError(String);

impl FromStr for Button {
    type Err = ParseButtonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Button::ALL
            .into_iter()
            .find(|b| b.name() == lower)
            .ok_or_else(|| ParseButtonError(s.to_string()))
    }
}

/// Combined mask of every button in `buttons`.
pub fn button_mask(buttons: impl IntoIterator<Item = Button>) -> u16 {
    buttons.into_iter().fold(0, |mask, b| mask | b.mask())
}

const LEFT_BUTTON: u8 = 0b01;
const RIGHT_BUTTON: u8 = 0b10;

fn pack(x: i16, y: i16) -> u32 {
    ((x as u16 as u32) << 16) | (y as u16 as u32)
}

fn unpack(packed: u32) -> (i16, i16) {
    ((packed >> 16) as u16 as i16, packed as u16 as i16)
}

#[derive(Debug)]
struct PointerSlot {
    position: AtomicU32,
    buttons: AtomicU8,
    active: AtomicBool,
}

impl PointerSlot {
    fn new() -> Self {
        Self {
            position: AtomicU32::new(0),
            buttons: AtomicU8::new(0),
            active: AtomicBool::new(false),
        }
    }
}

/// Latest input per port.
#[derive(Debug)]
pub struct ControlInputs {
    buttons: [AtomicU16; BUTTON_PORTS],
    pointers: [PointerSlot; POINTER_PORTS],
    /// Visible screen size packed as (width, height).
    bounds: AtomicU32,
}

impl Default for ControlInputs {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlInputs {
    pub fn new() -> Self {
        Self {
            buttons: std::array::from_fn(|_| AtomicU16::new(0)),
            pointers: std::array::from_fn(|_| PointerSlot::new()),
            bounds: AtomicU32::new(pack(256, 224)),
        }
    }

    /// Visible screen size used to clamp pointer coordinates.
    pub fn set_bounds(&self, width: u32, height: u32) {
        let w = width.clamp(1, i16::MAX as u32) as i16;
        let h = height.clamp(1, i16::MAX as u32) as i16;
        self.bounds.store(pack(w, h), Ordering::Release);
    }

    /// Record the button mask for `port`. Unsupported ports are ignored.
    pub fn set_buttons(&self, port: usize, mask: u16) {
        match self.buttons.get(port) {
            Some(slot) => slot.store(mask, Ordering::Release),
            None => log(LogCategory::Input, LogLevel::Trace, || {
                format!("ignoring buttons for port {}", port)
            }),
        }
    }

    /// Record a pointer position, clamped to the visible screen.
    pub fn set_pointer(&self, port: usize, x: i32, y: i32) {
        let Some(slot) = self.pointers.get(port) else {
            log(LogCategory::Input, LogLevel::Trace, || {
                format!("ignoring pointer for port {}", port)
            });
            return;
        };
        let (width, height) = unpack(self.bounds.load(Ordering::Acquire));
        let x = x.clamp(0, width as i32 - 1) as i16;
        let y = y.clamp(0, height as i32 - 1) as i16;
        slot.position.store(pack(x, y), Ordering::Release);
        slot.active.store(true, Ordering::Release);
    }

    pub fn set_pointer_buttons(&self, port: usize, left: bool, right: bool) {
        let Some(slot) = self.pointers.get(port) else {
            log(LogCategory::Input, LogLevel::Trace, || {
                format!("ignoring pointer buttons for port {}", port)
            });
            return;
        };
        let mut bits = 0;
        if left {
            bits |= LEFT_BUTTON;
        }
        if right {
            bits |= RIGHT_BUTTON;
        }
        slot.buttons.store(bits, Ordering::Release);
        slot.active.store(true, Ordering::Release);
    }

    /// Current state of `port`; unlike the setters this reports bad ports.
    pub fn port_state(&self, port: usize) -> Result<PortState, SessionError> {
        let buttons = self
            .buttons
            .get(port)
            .ok_or(SessionError::InvalidArgument {
                what: "port",
                value: port as i64,
            })?
            .load(Ordering::Acquire);

        let pointer = self
            .pointers
            .get(port)
            .filter(|slot| slot.active.load(Ordering::Acquire))
            .map(|slot| {
                let (x, y) = unpack(slot.position.load(Ordering::Acquire));
                let bits = slot.buttons.load(Ordering::Acquire);
                PointerState {
                    x,
                    y,
                    left: bits & LEFT_BUTTON != 0,
                    right: bits & RIGHT_BUTTON != 0,
                }
            });

        Ok(PortState { buttons, pointer })
    }

    /// State of every port, in port order.
    pub fn snapshot(&self) -> [PortState; BUTTON_PORTS] {
        std::array::from_fn(|port| self.port_state(port).unwrap_or_default())
    }

    /// Release every button and deactivate pointers.
    pub fn clear(&self) {
        for slot in &self.buttons {
            slot.store(0, Ordering::Release);
        }
        for slot in &self.pointers {
            slot.buttons.store(0, Ordering::Release);
            slot.active.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_buttons_recorded_per_port() {
        let inputs = ControlInputs::new();
        inputs.set_buttons(0, 0x8000);
        inputs.set_buttons(7, 0x0080);

        assert_eq!(inputs.port_state(0).unwrap().buttons, 0x8000);
        assert_eq!(inputs.port_state(7).unwrap().buttons, 0x0080);
        assert_eq!(inputs.port_state(1).unwrap().buttons, 0);
    }

    #[test]
    fn test_out_of_range_port_is_ignored() {
        let inputs = ControlInputs::new();
        inputs.set_buttons(2, 0x1234);
        let before = inputs.snapshot();

        inputs.set_buttons(BUTTON_PORTS, 0xFFFF);
        inputs.set_buttons(usize::MAX, 0xFFFF);
        inputs.set_pointer(POINTER_PORTS, 10, 10);
        inputs.set_pointer_buttons(POINTER_PORTS, true, true);

        assert_eq!(inputs.snapshot(), before);
    }

    #[test]
    fn test_port_state_rejects_bad_port() {
        let inputs = ControlInputs::new();
        assert!(matches!(
            inputs.port_state(BUTTON_PORTS),
            Err(SessionError::InvalidArgument { what: "port", .. })
        ));
    }

    #[test]
    fn test_pointer_clamped_to_screen() {
        let inputs = ControlInputs::new();
        inputs.set_pointer(0, -40, 500);
        let pointer = inputs.port_state(0).unwrap().pointer.unwrap();
        assert_eq!((pointer.x, pointer.y), (0, 223));

        inputs.set_pointer(1, 300, -1);
        let pointer = inputs.port_state(1).unwrap().pointer.unwrap();
        assert_eq!((pointer.x, pointer.y), (255, 0));

        inputs.set_bounds(512, 448);
        inputs.set_pointer(1, 300, 400);
        let pointer = inputs.port_state(1).unwrap().pointer.unwrap();
        assert_eq!((pointer.x, pointer.y), (300, 400));
    }

    #[test]
    fn test_pointer_buttons_forwarded() {
        let inputs = ControlInputs::new();
        assert!(inputs.port_state(0).unwrap().pointer.is_none());

        inputs.set_pointer_buttons(0, true, false);
        let pointer = inputs.port_state(0).unwrap().pointer.unwrap();
        assert!(pointer.left);
        assert!(!pointer.right);

        // pointer ports stop at 2, button-only ports never report a pointer
        assert!(inputs.port_state(5).unwrap().pointer.is_none());
    }

    #[test]
    fn test_named_buttons_map_to_pad_bits() {
        assert_eq!(button_mask([Button::A]), 0x0080);
        assert_eq!(button_mask([Button::B, Button::Y]), 0xC000);
        assert_eq!(button_mask([Button::Start, Button::Select]), 0x3000);
        assert_eq!(button_mask([Button::Up, Button::Right]), 0x0900);
        assert_eq!(button_mask([Button::L, Button::R, Button::X]), 0x0070);
        assert_eq!(button_mask(Button::ALL), 0xFFF0);
        assert_eq!(button_mask([]), 0);

        // no two buttons share a bit
        let bits: u32 = Button::ALL.iter().map(|b| b.mask().count_ones()).sum();
        assert_eq!(bits, 12);
    }

    #[test]
    fn test_button_names_parse() {
        for button in Button::ALL {
            assert_eq!(button.name().parse::<Button>().unwrap(), button);
        }
        assert_eq!(" Start ".parse::<Button>().unwrap(), Button::Start);
        assert!("turbo".parse::<Button>().is_err());

        let held: Vec<Button> = serde_json::from_str(r#"["a", "down"]"#).unwrap();
        assert_eq!(button_mask(held), 0x0480);
    }

    #[test]
    fn test_clear_releases_everything() {
        let inputs = ControlInputs::new();
        inputs.set_buttons(3, 0xFF);
        inputs.set_pointer(0, 5, 5);
        inputs.clear();
        assert_eq!(inputs.snapshot(), [PortState::default(); BUTTON_PORTS]);
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let inputs = Arc::new(ControlInputs::new());
        let writers: Vec<_> = [0x00FFu16, 0xFF00]
            .into_iter()
            .map(|mask| {
                let inputs = Arc::clone(&inputs);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        inputs.set_buttons(0, mask);
                    }
                })
            })
            .collect();

        for _ in 0..10_000 {
            let seen = inputs.port_state(0).unwrap().buttons;
            assert!(seen == 0 || seen == 0x00FF || seen == 0xFF00);
        }
        for w in writers {
            w.join().unwrap();
        }
    }
}
