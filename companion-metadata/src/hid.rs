// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synthetic HID events.

use serde::{Deserialize, Serialize};

/// A synthetic human-interface event delivered to the target.
///
/// Coordinates are points in the target's logical screen, not pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HidEvent {
    /// A touch began at the given point.
    TouchDown {
        /// Logical x coordinate.
        x: f64,
        /// Logical y coordinate.
        y: f64,
    },
    /// A touch ended at the given point.
    TouchUp {
        /// Logical x coordinate.
        x: f64,
        /// Logical y coordinate.
        y: f64,
    },
    /// An in-progress touch moved to the given point.
    TouchMove {
        /// Logical x coordinate.
        x: f64,
        /// Logical y coordinate.
        y: f64,
    },
    /// A touch down immediately followed by a touch up.
    Tap {
        /// Logical x coordinate.
        x: f64,
        /// Logical y coordinate.
        y: f64,
    },
    /// A hardware button was pressed.
    ButtonDown {
        /// The button pressed.
        button: HidButton,
    },
    /// A hardware button was released.
    ButtonUp {
        /// The button released.
        button: HidButton,
    },
    /// A key went down.
    KeyDown {
        /// The keycode.
        keycode: u32,
    },
    /// A key went up.
    KeyUp {
        /// The keycode.
        keycode: u32,
    },
}

/// Hardware buttons addressable by HID events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HidButton {
    /// The home button.
    Home,
    /// The lock/power button.
    Lock,
    /// The side button on devices without a home button.
    Side,
    /// The Siri activation button.
    Siri,
    /// The Apple Pay double-click.
    ApplePay,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_event_wire_shape() {
        let event = HidEvent::Tap { x: 10.0, y: 20.5 };
        let json = serde_json::to_string(&event).expect("event serializes");
        assert_eq!(json, r#"{"type":"tap","x":10.0,"y":20.5}"#);

        let back: HidEvent = serde_json::from_str(&json).expect("event deserializes");
        assert_eq!(back, event);
    }
}
