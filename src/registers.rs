//! Neptun Smart holding register layout.
//!
//! All state the controller exposes lives in a handful of 16-bit holding registers. Most of them
//! are bitfields where each bit is an independent flag. Decoding never fails: bits the device
//! does not document are masked away rather than validated.

/// Wireless sensors reporting a battery level under this are considered low on battery.
pub const LOW_BATTERY_THRESHOLD: u8 = 20;

/// Address of the status register of the first wireless sensor.
pub const WIRELESS_SENSOR_STATUS_BASE: u16 = 57;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Config,
    WiredSensorsStatus,
    WirelessSensorsCount,
    /// Status of the wireless sensor with the given 0-based index.
    WirelessSensorStatus(u8),
}

impl Register {
    pub const fn address(self) -> u16 {
        match self {
            Register::Config => 0,
            Register::WiredSensorsStatus => 3,
            Register::WirelessSensorsCount => 6,
            Register::WirelessSensorStatus(index) => WIRELESS_SENSOR_STATUS_BASE + index as u16,
        }
    }
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
}

#[derive(serde::Serialize)]
pub struct RegisterSchema {
    pub address: &'static str,
    pub name: &'static str,
    pub mode: Mode,
    pub description: &'static str,
}

pub const REGISTERS: [RegisterSchema; 4] = [
    RegisterSchema {
        address: "0",
        name: "CONFIG",
        mode: Mode::RW,
        description: "Module configuration and valve state, 13 flags",
    },
    RegisterSchema {
        address: "3",
        name: "WIRED_SENSORS_STATUS",
        mode: Mode::R,
        description: "Leak alarm on wired sensor lines one to four",
    },
    RegisterSchema {
        address: "6",
        name: "WIRELESS_SENSORS_COUNT",
        mode: Mode::R,
        description: "Number of paired wireless sensors",
    },
    RegisterSchema {
        address: "57+N",
        name: "WIRELESS_SENSOR_STATUS",
        mode: Mode::R,
        description: "Wireless sensor N: leak alarm (bit 0), lost connection (bit 2), \
                      battery level (high byte)",
    },
];

macro_rules! bitfield_register {
    (
        $(#[$attr:meta])*
        pub struct $name:ident {
            $($(#[$field_attr:meta])* $bit:literal => $field:ident,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
        pub struct $name {
            $($(#[$field_attr])* pub $field: bool,)*
        }

        impl $name {
            /// Bits of the register word that carry a flag.
            pub const MASK: u16 = 0 $(| (1 << $bit))*;

            pub const fn from_word(word: u16) -> Self {
                Self { $($field: word & (1 << $bit) != 0,)* }
            }

            pub const fn to_word(&self) -> u16 {
                0 $(| ((self.$field as u16) << $bit))*
            }
        }
    };
}

bitfield_register! {
    /// The configuration register.
    ///
    /// Besides settings this also carries the valve state, so opening or closing the valves is a
    /// matter of writing this register back with the relevant flags flipped.
    pub struct Config {
        0 => floor_wash_mode,
        1 => alarm_first_group,
        2 => alarm_second_group,
        3 => wireless_sensors_low_battery,
        4 => wireless_sensors_connection_lost,
        5 => valve_close_on_first_group_lost_connection,
        6 => valve_close_on_second_group_lost_connection,
        7 => pairing_mode_active,
        8 => valve_open_first_group,
        9 => valve_open_second_group,
        10 => groups_enabled,
        11 => valve_close_on_lost_connection,
        12 => keyboard_locked,
    }
}

bitfield_register! {
    /// Leak alarms reported by the wired sensor lines.
    pub struct WiredSensorsStatus {
        0 => alarm_detected_line_one,
        1 => alarm_detected_line_two,
        2 => alarm_detected_line_three,
        3 => alarm_detected_line_four,
    }
}

impl WiredSensorsStatus {
    /// Alarm flag of the wired line with the 0-based `index`.
    pub fn line(&self, index: usize) -> Option<bool> {
        [
            self.alarm_detected_line_one,
            self.alarm_detected_line_two,
            self.alarm_detected_line_three,
            self.alarm_detected_line_four,
        ]
        .get(index)
        .copied()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct WirelessSensorsCount {
    pub count: u16,
}

impl WirelessSensorsCount {
    pub const fn from_word(word: u16) -> Self {
        Self { count: word }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct WirelessSensorStatus {
    pub alarm_detected: bool,
    pub connection_lost: bool,
    pub battery_level: u8,
}

impl WirelessSensorStatus {
    pub const fn from_word(word: u16) -> Self {
        Self {
            alarm_detected: word & (1 << 0) != 0,
            connection_lost: word & (1 << 2) != 0,
            battery_level: (word >> 8) as u8,
        }
    }

    pub const fn is_battery_low(&self) -> bool {
        self.battery_level < LOW_BATTERY_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_keeps_low_bits_and_clears_the_rest() {
        for word in 0..=u16::MAX {
            let encoded = Config::from_word(word).to_word();
            assert_eq!(encoded & 0x1FFF, word & 0x1FFF, "word {word:#06x}");
            assert_eq!(encoded & !0x1FFF, 0, "word {word:#06x}");
        }
        assert_eq!(Config::MASK, 0x1FFF);
    }

    #[test]
    fn config_bit_positions() {
        let config = Config::from_word(0b0000_0001_0000_0000);
        assert_eq!(config, Config { valve_open_first_group: true, ..Config::default() });

        let config = Config::from_word(1 << 12);
        assert_eq!(config, Config { keyboard_locked: true, ..Config::default() });
        assert_eq!(Config { floor_wash_mode: true, ..Config::default() }.to_word(), 1);
        assert_eq!(Config { groups_enabled: true, ..Config::default() }.to_word(), 1 << 10);
    }

    #[test]
    fn config_ignores_undocumented_bits() {
        assert_eq!(Config::from_word(0xE000), Config::default());
    }

    #[test]
    fn wired_sensor_lines() {
        let status = WiredSensorsStatus::from_word(0b1010);
        assert!(!status.alarm_detected_line_one);
        assert!(status.alarm_detected_line_two);
        assert!(!status.alarm_detected_line_three);
        assert!(status.alarm_detected_line_four);
        assert_eq!(status.line(1), Some(true));
        assert_eq!(status.line(4), None);
        assert_eq!(WiredSensorsStatus::from_word(0xFFF0), WiredSensorsStatus::default());
    }

    #[test]
    fn wireless_sensor_status() {
        let status = WirelessSensorStatus::from_word(0x1305);
        assert!(status.alarm_detected);
        assert!(status.connection_lost);
        assert_eq!(status.battery_level, 19);
        assert!(status.is_battery_low());

        let status = WirelessSensorStatus::from_word(0x6402);
        assert!(!status.alarm_detected);
        assert!(!status.connection_lost);
        assert_eq!(status.battery_level, 100);
        assert!(!status.is_battery_low());
    }

    #[test]
    fn register_addresses() {
        assert_eq!(Register::Config.address(), 0);
        assert_eq!(Register::WiredSensorsStatus.address(), 3);
        assert_eq!(Register::WirelessSensorsCount.address(), 6);
        assert_eq!(Register::WirelessSensorStatus(0).address(), 57);
        assert_eq!(Register::WirelessSensorStatus(255).address(), 312);
        assert_eq!(WirelessSensorsCount::from_word(3).count, 3);
    }
}
