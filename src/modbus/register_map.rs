// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 register map
//!
//! Every axis controller of the manipulator exposes the same holding register
//! layout; only the Modbus slave identifier differs between the X, Y and Z
//! controllers. Addresses are word based.
//!
//! | Address | Role | Width | Encoding |
//! |---------|------|-------|----------|
//! | 0 | Move type | 16 | 1 = absolute, 2 = relative |
//! | 2-3 | Target position | 32 | signed µm |
//! | 8-9 | Velocity | 32 | unsigned µm/s |
//! | 14 | Motor on | 16 | 0 / 1 |
//! | 15 | Command word | 16 | see [`CommandWord`] |
//! | 17 | Status word | 16 | see [`StatusWord`] |
//! | 18-19 | Current position | 32 | signed µm |
//! | 20 | Error code | 16 | see [`ErrorCode`] |
//! | 22 | Clear error request | 16 | write 1 |
//! | 70 | Homing type | 16 | device specific |
//! | 72-73 | Backlash | 32 | signed µm |
//!
//! 32-bit values are split over two consecutive registers with the **low**
//! word at the base address and the high word at base + 1.

use bitflags::bitflags;

/// Width of a register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// One 16-bit holding register
    Single,
    /// Two consecutive registers, low word first
    Double,
}

impl RegisterWidth {
    /// Number of 16-bit registers covered by the field
    pub const fn count(self) -> u16 {
        match self {
            RegisterWidth::Single => 1,
            RegisterWidth::Double => 2,
        }
    }
}

/// Semantic role of a register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRole {
    MoveType,
    TargetPosition,
    Velocity,
    MotorOn,
    CommandWord,
    StatusWord,
    CurrentPosition,
    ErrorCode,
    ClearError,
    HomingType,
    Backlash,
}

/// A register field: base address plus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAddress {
    pub role: RegisterRole,
    pub address: u16,
    pub width: RegisterWidth,
}

impl RegisterAddress {
    const fn new(role: RegisterRole, address: u16, width: RegisterWidth) -> Self {
        Self {
            role,
            address,
            width,
        }
    }

    /// Number of registers to read or write for this field
    pub const fn count(&self) -> u16 {
        self.width.count()
    }

    /// Whether `address` falls inside this field
    pub const fn contains(&self, address: u16) -> bool {
        address >= self.address && address < self.address + self.width.count()
    }
}

pub const MOVE_TYPE: RegisterAddress =
    RegisterAddress::new(RegisterRole::MoveType, 0, RegisterWidth::Single);
pub const TARGET_POSITION: RegisterAddress =
    RegisterAddress::new(RegisterRole::TargetPosition, 2, RegisterWidth::Double);
pub const VELOCITY: RegisterAddress =
    RegisterAddress::new(RegisterRole::Velocity, 8, RegisterWidth::Double);
pub const MOTOR_ON: RegisterAddress =
    RegisterAddress::new(RegisterRole::MotorOn, 14, RegisterWidth::Single);
pub const COMMAND_WORD: RegisterAddress =
    RegisterAddress::new(RegisterRole::CommandWord, 15, RegisterWidth::Single);
pub const STATUS_WORD: RegisterAddress =
    RegisterAddress::new(RegisterRole::StatusWord, 17, RegisterWidth::Single);
pub const CURRENT_POSITION: RegisterAddress =
    RegisterAddress::new(RegisterRole::CurrentPosition, 18, RegisterWidth::Double);
pub const ERROR_CODE: RegisterAddress =
    RegisterAddress::new(RegisterRole::ErrorCode, 20, RegisterWidth::Single);
pub const CLEAR_ERROR: RegisterAddress =
    RegisterAddress::new(RegisterRole::ClearError, 22, RegisterWidth::Single);
pub const HOMING_TYPE: RegisterAddress =
    RegisterAddress::new(RegisterRole::HomingType, 70, RegisterWidth::Single);
pub const BACKLASH: RegisterAddress =
    RegisterAddress::new(RegisterRole::Backlash, 72, RegisterWidth::Double);

/// The complete map, in address order.
pub const REGISTER_MAP: [RegisterAddress; 11] = [
    MOVE_TYPE,
    TARGET_POSITION,
    VELOCITY,
    MOTOR_ON,
    COMMAND_WORD,
    STATUS_WORD,
    CURRENT_POSITION,
    ERROR_CODE,
    CLEAR_ERROR,
    HOMING_TYPE,
    BACKLASH,
];

/// Look up the field covering a register address.
pub fn field_at(address: u16) -> Option<RegisterAddress> {
    REGISTER_MAP.iter().copied().find(|f| f.contains(address))
}

bitflags! {
    /// Bit-encoded motion request written to [`COMMAND_WORD`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandWord: u16 {
        const START_MOVE = 1 << 0;
        const STOP       = 1 << 1;
        const START_HOME = 1 << 2;
    }
}

impl CommandWord {
    /// A command word is well formed when it carries at most one motion
    /// initiating bit and never combines a start with a stop.
    pub fn is_well_formed(self) -> bool {
        let starts = self & (CommandWord::START_MOVE | CommandWord::START_HOME);
        match starts.bits().count_ones() {
            0 => true,
            1 => !self.contains(CommandWord::STOP),
            _ => false,
        }
    }
}

bitflags! {
    /// Bit-encoded device state read from [`STATUS_WORD`].
    ///
    /// Exactly one of `IDLE`, `MOVING` and `HOMING_ACTIVE` is set on a healthy
    /// device. `ERROR` may be set alongside and takes precedence.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        const IDLE          = 1 << 0;
        const MOVING        = 1 << 1;
        const HOMING_ACTIVE = 1 << 2;
        const HOMED         = 1 << 3;
        const IN_POSITION   = 1 << 4;
        const ERROR         = 1 << 7;
    }
}

impl StatusWord {
    /// A move or homing run is in flight
    pub fn is_busy(self) -> bool {
        self.intersects(StatusWord::MOVING | StatusWord::HOMING_ACTIVE)
    }

    pub fn is_error(self) -> bool {
        self.contains(StatusWord::ERROR)
    }

    pub fn is_homed(self) -> bool {
        self.contains(StatusWord::HOMED)
    }

    /// Check the "exactly one activity bit" invariant.
    pub fn is_consistent(self) -> bool {
        (self & (StatusWord::IDLE | StatusWord::MOVING | StatusWord::HOMING_ACTIVE))
            .bits()
            .count_ones()
            == 1
    }
}

/// Value of the [`MOVE_TYPE`] register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MoveType {
    Absolute = 1,
    Relative = 2,
}

impl MoveType {
    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            1 => Some(MoveType::Absolute),
            2 => Some(MoveType::Relative),
            _ => None,
        }
    }
}

/// Value of the [`ERROR_CODE`] register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    InvalidVelocity = 1,
    TargetOutOfTravel = 2,
    InvalidMoveType = 3,
}

impl ErrorCode {
    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::None),
            1 => Some(ErrorCode::InvalidVelocity),
            2 => Some(ErrorCode::TargetOutOfTravel),
            3 => Some(ErrorCode::InvalidMoveType),
            _ => None,
        }
    }
}

/// Split a signed 32-bit value into `[low, high]` register words.
pub fn i32_to_registers(value: i32) -> [u16; 2] {
    u32_to_registers(value as u32)
}

/// Combine `[low, high]` register words into a signed 32-bit value.
pub fn registers_to_i32(words: [u16; 2]) -> i32 {
    registers_to_u32(words) as i32
}

/// Split an unsigned 32-bit value into `[low, high]` register words.
pub fn u32_to_registers(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Combine `[low, high]` register words into an unsigned 32-bit value.
pub fn registers_to_u32(words: [u16; 2]) -> u32 {
    (words[0] as u32) | ((words[1] as u32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_positions_survive_register_split() {
        for value in [0, 1, -1, 5000, -5000, 65_535, 65_536, -65_536, i32::MAX, i32::MIN] {
            assert_eq!(registers_to_i32(i32_to_registers(value)), value);
        }
    }

    #[test]
    fn test_low_word_comes_first() {
        assert_eq!(i32_to_registers(0x0001_0002), [0x0002, 0x0001]);
        assert_eq!(i32_to_registers(-2), [0xFFFE, 0xFFFF]);
        assert_eq!(registers_to_u32([0x5678, 0x1234]), 0x1234_5678);
    }

    #[test]
    fn test_fields_do_not_overlap() {
        for (i, a) in REGISTER_MAP.iter().enumerate() {
            for b in REGISTER_MAP.iter().skip(i + 1) {
                assert!(a.address + a.count() <= b.address, "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_field_lookup() {
        assert_eq!(field_at(19), Some(CURRENT_POSITION));
        assert_eq!(field_at(17), Some(STATUS_WORD));
        assert_eq!(field_at(1), None);
        assert_eq!(field_at(500), None);
    }

    #[test]
    fn test_command_word_validation() {
        assert!(CommandWord::START_MOVE.is_well_formed());
        assert!(CommandWord::STOP.is_well_formed());
        assert!(CommandWord::empty().is_well_formed());
        assert!(!(CommandWord::START_MOVE | CommandWord::START_HOME).is_well_formed());
        assert!(!(CommandWord::START_HOME | CommandWord::STOP).is_well_formed());
    }

    #[test]
    fn test_status_word_helpers() {
        let moving = StatusWord::MOVING | StatusWord::HOMED;
        assert!(moving.is_busy());
        assert!(moving.is_consistent());
        assert!(!StatusWord::IDLE.is_busy());
        assert!(!(StatusWord::IDLE | StatusWord::MOVING).is_consistent());
        assert!((StatusWord::IDLE | StatusWord::ERROR).is_error());
    }
}
