//! TDS protocol version.

use core::fmt;

/// TDS protocol version acknowledged at login.
///
/// Session recovery replays state into a new physical connection, which is
/// only valid when the new login acknowledges the same version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// TDS 8.0 (strict encryption)
    pub const V8_0: Self = Self(0x0800_0000);

    /// Create a version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Major version, accounting for the TDS 8.0 encoding.
    #[must_use]
    pub const fn major(self) -> u8 {
        if self.0 == Self::V8_0.0 {
            8
        } else {
            ((self.0 >> 28) & 0x0F) as u8
        }
    }

    /// Minor version.
    #[must_use]
    pub const fn minor(self) -> u8 {
        if self.0 == Self::V8_0.0 {
            0
        } else {
            ((self.0 >> 24) & 0x0F) as u8
        }
    }

    /// Session recovery and column encryption require TDS 7.4 or later.
    #[must_use]
    pub const fn supports_session_recovery(self) -> bool {
        self.0 == Self::V8_0.0 || self.0 >= Self::V7_4.0
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TDS {}.{}", self.major(), self.minor())
    }
}
