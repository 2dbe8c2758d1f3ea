//! Platform identifiers and specificity reduction.
//!
//! A platform is a 64-bit value split into six groups, ordered from most
//! generic to most specific:
//!
//! ```text
//! bits  0..8   platform          (group 0)
//! bits  8..16  arch              (group 1)
//! bits 16..24  render_api_group  (group 2)
//! bits 24..32  render_api        (group 3)
//! bits 32..40  quality_level     (group 4)
//! bits 40..64  custom            (group 5)
//! ```
//!
//! A zero group is unspecified. The value 0 is the fully generic platform
//! that every fallback chain ends in.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of specificity groups.
pub const GROUP_COUNT: usize = 6;

/// Bit offset and width of each group, most generic first.
const GROUPS: [(u32, u32); GROUP_COUNT] = [(0, 8), (8, 8), (16, 8), (24, 8), (32, 8), (40, 24)];

/// Group names as accepted by [`Platform::from_str`].
pub const GROUP_NAMES: [&str; GROUP_COUNT] = [
    "platform",
    "arch",
    "render_api_group",
    "render_api",
    "quality_level",
    "custom",
];

fn group_mask(index: usize) -> u64 {
    let (shift, width) = GROUPS[index];
    ((1u64 << width) - 1) << shift
}

/// Per-group field values. Unset fields stay 0 (generic).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformDeclaration {
    pub platform: u32,
    pub arch: u32,
    pub render_api_group: u32,
    pub render_api: u32,
    pub quality_level: u32,
    pub custom: u32,
}

impl PlatformDeclaration {
    fn fields(&self) -> [u32; GROUP_COUNT] {
        [
            self.platform,
            self.arch,
            self.render_api_group,
            self.render_api,
            self.quality_level,
            self.custom,
        ]
    }

    fn field_mut(&mut self, index: usize) -> &mut u32 {
        match index {
            0 => &mut self.platform,
            1 => &mut self.arch,
            2 => &mut self.render_api_group,
            3 => &mut self.render_api,
            4 => &mut self.quality_level,
            _ => &mut self.custom,
        }
    }
}

/// A compact platform identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Platform(u64);

impl Platform {
    /// The fully generic platform.
    pub const GENERIC: Platform = Platform(0);

    /// Wrap a raw identifier.
    pub const fn from_u64(value: u64) -> Self {
        Platform(value)
    }

    /// Get the raw identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Pack a declaration into an identifier.
    ///
    /// Fails if a field does not fit in its group.
    pub fn encode(declaration: &PlatformDeclaration) -> Result<Self> {
        let mut value = 0u64;
        for (index, field) in declaration.fields().into_iter().enumerate() {
            let (shift, width) = GROUPS[index];
            if u64::from(field) >> width != 0 {
                return Err(Error::invalid_argument(format!(
                    "Platform field {} value {} exceeds {} bits",
                    GROUP_NAMES[index], field, width
                )));
            }
            value |= u64::from(field) << shift;
        }
        Ok(Platform(value))
    }

    /// Unpack into a declaration.
    pub fn decode(&self) -> PlatformDeclaration {
        let mut declaration = PlatformDeclaration::default();
        for index in 0..GROUP_COUNT {
            *declaration.field_mut(index) = self.group(index);
        }
        declaration
    }

    /// Value of a single group.
    pub fn group(&self, index: usize) -> u32 {
        let (shift, _) = GROUPS[index];
        ((self.0 & group_mask(index)) >> shift) as u32
    }

    /// True for the fully generic platform.
    pub fn is_generic(&self) -> bool {
        self.0 == 0
    }

    /// Number of groups with a nonzero value.
    pub fn specified_groups(&self) -> usize {
        (0..GROUP_COUNT).filter(|&i| self.group(i) != 0).count()
    }

    /// True if every group set in `reference` holds the same value in `self`.
    ///
    /// `self` may additionally set groups that `reference` leaves at 0.
    pub fn is_equal_or_more_specific(&self, reference: Platform) -> bool {
        (0..GROUP_COUNT).all(|i| {
            let mask = group_mask(i);
            reference.0 & mask == 0 || self.0 & mask == reference.0 & mask
        })
    }

    /// Clear the most specific nonzero group.
    ///
    /// The generic platform reduces to itself.
    pub fn reduce(&self) -> Platform {
        match (0..GROUP_COUNT).rev().find(|&i| self.group(i) != 0) {
            Some(index) => Platform(self.0 & !group_mask(index)),
            None => *self,
        }
    }

    /// Tiers tried during resolution: `self`, then each reduction, ending at 0.
    pub fn fallback_chain(&self) -> FallbackChain {
        FallbackChain { next: Some(*self) }
    }

    /// Render as 16 hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse hex digits; text logs always carry 16.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.is_empty() || !hex_str.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_argument(format!(
                "Invalid platform {}: expected hex digits",
                hex_str
            )));
        }
        u64::from_str_radix(hex_str, 16)
            .map(Platform)
            .map_err(|e| Error::invalid_argument(format!("Invalid platform {}: {}", hex_str, e)))
    }
}

/// Iterator over the fallback tiers of a platform.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    next: Option<Platform>,
}

impl Iterator for FallbackChain {
    type Item = Platform;

    fn next(&mut self) -> Option<Platform> {
        let current = self.next?;
        self.next = if current.is_generic() {
            None
        } else {
            Some(current.reduce())
        };
        Some(current)
    }
}

/// Accepts `0x`-prefixed hex, a plain decimal value, or a comma separated
/// `field=value` list such as `platform=1,arch=2`.
impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return Platform::from_hex(hex_str);
        }
        if !s.contains('=') {
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::invalid_argument(format!(
                    "Invalid platform {}: expected hex, decimal or field=value",
                    s
                )));
            }
            return s
                .parse::<u64>()
                .map(Platform)
                .map_err(|e| Error::invalid_argument(format!("Invalid platform {}: {}", s, e)));
        }

        let mut declaration = PlatformDeclaration::default();
        for part in s.split(',') {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| Error::invalid_argument(format!("Expected field=value, got {}", part)))?;
            let index = GROUP_NAMES
                .iter()
                .position(|n| *n == name.trim())
                .ok_or_else(|| Error::invalid_argument(format!("Unknown platform field {}", name)))?;
            *declaration.field_mut(index) = value.trim().parse::<u32>().map_err(|e| {
                Error::invalid_argument(format!("Invalid value for {}: {}", name, e))
            })?;
        }
        Platform::encode(&declaration)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Platform({})", self.to_hex())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
