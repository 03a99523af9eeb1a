//! Memory formats understood by the registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data format of a buffer.
///
/// The plain formats (`Bfyx`, `Bfzyx`, `Byxf`, `Ybfx`, `Fbyx`,
/// `BFsYxFsv16`) describe how a backend would like to see a tensor; the
/// reference kernels keep such data in logical order. `Ldigo` is a real
/// physical layout for recurrent weights:
/// `[layers, directions, input, gates, output]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    Any,
    Bfyx,
    Bfzyx,
    Byxf,
    Ybfx,
    Fbyx,
    BFsYxFsv16,
    Ldigo,
}

impl Format {
    /// Plain format for a tensor of `rank` dimensions.
    pub fn default_for_rank(rank: usize) -> Self {
        if rank >= 5 {
            Format::Bfzyx
        } else {
            Format::Bfyx
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::Any => "any",
            Format::Bfyx => "bfyx",
            Format::Bfzyx => "bfzyx",
            Format::Byxf => "byxf",
            Format::Ybfx => "ybfx",
            Format::Fbyx => "fbyx",
            Format::BFsYxFsv16 => "b_fs_yx_fsv16",
            Format::Ldigo => "ldigo",
        }
    }

    /// True for formats that change the physical element order.
    pub fn is_physical(&self) -> bool {
        matches!(self, Format::Ldigo)
    }

    pub fn to_tag(&self) -> u8 {
        match self {
            Format::Any => 0,
            Format::Bfyx => 1,
            Format::Bfzyx => 2,
            Format::Byxf => 3,
            Format::Ybfx => 4,
            Format::Fbyx => 5,
            Format::BFsYxFsv16 => 6,
            Format::Ldigo => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Format::Any,
            1 => Format::Bfyx,
            2 => Format::Bfzyx,
            3 => Format::Byxf,
            4 => Format::Ybfx,
            5 => Format::Fbyx,
            6 => Format::BFsYxFsv16,
            7 => Format::Ldigo,
            _ => return None,
        })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
