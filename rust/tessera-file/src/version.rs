// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::str::FromStr;

use snafu::location;
use tessera_core::{Error, Result};

pub const LEGACY_FORMAT_VERSION: &str = "0.1";
pub const V1_FORMAT_1_0: &str = "1.0";

/// Tessera data file version
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Ord, PartialOrd)]
pub enum FileVersion {
    // Stable must come AFTER the version it resolves to so that
    // comparisons like x >= V1_0 hold for Stable too.
    /// Files written before the version was recorded (0.x).
    Legacy,
    #[default]
    V1_0,
    /// The latest stable release
    Stable,
}

impl FileVersion {
    /// Convert Stable to the actual version
    pub fn resolve(&self) -> Self {
        match self {
            Self::Stable => Self::V1_0,
            _ => *self,
        }
    }

    /// Interpret the version recorded in a data file's metadata.
    ///
    /// Any 0.x version reads as [`Self::Legacy`]. A major version newer than
    /// this library understands is not supported.
    pub fn try_from_major_minor(major: u32, minor: u32) -> Result<Self> {
        match (major, minor) {
            (0, _) => Ok(Self::Legacy),
            (1, 0) => Ok(Self::V1_0),
            _ => Err(Error::NotSupported {
                source: format!("Unknown Tessera file version: {}.{}", major, minor).into(),
                location: location!(),
            }),
        }
    }

    pub fn to_numbers(&self) -> (u32, u32) {
        match self {
            Self::Legacy => (0, 1),
            Self::V1_0 => (1, 0),
            Self::Stable => self.resolve().to_numbers(),
        }
    }
}

impl std::fmt::Display for FileVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Legacy => LEGACY_FORMAT_VERSION,
                Self::V1_0 => V1_FORMAT_1_0,
                Self::Stable => "stable",
            }
        )
    }
}

impl FromStr for FileVersion {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            LEGACY_FORMAT_VERSION | "legacy" => Ok(Self::Legacy),
            V1_FORMAT_1_0 => Ok(Self::V1_0),
            "stable" => Ok(Self::Stable),
            _ => Err(Error::InvalidInput {
                source: format!("Unknown Tessera file version: {}", value).into(),
                location: location!(),
            }),
        }
    }
}
