//! Sample layout descriptions and their hardware format mapping.

use crate::audio::extensions::{Extension, ExtensionTable};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelConfig {
    Mono,
    Stereo,
    Rear,
    Quad,
    X51,
    X61,
    X71,
    BFormat2D,
    BFormat3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    UInt8,
    Int16,
    Float32,
    Mulaw,
}

impl ChannelConfig {
    pub fn channel_count(self) -> u32 {
        match self {
            ChannelConfig::Mono => 1,
            ChannelConfig::Stereo | ChannelConfig::Rear => 2,
            ChannelConfig::BFormat2D => 3,
            ChannelConfig::Quad | ChannelConfig::BFormat3D => 4,
            ChannelConfig::X51 => 6,
            ChannelConfig::X61 => 7,
            ChannelConfig::X71 => 8,
        }
    }

    /// Picks the speaker layout for an interleaved channel count.
    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(ChannelConfig::Mono),
            2 => Some(ChannelConfig::Stereo),
            4 => Some(ChannelConfig::Quad),
            6 => Some(ChannelConfig::X51),
            7 => Some(ChannelConfig::X61),
            8 => Some(ChannelConfig::X71),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelConfig::Mono => "Mono",
            ChannelConfig::Stereo => "Stereo",
            ChannelConfig::Rear => "Rear",
            ChannelConfig::Quad => "Quadraphonic",
            ChannelConfig::X51 => "5.1 Surround",
            ChannelConfig::X61 => "6.1 Surround",
            ChannelConfig::X71 => "7.1 Surround",
            ChannelConfig::BFormat2D => "B-Format 2D",
            ChannelConfig::BFormat3D => "B-Format 3D",
        }
    }

    fn is_bformat(self) -> bool {
        matches!(self, ChannelConfig::BFormat2D | ChannelConfig::BFormat3D)
    }

    fn is_multichannel(self) -> bool {
        !matches!(self, ChannelConfig::Mono | ChannelConfig::Stereo) && !self.is_bformat()
    }
}

impl SampleType {
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            SampleType::UInt8 | SampleType::Mulaw => 1,
            SampleType::Int16 => 2,
            SampleType::Float32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleType::UInt8 => "Unsigned 8-bit",
            SampleType::Int16 => "Signed 16-bit",
            SampleType::Float32 => "32-bit float",
            SampleType::Mulaw => "Mulaw",
        }
    }
}

impl fmt::Display for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size in bytes of `frames` interleaved frames.
pub fn frames_to_bytes(frames: u64, channels: ChannelConfig, sample_type: SampleType) -> u64 {
    frames * u64::from(channels.channel_count()) * u64::from(sample_type.bytes_per_sample())
}

/// Inverse of [`frames_to_bytes`], rounding down to whole frames.
pub fn bytes_to_frames(bytes: u64, channels: ChannelConfig, sample_type: SampleType) -> u64 {
    bytes / (u64::from(channels.channel_count()) * u64::from(sample_type.bytes_per_sample()))
}

/// A sample layout the hardware accepts for buffer uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwFormat {
    pub channels: ChannelConfig,
    pub sample_type: SampleType,
}

impl HwFormat {
    /// Maps a decoded layout onto a hardware format, or `None` when the
    /// current extension set has no matching format.
    pub fn resolve(
        channels: ChannelConfig,
        sample_type: SampleType,
        exts: &ExtensionTable,
    ) -> Option<HwFormat> {
        let supported = match sample_type {
            SampleType::UInt8 | SampleType::Int16 => {
                if channels.is_bformat() {
                    exts.has(Extension::EXT_BFORMAT)
                } else if channels.is_multichannel() {
                    exts.has(Extension::EXT_MCFORMATS)
                } else {
                    true
                }
            }
            SampleType::Float32 => {
                exts.has(Extension::EXT_FLOAT32)
                    && if channels.is_bformat() {
                        exts.has(Extension::EXT_BFORMAT)
                    } else if channels.is_multichannel() {
                        exts.has(Extension::EXT_MCFORMATS)
                    } else {
                        true
                    }
            }
            SampleType::Mulaw => {
                if channels.is_bformat() {
                    exts.has(Extension::EXT_MULAW_BFORMAT)
                } else if channels.is_multichannel() {
                    exts.has(Extension::EXT_MULAW_MCFORMATS)
                } else {
                    exts.has(Extension::EXT_MULAW)
                }
            }
        };
        supported.then_some(HwFormat { channels, sample_type })
    }

    pub fn frame_size(&self) -> u32 {
        self.channels.channel_count() * self.sample_type.bytes_per_sample()
    }
}
