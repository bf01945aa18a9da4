use crate::audio::hardware::HardwareApi;
use tracing::debug;

const LOG_TARGET: &str = "voicepool::audio::extensions";

/// Optional hardware capabilities probed once per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Extension {
    EXT_EFX,
    EXT_FLOAT32,
    EXT_MCFORMATS,
    EXT_BFORMAT,
    EXT_MULAW,
    EXT_MULAW_MCFORMATS,
    EXT_MULAW_BFORMAT,
    SOFT_loop_points,
    SOFT_source_latency,
    EXT_disconnect,
    EXT_SOURCE_RADIUS,
    EXT_STEREO_ANGLES,
}

const EXTENSION_COUNT: usize = 12;

const EXTENSION_LIST: [(Extension, &str); EXTENSION_COUNT] = [
    (Extension::EXT_EFX, "ALC_EXT_EFX"),
    (Extension::EXT_FLOAT32, "AL_EXT_FLOAT32"),
    (Extension::EXT_MCFORMATS, "AL_EXT_MCFORMATS"),
    (Extension::EXT_BFORMAT, "AL_EXT_BFORMAT"),
    (Extension::EXT_MULAW, "AL_EXT_MULAW"),
    (Extension::EXT_MULAW_MCFORMATS, "AL_EXT_MULAW_MCFORMATS"),
    (Extension::EXT_MULAW_BFORMAT, "AL_EXT_MULAW_BFORMAT"),
    (Extension::SOFT_loop_points, "AL_SOFT_loop_points"),
    (Extension::SOFT_source_latency, "AL_SOFT_source_latency"),
    (Extension::EXT_disconnect, "ALC_EXT_disconnect"),
    (Extension::EXT_SOURCE_RADIUS, "AL_EXT_SOURCE_RADIUS"),
    (Extension::EXT_STEREO_ANGLES, "AL_EXT_STEREO_ANGLES"),
];

impl Extension {
    /// The capability string the hardware reports for this extension.
    pub fn name(self) -> &'static str {
        EXTENSION_LIST[self as usize].1
    }

    /// Every known extension, in probe order.
    pub fn all() -> impl Iterator<Item = Extension> {
        EXTENSION_LIST.iter().map(|(ext, _)| *ext)
    }
}

/// Per-context capability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionTable {
    present: [bool; EXTENSION_COUNT],
}

impl ExtensionTable {
    /// Queries every capability string once. Must run with the owning
    /// context current on the calling thread.
    pub fn probe(hardware: &dyn HardwareApi) -> Self {
        let mut table = ExtensionTable::default();
        for (ext, name) in EXTENSION_LIST.iter() {
            let present = hardware.is_extension_present(name);
            table.present[*ext as usize] = present;
            debug!(target: LOG_TARGET, "{}: {}", name, if present { "yes" } else { "no" });
        }
        table
    }

    pub fn has(&self, ext: Extension) -> bool {
        self.present[ext as usize]
    }

    /// Builds a table from an explicit list; used by format tests.
    pub fn with(exts: &[Extension]) -> Self {
        let mut table = ExtensionTable::default();
        for ext in exts {
            table.present[*ext as usize] = true;
        }
        table
    }
}
