//! Translator configuration.

use ember_x86::DecodeOptions;

/// Core configuration knobs.
///
/// The decoder-facing subset is exported through
/// [`Config::decode_options`]; the rest is consumed by the pass pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Allow the decoder to run past block enders covered by conditional
    /// forward branches.
    pub multiblock: bool,
    /// Cap on instructions per decoded block; `-1` means unlimited.
    pub max_inst_per_block: i64,
    /// Enable the unsafe x87 stack peephole.
    pub unsafe_replace_x87: bool,
    /// Skip the optional optimization passes.
    pub disable_passes: bool,
    /// Comma-separated phase names at which to dump the IR
    /// (`replace-x87`, `before-ra`, `after-ra`).
    pub dump_ir: String,
    /// Propagate a mid-block decode failure instead of translating the
    /// partial block.
    pub break_on_frontend_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multiblock: false,
            max_inst_per_block: -1,
            unsafe_replace_x87: false,
            disable_passes: false,
            dump_ir: String::new(),
            break_on_frontend_failure: false,
        }
    }
}

impl Config {
    /// Decoder options derived from this configuration.
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            multiblock: self.multiblock,
            max_inst_per_block: self.max_inst_per_block,
            break_on_frontend_failure: self.break_on_frontend_failure,
        }
    }

    /// `true` when `phase` is named in [`Config::dump_ir`].
    pub fn dumps_phase(&self, phase: &str) -> bool {
        self.dump_ir
            .split(',')
            .map(str::trim)
            .any(|p| !p.is_empty() && p.eq_ignore_ascii_case(phase))
    }
}
