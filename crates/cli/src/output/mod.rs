//! Output formatting
//!
//! Human-readable output uses `console` styles; `--json` switches every
//! command to strict JSON on stdout.

mod formatter;

pub use formatter::Formatter;

/// Global output settings taken from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Emit JSON instead of human-readable text
    pub json: bool,
    /// Disable colors
    pub no_color: bool,
    /// Suppress everything except errors
    pub quiet: bool,
}

impl OutputConfig {
    /// Whether progress bars and spinners may be drawn
    pub fn show_progress(&self) -> bool {
        !self.json && !self.quiet
    }
}
