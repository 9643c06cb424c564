mod headless;

use anyhow::Result;

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

/// Install the global `tracing` subscriber for this process.
pub(crate) fn set_up(options: Options) -> Result<()> {
    headless::set_up(&options)
}
