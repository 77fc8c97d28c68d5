//! Check command - validates a configuration file without starting anything.

use crate::cli::args::CheckArgs;
use crate::core::config::Config;
use anyhow::Result;

pub fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    println!(
        "{} ok (max_inflight_messages={})",
        args.config.display(),
        config.broker.max_inflight_messages
    );
    Ok(())
}
