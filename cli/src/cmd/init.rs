use anyhow::{bail, Context as _};

use crate::config::Config;
use crate::util;

use super::{GlobalArgs, SubcmdResult};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Overwrite an existing config file
    #[arg(short, long)]
    pub force: bool,
}

pub fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let path = util::current_dir().join(Config::FILENAME);
    if path.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(&path, Config::example_toml())
        .with_context(|| format!("Cannot write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}
