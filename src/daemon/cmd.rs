use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "kilnd")]
#[command(about = "kiln compute node daemon", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon will look for a config file in the
    /// current working directory (kiln.toml), in the home config dir
    /// ($HOME/.config/kiln/config.toml) or in the system config dir (/etc/kiln/config.toml)
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,
}
