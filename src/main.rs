use anyhow::Result;
use config_watcher::Config;

fn main() -> Result<()> {
    config_watcher::run(Config::from_args())
}
