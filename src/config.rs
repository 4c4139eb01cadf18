//! Configuration and command-line parsing

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::task::CopyTask;

pub const DEFAULT_SOURCE: &str = "/data/config";
pub const DEFAULT_DESTINATION: &str = "/usr/local/apisix/config";

#[derive(Debug, Parser)]
#[command(
    name = "config-watcher",
    version,
    about = "Watch a config directory and mirror it into another directory"
)]
pub struct Cli {
    /// Directory to watch and copy from
    #[arg(long, alias = "sourcePath", value_name = "DIR", default_value = DEFAULT_SOURCE)]
    pub source_path: PathBuf,

    /// Directory to copy into
    #[arg(long, alias = "destPath", value_name = "DIR", default_value = DEFAULT_DESTINATION)]
    pub dest_path: PathBuf,

    /// Filenames to watch and copy, separated with commas. Empty means every file
    #[arg(long, value_name = "LIST", default_value = "")]
    pub files: String,

    /// Source is mounted from a configmap and updated through `..data`
    #[arg(long, alias = "isConfigMap")]
    pub is_config_map: bool,

    /// Copy entries whose name starts with a dot
    #[arg(long, alias = "copyHidden")]
    pub copy_hidden: bool,

    /// Also write logs to config-watcher.log in this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub files: Vec<String>,
    pub is_configmap: bool,
    pub copy_hidden: bool,
    pub log_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        Self {
            source: cli.source_path,
            destination: cli.dest_path,
            files: parse_file_list(&cli.files),
            is_configmap: cli.is_config_map,
            copy_hidden: cli.copy_hidden,
            log_dir: cli.log_dir,
            verbose: cli.verbose,
        }
    }

    /// Parse the process arguments
    pub fn from_args() -> Self {
        Self::from_cli(Cli::parse())
    }

    pub fn watch_filter(&self) -> WatchFilter {
        WatchFilter::new(&self.files)
    }

    /// Tasks queued before the watch starts so the destination is correct
    /// even if no event ever fires.
    pub fn seed_tasks(&self) -> Vec<CopyTask> {
        if self.files.is_empty() {
            return vec![CopyTask::everything(
                self.source.clone(),
                self.destination.clone(),
            )];
        }

        self.files
            .iter()
            .map(|file| CopyTask::new(self.source.clone(), self.destination.clone(), file.as_str()))
            .collect()
    }
}

/// Split a comma separated list, dropping blanks.
pub fn parse_file_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Filenames the daemon reacts to. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    names: HashSet<String>,
}

impl WatchFilter {
    pub fn new(files: &[String]) -> Self {
        Self {
            names: files.iter().cloned().collect(),
        }
    }

    pub fn all_files(&self) -> bool {
        self.names.is_empty()
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.all_files() || self.names.contains(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_list_trims_and_drops_blanks() {
        assert_eq!(parse_file_list(""), Vec::<String>::new());
        assert_eq!(parse_file_list("  "), Vec::<String>::new());
        assert_eq!(
            parse_file_list("a.yaml, b.yaml,,"),
            vec!["a.yaml".to_string(), "b.yaml".to_string()]
        );
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = WatchFilter::new(&[]);
        assert!(filter.all_files());
        assert!(filter.matches("anything.yaml"));
    }

    #[test]
    fn test_filter_is_exact() {
        let filter = WatchFilter::new(&["a.yaml".to_string(), "b.yaml".to_string()]);
        assert!(!filter.all_files());
        assert!(filter.matches("a.yaml"));
        assert!(!filter.matches("c.yaml"));
        assert!(!filter.matches("a.yaml.swp"));
    }

    #[test]
    fn test_seed_tasks_without_files_copies_everything() {
        let config = Config::from_cli(Cli::parse_from(["config-watcher"]));
        let tasks = config.seed_tasks();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_everything());
        assert_eq!(tasks[0].source, PathBuf::from(DEFAULT_SOURCE));
        assert_eq!(tasks[0].destination, PathBuf::from(DEFAULT_DESTINATION));
    }

    #[test]
    fn test_seed_tasks_one_per_file() {
        let config = Config::from_cli(Cli::parse_from([
            "config-watcher",
            "--files",
            "config.yaml,apisix.yaml",
        ]));
        let names: Vec<_> = config
            .seed_tasks()
            .into_iter()
            .map(|t| t.filename)
            .collect();
        assert_eq!(names, vec!["config.yaml", "apisix.yaml"]);
    }
}
