use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Track watched movies and series", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Merge a CSV backup into the tracking records
    ImportCsv {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Merge a Trakt export archive into the tracking records
    ImportZip {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Write watched movies and series progress as CSV
    ExportCsv {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show the next unwatched episode of a series
    Next {
        #[arg(value_name = "SERIES_ID")]
        series_id: u64,
    },

    /// Print counts of tracked titles
    Summary,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = CliArgs::try_parse_from(["tvcine", "import-zip", "export.zip"]).unwrap();
        assert!(matches!(
            args.command,
            Command::ImportZip { file } if file == PathBuf::from("export.zip")
        ));

        let args = CliArgs::try_parse_from(["tvcine", "-c", "alt.toml", "next", "1399"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(args.command, Command::Next { series_id: 1399 }));

        assert!(CliArgs::try_parse_from(["tvcine", "next", "abc"]).is_err());
    }
}
