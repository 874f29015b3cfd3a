use crate::client::{ClientConfig, TorrentClient};
use crate::error::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pp-torrent")]
#[command(about = "A BitTorrent client that downloads and seeds", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Maximum number of peers to connect to
        #[arg(short, long, default_value = "50")]
        max_peers: usize,

        /// Seconds to wait for a peer connection
        #[arg(long, default_value = "50")]
        connect_timeout: u64,
    },

    /// Seed torrents whose data is already on disk
    Seed {
        /// Paths to the .torrent files
        #[arg(required = true)]
        torrents: Vec<PathBuf>,

        /// Directory holding the torrents' data
        #[arg(short, long, default_value = "./downloads")]
        dir: PathBuf,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                max_peers,
                connect_timeout,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    max_peers: *max_peers,
                    connect_timeout: Duration::from_secs(*connect_timeout),
                    ..ClientConfig::default()
                };

                let client = TorrentClient::new(config)?;
                client.download(torrent).await?;
            }

            Commands::Seed { torrents, dir } => {
                let config = ClientConfig {
                    download_dir: dir.clone(),
                    ..ClientConfig::default()
                };

                let client = TorrentClient::new(config)?;
                client.seed(torrents).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let torrent = crate::torrent::load_torrent_file(torrent_path).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", torrent.name);
        println!("Tracker: {}", torrent.announce);
        println!("Total Size: {} bytes", torrent.total_length);
        println!("Piece Length: {} bytes", torrent.piece_length);
        println!("Number of Pieces: {}", torrent.piece_count());
        println!("Info Hash: {}", torrent.info_hash_hex());
        println!("\nFiles:");

        for (i, file) in torrent.files.iter().enumerate() {
            println!(
                "  {}: {} ({} bytes)",
                i + 1,
                file.path.join("/"),
                file.length
            );
        }

        if !torrent.announce_list.is_empty() {
            println!("\nAdditional Trackers:");
            for tracker in &torrent.announce_list {
                println!("  - {}", tracker);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_flags() {
        let cli = Cli::try_parse_from([
            "pp-torrent",
            "download",
            "-t",
            "a.torrent",
            "-m",
            "8",
            "--connect-timeout",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Download {
                torrent,
                output,
                max_peers,
                connect_timeout,
            } => {
                assert_eq!(torrent, PathBuf::from("a.torrent"));
                assert_eq!(output, PathBuf::from("./downloads"));
                assert_eq!((max_peers, connect_timeout), (8, 5));
            }
            _ => panic!("expected download"),
        }
    }

    #[test]
    fn test_seed_requires_a_torrent() {
        assert!(Cli::try_parse_from(["pp-torrent", "seed"]).is_err());
        let cli = Cli::try_parse_from(["pp-torrent", "seed", "a.torrent", "b.torrent", "-d", "data"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Seed { ref torrents, .. } if torrents.len() == 2));
    }
}
