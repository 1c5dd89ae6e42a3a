use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Append items with embeddings from a csv file.
    ///
    /// Columns: id,title,category,owned,engagement,embedding
    /// (embedding is a space separated list of floats)
    Import {
        /// Path to the csv file
        file: PathBuf,
    },

    /// Build the galaxy layout and index, and write the cache.
    Build {
        /// Rebuild even if the cache is fresh
        #[clap(short, long, default_value = "false")]
        force: bool,

        /// Print the built galaxy as json
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show store, index and cache state.
    Status {},

    /// Find the items most similar to an item.
    Neighbors {
        /// Item id
        item_id: String,

        /// Number of neighbors
        #[clap(short, default_value = "10")]
        k: usize,
    },

    /// Start galaxy as a service.
    Daemon {
        /// Address to listen on, overrides daemon.listen from config.yaml
        #[clap(short, long)]
        listen: Option<String>,
    },
}
