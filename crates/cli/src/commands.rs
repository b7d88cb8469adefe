use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a configuration file, printing the effective
    /// settings.
    Validate {
        /// Path to the JSON configuration file
        #[arg(long)]
        config: String,
    },

    /// Drive the full pipeline from a serialized binlog event trace into an
    /// in-memory sink and print the resulting counters. The binlog client
    /// itself is an external collaborator; this is the in-repo way to
    /// exercise a capture end to end.
    Replay {
        /// Path to the JSON configuration file
        #[arg(long)]
        config: String,

        /// Path to the JSON event trace (an array of binlog events)
        #[arg(long)]
        trace: String,

        /// Table schemas for the trace (JSON array); when omitted the
        /// active-schema database from the configuration is queried instead
        #[arg(long)]
        schema: Option<String>,

        /// Report task success without writing to the sink
        #[arg(long)]
        dry_run: bool,
    },
}
