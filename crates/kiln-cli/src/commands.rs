//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// List configured builders
    Builders,

    /// List recent builds for a builder
    Builds {
        /// Builder name
        builder: String,

        /// How many builds to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Show one build in detail
    Show {
        /// Builder name
        builder: String,

        /// Build number
        number: u32,
    },

    /// Force a build of a builder
    Force {
        /// Builder name
        builder: String,
    },

    /// Cancel a queued or running request
    Cancel {
        /// Request ID
        request_id: String,
    },

    /// List live build requests
    Requests,

    /// List connected workers
    Workers,

    /// Stream master events
    Watch {
        /// Subject pattern to stream
        #[arg(default_value = ">")]
        pattern: String,
    },

    /// Store operator credentials
    Login,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
