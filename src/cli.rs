use clap::{Args, Parser, Subcommand};

/// Command line surface for the monitor.
/// Exit codes: 0=success, 2=invalid arguments, 1=any runtime failure
#[derive(Parser, Debug)]
#[command(name = "site_sentinel")]
#[command(about = "Crawl websites, keep trusted baselines and flag defaced pages")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the crawling commands.
#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    #[arg(short, long, help = "Root URL of the monitored site")]
    pub url: String,

    #[arg(short, long, help = "Numeric id of the monitored site")]
    pub site_id: u64,

    #[arg(
        short,
        long,
        default_value = "./data",
        help = "Directory holding the state database and logs"
    )]
    pub data_dir: String,

    #[arg(short, long, help = "TOML config file (defaults apply when absent)")]
    pub config: Option<String>,

    #[arg(short, long, help = "Upper bound on concurrent workers (overrides config)")]
    pub workers: Option<usize>,

    #[arg(long, help = "User agent string for requests (overrides config)")]
    pub user_agent: Option<String>,

    #[arg(long, help = "Maximum link depth from the root URL (overrides config)")]
    pub max_depth: Option<u32>,

    #[arg(long, help = "Session name; reuse one to resume an interrupted crawl")]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl a site and store its pages as a new baseline profile.
    Baseline {
        #[command(flatten)]
        crawl: CrawlArgs,

        #[arg(long, help = "Make the new profile the active baseline")]
        promote: bool,
    },

    /// Crawl a site and compare every page with the active baseline.
    Monitor {
        #[command(flatten)]
        crawl: CrawlArgs,
    },

    /// Make a stored baseline profile the active one for its site.
    Promote {
        #[arg(short, long)]
        site_id: u64,

        #[arg(short, long, help = "Id of the stored baseline profile")]
        baseline_id: String,

        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },

    /// Print the verdict log for a site as JSON lines.
    Verdicts {
        #[arg(short, long)]
        site_id: u64,

        #[arg(short, long, help = "Only the latest verdict for this URL")]
        url: Option<String>,

        #[arg(short, long, default_value = "./data")]
        data_dir: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
