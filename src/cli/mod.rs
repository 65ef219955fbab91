pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Options;

#[derive(Parser)]
#[command(name = "flowmirror")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "NetFlow v9 / IPFIX collector with policy-driven mirroring and queue forwarding",
    long_about = None
)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "YAML options file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the collectors (the default)")]
    Run(RunArgs),
    #[command(about = "Validate a policy file")]
    CheckPolicy {
        #[arg(help = "Policy file to check")]
        file: PathBuf,

        #[arg(short, long, help = "Check as queue policies instead of mirror policies")]
        queue: bool,
    },
    #[command(about = "List the templates in a template cache file")]
    Templates {
        #[arg(help = "Template cache file")]
        file: PathBuf,
    },
}

/// Options overridable from the command line
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    #[arg(long, help = "NetFlow v9 listening port")]
    pub netflow9_port: Option<u16>,

    #[arg(long, help = "IPFIX listening port")]
    pub ipfix_port: Option<u16>,

    #[arg(long, help = "Queue backend (none, log)")]
    pub mq_name: Option<String>,

    #[arg(long, help = "Mirror policy file")]
    pub flow_forward_cfg: Option<PathBuf>,

    #[arg(long, help = "Queue policy file")]
    pub queue_forward_cfg: Option<PathBuf>,

    #[arg(long, help = "Keep the worker count fixed")]
    pub no_dynamic_workers: bool,
}

impl RunArgs {
    pub fn apply(&self, options: &mut Options) {
        if let Some(port) = self.netflow9_port {
            options.netflow9_port = port;
        }
        if let Some(port) = self.ipfix_port {
            options.ipfix_port = port;
        }
        if let Some(mq_name) = &self.mq_name {
            options.mq_name = mq_name.clone();
        }
        if let Some(path) = &self.flow_forward_cfg {
            options.flow_forward_cfg = path.clone();
        }
        if let Some(path) = &self.queue_forward_cfg {
            options.queue_forward_cfg = path.clone();
        }
        if self.no_dynamic_workers {
            options.dynamic_workers = false;
        }
    }
}
