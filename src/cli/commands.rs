use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::cli::{Commands, RunArgs};
use crate::config::Options;
use crate::policy::{PolicyKind, PolicyStore};
use crate::service::Service;
use crate::template_store::TemplateStore;
use crate::{FlowmirrorError, Result};

pub async fn handle_command(command: Option<Commands>, options: Options) -> Result<()> {
    match command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => handle_run(args, options).await,
        Commands::CheckPolicy { file, queue } => handle_check_policy(file, queue),
        Commands::Templates { file } => handle_templates(file),
    }
}

async fn handle_run(args: RunArgs, mut options: Options) -> Result<()> {
    args.apply(&mut options);
    let service = Service::new(options)?;
    info!("Press Ctrl+C to exit");
    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl+C: {}", e);
            }
        })
        .await
}

fn require_file(file: &Path) -> Result<()> {
    if file.is_file() {
        Ok(())
    } else {
        Err(FlowmirrorError::ConfigError(format!(
            "{} is not a file",
            file.display()
        )))
    }
}

fn handle_check_policy(file: PathBuf, queue: bool) -> Result<()> {
    require_file(&file)?;
    let kind = if queue {
        PolicyKind::Queue
    } else {
        PolicyKind::Mirror
    };
    let store = PolicyStore::open(kind, &file)?;

    println!("{}: {} {} policies", file.display(), store.len(), kind);
    for policy in store.policies() {
        let state = if policy.enable { "enabled" } else { "disabled" };
        println!(
            "  {} ({}) -> {}",
            policy.policy_id,
            state,
            policy.targets.join(", ")
        );
        for rule in &policy.rules {
            println!("    rule {}", rule.id());
        }
    }
    Ok(())
}

fn handle_templates(file: PathBuf) -> Result<()> {
    require_file(&file)?;
    let store = TemplateStore::new();
    store.load(&file)?;

    println!("{}: {} templates", file.display(), store.len());
    for (key, template) in store.entries() {
        let kind = if template.is_options() { "options" } else { "data" };
        println!(
            "  {} domain {} template {} ({}, {} fields)",
            key.agent,
            key.domain,
            key.template_id,
            kind,
            template.field_count()
        );
    }
    Ok(())
}
