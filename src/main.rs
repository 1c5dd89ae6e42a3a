use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod galaxy;
mod lock;
#[cfg(test)]
mod tests;
mod web;

use galaxy::progress::{BuildReporter, BuildStage, StepStatus};
use lock::DirLock;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One spinner per build stage.
fn progress_reporter() -> anyhow::Result<Arc<dyn BuildReporter>> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{spinner} {prefix:<16} {msg}")?;

    let bars: Vec<ProgressBar> = BuildStage::ALL
        .iter()
        .map(|stage| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(style.clone());
            bar.set_prefix(stage.label());
            bar
        })
        .collect();

    Ok(Arc::new(
        move |step: usize, status: StepStatus, detail: Option<&str>| {
            let Some(bar) = bars.get(step) else {
                return;
            };
            let message = match detail {
                Some(detail) => format!("{status:?}: {detail}").to_lowercase(),
                None => format!("{status:?}").to_lowercase(),
            };
            if status.is_terminal() {
                bar.finish_with_message(message);
                return;
            }
            if status != StepStatus::Pending {
                bar.enable_steady_tick(Duration::from_millis(100));
            }
            bar.set_message(message);
        },
    ))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let base_path = app::base_path()?;

    match args.command {
        cli::Command::Import { file } => {
            let items = app::read_import_csv(&file)?;
            if items.is_empty() {
                println!("nothing to import");
                return Ok(());
            }

            std::fs::create_dir_all(&base_path)?;
            let _lock = DirLock::try_acquire(&base_path)?;
            let dimensions = items.first().map(|item| item.embedding.len());
            let app = app::App::open(&base_path, dimensions)?;

            let count = app.append(items)?;
            println!("{} items imported, store has {}", count, app.store().len());
            Ok(())
        }

        cli::Command::Build { force, json } => {
            std::fs::create_dir_all(&base_path)?;
            let _lock = DirLock::try_acquire(&base_path)?;
            let app = app::App::open(&base_path, None)?;
            let service = app.service();

            if !force {
                if let Some(entry) = service.load_cached_galaxy_if_fresh() {
                    println!("galaxy cache is fresh ({} nodes)", entry.nodes.len());
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entry)?);
                    }
                    return Ok(());
                }
            }

            let reporter = if json { None } else { Some(progress_reporter()?) };
            let entry = service
                .build_and_cache_galaxy(reporter)
                .map_err(|err| anyhow::anyhow!("{err}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(entry.as_ref())?);
            } else {
                println!(
                    "built galaxy of {} nodes at {}",
                    entry.nodes.len(),
                    entry.built_at
                );
            }
            Ok(())
        }

        cli::Command::Status {} => {
            let app = app::App::open(&base_path, None)?;
            println!("{}", serde_json::to_string_pretty(&app.status())?);
            Ok(())
        }

        cli::Command::Neighbors { item_id, k } => {
            let app = app::App::open(&base_path, None)?;
            let service = app.service();
            if !service.store().contains(&item_id) {
                bail!("item {item_id:?} is not in the store");
            }

            service.refresh_index()?;
            let neighbors = service.neighbors_of(&item_id, k)?;
            println!("{}", serde_json::to_string_pretty(&neighbors)?);
            Ok(())
        }

        cli::Command::Daemon { listen } => {
            std::fs::create_dir_all(&base_path)?;
            let _lock = DirLock::try_acquire(&base_path)?;
            let app = app::App::open(&base_path, None)?;

            let addr = match listen {
                Some(listen) => listen
                    .parse()
                    .with_context(|| format!("invalid listen address {listen:?}"))?,
                None => app.config().listen_addr()?,
            };

            web::start_daemon(Arc::new(app), addr)
        }
    }
}
