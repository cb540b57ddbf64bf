//! `casekeep watch`: autosave an input document as it changes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use casekeep_autosave::{AutosaveEngine, AutosaveError};
use clap::Args;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::load_input;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// JSON document to keep saved.
    #[arg(long, short = 'i')]
    pub input: PathBuf,
}

pub(crate) async fn run(engine: AutosaveEngine, args: &WatchArgs) -> Result<()> {
    let input = args
        .input
        .canonicalize()
        .with_context(|| format!("Input not found: {}", args.input.display()))?;
    let parent = input
        .parent()
        .map(PathBuf::from)
        .context("Input has no parent directory")?;

    match engine.connect_to_existing().await {
        Ok(true) => {}
        Ok(false) | Err(AutosaveError::MissingHandle) => {
            anyhow::bail!("No folder connected. Run `casekeep connect --dir <DIR>` first.")
        }
        Err(err) => return Err(err.into()),
    }

    let provider_input = input.clone();
    engine.set_data_provider(move || match load_input(&provider_input) {
        Ok(data) => Some(data),
        Err(err) => {
            tracing::warn!(error = %err, "Skipping save of unreadable input");
            None
        }
    });
    let _status = engine.subscribe_status(|snapshot| {
        tracing::info!(status = %snapshot.status, pending = snapshot.pending_writes, "{}", snapshot.message);
    });

    // Editors often replace the file, so watch the directory and filter.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;
    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", parent.display()))?;
    tracing::info!(input = %input.display(), "Watching for changes; Ctrl+C to stop");

    engine.notify_change();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) if touches(&event, &input) => engine.notify_change(),
                Some(Ok(_)) => {}
                Some(Err(err)) => tracing::warn!(error = %err, "File watcher error"),
                None => break,
            },
        }
    }

    tracing::info!("Flushing before exit");
    let flushed = engine.save_now().await;
    engine.disconnect();
    if !flushed {
        anyhow::bail!("Final save failed");
    }
    Ok(())
}

fn touches(event: &Event, input: &std::path::Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|path| path == input)
}
