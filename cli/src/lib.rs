//! `casekeep` command line.
//!
//! Drives the autosave engine against a local folder:
//!
//! - `casekeep connect --dir <DIR>`
//! - `casekeep status [--json]`
//! - `casekeep list`
//! - `casekeep read [--name <FILE>]`
//! - `casekeep save --input <FILE>`
//! - `casekeep watch --input <FILE>`
//! - `casekeep forget`
//!
//! The connected folder is remembered in `$CASEKEEP_HOME/handle.json`.
//! Encrypted data files need a password from `CASEKEEP_PASSWORD` or
//! `--password-stdin`.

mod watch_cmd;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use casekeep_autosave::{
    AutosaveConfig, AutosaveEngine, AutosaveError, AutosaveState, ConfigLoader, FileDocument,
    HandleStore, NormalizedFileData, PasswordEncryption, StaticFolderPicker, StatusSnapshot,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;

pub use watch_cmd::WatchArgs;

#[derive(Debug, Parser)]
#[command(name = "casekeep", version, about = "Local-first autosave for case data")]
pub struct Cli {
    /// Configuration file (defaults to ./casekeep.toml, then the user config dir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Read the encryption password from the first line of stdin.
    #[arg(long, global = true)]
    pub password_stdin: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a folder and remember it.
    Connect(ConnectArgs),
    /// Show the connection and save status.
    Status(StatusArgs),
    /// List the JSON documents in the connected folder.
    List,
    /// Print the data file, or a named sibling document.
    Read(ReadArgs),
    /// Write a JSON document to the data file.
    Save(SaveArgs),
    /// Autosave a JSON document whenever it changes.
    Watch(WatchArgs),
    /// Forget the remembered folder.
    Forget,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Folder that holds the data file.
    #[arg(long, short = 'd')]
    pub dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Emit JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Sibling document to read instead of the data file.
    #[arg(long, short = 'n')]
    pub name: Option<String>,
}

#[derive(Debug, Args)]
pub struct SaveArgs {
    /// JSON document to save: a data object or a bare array of cases.
    #[arg(long, short = 'i')]
    pub input: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    connected: bool,
    directory: Option<PathBuf>,
    file_name: Option<String>,
    #[serde(flatten)]
    status: StatusSnapshot,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let password = read_password(cli.password_stdin).await?;

    match cli.command {
        Command::Connect(args) => connect(config, password, &args).await,
        Command::Status(args) => status(config, password, &args).await,
        Command::List => list(config, password).await,
        Command::Read(args) => read(config, password, &args).await,
        Command::Save(args) => save(config, password, &args).await,
        Command::Watch(args) => watch_cmd::run(build_engine(config, None, password)?, &args).await,
        Command::Forget => forget(config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AutosaveConfig> {
    let config = match path {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    };
    config.context("Failed to load configuration")
}

async fn read_password(from_stdin: bool) -> Result<Option<String>> {
    if from_stdin {
        let mut line = String::new();
        tokio::io::BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("Failed to read password from stdin")?;
        let password = line.trim_end_matches(['\r', '\n']).to_string();
        if password.is_empty() {
            bail!("Empty password on stdin");
        }
        return Ok(Some(password));
    }
    Ok(std::env::var("CASEKEEP_PASSWORD")
        .ok()
        .filter(|password| !password.is_empty()))
}

/// Engine with the persisted handle store. Without `dir` the picker always
/// cancels, so only the remembered folder can be used.
fn build_engine(
    config: AutosaveConfig,
    dir: Option<&Path>,
    password: Option<String>,
) -> Result<AutosaveEngine> {
    let picker = match dir {
        Some(dir) => StaticFolderPicker::new(dir),
        None => StaticFolderPicker::cancelled(),
    };
    let iterations = config.kdf_iterations;
    let mut builder = AutosaveEngine::builder()
        .config(config)
        .folder_picker(Arc::new(picker))
        .handle_store(HandleStore::new().context("Failed to locate casekeep home")?);
    if let Some(password) = password {
        let hooks = PasswordEncryption::with_iterations(iterations);
        hooks.set_password(password);
        builder = builder.encryption_hooks(Arc::new(hooks));
    }
    Ok(builder.build()?)
}

async fn reconnect(config: AutosaveConfig, password: Option<String>) -> Result<AutosaveEngine> {
    let engine = build_engine(config, None, password)?;
    match engine.connect_to_existing().await {
        Ok(true) => Ok(engine),
        Ok(false) | Err(AutosaveError::MissingHandle) => {
            bail!("No folder connected. Run `casekeep connect --dir <DIR>` first.")
        }
        Err(err) => Err(err.into()),
    }
}

async fn connect(config: AutosaveConfig, password: Option<String>, args: &ConnectArgs) -> Result<()> {
    let dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("Folder not found: {}", args.dir.display()))?;
    let engine = build_engine(config, Some(&dir), password)?;
    if !engine.connect().await? {
        bail!("Folder selection cancelled");
    }
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Connected to {}", dir.display())?;
    engine.disconnect();
    Ok(())
}

async fn status(config: AutosaveConfig, password: Option<String>, args: &StatusArgs) -> Result<()> {
    let engine = build_engine(config, None, password)?;
    let connected = match engine.connect_to_existing().await {
        Ok(connected) => connected,
        Err(AutosaveError::MissingHandle) => false,
        Err(err) => {
            tracing::warn!(error = %err, "Remembered folder is unavailable");
            false
        }
    };
    let handle = engine.handle();
    let report = StatusReport {
        connected,
        directory: handle.as_ref().map(|handle| handle.directory().to_path_buf()),
        file_name: handle.as_ref().map(|handle| handle.file_name().to_string()),
        status: engine.status(),
    };
    engine.disconnect();

    let mut stdout = std::io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
        return Ok(());
    }
    match (&report.directory, &report.file_name) {
        (Some(directory), Some(file_name)) if report.connected => {
            writeln!(stdout, "Connected: {}", directory.join(file_name).display())?;
            writeln!(stdout, "Status: {}", report.status.status)?;
            if let Some(saved) = report.status.last_save_time {
                writeln!(stdout, "Last save: {}", saved.to_rfc3339())?;
            }
        }
        _ => {
            writeln!(stdout, "Not connected")?;
            if report.status.status == AutosaveState::Error {
                writeln!(stdout, "Error: {}", report.status.message)?;
            }
        }
    }
    Ok(())
}

async fn list(config: AutosaveConfig, password: Option<String>) -> Result<()> {
    let engine = reconnect(config, password).await?;
    let files = engine.list_data_files().await?;
    engine.disconnect();

    let mut stdout = std::io::stdout().lock();
    for file in files {
        writeln!(stdout, "{file}")?;
    }
    Ok(())
}

async fn read(config: AutosaveConfig, password: Option<String>, args: &ReadArgs) -> Result<()> {
    let engine = reconnect(config, password).await?;
    let data = match &args.name {
        Some(name) => engine.read_named_file(name).await?,
        None => engine.read_file().await?,
    };
    engine.disconnect();

    let Some(data) = data else {
        bail!("No data file in the connected folder");
    };
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &data)?;
    writeln!(stdout)?;
    Ok(())
}

async fn save(config: AutosaveConfig, password: Option<String>, args: &SaveArgs) -> Result<()> {
    let data = load_input(&args.input)?;
    let engine = reconnect(config, password).await?;
    let saved = engine.save(data).await;
    let status = engine.status();
    engine.disconnect();
    if !saved {
        bail!("Save failed: {}", status.message);
    }
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Saved {}", args.input.display())?;
    Ok(())
}

async fn forget(config: AutosaveConfig) -> Result<()> {
    let engine = build_engine(config, None, None)?;
    engine.forget_folder().await?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Forgot the connected folder")?;
    Ok(())
}

/// Parse an input document. Encrypted documents are refused: the input is
/// the application's plaintext view.
pub(crate) fn load_input(path: &Path) -> Result<NormalizedFileData> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    match FileDocument::from_slice(&bytes)
        .with_context(|| format!("{} is not valid JSON data", path.display()))?
    {
        FileDocument::Plain(data) => Ok(data),
        FileDocument::Encrypted(_) => bail!("{} is encrypted; pass plaintext data", path.display()),
    }
}
