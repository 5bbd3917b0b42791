use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uta_core::{
    generate_salt, paths, Argon2Kdf, BackupLayout, BackupManager, DiaryConfig, DiaryError,
    DiaryStore, EditorSettings, EntryEditor, FileSystem, FsError, KeyRing, LocalFileSystem,
    NewChat, NewEntry,
};
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "UTA_PASSPHRASE";
const CONFIG_FILE: &str = "uta.json";
const MIN_PASSPHRASE_LEN: usize = 8;

#[derive(Parser)]
#[command(name = "uta")]
#[command(about = "Encrypted personal journal", long_about = None)]
struct Cli {
    /// Config file (defaults to uta.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the encrypted diary
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty diary
    Init,

    /// List entries
    List,

    /// Add an entry
    Add {
        #[arg(default_value = "Title")]
        title: String,
        #[arg(long, default_value = "")]
        text: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Print one entry as JSON
    Show { id: String },

    /// Change an entry's title or text
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        text: Option<String>,
    },

    /// Remove an entry
    Remove { id: String },

    /// Entry, chat and word counts
    Stats,

    /// Manage chats
    Chats {
        #[command(subcommand)]
        command: ChatCommands,
    },

    /// Manage plaintext backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    List,
    Add {
        name: String,
        #[arg(long, default_value = "")]
        last_text: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    List,

    /// Export the diary (default name: current timestamp)
    Export {
        name: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },

    /// Replace the diary with a backup
    Import {
        name: String,
        /// Read from this directory instead of the backup directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Accept backups signed under another passphrase
        #[arg(long)]
        no_verify: bool,
        /// Accept backups that carry no signature
        #[arg(long)]
        allow_unsigned: bool,
    },

    Delete {
        name: String,
    },
}

struct AppContext {
    config: DiaryConfig,
    data_dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

struct Session {
    config: DiaryConfig,
    fs: Arc<dyn FileSystem>,
    store: Arc<DiaryStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("uta=info,uta_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = load_context(cli.config, cli.data_dir)?;

    match cli.command {
        Commands::Init => init_command(&ctx).await,
        Commands::List => {
            let session = unlock(ctx).await?;
            for entry in session.store.all() {
                println!(
                    "{}  {}  {}",
                    entry.id,
                    entry.date.format("%Y-%m-%d %H:%M"),
                    entry.title
                );
            }
            Ok(())
        }
        Commands::Add { title, text, tags } => {
            let session = unlock(ctx).await?;
            let entry = session.store.create_entry(NewEntry {
                date: None,
                title,
                text,
                tags,
            });
            session.store.commit().await?;
            println!("{}", entry.id);
            Ok(())
        }
        Commands::Show { id } => {
            let session = unlock(ctx).await?;
            let entry = session.store.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Commands::Edit { id, title, text } => edit_command(unlock(ctx).await?, &id, title, text).await,
        Commands::Remove { id } => {
            let session = unlock(ctx).await?;
            let entry = session.store.remove_entry(&id)?;
            session.store.commit().await?;
            info!(id = %entry.id, "entry removed");
            Ok(())
        }
        Commands::Stats => {
            let session = unlock(ctx).await?;
            println!("{}", serde_json::to_string_pretty(&session.store.stats())?);
            Ok(())
        }
        Commands::Chats { command } => chats_command(unlock(ctx).await?, command).await,
        Commands::Backups { command } => backups_command(unlock(ctx).await?, command).await,
    }
}

fn load_context(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<AppContext> {
    let config_path = match config_path {
        Some(path) => path,
        None => paths::data_dir()?.join(CONFIG_FILE),
    };
    let mut config = DiaryConfig::load(&config_path)?;
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    let data_dir = config.resolve_data_dir()?;
    debug!(config = %config_path.display(), data_dir = %data_dir.display(), "configuration loaded");
    Ok(AppContext {
        config,
        data_dir,
        fs: Arc::new(LocalFileSystem::new()),
    })
}

async fn init_command(ctx: &AppContext) -> Result<()> {
    let existing = ctx
        .fs
        .read_as_text(&ctx.data_dir, &ctx.config.database_file)
        .await;
    if existing.is_ok() {
        bail!("a diary already exists in {}", ctx.data_dir.display());
    }

    let passphrase = prompt_passphrase_twice("New passphrase: ")?;
    ensure_dir(&*ctx.fs, &ctx.data_dir).await?;
    let salt = generate_salt();
    ctx.fs
        .write_file(&ctx.data_dir, &ctx.config.salt_file, &hex::encode(salt), false)
        .await
        .with_context(|| format!("writing salt file in {}", ctx.data_dir.display()))?;

    let key_ring =
        KeyRing::create_with(&Argon2Kdf::new(ctx.config.kdf), &passphrase, &salt).await?;
    let store = DiaryStore::new(
        ctx.fs.clone(),
        &ctx.data_dir,
        ctx.config.database_file.clone(),
        key_ring,
    );
    store.commit().await?;
    info!(dir = %ctx.data_dir.display(), "diary created");
    Ok(())
}

async fn unlock(ctx: AppContext) -> Result<Session> {
    let salt_hex = match ctx.fs.read_as_text(&ctx.data_dir, &ctx.config.salt_file).await {
        Ok(text) => text,
        Err(FsError::NotFound(_)) => {
            bail!("no diary in {}; run `uta init` first", ctx.data_dir.display())
        }
        Err(e) => return Err(e.into()),
    };
    let salt = hex::decode(salt_hex.trim()).context("salt file is not hex")?;

    let passphrase = prompt_passphrase("Passphrase: ")?;
    let key_ring =
        KeyRing::create_with(&Argon2Kdf::new(ctx.config.kdf), &passphrase, &salt).await?;
    let store = DiaryStore::new(
        ctx.fs.clone(),
        &ctx.data_dir,
        ctx.config.database_file.clone(),
        key_ring,
    );
    store.load().await.map_err(|e| match e {
        DiaryError::Integrity => anyhow!("wrong passphrase or damaged diary"),
        other => other.into(),
    })?;

    Ok(Session {
        config: ctx.config,
        fs: ctx.fs,
        store: Arc::new(store),
    })
}

async fn edit_command(
    session: Session,
    id: &str,
    title: Option<String>,
    text: Option<String>,
) -> Result<()> {
    if title.is_none() && text.is_none() {
        bail!("nothing to change; pass --title and/or --text");
    }
    let editor = EntryEditor::new(
        session.store.clone(),
        id,
        EditorSettings::from(&session.config),
    )?;

    if let Some(title) = title {
        editor.start_title_editing()?;
        editor.set_title(title)?;
        editor.save_title().await?;
    }
    if let Some(text) = text {
        editor.start_editing()?;
        editor.text_changed(text)?;
        editor.preview().await?;
        if let Some(notice) = editor.notifications().last() {
            println!("{}", notice.message);
        }
    }
    Ok(())
}

async fn chats_command(session: Session, command: ChatCommands) -> Result<()> {
    match command {
        ChatCommands::List => {
            for chat in session.store.chats() {
                println!("{}  {}  {}", chat.id, chat.name, chat.last_text);
            }
        }
        ChatCommands::Add { name, last_text } => {
            let chat = session.store.create_chat(NewChat { name, last_text });
            session.store.commit().await?;
            println!("{}", chat.id);
        }
        ChatCommands::Remove { id } => {
            session.store.remove_chat(&id)?;
            session.store.commit().await?;
        }
    }
    Ok(())
}

async fn backups_command(session: Session, command: BackupCommands) -> Result<()> {
    let layout = BackupLayout::new(session.config.resolve_backup_root()?);
    let manager = BackupManager::new(session.fs.clone(), session.store.clone(), layout)
        .with_signature_check(session.config.backups.verify_signatures)
        .with_unsigned_allowed(session.config.backups.allow_unsigned);

    match command {
        BackupCommands::List => {
            for file in manager.list_backup_files().await {
                println!("{}", file.path.join(&file.name).display());
            }
        }
        BackupCommands::Export { name, overwrite } => {
            let name = name.unwrap_or_else(|| {
                format!("{}.json", Utc::now().format("%Y-%m-%d-%H%M%S"))
            });
            let file = manager.export_file(&name, overwrite).await?;
            println!("{}", file.path.join(&file.name).display());
        }
        BackupCommands::Import {
            name,
            dir,
            no_verify,
            allow_unsigned,
        } => {
            let dir = dir.unwrap_or_else(|| manager.directory());
            let manager = if no_verify {
                manager.with_signature_check(false)
            } else {
                manager
            };
            let manager = if allow_unsigned {
                manager.with_unsigned_allowed(true)
            } else {
                manager
            };
            manager.import_file(&dir, &name).await?;
            println!("imported {} entries", session.store.all().len());
        }
        BackupCommands::Delete { name } => {
            manager.delete_file(&manager.directory(), &name).await?;
        }
    }
    Ok(())
}

async fn ensure_dir(fs: &dyn FileSystem, dir: &Path) -> Result<()> {
    let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
        return Ok(());
    };
    fs.create_dir(parent, &name.to_string_lossy(), true)
        .await
        .with_context(|| format!("creating {}", dir.display()))
}

fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSPHRASE_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_passphrase_twice(prompt: &str) -> Result<Zeroizing<String>> {
    let first = prompt_passphrase(prompt)?;
    if first.chars().count() < MIN_PASSPHRASE_LEN {
        bail!("passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters");
    }
    if std::env::var(PASSPHRASE_ENV).is_ok_and(|pw| !pw.is_empty()) {
        return Ok(first);
    }
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if *first != *second {
        bail!("passphrases do not match");
    }
    Ok(first)
}
