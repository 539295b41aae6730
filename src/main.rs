//! Command line interface for the sync core. Supports initialization, key
//! management, publishing with proof of work and delegation, offline edit
//! queueing and replay, and event verification.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::RwLock;
use relaysync::{
    config::Settings,
    delegation::create_token,
    event::{unix_now, verify_event_with},
    kv::{FileKvStore, KvStore},
    offline::{
        EditKind, MergePrompt, NoBackgroundSync, OfflineEdit, OfflineQueue, RecordRef,
        RelayRemoteState, Submitted,
    },
    pointers::PointerCache,
    pow,
    session::{LocalSigner, Session, Signer},
    Event, EventStore, Publisher, Tag, UnsignedEvent, WsRelayPool,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    sync::Mutex,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaysync",
    author,
    version,
    about = "Nostr client sync core",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the store directory at `STORE_ROOT`.
    Init,
    /// Generate a secret key and print it with its public key.
    Keygen,
    /// Sign and publish an event, queueing it when no relay is reachable.
    Publish {
        #[arg(long)]
        kind: u32,
        #[arg(long, default_value = "")]
        content: String,
        /// Extra tag as `name=value`; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Proof-of-work difficulty; defaults to `POW_DIFFICULTY`.
        #[arg(long)]
        pow: Option<u8>,
        /// Target relay; repeatable. Defaults to `RELAYS`.
        #[arg(long = "relay")]
        relays: Vec<String>,
    },
    /// Mine an event to a difficulty and print it, signed when a key is configured.
    Mine {
        #[arg(long)]
        kind: u32,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long)]
        difficulty: u8,
    },
    /// Issue a delegation tag from the configured key to another pubkey.
    Delegate {
        #[arg(long)]
        delegate: String,
        #[arg(long)]
        conditions: String,
    },
    /// Check id, signature and delegation of an event file.
    Verify { file: String },
    /// Queue a content edit against a replaceable record for later replay.
    Queue {
        #[arg(long)]
        kind: u32,
        /// Slot identifier of a parameterized-replaceable record.
        #[arg(long)]
        d: Option<String>,
        /// Content the edit was based on.
        #[arg(long, default_value = "")]
        base: String,
        #[arg(long)]
        content: String,
        #[arg(long, value_enum, default_value_t = EditKindArg::Chapter)]
        edit: EditKindArg,
    },
    /// List queued offline edits.
    Pending,
    /// Replay queued offline edits, prompting on conflicts.
    Flush,
}

/// Content edit types; resend types are queued by `publish` instead.
#[derive(Clone, Copy, ValueEnum)]
enum EditKindArg {
    BookMetadata,
    Chapter,
}

impl From<EditKindArg> for EditKind {
    fn from(arg: EditKindArg) -> Self {
        match arg {
            EditKindArg::BookMetadata => EditKind::BookMetadata,
            EditKindArg::Chapter => EditKind::Chapter,
        }
    }
}

/// Resolves conflicts by asking on the terminal, one answer line per conflict.
///
/// A single reader lives for the whole pass so answers piped in ahead of the
/// prompts are not lost between conflicts.
struct StdinMerge {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinMerge {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl MergePrompt for StdinMerge {
    async fn resolve(&self, local: &str, remote: &str) -> relaysync::Result<String> {
        let mut lines = self.lines.lock().await;
        let mut err = tokio::io::stderr();
        let prompt = format!(
            "conflict\n  local:  {local}\n  remote: {remote}\n[l]ocal, [r]emote, or type merged text: "
        );
        err.write_all(prompt.as_bytes()).await?;
        err.flush().await?;
        // End of input is not an answer; the edit stays queued.
        let Some(line) = lines.next_line().await? else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no answer to merge prompt").into());
        };
        Ok(match line.trim_end_matches('\r') {
            "" | "l" | "local" => local.to_string(),
            "r" | "remote" => remote.to_string(),
            merged => merged.to_string(),
        })
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            fs::create_dir_all(&cfg.store_root)?;
        }
        Commands::Keygen => {
            let signer = LocalSigner::generate();
            println!("secret: {}", signer.secret_hex());
            println!("pubkey: {}", signer.public_key());
        }
        Commands::Publish {
            kind,
            content,
            tags,
            pow,
            relays,
        } => {
            let mut template = UnsignedEvent::new(kind, content);
            for raw in &tags {
                template.tags.push(parse_tag(raw)?);
            }
            let relays = (!relays.is_empty()).then_some(relays);
            let edit = OfflineEdit::resend_to(
                EditKind::Publish,
                template,
                relays,
                Some(pow.unwrap_or(cfg.pow_difficulty)),
            );
            let queue = open_queue(&cfg).await?;
            match queue.submit(&publisher(&cfg)?, edit).await? {
                Submitted::Published(ev) => println!("{}", serde_json::to_string(&ev)?),
                Submitted::Queued(id) => println!("queued {id}"),
            }
        }
        Commands::Mine {
            kind,
            content,
            difficulty,
        } => {
            let signer = load_signer(&cfg)?;
            let mut template = UnsignedEvent::new(kind, content);
            template.created_at = unix_now();
            if let Some(signer) = &signer {
                template.pubkey = signer.public_key();
            }
            let limits = cfg.pow_limits;
            let mined =
                tokio::task::spawn_blocking(move || pow::mine(template, difficulty, limits))
                    .await??;
            match signer {
                Some(signer) => {
                    let ev = signer.sign_event(mined).await?;
                    println!("{}", serde_json::to_string(&ev)?);
                }
                None => println!("{}", serde_json::to_string(&mined)?),
            }
        }
        Commands::Delegate {
            delegate,
            conditions,
        } => {
            let signer = load_signer(&cfg)?.context("SECRET_KEY not set")?;
            let tag = create_token(signer.keypair(), &delegate, &conditions)?;
            println!("{}", serde_json::to_string(&tag)?);
        }
        Commands::Verify { file } => {
            let data = fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let ev: Event = serde_json::from_str(&data)?;
            verify_event_with(&ev, cfg.delegation_policy)?;
            println!("ok {}", ev.id);
        }
        Commands::Queue {
            kind,
            d,
            base,
            content,
            edit,
        } => {
            let signer = load_signer(&cfg)?.context("SECRET_KEY not set")?;
            let record = RecordRef::new(kind, signer.public_key(), d.as_deref());
            let edit = OfflineEdit::content(edit.into(), record, base, content);
            let id = edit.id.clone();
            open_queue(&cfg).await?.queue_offline_edit(edit).await?;
            println!("queued {id}");
        }
        Commands::Pending => {
            for edit in open_queue(&cfg).await?.pending().await {
                println!("{} {}", edit.id, serde_json::to_string(&edit.kind)?.trim_matches('"'));
            }
        }
        Commands::Flush => {
            let queue = open_queue(&cfg).await?;
            let publisher = publisher(&cfg)?;
            let store = Arc::new(RwLock::new(
                EventStore::new(cfg.verify_sig).with_policy(cfg.delegation_policy),
            ));
            let remote = RelayRemoteState::new(publisher.pool().clone(), cfg.relays.clone(), store)
                .with_pointers(PointerCache::new(kv_store(&cfg)));
            let report = queue
                .process_offline_edits(&publisher, &remote, &StdinMerge::new())
                .await?;
            println!(
                "published {} conflicts {} failed {}",
                report.published.len(),
                report.conflicts.len(),
                report.failed.len()
            );
            for (id, reason) in &report.failed {
                eprintln!("{id}: {reason}");
            }
        }
    }
    Ok(())
}

fn parse_tag(raw: &str) -> anyhow::Result<Tag> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(Tag::new([name, value])),
        _ => bail!("tag must be name=value: {raw}"),
    }
}

fn load_signer(cfg: &Settings) -> anyhow::Result<Option<Arc<LocalSigner>>> {
    cfg.secret_key
        .as_deref()
        .map(|secret| Ok(Arc::new(LocalSigner::from_secret_hex(secret)?)))
        .transpose()
}

fn publisher(cfg: &Settings) -> anyhow::Result<Publisher> {
    let session = Arc::new(Session::new());
    if let Some(signer) = load_signer(cfg)? {
        session.login(signer);
    }
    let pool = Arc::new(WsRelayPool::new(cfg.tor_socks.clone()));
    Ok(Publisher::new(session, pool, cfg.relays.clone())
        .with_pow_limits(cfg.pow_limits)
        .with_policy(cfg.delegation_policy))
}

fn kv_store(cfg: &Settings) -> Arc<dyn KvStore> {
    Arc::new(FileKvStore::new(cfg.store_root.clone()))
}

async fn open_queue(cfg: &Settings) -> anyhow::Result<OfflineQueue> {
    Ok(OfflineQueue::open(kv_store(cfg), Arc::new(NoBackgroundSync)).await?)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("relaysync-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("POW_DIFFICULTY=0\n");
    content.push_str("POW_MAX_MILLIS=5000\n");
    content.push_str("POW_MAX_ITERATIONS=10000000\n");
    content.push_str("DELEGATION_UNKNOWN_CLAUSES=ignore\n");
    content.push_str("SECRET_KEY=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
