//! gated-press CLI
//!
//! Drives the blob pipeline against a local on-disk store.
//!
//! ## Usage
//!
//! ```bash
//! # Write a default config and owner key
//! gated-press init
//!
//! # Pack files into one blob (encode, register, upload, certify)
//! gated-press put issue-1.bin issue-2.bin --epochs 10
//!
//! # Pull one entry back out
//! gated-press get <blob-id> issue-1.bin --out issue-1.bin
//!
//! # Entries of a blob
//! gated-press list <blob-id>
//!
//! # Remove a blob stored with --deletable
//! gated-press delete <blob-id>
//!
//! # Storage statistics
//! gated-press stats
//!
//! # Publish a file as a premium article and read it back as a fresh
//! # subscriber, with in-process key servers
//! gated-press walkthrough essay.bin --tier premium
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gated_press::access::KeyServer;
use gated_press::blob::{BlobBackend, BlobMetadata, BlobPipeline, BlobStore, LocalBlobBackend};
use gated_press::entitlement::KeyId;
use gated_press::{
    AccessResolver, ArticleReader, BlobId, Clock, Config, EntitlementStore, KeyReleaseClient, Ledger, LocalKeyServer,
    LocalSigner, NewPublication, Publisher, SealedArticle, SessionManager, Signer, SystemClock, Tier, UnixMillis,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gated-press")]
#[command(about = "Entitlement-gated content pipeline")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "GATED_PRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "GATED_PRESS_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config and generate the owner key
    Init,

    /// Store files as entries of a single certified blob
    Put {
        /// Files to pack; each entry is named after its file name
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Storage epochs to pay for (defaults to config)
        #[arg(long)]
        epochs: Option<u32>,

        /// Allow the owner to delete the blob later
        #[arg(long)]
        deletable: bool,
    },

    /// Extract one entry from a blob
    Get {
        blob_id: String,
        identifier: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List the entries of a blob
    List { blob_id: String },

    /// Delete a blob that was stored as deletable
    Delete { blob_id: String },

    /// Show storage statistics
    Stats,

    /// Publish one file and read it back through every component
    Walkthrough {
        file: PathBuf,

        /// Tier of the published article (free, basic, premium)
        #[arg(long, default_value = "basic")]
        tier: String,

        /// Key servers to run in-process
        #[arg(long, default_value_t = 3)]
        key_servers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gated_press=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    match args.command {
        Command::Init => init(&config, args.config.as_ref()),
        Command::Put {
            files,
            epochs,
            deletable,
        } => put(&config, files, epochs, deletable).await,
        Command::Get { blob_id, identifier, out } => get(&config, &blob_id, &identifier, out).await,
        Command::List { blob_id } => list(&config, &blob_id).await,
        Command::Delete { blob_id } => delete(&config, &blob_id).await,
        Command::Stats => stats(&config).await,
        Command::Walkthrough { file, tier, key_servers } => walkthrough(&config, &file, &tier, key_servers).await,
    }
}

fn init(config: &Config, config_path: Option<&PathBuf>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.storage_dir)?;

    let path = config_path.cloned().unwrap_or_else(|| config.config_path());
    if path.exists() {
        info!(path = %path.display(), "Config already exists");
    } else {
        config.save(&path)?;
        info!(path = %path.display(), "Created default config");
    }

    let owner = LocalSigner::load_or_generate(config.owner_key_path())?;
    println!("owner: {}", owner.address());
    Ok(())
}

async fn pipeline(config: &Config) -> anyhow::Result<(BlobPipeline, Arc<LocalBlobBackend>)> {
    let store = BlobStore::new(config.blobs_dir()).await?;
    let backend = Arc::new(LocalBlobBackend::new(store));
    let pipeline = BlobPipeline::new(backend.clone() as Arc<dyn BlobBackend>, config.storage_retry.clone());
    Ok((pipeline, backend))
}

async fn put(config: &Config, files: Vec<PathBuf>, epochs: Option<u32>, deletable: bool) -> anyhow::Result<()> {
    let owner = LocalSigner::load_or_generate(config.owner_key_path())?;
    let (pipeline, _) = pipeline(config).await?;

    let mut entries = Vec::with_capacity(files.len());
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        entries.push((name, bytes));
    }

    let encoded = BlobPipeline::encode(entries)?;
    let certified = pipeline
        .store(
            encoded,
            &owner,
            epochs.unwrap_or(config.storage_epochs),
            deletable || config.deletable_blobs,
        )
        .await?;

    info!(
        blob_id = %certified.blob_id,
        owner = %owner.address(),
        size = certified.size_bytes,
        end_epoch = certified.end_epoch,
        "Stored blob"
    );
    println!("{}", certified.blob_id);
    Ok(())
}

async fn get(config: &Config, blob_id: &str, identifier: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(config).await?;
    let bytes = pipeline.read(&BlobId::from(blob_id), identifier).await?;

    match out {
        Some(path) => {
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), size = bytes.len(), "Extracted entry");
        }
        None => std::io::stdout().write_all(&bytes)?,
    }
    Ok(())
}

async fn list(config: &Config, blob_id: &str) -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(config).await?;
    let container = pipeline.fetch(&BlobId::from(blob_id)).await?;
    let entries = pipeline.entries(&container)?;
    if entries.is_empty() {
        bail!("blob {blob_id} has no entries");
    }
    for entry in entries {
        println!("{}\t{}\t{}", entry.identifier, entry.length, entry.hash);
    }
    Ok(())
}

async fn delete(config: &Config, blob_id: &str) -> anyhow::Result<()> {
    let owner = LocalSigner::load_or_generate(config.owner_key_path())?;
    let (pipeline, _) = pipeline(config).await?;
    pipeline.delete(&BlobId::from(blob_id), &owner).await?;
    println!("deleted {blob_id}");
    Ok(())
}

/// One blob as printed by `stats`, timestamps in milliseconds for web clients
#[derive(Serialize)]
struct BlobListing<'a> {
    blob_id: &'a str,
    owner: &'a str,
    size_bytes: u64,
    end_epoch: u64,
    deletable: bool,
    certified_at_ms: UnixMillis,
}

impl<'a> From<&'a BlobMetadata> for BlobListing<'a> {
    fn from(meta: &'a BlobMetadata) -> Self {
        Self {
            blob_id: meta.blob_id.as_str(),
            owner: meta.owner.as_str(),
            size_bytes: meta.size_bytes,
            end_epoch: meta.end_epoch,
            deletable: meta.deletable,
            certified_at_ms: meta.certified_at.to_millis(),
        }
    }
}

async fn stats(config: &Config) -> anyhow::Result<()> {
    let (_, backend) = pipeline(config).await?;
    let stats = backend.store().stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for meta in backend.store().list().await? {
        println!("{}", serde_json::to_string(&BlobListing::from(&meta))?);
    }
    Ok(())
}

async fn walkthrough(config: &Config, file: &PathBuf, tier: &str, key_servers: usize) -> anyhow::Result<()> {
    let tier: Tier = tier.parse()?;
    let ciphertext = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(EntitlementStore::new(
        Arc::new(Ledger::immediate()),
        clock.clone(),
        config.entitlement(),
    ));
    let (pipeline, _) = pipeline(config).await?;
    let pipeline = Arc::new(pipeline);

    let servers: Vec<Arc<dyn KeyServer>> = (1..=key_servers)
        .map(|i| Arc::new(LocalKeyServer::new(format!("ks-{i}"), store.clone(), clock.clone())) as Arc<dyn KeyServer>)
        .collect();
    let keys = KeyReleaseClient::new(servers, config.key_threshold, config.key_retry.clone())?;
    let resolver = Arc::new(AccessResolver::new(store.clone(), keys, config.visibility_retry.clone()));

    let owner = Arc::new(LocalSigner::load_or_generate(config.owner_key_path())?);
    let publisher = Publisher::new(
        store.clone(),
        pipeline.clone(),
        owner,
        config.storage_epochs,
        config.deletable_blobs,
    );
    let (publication, cap) = publisher
        .create_publication(NewPublication {
            name: "Walkthrough".into(),
            description: String::new(),
            basic_price: 1_000_000_000,
            premium_price: 5_000_000_000,
            free_tier_enabled: true,
        })
        .await?;

    let identifier = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", file.display()))?;
    let article = publisher
        .publish(
            &cap,
            &publication.id,
            SealedArticle {
                title: identifier.clone(),
                excerpt: String::new(),
                tier,
                key_id: KeyId::new(format!("walkthrough-{identifier}")),
                identifier,
                ciphertext: ciphertext.clone(),
            },
        )
        .await?;

    let reader_key = Arc::new(LocalSigner::generate());
    let subscription = store
        .purchase_subscription(&reader_key.address(), &publication.id, tier, publication.price_for(tier))
        .await?;
    info!(
        subscription_id = %subscription.id,
        expires_at = %subscription.expires_at.to_rfc3339(),
        "Reader subscribed"
    );

    let session = Arc::new(SessionManager::new(reader_key, clock.clone(), config.session_ttl_secs));
    session.initialize().await?;
    let reader = ArticleReader::new(resolver, pipeline, session, clock);
    let opened = reader.open(&article.id).await?;

    if opened.ciphertext != ciphertext {
        bail!("ciphertext read back differs from what was published");
    }
    println!("article:  {}", article.id);
    println!("blob:     {}", article.blob_id());
    println!("path:     {}", opened.path);
    println!("shares:   {}/{}", opened.key.shares.len(), opened.key.threshold);
    println!("views:    {}", store.stats(&publication.id)?.total_views);
    println!("expires:  {} ms", subscription.expires_at.to_millis().as_u64());
    Ok(())
}
