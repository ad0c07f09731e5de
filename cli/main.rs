use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use s3bu::{
    config::Config,
    key_manager::{passphrase_env_var, KeyManager, Keyring},
    metadata, FsStore, TransformSpec, UploadClient,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// s3bu - stream files into object storage with optional gzip and encryption
#[derive(Parser)]
#[command(name = "s3bu")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (falls back to $S3BU_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize s3bu (generate config and recipient key)
    Init {
        /// Storage directory path
        #[arg(short, long, default_value = "./storage")]
        storage_dir: String,

        /// Target bucket
        #[arg(short, long, default_value = "backup")]
        bucket: String,

        /// Recipient key file path
        #[arg(short, long, default_value = "./s3bu.key")]
        key_path: String,
    },

    /// Upload a file (or `-` for stdin)
    Put {
        /// Input file to upload
        input: PathBuf,

        /// Object key (defaults to input filename)
        #[arg(short, long)]
        key: Option<String>,

        /// Compress with gzip before anything else
        #[arg(short, long)]
        compress: bool,

        /// Encrypt to the configured recipient keys
        #[arg(short, long, conflicts_with = "passphrase")]
        encrypt: bool,

        /// Encrypt under the most recently configured passphrase
        #[arg(short, long)]
        passphrase: bool,
    },

    /// List stored objects
    List {
        /// Show transform metadata
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show configuration and key status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,s3bu=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "s3bu starting");

    match cli.command {
        Commands::Init {
            storage_dir,
            bucket,
            key_path,
        } => {
            let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
            cmd_init(config_path, &storage_dir, &bucket, &key_path).await
        }

        Commands::Put {
            input,
            key,
            compress,
            encrypt,
            passphrase,
        } => {
            let spec = match (encrypt, passphrase) {
                (true, _) => TransformSpec::encrypted(compress),
                (_, true) => TransformSpec::passphrase(compress),
                _ if compress => TransformSpec::compressed(),
                _ => TransformSpec::plain(),
            };
            cmd_put(cli.config.as_deref(), &input, key.as_deref(), spec).await
        }

        Commands::List { verbose } => cmd_list(cli.config.as_deref(), verbose).await,

        Commands::Status => cmd_status(cli.config.as_deref()).await,
    }
}

/// Create a styled progress bar for a source of known size
fn create_progress_bar(total: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Create a spinner for sources of unknown size
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {bytes} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

/// Write a config file and generate a recipient key
async fn cmd_init(config_path: &str, storage_dir: &str, bucket: &str, key_path: &str) -> Result<()> {
    println!("Initializing s3bu...");

    let mut cfg = Config::new(storage_dir, bucket);
    cfg.recipient_keys.push(key_path.to_string());
    cfg.validate()?;

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    fs::create_dir_all(storage_dir)
        .await
        .with_context(|| format!("creating storage directory '{}'", storage_dir))?;

    // Refuses to overwrite an existing key
    KeyManager::generate(key_path).await?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:  {}", config_path);
    println!("Key:     {}", key_path);
    println!("Storage: {}/{}", storage_dir, bucket);
    println!();
    println!("IMPORTANT: Keep your key file secure and backed up!");
    println!("Without it, encrypted objects cannot be recovered.");

    Ok(())
}

/// Stream a file or stdin into the store
async fn cmd_put(
    config_path: Option<&str>,
    input: &Path,
    key: Option<&str>,
    spec: TransformSpec,
) -> Result<()> {
    let cfg = Config::load_with_env(config_path)?;
    let client = UploadClient::from_config(&cfg).await?;

    let from_stdin = input.as_os_str() == "-";
    let key = match key {
        Some(key) => key.to_string(),
        None if from_stdin => anyhow::bail!("--key is required when reading stdin"),
        None => input
            .file_name()
            .context("input file has no filename")?
            .to_string_lossy()
            .to_string(),
    };

    let message = format!("Uploading {}", key);
    let (pb, source): (ProgressBar, Box<dyn Read + Send>) = if from_stdin {
        let pb = create_spinner(&message)?;
        let source = pb.wrap_read(std::io::stdin());
        (pb, Box::new(source))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("opening {:?}", input))?;
        let size = file
            .metadata()
            .with_context(|| format!("reading metadata for {:?}", input))?
            .len();
        let pb = create_progress_bar(size, &message)?;
        let source = pb.wrap_read(file);
        (pb, Box::new(source))
    };

    let written = match client.upload_with(&key, source, spec).await {
        Ok(written) => written,
        Err(e) => {
            pb.abandon_with_message("Upload failed");
            return Err(e.into());
        }
    };
    pb.finish_with_message(format!("Stored {} bytes", written));

    println!("  {} -> {}/{}", input.display(), cfg.bucket, key);
    Ok(())
}

/// Transform summary of an object, e.g. "gzip+xchacha20poly1305"
fn describe(md: &metadata::Metadata, prefix: &str) -> String {
    let parts: Vec<String> = [metadata::COMPRESS, metadata::ENCRYPT, metadata::SCRYPT]
        .iter()
        .filter_map(|t| {
            md.transform(prefix, t).map(|alg| match *t {
                metadata::SCRYPT => match md.get(&format!("{}-{}-id", prefix, t)) {
                    Some(id) => format!("{} (passphrase {})", alg, id),
                    None => format!("{} (passphrase)", alg),
                },
                _ => alg.to_string(),
            })
        })
        .collect();
    if parts.is_empty() {
        "plain".to_string()
    } else {
        parts.join("+")
    }
}

/// List stored objects
async fn cmd_list(config_path: Option<&str>, verbose: bool) -> Result<()> {
    let cfg = Config::load_with_env(config_path)?;
    let store = FsStore::new(&cfg.storage_dir);

    let records = store.list(&cfg.bucket).await?;

    if records.is_empty() {
        println!("No objects found in bucket '{}'", cfg.bucket);
        return Ok(());
    }

    println!("Objects in '{}' ({} total):", cfg.bucket, records.len());
    println!();

    if verbose {
        println!("{:<40} {:>12}  {}", "KEY", "SIZE (bytes)", "TRANSFORMS");
        println!("{}", "-".repeat(72));

        for record in records {
            println!(
                "{:<40} {:>12}  {}",
                record.key,
                record.size,
                describe(&record.metadata, &cfg.metadata_prefix)
            );
        }
    } else {
        for record in records {
            println!("  {} ({} bytes)", record.key, record.size);
        }
    }

    Ok(())
}

/// Show configuration, key and storage status
async fn cmd_status(config_path: Option<&str>) -> Result<()> {
    let cfg = Config::load_with_env(config_path)?;
    let store = FsStore::new(&cfg.storage_dir);

    println!("s3bu Status");
    println!();

    println!("Configuration:");
    println!("  Config file:     {}", config_path.unwrap_or("(default or $S3BU_CONFIG)"));
    println!("  Storage dir:     {}", cfg.storage_dir);
    println!("  Bucket:          {}", cfg.bucket);
    println!("  Metadata prefix: {}", cfg.metadata_prefix);
    println!("  Scrypt log N:    {}", cfg.scrypt_log_n);
    println!();

    println!("Recipient Keys:");
    if cfg.recipient_keys.is_empty() {
        println!("  (none)");
    }
    for path in &cfg.recipient_keys {
        let present = fs::try_exists(path).await.unwrap_or(false);
        println!("  {:<40} {}", path, if present { "Present" } else { "Missing" });
    }
    println!();

    let keyring = Keyring::from_config(&cfg).await.ok();
    println!("Passphrases:");
    if cfg.passphrase_ids.is_empty() {
        println!("  (none)");
    }
    for id in &cfg.passphrase_ids {
        let set = keyring
            .as_ref()
            .map(|k| k.passphrases.get(id).is_some())
            .unwrap_or(false);
        println!(
            "  {:<20} {:<32} {}",
            id,
            passphrase_env_var(id),
            if set { "Set" } else { "Not set" }
        );
    }
    if let Some((id, _)) = keyring.as_ref().and_then(|k| k.passphrases.latest()) {
        println!("  Encrypting with: {}", id);
    }
    println!();

    let records = store.list(&cfg.bucket).await?;
    let total_size: u64 = records.iter().map(|r| r.size).sum();
    let compressed = records
        .iter()
        .filter(|r| r.metadata.transform(&cfg.metadata_prefix, metadata::COMPRESS).is_some())
        .count();
    let encrypted = records
        .iter()
        .filter(|r| {
            r.metadata.transform(&cfg.metadata_prefix, metadata::ENCRYPT).is_some()
                || r.metadata.transform(&cfg.metadata_prefix, metadata::SCRYPT).is_some()
        })
        .count();

    println!("Storage Statistics:");
    println!("  Total objects:   {}", records.len());
    println!(
        "  Total size:      {} bytes ({:.2} MB)",
        total_size,
        total_size as f64 / 1_048_576.0
    );
    println!("  Compressed:      {}/{}", compressed, records.len());
    println!("  Encrypted:       {}/{}", encrypted, records.len());

    Ok(())
}
