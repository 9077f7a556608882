//! blobseal: client for an encrypted, chunk-authenticated file store
//!
//! Commands:
//!   keygen --out <path>                      - write a fresh base64 file key
//!   put <local> --key-file <k>               - upload a local file, print its id
//!   get <id> --key-file <k> [--out <path>]   - download and verify a whole file
//!   cat <id> --key-file <k> [--offset/--len] - verified range read to stdout
//!   write <id> --key-file <k> --offset <n>   - in-place random write
//!   info <id>                                - show stored metadata
//!   config show                              - display current configuration

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use blobseal_core::{BlobsealConfig, FileId};
use blobseal_crypto::{generate_key, EncryptionKey};
use blobseal_session::HandleRegistry;
use blobseal_storage::{DirRemote, RemoteBlobApi};

/// Bytes moved per read/write call when streaming to or from local files
const IO_BUFFER: usize = 256 * 1024;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "blobseal",
    version,
    about = "Encrypted chunked file store client",
    long_about = "blobseal: upload, read and edit files stored as independently \
                  encrypted, HMAC-authenticated chunks"
)]
struct Cli {
    /// Path to blobseal.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "BLOBSEAL_CONFIG",
        default_value = "~/.config/blobseal/config.toml"
    )]
    config: PathBuf,

    /// Log level or filter directive (overrides [log] level)
    #[arg(long, env = "BLOBSEAL_LOG")]
    log: Option<String>,

    /// Log format (overrides [log] format)
    #[arg(long, env = "BLOBSEAL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a random 256-bit file key
    Keygen {
        /// Where to write the base64-encoded key
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Upload a local file as a new encrypted file
    Put {
        /// Local file to upload
        local: PathBuf,
        /// File containing the base64 key
        #[arg(long, short = 'k', env = "BLOBSEAL_KEY_FILE")]
        key_file: PathBuf,
        /// Label stored with the file to identify its key
        #[arg(long, default_value = "default")]
        key_id: String,
    },

    /// Download a whole file, verifying every chunk
    Get {
        /// File id printed by `put`
        id: String,
        #[arg(long, short = 'k', env = "BLOBSEAL_KEY_FILE")]
        key_file: PathBuf,
        /// Destination (default: stdout)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Print a byte range of a file to stdout
    Cat {
        id: String,
        #[arg(long, short = 'k', env = "BLOBSEAL_KEY_FILE")]
        key_file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read (default: to the end of the file)
        #[arg(long)]
        len: Option<u64>,
    },

    /// Overwrite bytes of an existing file in place
    Write {
        id: String,
        #[arg(long, short = 'k', env = "BLOBSEAL_KEY_FILE")]
        key_file: PathBuf,
        /// Offset to write at; past the end, the gap is zero-filled
        #[arg(long)]
        offset: u64,
        /// Literal bytes to write
        #[arg(long, conflicts_with = "from", required_unless_present = "from")]
        data: Option<String>,
        /// Local file whose contents are written
        #[arg(long)]
        from: Option<PathBuf>,
        /// End the file right after the written bytes
        #[arg(long)]
        truncate: bool,
    },

    /// Show the stored metadata of a file
    Info {
        id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = match cli.log_format {
        Some(format) => format,
        None => <LogFormat as ValueEnum>::from_str(&config.log.format, true)
            .map_err(|e| anyhow::anyhow!("invalid [log] format: {e}"))?,
    };
    init_logging(level, &format);
    debug!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Keygen { out, force } => cmd_keygen(&out, force),
        Commands::Put {
            local,
            key_file,
            key_id,
        } => cmd_put(&config, &local, &key_file, &key_id),
        Commands::Get { id, key_file, out } => cmd_get(&config, &id, &key_file, out.as_deref()),
        Commands::Cat {
            id,
            key_file,
            offset,
            len,
        } => cmd_cat(&config, &id, &key_file, offset, len),
        Commands::Write {
            id,
            key_file,
            offset,
            data,
            from,
            truncate,
        } => {
            let bytes = match (data, from) {
                (Some(data), _) => data.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("one of --data or --from is required"),
            };
            cmd_write(&config, &id, &key_file, offset, &bytes, truncate)
        }
        Commands::Info { id, json } => cmd_info(&config, &id, json),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

// ── Config loading and logging ────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<BlobsealConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(BlobsealConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries file contents for `get` and `cat`
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Store access ──────────────────────────────────────────────────────────────

struct Store {
    remote: Arc<DirRemote>,
    registry: HandleRegistry,
}

fn open_store(config: &BlobsealConfig) -> Result<Store> {
    let root = expand_tilde(&config.storage.root);
    let remote = Arc::new(
        DirRemote::open(&root, &config.storage.container)
            .with_context(|| format!("opening store at {}", root.display()))?,
    );
    let registry = HandleRegistry::new(
        remote.clone(),
        remote.clone(),
        config.engine.clone(),
        config.storage.container.clone(),
    )
    .context("invalid [engine] configuration")?;
    Ok(Store { remote, registry })
}

fn read_key(path: &Path) -> Result<EncryptionKey> {
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file: {}", path.display()))?;
    EncryptionKey::from_base64(&encoded)
        .with_context(|| format!("decoding key file: {}", path.display()))
}

// ── `blobseal keygen` ─────────────────────────────────────────────────────────

fn cmd_keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            out.display()
        );
    }
    let key = generate_key();
    std::fs::write(out, format!("{}\n", key.to_base64()))
        .with_context(|| format!("writing key file: {}", out.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(out, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {}", out.display()))?;
    }

    println!("Wrote new key to {}", out.display());
    Ok(())
}

// ── `blobseal put` ────────────────────────────────────────────────────────────

fn cmd_put(config: &BlobsealConfig, local: &Path, key_file: &Path, key_id: &str) -> Result<()> {
    let key = read_key(key_file)?;
    let store = open_store(config)?;

    let mut file =
        File::open(local).with_context(|| format!("opening {}", local.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("reading metadata of {}", local.display()))?
        .len();

    let handle = store
        .registry
        .create_write(size, key, key_id)
        .context("starting upload")?;
    let receipt = store
        .registry
        .with_write(handle, |upload| {
            let mut buf = vec![0u8; IO_BUFFER];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                upload.write(&buf[..n])?;
            }
            upload.finalize()
        })
        .with_context(|| format!("uploading {}", local.display()))?;
    store.registry.close(handle)?;

    info!(file_id = %receipt.file_id, bytes = size, "upload committed");
    println!("Uploaded {}", local.display());
    println!("  id:        {}", receipt.file_id);
    println!("  bytes:     {}", fmt_bytes(receipt.plain_size));
    println!("  chunks:    {}", receipt.plain_size.div_ceil(receipt.chunk_size));
    println!("  top hash:  {}", hex(&receipt.hmac));
    Ok(())
}

// ── `blobseal get` / `blobseal cat` ───────────────────────────────────────────

fn cmd_get(config: &BlobsealConfig, id: &str, key_file: &Path, out: Option<&Path>) -> Result<()> {
    let key = read_key(key_file)?;
    let store = open_store(config)?;
    let file_id = FileId::from(id);

    let mut sink: Box<dyn Write> = match out {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };

    let handle = store
        .registry
        .open_read(&file_id, key)
        .with_context(|| format!("opening {file_id}"))?;
    let bytes = store
        .registry
        .with_read(handle, |reader| {
            let mut total = 0u64;
            loop {
                let data = reader.read(IO_BUFFER as u64)?;
                if data.is_empty() {
                    break;
                }
                sink.write_all(&data)?;
                total += data.len() as u64;
            }
            sink.flush()?;
            Ok(total)
        })
        .with_context(|| format!("reading {file_id}"))?;
    store.registry.close(handle)?;

    debug!(file_id = %file_id, bytes, "download complete");
    if let Some(path) = out {
        println!("Downloaded {} → {} ({})", file_id, path.display(), fmt_bytes(bytes));
    }
    Ok(())
}

fn cmd_cat(
    config: &BlobsealConfig,
    id: &str,
    key_file: &Path,
    offset: u64,
    len: Option<u64>,
) -> Result<()> {
    let key = read_key(key_file)?;
    let store = open_store(config)?;
    let file_id = FileId::from(id);

    let handle = store
        .registry
        .open_read(&file_id, key)
        .with_context(|| format!("opening {file_id}"))?;
    let data = store
        .registry
        .with_read(handle, |reader| reader.read_at(offset, len.unwrap_or(u64::MAX)))
        .with_context(|| format!("reading {file_id} at {offset}"))?;
    store.registry.close(handle)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data).context("writing to stdout")?;
    stdout.flush().context("writing to stdout")?;
    Ok(())
}

// ── `blobseal write` ──────────────────────────────────────────────────────────

fn cmd_write(
    config: &BlobsealConfig,
    id: &str,
    key_file: &Path,
    offset: u64,
    data: &[u8],
    truncate: bool,
) -> Result<()> {
    let key = read_key(key_file)?;
    let store = open_store(config)?;
    let file_id = FileId::from(id);

    let handle = store
        .registry
        .open_random_write(&file_id, key)
        .with_context(|| format!("opening {file_id} for writing"))?;
    let (size, version) = store
        .registry
        .with_random_write(handle, |file| {
            file.write(offset, data, truncate)?;
            Ok((file.size(), file.engine().descriptor().version))
        })
        .with_context(|| format!("writing {} at offset {offset}", fmt_bytes(data.len() as u64)))?;
    store.registry.close(handle)?;

    println!("Wrote {} to {file_id} at offset {offset}", fmt_bytes(data.len() as u64));
    println!("  size:     {}", fmt_bytes(size));
    println!("  version:  {version}");
    Ok(())
}

// ── `blobseal info` ───────────────────────────────────────────────────────────

fn cmd_info(config: &BlobsealConfig, id: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let file_id = FileId::from(id);
    let stat = store
        .remote
        .stat(&file_id)
        .with_context(|| format!("looking up {file_id}"))?;
    let meta = &stat.meta;
    let chunks = meta.plain_size.div_ceil(meta.chunk_size.max(1));

    if json {
        let value = serde_json::json!({
            "file_id": file_id.as_str(),
            "version": stat.version,
            "plain_size": meta.plain_size,
            "encrypted_size": meta.encrypted_size,
            "chunk_size": meta.chunk_size,
            "chunks": chunks,
            "top_hash": hex(&meta.top_hash),
            "key_id": meta.key_id,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("serializing metadata")?
        );
        return Ok(());
    }

    println!("File: {file_id}");
    println!("  version:         {}", stat.version);
    println!("  size:            {} ({} bytes)", fmt_bytes(meta.plain_size), meta.plain_size);
    println!("  encrypted size:  {}", fmt_bytes(meta.encrypted_size));
    println!("  chunk size:      {}", fmt_bytes(meta.chunk_size));
    println!("  chunks:          {chunks}");
    println!("  top hash:        {}", hex(&meta.top_hash));
    println!("  key id:          {}", meta.key_id);
    Ok(())
}

// ── `blobseal config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &BlobsealConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Formatting helpers ────────────────────────────────────────────────────────

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    fn temp_config(root: &TempDir) -> BlobsealConfig {
        let mut config = BlobsealConfig::default();
        config.storage.root = root.path().join("store");
        config.engine.chunk_size = 64;
        config.engine.server_slice_size = 512;
        config.engine.upload_request_size = 256;
        config.engine.max_operation_size = 1024;
        config
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_write_requires_a_source() {
        let parsed =
            Cli::try_parse_from(["blobseal", "write", "abc", "-k", "key", "--offset", "3"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from([
            "blobseal", "write", "abc", "-k", "key", "--offset", "3", "--data", "x", "--from", "f",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/a/b")),
            PathBuf::from(home).join("a/b")
        );
        assert_eq!(expand_tilde(Path::new("/etc/x")), PathBuf::from("/etc/x"));
        assert_eq!(expand_tilde(Path::new("~user/x")), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, blobseal_core::EngineConfig::default());
        assert_eq!(config.storage.container, "default");
    }

    #[test]
    fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\nchunk_size = 4096\n\n[log]\nformat = \"json\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.engine.chunk_size, 4096);
        assert_eq!(config.engine.max_operations_per_batch, 16);
        assert_eq!(config.log.format, "json");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_keygen_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        cmd_keygen(&path, false).unwrap();
        let first = read_key(&path).unwrap();

        assert!(cmd_keygen(&path, false).is_err());
        cmd_keygen(&path, true).unwrap();
        assert_ne!(read_key(&path).unwrap(), first);
    }

    #[test]
    fn test_put_write_get() {
        let dir = TempDir::new().unwrap();
        let config = temp_config(&dir);
        let key_path = dir.path().join("key");
        cmd_keygen(&key_path, false).unwrap();

        let local = dir.path().join("input.bin");
        let original: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&local, &original).unwrap();
        cmd_put(&config, &local, &key_path, "cli-test").unwrap();

        let store = open_store(&config).unwrap();
        let ids = store.remote.list().unwrap();
        assert_eq!(ids.len(), 1);
        let id = ids[0].as_str().to_string();

        cmd_write(&config, &id, &key_path, 990, b"tail", true).unwrap();
        cmd_info(&config, &id, true).unwrap();

        let out = dir.path().join("output.bin");
        cmd_get(&config, &id, &key_path, Some(&out)).unwrap();
        let mut expected = original[..990].to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(std::fs::read(&out).unwrap(), expected);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = temp_config(&dir);
        let key_path = dir.path().join("key");
        let other_key = dir.path().join("other");
        cmd_keygen(&key_path, false).unwrap();
        cmd_keygen(&other_key, false).unwrap();

        let local = dir.path().join("input.bin");
        std::fs::write(&local, b"secret contents").unwrap();
        cmd_put(&config, &local, &key_path, "k").unwrap();
        let id = open_store(&config).unwrap().remote.list().unwrap()[0]
            .as_str()
            .to_string();

        let out = dir.path().join("out.bin");
        assert!(cmd_get(&config, &id, &other_key, Some(&out)).is_err());
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
