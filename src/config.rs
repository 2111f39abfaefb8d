use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "RECORDING_INGEST_";
const MIB: u64 = 1024 * 1024;

/// Which object store implementation backs chunk and recording objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Sharded directory tree on local disk.
    Local { storage_dir: String },
    /// S3 or an S3-compatible endpoint (MinIO, LocalStack).
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageBackend,
    pub ingest: IngestSettings,
    pub transcription: ServiceEndpoint,
    pub analysis: ServiceEndpoint,
    pub jobs: JobSettings,
    pub max_chunk_bytes: usize,
}

/// Tunables of the chunk pipeline itself.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Recordings at or above this many bytes are reassembled with a
    /// multipart upload; smaller ones are concatenated in memory.
    pub concat_threshold_bytes: u64,
    /// Lower bound the backend enforces on every non-final multipart part.
    pub min_part_size_bytes: u64,
    /// Number of untranscribed chunks that triggers a preliminary batch.
    pub transcription_batch_size: usize,
    pub presign_ttl: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            concat_threshold_bytes: 10 * MIB,
            min_part_size_bytes: 5 * MIB,
            transcription_batch_size: 3,
            presign_ttl: Duration::from_secs(3600),
        }
    }
}

/// Location and credential of an external HTTP collaborator.
#[derive(Debug, Clone, Default)]
pub struct ServiceEndpoint {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub poll_interval: Duration,
    pub lease: Duration,
    pub max_attempts: i64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked audio recording ingest service")]
pub struct Args {
    /// Host to bind to (overrides RECORDING_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RECORDING_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides RECORDING_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend, `local` or `s3` (overrides RECORDING_INGEST_STORAGE)
    #[arg(long)]
    pub storage: Option<String>,

    /// Directory for the local backend (overrides RECORDING_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket for the s3 backend (overrides RECORDING_INGEST_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Recordings this size or larger use multipart reassembly
    #[arg(long)]
    pub concat_threshold_bytes: Option<u64>,

    /// Chunks that trigger a preliminary transcription batch
    #[arg(long)]
    pub transcription_batch_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Issue an API token for the given owner, print it and exit
    #[arg(long, value_name = "OWNER")]
    pub issue_token: Option<String>,
}

/// One-shot administrative action requested on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Migrate,
    IssueToken(String),
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the requested command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge CLI arguments over values returned by `lookup` (environment
    /// variable name -> value) over built-in defaults.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<(Self, Command)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let env_host = var("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&var, "PORT")?.unwrap_or(3000);
        let env_db =
            var("DATABASE_URL").unwrap_or_else(|| "sqlite://./data/meta/ingest.db".into());

        let backend = args
            .storage
            .or(var("STORAGE"))
            .unwrap_or_else(|| "local".into());
        let storage = match backend.to_ascii_lowercase().as_str() {
            "local" => StorageBackend::Local {
                storage_dir: args
                    .storage_dir
                    .or(var("STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/objects".into()),
            },
            "s3" => StorageBackend::S3 {
                bucket: args
                    .s3_bucket
                    .or(var("S3_BUCKET"))
                    .context("s3 storage requires RECORDING_INGEST_S3_BUCKET or --s3-bucket")?,
                region: var("S3_REGION"),
                endpoint: var("S3_ENDPOINT"),
            },
            other => bail!("unknown storage backend `{}`", other),
        };

        let defaults = IngestSettings::default();
        let ingest = IngestSettings {
            concat_threshold_bytes: args
                .concat_threshold_bytes
                .or(parse_var(&var, "CONCAT_THRESHOLD_BYTES")?)
                .unwrap_or(defaults.concat_threshold_bytes),
            min_part_size_bytes: parse_var(&var, "MIN_PART_SIZE_BYTES")?
                .unwrap_or(defaults.min_part_size_bytes),
            transcription_batch_size: args
                .transcription_batch_size
                .or(parse_var(&var, "TRANSCRIPTION_BATCH_SIZE")?)
                .unwrap_or(defaults.transcription_batch_size),
            presign_ttl: parse_var(&var, "PRESIGN_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.presign_ttl),
        };

        if ingest.transcription_batch_size == 0 {
            bail!("transcription batch size must be at least 1");
        }

        let job_defaults = JobSettings::default();
        let jobs = JobSettings {
            poll_interval: parse_var(&var, "JOB_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(job_defaults.poll_interval),
            lease: job_defaults.lease,
            max_attempts: parse_var(&var, "JOB_MAX_ATTEMPTS")?
                .unwrap_or(job_defaults.max_attempts),
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage,
            ingest,
            transcription: ServiceEndpoint {
                url: var("TRANSCRIPTION_URL"),
                api_key: var("TRANSCRIPTION_API_KEY"),
            },
            analysis: ServiceEndpoint {
                url: var("ANALYSIS_URL"),
                api_key: var("ANALYSIS_API_KEY"),
            },
            jobs,
            max_chunk_bytes: parse_var(&var, "MAX_CHUNK_BYTES")?
                .unwrap_or(64 * MIB as usize),
        };

        let command = if let Some(owner) = args.issue_token {
            Command::IssueToken(owner)
        } else if args.migrate {
            Command::Migrate
        } else {
            Command::Serve
        };

        Ok((cfg, command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{}`", value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let (cfg, command) = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(command, Command::Serve);
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.ingest.concat_threshold_bytes, 10 * MIB);
        assert_eq!(cfg.ingest.min_part_size_bytes, 5 * MIB);
        assert_eq!(
            cfg.storage,
            StorageBackend::Local {
                storage_dir: "./data/objects".into()
            }
        );
        assert!(cfg.transcription.url.is_none());
    }

    #[test]
    fn cli_overrides_env() {
        let args = Args {
            port: Some(8080),
            concat_threshold_bytes: Some(42),
            ..Default::default()
        };
        let env = env_of(&[
            ("RECORDING_INGEST_PORT", "9000"),
            ("RECORDING_INGEST_CONCAT_THRESHOLD_BYTES", "7"),
            ("RECORDING_INGEST_TRANSCRIPTION_BATCH_SIZE", "5"),
        ]);
        let (cfg, _) = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ingest.concat_threshold_bytes, 42);
        assert_eq!(cfg.ingest.transcription_batch_size, 5);
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let env = env_of(&[("RECORDING_INGEST_STORAGE", "s3")]);
        assert!(AppConfig::resolve(Args::default(), env).is_err());

        let env = env_of(&[
            ("RECORDING_INGEST_STORAGE", "s3"),
            ("RECORDING_INGEST_S3_BUCKET", "recordings"),
            ("RECORDING_INGEST_S3_REGION", "us-east-1"),
        ]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();
        assert_eq!(
            cfg.storage,
            StorageBackend::S3 {
                bucket: "recordings".into(),
                region: Some("us-east-1".into()),
                endpoint: None,
            }
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let env = env_of(&[("RECORDING_INGEST_TRANSCRIPTION_BATCH_SIZE", "0")]);
        let err = AppConfig::resolve(Args::default(), env).unwrap_err();
        assert!(err.to_string().contains("batch size"));

        let args = Args {
            transcription_batch_size: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::resolve(args, env_of(&[])).is_err());
    }

    #[test]
    fn invalid_numeric_env_is_an_error() {
        let env = env_of(&[("RECORDING_INGEST_PORT", "not-a-port")]);
        let err = AppConfig::resolve(Args::default(), env).unwrap_err();
        assert!(err.to_string().contains("RECORDING_INGEST_PORT"));
    }

    #[test]
    fn issue_token_takes_precedence_over_migrate() {
        let args = Args {
            migrate: true,
            issue_token: Some("alice".into()),
            ..Default::default()
        };
        let (_, command) = AppConfig::resolve(args, env_of(&[])).unwrap();
        assert_eq!(command, Command::IssueToken("alice".into()));
    }
}
