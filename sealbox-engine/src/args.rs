//! Command-line argument parsing

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use sealbox_common::{CIPHER_FORMAT, JobKey};
use sealbox_engine::config::{DecryptMode, EngineConfig};

/// Get default config path help text for current platform
fn default_config_help() -> String {
    #[cfg(target_os = "linux")]
    return "Config file path (default: ~/.config/sealbox/config.json)".to_string();

    #[cfg(target_os = "macos")]
    return "Config file path (default: ~/Library/Application Support/sealbox/config.json)"
        .to_string();

    #[cfg(target_os = "windows")]
    return "Config file path (default: %APPDATA%\\sealbox\\config.json)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Config file path (overrides platform default)".to_string();
}

/// Sealbox encrypted transfer daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path (overrides platform default)
    #[arg(short, long, help = default_config_help())]
    pub config: Option<PathBuf>,

    /// Data directory for the job store, downloads and decrypted files
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// User whose queue to serve
    #[arg(short, long)]
    pub user: Option<String>,

    /// Filehost receiving uploads
    #[arg(long)]
    pub filehost: Option<String>,

    /// Collection key as 64 hex characters
    #[arg(long)]
    pub key: Option<String>,

    /// Decryption strategy
    #[arg(long, value_enum)]
    pub decrypt_mode: Option<DecryptMode>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run the engine until interrupted
    Run,

    /// Encrypt and upload a file
    Upload {
        path: PathBuf,

        /// Destination directory in the collection
        #[arg(long, default_value = "/")]
        directory: String,

        /// Return once the job is queued
        #[arg(long, default_value = "false")]
        detach: bool,
    },

    /// Download and decrypt an object
    Download {
        content_id: String,

        /// Filehost holding the object
        #[arg(long)]
        host: String,

        /// Object key as hex
        #[arg(long)]
        object_key: String,

        /// Stream header as hex
        #[arg(long)]
        nonce: String,

        #[arg(long, default_value = CIPHER_FORMAT)]
        format: String,

        /// Expected ciphertext length
        #[arg(long)]
        size: Option<u64>,

        /// Output file (default: files directory under the data directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Announce the file for opening once decrypted
        #[arg(long, default_value = "false")]
        open: bool,

        /// Return once the job is queued
        #[arg(long, default_value = "false")]
        detach: bool,
    },

    /// List jobs
    List,

    /// Resume a paused or failed job (`upload:ID` or `download:CONTENT_ID`)
    Resume { job: JobArg },

    /// Stop a job and delete it (`upload:ID` or `download:CONTENT_ID`)
    Remove { job: JobArg },
}

/// Job reference as typed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobArg {
    Upload(i64),
    Download(String),
}

impl JobArg {
    /// Full job key for `user_id`
    pub fn key(&self, user_id: &str) -> JobKey {
        match self {
            Self::Upload(id) => JobKey::upload(*id),
            Self::Download(content_id) => JobKey::download(content_id, user_id),
        }
    }
}

impl FromStr for JobArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("upload", id)) => id
                .parse()
                .map(Self::Upload)
                .map_err(|_| format!("invalid upload id '{id}'")),
            Some(("download", content_id)) if !content_id.is_empty() => {
                Ok(Self::Download(content_id.to_string()))
            }
            _ => Err(format!(
                "expected upload:ID or download:CONTENT_ID, got '{s}'"
            )),
        }
    }
}

impl Args {
    /// Apply command-line overrides on top of a loaded config
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(user) = &self.user {
            config.user_id = user.clone();
        }
        if let Some(url) = &self.filehost {
            config.filehost_url = Some(url.clone());
        }
        if let Some(key) = &self.key {
            config.key = Some(key.clone());
        }
        if let Some(mode) = self.decrypt_mode {
            config.decrypt_mode = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_arg_parsing() {
        assert_eq!("upload:42".parse::<JobArg>(), Ok(JobArg::Upload(42)));
        assert_eq!(
            "download:c0ffee".parse::<JobArg>(),
            Ok(JobArg::Download("c0ffee".to_string()))
        );
        assert!("upload:x".parse::<JobArg>().is_err());
        assert!("download:".parse::<JobArg>().is_err());
        assert!("42".parse::<JobArg>().is_err());
    }

    #[test]
    fn test_job_arg_key_uses_user() {
        assert_eq!(
            JobArg::Download("c".to_string()).key("alice"),
            JobKey::download("c", "alice")
        );
        assert_eq!(JobArg::Upload(3).key("alice"), JobKey::upload(3));
    }

    #[test]
    fn test_overrides_replace_loaded_values() {
        let args = Args::parse_from([
            "sealboxd",
            "--user",
            "bob",
            "--filehost",
            "http://fh.local",
            "--decrypt-mode",
            "copy",
            "list",
        ]);
        let mut config = EngineConfig::default();
        args.apply(&mut config);

        assert_eq!(config.user_id, "bob");
        assert_eq!(config.filehost_url.as_deref(), Some("http://fh.local"));
        assert_eq!(config.decrypt_mode, DecryptMode::Copy);
        assert!(matches!(args.command, Cmd::List));
    }

    #[test]
    fn test_upload_defaults() {
        let args = Args::parse_from(["sealboxd", "upload", "/tmp/a.bin"]);
        match args.command {
            Cmd::Upload {
                path,
                directory,
                detach,
            } => {
                assert_eq!(path, PathBuf::from("/tmp/a.bin"));
                assert_eq!(directory, "/");
                assert!(!detach);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
