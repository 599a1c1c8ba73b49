#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, warn};

use hostmux::remote::credentials::AuthKind;
use hostmux::remote::prefs::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
use hostmux::remote::transport::ssh::SshTransport;
use hostmux::remote::{
    ConnectOutcome, ConnectionManager, HostId, MuxConfig, TaskError, UploadRequest,
};

#[derive(Parser)]
#[command(name = "hostmux", version, about = "File operations over pooled SSH/SFTP connections")]
struct Cli {
    /// Remote host as user@host[:port]
    host: String,

    #[arg(long, env = "HOSTMUX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "HOSTMUX_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Preference file holding credentials and recent hosts
    #[arg(long, env = "HOSTMUX_PREFS")]
    prefs: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory in the metadata text form
    Ls { path: String },
    /// Show one entry in the metadata text form
    Stat {
        path: String,
        /// Do not follow a final symlink
        #[arg(long)]
        no_follow: bool,
    },
    /// Download a remote file
    Get { remote: String, local: PathBuf },
    /// Upload a local file
    Put {
        local: PathBuf,
        remote: String,
        /// Permission bits to apply, octal (e.g. 755)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
        /// Skip the transfer when the remote MD5 matches
        #[arg(long)]
        sync: bool,
        /// Write to a temporary name and rename into place
        #[arg(long)]
        atomic: bool,
    },
    /// Rename a remote path
    Mv { from: String, to: String },
}

fn parse_mode(text: &str) -> Result<u32, String> {
    u32::from_str_radix(text, 8).map_err(|e| format!("invalid octal mode '{}': {}", text, e))
}

fn open_prefs(path: Option<PathBuf>) -> Arc<dyn PreferenceStore> {
    let path = path.or_else(|| {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".hostmux").join("prefs.json"))
    });
    match path.map(JsonFilePreferences::open) {
        Some(Ok(prefs)) => Arc::new(prefs),
        Some(Err(e)) => {
            warn!("preference file unusable, keeping settings in memory: {}", e);
            Arc::new(MemoryPreferences::new())
        }
        None => Arc::new(MemoryPreferences::new()),
    }
}

async fn run(manager: &ConnectionManager, host: &HostId, command: Command) -> Result<(), TaskError> {
    let files = manager.files(host)?;
    match command {
        Command::Ls { path } => {
            for entry in files.list_dir(path).await? {
                println!("{}", entry.to_external_form());
            }
        }
        Command::Stat { path, no_follow } => {
            let info = if no_follow {
                files.lstat(path).await?
            } else {
                files.stat(path).await?
            };
            println!("{}", info.to_external_form());
        }
        Command::Get { remote, local } => {
            let bytes = files.download(remote, local).await?;
            info!(bytes, "download complete");
        }
        Command::Put {
            local,
            remote,
            mode,
            sync,
            atomic,
        } => {
            let mut request = UploadRequest::new(local, remote).with_stat();
            if let Some(mode) = mode {
                request = request.with_mask(mode);
            }
            if sync {
                request = request.with_md5_check();
            }
            if atomic {
                request = request.atomic();
            }
            let outcome = files.upload(request).await?;
            match serde_json::to_string(&outcome) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("could not render upload outcome: {}", e),
            }
        }
        Command::Mv { from, to } => files.rename(from, to).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let host = match HostId::parse(&cli.host) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("hostmux: {}", e);
            return ExitCode::from(64);
        }
    };

    let config = MuxConfig::from_env();
    let transport = Arc::new(SshTransport::new(&config));
    let manager = match ConnectionManager::builder(transport)
        .config(config)
        .preferences(open_prefs(cli.prefs))
        .build()
    {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("hostmux: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(key_file) = cli.key_file {
        manager.credentials().set_kind(&host, AuthKind::KeyFile);
        manager.credentials().set_key_file(&host, Some(key_file));
    } else if cli.password.is_some() {
        manager.credentials().set_kind(&host, AuthKind::Password);
    }
    if let Some(password) = cli.password {
        manager.vault().put(&host, password, false);
    }
    manager.credentials().store(&host);

    let code = match manager.connect(&host).await {
        ConnectOutcome::Connected => match run(&manager, &host, cli.command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("hostmux: {}", e);
                ExitCode::from(e.kind.exit_code() as u8)
            }
        },
        ConnectOutcome::Cancelled => ExitCode::from(130),
        ConnectOutcome::Failed(failure) => {
            eprintln!("hostmux: {}", failure);
            ExitCode::from(if failure.is_authentication() { 77 } else { 69 })
        }
    };

    manager.shutdown().await;
    code
}
