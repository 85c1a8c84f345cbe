use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use burrow_crypto::SigningKey;
use burrow_firehose::EventBus;
use burrow_repo::{CommitRef, RepoManager};
use burrow_server::handler::account::generate_did;
use burrow_server::{PdsServer, ServerConfig};
use burrow_store::RedbStorage;
use burrow_types::{Did, Handle, TidClock};
use colored::Colorize;
use serde_json::json;
use tracing::info;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        config,
        data_dir,
        format,
        ..
    } = cli;
    let config = load_config(config.as_deref(), data_dir)?;
    match command {
        Command::Serve(args) => cmd_serve(config, args),
        Command::CreateAccount(args) => cmd_create_account(&config, args, &format),
        Command::GenKey => cmd_gen_key(&format),
        Command::Export(args) => cmd_export(&config, args),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    Ok(config)
}

/// Open the configured database for offline commands.
fn open_manager(config: &ServerConfig) -> anyhow::Result<RepoManager> {
    let Some(path) = config.database_path() else {
        bail!("no data directory configured; pass --data-dir or set data_dir");
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let storage = RedbStorage::persistent(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(RepoManager::new(
        Arc::new(storage),
        Arc::new(EventBus::default()),
        Arc::new(TidClock::random()),
    ))
}

fn cmd_serve(mut config: ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.bind_addr = bind.parse().with_context(|| format!("bad bind address {bind}"))?;
    }
    if config.admin_token.is_none() {
        info!("no admin token configured; account creation over XRPC is disabled");
    }
    let server = PdsServer::new(config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server.serve())?;
    Ok(())
}

fn cmd_create_account(config: &ServerConfig, args: CreateAccountArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let handle = Handle::parse(args.handle)?;
    let did = match args.did {
        Some(did) => Did::parse(did)?,
        None => generate_did()?,
    };
    let key = match args.key {
        Some(hex) => SigningKey::from_hex(&hex)?,
        None => SigningKey::generate(),
    };
    let commit = create_account(config, &did, &handle, &key)?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "did": did.to_string(),
                "handle": handle.to_string(),
                "signingKey": key.to_hex(),
                "commit": commit.cid.to_string(),
                "rev": commit.rev.to_string(),
            })
        ),
        OutputFormat::Text => {
            println!("{} Created account {}", "✓".green().bold(), handle.to_string().bold());
            println!("  DID: {}", did.to_string().cyan());
            println!("  Commit: {} (rev {})", commit.cid.to_string().yellow(), commit.rev);
            println!("  Signing key: {}", key.to_hex().dimmed());
        }
    }
    Ok(())
}

fn create_account(config: &ServerConfig, did: &Did, handle: &Handle, key: &SigningKey) -> anyhow::Result<CommitRef> {
    let manager = open_manager(config)?;
    Ok(manager.create_repo(did, handle, key)?)
}

fn cmd_gen_key(format: &OutputFormat) -> anyhow::Result<()> {
    let key = SigningKey::generate();
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "signingKey": key.to_hex(), "publicKey": key.verifying_key().to_hex() })
        ),
        OutputFormat::Text => {
            println!("Signing key: {}", key.to_hex().yellow());
            println!("Public key:  {}", key.verifying_key().to_hex().cyan());
        }
    }
    Ok(())
}

fn cmd_export(config: &ServerConfig, args: ExportArgs) -> anyhow::Result<()> {
    let did = Did::parse(args.did)?;
    let bytes = export(config, &did, &args.out)?;
    println!("{} Wrote {} bytes to {}", "✓".green().bold(), bytes, args.out.display());
    Ok(())
}

fn export(config: &ServerConfig, did: &Did, out: &Path) -> anyhow::Result<usize> {
    let manager = open_manager(config)?;
    let car = manager.export_repo(did)?;
    std::fs::write(out, &car).with_context(|| format!("writing {}", out.display()))?;
    info!(%did, bytes = car.len(), "repository exported");
    Ok(car.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_repo::CarReader;

    #[test]
    fn create_then_export() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(None, Some(dir.path().to_path_buf())).unwrap();
        let did = Did::parse("did:example:alice").unwrap();
        let handle = Handle::parse("alice.test").unwrap();

        let commit = create_account(&config, &did, &handle, &SigningKey::generate()).unwrap();
        let out = dir.path().join("alice.car");
        let written = export(&config, &did, &out).unwrap();

        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(bytes.len(), written);
        let car = CarReader::parse(&bytes).unwrap();
        assert_eq!(car.roots(), &[commit.cid]);
        assert!(car.get(&commit.cid).is_some());
    }

    #[test]
    fn offline_commands_need_a_data_dir() {
        let config = load_config(None, None).unwrap();
        let did = Did::parse("did:example:alice").unwrap();
        assert!(export(&config, &did, Path::new("unused.car")).is_err());
    }

    #[test]
    fn config_file_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.toml");
        std::fs::write(&path, "hostname = \"pds.example\"\ndata_dir = \"/srv/burrow\"\n").unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.hostname, "pds.example");
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/burrow")));

        let config = load_config(Some(&path), Some(PathBuf::from("/elsewhere"))).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/elsewhere")));
    }
}
