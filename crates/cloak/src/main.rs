//! cloak - Local secrets vault
//!
//! Per-project encrypted secrets, injected into the commands that need them.
//!
//! Commands:
//! - init: Create the vault and a master key for this directory
//! - set <KEY> [VALUE]: Store a secret (prompts if no value)
//! - unset <KEY>: Remove a secret
//! - list: List secret names
//! - run -- <CMD>: Run a command with secrets in its environment
//! - forget: Remove this directory's master key from this machine
//! - scope: Show the key scope for this directory

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cloak::{generate_key, inject, Error, KeyResolver, MasterKey, SecretMap, VaultStore};
use cloak_core::{Config, Paths};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloak")]
#[command(about = "Local secrets vault - encrypted per-project secrets injected into child processes")]
#[command(version)]
#[command(after_help = r#"MASTER KEY:
    Each project directory has its own master key. It is looked up in:
    1. CLOAK_MASTER_KEY (if set)
    2. The system keyring
    3. ~/.cloak/keys.json (fallback when no keyring is available)

SECURITY:
    - Secrets are encrypted with AES-256-GCM in cloak.encrypted
    - The fallback key file is plaintext, readable only by you
    - Secret values are never logged"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an encrypted vault and master key for this directory
    Init,

    /// Add or update a secret (prompts securely if value not provided)
    Set {
        /// Secret name, used as the environment variable name
        key: String,
        /// Secret value (omit for secure hidden prompt)
        value: Option<String>,
    },

    /// Remove a secret
    Unset {
        /// Secret name
        key: String,
    },

    /// List stored secret names (values hidden)
    List {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Run a command with secrets injected as environment variables
    Run {
        /// Command to run with secrets in environment
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Remove this directory's master key from the keyring and fallback file
    Forget,

    /// Show the key scope for this directory
    Scope,
}

/// Everything a command needs, resolved once
struct App {
    cwd: PathBuf,
    config: Config,
    resolver: KeyResolver,
    vault: VaultStore,
}

impl App {
    fn new() -> Result<Self> {
        let paths = Paths::new();
        let config = Config::load(&paths.config_file())?;
        let cwd = std::env::current_dir().context("Failed to read current directory")?;

        let resolver = KeyResolver::from_config(&config, &paths);
        let vault = VaultStore::new(config.vault_path(&cwd));

        Ok(Self {
            cwd,
            config,
            resolver,
            vault,
        })
    }

    /// Resolve the master key or explain how to get one and exit
    fn require_key(&self) -> Result<MasterKey> {
        match self.resolver.resolve(&self.cwd) {
            Ok(key) => Ok(key),
            Err(Error::KeyNotFound { scope }) => {
                eprintln!("error: Master key not found (scope {})", scope);
                eprintln!("  cloak cannot decrypt your secrets without the key.");
                eprintln!();
                eprintln!("  Solution 1: Run 'cloak init' to generate and save a key.");
                eprintln!("  Solution 2: Set 'export {}=...' manually.", self.config.env_var);
                std::process::exit(1);
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_secrets(&self, key: &MasterKey) -> Result<SecretMap> {
        self.vault
            .load(key.as_hex())
            .with_context(|| format!("Failed to load {}", self.vault.path().display()))
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::new()?;

    match cli.command {
        Some(Commands::Init) => cmd_init(&app),
        Some(Commands::Set { key, value }) => cmd_set(&app, &key, value),
        Some(Commands::Unset { key }) => cmd_unset(&app, &key),
        Some(Commands::List { json }) => cmd_list(&app, json),
        Some(Commands::Run { command }) => cmd_run(&app, &command),
        Some(Commands::Forget) => cmd_forget(&app),
        Some(Commands::Scope) => cmd_scope(&app),
        None => {
            // Default to listing secrets
            cmd_list(&app, false)
        }
    }
}

/// Create the vault and store a fresh master key
fn cmd_init(app: &App) -> Result<()> {
    if app.vault.exists() {
        bail!(
            "'{}' already exists. Aborting to prevent overwrite.",
            app.vault.path().display()
        );
    }

    let key = generate_key()?;
    app.vault.init(key.as_hex())?;

    println!("success: Vault initialized");
    println!("Here is your MASTER KEY. Save it somewhere safe!");
    println!();
    println!("  {}", key.as_hex());
    println!();

    match app.resolver.store(&app.cwd, &key) {
        Ok(location) => {
            println!("Master key saved to {}.", location);
            println!("(You don't need to set {} manually)", app.config.env_var);
        }
        Err(e) => {
            println!("warning: Could not save master key: {}", e);
            println!("Set it manually: export {}=...", app.config.env_var);
        }
    }

    Ok(())
}

/// Add or update a secret
fn cmd_set(app: &App, name: &str, value: Option<String>) -> Result<()> {
    if name.is_empty() {
        bail!("Secret name cannot be empty");
    }

    // Get value - prompt if not provided
    let value = match value {
        Some(v) => v,
        None => rpassword::prompt_password(format!("Value for {}: ", name))
            .context("Failed to read secret value")?,
    };

    let key = app.require_key()?;
    app.vault
        .update(key.as_hex(), |secrets| {
            secrets.insert(name.to_string(), value);
        })
        .with_context(|| format!("Failed to update {}", app.vault.path().display()))?;

    println!("success: Set {}", name);
    Ok(())
}

/// Remove a secret
fn cmd_unset(app: &App, name: &str) -> Result<()> {
    let key = app.require_key()?;
    let removed = app
        .vault
        .update(key.as_hex(), |secrets| secrets.remove(name).is_some())
        .with_context(|| format!("Failed to update {}", app.vault.path().display()))?;

    if removed {
        println!("success: Removed {}", name);
    } else {
        println!("warning: {} was not set", name);
    }
    Ok(())
}

/// List secret names
fn cmd_list(app: &App, json: bool) -> Result<()> {
    let key = app.require_key()?;
    let secrets = app.load_secrets(&key)?;

    if json {
        let names: Vec<&str> = secrets.keys().map(String::as_str).collect();
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    if secrets.is_empty() {
        println!("No secrets stored. Add one with: cloak set <KEY> <VALUE>");
        return Ok(());
    }

    println!("Stored Secrets");
    println!();

    for name in secrets.keys() {
        println!("  {}", name);
    }

    Ok(())
}

/// Run a command with secrets injected, exiting with its status
fn cmd_run(app: &App, command: &[String]) -> Result<()> {
    let key = app.require_key()?;
    let secrets = app.load_secrets(&key)?;

    eprintln!(
        "[cloak] Injecting {} secrets into {}",
        secrets.len(),
        command.join(" ")
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(inject::run(command, &secrets));
    drop(rt);

    match result {
        Ok(()) => Ok(()),
        Err(Error::ChildExit { code }) => std::process::exit(code),
        Err(err @ Error::StartFailure { .. }) => {
            if let Some(program) = command.first().filter(|p| p.contains(' ')) {
                eprintln!("hint: It looks like you passed the command as a single quoted string.");
                eprintln!("      Try removing the quotes: cloak run -- {}", program);
                eprintln!();
            }
            Err(err).context("Command execution failed")
        }
        Err(err) => Err(err).context("Command execution failed"),
    }
}

/// Forget this directory's master key
fn cmd_forget(app: &App) -> Result<()> {
    app.resolver.forget(&app.cwd)?;
    println!("success: Master key removed for {}", app.cwd.display());
    println!("The vault file is untouched; keep a copy of the key if you still need it.");
    Ok(())
}

/// Show the key scope for this directory
fn cmd_scope(app: &App) -> Result<()> {
    println!("{}", app.resolver.scope(&app.cwd)?);
    Ok(())
}
