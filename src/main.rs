use anyhow::{bail, Context, Result};
use autotagger::autocomplete::AutocompleteClient;
use autotagger::client::{RequestEvent, RequestObserver};
use autotagger::config::{ConfigPatch, ConfigStore, SortingMode};
use autotagger::session::{Session, DEFAULT_PROBE_INTERVAL};
use autotagger::tags::{self, PageKind};
use autotagger::utils::parse_interval;
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autotagger")]
#[command(version)]
#[command(about = "Tag e621 uploads with a locally hosted AI tagger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate tags for an image (URL, data URL or local path)
    Tag {
        image: String,
        /// Current contents of the tag field
        #[arg(short, long, default_value = "")]
        existing: String,
        /// Page the tag field is on; enables constant tags
        #[arg(long)]
        page_url: Option<String>,
    },
    /// Check whether the AI endpoint is reachable
    Probe,
    /// Probe periodically and report connection changes
    Watch {
        /// Probe interval (e.g., "30s", "5m")
        #[arg(short, long, default_value = "30s")]
        interval: String,
    },
    /// Look up tag suggestions for a partial tag
    Suggest {
        term: String,
        /// Maximum number of suggestions
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Format a comma-separated tag list as the tag field would receive it
    Format {
        tags: String,
        #[arg(short, long, default_value = "")]
        existing: String,
    },
    /// Re-sort and clean up a tag field
    Sort { field: String },
    /// Apply the configured constant tags to a tag field
    Constant {
        #[arg(short, long, default_value = "")]
        existing: String,
        #[arg(long)]
        page_url: Option<String>,
    },
    /// Set the confidence threshold (0.1-1.0)
    Confidence { value: f64 },
    /// Inspect or change the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Edit settings interactively
    Settings,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current settings
    Show,
    /// Print the config file location
    Path,
    /// Set a single key
    Set { key: String, value: String },
}

/// Progress lines on stderr while a prediction runs
struct ConsoleObserver;

impl RequestObserver for ConsoleObserver {
    fn on_event(&self, event: &RequestEvent<'_>) {
        match event {
            RequestEvent::Started { attempt: 0 } => eprintln!("Generating tags..."),
            RequestEvent::Started { .. } => {}
            RequestEvent::Retrying {
                attempt,
                max_retries,
                error,
            } => eprintln!("  {} - retrying ({}/{})", error, attempt, max_retries),
            RequestEvent::Succeeded { attempts } if *attempts > 1 => {
                eprintln!("  Succeeded after {} attempts", attempts)
            }
            RequestEvent::Succeeded { .. } => {}
            RequestEvent::Failed { attempts, .. } => eprintln!("  Giving up after {} attempt(s)", attempts),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "autotagger=debug" } else { "autotagger=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = match &cli.config {
        Some(path) => ConfigStore::load_from(path),
        None => ConfigStore::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Commands::Tag {
            image,
            existing,
            page_url,
        } => {
            let session = Session::new(store).with_observer(Arc::new(ConsoleObserver));
            cmd_tag(&session, &image, &existing, page_url.as_deref()).await?;
        }
        Commands::Probe => {
            cmd_probe(&Session::new(store)).await?;
        }
        Commands::Watch { interval } => {
            let interval = parse_interval(&interval).unwrap_or(DEFAULT_PROBE_INTERVAL);
            cmd_watch(Arc::new(Session::new(store)), interval).await?;
        }
        Commands::Suggest { term, limit } => {
            let session = Session::new(store).with_autocomplete(AutocompleteClient::new().with_limit(limit));
            cmd_suggest(&session, &term).await;
        }
        Commands::Format { tags, existing } => {
            println!("{}", tags::format_tags(&tags, &existing, &store.snapshot()));
        }
        Commands::Sort { field } => {
            println!("{}", Session::new(store).reformat(&field));
        }
        Commands::Constant { existing, page_url } => {
            let page = page_url.as_deref().map(PageKind::from_url).unwrap_or_default();
            match Session::new(store).constant_tags(&existing, page) {
                Some(field) => println!("{}", field),
                None => {
                    eprintln!("No constant tags to apply");
                    println!("{}", existing);
                }
            }
        }
        Commands::Confidence { value } => {
            let applied = store.update_confidence(value).context("Failed to save confidence")?;
            println!("Confidence threshold: {:.2}", applied);
        }
        Commands::Config { action } => {
            cmd_config(&store, action)?;
        }
        Commands::Settings => {
            cmd_settings(&Session::new(store)).await?;
        }
    }

    Ok(())
}

async fn cmd_tag(session: &Session, image: &str, existing: &str, page_url: Option<&str>) -> Result<()> {
    let field = match page_url.map(PageKind::from_url) {
        Some(page) => session.constant_tags(existing, page).unwrap_or_else(|| existing.to_string()),
        None => existing.to_string(),
    };

    let tags = session.generate(image, &field).await?;
    println!("{}", tags);
    eprintln!("{}", session.tracker().status().notice());
    Ok(())
}

async fn cmd_probe(session: &Session) -> Result<()> {
    let endpoint = session.config().display_endpoint().to_string();
    if session.probe().await {
        println!("Connected to {}", endpoint);
        Ok(())
    } else {
        bail!("Could not reach AI endpoint at {}", endpoint);
    }
}

async fn cmd_watch(session: Arc<Session>, interval: std::time::Duration) -> Result<()> {
    let mut changes = session.tracker().subscribe();
    let probes = session.clone().spawn_probe_loop(interval);

    println!(
        "Watching {} every {}s (Ctrl+C to stop)",
        session.config().display_endpoint(),
        interval.as_secs()
    );
    println!("{}", session.tracker().status().notice());

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *changes.borrow_and_update();
                println!(
                    "[{}] {} - {}",
                    chrono::Local::now().format("%H:%M:%S"),
                    status.action_label(),
                    status.notice()
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    probes.abort();
    Ok(())
}

async fn cmd_suggest(session: &Session, term: &str) {
    let suggestions = session.suggest(term).await;
    if suggestions.is_empty() {
        eprintln!("No suggestions for '{}'", term);
        return;
    }

    for tag in suggestions {
        match &tag.antecedent_name {
            Some(alias) => println!(
                "{:<40} {:>9}  {:<10} (alias of {})",
                tag.name,
                tag.post_count,
                tag.category().name(),
                alias
            ),
            None => println!("{:<40} {:>9}  {}", tag.name, tag.post_count, tag.category().name()),
        }
    }
}

fn cmd_config(store: &ConfigStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = store.snapshot();
            let mut shown = config.clone();
            shown.local_endpoint = config.display_endpoint().to_string();
            print!("{}", toml::to_string_pretty(&shown)?);
        }
        ConfigAction::Path => match store.path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(in memory)"),
        },
        ConfigAction::Set { key, value } => {
            let patch = ConfigPatch::parse_setting(&key, &value)?;
            store.save(patch).with_context(|| format!("Failed to save {}", key))?;
            println!("Saved {}", key);
        }
    }
    Ok(())
}

async fn cmd_settings(session: &Session) -> Result<()> {
    let config = session.config();

    let mut edited = config.clone();
    edited.local_endpoint = Input::new()
        .with_prompt("AI endpoint")
        .with_initial_text(config.display_endpoint())
        .interact_text()?;
    edited.confidence = Input::new()
        .with_prompt("Confidence threshold (0.1-1.0)")
        .default(config.confidence)
        .interact_text()?;
    edited.tag_blacklist = Input::new()
        .with_prompt("Tag blacklist (comma separated)")
        .with_initial_text(config.tag_blacklist.clone())
        .allow_empty(true)
        .interact_text()?;
    edited.constant_tags = Input::new()
        .with_prompt("Constant tags (comma separated)")
        .with_initial_text(config.constant_tags.clone())
        .allow_empty(true)
        .interact_text()?;
    edited.request_timeout_ms = Input::new()
        .with_prompt("Request timeout (ms)")
        .default(config.request_timeout_ms)
        .interact_text()?;
    edited.max_retries = Input::new()
        .with_prompt("Max retries")
        .default(config.max_retries)
        .interact_text()?;
    edited.preserve_existing_tags = Confirm::new()
        .with_prompt("Preserve existing tags?")
        .default(config.preserve_existing_tags)
        .interact()?;
    edited.sort_tags_alphabetically = Confirm::new()
        .with_prompt("Sort tags alphabetically?")
        .default(config.sort_tags_alphabetically)
        .interact()?;
    edited.enable_auto_tag_on_edit = Confirm::new()
        .with_prompt("Apply constant tags on post edit pages?")
        .default(config.enable_auto_tag_on_edit)
        .interact()?;

    let modes: Vec<&str> = SortingMode::ALL.iter().map(|m| m.display_name()).collect();
    let current = SortingMode::ALL
        .iter()
        .position(|m| *m == config.sorting_mode)
        .unwrap_or(0);
    edited.sorting_mode = SortingMode::ALL[Select::new()
        .with_prompt("Tag layout")
        .items(&modes)
        .default(current)
        .interact()?];

    let endpoint = edited.local_endpoint.clone();
    let patch = ConfigPatch::from(&edited);

    let actions = ["Save", "Test connection", "Cancel"];
    loop {
        let choice = Select::new().items(&actions).default(0).interact()?;
        match choice {
            0 => {
                session.store().save(patch).context("Failed to save settings")?;
                println!("Settings saved");
                return Ok(());
            }
            1 => match session.check_endpoint(&endpoint).await {
                Ok(()) => println!("Connection successful"),
                Err(e) => println!("Connection failed: {}", e),
            },
            _ => {
                println!("Settings discarded");
                return Ok(());
            }
        }
    }
}
