use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use prompt_rules::config::RulesConfig;
use prompt_rules::logging;
use prompt_rules::{
    AccessRule, AccessRuleDb, AccessRuleError, Lifespan, Outcome, Permission, RuleContents, RuleService,
    RuleServiceHandle, RuleUpdate,
};

#[derive(Debug, Parser)]
#[command(name = "prompt-rules", version, about = "Inspect and edit prompting access rules")]
struct Cli {
    /// Rule file (overrides config and PROMPT_RULES_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List rules of a user
    List {
        #[arg(long)]
        user: u32,
        #[arg(long)]
        snap: Option<String>,
        #[arg(long)]
        app: Option<String>,
        /// Print rules as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a rule
    Add(AddArgs),
    /// Modify a rule
    Modify(ModifyArgs),
    /// Delete a rule
    Delete {
        #[arg(long)]
        user: u32,
        id: String,
    },
    /// Decide whether an access would be allowed
    Check {
        #[arg(long)]
        user: u32,
        #[arg(long)]
        snap: String,
        #[arg(long)]
        app: String,
        #[arg(long)]
        permission: Permission,
        path: String,
    },
    /// Remove expired timespan rules
    Prune,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    user: u32,
    #[arg(long)]
    snap: String,
    #[arg(long)]
    app: String,
    #[arg(long)]
    pattern: String,
    #[arg(long)]
    outcome: Outcome,
    #[arg(long, default_value = "forever")]
    lifespan: Lifespan,
    /// Duration such as 30m or 1h30m, for timespan rules
    #[arg(long)]
    duration: Option<String>,
    /// Comma separated permissions
    #[arg(long, value_delimiter = ',', required = true)]
    permissions: Vec<Permission>,
}

#[derive(Debug, Args)]
struct ModifyArgs {
    #[arg(long)]
    user: u32,
    id: String,
    #[arg(long)]
    pattern: Option<String>,
    #[arg(long)]
    outcome: Option<Outcome>,
    #[arg(long)]
    lifespan: Option<Lifespan>,
    #[arg(long)]
    duration: Option<String>,
    #[arg(long, value_delimiter = ',')]
    permissions: Vec<Permission>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RulesConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RulesConfig::from_env(),
    };
    if let Some(db) = &cli.db {
        config = config.with_db_path(db);
    }
    if cli.verbose {
        config.logging = config.logging.with_level("debug");
    }

    let _log_guard = logging::init_logging(&config.logging)?;
    tracing::debug!("Using rule file {}", config.db_path.display());

    let db = AccessRuleDb::open(&config.db_path)
        .with_context(|| format!("failed to open rule file {}", config.db_path.display()))?;
    let (handle, service) = RuleService::spawn(db, config.channel_size);

    let result = run_command(&handle, cli.command).await;

    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Rule service already stopped: {}", e);
    }
    service.await.context("rule service task failed")?;
    result
}

async fn run_command(handle: &RuleServiceHandle, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List { user, snap, app, json } => {
            let rules = handle.list(user, snap, app).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else if rules.is_empty() {
                println!("{}", "No rules".dimmed());
            } else {
                for rule in &rules {
                    print_rule(rule);
                }
            }
        }
        Commands::Add(args) => {
            let contents = RuleContents {
                path_pattern: args.pattern,
                outcome: args.outcome,
                lifespan: args.lifespan,
                duration: args.duration,
                permissions: args.permissions,
            };
            let rule = handle
                .create_rule(args.user, args.snap, args.app, contents)
                .await
                .context("failed to add rule")?;
            println!("{} {}", "Added".green().bold(), rule.id);
            print_rule(&rule);
        }
        Commands::Modify(args) => {
            let update = RuleUpdate {
                path_pattern: args.pattern,
                outcome: args.outcome,
                lifespan: args.lifespan,
                duration: args.duration,
                permissions: Some(args.permissions),
            };
            let rule = handle
                .modify_rule(args.user, args.id, update)
                .await
                .context("failed to modify rule")?;
            println!("{} {}", "Modified".green().bold(), rule.id);
            print_rule(&rule);
        }
        Commands::Delete { user, id } => {
            let rule = handle
                .delete_rule(user, id)
                .await
                .context("failed to delete rule")?;
            println!("{} {}", "Deleted".yellow().bold(), rule.id);
        }
        Commands::Check {
            user,
            snap,
            app,
            permission,
            path,
        } => match handle.is_allowed(user, snap, app, path.as_str(), permission).await {
            Ok(true) => println!("{} {} {}", "allow".green().bold(), permission, path),
            Ok(false) => println!("{} {} {}", "deny".red().bold(), permission, path),
            Err(AccessRuleError::NoMatchingRule) => {
                println!("{} {} {}", "no matching rule".yellow(), permission, path)
            }
            Err(e) => return Err(e).context("failed to check access"),
        },
        Commands::Prune => {
            let pruned = handle.prune_expired().await?;
            println!("{} {} expired rules", "Pruned".yellow().bold(), pruned.len());
            for rule in &pruned {
                print_rule(rule);
            }
        }
    }
    Ok(())
}

fn print_rule(rule: &AccessRule) {
    let outcome = match rule.outcome {
        Outcome::Allow => rule.outcome.as_str().green().bold(),
        Outcome::Deny => rule.outcome.as_str().red().bold(),
    };
    let lifespan = match (rule.lifespan, rule.expiration) {
        (Lifespan::Timespan, Some(expiration)) => format!("until {}", expiration.to_rfc3339()),
        (lifespan, _) => lifespan.to_string(),
    };
    let permissions: Vec<&str> = rule.permissions.iter().map(|p| p.as_str()).collect();

    println!("{}  {} {}", rule.id.dimmed(), outcome, rule.path_pattern.bold());
    println!(
        "    {}.{} (user {}), {}, [{}]",
        rule.snap,
        rule.app,
        rule.user,
        lifespan,
        permissions.join(", ")
    );
}
