use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info};
use serde::Serialize;

use tandem::authority::{
    Ack, JoinRequested, PendingRequests, RenamedSession, SessionList, SessionMembers,
    SessionView, SessionWithCode, UpdatedMember,
};
use tandem::config::{self, APP_NAME, AppConfig, AppPaths};
use tandem::session::{Decision, JoinDecision, Membership, Session};
use tandem::{
    AccessControlGateway, AccessError, AccountId, Capability, Database, ErrorKind, ErrorResponse,
    PermissionGrant, Sourced,
};

fn main() {
    let cli = Cli::parse();
    let json = cli.common.json;

    if let Err(err) = try_main(cli) {
        report_error(&err, json);
        std::process::exit(1);
    }
}

fn try_main(cli: Cli) -> Result<()> {
    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Accounts { command } => run_async(ctx, Operation::Accounts(command)),
        Command::Sessions { command } => run_async(ctx, Operation::Sessions(command)),
        Command::Remote { command } => handle_remote(&ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

enum Operation {
    Accounts(AccountsCommand),
    Sessions(SessionsCommand),
}

#[tokio::main]
async fn run_async(ctx: RuntimeContext, operation: Operation) -> Result<()> {
    let gateway = ctx.open_gateway().await?;
    match operation {
        Operation::Accounts(cmd) => handle_accounts(&ctx, &gateway, cmd).await,
        Operation::Sessions(cmd) => handle_sessions(&ctx, &gateway, cmd).await,
    }
}

fn report_error(err: &anyhow::Error, json: bool) {
    if json {
        let body = match err.downcast_ref::<AccessError>() {
            Some(access) => ErrorResponse::from(access),
            None => ErrorResponse {
                error: format!("{err:#}"),
                code: "INTERNAL_ERROR",
                kind: ErrorKind::Internal,
            },
        };
        let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.error.clone());
        let _ = writeln!(io::stderr(), "{text}");
    } else {
        let _ = writeln!(io::stderr(), "error: {err:#}");
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tandem - share sessions through join codes and approvals.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Act as this account instead of the selected one
    #[arg(long = "as", value_name = "ACCOUNT", global = true)]
    acting_as: Option<AccountId>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage locally known accounts
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
    /// Create, join and manage shared sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Inspect or clear the remote authority settings
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
    /// Create the default configuration file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum AccountsCommand {
    /// Register (or rename) an account identity
    Add {
        id: AccountId,
        username: String,
    },
    /// List known accounts
    List,
    /// Select the account that acts by default
    Use { id: AccountId },
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List owned and joined sessions
    List,
    /// Create a new session
    Create {
        /// Display name
        name: Option<String>,
    },
    /// Ask to join a session by its join code
    Join { code: String },
    /// List pending join requests for sessions you own
    Requests,
    /// Accept or reject a join request
    Decide {
        request_id: String,
        /// accept or reject
        decision: Decision,
        #[command(flatten)]
        grant: GrantArgs,
    },
    /// List the members of a session
    Members { session_id: String },
    /// Leave a session you joined
    Leave { session_id: String },
    /// End a session you own
    End { session_id: String },
    /// Rename a session you own
    Rename { session_id: String, name: String },
    /// Replace the join code of a session you own
    RegenerateCode { session_id: String },
    /// Replace a member's capability grant
    SetPermissions {
        session_id: String,
        member: AccountId,
        #[command(flatten)]
        grant: GrantArgs,
    },
    /// Remove a member from a session you own
    RemoveMember {
        session_id: String,
        member: AccountId,
    },
}

#[derive(Debug, Clone, Args)]
struct GrantArgs {
    /// Grant as JSON, e.g. '{"servers":{"view":true}}'
    #[arg(long, value_name = "JSON")]
    grant: Option<String>,
    /// Allow a capability (domain.action); repeatable
    #[arg(long = "allow", value_name = "CAPABILITY")]
    allow: Vec<Capability>,
}

impl GrantArgs {
    /// Combine `--grant` and `--allow`; `None` when neither was given.
    fn to_grant(&self) -> Result<Option<PermissionGrant>, AccessError> {
        if self.grant.is_none() && self.allow.is_empty() {
            return Ok(None);
        }

        let mut grant = match self.grant.as_deref() {
            Some(text) => PermissionGrant::parse(text)?,
            None => PermissionGrant::deny_all(),
        };
        for cap in &self.allow {
            grant.set(*cap, true);
        }
        Ok(Some(grant))
    }
}

#[derive(Debug, Subcommand)]
enum RemoteCommand {
    /// Show whether operations are delegated
    Status,
    /// Remove the remote authority settings from the config file
    Clear,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init_config(&paths)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if let Some(ref file) = self.config.logging.file {
            let path = config::expand_str_path(file)?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
                .ok();
        } else if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Warn),
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    /// Open the database and configure delegation from the remote settings.
    async fn open_gateway(&self) -> Result<AccessControlGateway> {
        let db_path = self.paths.database_path(&self.config)?;
        let database = Database::new(&db_path).await?;
        let gateway = AccessControlGateway::new(&database);

        if let Some(remote) =
            config::activate_remote(&self.paths.config_file, &self.config.remote)?
        {
            gateway.configure_remote(remote).await?;
        }
        Ok(gateway)
    }

    async fn acting_account(&self, gateway: &AccessControlGateway) -> Result<AccountId> {
        Ok(gateway
            .resolve_acting_account(self.common.acting_as)
            .await?)
    }

    /// Print `value` in the requested format, or as `human` text.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human(value)
        };
        println!("{output}");
        Ok(())
    }
}

async fn handle_accounts(
    ctx: &RuntimeContext,
    gateway: &AccessControlGateway,
    cmd: AccountsCommand,
) -> Result<()> {
    let identity = gateway.identity();
    match cmd {
        AccountsCommand::Add { id, username } => {
            let account = identity.accounts().register(id, &username).await?;
            info!("registered account {} ({})", account.id, account.username);
            ctx.emit(&account, |a| format!("Registered account {} ({})", a.id, a.username))
        }
        AccountsCommand::List => {
            let accounts = identity.accounts().list().await?;
            let selected = identity.selected().await?;
            ctx.emit(&accounts, |accounts| {
                if accounts.is_empty() {
                    return "No accounts registered".to_string();
                }
                let mut out = format!("{:<3}{:<10} {}\n", "", "ID", "USERNAME");
                for account in accounts {
                    let marker = if Some(account.id) == selected { "*" } else { "" };
                    out.push_str(&format!(
                        "{:<3}{:<10} {}\n",
                        marker, account.id, account.username
                    ));
                }
                out.trim_end().to_string()
            })
        }
        AccountsCommand::Use { id } => {
            identity.select(id).await?;
            ctx.emit(&Ack::ok(), |_| format!("Now acting as account {id}"))
        }
    }
}

async fn handle_sessions(
    ctx: &RuntimeContext,
    gateway: &AccessControlGateway,
    cmd: SessionsCommand,
) -> Result<()> {
    let actor = ctx.acting_account(gateway).await?;
    debug!("acting as account {actor}");

    match cmd {
        SessionsCommand::List => {
            let result = gateway.list_sessions(actor).await?;
            ctx.emit(&result, render_session_list)
        }
        SessionsCommand::Create { name } => {
            let result = gateway.create_session(actor, name.as_deref()).await?;
            ctx.emit(&result, |r| {
                format!(
                    "Created session {} ({})\nJoin code: {}",
                    r.data.session.name, r.data.session.id, r.data.join_code
                )
            })
        }
        SessionsCommand::Join { code } => {
            let result = gateway.request_join(actor, &code).await?;
            ctx.emit(&result, render_join_requested)
        }
        SessionsCommand::Requests => {
            let result = gateway.list_pending_requests(actor).await?;
            ctx.emit(&result, render_pending)
        }
        SessionsCommand::Decide {
            request_id,
            decision,
            grant,
        } => {
            let grant = grant.to_grant()?;
            let result = gateway
                .decide_join_request(actor, &request_id, decision, grant)
                .await?;
            ctx.emit(&result, render_decision)
        }
        SessionsCommand::Members { session_id } => {
            let result = gateway.list_members(actor, &session_id).await?;
            ctx.emit(&result, render_members)
        }
        SessionsCommand::Leave { session_id } => {
            let result = gateway.leave_session(actor, &session_id).await?;
            ctx.emit(&result, |_| format!("Left session {session_id}"))
        }
        SessionsCommand::End { session_id } => {
            let result = gateway.end_session(actor, &session_id).await?;
            ctx.emit(&result, |_| format!("Ended session {session_id}"))
        }
        SessionsCommand::Rename { session_id, name } => {
            let result = gateway.rename_session(actor, &session_id, &name).await?;
            ctx.emit(&result, |r: &Sourced<RenamedSession>| {
                format!("Renamed session {} to {}", r.data.session.id, r.data.session.name)
            })
        }
        SessionsCommand::RegenerateCode { session_id } => {
            let result = gateway.regenerate_join_code(actor, &session_id).await?;
            ctx.emit(&result, |r: &Sourced<SessionWithCode>| {
                format!("New join code for {}: {}", r.data.session.name, r.data.join_code)
            })
        }
        SessionsCommand::SetPermissions {
            session_id,
            member,
            grant,
        } => {
            let grant = grant.to_grant()?.ok_or_else(|| {
                AccessError::validation("provide --grant JSON or at least one --allow")
            })?;
            let result = gateway
                .update_member_permissions(actor, &session_id, member, grant)
                .await?;
            ctx.emit(&result, |r: &Sourced<UpdatedMember>| {
                format!(
                    "Updated account {}: {}",
                    r.data.member.account_id,
                    describe_grant(&r.data.member.permissions)
                )
            })
        }
        SessionsCommand::RemoveMember { session_id, member } => {
            let result: Sourced<Ack> = gateway.remove_member(actor, &session_id, member).await?;
            ctx.emit(&result, |_| {
                format!("Removed account {member} from session {session_id}")
            })
        }
    }
}

fn render_session_list(result: &Sourced<SessionList>) -> String {
    fn section(out: &mut String, title: &str, views: &[SessionView]) {
        out.push_str(&format!("{title}:\n"));
        if views.is_empty() {
            out.push_str("  (none)\n");
        }
        for view in views {
            out.push_str(&format!("  {}\n", describe_session(&view.session)));
        }
    }

    let mut out = String::new();
    section(&mut out, "Owned", &result.data.owned);
    section(&mut out, "Joined", &result.data.joined);
    out.push_str(&format!("(source: {})", result.source));
    out
}

fn render_join_requested(result: &Sourced<JoinRequested>) -> String {
    let request = &result.data.request;
    if result.data.already_pending {
        format!("Join request {} is already pending", request.id)
    } else {
        format!(
            "Requested to join session {} (request {})",
            request.session_id, request.id
        )
    }
}

fn render_pending(result: &Sourced<PendingRequests>) -> String {
    if result.data.requests.is_empty() {
        return "No pending join requests".to_string();
    }
    let mut out = format!(
        "{:<18} {:<20} {:<10} {}\n",
        "REQUEST", "SESSION", "ACCOUNT", "REQUESTED"
    );
    out.push_str(&"-".repeat(70));
    out.push('\n');
    for pending in &result.data.requests {
        out.push_str(&format!(
            "{:<18} {:<20} {:<10} {}\n",
            pending.request.id,
            pending.session_name,
            pending.request.requester_account_id,
            pending.request.requested_at
        ));
    }
    out.trim_end().to_string()
}

fn render_decision(result: &Sourced<JoinDecision>) -> String {
    let request = &result.data.request;
    match &result.data.member {
        Some(member) => format!(
            "Request {} {}; account {} joined with {}",
            request.id,
            request.status,
            member.account_id,
            describe_grant(&member.permissions)
        ),
        None => format!("Request {} {}", request.id, request.status),
    }
}

fn render_members(result: &Sourced<SessionMembers>) -> String {
    let mut out = format!("{}\n", describe_session(&result.data.session));
    for member in &result.data.members {
        out.push_str(&format!("  {}\n", describe_member(member)));
    }
    out.trim_end().to_string()
}

fn describe_session(session: &Session) -> String {
    format!(
        "{} {:<24} {} [{}]",
        session.id, session.name, session.join_code, session.status
    )
}

fn describe_member(member: &Membership) -> String {
    format!(
        "{:<10} {:<7} {}",
        member.account_id,
        member.role,
        describe_grant(&member.permissions)
    )
}

fn describe_grant(grant: &PermissionGrant) -> String {
    let granted = grant.granted();
    if granted.is_empty() {
        return "no capabilities".to_string();
    }
    granted
        .iter()
        .map(|cap| cap.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Serialize)]
struct RemoteStatus {
    delegating: bool,
    base_url: Option<String>,
    timeout_secs: u64,
}

fn handle_remote(ctx: &RuntimeContext, command: RemoteCommand) -> Result<()> {
    match command {
        RemoteCommand::Status => {
            // Settings only; the credential file is read when a session command runs.
            let remote = &ctx.config.remote;
            let has_credential = remote.credential.is_some() || remote.credential_file.is_some();
            let base_url = remote
                .base_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty() && has_credential)
                .map(str::to_string);
            let status = RemoteStatus {
                delegating: base_url.is_some(),
                base_url,
                timeout_secs: remote.timeout_secs,
            };
            ctx.emit(&status, |s| match &s.base_url {
                Some(url) => format!("Delegating to {url} (timeout {}s)", s.timeout_secs),
                None => "Serving from local state".to_string(),
            })
        }
        RemoteCommand::Clear => {
            config::clear_remote_settings(&ctx.paths.config_file)?;
            info!("cleared remote settings in {}", ctx.paths.config_file.display());
            ctx.emit(&Ack::ok(), |_| {
                "Remote authority cleared; serving from local state".to_string()
            })
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // RuntimeContext already wrote defaults if the file was missing.
    if ctx.paths.config_file.exists() && !cmd.force {
        println!("Config at {}", ctx.paths.config_file.display());
        return Ok(());
    }

    config::write_default_config(&ctx.paths.config_file)?;
    println!("Wrote default config to {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let shown = ctx.config.redacted();
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&shown).context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&shown).context("serializing config to YAML")?
                );
            } else {
                println!("{shown:#?}");
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => config::write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
