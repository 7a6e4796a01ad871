//! taskdesk - manage tasks on a taskdesk server from the terminal.
//!
//! Sign in once with `taskdesk login`; the session is kept between runs and
//! refreshed automatically while it is in use.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskdesk_core::auth::SessionEvent;
use taskdesk_core::models::{NewTask, Priority, ProfileUpdate, Task, TaskSortColumn, TaskStatus};
use taskdesk_core::{ApiError, Config, DeleteOutcome, Taskdesk};

// ============================================================================
// Constants
// ============================================================================

/// Directory for an optional log file, in addition to stderr
const LOG_DIR_ENV: &str = "TASKDESK_LOG_DIR";

const API_URL_ENV: &str = "TASKDESK_API_URL";
const ORIGIN_ENV: &str = "TASKDESK_ORIGIN";
const EMAIL_ENV: &str = "TASKDESK_EMAIL";
const PASSWORD_ENV: &str = "TASKDESK_PASSWORD";

/// Roles allowed to work with tasks
const TASK_ROLES: &[&str] = &["user", "admin"];

const USAGE: &str = "\
Usage: taskdesk <command> [args]

Commands:
  login [email]                     Sign in
  logout                            Sign out
  status                            Show who is signed in
  register <name> <email>           Create an account and sign in
  forgot-password <email>           Email a password reset link
  reset-password <token> <email>    Set a new password from a reset link
  profile [--name NAME] [--email EMAIL]
  password                          Change your password
  list [--date YYYY-MM-DD] [--all] [--sort order|priority|title]
  search <query>
  add <title> [--priority high|medium|low] [--date YYYY-MM-DD]
  done <id>                         Mark a task completed
  undo <id>                         Mark a task pending again
  priority <id> <high|medium|low>
  delete <id>
  reorder <id> <id> ...             Save a new display order";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "taskdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api_base_url = url;
    }
    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
        config.origin = origin;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if command == "help" || command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = load_config()?;
    let app = Taskdesk::from_config(&config).context("Failed to set up API client")?;
    let mut events = app.subscribe();

    let session = app.session.initialize().await;
    info!(signed_in = session.authenticated, "taskdesk starting");

    let result = run(&app, &mut config, command, rest).await;

    while let Ok(event) = events.try_recv() {
        debug!(?event, "Session event");
        if let SessionEvent::SignInRequired { reason } = event {
            if command != "logout" {
                eprintln!("Session ended ({:?}). Run `taskdesk login` to sign in again.", reason);
            }
        }
    }
    result
}

async fn run(app: &Taskdesk, config: &mut Config, command: &str, args: &[String]) -> Result<()> {
    match command {
        "login" => login(app, config, args.first().cloned()).await,
        "logout" => {
            app.session.sign_out().await;
            println!("Signed out.");
            Ok(())
        }
        "status" => status(app),
        "register" | "forgot-password" | "reset-password" => run_account_command(app, command, args).await,
        "profile" | "password" => {
            app.session.authorize(&[]).await.map_err(not_signed_in)?;
            app.session.record_activity();
            run_account_command(app, command, args).await
        }
        _ => {
            app.session.authorize(TASK_ROLES).await.map_err(not_signed_in)?;
            app.session.record_activity();
            run_task_command(app, command, args).await
        }
    }
}

async fn run_account_command(app: &Taskdesk, command: &str, args: &[String]) -> Result<()> {
    match command {
        "register" => {
            let (name, email) = match args {
                [name, email, ..] => (name, email),
                _ => bail!("Usage: taskdesk register <name> <email>"),
            };
            let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
            let confirmation =
                rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
            let user = app.session.register(name, email, &password, &confirmation).await?;
            println!("Registered and signed in as {} <{}>", user.name, user.email);
        }
        "forgot-password" => {
            let email = args.first().context("Missing email")?;
            println!("{}", app.session.request_password_reset(email).await?);
        }
        "reset-password" => {
            let (token, email) = match args {
                [token, email, ..] => (token, email),
                _ => bail!("Usage: taskdesk reset-password <token> <email>"),
            };
            let password = rpassword::prompt_password("New password: ").context("Failed to read password")?;
            let confirmation =
                rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
            let user = app.session.reset_password(token, email, &password, &confirmation).await?;
            println!("Password reset. Signed in as {} <{}>", user.name, user.email);
        }
        "profile" => {
            let mut update = ProfileUpdate::default();
            let mut iter = args.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--name" => update.name = Some(iter.next().context("Missing value for --name")?.clone()),
                    "--email" => update.email = Some(iter.next().context("Missing value for --email")?.clone()),
                    other => bail!("Unknown option for profile: {}", other),
                }
            }
            let user = if update.name.is_none() && update.email.is_none() {
                app.session.fetch_user().await?
            } else {
                app.session.update_profile(&update).await?
            };
            println!("{} <{}> ({})", user.name, user.email, user.role_or_default());
        }
        "password" => {
            let current =
                rpassword::prompt_password("Current password: ").context("Failed to read password")?;
            let new = rpassword::prompt_password("New password: ").context("Failed to read password")?;
            let confirmation =
                rpassword::prompt_password("Confirm new password: ").context("Failed to read password")?;
            println!("{}", app.session.change_password(&current, &new, &confirmation).await?);
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
    Ok(())
}

/// Turn a rejected session check into a sign-in hint; other errors pass through.
fn not_signed_in(error: ApiError) -> anyhow::Error {
    match error {
        ApiError::Unauthorized => anyhow::anyhow!("Not signed in. Run `taskdesk login` first."),
        other => other.into(),
    }
}

async fn run_task_command(app: &Taskdesk, command: &str, args: &[String]) -> Result<()> {
    match command {
        "list" => list(app, args).await,
        "search" => {
            let query = args.join(" ");
            let tasks = app.tasks.search_tasks(&query).await?;
            print_tasks(&tasks);
            Ok(())
        }
        "add" => add(app, args).await,
        "done" | "undo" => {
            let id = parse_id(args.first())?;
            let status = if command == "done" {
                TaskStatus::Completed
            } else {
                TaskStatus::Pending
            };
            let task = app.tasks.set_status(id, status).await?;
            print_task(&task);
            Ok(())
        }
        "priority" => {
            let id = parse_id(args.first())?;
            let priority: Priority = args
                .get(1)
                .context("Missing priority")?
                .parse()
                .map_err(anyhow::Error::msg)?;
            let task = app.tasks.set_priority(id, priority).await?;
            print_task(&task);
            Ok(())
        }
        "delete" => {
            let id = parse_id(args.first())?;
            match app.tasks.delete_task(id).await? {
                DeleteOutcome::Deleted => println!("Deleted task {}.", id),
                DeleteOutcome::AlreadyDeleted => println!("Task {} was already gone.", id),
                DeleteOutcome::InProgress => println!("Task {} is already being deleted.", id),
            }
            Ok(())
        }
        "reorder" => {
            let ids = args
                .iter()
                .map(|arg| parse_id(Some(arg)))
                .collect::<Result<Vec<_>>>()?;
            if ids.is_empty() {
                bail!("Give the task ids in their new order");
            }
            app.tasks.reorder_tasks(&ids).await?;
            println!("Saved order for {} tasks.", ids.len());
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(app: &Taskdesk, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email
        .or_else(|| std::env::var(EMAIL_ENV).ok())
        .or_else(|| config.last_email.clone())
    {
        Some(email) => email,
        None => prompt("Email: ")?,
    };

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    let user = app
        .session
        .sign_in(&email, &password)
        .await
        .context("Sign-in failed")?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save configuration");
    }

    println!("Signed in as {} <{}>", user.name, user.email);
    Ok(())
}

fn status(app: &Taskdesk) -> Result<()> {
    let session = app.session.session();
    if !session.authenticated {
        println!("Not signed in.");
        return Ok(());
    }

    match session.user {
        Some(ref user) => println!("Signed in as {} <{}> ({})", user.name, user.email, user.role_or_default()),
        None => println!("Signed in."),
    }
    match session.minutes_until_expiry() {
        Some(minutes) => println!("Credential expires in {} min.", minutes),
        None => println!("Credential expiry unknown."),
    }
    Ok(())
}

async fn list(app: &Taskdesk, args: &[String]) -> Result<()> {
    let mut day = Local::now().date_naive();
    let mut all = false;
    let mut sort = TaskSortColumn::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--all" => all = true,
            "--date" => day = parse_date(iter.next())?,
            "--sort" => {
                sort = iter
                    .next()
                    .context("Missing value for --sort")?
                    .parse()
                    .map_err(anyhow::Error::msg)?;
            }
            other => bail!("Unknown option for list: {}", other),
        }
    }

    let mut tasks = app.tasks.fetch_tasks().await?;
    if !all {
        tasks.retain(|task| task.is_on(day));
    }
    sort.sort(&mut tasks);
    print_tasks(&tasks);
    Ok(())
}

async fn add(app: &Taskdesk, args: &[String]) -> Result<()> {
    let mut title = Vec::new();
    let mut priority = Priority::default();
    let mut day = Local::now().date_naive();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--priority" => {
                priority = iter
                    .next()
                    .context("Missing value for --priority")?
                    .parse()
                    .map_err(anyhow::Error::msg)?;
            }
            "--date" => day = parse_date(iter.next())?,
            word => title.push(word),
        }
    }
    if title.is_empty() {
        bail!("Missing task title");
    }

    let task = NewTask {
        title: title.join(" "),
        priority,
        date: day.format("%Y-%m-%d").to_string(),
        status: None,
    };
    let created = app.tasks.create_task(&task).await?;
    print_task(&created);
    Ok(())
}

fn parse_id(arg: Option<&String>) -> Result<i64> {
    let arg = arg.context("Missing task id")?;
    arg.parse()
        .with_context(|| format!("Invalid task id: {}", arg))
}

fn parse_date(arg: Option<&String>) -> Result<NaiveDate> {
    let arg = arg.context("Missing date")?;
    NaiveDate::parse_from_str(arg, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", arg))
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No value entered");
    }
    Ok(value)
}

fn print_task(task: &Task) {
    let mark = if task.is_completed() { "x" } else { " " };
    println!("[{}] {:>5}  {:<6}  {}", mark, task.id, task.priority.to_string(), task.title);
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in tasks {
        print_task(task);
    }
}
