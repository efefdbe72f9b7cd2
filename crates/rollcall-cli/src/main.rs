use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn register(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn attendance(&self, date: &str) -> zbus::Result<String>;
    async fn strangers(&self, date: &str) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Register a person from a reference photo
    Register {
        /// Display name, e.g. "Ada Lovelace"
        name: String,
        /// Image containing exactly one face
        image: PathBuf,
    },
    /// List registered identities
    List,
    /// Show attendance for a day
    Log {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show stranger captures for a day
    Strangers {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Rescan the gallery directory
    Reload,
    /// List local V4L2 capture devices
    Devices,
}

async fn connect(session: bool) -> Result<RollcallProxy<'static>> {
    tracing::debug!(session, "connecting to rollcalld");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn json_rows(raw: &str) -> Result<Vec<serde_json::Value>> {
    serde_json::from_str(raw).context("daemon returned malformed JSON")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Commands::Devices = cli.command {
        list_devices();
        return Ok(());
    }

    let proxy = connect(cli.session).await?;
    run(&proxy, cli.command).await
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in devices {
        println!("{}\t{} ({})", d.path, d.name, d.driver);
    }
}

async fn run(proxy: &RollcallProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let raw = proxy.status().await?;
            let status: serde_json::Value =
                serde_json::from_str(&raw).context("daemon returned malformed JSON")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Register { name, image } => {
            // The daemon opens the file itself, so hand it an absolute path
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            let identity = proxy.register(&name, &image.to_string_lossy()).await?;
            println!("Registered {identity}");
        }
        Commands::List => {
            let raw = proxy.list_identities().await?;
            let identities: Vec<String> =
                serde_json::from_str(&raw).context("daemon returned malformed JSON")?;
            if identities.is_empty() {
                println!("No identities registered");
            }
            for identity in identities {
                println!("{identity}");
            }
        }
        Commands::Log { date } => {
            let rows = json_rows(&proxy.attendance(&date).await?)?;
            if rows.is_empty() {
                println!("No attendance recorded");
            }
            for row in rows {
                println!(
                    "{}\t{}\t{}",
                    row["date"].as_str().unwrap_or("?"),
                    row["time"].as_str().unwrap_or("?"),
                    row["identity"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::Strangers { date } => {
            let rows = json_rows(&proxy.strangers(&date).await?)?;
            if rows.is_empty() {
                println!("No strangers captured");
            }
            for row in rows {
                println!(
                    "{}\t{}",
                    row["captured_at"].as_str().unwrap_or("?"),
                    row["path"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("Gallery reloaded: {count} identities");
        }
        Commands::Devices => list_devices(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from(["rollcall", "register", "Ada Lovelace", "ada.jpg"]).unwrap();
        match cli.command {
            Commands::Register { name, image } => {
                assert_eq!(name, "Ada Lovelace");
                assert_eq!(image, PathBuf::from("ada.jpg"));
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_log_date_defaults_to_today() {
        let cli = Cli::try_parse_from(["rollcall", "log"]).unwrap();
        assert!(matches!(cli.command, Commands::Log { date } if date.is_empty()));

        let cli = Cli::try_parse_from(["rollcall", "--session", "strangers", "-d", "2026-03-02"])
            .unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Strangers { date } if date == "2026-03-02"));
    }

    #[test]
    fn test_json_rows_rejects_garbage() {
        assert!(json_rows("not json").is_err());
        assert_eq!(json_rows("[]").unwrap().len(), 0);
    }
}
