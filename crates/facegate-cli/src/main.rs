use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `FacegateProxy` (async); the CLI runs on tokio.
#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    async fn enroll(&self, employee_id: &str, image: &[u8], image_ref: &str) -> zbus::Result<String>;
    async fn identify(
        &self,
        image: &[u8],
        caller: &str,
        department: &str,
        shift: &str,
    ) -> zbus::Result<String>;
    async fn list_encodings(&self, employee_id: &str) -> zbus::Result<String>;
    async fn purge_encodings(&self, employee_id: &str) -> zbus::Result<u32>;
    async fn remove_encoding(&self, encoding_id: &str) -> zbus::Result<bool>;
    async fn remove_employee(&self, employee_id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face enrollment and identification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image for an employee
    Enroll {
        #[arg(short, long)]
        employee: String,
        /// Face image file (JPEG, PNG, ...)
        #[arg(short, long)]
        image: PathBuf,
        /// Reference stored with the encoding (defaults to the image path)
        #[arg(long)]
        image_ref: Option<String>,
    },
    /// Identify the employee in a face image
    Identify {
        #[arg(short, long)]
        image: PathBuf,
        /// Only consider employees of this department
        #[arg(long)]
        department: Option<String>,
        /// Only consider employees on this shift
        #[arg(long)]
        shift: Option<String>,
    },
    /// List an employee's enrolled encodings
    List {
        #[arg(short, long)]
        employee: String,
    },
    /// Remove all encodings of an employee (before re-enrollment)
    Purge {
        #[arg(short, long)]
        employee: String,
    },
    /// Remove a single encoding
    Remove {
        /// Encoding ID to remove
        id: String,
    },
    /// Delete an employee and all of its encodings
    RemoveEmployee {
        #[arg(short, long)]
        employee: String,
    },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = FacegateProxy::new(&conn).await?;
    tracing::debug!(session = cli.session, "connected to facegated");

    match cli.command {
        Commands::Enroll {
            employee,
            image,
            image_ref,
        } => {
            let bytes = read_image(&image)?;
            let image_ref = image_ref.unwrap_or_else(|| image.display().to_string());
            let id = proxy.enroll(&employee, &bytes, &image_ref).await?;
            println!("Enrolled encoding {id} for {employee}");
        }
        Commands::Identify {
            image,
            department,
            shift,
        } => {
            let bytes = read_image(&image)?;
            let caller = std::env::var("USER").unwrap_or_else(|_| "facegate-cli".to_string());
            let outcome = proxy
                .identify(
                    &bytes,
                    &caller,
                    department.as_deref().unwrap_or(""),
                    shift.as_deref().unwrap_or(""),
                )
                .await?;
            print_json(&outcome)?;
        }
        Commands::List { employee } => {
            print_json(&proxy.list_encodings(&employee).await?)?;
        }
        Commands::Purge { employee } => {
            let removed = proxy.purge_encodings(&employee).await?;
            println!("Removed {removed} encoding(s) for {employee}");
        }
        Commands::Remove { id } => {
            if proxy.remove_encoding(&id).await? {
                println!("Removed encoding {id}");
            } else {
                println!("No encoding {id}");
            }
        }
        Commands::RemoveEmployee { employee } => {
            if proxy.remove_employee(&employee).await? {
                println!("Removed employee {employee} and their encodings");
            } else {
                println!("No employee {employee}");
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn identify_filters_are_optional() {
        let cli = Cli::try_parse_from(["facegate", "identify", "--image", "query.jpg"]).unwrap();
        match cli.command {
            Commands::Identify {
                department, shift, ..
            } => {
                assert!(department.is_none());
                assert!(shift.is_none());
            }
            _ => panic!("expected identify"),
        }
    }

    #[test]
    fn session_flag_is_global() {
        let cli = Cli::try_parse_from(["facegate", "status", "--session"]).unwrap();
        assert!(cli.session);
    }
}
