use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Roster1",
    default_service = "org.freedesktop.Roster1",
    default_path = "/org/freedesktop/Roster1"
)]
trait Roster {
    async fn enroll_identity(
        &self,
        id: &str,
        name: &str,
        email: &str,
        poses: HashMap<String, Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn update_identity(
        &self,
        id: &str,
        mode: &str,
        images: Vec<Vec<u8>>,
        name: &str,
        email: &str,
    ) -> zbus::Result<String>;
    async fn delete_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn recognize_face(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "roster", about = "Roster face enrollment and recognition CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from pose images
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
        /// Pose images as POSE=PATH (e.g. front=me.jpg)
        #[arg(required = true, value_parser = parse_pose)]
        poses: Vec<(String, PathBuf)>,
    },
    /// Add or replace an identity's images
    Update {
        #[arg(long)]
        id: String,
        /// "add" keeps existing images, "replace" discards them
        #[arg(long, default_value = "add")]
        mode: String,
        /// New display name (replace mode only)
        #[arg(long)]
        name: Option<String>,
        /// New email (replace mode only)
        #[arg(long)]
        email: Option<String>,
        images: Vec<PathBuf>,
    },
    /// Delete an identity
    Delete { id: String },
    /// Recognize the faces in an image
    Recognize { image: PathBuf },
    /// Show daemon status
    Status,
    /// List enrolled identities
    List,
}

fn parse_pose(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((pose, path)) if !pose.is_empty() && !path.is_empty() => {
            Ok((pose.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected POSE=PATH, got {arg:?}")),
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply, falling back to the raw text.
fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RosterProxy::new(&conn).await.context("rosterd is not running")?;

    match cli.command {
        Commands::Enroll { id, name, email, poses } => {
            let mut images = HashMap::with_capacity(poses.len());
            for (pose, path) in &poses {
                images.insert(pose.clone(), read_image(path)?);
            }
            tracing::debug!(id = %id, poses = images.len(), "sending enrollment");
            let reply = proxy
                .enroll_identity(&id, &name, email.as_deref().unwrap_or(""), images)
                .await?;
            print_json(&reply);
        }
        Commands::Update { id, mode, name, email, images } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let reply = proxy
                .update_identity(
                    &id,
                    &mode,
                    images,
                    name.as_deref().unwrap_or(""),
                    email.as_deref().unwrap_or(""),
                )
                .await?;
            print_json(&reply);
        }
        Commands::Delete { id } => {
            if proxy.delete_identity(&id).await? {
                println!("Deleted {id}");
            } else {
                println!("No identity named {id}");
            }
        }
        Commands::Recognize { image } => {
            let reply = proxy.recognize_face(read_image(&image)?).await?;
            print_json(&reply);
        }
        Commands::Status => print_json(&proxy.status().await?),
        Commands::List => print_json(&proxy.list_identities().await?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pose() {
        assert_eq!(
            parse_pose("front=a.jpg").unwrap(),
            ("front".to_string(), PathBuf::from("a.jpg"))
        );
        assert_eq!(parse_pose("left=dir/x=y.png").unwrap().1, PathBuf::from("dir/x=y.png"));
        assert!(parse_pose("front").is_err());
        assert!(parse_pose("=a.jpg").is_err());
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "roster", "enroll", "--id", "alice", "--name", "Alice", "front=a.jpg", "left=b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll { id, poses, email, .. } => {
                assert_eq!(id, "alice");
                assert_eq!(poses.len(), 2);
                assert!(email.is_none());
            }
            _ => panic!("expected enroll"),
        }
    }
}
