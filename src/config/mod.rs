use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the Unix socket the analysis engine listens on
    pub engine_socket: PathBuf,

    /// Base directory for per-message spool work areas
    pub work_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let engine_socket = match env::var("MAIL_GATE_ENGINE_SOCKET") {
            Ok(val) => PathBuf::from(val),
            Err(e) => {
                let err_msg = "MAIL_GATE_ENGINE_SOCKET environment variable must be set";
                log::error!("{}: {}", err_msg, e);
                return Err(anyhow!(e).context(err_msg));
            }
        };
        log::info!(
            "Config: Using engine_socket: {}",
            engine_socket.display()
        );

        let work_dir = env::var("MAIL_GATE_WORK_DIR")
            .map(|val| {
                log::info!("Config: Using work_dir from env: {}", val);
                PathBuf::from(val)
            })
            .unwrap_or_else(|_| {
                let default_val = PathBuf::from("/var/lib/mail_gate/tmp");
                log::info!(
                    "Config: Using default work_dir: {}",
                    default_val.display()
                );
                default_val
            });

        Ok(Config {
            engine_socket,
            work_dir,
        })
    }
}
