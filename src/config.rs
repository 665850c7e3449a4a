//! # Config — Startup Configuration
//!
//! Every knob is a `clap` argument with an environment binding, so the desktop
//! shell can drive the service purely through its environment (a `.env` file
//! in the working directory is loaded first by `main`). Values are read once
//! at startup; nothing here is mutated afterwards.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Replacement text shown to users when an upstream error leaks a blocked term.
pub const FILTERED_MESSAGE: &str = "服务器负载异常，不会消耗次数，请重试，多次出现请联系销售获取帮助";

const PRODUCTION_MODEL: &str = "gemini-3-pro-image-preview";
const PREVIEW_MODEL: &str = "gemini-2.5-image-preview";

const PRODUCTION_KEYWORDS: &[&str] = &[
    "gemini",
    "gemini-3",
    "gemini3",
    "gemini-pro",
    "gemini3pro",
    "gemini-3-pro",
    "image-preview",
    "gemini-3-pro-image-preview",
    "models/",
    "vectorengine",
];

const PREVIEW_KEYWORDS: &[&str] = &[
    "gemini",
    "gemini-2.5",
    "gemini2.5",
    "image-preview",
    "gemini-2.5-image-preview",
    "models/",
    "vectorengine",
];

#[derive(Parser, Debug, Clone)]
#[command(name = "sigma", version, about = "Local image-generation gateway")]
pub struct Config {
    /// Directory that receives generated images (served under /images)
    #[arg(long, env = "OUTPUT_DIR", default_value = "./output")]
    pub output_dir: PathBuf,

    /// Directory that receives uploaded reference images (served under /uploads)
    #[arg(long, env = "UPLOAD_DIR", default_value = "./uploads")]
    pub upload_dir: PathBuf,

    /// SQLite database file
    #[arg(long, env = "DB_PATH", default_value = "./history.db")]
    pub db_path: PathBuf,

    /// Preferred listening port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Walk forward to the next free port when the preferred one is taken
    #[arg(
        long,
        env = "AUTO_PORT_DISCOVERY",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub auto_port_discovery: bool,

    /// How many consecutive ports to try when discovery is on
    #[arg(long, env = "MAX_PORT_ATTEMPTS", default_value_t = 10)]
    pub max_port_attempts: u16,

    /// Name of the port file written to the OS temp directory
    #[arg(long, env = "PORT_FILE_NAME", default_value = "sigma-backend.port")]
    pub port_file_name: String,

    /// Production mode: high-resolution model, quieter logs
    #[arg(
        long,
        env = "PRODUCTION",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub production: bool,

    /// Overrides the `http://localhost:<port>` prefix of returned URLs
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Overrides the generation endpoint for every platform
    #[arg(long, env = "AI_SERVICE_URL")]
    pub ai_service_url: Option<String>,

    /// Comma-separated blocklist for user-facing error messages
    #[arg(long, env = "SENSITIVE_KEYWORDS", value_delimiter = ',')]
    pub sensitive_keywords: Vec<String>,

    /// Initial API token; a token persisted in the database takes precedence
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Initial disclaimer state; a persisted value takes precedence
    #[arg(
        long,
        env = "DISCLAIMER_AGREED",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub disclaimer_agreed: bool,

    #[arg(long, env = "VECTORENGINE_BASE_URL", default_value = "https://api.vectorengine.ai")]
    pub vectorengine_base_url: String,

    #[arg(long, env = "VECTORENGINE_ADMIN_USER", default_value = "")]
    pub vectorengine_admin_user: String,

    #[arg(long, env = "VECTORENGINE_ADMIN_KEY", default_value = "", hide_env_values = true)]
    pub vectorengine_admin_key: String,

    #[arg(long, env = "AIAIMI_BASE_URL", default_value = "https://aiaimi.cc")]
    pub aiaimi_base_url: String,

    #[arg(long, env = "AIAIMI_ADMIN_USER", default_value = "")]
    pub aiaimi_admin_user: String,

    #[arg(long, env = "AIAIMI_ADMIN_KEY", default_value = "", hide_env_values = true)]
    pub aiaimi_admin_key: String,

    /// Upper bound on a request body (multipart uploads included)
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Upper bound on an image the provider hands back as a URL
    #[arg(long, env = "MAX_DOWNLOAD_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_download_bytes: usize,

    /// `json` for JSON log lines, anything else for human-readable output
    #[arg(long, env = "LOG_FORMAT", default_value = "")]
    pub log_format: String,
}

impl Config {
    /// Upstream model name; production uses the high-resolution image model.
    pub fn model(&self) -> &'static str {
        if self.production {
            PRODUCTION_MODEL
        } else {
            PREVIEW_MODEL
        }
    }

    /// Blocklist applied to user-visible error text.
    ///
    /// An explicit `SENSITIVE_KEYWORDS` wins. Otherwise the list follows the
    /// active model, except that an `AI_SERVICE_URL` override always gets the
    /// production list.
    pub fn sensitivity_keywords(&self) -> Vec<String> {
        let explicit: Vec<String> = self
            .sensitive_keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }
        let defaults = if self.production || self.ai_service_url.is_some() {
            PRODUCTION_KEYWORDS
        } else {
            PREVIEW_KEYWORDS
        };
        defaults.iter().map(|k| k.to_string()).collect()
    }

    /// Default tracing filter when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        if self.production {
            "warn"
        } else {
            "info"
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.output_dir.join("images")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.upload_dir.join("uploads")
    }
}

/// Case-insensitive blocklist scrub for user-visible error text.
#[derive(Debug, Clone)]
pub struct SensitivityFilter {
    keywords: Vec<String>,
}

impl SensitivityFilter {
    pub fn new(keywords: Vec<String>) -> Self {
        SensitivityFilter {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Returns the fixed replacement message if `message` mentions any
    /// blocked term, otherwise the message unchanged.
    pub fn scrub(&self, message: &str) -> String {
        let lower = message.to_lowercase();
        if self.keywords.iter().any(|k| lower.contains(k.as_str())) {
            FILTERED_MESSAGE.to_string()
        } else {
            message.to_string()
        }
    }
}
