mod config;
mod handlers;
mod llm;
mod sanitize;
mod sessions;
mod storage;
mod tasks;

use std::sync::Arc;

use teloxide::prelude::*;
use tokio_util::task::TaskTracker;
use tracing::info;
use tracing_subscriber::prelude::*;

use config::Config;
use handlers::Command;
use llm::ModelClient;
use sessions::{AdminSlot, SessionStore};
use storage::InteractionLog;
use tasks::TaskStore;

pub struct BotState {
    pub config: Config,
    pub model: ModelClient,
    pub log: InteractionLog,
    pub tasks: TaskStore,
    pub sessions: SessionStore,
    pub admin: AdminSlot,
    /// In-flight chat turns. Tracking makes ownership of spawned work
    /// explicit; turns are not cancelled on shutdown.
    pub turns: TaskTracker,
}

impl BotState {
    fn new(config: Config) -> Self {
        let model = ModelClient::new(
            config.api_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.formatting_mode,
            config.max_concurrent_requests,
        );
        let log = InteractionLog::new(config.db_path());
        let tasks = TaskStore::new(config.tasks_path());
        let admin = AdminSlot::new(config.admin_id);

        Self {
            config,
            model,
            log,
            tasks,
            sessions: SessionStore::new(),
            admin,
            turns: TaskTracker::new(),
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "unplug.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    std::fs::create_dir_all(config.log_dir()).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file())
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting unplug...");
    info!("Loaded config from {config_path}");
    info!(
        "Model: {}, formatting: {}, request cap: {}",
        config.model,
        config.formatting_mode.as_str(),
        config.max_concurrent_requests
    );
    if let Some(admin_id) = config.admin_id {
        info!("Admin seeded from config: {admin_id}");
    }

    let bot = Bot::new(&config.telegram_bot_token);
    let state = Arc::new(BotState::new(config));

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handlers::handle_command),
        )
        .branch(Update::filter_message().endpoint(handlers::handle_text))
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
