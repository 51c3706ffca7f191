mod api;
mod bot;
mod bot_manager;
mod clients;
mod services;
mod settings;

use std::io;
use std::sync::Arc;

use anyhow::Result;
use teloxide::Bot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bot_manager::BotManager;
use clients::{MarzbanClient, OutlineClient, VpnClient, YooKassaGateway};
use services::reconciliation_service::ReconciliationService;
use services::sweeper_service::SweeperService;
use settings::{Settings, VpnBackend};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationService>,
    pub settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("⚠️  No .env file loaded: {}", e);
    }

    let file_appender = tracing_appender::rolling::never(".", "keygate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keygate_bot=debug,axum=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let settings = Arc::new(Settings::from_env()?);
    let pool = keygate_db::db::init_db().await?;
    tracing::info!("Database initialized");

    let vpn: Arc<dyn VpnClient> = match settings.vpn_backend {
        VpnBackend::Outline => Arc::new(OutlineClient::new(
            &settings.outline_api_url,
            &settings.outline_cert_sha256,
        )?),
        VpnBackend::Marzban => Arc::new(MarzbanClient::new(
            &settings.marzban_base_url,
            &settings.marzban_username,
            &settings.marzban_password,
        )?),
    };
    let gateway = Arc::new(YooKassaGateway::new(
        &settings.yookassa_shop_id,
        &settings.yookassa_secret_key,
    )?);
    let bot_manager = Arc::new(BotManager::new());

    let engine = Arc::new(ReconciliationService::new(
        pool.clone(),
        vpn.clone(),
        gateway,
        bot_manager.clone(),
        settings.clone(),
    ));
    let state = AppState { engine: engine.clone(), settings: settings.clone() };

    let sweeper = SweeperService::new(pool.clone(), vpn.clone(), settings.sweep_interval_secs);
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let bot = Bot::new(settings.bot_token.clone());
    bot_manager.set_bot(bot.clone()).await;
    let bot_state = state.clone();
    tokio::spawn(async move {
        bot::run_bot(bot, bot_state).await;
    });

    let app = api::routes(state);
    tracing::info!("Webhook listener on {}", settings.webhook_bind);
    let listener = tokio::net::TcpListener::bind(&settings.webhook_bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
