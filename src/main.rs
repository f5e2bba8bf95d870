use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mail_triage::channels::{ImapSmtpMail, MailProvider, Messenger, TwilioMessenger};
use mail_triage::config::AppConfig;
use mail_triage::ingest::{self, IngestConfig, IngestDeps};
use mail_triage::llm::create_provider;
use mail_triage::router::{DraftEngine, IntentClassifier, Router};
use mail_triage::store::{KeyedLocks, LibSqlBackend, ThreadStore};
use mail_triage::webhook::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    eprintln!("📬 mail-triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Mailbox: {} (poll every {}s)", config.email.imap_host, config.poll_interval_secs);
    eprintln!("   Supervisor: {}", config.supervisor);
    eprintln!(
        "   Notifications: {}",
        if config.template_sid.is_some() {
            "template with text fallback"
        } else {
            "plain text"
        }
    );
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/whatsapp", config.port);
    eprintln!("   Database: {}\n", config.db_path);

    let llm = create_provider(&config.llm)?;

    let store: Arc<dyn ThreadStore> =
        Arc::new(LibSqlBackend::new_local(Path::new(&config.db_path)).await?);

    let mail: Arc<dyn MailProvider> = Arc::new(ImapSmtpMail::new(config.email.clone()));
    let messenger: Arc<dyn Messenger> = Arc::new(TwilioMessenger::new(config.twilio.clone()));
    let locks = Arc::new(KeyedLocks::new());

    let llm_timeout = Duration::from_secs(config.llm_timeout_secs);

    let router = Arc::new(Router::new(
        Arc::clone(&store),
        Arc::clone(&mail),
        IntentClassifier::new(llm.clone(), llm_timeout),
        DraftEngine::new(llm.clone(), llm_timeout),
        Arc::clone(&locks),
    ));

    let (_ingest_handle, _ingest_shutdown) = ingest::spawn_ingest_loop(
        IngestDeps {
            store,
            mail,
            messenger: Arc::clone(&messenger),
            drafter: DraftEngine::new(llm, llm_timeout),
            locks,
        },
        IngestConfig {
            supervisor: config.supervisor.clone(),
            template_sid: config.template_sid.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        },
    );

    let app = webhook::routes(AppState { router, messenger });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "Webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
