use actix::prelude::*;
use actix_web::middleware::{DefaultHeaders, NormalizePath, TrailingSlash};
use actix_web::{web::Data, App, HttpServer};
use anyhow::Context as AnyhowContext;
use catalog_types::job::repository::{JobRepository, LogRepository};
use catalog_types::job::service::JobService;
use catalog_types::mapping::repository::ColumnMappingRepository;
use catalog_types::product::repository::{FinalPriceRepository, PriceOverrideRepository};
use catalog_types::supplier::repository::{SourceRepository, SupplierRepository};
use horoshop_sync::catalog::{
    PostgresColumnMappingRepository, PostgresFinalPriceRepository,
    PostgresPriceOverrideRepository, PostgresRawProductRepository, PostgresSourceRepository,
    PostgresSupplierRepository,
};
use horoshop_sync::cleanup::{Cleaner, PostgresRetention};
use horoshop_sync::config::{Config, PostgresConfig};
use horoshop_sync::export::{Exporter, PostgresFinalCatalogReader, PostgresPreviewStore, PreviewStore};
use horoshop_sync::finalize::{Finalizer, PostgresFinalCatalogStore};
use horoshop_sync::google_sheets::GoogleSheetsClient;
use horoshop_sync::horoshop::HoroshopClient;
use horoshop_sync::horoshop_sync::{HoroshopSync, PostgresMirrorStore};
use horoshop_sync::import::{Importer, SheetImporter};
use horoshop_sync::job::{PostgresJobRepository, PostgresLogRepository};
use horoshop_sync::journal::Journal;
use horoshop_sync::runner::{CancelListener, CancelRegistry, Runner, Services};
use horoshop_sync::telegram::{Notifier, TelegramNotifier};
use horoshop_sync::{control, scheduler};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

async fn connect(config: &PostgresConfig) -> Result<Client, anyhow::Error> {
    let (client, connection) =
        tokio_postgres::connect(&config.connection_string(), tokio_postgres::NoTls)
            .await
            .context("Unable to connect to postgres db")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("connection error: {}", e);
        }
    });
    Ok(client)
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }
    let config = Config::from_env();

    log::info!(
        "Connecting to postgres host={} user={} db={}",
        config.postgres.host,
        config.postgres.user,
        config.postgres.db
    );
    let mut client = connect(&config.postgres).await?;
    horoshop_sync::migrations::runner()
        .run_async(&mut client)
        .await?;
    let client = Arc::new(client);
    // transactions need exclusive access to a connection
    let tx_client = Arc::new(Mutex::new(connect(&config.postgres).await?));

    let job_repository: Arc<dyn JobRepository> =
        Arc::new(PostgresJobRepository::new(client.clone()));
    let log_repository: Arc<dyn LogRepository> =
        Arc::new(PostgresLogRepository::new(client.clone()));
    let supplier_repository: Arc<dyn SupplierRepository> =
        Arc::new(PostgresSupplierRepository::new(client.clone()));
    let source_repository: Arc<dyn SourceRepository> =
        Arc::new(PostgresSourceRepository::new(client.clone()));
    let mapping_repository: Arc<dyn ColumnMappingRepository> =
        Arc::new(PostgresColumnMappingRepository::new(client.clone()));
    let override_repository: Arc<dyn PriceOverrideRepository> =
        Arc::new(PostgresPriceOverrideRepository::new(client.clone()));
    let final_price_repository: Arc<dyn FinalPriceRepository> =
        Arc::new(PostgresFinalPriceRepository::new(client.clone()));
    let preview_store: Arc<dyn PreviewStore> =
        Arc::new(PostgresPreviewStore::new(client.clone(), tx_client.clone()));
    let mirror_store = Arc::new(PostgresMirrorStore::new(client.clone()));

    let http = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .use_rustls_tls()
        .build()?;

    let notifier = TelegramNotifier::from_config(http.clone(), &config.telegram);
    if notifier.is_none() {
        log::info!("Telegram notifications are disabled");
    }
    let journal = Journal::new(
        log_repository.clone(),
        notifier.map(|n| Arc::new(n) as Arc<dyn Notifier>),
    );

    let sheets = SheetImporter::new(
        Arc::new(GoogleSheetsClient::new(http.clone(), &config.sheets)),
        Arc::new(PostgresRawProductRepository::new(client.clone())),
        journal.clone(),
        config.sheets.chunk_size,
    );
    let services = Services {
        importer: Importer::new(
            sheets,
            supplier_repository.clone(),
            source_repository.clone(),
            mapping_repository.clone(),
            journal.clone(),
        ),
        finalizer: Finalizer::new(
            Arc::new(PostgresFinalCatalogStore::new(tx_client.clone())),
            job_repository.clone(),
            journal.clone(),
        ),
        exporter: Exporter::new(
            Arc::new(PostgresFinalCatalogReader::new(client.clone())),
            mirror_store.clone(),
            preview_store.clone(),
            job_repository.clone(),
            journal.clone(),
            config.export_files.clone(),
        ),
        sync: HoroshopSync::new(
            Arc::new(HoroshopClient::new(http.clone(), &config.horoshop)),
            mirror_store,
            preview_store.clone(),
            journal.clone(),
            config.horoshop.clone(),
        ),
        cleaner: Cleaner::new(
            Arc::new(PostgresRetention::new(client.clone())),
            journal.clone(),
            config.retention_days,
        ),
    };

    let tokens = CancelRegistry::default();
    let runner = Runner::new(
        job_repository.clone(),
        journal.clone(),
        Arc::new(services),
        tokens.clone(),
        config.pipeline_sync_mirror,
    );
    let job_service = JobService::new(job_repository, config.job_timeout_minutes).start();
    CancelListener::new(tokens, journal).start();

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async {
        let token = t;
        match signal::ctrl_c().await {
            Ok(_) => token.cancel(),
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });
    let _scheduled = scheduler::start(
        &config.scheduler,
        runner.clone(),
        job_service.clone(),
        token,
    );

    let port = config.http_port;
    log::info!("Listening on 0.0.0.0:{port}");
    HttpServer::new(move || {
        App::new()
            .app_data(control::json_config())
            .app_data(control::query_config())
            .app_data(control::path_config())
            .wrap(
                DefaultHeaders::new()
                    .add(("Access-Control-Allow-Origin", "*"))
                    .add(("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS"))
                    .add(("Access-Control-Allow-Headers", "*")),
            )
            .wrap(actix_web::middleware::Compress::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .app_data(Data::new(runner.clone()))
            .app_data(Data::new(job_service.clone()))
            .app_data(Data::new(log_repository.clone()))
            .app_data(Data::new(supplier_repository.clone()))
            .app_data(Data::new(source_repository.clone()))
            .app_data(Data::new(mapping_repository.clone()))
            .app_data(Data::new(override_repository.clone()))
            .app_data(Data::new(final_price_repository.clone()))
            .app_data(Data::new(preview_store.clone()))
            .service(control::health)
            .service(control::jobs::scope())
            .service(control::admin::scope())
            .default_service(actix_web::web::route().to(control::not_found))
    })
    .bind(("0.0.0.0", port))
    .with_context(|| format!("Failed to bind server to 0.0.0.0:{port}. Is the port already in use?"))?
    .run()
    .await?;
    Ok(())
}
