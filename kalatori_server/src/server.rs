use std::{collections::HashMap, sync::Arc, time::Duration};

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, App, HttpServer};
use kalatori_engine::{
    derivation::AccountDeriver,
    ChainClient,
    HealthBoard,
    HttpChainClient,
    OrderStore,
    ReconciliationEngine,
    SqliteDatabase,
    WatcherSet,
};
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServerConfig, ServerOptions},
    errors::ServerError,
    integrations::callback::{create_callback_handlers, CallbackNotifier},
    maintenance_worker::start_maintenance_worker,
    routes::{health, ForceWithdrawalRoute, OrderRoute, StatusRoute},
};

/// Brings up the whole gateway and runs it until the HTTP server is stopped (SIGINT / SIGTERM).
///
/// Startup order matters: the engine recovers interrupted withdrawals and rebuilds its account index before any chain
/// watcher starts delivering transfers. On shutdown, the watchers are stopped first and the dispatcher drains the
/// transfers that are already in flight.
pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let (registry, recipients) = config.load_registry()?;
    let deriver = AccountDeriver::new(config.seed.clone())
        .map_err(|e| ServerError::ConfigurationError(format!("KALATORI_SEED is not usable. {e}")))?;
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    db.migrate().await.map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let mut clients = HashMap::new();
    for (endpoint, currencies) in registry.endpoints() {
        let symbols = currencies.iter().map(|c| c.symbol.as_str()).collect::<Vec<_>>().join(", ");
        info!("🪛️ {endpoint} serves {symbols}");
        let client = HttpChainClient::new(&endpoint).map_err(|e| ServerError::InitializeError(e.to_string()))?;
        clients.insert(endpoint, Arc::new(client));
    }
    let options = ServerOptions::from_config(&config);
    let notifier = CallbackNotifier::new(registry.clone(), options.server_info.clone())?;
    let handlers = create_callback_handlers(notifier);
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let engine =
        ReconciliationEngine::new(db, registry, recipients, deriver, clients, config.engine_config(), producers);
    engine.recover().await.map_err(|e| ServerError::InitializeError(format!("Startup recovery failed. {e}")))?;

    let shutdown = CancellationToken::new();
    let watchers = WatcherSet::start(&engine, shutdown.clone());
    let worker = start_maintenance_worker(engine.clone(), config.maintenance_interval, shutdown.clone());
    info!("🚀️ Kalatori instance {} is ready", options.server_info.instance_id);
    let srv = create_server_instance(&config, engine, watchers.health.clone(), options)?;
    let result = srv.await;

    info!("🚀️ Shutting down. Waiting for chain watchers and in-flight transfers");
    shutdown.cancel();
    watchers.join().await;
    if let Err(e) = worker.await {
        warn!("🕰️ The maintenance worker ended abnormally. {e}");
    }
    result.map_err(|e| ServerError::Unspecified(e.to_string()))
}

pub fn create_server_instance<B, C>(
    config: &ServerConfig,
    engine: ReconciliationEngine<B, C>,
    health_board: HealthBoard,
    options: ServerOptions,
) -> Result<Server, ServerError>
where
    B: OrderStore,
    C: ChainClient,
{
    let srv = HttpServer::new(move || {
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %r").log_target("kalatori::access_log"))
            .app_data(web::Data::new(engine.clone()))
            .app_data(web::Data::new(options.clone()))
            .app_data(web::Data::new(health_board.clone()))
            .configure(configure_routes::<B, C>)
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((config.host.as_str(), config.port))?
    .run();
    Ok(srv)
}

pub fn configure_routes<B, C>(cfg: &mut web::ServiceConfig)
where
    B: OrderStore,
    C: ChainClient,
{
    cfg.service(health)
        .service(StatusRoute::<B, C>::new())
        .service(ForceWithdrawalRoute::<B, C>::new())
        .service(OrderRoute::<B, C>::new());
}
