pub mod access;
pub mod auth;
pub mod config;
pub mod errors;
pub mod events;
pub mod eviction;
pub mod fanout;
pub mod models;
pub mod operation_pipeline;
pub mod presence;
pub mod rate_limit;
pub mod room_registry;
pub mod routes;
pub mod store;
pub mod tombstone;
pub mod ws;

use config::BrokerConfig;
use events::EventBus;
use rate_limit::RateLimiter;
use rocket_cors::CorsOptions;
use room_registry::RoomRegistry;
use std::sync::Arc;
use std::time::Duration;
use store::SqliteWorkflowStore;
use tracing::info;
use ws::SocketDeps;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let config = BrokerConfig::from_env();
    build_rocket(config)
}

pub fn rocket_with_config(config: BrokerConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(config)
}

fn build_rocket(config: BrokerConfig) -> rocket::Rocket<rocket::Build> {
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let config = Arc::new(config);
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(RoomRegistry::new(Duration::from_secs(config.tombstone_ttl_secs)));
    let rate_limiter = Arc::new(RateLimiter::new());

    let store: Arc<dyn store::WorkflowStore> = Arc::new(
        SqliteWorkflowStore::new(&config.database_path).expect("failed to open workflow store"),
    );
    let access = Arc::from(access::build_resolver(&config).expect("failed to build access resolver"));
    let verifier = Arc::from(auth::build_verifier(&config));

    let deps = Arc::new(SocketDeps {
        registry: registry.clone(),
        events: events.clone(),
        store,
        access,
        verifier,
        rate_limiter,
        config: config.clone(),
    });

    let cors = CorsOptions::default()
        .to_cors()
        .expect("failed to build CORS fairing");

    let sweep_registry = registry.clone();

    rocket::build()
        .manage(registry)
        .manage(events)
        .manage(config)
        .manage(deps)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::too_many_requests, routes::not_found],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::socket,
                routes::permission_changed,
                routes::workflow_deleted,
                routes::workflow_updated,
                routes::workflow_reverted,
                routes::copilot_workflow_edit,
                routes::workspace_resource_changed,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Tombstone Sweep",
            move |_rocket| {
                Box::pin(async move {
                    tombstone::spawn_tombstone_sweep(sweep_registry);
                    info!("tombstone sweep task started");
                })
            },
        ))
}
