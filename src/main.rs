use actix_web::{web, App, HttpServer};
use anyhow::Context;
use log::info;
use std::sync::Arc;
use verdant::{
    clock::SystemClock,
    config::{ConfigStore, FileConfigStore},
    controllers::lcd::I2cDisplays,
    daemon::{Daemon, DaemonParts},
    gpio::SysfsGpio,
    notify::{CommandCamera, SendmailMailer},
    rpc,
    store::FileStore,
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config_store = Arc::new(FileConfigStore::from_env());
    let config = config_store
        .load()
        .with_context(|| format!("could not load {}", config_store.path().display()))?;
    info!("Configuration loaded from {}", config_store.path().display());

    let daemon = Daemon::new(DaemonParts {
        config_store: config_store.clone(),
        gpio: Arc::new(SysfsGpio),
        store: Arc::new(FileStore::new(config.misc.store_dir.clone())),
        clock: Arc::new(SystemClock),
        mailer: Arc::new(SendmailMailer::new(config.smtp.clone())),
        camera: Arc::new(CommandCamera::new(config.camera.clone())),
        displays: Arc::new(I2cDisplays),
        synchronous_store: false,
    })?;
    daemon.start()?;

    let data = web::Data::from(daemon.clone());
    info!("Listening on {}", config.misc.rpc_bind);
    let served = HttpServer::new(move || App::new().app_data(data.clone()).configure(rpc::routes))
        .bind(&config.misc.rpc_bind)
        .with_context(|| format!("could not bind {}", config.misc.rpc_bind));
    let result = match served {
        Ok(server) => server.run().await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };

    daemon.shutdown();
    result
}
