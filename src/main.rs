use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use guild_playback::{
    audio::{locks::GuildLocks, player::PlayerManager, queue_manager::QueueManager},
    config::{Config, StorageBackend},
    engine::{protocol::Frame, LavalinkEngine},
    events::EventBus,
    storage::{JsonStorage, MemoryStorage, QueueStore, SettingsStore, StatsStore},
};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_playback=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando guild-playback v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));

    // La lectura de stdin ocupa un hilo bloqueante que no termina solo
    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

type Stores = (
    Arc<dyn QueueStore>,
    Arc<dyn SettingsStore>,
    Arc<dyn StatsStore>,
);

async fn open_storage(config: &Config) -> Result<Stores> {
    let defaults = config.guild_settings();
    let stores: Stores = match config.storage_backend {
        StorageBackend::Json => {
            let storage = Arc::new(
                JsonStorage::new(config.data_dir.clone())
                    .await?
                    .with_default_settings(defaults),
            );
            (storage.clone(), storage.clone(), storage)
        }
        StorageBackend::Memory => {
            warn!("💭 Almacenamiento en memoria: las colas no sobreviven reinicios");
            let storage = Arc::new(MemoryStorage::new().with_default_settings(defaults));
            (storage.clone(), storage.clone(), storage)
        }
    };
    Ok(stores)
}

async fn run(config: Config) -> Result<()> {
    let (queue_store, settings_store, stats_store) = open_storage(&config).await?;

    let bus = Arc::new(EventBus::new());
    let locks = Arc::new(GuildLocks::new());
    let queues = Arc::new(
        QueueManager::new(queue_store, settings_store, bus.clone(), locks)
            .with_expiry(config.queue_expiry),
    );

    // Inicializar Lavalink
    info!("🎼 Inicializando Lavalink...");
    let engine = Arc::new(LavalinkEngine::new(&config.lavalink())?);
    let player = Arc::new(
        PlayerManager::new(engine.clone(), queues.clone(), stats_store)
            .with_reconnect_policy(config.reconnect_policy()),
    );

    let shutdown = CancellationToken::new();

    // Registro de todos los eventos publicados
    let mut events = bus.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&*event) {
                Ok(json) => debug!("📡 {}", json),
                Err(e) => warn!("Evento no serializable: {}", e),
            }
        }
    });

    // Limpieza periódica de colas inactivas
    let cleanup = {
        let queues = queues.clone();
        let token = shutdown.clone();
        let period = config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queues.cleanup_old_queues().await {
                            error!("❌ Error en la limpieza de colas: {}", e);
                        }
                    }
                }
            }
        })
    };

    // Frames del websocket de Lavalink, uno por línea en stdin
    let relay = {
        let engine = engine.clone();
        let player = player.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("📭 Fin de la entrada de eventos");
                        break;
                    }
                    Err(e) => {
                        error!("Error leyendo eventos: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Frame inválido ignorado: {}", e);
                        continue;
                    }
                };
                match engine.handle_frame(frame).await {
                    Ok(Some(event)) => player.dispatch(event),
                    Ok(None) => {}
                    Err(e) => warn!("Evento de Lavalink descartado: {}", e),
                }
            }
        })
    };

    info!("🚀 Coordinador iniciado");

    // Manejar shutdown graceful
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    shutdown.cancel();
    player.shutdown().await;
    let _ = tokio::join!(cleanup, relay);

    info!("👋 Apagado completo");
    Ok(())
}
