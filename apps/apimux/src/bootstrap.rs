use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use apimux_cache::MemoryCacheBackend;
use apimux_common::{
    DispatchSettings, GlobalConfig, GlobalConfigPatch, PriorityMode, SchedulingMode,
};
use apimux_dispatch::{
    AdaptiveService, CandidateService, ErrorClassifier, FailoverEngine, KeyStateStore,
    RequestExecutor, RuntimeState, TaskService,
};
use apimux_ratelimit::{AdaptiveRpmManager, ReservationManager, RpmCounter, RpmTuning};
use apimux_scheduling::{CacheAffinityManager, ConcurrencyChecker, HealthMonitor};
use apimux_storage::{SeaOrmStorage, Storage};

use crate::cli::CliArgs;
use crate::dsn::resolve_dsn;
use crate::plugins::register_builtin;

pub(crate) struct App {
    pub global: GlobalConfig,
    pub state: RuntimeState,
    pub candidates: Arc<CandidateService>,
    pub tasks: Arc<TaskService>,
}

pub(crate) async fn bootstrap(args: CliArgs) -> anyhow::Result<App> {
    let dsn = resolve_dsn(&args.dsn, &args.data_dir).context("resolve database dsn")?;

    // 1) Connect and sync schema from entities.
    let storage = Arc::new(
        SeaOrmStorage::connect(&dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // 2) Merge global config: CLI > ENV > DB (clap already folds CLI > ENV),
    // then persist the merged result back.
    let db_row = storage
        .load_global_config()
        .await
        .context("load global config")?;
    let mut merged = db_row
        .as_ref()
        .map(|row| GlobalConfigPatch::from(row.config.clone()))
        .unwrap_or_default();
    let mut dispatch = db_row.map(|row| row.dispatch).unwrap_or_default();

    let mut admin_key_hash_override = None;
    if let Some(plain) = args.admin_key.as_deref() {
        admin_key_hash_override = Some(hash_admin_key(plain));
    } else if merged.admin_key_hash.is_none() {
        let plain = generate_admin_key();
        eprintln!("generated admin key: {plain}");
        admin_key_hash_override = Some(hash_admin_key(&plain));
    }

    merged.overlay(GlobalConfigPatch {
        host: args.host.clone(),
        port: args.port,
        admin_key_hash: admin_key_hash_override,
        proxy: args.proxy.clone(),
        dsn: Some(dsn),
    });
    let global = merged.into_config().context("finalize global config")?;

    apply_dispatch_overrides(&mut dispatch, &args);
    storage
        .upsert_global_config(&global, &dispatch)
        .await
        .context("persist global config")?;

    // 3) Load the runtime snapshot; all dispatch reads come from memory.
    let snapshot = storage.load_snapshot().await.context("load snapshot")?;
    info!(
        providers = snapshot.providers.len(),
        endpoints = snapshot.endpoints.len(),
        keys = snapshot.keys.len(),
        models = snapshot.models.len(),
        "snapshot loaded"
    );

    // 4) Registries from the explicit plugin list.
    let registries = register_builtin();
    info!(adapters = registries.adapters.len(), "provider plugins registered");
    let adapters = Arc::new(registries.adapters);
    let conversions = Arc::new(registries.conversions);

    // 5) Wire the dispatch stack.
    let cache = Arc::new(MemoryCacheBackend::new());
    let affinity = Arc::new(CacheAffinityManager::new(cache.clone()));

    let key_store = KeyStateStore::new(storage.clone() as Arc<dyn Storage>);
    key_store.load_snapshot(&snapshot).await;
    let adaptive = Arc::new(AdaptiveService::new(
        AdaptiveRpmManager::new(RpmTuning::default()),
        key_store,
    ));

    let state = RuntimeState::new(snapshot, dispatch);
    let candidates = Arc::new(CandidateService::new(
        state.clone(),
        conversions,
        Some(adapters),
        affinity.clone(),
    ));
    let checker = Arc::new(ConcurrencyChecker::new(
        RpmCounter::new(cache.clone()),
        AdaptiveRpmManager::new(RpmTuning::default()),
        ReservationManager::default(),
    ));
    let executor = Arc::new(RequestExecutor::new(
        checker,
        Arc::new(HealthMonitor::new()),
        adaptive,
    ));
    let tasks = Arc::new(TaskService::new(
        candidates.clone(),
        executor,
        FailoverEngine::new(ErrorClassifier::new()),
        storage.clone() as Arc<dyn Storage>,
        state.clone(),
    ));

    Ok(App {
        global,
        state,
        candidates,
        tasks,
    })
}

fn apply_dispatch_overrides(dispatch: &mut DispatchSettings, args: &CliArgs) {
    if let Some(raw) = args.priority_mode.as_deref() {
        match PriorityMode::parse_lenient(raw) {
            Ok(mode) => dispatch.priority_mode = mode,
            Err(bad) => warn!(value = %bad, "invalid priority mode, keeping current"),
        }
    }
    if let Some(raw) = args.scheduling_mode.as_deref() {
        match SchedulingMode::parse_lenient(raw) {
            Ok(mode) => dispatch.scheduling_mode = mode,
            Err(bad) => warn!(value = %bad, "invalid scheduling mode, keeping current"),
        }
    }
    if let Some(enabled) = args.conversion_enabled {
        dispatch.conversion_enabled = enabled;
    }
    if let Some(keep) = args.keep_priority_on_conversion {
        dispatch.keep_priority_on_conversion = keep;
    }
}

fn hash_admin_key(plain: &str) -> String {
    let digest = Sha256::digest(plain.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_admin_key() -> String {
    let raw: [u8; 24] = rand::random();
    raw.iter().map(|b| format!("{b:02x}")).collect()
}
