pub mod collect;
pub mod query;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use oradash_core::{
    Backend, ConfigResolver, ConnectionConfig, FileTargetStore, MemoryTargetStore, OradashConfig,
    TargetStore, select_backend,
};
use serde::Serialize;

/// Everything a command needs, built once per process.
pub struct Context {
    pub config: OradashConfig,
    pub backend: Arc<dyn Backend>,
    pub resolver: ConfigResolver,
}

impl Context {
    pub fn load(path: &Path, force_mock: bool) -> anyhow::Result<Self> {
        Self::load_with(path, force_mock, |name| std::env::var(name).ok())
    }

    /// `load` with the environment read through `env`.
    fn load_with(
        path: &Path,
        force_mock: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let (mut config, store) = if path.exists() {
            let config = OradashConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            let store: Arc<dyn TargetStore> = Arc::new(FileTargetStore::new(path));
            (config, store)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            let store: Arc<dyn TargetStore> = Arc::new(MemoryTargetStore::default());
            (OradashConfig::default(), store)
        };

        config.runtime.apply_vars(env);
        if force_mock {
            config.runtime.mock = true;
        }

        Ok(Self {
            backend: select_backend(&config),
            resolver: ConfigResolver::new(store),
            config,
        })
    }

    pub async fn target(&self, id: &str) -> anyhow::Result<ConnectionConfig> {
        self.resolver
            .resolve(id)
            .await
            .with_context(|| format!("resolving target {id}"))
    }

    pub async fn shutdown(&self) {
        let failed = self.backend.close_pools().await;
        if failed > 0 {
            tracing::warn!(failed, "some pools did not close cleanly");
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct TargetSummary<'a> {
    id: &'a str,
    host: &'a str,
    port: u16,
    service: &'a str,
    username: &'a str,
    privilege: String,
}

pub fn targets(ctx: &Context) -> anyhow::Result<()> {
    let summaries: Vec<TargetSummary<'_>> = ctx
        .config
        .targets
        .iter()
        .map(|t| TargetSummary {
            id: &t.id,
            host: &t.host,
            port: t.port,
            service: &t.service,
            username: &t.username,
            privilege: t.privilege.to_string(),
        })
        .collect();
    print_json(&summaries)
}

pub async fn health(ctx: &Context, target: &str) -> anyhow::Result<()> {
    let config = ctx.target(target).await?;
    let result = ctx.backend.health_check(&config).await;
    print_json(&result)?;
    if !result.is_healthy {
        anyhow::bail!("target {target} is unhealthy");
    }
    Ok(())
}
