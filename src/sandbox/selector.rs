use std::sync::Arc;

use crate::config::{BackendKind, SandboxSettings};
use crate::core::{errors::SandboxError, registry::RuntimeRegistry, traits::sandbox::Sandbox};
use crate::sandbox::{container::ContainerSandbox, local::LocalProcessSandbox};

/// Picks the sandbox backend once at startup.
pub struct SandboxSelector;

impl SandboxSelector {
    pub async fn select(
        settings: &SandboxSettings,
        registry: Arc<RuntimeRegistry>,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        match settings.backend {
            BackendKind::Local => Ok(Arc::new(Self::local(settings, registry).await)),
            BackendKind::Container => {
                ContainerSandbox::probe(&settings.container_binary, settings.probe_timeout())
                    .await?;
                tracing::info!("Using container sandbox ({})", settings.container_binary);
                Ok(Arc::new(Self::container(settings, registry)))
            }
            BackendKind::Auto => {
                match ContainerSandbox::probe(&settings.container_binary, settings.probe_timeout())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("Using container sandbox ({})", settings.container_binary);
                        Ok(Arc::new(Self::container(settings, registry)))
                    }
                    Err(err) => {
                        tracing::warn!("{}, falling back to local process sandbox", err);
                        Ok(Arc::new(Self::local(settings, registry).await))
                    }
                }
            }
        }
    }

    fn container(settings: &SandboxSettings, registry: Arc<RuntimeRegistry>) -> ContainerSandbox {
        ContainerSandbox::new(
            registry,
            &settings.scratch_dir,
            &settings.container_binary,
            settings.output_limit_bytes,
            settings.compile_timeout(),
        )
    }

    async fn local(settings: &SandboxSettings, registry: Arc<RuntimeRegistry>) -> LocalProcessSandbox {
        let isolate_network =
            settings.isolate_network && LocalProcessSandbox::probe_network_isolation().await;
        if settings.isolate_network && !isolate_network {
            tracing::warn!("Network namespaces unavailable, local sandbox keeps host networking");
        }
        tracing::info!("Using local process sandbox (network isolation: {})", isolate_network);

        LocalProcessSandbox::new(
            registry,
            &settings.scratch_dir,
            settings.output_limit_bytes,
            settings.compile_timeout(),
        )
        .with_network_isolation(isolate_network)
    }
}
