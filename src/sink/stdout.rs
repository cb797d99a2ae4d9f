use async_trait::async_trait;
use crate::sink::location_sink::{LocationFix, LocationSink, ProviderSpec, SinkError, SinkResult};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;
use tracing::info;

/// Sink that prints every fix to stdout as one JSON object per line
pub struct StdoutSink {
    providers: Mutex<HashSet<String>>,
}

#[derive(Serialize)]
struct FixLine<'a> {
    provider: &'a str,
    #[serde(flatten)]
    fix: &'a LocationFix,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashSet::new()),
        }
    }

    fn has_provider(&self, name: &str) -> bool {
        self.providers
            .lock()
            .map(|p| p.contains(name))
            .unwrap_or(false)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn add_provider(&self, spec: &ProviderSpec) -> SinkResult<()> {
        info!("Registering test provider '{}'", spec.name);
        self.providers
            .lock()
            .map_err(|e| SinkError::Rejected(e.to_string()))?
            .insert(spec.name.clone());
        Ok(())
    }

    async fn remove_provider(&self, name: &str) -> SinkResult<()> {
        let removed = self
            .providers
            .lock()
            .map_err(|e| SinkError::Rejected(e.to_string()))?
            .remove(name);

        if !removed {
            return Err(SinkError::UnknownProvider(name.to_string()));
        }
        info!("Removed test provider '{}'", name);
        Ok(())
    }

    async fn set_location(&self, provider: &str, fix: &LocationFix) -> SinkResult<()> {
        if !self.has_provider(provider) {
            return Err(SinkError::UnknownProvider(provider.to_string()));
        }

        let line = serde_json::to_string(&FixLine { provider, fix })
            .map_err(|e| SinkError::Rejected(e.to_string()))?;

        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line).map_err(|e| SinkError::Rejected(e.to_string()))?;
        out.flush().map_err(|e| SinkError::Rejected(e.to_string()))
    }
}
