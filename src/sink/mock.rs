use async_trait::async_trait;
use crate::sink::location_sink::{LocationFix, LocationSink, ProviderSpec, SinkError, SinkResult};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// In-memory sink for tests and dry runs
///
/// Records every provider change and published fix. Failures and slow calls
/// can be injected to exercise the error paths of the playback clock.
pub struct RecordingSink {
    name: String,
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    providers: Vec<String>,
    fixes: Vec<(String, LocationFix)>,
    removed: Vec<String>,
    fail_next: usize,
    deny_providers: bool,
    delay: Option<Duration>,
}

impl RecordingSink {
    /// Create a new recording sink
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(RecordingState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` `set_location` calls fail
    pub fn fail_next(&self, count: usize) {
        self.state().fail_next = count;
    }

    /// Reject provider registration and removal as a permission failure
    pub fn deny_provider_changes(&self, deny: bool) {
        self.state().deny_providers = deny;
    }

    /// Delay every `set_location` call
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Get all published fixes and clear the record
    pub fn take_fixes(&self) -> Vec<LocationFix> {
        self.state().fixes.drain(..).map(|(_, fix)| fix).collect()
    }

    /// Number of fixes published so far
    pub fn fix_count(&self) -> usize {
        self.state().fixes.len()
    }

    /// Currently registered providers
    pub fn providers(&self) -> Vec<String> {
        self.state().providers.clone()
    }

    /// Providers removed so far, in order
    pub fn removed_providers(&self) -> Vec<String> {
        self.state().removed.clone()
    }
}

#[async_trait]
impl LocationSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_provider(&self, spec: &ProviderSpec) -> SinkResult<()> {
        let mut state = self.state();
        if state.deny_providers {
            return Err(SinkError::PermissionDenied("mock locations disabled".into()));
        }
        if !state.providers.contains(&spec.name) {
            state.providers.push(spec.name.clone());
        }
        Ok(())
    }

    async fn remove_provider(&self, name: &str) -> SinkResult<()> {
        let mut state = self.state();
        if state.deny_providers {
            return Err(SinkError::PermissionDenied("mock locations disabled".into()));
        }
        let before = state.providers.len();
        state.providers.retain(|p| p != name);
        if state.providers.len() == before {
            return Err(SinkError::UnknownProvider(name.to_string()));
        }
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn set_location(&self, provider: &str, fix: &LocationFix) -> SinkResult<()> {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Rejected("injected failure".into()));
        }
        if !state.providers.iter().any(|p| p == provider) {
            return Err(SinkError::UnknownProvider(provider.to_string()));
        }
        state.fixes.push((provider.to_string(), fix.clone()));
        Ok(())
    }
}
