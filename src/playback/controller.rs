use crate::config::{ReplayMode, ReplaySettings};
use crate::core::TrackPoint;
use crate::input::{source_for, CollectingListener, InputFormat, SourceError};
use crate::playback::clock::{self, Deliverer};
use crate::playback::events::{PlaybackEvent, PlaybackListener};
use crate::playback::queue::ReplayQueue;
use crate::playback::PlaybackState;
use crate::sink::{LocationSink, ProviderSpec};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long stop/restart waits for a cancelled load to wind down
const LOAD_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Where a track comes from
enum TrackInput {
    Path(PathBuf),
    Reader {
        format: Option<InputFormat>,
        reader: Box<dyn BufRead + Send>,
    },
}

/// Outcome of one ingestion run
struct Ingested {
    points: Vec<TrackPoint>,
    error: Option<String>,
}

struct Task {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Task {
    /// Cancel and wait for the task, aborting it if it does not finish in time
    async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Task did not stop within {:?}, aborting", grace);
            handle.abort();
        }
    }
}

struct LoadTask {
    source_id: String,
    task: Task,
}

#[derive(Default)]
struct Tasks {
    clock: Option<Task>,
    load: Option<LoadTask>,
    provider_registered: bool,
}

/// Playback state machine
///
/// Coordinates loading a track into the [`ReplayQueue`], running the
/// delivery clock and registering the test provider with the sink. Every
/// method can be called from any task; start and stop are serialized.
pub struct PlaybackController {
    queue: Arc<ReplayQueue>,
    sink: Arc<dyn LocationSink>,
    listener: Arc<dyn PlaybackListener>,
    settings: ReplaySettings,
    tasks: Mutex<Tasks>,
}

impl PlaybackController {
    pub fn new(
        settings: ReplaySettings,
        sink: Arc<dyn LocationSink>,
        listener: Arc<dyn PlaybackListener>,
    ) -> Self {
        let settings = settings.sanitized();
        Self {
            queue: Arc::new(ReplayQueue::from_settings(&settings)),
            sink,
            listener,
            settings,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Current playback state
    pub fn state(&self) -> PlaybackState {
        self.queue.playback_state()
    }

    /// Scheduler backing this controller
    pub fn queue(&self) -> &Arc<ReplayQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    /// Start replaying the track file at `path`.
    ///
    /// The file is (re)loaded only when it differs from the loaded one, so
    /// restarting the same file resumes at the current position.
    pub async fn start_service(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let source_id = path.to_string_lossy().into_owned();
        self.start(source_id, TrackInput::Path(path)).await;
    }

    /// Start replaying a stream opened by the caller.
    ///
    /// `source_id` identifies the stream for reload decisions. The format is
    /// sniffed from the content when not given.
    pub async fn start_with_reader(
        &self,
        source_id: &str,
        format: Option<InputFormat>,
        reader: Box<dyn BufRead + Send>,
    ) {
        self.start(source_id.to_string(), TrackInput::Reader { format, reader }).await;
    }

    async fn start(&self, source_id: String, input: TrackInput) {
        let mut tasks = self.tasks.lock().await;

        if let Some(clock) = tasks.clock.take() {
            info!("Restarting playback with '{}'", source_id);
            clock.shutdown(LOAD_CANCEL_GRACE).await;
            self.queue.reset();
        }

        self.set_state(PlaybackState::Running);
        self.register_provider(&mut tasks).await;

        let loading_same = tasks
            .load
            .as_ref()
            .is_some_and(|l| l.source_id == source_id && !l.task.handle.is_finished());

        if loading_same || self.queue.source_id().as_deref() == Some(source_id.as_str()) {
            debug!("'{}' already loaded, keeping position {}", source_id, self.queue.cursor());
        } else {
            if let Some(previous) = tasks.load.take() {
                debug!("Cancelling load of '{}'", previous.source_id);
                previous.task.shutdown(LOAD_CANCEL_GRACE).await;
            }
            // nothing from the previous track is delivered while the new one loads
            self.queue.clear();
            tasks.load = Some(self.spawn_load(source_id, input));
        }

        tasks.clock = Some(self.spawn_clock());
    }

    /// Stop playback.
    ///
    /// Cancels the clock, then any in-flight load, then releases the test
    /// provider. Calling it while already stopped does nothing.
    pub async fn stop_service(&self) {
        let mut tasks = self.tasks.lock().await;

        let active = tasks.clock.is_some()
            || tasks.load.is_some()
            || tasks.provider_registered
            || self.state() == PlaybackState::Running;
        if !active {
            debug!("Playback already stopped");
            return;
        }

        if let Some(clock) = tasks.clock.take() {
            clock.shutdown(LOAD_CANCEL_GRACE).await;
        }
        self.queue.reset();
        self.queue.set_state(PlaybackState::Stopped);

        if let Some(load) = tasks.load.take() {
            if !load.task.handle.is_finished() {
                debug!("Cancelling load of '{}'", load.source_id);
            }
            load.task.shutdown(LOAD_CANCEL_GRACE).await;
        }

        if tasks.provider_registered {
            let name = &self.settings.provider_name;
            match self.sink.remove_provider(name).await {
                Ok(()) => debug!("Released test provider '{}'", name),
                Err(e) => warn!("Could not remove test provider '{}': {}", name, e),
            }
            tasks.provider_registered = false;
        }

        info!("Playback stopped at {}/{}", self.queue.cursor(), self.queue.len());
        self.emit(PlaybackEvent::StatusChange { state: PlaybackState::Stopped });
    }

    /// Jump `minutes` forward (or backward when negative).
    ///
    /// Wraps around while running and clamps while stopped. Does nothing
    /// before a track is loaded.
    pub fn jump(&self, minutes: i64) {
        match self.queue.jump(minutes) {
            Some(percent) => {
                info!("@{}/{}", self.queue.cursor(), self.queue.len());
                self.emit(PlaybackEvent::Progress { percent });
            }
            None => debug!("Ignoring jump of {} min: nothing loaded", minutes),
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        self.listener.on_event(event);
    }

    fn set_state(&self, state: PlaybackState) {
        self.queue.set_state(state);
        self.emit(PlaybackEvent::StatusChange { state });
    }

    /// Replace any stale provider with a fresh one. Failures are not fatal.
    async fn register_provider(&self, tasks: &mut Tasks) {
        if tasks.provider_registered {
            return;
        }

        let name = &self.settings.provider_name;
        if let Err(e) = self.sink.remove_provider(name).await {
            debug!("No stale provider '{}' to remove: {}", name, e);
        }

        match self.sink.add_provider(&ProviderSpec::new(name)).await {
            Ok(()) => tasks.provider_registered = true,
            Err(e) => warn!("Could not register test provider '{}': {}", name, e),
        }
    }

    fn spawn_clock(&self) -> Task {
        let cancel = CancellationToken::new();
        let deliverer = Deliverer::new(self.sink.clone(), self.listener.clone(), &self.settings);
        let queue = self.queue.clone();

        let handle = match self.settings.mode {
            ReplayMode::FixedRate => tokio::spawn(clock::run_fixed_rate(
                queue,
                deliverer,
                self.settings.tick_interval(),
                cancel.clone(),
            )),
            ReplayMode::RealTime => tokio::spawn(clock::run_real_time(
                queue,
                deliverer,
                self.settings.speed,
                cancel.clone(),
            )),
        };

        Task { cancel, handle }
    }

    fn spawn_load(&self, source_id: String, input: TrackInput) -> LoadTask {
        let cancel = CancellationToken::new();
        let queue = self.queue.clone();
        let listener = self.listener.clone();

        info!("Loading '{}'", source_id);
        listener.on_event(PlaybackEvent::LoadStarted { source: source_id.clone() });

        let id = source_id.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let worker_token = token.clone();
            let ingested = match tokio::task::spawn_blocking(move || ingest(input, &worker_token)).await {
                Ok(ingested) => ingested,
                Err(e) => {
                    error!("Load of '{}' panicked: {}", id, e);
                    listener.on_event(PlaybackEvent::Error { message: e.to_string() });
                    return;
                }
            };

            if token.is_cancelled() {
                debug!("Discarding cancelled load of '{}'", id);
                return;
            }

            if let Some(message) = &ingested.error {
                listener.on_event(PlaybackEvent::Error { message: message.clone() });
            }

            let count = ingested.points.len();
            if count == 0 && ingested.error.is_some() {
                queue.clear();
            } else {
                queue.load(&id, ingested.points);
            }
            listener.on_event(PlaybackEvent::LoadFinished { points: count });
        });

        LoadTask {
            source_id,
            task: Task { cancel, handle },
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.try_lock() {
            if let Some(clock) = &tasks.clock {
                clock.cancel.cancel();
            }
            if let Some(load) = &tasks.load {
                load.task.cancel.cancel();
            }
        }
    }
}

/// Parse a whole track on the blocking pool.
///
/// A structural error keeps the points parsed before it.
fn ingest(input: TrackInput, cancel: &CancellationToken) -> Ingested {
    let (path, format, mut reader) = match input {
        TrackInput::Path(path) => match File::open(&path) {
            Ok(file) => {
                let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(file));
                (Some(path), None, reader)
            }
            Err(e) => {
                error!("{:?} could not be opened: {}", path, e);
                return Ingested {
                    points: Vec::new(),
                    error: Some(format!("{} not found: {}", path.display(), e)),
                };
            }
        },
        TrackInput::Reader { format, reader } => (None, format, reader),
    };

    let format = format.unwrap_or_else(|| InputFormat::detect(path.as_deref(), &mut reader));
    let source = source_for(format);
    let mut collector = CollectingListener::default();

    let result: Result<usize, SourceError> = source.parse(&mut reader, &mut collector, cancel);
    let error = match result {
        Ok(count) => {
            debug!("{} parser accepted {} points", source.name(), count);
            collector.error
        }
        Err(e) => Some(collector.error.unwrap_or_else(|| e.to_string())),
    };

    Ingested {
        points: collector.points,
        error,
    }
}
