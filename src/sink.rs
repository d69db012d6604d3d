use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::peer::RemoteTrack;

/// A running playback; stopping it releases the output.
pub trait PlaybackHandle: Send {
    fn stop(&mut self);
}

/// Platform speaker.
pub trait AudioOutput: Send + Sync {
    fn start(&self, track: RemoteTrack) -> Result<Box<dyn PlaybackHandle>>;
}

/// Plays at most one remote track at a time.
pub struct RemoteAudioSink {
    output: Arc<dyn AudioOutput>,
    active: Option<(String, Box<dyn PlaybackHandle>)>,
}

impl RemoteAudioSink {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            active: None,
        }
    }

    /// Replaces whatever is playing. Playback errors are logged, never fatal
    /// to the session.
    pub fn play(&mut self, track: RemoteTrack) {
        self.stop();
        let id = track.id.clone();
        match self.output.start(track) {
            Ok(handle) => {
                tracing::info!("Playing remote track {id}");
                self.active = Some((id, handle));
            }
            Err(e) => {
                tracing::warn!("Remote audio playback failed for {id}: {e:#}");
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some((id, mut handle)) = self.active.take() {
            handle.stop();
            tracing::debug!("Stopped remote track {id}");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_track_id(&self) -> Option<&str> {
        self.active.as_ref().map(|(id, _)| id.as_str())
    }
}

impl Drop for RemoteAudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Headless output ──

/// Consumes remote audio without a device, keeping the decoder flowing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainOutput;

struct DrainHandle {
    task: Option<JoinHandle<()>>,
}

impl PlaybackHandle for DrainHandle {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DrainHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioOutput for DrainOutput {
    fn start(&self, track: RemoteTrack) -> Result<Box<dyn PlaybackHandle>> {
        let task = tokio::spawn(async move {
            let mut frames = 0u64;
            while track.frames.recv_async().await.is_ok() {
                frames += 1;
            }
            tracing::debug!("Remote track {} drained after {frames} frames", track.id);
        });
        Ok(Box::new(DrainHandle { task: Some(task) }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    struct RecordedHandle {
        id: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PlaybackHandle for RecordedHandle {
        fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.id));
        }
    }

    impl AudioOutput for Recorder {
        fn start(&self, track: RemoteTrack) -> Result<Box<dyn PlaybackHandle>> {
            if self.fail {
                anyhow::bail!("no output device");
            }
            self.log.lock().unwrap().push(format!("start {}", track.id));
            Ok(Box::new(RecordedHandle {
                id: track.id,
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn track(id: &str) -> RemoteTrack {
        let (_tx, rx) = flume::unbounded();
        RemoteTrack {
            id: id.to_string(),
            frames: rx,
        }
    }

    #[test]
    fn new_track_replaces_previous_one() {
        let recorder = Recorder::default();
        let log = Arc::clone(&recorder.log);
        let mut sink = RemoteAudioSink::new(Arc::new(recorder));

        sink.play(track("a"));
        sink.play(track("b"));
        assert_eq!(sink.active_track_id(), Some("b"));
        assert_eq!(*log.lock().unwrap(), vec!["start a", "stop a", "start b"]);
    }

    #[test]
    fn stop_is_repeatable() {
        let recorder = Recorder::default();
        let log = Arc::clone(&recorder.log);
        let mut sink = RemoteAudioSink::new(Arc::new(recorder));

        sink.play(track("a"));
        sink.stop();
        sink.stop();
        assert!(!sink.is_playing());
        assert_eq!(*log.lock().unwrap(), vec!["start a", "stop a"]);
    }

    #[test]
    fn playback_failure_is_swallowed() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut sink = RemoteAudioSink::new(Arc::new(recorder));
        sink.play(track("a"));
        assert!(!sink.is_playing());
    }

    #[tokio::test]
    async fn drain_output_stops_on_request() {
        let (tx, rx) = flume::unbounded();
        let mut handle = DrainOutput
            .start(RemoteTrack {
                id: "r".into(),
                frames: rx,
            })
            .unwrap();
        handle.stop();
        handle.stop();
        drop(tx);
    }
}
