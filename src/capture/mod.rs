//! Client-side capture: media sources, the segmented capture controller,
//! and the speech trigger listener.

pub mod controller;
pub mod file_source;
pub mod listener;
pub mod recorder;

pub use controller::{drive, CaptureController, TriggerOrigin, TriggerOutcome};
pub use file_source::FileMediaSource;
pub use listener::{
    ListenerEvent, ListenerHandle, ListenerStartError, ListenerState, RecognizerEvent,
    ScriptedRecognizer, SpeechRecognizer, TriggerListener, WordMatcher,
};
pub use recorder::{
    open_with_fallback, AudioRouting, Capability, DeviceError, MediaSource, MediaStream,
    RecordedBlob, Recorder, SimulatedSource, StreamGuard, StreamProfile,
};
