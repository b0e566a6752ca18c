mod artifacts;
mod pointer_events;
mod sessions;
mod stats;
mod transcriptions;
