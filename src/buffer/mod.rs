//! Batching between capture producers and the session store.

mod event_buffer;
mod sink;
mod store_writer;

pub use event_buffer::EventBuffer;
pub use sink::{BatchWriter, BufferedSink};
pub use store_writer::StoreWriter;
