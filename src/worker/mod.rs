//! Worker process bodies
//!
//! Each supervised role runs one of these loops:
//! - `Listener`: claims crawl jobs and runs a coordinator per job
//! - `ExtractorWorker`: consumes `page_fetched` events
//! - the monitor loop lives in `health::monitor`
//!
//! Every worker writes heartbeats and stops on the same shutdown token.

mod extractor;
mod heartbeat;
mod listener;
mod shutdown;

pub use extractor::{
    ExtractError, ExtractedRecord, ExtractorWorker, PageExtractor, PageOutcome, TitleExtractor,
};
pub use heartbeat::spawn_heartbeat;
pub use listener::{handle_delivery, Delivery, Listener};
pub use shutdown::shutdown_token;
