pub mod config;

use uuid::{NoContext, Timestamp, Uuid};

/// Generate a UUIDv7 session identifier (time-ordered, for log correlation).
pub fn session_id() -> String {
    let ts = Timestamp::now(NoContext);
    Uuid::new_v7(ts).to_string()
}
