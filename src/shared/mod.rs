pub mod fs_atomic;
pub mod ids;

use chrono::{SecondsFormat, Utc};

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
