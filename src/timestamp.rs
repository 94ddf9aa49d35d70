//! ISO-8601 timestamps for `dump` output (spec §8, S6: "both labelled with
//! ISO-8601 timestamps").

use chrono::Local;

pub(crate) fn now_iso8601() -> String {
    Local::now().to_rfc3339()
}
