use std::time::Duration;

/// Whether to follow a zero-selection wake with a non-blocking poll.
///
/// Some multiplexers (historically Windows' `select`-based backend) can
/// lose an edge between the blocking wait returning zero and the next
/// wait being armed. `Always` forces a non-blocking drain poll after every
/// zero-selection wake to recover from that; `Never` skips it; `Auto`
/// picks based on the host OS the same way the reference implementation
/// does (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollOnZeroSelect {
    #[default]
    Auto,
    Always,
    Never,
}

impl PollOnZeroSelect {
    pub(crate) fn resolve(self) -> bool {
        match self {
            PollOnZeroSelect::Always => true,
            PollOnZeroSelect::Never => false,
            PollOnZeroSelect::Auto => std::env::consts::OS.contains("windows"),
        }
    }
}

/// Construction-time configuration for a single [`ManagedSelector`].
///
/// [`ManagedSelector`]: crate::ManagedSelector
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Small integer identifying this selector instance in logs and in the
    /// name of its producer thread (`"selector-{id}"`).
    pub id: usize,
    pub poll_on_zero_select: PollOnZeroSelect,
    /// Upper bound `dump` waits for the loop to produce a coherent snapshot
    /// (spec §4.7: 5 seconds).
    pub dump_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            id: 0,
            poll_on_zero_select: PollOnZeroSelect::Auto,
            dump_timeout: Duration::from_secs(5),
        }
    }
}

impl SelectorConfig {
    pub fn with_id(id: usize) -> Self {
        SelectorConfig {
            id,
            ..Default::default()
        }
    }
}
