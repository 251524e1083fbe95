//! [`Config`]: the completion queue's builder.
//!
//! No external configuration crate is pulled in — `mio` has none, and a
//! plain builder struct is the closest analogue to `compio`'s
//! `ProactorBuilder`. Every field is optional; [`Config::default`] yields
//! "best available backend, backend-chosen capacities, a generous
//! per-handle waiter limit".

/// Which driver backend to force. Default (`Auto`) picks the best one
/// available on the host platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverChoice {
    /// `io_uring` on Linux, IOCP on Windows, kqueue/epoll otherwise.
    #[default]
    Auto,
    /// Force the readiness-based (epoll/kqueue) adapter, even on a
    /// platform with a native completion facility. The runtime counterpart
    /// of building with `RUSTFLAGS=--cfg completion_rt_force_readiness`
    /// (see `driver::create_best`), which forces the same thing at compile
    /// time, mirroring the teacher's own `mio_unsupported_force_poll_poll`
    /// escape hatch.
    Readiness,
}

/// Builder for the values the completion queue and poll loop need at
/// construction time. Every setter takes `self` by value and returns
/// `Self`, `mio`'s `PollOpt`-adjacent style of small config structs.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) driver: DriverChoice,
    pub(crate) max_submissions: Option<usize>,
    pub(crate) max_completions: Option<usize>,
    pub(crate) handle_waiters_limit: usize,
}

/// Default capacity of a handle's bounded waiter queue.
pub const DEFAULT_HANDLE_WAITERS_LIMIT: usize = 64;

impl Config {
    /// A config with every knob at its default.
    pub fn new() -> Config {
        Config {
            driver: DriverChoice::Auto,
            max_submissions: None,
            max_completions: None,
            handle_waiters_limit: DEFAULT_HANDLE_WAITERS_LIMIT,
        }
    }

    /// Force a specific backend instead of auto-selecting.
    pub fn driver(mut self, driver: DriverChoice) -> Config {
        self.driver = driver;
        self
    }

    /// Override the backend's default submission-buffer capacity. The
    /// backend may still clamp this to what it actually supports.
    pub fn max_submissions(mut self, n: usize) -> Config {
        self.max_submissions = Some(n);
        self
    }

    /// Override the backend's default completion-buffer capacity.
    pub fn max_completions(mut self, n: usize) -> Config {
        self.max_completions = Some(n);
        self
    }

    /// Per-handle capacity for the bounded waiter queue; applies to
    /// every [`crate::handle_pool::HandlePool`] created against this config.
    pub fn handle_waiters_limit(mut self, n: usize) -> Config {
        self.handle_waiters_limit = n;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
