//! Cacher is a library for cache-aside lookups which computes missing values exactly once, even
//! when many callers race for the same key.
//!
//! # Introduction
//! A **cache stampede** happens when a popular entry expires and all callers which miss it
//! start to recompute it at the same time. For expensive computations (think of a slow database
//! query or a remote service call) this multiplies the load exactly when the system can least
//! afford it.
//!
//! **Cacher** wraps a key/value store and a user supplied **fetch function**. A lookup either
//! returns the stored value or invokes the fetch function, stores its result with a given ttl
//! and returns it. Concurrent lookups of the same missing key share a single invocation of the
//! fetch function. Errors are handed to everyone involved but are never cached.
//!
//! # Coordinators
//! * **LockingCacher**: elects the fetcher via an owner verified, self extending lock stored next
//!   to the value. As the only shared state lives in the store, this coordinates several
//!   processes sharing a Redis database. Callers which lose the race poll with an exponential
//!   backoff. See [cacher::locking].
//! * **CoalescingCacher**: attaches all concurrent callers of a key to a single in-flight fetch
//!   within the process. Backed by an in-process expiring table. See [cacher::coalescing].
//!
//! Both implement the [Cacher](cacher::Cacher) trait which also provides **delete**, **clear**,
//! **item_count** and **delete_by_prefix**.
//!
//! # Cancellation
//! Each operation receives a [Context](context::Context) which carries a cancellation signal and
//! an optional deadline. Every store access, backoff pause and wait for a coalesced fetch gives
//! up as soon as the context is done. Locks are still released in that case.
//!
//! # Configuration
//! Timings (lock ttl, wait timeout, backoff) and the limits of the in-process store are read
//! from a reload-aware [Config](config::Config), so that they can be tuned without a restart.
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod backoff;
pub mod cacher;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod fmt;
pub mod lock;
pub mod metrics;
pub mod store;

pub use crate::cacher::{Cacher, CoalescingCacher, LockingCacher};
pub use crate::context::Context;
pub use crate::error::{CacheError, CacheResult, ErrorKind};

/// Initializes the logging system.
///
/// This installs a **SimpleLogger** which writes to stdout. It can safely be called several
/// times, as only the first call has an effect. Applications which already use another logger
/// should skip this, as the library itself only emits messages via the **log** facade.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate cacher;
/// # #[tokio::main]
/// # async fn main() {
/// cacher::spawn!(async move {
///     // perform some work here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
