// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

// Supports making the logging operations a true runtime no-op. Since we're
// a library, we can't rely on the consumer configuring a logging level.

#[cfg(feature = "logger")]
pub use log::{debug, error, info, trace, warn};

#[cfg(not(feature = "logger"))]
pub use noop_logger::{debug, error, info, trace, warn};

#[cfg(not(feature = "logger"))]
mod noop_logger {
    /// A noop logger, when the logger feature is disabled
    #[macro_export]
    macro_rules! hashwood_noop {
        ($($arg:tt)+) => {};
    }

    pub use hashwood_noop as debug;
    pub use hashwood_noop as error;
    pub use hashwood_noop as info;
    pub use hashwood_noop as trace;
    pub use hashwood_noop as warn;
}
