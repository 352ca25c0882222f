// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Panic hook that reports panics through `tracing`.

use std::{panic, sync::LazyLock};

use backtrace::Backtrace;
use prometheus::{IntCounter, register_int_counter};

pub static PANIC_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("burrow_panics_total", "Panics caught by the burrow panic hook")
        .unwrap()
});

/// Log every panic as an `error` event with its location and backtrace, count
/// it, then hand it to the previously installed hook.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let backtrace = format!("{:?}", Backtrace::new());
        match info.location() {
            Some(location) => tracing::error!(
                message = %info,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            ),
            None => tracing::error!(message = %info, backtrace = %backtrace),
        }
        PANIC_COUNTER.inc();
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panics_are_counted() {
        set_panic_hook();
        let before = PANIC_COUNTER.get();
        let result = std::thread::spawn(|| panic!("boom")).join();
        assert!(result.is_err());
        assert_eq!(PANIC_COUNTER.get(), before + 1);
    }
}
