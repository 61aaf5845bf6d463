// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Some entry points block the calling thread until the dedicated communication resource has
//! finished a unit of work. Calling them on the dedicated thread itself would wait for work that
//! can never run, so the dedicated thread is flagged and those entry points refuse to run there.

use std::cell::Cell;

/// Flags the current thread as the dedicated communication thread.
pub fn flag_current_thread() {
    IS_COMM_THREAD.with(|x| {
        x.set(true);
    });
}

pub fn is_flagged() -> bool {
    IS_COMM_THREAD.with(Cell::get)
}

pub fn assert_not_flagged(api: &str) {
    assert!(
        !is_flagged(),
        "{api} blocks until the communication thread makes progress and must not be called from the communication thread itself"
    );
}

thread_local! {
    static IS_COMM_THREAD: Cell<bool> = const { Cell::new(false) };
}
