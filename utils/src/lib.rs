// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use std::panic;

/// Creates the channel used to broadcast a shutdown request to all server
/// tasks. A panic anywhere in the process also raises SIGINT so that the
/// signal handler can drive an orderly teardown.
pub fn make_signal_channel() -> (async_channel::Sender<()>, async_channel::Receiver<()>) {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
    }));
    async_channel::bounded(1)
}
