//! Implementation of the async runtime integration.

use std::future::Future;
use std::time::Duration;

#[cfg(not(any(feature = "tokio", feature = "smol")))]
compile_error!("either feature `tokio` or `smol` must be enabled");

#[cfg(all(feature = "tokio", feature = "smol"))]
compile_error!("features `tokio` and `smol` are mutually exclusive");

cfg_if::cfg_if! {
    if #[cfg(feature = "tokio")] {
        pub use tokio::task::spawn_blocking;

        /// Helper for difference in `spawn_blocking` signatures.
        pub fn unwrap_task_output<T>(result: Result<T, tokio::task::JoinError>) -> Option<T> {
            result.ok()
        }

        /// Spawns a detached background task.
        pub fn spawn<F>(future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }

        /// Sleeps for the given duration.
        pub async fn sleep(duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    } else if #[cfg(feature = "smol")] {
        pub use smol::unblock as spawn_blocking;

        /// Helper for difference in `spawn_blocking` signatures.
        pub fn unwrap_task_output<T>(result: T) -> Option<T> {
            Some(result)
        }

        /// Spawns a detached background task.
        pub fn spawn<F>(future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            smol::spawn(future).detach();
        }

        /// Sleeps for the given duration.
        pub async fn sleep(duration: Duration) {
            smol::Timer::after(duration).await;
        }
    }
}
