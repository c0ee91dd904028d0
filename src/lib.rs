//! A single-producer single-consumer queue for transferring variable-sized
//! entries between tasks.
//!
//! This crate provides [`TransferQueue`], a handoff queue that limits its
//! contents by the estimated memory footprint of the buffered entries instead
//! of their count. The limit is a soft limit: making progress is preferred
//! over keeping the limit, so a push into an empty queue always succeeds,
//! regardless of the entry's size.
//!
//! Entry sizes are reported through the [`datasize::DataSize`] trait, which
//! can be derived for most types. All suspending operations take a
//! [`tokio_util::sync::CancellationToken`]; cancelling it wakes any waiter
//! and completes the operation without performing its effect.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use transfer_queue::TransferQueue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = Arc::new(TransferQueue::new(64 * 1024));
//! let cancel = CancellationToken::new();
//!
//! queue.push("hello".to_string(), &cancel).await;
//! assert_eq!(queue.pop_one(&cancel).await, Some("hello".to_string()));
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/transfer-queue/0.1.0")]
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

mod queue;

pub use queue::TransferQueue;
