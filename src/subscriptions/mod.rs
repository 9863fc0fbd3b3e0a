//! Claiming subscriptions over a topic.
//!
//! A [`Subscription`] tails a log for pending records of one topic and claims
//! each one with a conditional `Pending -> Processed` update before handing it
//! out. Subscriptions:
//! - never deliver a record another subscription has claimed
//! - deliver records in strictly increasing sequence order
//! - reopen their tail cursor transparently when it dies
//!
//! # Example
//!
//! ```ignore
//! let mut sub = transport.subscribe("orders")?;
//!
//! loop {
//!     match sub.recv_timeout(Duration::from_secs(1)) {
//!         Ok(Some(msg)) => println!("claimed {:?}", msg.sequence),
//!         Ok(None) => continue,
//!         Err(e) => break,
//!     }
//! }
//! ```

mod config;
mod cursor;
mod handle;

pub use config::{EmptyLogPolicy, StartFrom, SubscriptionConfig};
pub use cursor::Subscription;
pub use handle::SubscriptionHandle;
