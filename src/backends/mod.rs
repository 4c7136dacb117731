//! Transport implementations
//!
//! Two concrete transports implement the [`Connection`](crate::Connection)
//! trait: [`local::LocalConnection`] shells out to the OS process API
//! directly, and [`ssh::SshConnection`] multiplexes exec channels over an
//! OpenSSH control master. Both surface the same wire contract, a child
//! process with three byte streams and an integer exit status, so the
//! process state machine and communication loop never distinguish them.

pub mod local;

#[cfg(feature = "ssh")]
pub mod ssh;
