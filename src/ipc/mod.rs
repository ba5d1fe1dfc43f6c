//! Cross-process message channel.
//!
//! A short-lived client ([`handle::ChannelHandle`]) binds to a long-lived
//! background service ([`endpoint::ChannelEndpoint`]). Each side holds at
//! most one peer and watches it with a [`monitor::PeerDeathMonitor`], so
//! abrupt termination of either process is reported to the survivor.
//!
//! [`local`] and [`service`] provide the namespaced local-socket host
//! used by the shipped binaries; any other host plugs in through the
//! traits in [`transport`].

pub mod channel;
pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod handle;
pub mod local;
pub mod monitor;
pub mod peer;
pub mod service;
pub mod transport;
