//! IPC bridge for herd primary-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the primary coordinator and its worker subprocesses.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerMessage/Intent, Reply) and validation
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
