#![doc = include_str!("../README.md")]

mod cancel;
mod error;
mod listener;
mod pool;
mod priority;
mod queue;
mod task;
mod worker;

pub use crate::{
    cancel::CancellationToken,
    error::{Error, Result, TaskFailure},
    listener::Listener,
    pool::{Builder, WorkerPool},
    priority::Priority,
    worker::{Termination, WorkerState},
};
