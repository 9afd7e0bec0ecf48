//! # gridlink-master
//!
//! The master (client) side of the Gridlink DNP3 stack: decoding response
//! fragments into measurement batches, building poll/control requests, and
//! the dependency-ordered task scheduler that sequences startup, integrity
//! polls, class scans, time sync, and commands.
//!
//! ## Crate structure
//!
//! - [`loader`] — Response loader: object headers → measurement batches, CTO
//! - [`requests`] — Request fragment builders for every master task
//! - [`scheduler`] — Slab-backed task group with priorities and dependencies
//! - [`schedule`] — The concrete master schedule: startup chain, polls,
//!   continuous tasks

pub mod loader;
pub mod requests;
pub mod schedule;
pub mod scheduler;
